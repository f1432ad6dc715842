use crate::admin::AdminClient;
use crate::config::Config;
use crate::error::{Error, Result};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Log message Caddy emits once its admin endpoint serves the initial config
pub const READY_MESSAGE: &str = "serving initial configuration";

/// Interval between port probes while a dev server starts
const PORT_POLL_INTERVAL_MS: u64 = 100;

/// How a startup wait ended
enum Startup {
    Ready,
    Exited(ExitStatus),
}

/// A Caddy process started by this tool
pub struct CaddyProcess {
    child: Child,
    /// Forwards Caddy's JSON log lines to tracing
    log_task: JoinHandle<()>,
}

impl CaddyProcess {
    /// Start Caddy unless its admin API already answers.
    ///
    /// Returns `None` when an existing server is reused. Otherwise the child is
    /// returned once it logged [`READY_MESSAGE`].
    pub async fn ensure_running(config: &Config, client: &AdminClient) -> Result<Option<Self>> {
        if client.is_up().await {
            info!(port = config.port, "Caddy server is already running");
            return Ok(None);
        }

        info!(
            port = config.port,
            binary = %config.binary,
            "Caddy is not running, launching with admin port"
        );
        Self::spawn(config).await.map(Some)
    }

    /// Run `caddy run --pidfile <state_dir>/caddy.pid` and wait for readiness
    pub async fn spawn(config: &Config) -> Result<Self> {
        let state_dir = config.state_dir();
        tokio::fs::create_dir_all(&state_dir).await?;

        let mut cmd = Command::new(&config.binary);
        cmd.arg("run").arg("--pidfile").arg(config.pid_file());
        cmd.env("CADDY_ADMIN", config.admin_address());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: config.binary.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        debug!(pid, "Caddy process spawned");

        let stderr = child.stderr.take().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Caddy stderr was not captured",
            ))
        })?;

        let (ready_tx, mut ready_rx) = oneshot::channel();
        let log_task = tokio::spawn(forward_logs(stderr, ready_tx));

        let timeout = config.startup_timeout();
        let startup = tokio::time::timeout(timeout, async {
            tokio::select! {
                ready = &mut ready_rx => {
                    if ready.is_ok() {
                        return Ok(Startup::Ready);
                    }
                }
                status = child.wait() => return status.map(Startup::Exited),
            }
            // stderr closed without the ready line; the exit counts against the same deadline
            child.wait().await.map(Startup::Exited)
        })
        .await;

        let failure = match startup {
            Ok(Ok(Startup::Ready)) => {
                info!(pid, "Caddy server launched");
                return Ok(Self { child, log_task });
            }
            Ok(Ok(Startup::Exited(status))) => Error::Exited {
                program: config.binary.clone(),
                status,
            },
            Ok(Err(e)) => Error::Io(e),
            Err(_) => {
                warn!(pid, timeout_secs = timeout.as_secs(), "Caddy startup timeout exceeded");
                let _ = child.kill().await;
                Error::StartupTimeout {
                    what: "Caddy".to_string(),
                    timeout,
                }
            }
        };

        log_task.abort();
        Err(failure)
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for Caddy to exit on its own
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGTERM, then SIGKILL after the grace period
    pub async fn stop(mut self, grace_period: Duration) {
        terminate("caddy", &mut self.child, grace_period).await;
        self.log_task.abort();
    }
}

/// Whether a Caddy log line announces that the initial config is served.
/// Lines that are not JSON never match.
pub fn is_ready_line(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|entry| entry.get("msg").and_then(Value::as_str).map(|msg| msg == READY_MESSAGE))
        .unwrap_or(false)
}

async fn forward_logs(stderr: ChildStderr, ready_tx: oneshot::Sender<()>) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stderr).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Failed to read Caddy output");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(&line) {
            Ok(entry) => {
                let level = entry.get("level").and_then(Value::as_str).unwrap_or("info");
                let msg = entry.get("msg").and_then(Value::as_str).unwrap_or_default();
                let logger = entry.get("logger").and_then(Value::as_str).unwrap_or("caddy");
                match level {
                    "warn" | "error" | "fatal" | "panic" => warn!(logger, caddy_level = level, "{}", msg),
                    _ => debug!(logger, caddy_level = level, "{}", msg),
                }
            }
            Err(_) => debug!(line = %line, "Caddy output"),
        }

        if is_ready_line(&line) {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

/// A development server command supervised for the length of a session
pub struct DevServer {
    program: String,
    port: u16,
    child: Child,
}

impl DevServer {
    /// Start `command` with `PORT` set; its output goes to this terminal
    pub fn spawn(command: &[String], port: u16) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no dev server command given",
            ))
        })?;

        info!(command = %command.join(" "), port, "Starting dev server");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env("PORT", port.to_string());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            program: program.clone(),
            source,
        })?;
        info!(pid = child.id().unwrap_or(0), "Dev server process spawned");

        Ok(Self {
            program: program.clone(),
            port,
            child,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Poll until the dev port accepts connections on any address `localhost` stands for
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(Error::Exited {
                    program: self.program.clone(),
                    status,
                });
            }

            if localhost_accepts(self.port).await {
                info!(port = self.port, elapsed_ms = start.elapsed().as_millis(), "Dev server is listening");
                return Ok(());
            }

            if start.elapsed() > timeout {
                return Err(Error::StartupTimeout {
                    what: format!("Dev server on port {}", self.port),
                    timeout,
                });
            }

            tokio::time::sleep(Duration::from_millis(PORT_POLL_INTERVAL_MS)).await;
        }
    }

    /// Wait for the dev server to exit on its own
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub async fn stop(mut self, grace_period: Duration) {
        let program = self.program.clone();
        terminate(&program, &mut self.child, grace_period).await;
    }
}

/// Addresses Caddy may reach when dialing `localhost:<port>`
async fn localhost_addrs(port: u16) -> Vec<SocketAddr> {
    let mut addrs: Vec<SocketAddr> = match tokio::net::lookup_host(("localhost", port)).await {
        Ok(resolved) => resolved.collect(),
        Err(e) => {
            debug!(error = %e, "Failed to resolve localhost");
            Vec::new()
        }
    };

    for loopback in [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)] {
        let addr = SocketAddr::new(loopback, port);
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    addrs
}

async fn localhost_accepts(port: u16) -> bool {
    for addr in localhost_addrs(port).await {
        if wait_for_port(addr, Duration::from_millis(500)).await {
            debug!(%addr, "Port accepts connections");
            return true;
        }
    }
    false
}

/// Single connection attempt with a timeout
async fn wait_for_port(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Stop a child process: SIGTERM, wait for the grace period, then SIGKILL
async fn terminate(name: &str, child: &mut Child, grace_period: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(name, ?status, "Process already exited");
        return;
    }

    if let Some(pid) = child.id() {
        info!(name, pid, "Sending SIGTERM");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(name, ?status, "Process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(name, error = %e, "Error waiting for process to exit");
        }
        Err(_) => {
            warn!(
                name,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}
