//! Dev server lifecycle: publish on listen, withdraw on close
//!
//! A [`Session`] is what a dev tool integration holds on to. It reacts to the
//! two events a dev server goes through:
//! - `on_listen(port)`: the server accepts connections, publish it
//! - `on_close()`: the server is going away, remove every route it got
//!
//! [`Session::run`] drives those hooks around a supervised dev command.

use crate::caddy::{Caddy, ConfigureReport};
use crate::config::ProjectConfig;
use crate::error::Result;
use crate::process::{CaddyProcess, DevServer};
use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;
use tracing::{error, info, warn};

/// Time given to child processes between SIGTERM and SIGKILL
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Why a supervised run ended
#[derive(Debug)]
pub enum RunEnd {
    /// Shutdown was requested (signal or caller)
    Shutdown,
    /// The dev command exited by itself
    DevServerExited(ExitStatus),
}

pub struct Session {
    caddy: Caddy,
    project: ProjectConfig,
    /// Dev ports published during this session
    ports: Vec<u16>,
    /// Caddy child, when this session had to start it
    process: Option<CaddyProcess>,
}

impl Session {
    pub fn new(caddy: Caddy, project: ProjectConfig) -> Self {
        Self {
            caddy,
            project,
            ports: Vec::new(),
            process: None,
        }
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn owns_caddy(&self) -> bool {
        self.process.is_some()
    }

    /// Dev server is listening on `port`
    pub async fn on_listen(&mut self, port: u16) -> Result<ConfigureReport> {
        let launch = self.caddy.launch(&self.project, port).await?;
        if let Some(process) = launch.process {
            self.process = Some(process);
        }
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        Ok(launch.report)
    }

    /// Dev server is stopping: remove all routes published by this session.
    /// Every port is attempted; the first failure is returned.
    pub async fn on_close(&mut self) -> Result<()> {
        let mut first_error = None;

        for port in std::mem::take(&mut self.ports) {
            if let Err(e) = self.caddy.down(port).await {
                error!(port, error = %e, "Failed to remove reverse proxy");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop the Caddy server if this session started it
    pub async fn shutdown(mut self) {
        if let Some(process) = self.process.take() {
            info!(pid = process.id().unwrap_or(0), "Stopping Caddy server started by this session");
            process.stop(STOP_GRACE_PERIOD).await;
        }
    }

    /// Supervise `command` on `port` until `shutdown` resolves or the command exits.
    ///
    /// Caddy is started first (when needed), then the dev command; once its port
    /// accepts connections the project is published. On the way out the routes
    /// are removed, the dev command is stopped, and so is Caddy if it was
    /// started here.
    pub async fn run<F>(
        mut self,
        command: &[String],
        port: u16,
        startup_timeout: Duration,
        shutdown: F,
    ) -> anyhow::Result<RunEnd>
    where
        F: Future<Output = ()>,
    {
        self.process = self.caddy.ensure_running().await?;

        let mut dev = match DevServer::spawn(command, port) {
            Ok(dev) => dev,
            Err(e) => {
                self.shutdown().await;
                return Err(e.into());
            }
        };

        if let Err(e) = dev.wait_ready(startup_timeout).await {
            dev.stop(STOP_GRACE_PERIOD).await;
            self.shutdown().await;
            return Err(e.into());
        }

        if let Err(e) = self.on_listen(port).await {
            dev.stop(STOP_GRACE_PERIOD).await;
            self.shutdown().await;
            return Err(e.into());
        }

        let end = tokio::select! {
            _ = shutdown => RunEnd::Shutdown,
            status = dev.wait() => match status {
                Ok(status) => RunEnd::DevServerExited(status),
                Err(e) => {
                    warn!(error = %e, "Failed to wait for dev server");
                    RunEnd::Shutdown
                }
            },
        };

        match end {
            RunEnd::Shutdown => info!("Shutting down dev server"),
            RunEnd::DevServerExited(status) => info!(?status, "Dev server exited"),
        }

        let closed = self.on_close().await;
        dev.stop(STOP_GRACE_PERIOD).await;
        self.shutdown().await;

        closed?;
        Ok(end)
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}
