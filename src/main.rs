use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use devcaddy::admin::{PKG_NAME, VERSION};
use devcaddy::caddy::Caddy;
use devcaddy::config::{Config, ProjectConfig};
use devcaddy::process::CaddyProcess;
use devcaddy::session::{self, RunEnd, Session, STOP_GRACE_PERIOD};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Publish local dev servers under stable HTTPS hostnames through Caddy
#[derive(Parser, Debug)]
#[command(name = "devcaddy", version, about)]
struct Cli {
    /// Global settings file (default: ~/.devcaddy/caddy.toml)
    #[arg(short, long, global = true, env = "DEVCADDY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging, including Caddy's own log lines
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run Caddy in the foreground until interrupted
    Serve,

    /// Publish a dev server already listening on a port
    Up(ProjectArgs),

    /// Remove the routes of a dev server
    Down {
        /// Port of the dev server
        #[arg(short, long)]
        port: u16,
    },

    /// Show whether Caddy runs and which dev servers are routed
    Status,

    /// Ask a running Caddy to shut down through its admin API
    Stop,

    /// Start a dev command, publish it while it runs, withdraw it on exit
    ///
    /// Example: devcaddy run --port 3000 --hostname shop -- npm run dev
    Run {
        #[command(flatten)]
        project: ProjectArgs,

        /// Seconds to wait for the dev server to accept connections
        #[arg(long, default_value_t = 60)]
        startup_timeout: u64,

        /// Dev server command; a single quoted string is split like a shell would
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct ProjectArgs {
    /// Port the dev server listens on
    #[arg(short, long)]
    port: u16,

    /// Hostname to publish (repeatable); defaults to devcaddy.toml in the current directory
    #[arg(short = 'H', long = "hostname", value_name = "HOSTNAME")]
    hostnames: Vec<String>,
}

impl ProjectArgs {
    fn project(&self) -> anyhow::Result<ProjectConfig> {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        ProjectConfig::resolve(self.hostnames.clone(), &cwd)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let directive = if cli.verbose { "devcaddy=debug" } else { "devcaddy=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let caddy = Caddy::new(config)?;

    match cli.command {
        Command::Serve => serve(&caddy).await,
        Command::Up(args) => {
            let project = args.project()?;
            if !caddy.is_up().await {
                anyhow::bail!(
                    "Caddy admin API at {} is not reachable; start it with `{} serve`",
                    caddy.client().base_url(),
                    PKG_NAME
                );
            }
            caddy.configure(&project, args.port).await?;
            Ok(())
        }
        Command::Down { port } => {
            caddy.down(port).await?;
            Ok(())
        }
        Command::Status => status(&caddy).await,
        Command::Stop => {
            if !caddy.is_up().await {
                warn!(admin_url = caddy.client().base_url(), "Caddy is not running");
                return Ok(());
            }
            caddy.client().stop().await?;
            info!("Caddy is shutting down");
            Ok(())
        }
        Command::Run {
            project,
            startup_timeout,
            command,
        } => {
            let command = split_command(command)?;
            let hostnames = project.project()?;
            let end = Session::new(caddy, hostnames)
                .run(
                    &command,
                    project.port,
                    Duration::from_secs(startup_timeout),
                    session::shutdown_signal(),
                )
                .await?;

            if let RunEnd::DevServerExited(status) = end {
                if !status.success() {
                    anyhow::bail!("Dev server exited with {}", status);
                }
            }
            Ok(())
        }
    }
}

/// Keep a Caddy server in the foreground until a signal arrives
async fn serve(caddy: &Caddy) -> anyhow::Result<()> {
    let Some(mut process) = CaddyProcess::ensure_running(caddy.config(), caddy.client()).await? else {
        warn!(
            admin_url = caddy.client().base_url(),
            "Caddy is already running; nothing to supervise"
        );
        return Ok(());
    };

    let exited = tokio::select! {
        _ = session::shutdown_signal() => None,
        status = process.wait() => Some(status),
    };

    match exited {
        None => process.stop(STOP_GRACE_PERIOD).await,
        Some(status) => {
            let status = status?;
            if !status.success() {
                anyhow::bail!("Caddy exited with {}", status);
            }
            info!(?status, "Caddy exited");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn status(caddy: &Caddy) -> anyhow::Result<()> {
    let status = caddy.status().await?;

    if !status.up {
        println!("Caddy admin API at {} is not reachable", status.admin_url);
        return Ok(());
    }

    println!("Caddy admin API at {} is up", status.admin_url);
    if status.routes.is_empty() {
        println!("No dev servers are routed");
    }
    for route in status.routes {
        println!(
            "  {}  {} -> {}",
            route.id.as_deref().unwrap_or("<no id>"),
            route.hosts.join(", "),
            route.upstreams.join(", ")
        );
    }
    Ok(())
}

/// `-- npm run dev` stays as is; `-- "npm run dev"` is split shell-style
fn split_command(command: Vec<String>) -> anyhow::Result<Vec<String>> {
    let command = if command.len() == 1 && command[0].contains(char::is_whitespace) {
        shell_words::split(&command[0])
            .with_context(|| format!("Failed to parse command '{}'", command[0]))?
    } else {
        command
    };

    if command.is_empty() {
        anyhow::bail!("No dev server command given");
    }
    Ok(command)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting");
    info!(
        admin_url = %config.admin_url(),
        domain = %config.domain,
        provider = config.provider.name(),
        "Caddy settings"
    );
}
