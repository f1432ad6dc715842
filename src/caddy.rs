//! Orchestration of the managed Caddy configuration
//!
//! `launch` brings a dev server online: make sure Caddy runs, then reconcile
//! the wildcard server, its TLS policy and the project's route, in that order.
//! `down` removes the route again.

use crate::admin::AdminClient;
use crate::config::{Config, ProjectConfig};
use crate::entry::{self, Entry, WILDCARD_ROUTES_ID};
use crate::error::Result;
use crate::process::CaddyProcess;
use crate::reconcile::{Action, Outcome, Reconciler};
use crate::session::STOP_GRACE_PERIOD;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Outcomes of one `configure` pass
#[derive(Debug, Clone)]
pub struct ConfigureReport {
    pub server: Outcome,
    pub tls: Outcome,
    pub routes: Outcome,
    /// Public URLs now routed to the dev server
    pub urls: Vec<String>,
}

/// Result of `launch`: the configure report plus the Caddy child if one was started
pub struct Launch {
    pub process: Option<CaddyProcess>,
    pub report: ConfigureReport,
}

/// One route found under the wildcard server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteStatus {
    pub id: Option<String>,
    pub hosts: Vec<String>,
    pub upstreams: Vec<String>,
}

impl RouteStatus {
    pub fn from_json(route: &Value) -> Self {
        let strings = |values: Option<&Value>, key: &str| -> Vec<String> {
            values
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get(key))
                        .filter_map(Value::as_array)
                        .flatten()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let upstreams = route
            .get("handle")
            .and_then(Value::as_array)
            .map(|handlers| {
                handlers
                    .iter()
                    .filter_map(|handler| handler.get("upstreams"))
                    .filter_map(Value::as_array)
                    .flatten()
                    .filter_map(|upstream| upstream.get("dial"))
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: route.get("@id").and_then(Value::as_str).map(str::to_string),
            hosts: strings(route.get("match"), "host"),
            upstreams,
        }
    }
}

/// Snapshot for `devcaddy status`
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub admin_url: String,
    pub up: bool,
    pub routes: Vec<RouteStatus>,
}

/// Owner of the admin connection and the global settings
pub struct Caddy {
    config: Config,
    reconciler: Reconciler,
}

impl Caddy {
    pub fn new(config: Config) -> Result<Self> {
        let client = AdminClient::new(config.admin_url(), config.request_timeout())?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: Config, client: AdminClient) -> Self {
        Self {
            config,
            reconciler: Reconciler::new(client),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &AdminClient {
        self.reconciler.client()
    }

    pub async fn is_up(&self) -> bool {
        self.client().is_up().await
    }

    /// Start Caddy if its admin API does not answer yet
    pub async fn ensure_running(&self) -> Result<Option<CaddyProcess>> {
        CaddyProcess::ensure_running(&self.config, self.client()).await
    }

    /// Ensure Caddy runs, then publish the project on `dev_port`
    pub async fn launch(&self, project: &ProjectConfig, dev_port: u16) -> Result<Launch> {
        let process = self.ensure_running().await?;

        match self.configure(project, dev_port).await {
            Ok(report) => Ok(Launch { process, report }),
            Err(e) => {
                if let Some(process) = process {
                    warn!("Stopping the Caddy server started for this launch");
                    process.stop(STOP_GRACE_PERIOD).await;
                }
                Err(e)
            }
        }
    }

    /// Reconcile server, TLS policy and project route against a running Caddy
    pub async fn configure(&self, project: &ProjectConfig, dev_port: u16) -> Result<ConfigureReport> {
        let domain = &self.config.domain;
        let wildcard = self.config.wildcard();

        let server = self
            .apply(
                &format!("server for wildcard domain {}", wildcard),
                &entry::server(domain),
            )
            .await?;

        let tls = self
            .apply(
                &format!(
                    "TLS settings for wildcard domain {} and provider {}",
                    wildcard,
                    self.config.provider.name()
                ),
                &entry::tls(domain, &self.config.provider),
            )
            .await?;

        let routes = self
            .apply(
                &format!("reverse proxies for wildcard domain {}", wildcard),
                &entry::hostnames(&project.hostnames, domain, dev_port),
            )
            .await?;

        let urls: Vec<String> = project
            .hostnames
            .iter()
            .map(|hostname| format!("https://{}.{}", hostname, domain))
            .collect();

        for url in &urls {
            info!(
                "{}",
                describe(routes.action, &format!("reverse proxy for {} to port {}", url, dev_port))
            );
        }
        info!("Caddy configuration complete");

        Ok(ConfigureReport {
            server,
            tls,
            routes,
            urls,
        })
    }

    /// Remove the route of the dev server on `dev_port`
    pub async fn down(&self, dev_port: u16) -> Result<Outcome> {
        self.apply(
            &format!("reverse proxies to port {}", dev_port),
            &entry::down(dev_port),
        )
        .await
    }

    pub async fn status(&self) -> Result<Status> {
        let up = self.is_up().await;
        let routes = if up {
            self.client()
                .routes(WILDCARD_ROUTES_ID)
                .await?
                .iter()
                .map(RouteStatus::from_json)
                .collect()
        } else {
            Vec::new()
        };

        Ok(Status {
            admin_url: self.client().base_url().to_string(),
            up,
            routes,
        })
    }

    async fn apply(&self, subject: &str, entry: &Entry) -> Result<Outcome> {
        let verb = if entry.is_delete() { "Deleting" } else { "Configuring" };
        debug!(id = %entry.id, target = %entry.target, "{} {}...", verb, subject);

        let outcome = self.reconciler.apply(entry).await?;
        info!(id = %entry.id, status = outcome.status.as_u16(), "{}", describe(outcome.action, subject));
        Ok(outcome)
    }
}

/// Human readable line for an applied entry
pub fn describe(action: Action, subject: &str) -> String {
    match action {
        Action::Created => format!("Created {}", subject),
        Action::Updated => format!("Updated {}", subject),
        Action::Deleted => format!("Deleted {}", subject),
        Action::Skipped => format!("Skipped {}, already present", subject),
    }
}
