use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the global settings inside the state directory
pub const CONFIG_FILE_NAME: &str = "caddy.toml";

/// File name of the per-project settings in the project directory
pub const PROJECT_FILE_NAME: &str = "devcaddy.toml";

/// Environment variable overriding the global settings path
pub const CONFIG_PATH_ENV: &str = "DEVCADDY_CONFIG";

/// Environment variable overriding the admin API base URL
pub const ADMIN_URL_ENV: &str = "CADDY_ADMIN_URL";

/// Global settings shared by every project on this machine
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// DNS provider used to solve ACME DNS-01 challenges for the wildcard certificate
    pub provider: Provider,

    /// Port of the Caddy admin API (default: 2019)
    #[serde(default = "default_admin_port")]
    pub port: u16,

    /// Base domain; projects are served as `<hostname>.<domain>`
    pub domain: String,

    /// Full admin API URL, when Caddy's admin endpoint is not on localhost
    pub admin_url: Option<String>,

    /// Caddy executable used when no server is running yet (default: "caddy" on PATH)
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Directory holding the PID file (default: ~/.devcaddy)
    pub state_dir: Option<String>,

    /// Seconds to wait for a spawned Caddy to serve its configuration
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Seconds before an admin API request is abandoned
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// DNS challenge provider, tagged by `name`
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Provider {
    Cloudflare(CloudflareProvider),
    Ovh(OvhProvider),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CloudflareProvider {
    /// API token, or a Caddy placeholder resolving to it
    #[serde(default = "default_cloudflare_token")]
    pub api_token: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OvhProvider {
    pub endpoint: String,
    #[serde(alias = "applicationKey")]
    pub application_key: String,
    #[serde(alias = "applicationSecret")]
    pub application_secret: String,
    #[serde(alias = "consumerKey")]
    pub consumer_key: String,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Cloudflare(_) => "cloudflare",
            Provider::Ovh(_) => "ovh",
        }
    }

    /// JSON object placed under `challenges.dns.provider` of a TLS policy
    pub fn to_json(&self) -> Value {
        match self {
            Provider::Cloudflare(p) => json!({
                "name": "cloudflare",
                "api_token": p.api_token,
            }),
            Provider::Ovh(p) => json!({
                "name": "ovh",
                "endpoint": p.endpoint,
                "application_key": p.application_key,
                "application_secret": p.application_secret,
                "consumer_key": p.consumer_key,
            }),
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        match self {
            Provider::Cloudflare(p) => {
                if p.api_token.trim().is_empty() {
                    errors.push("Cloudflare token is required".to_string());
                }
            }
            Provider::Ovh(p) => {
                match reqwest::Url::parse(&p.endpoint) {
                    Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                    _ => errors.push(format!("OVH endpoint must be a valid URL: '{}'", p.endpoint)),
                }
                let required = [
                    (&p.application_key, "OVH application key is required"),
                    (&p.application_secret, "OVH application secret is required"),
                    (&p.consumer_key, "OVH consumer key is required"),
                ];
                for (value, message) in required {
                    if value.trim().is_empty() {
                        errors.push(message.to_string());
                    }
                }
            }
        }
    }
}

// Default value functions
fn default_admin_port() -> u16 {
    2019
}

fn default_binary() -> String {
    "caddy".to_string()
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10
}

fn default_cloudflare_token() -> String {
    "{env.CLOUDFLARE_API_KEY}".to_string()
}

/// Home-relative directory used for settings and runtime files
pub fn default_state_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".devcaddy")
}

impl Config {
    /// Parse and validate the global settings file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("No Caddy configuration found at {}", path.display()))?;
        Self::parse(&content, std::env::var(ADMIN_URL_ENV).ok())
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Parse settings, apply an admin URL override, then validate the result
    pub fn parse(content: &str, admin_url_override: Option<String>) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse settings")?;

        if let Some(url) = admin_url_override.filter(|url| !url.trim().is_empty()) {
            config.admin_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Settings path: `DEVCADDY_CONFIG` if set, else `~/.devcaddy/caddy.toml`
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_state_dir().join(CONFIG_FILE_NAME))
    }

    /// Validate all settings, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("Port must be greater than 0".to_string());
        }

        if !is_valid_domain(&self.domain) {
            errors.push(format!("Invalid domain format: '{}'", self.domain));
        }

        if let Some(ref url) = self.admin_url {
            if reqwest::Url::parse(url).is_err() {
                errors.push(format!("Invalid admin_url: '{}'", url));
            }
        }

        if self.binary.trim().is_empty() {
            errors.push("'binary' cannot be empty".to_string());
        }

        self.provider.validate(&mut errors);

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Base URL of the admin API, without a trailing slash
    pub fn admin_url(&self) -> String {
        match self.admin_url {
            Some(ref url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.port),
        }
    }

    /// Value of `CADDY_ADMIN` handed to a spawned Caddy
    pub fn admin_address(&self) -> String {
        format!("localhost:{}", self.port)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir().join("caddy.pid")
    }

    /// `*.<domain>`
    pub fn wildcard(&self) -> String {
        format!("*.{}", self.domain)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Per-project settings: the hostnames a dev server is published under
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub hostnames: Vec<String>,
}

impl ProjectConfig {
    pub fn new(hostnames: Vec<String>) -> Self {
        Self { hostnames }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let project: ProjectConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        project.validate()?;
        Ok(project)
    }

    /// Hostnames given on the command line win over `devcaddy.toml` in `dir`
    pub fn resolve(hostnames: Vec<String>, dir: &Path) -> anyhow::Result<Self> {
        if !hostnames.is_empty() {
            let project = Self::new(hostnames);
            project.validate()?;
            return Ok(project);
        }

        let path = dir.join(PROJECT_FILE_NAME);
        if path.exists() {
            return Self::load(path);
        }

        anyhow::bail!(
            "At least one hostname must be provided (use --hostname or create {})",
            path.display()
        )
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.hostnames.is_empty() {
            errors.push("At least one hostname must be provided".to_string());
        }

        for hostname in &self.hostnames {
            if !is_valid_label(hostname) {
                errors.push(format!(
                    "Hostname '{}': hostnames can only contain letters, numbers and hyphens",
                    hostname
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Project configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// One DNS label: alphanumerics and inner hyphens
fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty() && domain.split('.').all(is_valid_label)
}
