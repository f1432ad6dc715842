//! Client for Caddy's admin API
//!
//! Only the small part of the API the reconciler needs is wrapped here:
//! reading by path or by `@id`, raw JSON writes, and `/stop`.

use crate::error::{Error, Result};
use reqwest::{Method, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Version information for the tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Thin wrapper around a reqwest client bound to one admin endpoint
#[derive(Debug, Clone)]
pub struct AdminClient {
    base_url: String,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("{}/{}", PKG_NAME, VERSION))
            .build()
            .map_err(Error::Client)?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Whether the admin endpoint answers `GET /config` successfully
    pub async fn is_up(&self) -> bool {
        match self.http.get(self.url("/config")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %self.base_url, error = %e, "Admin API not reachable");
                false
            }
        }
    }

    /// Read a config value; any non-2xx answer means "absent"
    pub async fn get(&self, path: &str) -> Result<Option<Value>> {
        let response = self.send(Method::GET, path, None).await?;
        if !response.status().is_success() {
            debug!(path, status = %response.status(), "Config path not present");
            return Ok(None);
        }

        let body = response.text().await.map_err(|source| Error::Request {
            method: Method::GET,
            path: path.to_string(),
            source,
        })?;

        let value = serde_json::from_str(&body).map_err(|source| Error::Json {
            path: path.to_string(),
            source,
        })?;

        Ok(Some(value))
    }

    /// Read the object tagged with `"@id": id`
    pub async fn get_id(&self, id: &str) -> Result<Option<Value>> {
        self.get(&id_path(id)).await
    }

    /// Send a request and hand back the raw response, whatever its status
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response> {
        debug!(%method, path, "Admin API request");

        let mut request = self.http.request(method.clone(), self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(|source| Error::Request {
            method,
            path: path.to_string(),
            source,
        })
    }

    /// Routes currently nested under the object with the given id
    pub async fn routes(&self, id: &str) -> Result<Vec<Value>> {
        let routes = self.get(&format!("{}/routes", id_path(id))).await?;
        Ok(match routes {
            Some(Value::Array(routes)) => routes,
            _ => Vec::new(),
        })
    }

    /// Ask Caddy to shut down gracefully
    pub async fn stop(&self) -> Result<()> {
        let response = self.send(Method::POST, "/stop", None).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Status {
            method: Method::POST,
            path: "/stop".to_string(),
            status,
            body,
        })
    }
}

/// Admin API path addressing an object by its `@id`
pub fn id_path(id: &str) -> String {
    format!("/id/{}", id)
}
