//! Errors raised while talking to Caddy or supervising processes

use reqwest::{Method, StatusCode};
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP client could not be constructed
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The admin API could not be reached or the transfer failed
    #[error("{method} {path} failed: {source}")]
    Request {
        method: Method,
        path: String,
        #[source]
        source: reqwest::Error,
    },

    /// The admin API answered with a status the reconciler cannot accept
    #[error("Unable to {method} {path}: {status}\n{body}")]
    Status {
        method: Method,
        path: String,
        status: StatusCode,
        body: String,
    },

    /// The admin API returned something that is not JSON
    #[error("Invalid JSON from {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A child process could not be started
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A child process stopped before it became ready
    #[error("{program} exited with {status} before it was ready")]
    Exited { program: String, status: ExitStatus },

    /// A child process did not become ready in time
    #[error("{what} was not ready after {}s", .timeout.as_secs())]
    StartupTimeout { what: String, timeout: Duration },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status returned by the admin API, if the failure was a response
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
