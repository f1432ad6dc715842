//! Read-compare-write reconciliation of a single [`Entry`]
//!
//! 1. DELETE entries skip the lookup.
//! 2. Otherwise the object at `/id/<check_id>` is fetched:
//!    - absent: the entry is created at its target with its own method
//!    - equal to the desired object: nothing is written
//!    - different: the desired object is PATCHed over `/id/<check_id>`
//! 3. A 404 answer to a DELETE counts as deleted.

use crate::admin::{id_path, AdminClient};
use crate::entry::Entry;
use crate::error::{Error, Result};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// What reconciling an entry did to the live configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Deleted,
    Skipped,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
            Action::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub action: Action,
    /// Status of the last admin API response
    pub status: StatusCode,
}

/// Decision taken after looking the entry up
#[derive(Debug, Clone, PartialEq, Eq)]
enum Plan {
    Create,
    Replace,
    Keep(StatusCode),
}

/// Applies entries against one admin endpoint
pub struct Reconciler {
    client: AdminClient,
}

impl Reconciler {
    pub fn new(client: AdminClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &AdminClient {
        &self.client
    }

    /// Make the live configuration match `entry` with at most one write
    pub async fn apply(&self, entry: &Entry) -> Result<Outcome> {
        let plan = self.plan(entry).await?;

        let (method, target, body) = match plan {
            Plan::Keep(status) => {
                debug!(id = entry.check_id(), "Config object unchanged");
                return Ok(Outcome {
                    action: Action::Skipped,
                    status,
                });
            }
            Plan::Replace => (Method::PATCH, id_path(entry.check_id()), entry.desired()),
            Plan::Create => (entry.method.clone(), entry.target.clone(), &entry.json),
        };

        let body = if method == Method::DELETE { None } else { Some(body) };
        let response = self.client.send(method.clone(), &target, body).await?;
        let status = response.status();

        if !status.is_success() {
            if status == StatusCode::NOT_FOUND && entry.is_delete() {
                debug!(id = %entry.id, "Config object already absent");
                return Ok(Outcome {
                    action: Action::Deleted,
                    status,
                });
            }

            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                method,
                path: target,
                status,
                body,
            });
        }

        let action = if method == Method::DELETE {
            Action::Deleted
        } else if plan == Plan::Replace {
            Action::Updated
        } else {
            Action::Created
        };

        Ok(Outcome { action, status })
    }

    async fn plan(&self, entry: &Entry) -> Result<Plan> {
        if entry.is_delete() {
            return Ok(Plan::Create);
        }

        let path = id_path(entry.check_id());
        let response = self.client.send(Method::GET, &path, None).await?;
        let status = response.status();
        if !status.is_success() {
            return Ok(Plan::Create);
        }

        let body = response.text().await.map_err(|source| Error::Request {
            method: Method::GET,
            path: path.clone(),
            source,
        })?;
        let current: serde_json::Value =
            serde_json::from_str(&body).map_err(|source| Error::Json { path, source })?;

        if &current == entry.desired() {
            Ok(Plan::Keep(status))
        } else {
            Ok(Plan::Replace)
        }
    }
}
