//! devcaddy - Stable HTTPS hostnames for local dev servers through Caddy
//!
//! This library keeps a local Caddy server's live configuration in step with
//! the dev servers that are running:
//! - Starts Caddy on demand and waits until it serves its configuration
//! - Maintains one HTTPS server for `*.<domain>` with a DNS-01 wildcard certificate
//! - Routes `<hostname>.<domain>` to each dev server's local port
//! - Reconciles by `@id`: creates what is missing, patches what drifted,
//!   and leaves matching objects untouched
//! - Removes a dev server's route when it stops

pub mod admin;
pub mod caddy;
pub mod config;
pub mod entry;
pub mod error;
pub mod process;
pub mod reconcile;
pub mod session;

pub use error::{Error, Result};
