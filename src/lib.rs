//! Gram gateway library
//!
//! Turns OpenAPI documents into callable tools and serves them over HTTP.
//!
//! # Components
//!
//! - **Extraction**: canonicalizes 3.0 and 3.1 documents and derives one
//!   tool per operation, with a merged input schema
//! - **Proxy**: injects credentials (API keys, basic, bearer, OAuth2
//!   client credentials) and forwards calls upstream
//! - **OAuth proxy**: an OAuth 2.1 authorization server in front of a
//!   third-party provider, so MCP clients can authorize tool access
//! - **Function runner**: runs user code packages behind an authenticated
//!   HTTP endpoint, one child process per call
//! - **Cache**: typed, optionally encrypted entries over a pluggable backend

#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod encryption;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod openapi;
pub mod runner;
pub mod secret;
pub mod tools;

pub use error::{Error, ErrorKind, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` of `json` selects the
/// JSON formatter.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("install tracing subscriber: {e}")))
}
