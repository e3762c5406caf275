//! # KVINDEX Server
//!
//! Loads the configuration, brings every namespace up and reports what it
//! found. Exits with status 1 on any fatal startup error.
//!
//! ```bash
//! # Warm restart where possible
//! RUST_LOG=info ./kvindex_server kvindex.toml
//!
//! # Discard persisted index memory
//! ./kvindex_server --cold-start kvindex.toml
//! ```

use std::error::Error;
use std::process;

use kvindex::shared::ServiceConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn usage() -> ! {
    eprintln!("usage: kvindex_server [--cold-start] <config.toml>");
    process::exit(2);
}

/// Logs `err` with its source chain and exits.
fn fatal(context: &str, err: &dyn Error) -> ! {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    error!("{context}: {chain}");
    process::exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut cold_start = false;
    let mut path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--cold-start" => cold_start = true,
            "-h" | "--help" => usage(),
            _ if path.is_none() => path = Some(arg),
            _ => usage(),
        }
    }
    let Some(path) = path else { usage() };

    let mut config = match ServiceConfig::load(&path) {
        Ok(config) => config,
        Err(e) => fatal(&format!("can't load {path}"), &e),
    };
    config.cold_start |= cold_start;

    let node = match kvindex::boot(&config) {
        Ok(node) => node,
        Err(e) => fatal("startup failed", &e),
    };

    for ns in node.namespaces() {
        let elements = ns.element_count();
        match node.recovery(ns.name()) {
            Some(summary) => info!(
                ns = ns.name(),
                elements,
                kept = summary.kept,
                expired = summary.expired,
                max_ttl = summary.max_ttl,
                rejected = summary.rejected(),
                inuse_bytes = ns.devices().inuse_size(),
                "warm restart complete"
            ),
            None => info!(ns = ns.name(), "cold start complete"),
        }
    }

    info!(stage_capacity = node.stage_capacity(), "node started");
}
