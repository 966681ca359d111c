//! Plugrest - a host for plugin REST apps
//!
//! Apps are directories with a `config.json` manifest under a common folder:
//! - Apps without a dependency file are embedded: their routes are served by
//!   the framework listener under the base path
//! - Apps with a dependency file are isolated: each gets its own dependency
//!   environment, a port, and a supervised child process
//! - A reverse proxy configuration routing both kinds is generated at startup
//! - An admin API exposes lifecycle actions on isolated apps

pub mod admin;
pub mod apps;
pub mod config;
pub mod context;
pub mod control;
pub mod environment;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod ports;
pub mod proxy_config;
pub mod registry;
pub mod server;
pub mod supervisor;

#[cfg(all(test, unix))]
mod testutil;
