//! prox, a dynamically reconfigurable HTTP/HTTPS reverse proxy.
//!
//! Listens on a set of operator-defined ports, matches each inbound request
//! against a live-reloadable route table, forwards it to the route's
//! upstream and streams the response back, optionally caching GET responses
//! in memory. TLS termination is driven by an SNI certificate store that
//! reloads whenever its manifest or any referenced key/cert file changes on
//! disk.

pub mod config;
pub mod error;
pub mod observability;
pub mod proxy;
pub mod routes;
pub mod server;
pub mod tls;

pub use error::{ProxError, Result};
