use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::proxy::modifiers::{ClientRequestModifier, DownstreamModifier, UpstreamModifier};

pub mod manager;
pub mod repository;
pub mod watcher;

pub use manager::RouteManager;
pub use repository::MemoryRepository;
pub use watcher::RoutesFileWatcher;

/// Per-route middleware switches as they appear in the routes file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Middlewares {
    #[serde(rename = "https-redirect-enabled")]
    pub https_redirect_enabled: bool,
    #[serde(rename = "https-redirect-port")]
    pub https_redirect_port: u16,
    #[serde(rename = "forward-host-header")]
    pub forward_host_header: bool,
}

/// A route record as written by the operator. This is the YAML-facing shape;
/// it carries no derived state and has not been validated. The manager turns
/// it into a [`Route`] via `parse_and_validate`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteSpec {
    pub name: String,
    #[serde(rename = "cache-enabled")]
    pub cache_enabled: bool,
    #[serde(rename = "cache-timeout")]
    pub cache_timeout: String,
    #[serde(rename = "cache-max-body-size-in-mb")]
    pub cache_max_body_size_in_mb: i64,
    #[serde(rename = "cache-allowed-content-types")]
    pub cache_allowed_content_types: Vec<String>,
    #[serde(rename = "upstream-url")]
    pub upstream_url: String,
    #[serde(rename = "upstream-timeout")]
    pub upstream_timeout: String,
    #[serde(rename = "upstream-skip-tls")]
    pub upstream_skip_tls: bool,
    pub priority: u32,
    pub port: u16,
    pub hostname: String,
    #[serde(rename = "hostname-regx")]
    pub hostname_regex: String,
    pub path: String,
    #[serde(rename = "path-regx")]
    pub path_regex: String,
    pub middlewares: Middlewares,
}

/// A validated route. Instances are only produced by the manager's
/// `parse_and_validate`, so every `Route` in the repository carries compiled
/// matchers, parsed durations and a ready upstream client. Routes are handed
/// out behind `Arc` and never mutated after insertion.
#[derive(Debug, Clone)]
pub struct Route {
    pub(crate) spec: RouteSpec,
    pub(crate) host_matcher: Regex,
    pub(crate) path_matcher: Regex,
    pub(crate) cache_ttl: Duration,
    pub(crate) upstream_timeout: Duration,
    pub(crate) cache_max_body_bytes: i64,
    pub(crate) upstream: Url,
    pub(crate) client: reqwest::Client,
    pub(crate) client_request_modifiers: Vec<ClientRequestModifier>,
    pub(crate) upstream_modifiers: Vec<UpstreamModifier>,
    pub(crate) downstream_modifiers: Vec<DownstreamModifier>,
}

impl Route {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn priority(&self) -> u32 {
        self.spec.priority
    }

    pub fn cache_enabled(&self) -> bool {
        self.spec.cache_enabled
    }

    pub fn cache_allowed_content_types(&self) -> &[String] {
        &self.spec.cache_allowed_content_types
    }

    /// Parsed cache TTL for stored responses.
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Per-route body limit in bytes; `-1` means unlimited.
    pub fn cache_max_body_bytes(&self) -> i64 {
        self.cache_max_body_bytes
    }

    pub fn upstream_timeout(&self) -> Duration {
        self.upstream_timeout
    }

    /// Parsed upstream URL; scheme and host are used to rewrite requests.
    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// The HTTP client reused for every request proxied through this route.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn is_hostname_matching(&self, hostname: &str) -> bool {
        self.host_matcher.is_match(hostname)
    }

    pub fn is_path_matching(&self, path: &str) -> bool {
        self.path_matcher.is_match(path)
    }

    pub fn client_request_modifiers(&self) -> &[ClientRequestModifier] {
        &self.client_request_modifiers
    }

    pub fn upstream_modifiers(&self) -> &[UpstreamModifier] {
        &self.upstream_modifiers
    }

    pub fn downstream_modifiers(&self) -> &[DownstreamModifier] {
        &self.downstream_modifiers
    }
}
