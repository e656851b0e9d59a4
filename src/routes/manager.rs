use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ProxError, Result};
use crate::proxy::modifiers::{ClientRequestModifier, DownstreamModifier, UpstreamModifier};
use crate::routes::{repository::MemoryRepository, Route, RouteSpec};

const DEFAULT_UPSTREAM_TIMEOUT: &str = "10s";
const DEFAULT_CACHE_TIMEOUT: &str = "10m";
const DEFAULT_HTTPS_REDIRECT_PORT: u16 = 443;
const MEGABYTES_TO_BYTES: i64 = 1_000_000;

static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])(\.([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]{0,61}[a-zA-Z0-9]))*$",
    )
    .expect("hostname expression must compile")
});

static WILDCARD_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s\S]*").expect("wildcard expression must compile"));

/// Factory for the per-route upstream client, injected so tests can
/// substitute one.
pub type HttpClientFactory =
    Arc<dyn Fn(Duration, bool) -> reqwest::Result<reqwest::Client> + Send + Sync>;

/// Build the upstream client for a route from its timeout and
/// TLS-verification settings.
pub fn create_http_client(
    upstream_timeout: Duration,
    skip_tls_verify: bool,
) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(upstream_timeout)
        .danger_accept_invalid_certs(skip_tls_verify)
        .build()
}

/// Validating façade over the route repository. Every write operation runs
/// the route business rules before the repository sees the route, so the
/// repository only ever stores fully validated entries.
pub struct RouteManager {
    repo: MemoryRepository,
    client_factory: HttpClientFactory,
}

impl RouteManager {
    pub fn new(repo: MemoryRepository, client_factory: HttpClientFactory) -> Self {
        Self {
            repo,
            client_factory,
        }
    }

    pub fn with_default_client(repo: MemoryRepository) -> Self {
        Self::new(repo, Arc::new(create_http_client))
    }

    /// Validate and store a new route. Cancellation observed before the
    /// repository call takes precedence; validation errors pass through
    /// as-is.
    pub async fn create(&self, ctx: &CancellationToken, spec: RouteSpec) -> Result<()> {
        if spec.name.is_empty() {
            return Err(ProxError::EmptyRouteName);
        }
        let route = self.parse_and_validate(spec)?;
        if ctx.is_cancelled() {
            return Err(ProxError::Cancelled);
        }
        self.repo.create(Arc::new(route)).await
    }

    /// Validate and replace a stored route.
    pub async fn update(&self, ctx: &CancellationToken, spec: RouteSpec) -> Result<()> {
        if spec.name.is_empty() {
            return Err(ProxError::EmptyRouteName);
        }
        let route = self.parse_and_validate(spec)?;
        if ctx.is_cancelled() {
            return Err(ProxError::Cancelled);
        }
        self.repo.update(Arc::new(route)).await
    }

    pub async fn delete(&self, ctx: &CancellationToken, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ProxError::EmptyRouteName);
        }
        if ctx.is_cancelled() {
            return Err(ProxError::Cancelled);
        }
        self.repo.delete(name).await
    }

    pub async fn list(&self, ctx: &CancellationToken) -> Result<Vec<Arc<Route>>> {
        if ctx.is_cancelled() {
            return Err(ProxError::Cancelled);
        }
        Ok(self.repo.list().await)
    }

    /// Apply the route business rules to an operator-supplied record and
    /// produce the validated, compiled form. Fails fast on the first broken
    /// rule.
    pub fn parse_and_validate(&self, mut spec: RouteSpec) -> Result<Route> {
        if spec.name.is_empty() {
            return Err(ProxError::EmptyRouteName);
        }

        let (cache_ttl, upstream_timeout) = parse_durations(&mut spec)?;
        let upstream = parse_upstream_url(&spec)?;
        let cache_max_body_bytes = parse_cache_max_body_size(&mut spec);

        validate_request_identifiers(&spec)?;
        let host_matcher = compile_host_matcher(&spec.hostname, &spec.hostname_regex)?;
        let path_matcher = compile_path_matcher(&spec.path, &spec.path_regex)?;

        let (client_request_modifiers, upstream_modifiers, downstream_modifiers) =
            build_modifier_chains(&spec);

        let client = (self.client_factory)(upstream_timeout, spec.upstream_skip_tls)?;

        Ok(Route {
            spec,
            host_matcher,
            path_matcher,
            cache_ttl,
            upstream_timeout,
            cache_max_body_bytes,
            upstream,
            client,
            client_request_modifiers,
            upstream_modifiers,
            downstream_modifiers,
        })
    }
}

fn parse_durations(spec: &mut RouteSpec) -> Result<(Duration, Duration)> {
    if spec.cache_timeout.is_empty() {
        spec.cache_timeout = DEFAULT_CACHE_TIMEOUT.to_owned();
    }
    let cache_ttl = humantime::parse_duration(&spec.cache_timeout)
        .map_err(|_| ProxError::InvalidCacheDuration)?;

    if spec.upstream_timeout.is_empty() {
        spec.upstream_timeout = DEFAULT_UPSTREAM_TIMEOUT.to_owned();
    }
    let upstream_timeout = humantime::parse_duration(&spec.upstream_timeout)
        .map_err(|_| ProxError::InvalidUpstreamDuration)?;

    Ok((cache_ttl, upstream_timeout))
}

fn parse_upstream_url(spec: &RouteSpec) -> Result<Url> {
    let url = Url::parse(&spec.upstream_url).map_err(|_| ProxError::InvalidUpstreamHost)?;
    if url.host_str().is_none() {
        return Err(ProxError::InvalidUpstreamHost);
    }
    Ok(url)
}

fn parse_cache_max_body_size(spec: &mut RouteSpec) -> i64 {
    if spec.cache_max_body_size_in_mb <= 0 {
        spec.cache_max_body_size_in_mb = -1;
        return -1;
    }
    spec.cache_max_body_size_in_mb * MEGABYTES_TO_BYTES
}

fn validate_request_identifiers(spec: &RouteSpec) -> Result<()> {
    let has_hostname = !spec.hostname.is_empty();
    let has_hostname_regex = !spec.hostname_regex.is_empty();
    let has_path = !spec.path.is_empty();
    let has_path_regex = !spec.path_regex.is_empty();

    if !has_hostname && !has_hostname_regex && !has_path && !has_path_regex {
        return Err(ProxError::EmptyRequestIdentifiers);
    }
    if has_hostname && has_hostname_regex && has_path && has_path_regex {
        return Err(ProxError::DuplicatedRequestIdentifier);
    }
    if has_hostname && has_hostname_regex {
        return Err(ProxError::DuplicatedHostRequestIdentifier);
    }
    if has_path && has_path_regex {
        return Err(ProxError::DuplicatedPathRequestIdentifier);
    }
    Ok(())
}

fn compile_host_matcher(hostname: &str, hostname_regex: &str) -> Result<Regex> {
    if !hostname.is_empty() && hostname_regex.is_empty() {
        if !HOSTNAME_REGEX.is_match(hostname) {
            return Err(ProxError::InvalidHostname);
        }
        return Ok(Regex::new(&format!("^{hostname}$"))?);
    }
    if hostname.is_empty() && !hostname_regex.is_empty() {
        return Ok(Regex::new(hostname_regex)?);
    }
    Ok(WILDCARD_REGEX.clone())
}

fn compile_path_matcher(path: &str, path_regex: &str) -> Result<Regex> {
    if !path.is_empty() && path_regex.is_empty() {
        return Ok(Regex::new(path)?);
    }
    if path.is_empty() && !path_regex.is_empty() {
        return Ok(Regex::new(path_regex)?);
    }
    Ok(WILDCARD_REGEX.clone())
}

fn build_modifier_chains(
    spec: &RouteSpec,
) -> (
    Vec<ClientRequestModifier>,
    Vec<UpstreamModifier>,
    Vec<DownstreamModifier>,
) {
    let mut client_request_modifiers = Vec::new();
    if spec.middlewares.https_redirect_enabled {
        let port = if spec.middlewares.https_redirect_port != 0 {
            spec.middlewares.https_redirect_port
        } else {
            DEFAULT_HTTPS_REDIRECT_PORT
        };
        client_request_modifiers.push(ClientRequestModifier::HttpsRedirect { port });
    }

    let mut upstream_modifiers = Vec::new();
    if spec.middlewares.forward_host_header {
        upstream_modifiers.push(UpstreamModifier::ForwardHost);
    }

    // The proxy marker always runs on the way back out.
    let downstream_modifiers = vec![DownstreamModifier::SetProxyHeader];

    (client_request_modifiers, upstream_modifiers, downstream_modifiers)
}
