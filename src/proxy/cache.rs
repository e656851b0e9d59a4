use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use crate::observability::metrics;
use crate::routes::Route;

const CACHED_BY_HEADER: &str = "x-cached-by-prox";
const MEGABYTES_TO_BYTES: i64 = 1_000_000;

/// A response held by the cache: everything needed to replay it to a client.
/// `content_length` is the length declared by the upstream (`-1` when it did
/// not declare one), which is what the byte accounting uses.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_length: i64,
}

/// Cache seam used by the proxy engine. All operations are concurrency-safe
/// and admission rejection is silent.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Look up a stored response for the request fingerprint. Only GET
    /// requests are served from the cache.
    async fn get(
        &self,
        route: &Route,
        method: &Method,
        host: &str,
        request_uri: &str,
    ) -> Option<CachedResponse>;

    /// Whether a response with these properties would currently be admitted.
    /// Decidable from the response head alone, so callers can check before
    /// reading a body into memory.
    async fn admits(
        &self,
        route: &Route,
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
        content_length: i64,
    ) -> bool;

    /// Store a response if the admission policy allows it.
    async fn save(
        &self,
        route: &Route,
        method: &Method,
        host: &str,
        request_uri: &str,
        response: CachedResponse,
    );
}

/// Cache used when caching is disabled in the static configuration.
#[derive(Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl ResponseCache for NoopCache {
    async fn get(
        &self,
        _route: &Route,
        _method: &Method,
        _host: &str,
        _request_uri: &str,
    ) -> Option<CachedResponse> {
        None
    }

    async fn admits(
        &self,
        _route: &Route,
        _method: &Method,
        _status: StatusCode,
        _headers: &HeaderMap,
        _content_length: i64,
    ) -> bool {
        false
    }

    async fn save(
        &self,
        _route: &Route,
        _method: &Method,
        _host: &str,
        _request_uri: &str,
        _response: CachedResponse,
    ) {
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CachedResponse>,
    current_bytes: i64,
}

/// In-memory GET cache with a global byte budget and per-entry timed
/// eviction. One lock guards the entry map and the byte counter together so
/// `current_bytes` always equals the sum of stored declared lengths.
#[derive(Debug)]
pub struct MemoryCache {
    state: Arc<RwLock<CacheState>>,
    max_bytes: i64,
}

impl MemoryCache {
    /// `max_size_in_megabytes ≤ 0` means unlimited.
    pub fn new(max_size_in_megabytes: i64) -> Self {
        let max_bytes = if max_size_in_megabytes <= 0 {
            -1
        } else {
            max_size_in_megabytes * MEGABYTES_TO_BYTES
        };
        metrics::set_cache_max_size(max_bytes);
        metrics::set_cache_current_size(0);

        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            max_bytes,
        }
    }

    /// Bytes currently accounted for by stored entries.
    pub async fn current_size_bytes(&self) -> i64 {
        self.state.read().await.current_bytes
    }

    /// The admission policy, decided against the response head and the
    /// current byte accounting; the body is never consulted.
    fn is_valid_save(
        &self,
        route: &Route,
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
        content_length: i64,
        current_bytes: i64,
    ) -> bool {
        if *method != Method::GET {
            return false;
        }

        if status != StatusCode::OK && status != StatusCode::NOT_MODIFIED {
            return false;
        }

        if self.max_bytes != -1 && self.max_bytes - current_bytes <= content_length {
            return false;
        }

        if route.cache_max_body_bytes() != -1 && content_length > route.cache_max_body_bytes() {
            return false;
        }

        let allowed = route.cache_allowed_content_types();
        if !allowed.is_empty() {
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            match content_type {
                Some(value) if allowed.iter().any(|a| a == value) => {}
                _ => return false,
            }
        }

        true
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(
        &self,
        route: &Route,
        method: &Method,
        host: &str,
        request_uri: &str,
    ) -> Option<CachedResponse> {
        if *method != Method::GET {
            return None;
        }

        let key = cache_key(route, host, request_uri);
        let state = self.state.read().await;
        let mut response = state.entries.get(&key)?.clone();
        response
            .headers
            .insert(CACHED_BY_HEADER, HeaderValue::from_static("true"));
        Some(response)
    }

    async fn admits(
        &self,
        route: &Route,
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
        content_length: i64,
    ) -> bool {
        let state = self.state.read().await;
        self.is_valid_save(route, method, status, headers, content_length, state.current_bytes)
    }

    async fn save(
        &self,
        route: &Route,
        method: &Method,
        host: &str,
        request_uri: &str,
        response: CachedResponse,
    ) {
        let key = cache_key(route, host, request_uri);
        let mut state = self.state.write().await;

        if !self.is_valid_save(
            route,
            method,
            response.status,
            &response.headers,
            response.content_length,
            state.current_bytes,
        ) {
            return;
        }

        let content_length = response.content_length;
        if let Some(previous) = state.entries.insert(key.clone(), response) {
            if previous.content_length > 0 {
                state.current_bytes -= previous.content_length;
            }
        }
        if content_length > 0 {
            state.current_bytes += content_length;
        }
        metrics::set_cache_current_size(state.current_bytes);
        debug!("cached response for id \"{key}\", current size {} bytes", state.current_bytes);
        drop(state);

        // Every save schedules its own eviction. A re-save of the same id
        // leaves the earlier task running; whichever fires first removes the
        // entry, the other finds nothing.
        let shared = self.state.clone();
        let ttl = route.cache_ttl();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut state = shared.write().await;
            if let Some(entry) = state.entries.remove(&key) {
                if entry.content_length > 0 {
                    state.current_bytes -= entry.content_length;
                }
                metrics::set_cache_current_size(state.current_bytes);
                debug!("evicted cached response for id \"{key}\"");
            }
        });
    }
}

/// Request fingerprint: `<route-name>-<host>-<request-uri-or-/>`.
fn cache_key(route: &Route, host: &str, request_uri: &str) -> String {
    let path = if request_uri.is_empty() { "/" } else { request_uri };
    format!("{}-{}-{}", route.name(), host, path)
}
