use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::observability::metrics;
use crate::proxy::cache::{CachedResponse, ResponseCache};
use crate::routes::{Route, RouteManager};

const NOT_FOUND_BODY: &str = "404 - Not Found";
const INTERNAL_SERVER_ERROR_BODY: &str = "500 - Internal Server Error";
const CACHE_CONTROL_OVERRIDE: &str = "max-age=0, private, must-revalidate, no-store";

/// Headers that never cross the proxy boundary, in addition to whatever the
/// request's own `Connection` header lists.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

/// Per-listener proxy handler. Stateless across requests: every request
/// fetches a fresh route snapshot from the manager and runs the full
/// pipeline.
pub struct ProxyEngine {
    port: u16,
    manager: Arc<RouteManager>,
    cache: Arc<dyn ResponseCache>,
    access_log_enabled: bool,
    shutdown: CancellationToken,
}

impl ProxyEngine {
    pub fn new(
        port: u16,
        manager: Arc<RouteManager>,
        cache: Arc<dyn ResponseCache>,
        access_log_enabled: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            port,
            manager,
            cache,
            access_log_enabled,
            shutdown,
        }
    }

    /// Build the axum router for this listener. Every request, whatever its
    /// path, lands in the proxy pipeline.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(handle_request).with_state(self)
    }

    async fn handle(&self, client_addr: SocketAddr, req: Request) -> Response {
        if self.access_log_enabled {
            info!(
                "ACCESS {} {} {} from {}",
                self.port,
                req.method(),
                req.uri(),
                client_addr
            );
        }

        let host = request_host(&req);
        let request_uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_owned();

        let route = match self.manager.list(&self.shutdown).await {
            Ok(routes) => select_route(&routes, self.port, &host, &request_uri),
            Err(_) => None,
        };
        let Some(route) = route else {
            return (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response();
        };

        // The first configured modifier runs first and may answer the
        // request itself (e.g. the HTTPS redirect).
        for modifier in route.client_request_modifiers() {
            if let Some(response) = modifier.handle(&req) {
                return response;
            }
        }

        self.root_handler(route, client_addr, host, request_uri, req).await
    }

    async fn root_handler(
        &self,
        route: Arc<Route>,
        client_addr: SocketAddr,
        host: String,
        request_uri: String,
        req: Request,
    ) -> Response {
        let method = req.method().clone();

        if route.cache_enabled() {
            if let Some(hit) = self.cache.get(&route, &method, &host, &request_uri).await {
                debug!("serving cached response for route \"{}\"", route.name());
                let Some(headers) = self.apply_downstream_modifiers(&route, hit.headers) else {
                    return internal_server_error();
                };
                return self.client_response(&route, hit.status, &headers, Body::from(hit.body));
            }
        }

        let (parts, body) = req.into_parts();

        let mut upstream_headers = parts.headers.clone();
        for modifier in route.upstream_modifiers() {
            if let Err(e) = modifier.apply(&mut upstream_headers, &client_addr) {
                error!(
                    "could not apply upstream request modifiers for route \"{}\" error: {e}",
                    route.name()
                );
                return internal_server_error();
            }
            if self.shutdown.is_cancelled() {
                return internal_server_error();
            }
        }

        strip_hop_by_hop_headers(&mut upstream_headers);
        // The client library derives these from the target URL and the body.
        upstream_headers.remove(header::HOST);
        upstream_headers.remove(header::CONTENT_LENGTH);

        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!("failed to read request body for route \"{}\": {e}", route.name());
                return internal_server_error();
            }
        };

        let target = upstream_target(&route, &request_uri);
        let upstream_response = match route
            .client()
            .request(method.clone(), &target)
            .headers(upstream_headers)
            .body(body_bytes)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("upstream request error for route \"{}\" error: {e}", route.name());
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        };

        let status = upstream_response.status();
        let declared_length = upstream_response
            .content_length()
            .map(|l| l as i64)
            .unwrap_or(-1);
        let mut response_headers = upstream_response.headers().clone();
        strip_hop_by_hop_headers(&mut response_headers);

        // Admission is decided from the response head alone; only a response
        // the cache would accept is buffered for the save, everything else
        // streams straight through, flushed chunk by chunk.
        let save_to_cache = route.cache_enabled()
            && self
                .cache
                .admits(&route, &method, status, &response_headers, declared_length)
                .await;
        if save_to_cache {
            let body_bytes = match upstream_response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(
                        "failed to read upstream response body for route \"{}\": {e}",
                        route.name()
                    );
                    return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
                }
            };
            self.cache
                .save(
                    &route,
                    &method,
                    &host,
                    &request_uri,
                    CachedResponse {
                        status,
                        headers: response_headers.clone(),
                        body: body_bytes.clone(),
                        content_length: declared_length,
                    },
                )
                .await;

            let Some(headers) = self.apply_downstream_modifiers(&route, response_headers) else {
                return internal_server_error();
            };
            self.client_response(&route, status, &headers, Body::from(body_bytes))
        } else {
            let Some(headers) = self.apply_downstream_modifiers(&route, response_headers) else {
                return internal_server_error();
            };
            self.client_response(
                &route,
                status,
                &headers,
                Body::from_stream(upstream_response.bytes_stream()),
            )
        }
    }

    fn apply_downstream_modifiers(&self, route: &Route, mut headers: HeaderMap) -> Option<HeaderMap> {
        for modifier in route.downstream_modifiers() {
            if let Err(e) = modifier.apply(&mut headers) {
                error!(
                    "could not apply downstream response modifiers for route \"{}\" error: {e}",
                    route.name()
                );
                return None;
            }
            if self.shutdown.is_cancelled() {
                return None;
            }
        }
        Some(headers)
    }

    /// Copy the upstream headers onto the client response, force the
    /// cache-control override and record the status-code metric.
    fn client_response(
        &self,
        route: &Route,
        status: StatusCode,
        upstream_headers: &HeaderMap,
        body: Body,
    ) -> Response {
        metrics::record_route_status(route.name(), status);

        let mut response = Response::new(body);
        *response.status_mut() = status;
        let headers = response.headers_mut();
        for (name, value) in upstream_headers {
            headers.append(name, value.clone());
        }
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(CACHE_CONTROL_OVERRIDE),
        );
        response
    }
}

async fn handle_request(
    State(engine): State<Arc<ProxyEngine>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    engine.handle(client_addr, req).await
}

fn internal_server_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_SERVER_ERROR_BODY).into_response()
}

/// The request host as matched against route hostname matchers: the `Host`
/// header (or URI authority for HTTP/2) stripped of any port.
fn request_host(req: &Request) -> String {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default();
    host.split(':').next().unwrap_or(host).to_owned()
}

/// Pick the best route for a request: only candidates on the listener's port
/// whose matchers accept host and URI, lowest priority value first. The sort
/// is stable, so equal priorities keep the snapshot order.
pub(crate) fn select_route(
    routes: &[Arc<Route>],
    port: u16,
    host: &str,
    request_uri: &str,
) -> Option<Arc<Route>> {
    let mut matches: Vec<&Arc<Route>> = routes
        .iter()
        .filter(|r| {
            r.port() == port && r.is_hostname_matching(host) && r.is_path_matching(request_uri)
        })
        .collect();
    matches.sort_by_key(|r| r.priority());
    matches.first().map(|r| Arc::clone(r))
}

/// Remove hop-by-hop headers: every name listed in `Connection` plus the
/// fixed set.
pub(crate) fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let connection_listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in connection_listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Rewrite target: scheme and host come from the route's upstream URL, the
/// path and query are taken from the client request as-is.
fn upstream_target(route: &Route, request_uri: &str) -> String {
    let upstream = route.upstream();
    let mut target = format!("{}://", upstream.scheme());
    target.push_str(upstream.host_str().unwrap_or_default());
    if let Some(port) = upstream.port() {
        target.push_str(&format!(":{port}"));
    }
    target.push_str(request_uri);
    target
}
