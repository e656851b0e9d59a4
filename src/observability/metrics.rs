use anyhow::Result;
use axum::{http::StatusCode, routing::get, Router};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

const ROUTE_STATUS_CODE: &str = "prox_route_status_code";
const CACHE_MAX_SIZE: &str = "prox_in_memory_cache_max_size_in_bytes";
const CACHE_CURRENT_SIZE: &str = "prox_in_memory_cache_current_size_in_bytes";

/// Install the global Prometheus recorder and register metric help texts.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;

    describe_counter!(ROUTE_STATUS_CODE, "HTTP response status class by prox route");
    describe_gauge!(CACHE_MAX_SIZE, "Maximum in-memory cache size in bytes");
    describe_gauge!(CACHE_CURRENT_SIZE, "Current in-memory cache size in bytes");

    Ok(handle)
}

/// Count one served response, bucketed into its status class.
pub fn record_route_status(route: &str, status: StatusCode) {
    let status_class = match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    };
    counter!(
        ROUTE_STATUS_CODE,
        "status_code" => status_class,
        "route" => route.to_owned()
    )
    .increment(1);
}

pub fn set_cache_max_size(bytes: i64) {
    gauge!(CACHE_MAX_SIZE).set(bytes as f64);
}

pub fn set_cache_current_size(bytes: i64) {
    gauge!(CACHE_CURRENT_SIZE).set(bytes as f64);
}

/// Router for the infra endpoint: Prometheus metrics and a health probe.
pub fn infra_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .route("/health", get(|| async { "OK" }))
}

/// Serve the infra endpoint on its dedicated port until shutdown.
pub async fn serve_infra(port: u16, handle: PrometheusHandle, ctx: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("starting infra endpoint on port {port}, paths /metrics and /health");

    axum::serve(listener, infra_router(handle))
        .with_graceful_shutdown(ctx.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let router = infra_router(handle);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"OK");
    }

    #[tokio::test]
    async fn metrics_endpoint_renders() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let router = infra_router(handle);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
