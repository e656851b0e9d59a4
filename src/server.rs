use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::StaticConfig;
use crate::observability::metrics;
use crate::proxy::modifiers::TlsConnection;
use crate::proxy::{MemoryCache, NoopCache, ProxyEngine, ResponseCache};
use crate::routes::{MemoryRepository, RouteManager, RoutesFileWatcher};
use crate::tls::{self, CertStore, TlsConfigWatcher};

/// Wire everything together and block until a watcher or listener fails or
/// the process is signalled. Errors propagate (the process exits non-zero),
/// signal-driven shutdown returns cleanly.
pub async fn run(static_config: &str, routes_config: &str, tls_config: &str) -> Result<()> {
    let config = StaticConfig::load(static_config).await?;
    let metrics_handle = metrics::install_recorder()?;

    let manager = Arc::new(RouteManager::with_default_client(MemoryRepository::new()));
    let cache: Arc<dyn ResponseCache> = if config.cache.enabled {
        Arc::new(MemoryCache::new(config.cache.max_size_in_megabytes))
    } else {
        Arc::new(NoopCache)
    };
    let cert_store = Arc::new(CertStore::new());

    let ctx = CancellationToken::new();
    let (config_err_tx, mut config_err_rx) = mpsc::channel::<anyhow::Error>(2);

    {
        let watcher = RoutesFileWatcher::new(routes_config, manager.clone());
        let ctx = ctx.clone();
        let errors = config_err_tx.clone();
        tokio::spawn(async move { watcher.run(ctx, errors).await });
    }
    {
        let watcher = TlsConfigWatcher::new(tls_config, cert_store.clone());
        let ctx = ctx.clone();
        tokio::spawn(async move { watcher.run(ctx, config_err_tx).await });
    }

    let (proxy_err_tx, mut proxy_err_rx) = mpsc::channel::<anyhow::Error>(config.ports.len() + 1);

    for port_config in &config.ports {
        let engine = Arc::new(ProxyEngine::new(
            port_config.port,
            manager.clone(),
            cache.clone(),
            config.access_log_enabled,
            ctx.clone(),
        ));
        let addr = SocketAddr::from(([0, 0, 0, 0], port_config.port));
        let errors = proxy_err_tx.clone();

        if port_config.tls {
            let router = engine.router().layer(middleware::from_fn(mark_tls_connection));
            let rustls_config =
                RustlsConfig::from_config(Arc::new(tls::server_config(cert_store.clone())?));
            tokio::spawn(async move {
                debug!("starting https endpoint on port {}", addr.port());
                if let Err(e) = axum_server::bind_rustls(addr, rustls_config)
                    .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                    .await
                {
                    let _ = errors
                        .send(anyhow!("https listener on {addr} failed: {e}"))
                        .await;
                }
            });
        } else {
            let router = engine.router();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                debug!("starting http endpoint on port {}", addr.port());
                let listener = match TcpListener::bind(addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = errors.send(anyhow!("could not bind {addr}: {e}")).await;
                        return;
                    }
                };
                if let Err(e) = axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(ctx.cancelled_owned())
                .await
                {
                    let _ = errors
                        .send(anyhow!("http listener on {addr} failed: {e}"))
                        .await;
                }
            });
        }
    }

    {
        let infra_port = config.infra_port;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_infra(infra_port, metrics_handle, ctx).await {
                let _ = proxy_err_tx.send(e).await;
            }
        });
    }

    tokio::select! {
        Some(err) = config_err_rx.recv() => {
            ctx.cancel();
            Err(err)
        }
        Some(err) = proxy_err_rx.recv() => {
            ctx.cancel();
            Err(err)
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("received interrupt signal, starting graceful shutdown of prox");
            ctx.cancel();
            Ok(())
        }
        _ = wait_for_sigterm() => {
            warn!("received terminate signal, starting graceful shutdown of prox");
            ctx.cancel();
            Ok(())
        }
    }
}

/// Requests served from a TLS listener carry this marker so the HTTPS
/// redirect modifier can tell the connections apart.
async fn mark_tls_connection(mut req: Request, next: Next) -> Response {
    req.extensions_mut().insert(TlsConnection);
    next.run(req).await
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("could not register SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
