use std::net::SocketAddr;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};

use crate::error::{ProxError, Result};

/// Header set on every response that passed through the proxy.
pub const PROXY_HEADER: &str = "x-hit-by-prox";

/// Marker extension inserted by TLS listeners so request handlers can tell
/// whether the connection was encrypted.
#[derive(Debug, Clone, Copy)]
pub struct TlsConnection;

/// Client-request modifiers wrap the root proxy handler. The first modifier
/// in a route's list runs first and may short-circuit with a complete
/// response instead of passing the request on.
#[derive(Debug, Clone)]
pub enum ClientRequestModifier {
    HttpsRedirect { port: u16 },
}

impl ClientRequestModifier {
    /// Returns `Some(response)` to short-circuit the pipeline, `None` to let
    /// the request continue.
    pub fn handle(&self, req: &Request<Body>) -> Option<Response> {
        match self {
            Self::HttpsRedirect { port } => {
                if req.extensions().get::<TlsConnection>().is_some() {
                    return None;
                }
                let host = req
                    .headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .or_else(|| req.uri().host())
                    .unwrap_or_default();
                let host = host.split(':').next().unwrap_or(host);
                let path = req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                let location = format!("https://{host}:{port}{path}");
                Some((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
            }
        }
    }
}

/// Upstream modifiers adjust the outbound request headers before the
/// hop-by-hop strip and the upstream rewrite.
#[derive(Debug, Clone)]
pub enum UpstreamModifier {
    ForwardHost,
}

impl UpstreamModifier {
    pub fn apply(&self, headers: &mut HeaderMap, client_addr: &SocketAddr) -> Result<()> {
        match self {
            Self::ForwardHost => {
                let value = HeaderValue::from_str(&client_addr.ip().to_string())
                    .map_err(|e| ProxError::Internal(e.to_string()))?;
                headers.insert("x-forwarded-for", value);
                Ok(())
            }
        }
    }
}

/// Downstream modifiers adjust the upstream response headers before they are
/// copied onto the client response.
#[derive(Debug, Clone)]
pub enum DownstreamModifier {
    SetProxyHeader,
}

impl DownstreamModifier {
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        match self {
            Self::SetProxyHeader => {
                headers.insert(PROXY_HEADER, HeaderValue::from_static("true"));
                headers.append(header::CONNECTION, HeaderValue::from_static(PROXY_HEADER));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_request(uri: &str, host: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn https_redirect_redirects_plain_requests() {
        let modifier = ClientRequestModifier::HttpsRedirect { port: 8443 };
        let req = plain_request("/some/path?q=1", "example.com:8080");

        let response = modifier.handle(&req).expect("expected a redirect");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://example.com:8443/some/path?q=1"
        );
    }

    #[test]
    fn https_redirect_passes_tls_requests_through() {
        let modifier = ClientRequestModifier::HttpsRedirect { port: 443 };
        let mut req = plain_request("/", "example.com");
        req.extensions_mut().insert(TlsConnection);

        assert!(modifier.handle(&req).is_none());
    }

    #[test]
    fn forward_host_sets_the_client_ip() {
        let mut headers = HeaderMap::new();
        let addr: SocketAddr = "203.0.113.7:50123".parse().unwrap();

        UpstreamModifier::ForwardHost.apply(&mut headers, &addr).unwrap();
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.7");
    }

    #[test]
    fn set_proxy_header_marks_the_response() {
        let mut headers = HeaderMap::new();
        DownstreamModifier::SetProxyHeader.apply(&mut headers).unwrap();

        assert_eq!(headers.get(PROXY_HEADER).unwrap(), "true");
        let connection: Vec<_> = headers.get_all(header::CONNECTION).iter().collect();
        assert_eq!(connection, vec![PROXY_HEADER]);
    }
}
