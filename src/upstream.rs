use std::time::Duration;

use axum::{body::Body, response::IntoResponse};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{
    header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST},
    uri::{Authority, PathAndQuery, Scheme},
    Request, Response, StatusCode, Uri,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use log::warn;

use crate::error::ServerError;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 250;

// Headers that belong to one hop only and must not be forwarded upstream.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A published route target: the parsed upstream URL plus a pre-built,
/// connection-pooling HTTP client pinned to it. Immutable once installed,
/// shared read-only by every concurrent request for its hostname.
pub(crate) struct UpstreamEntry {
    target: Uri,
    scheme: Scheme,
    authority: Authority,
    host_header: HeaderValue,
    client: Client<HttpConnector, Body>,
    created_at: DateTime<Utc>,
    log_errors: bool,
}

impl UpstreamEntry {
    // Target can be "host:port" or "http(s)://host[:port]"; a missing
    // scheme defaults to plain HTTP, as tunneled endpoints are local.
    pub(crate) fn new(target: &str, log_errors: bool) -> Result<Self, ServerError> {
        let raw = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_owned()
        } else {
            format!("http://{target}")
        };
        let target: Uri = raw.parse().map_err(|_| ServerError::InvalidUpstream)?;
        let scheme = target.scheme().cloned().ok_or(ServerError::InvalidUpstream)?;
        let authority = target
            .authority()
            .cloned()
            .ok_or(ServerError::InvalidUpstream)?;
        let host_header = HeaderValue::from_str(authority.as_str())
            .map_err(|_| ServerError::InvalidUpstream)?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        connector.set_keepalive(Some(KEEPALIVE_INTERVAL));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(connector);

        Ok(UpstreamEntry {
            target,
            scheme,
            authority,
            host_header,
            client,
            created_at: Utc::now(),
            log_errors,
        })
    }

    pub(crate) fn target(&self) -> &Uri {
        &self.target
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Stream one request to the pinned target and stream the response
    /// back. Transport failures become a 502, never a panic of the serving
    /// task.
    pub(crate) async fn forward<B>(&self, request: Request<B>) -> Response<Body>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<axum::BoxError>,
    {
        let (mut parts, body) = request.into_parts();
        strip_hop_by_hop_headers(&mut parts.headers);
        parts.headers.insert(HOST, self.host_header.clone());

        let mut uri = parts.uri.into_parts();
        uri.scheme = Some(self.scheme.clone());
        uri.authority = Some(self.authority.clone());
        if uri.path_and_query.is_none() {
            uri.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        parts.uri = match Uri::from_parts(uri) {
            Ok(uri) => uri,
            Err(error) => {
                if self.log_errors {
                    warn!("proxy error: upstream={} {}", self.target, error);
                }
                return bad_gateway();
            }
        };

        match self
            .client
            .request(Request::from_parts(parts, Body::new(body)))
            .await
        {
            Ok(response) => response.into_response(),
            Err(error) => {
                if self.log_errors {
                    warn!("proxy error: upstream={} {}", self.target, error);
                }
                bad_gateway()
            }
        }
    }
}

fn bad_gateway() -> Response<Body> {
    (StatusCode::BAD_GATEWAY, "upstream gateway error").into_response()
}

// Standard reverse-proxy hygiene: drop the fixed hop-by-hop set plus any
// header named in the Connection header itself.
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let connection_options: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in connection_options {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

#[cfg(test)]
mod upstream_entry_tests {
    use http::{header::HeaderValue, Request, StatusCode};
    use http_body_util::BodyExt;

    use super::{strip_hop_by_hop_headers, UpstreamEntry};

    #[test]
    fn prepends_scheme_when_missing() {
        let entry = UpstreamEntry::new("127.0.0.1:3000", false).unwrap();
        assert_eq!(entry.target().to_string(), "http://127.0.0.1:3000/");
    }

    #[test]
    fn keeps_explicit_scheme() {
        let entry = UpstreamEntry::new("https://upstream.internal:8443", false).unwrap();
        assert_eq!(entry.target().scheme_str(), Some("https"));
    }

    #[test]
    fn rejects_unparseable_target() {
        assert!(UpstreamEntry::new("not a target", false).is_err());
        assert!(UpstreamEntry::new("http://", false).is_err());
    }

    #[test]
    fn strips_hop_by_hop_and_connection_named_headers() {
        let mut request = Request::builder()
            .header("connection", "close, x-custom-hop")
            .header("x-custom-hop", "1")
            .header("keep-alive", "timeout=5")
            .header("transfer-encoding", "chunked")
            .header("x-end-to-end", "1")
            .body(())
            .unwrap();
        strip_hop_by_hop_headers(request.headers_mut());
        let headers = request.headers();
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(
            headers.get("x-end-to-end"),
            Some(&HeaderValue::from_static("1"))
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_returns_bad_gateway() {
        let entry = UpstreamEntry::new("127.0.0.1:1", false).unwrap();
        let request = Request::builder()
            .method("GET")
            .uri("/healthz")
            .body(String::new())
            .unwrap();
        let response = entry.forward(request).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"upstream gateway error");
    }
}
