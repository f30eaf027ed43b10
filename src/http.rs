use std::{collections::BTreeMap, sync::Arc, time::Instant};

use axum::{body::Body, response::IntoResponse};
use bytes::Bytes;
use http::{
    header::{HeaderValue, CONTENT_TYPE, HOST},
    Request, Response, StatusCode,
};
use log::{error, info};

use crate::{error::ServerError, routing::RoutingTable};

pub(crate) const ROUTES_API_PATH: &str = "/api/routes";

const X_TUNNEL_USER: &str = "x-tunnel-user";

pub(crate) struct ProxyConfig {
    pub(crate) routes: Arc<RoutingTable>,
    pub(crate) zone: String,
    pub(crate) log_requests: bool,
}

/// Front-door handler: derive the lookup key from the request authority,
/// enforce the zone suffix, look up the route, and hand the request to the
/// entry's pre-built forwarder. Bodies are streamed, never buffered here.
pub(crate) async fn proxy_handler<B>(request: Request<B>, proxy: Arc<ProxyConfig>) -> Response<Body>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    let timer = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = match route_request(request, &proxy).await {
        Ok(response) => response,
        Err(error @ ServerError::InvalidHost) => {
            (StatusCode::BAD_REQUEST, error.to_string()).into_response()
        }
        Err(error) => {
            error!("unexpected routing error: {error}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    };
    if proxy.log_requests {
        info!(
            "[{}] {} {} ({:?})",
            response.status().as_u16(),
            method,
            uri,
            timer.elapsed()
        );
    }
    response
}

async fn route_request<B>(
    mut request: Request<B>,
    proxy: &ProxyConfig,
) -> Result<Response<Body>, ServerError>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    let host = request_host(&request)
        .ok_or(ServerError::InvalidHost)?
        .to_owned();
    if !host_in_zone(&host, &proxy.zone) {
        return Err(ServerError::InvalidHost);
    }
    let Some(entry) = proxy.routes.lookup(&host) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    if proxy.log_requests {
        // Cheap tracing header: the first label is the tunnel's user.
        if let Some(user) = host.split('.').next() {
            if let Ok(value) = HeaderValue::from_str(user) {
                request.headers_mut().insert(X_TUNNEL_USER, value);
            }
        }
    }
    Ok(entry.forward(request).await)
}

// The routable key is the authority with any ":port" suffix removed.
fn request_host<B>(request: &Request<B>) -> Option<&str> {
    let authority = match request.headers().get(HOST) {
        Some(host) => host.to_str().ok()?,
        None => request.uri().authority()?.as_str(),
    };
    authority.split(':').next()
}

fn host_in_zone(host: &str, zone: &str) -> bool {
    if zone.is_empty() {
        return true;
    }
    host.strip_suffix(zone)
        .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Admin snapshot of the routing table as pretty-printed JSON.
pub(crate) fn routes_api_handler(routes: &RoutingTable) -> Response<Body> {
    let snapshot: BTreeMap<String, String> = routes.snapshot().into_iter().collect();
    match serde_json::to_string_pretty(&snapshot) {
        Ok(body) => ([(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(error) => {
            error!("error serializing route snapshot: {error}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
