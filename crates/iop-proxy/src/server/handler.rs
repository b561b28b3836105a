//! Request handling for the public listeners.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use tracing::{debug, info};

use super::ProxyContext;
use super::forward::{self, ProxyBody, full_body, status_response};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Port 80: ACME challenges are answered, everything else is redirected
/// to https (404 for hosts we do not serve).
pub async fn handle_http(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let path = req.uri().path().to_string();

    if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
        return match ctx.challenges.response_for(token) {
            Some(key_authorization) => {
                info!(token, "[ACME] served http-01 challenge");
                let mut response = Response::new(full_body(key_authorization));
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                response
            }
            None => status_response(StatusCode::NOT_FOUND, "unknown challenge token"),
        };
    }

    let Some(host) = request_host(&req) else {
        return status_response(StatusCode::NOT_FOUND, "missing host header");
    };

    let known = ctx
        .store
        .read(|state| state.routes.contains_key(&host))
        .await;
    if !known {
        return status_response(StatusCode::NOT_FOUND, "unknown host");
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{host}{path_and_query}");
    match HeaderValue::from_str(&location) {
        Ok(value) => {
            let mut response = Response::new(forward::empty_body());
            *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
            response
                .headers_mut()
                .insert(hyper::header::LOCATION, value);
            response
        }
        // The host already passed the route-table lookup, so this only
        // trips on a request line that smuggled non-header bytes.
        Err(_) => status_response(StatusCode::NOT_FOUND, "unknown host"),
    }
}

/// Port 443, after TLS: look up the route for the SNI host and
/// reverse-proxy to its target.
pub async fn handle_https(
    ctx: Arc<ProxyContext>,
    sni: Option<String>,
    client_ip: IpAddr,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let host = match sni.or_else(|| request_host(&req)) {
        Some(host) => host,
        None => return status_response(StatusCode::NOT_FOUND, "no host"),
    };

    let route = ctx
        .store
        .read(|state| state.routes.get(&host).cloned())
        .await;
    let Some(route) = route else {
        debug!(host, "[PROXY] no route for host");
        return status_response(StatusCode::NOT_FOUND, "unknown host");
    };

    if !route.health.is_healthy() {
        debug!(host, "[PROXY] upstream not healthy, short-circuiting");
        return status_response(StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable");
    }

    let timeout = route
        .request_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(ctx.default_timeout);

    forward::forward(&ctx.client, req, &route.target, &host, client_ip, timeout).await
}

/// Lowercased `Host` header without any port suffix.
fn request_host(req: &Request<Incoming>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())?;
    let host = raw.rsplit_once(':').map(|(h, _)| h).unwrap_or(raw);
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}
