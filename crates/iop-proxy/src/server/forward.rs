//! Request forwarding to upstreams.
//!
//! Bodies stream in both directions; nothing is buffered. WebSocket
//! (and any other `Upgrade:`) requests are tunnelled by completing the
//! handshake on both sides and then copying bytes until either side
//! hangs up.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::copy_bidirectional;
use tracing::{debug, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;
pub type UpstreamClient = Client<HttpConnector, Incoming>;

/// Headers that describe the connection rather than the request; never
/// forwarded on the non-upgrade path.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn upstream_client() -> UpstreamClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{message}\n")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Forward one request to `target` (`host:port`), streaming the
/// response back. `timeout` bounds the whole exchange up to response
/// headers; streaming bodies are not cut off mid-flight.
pub async fn forward(
    client: &UpstreamClient,
    mut req: Request<Incoming>,
    target: &str,
    external_host: &str,
    client_ip: IpAddr,
    timeout: Duration,
) -> Response<ProxyBody> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let uri: Uri = match format!("http://{target}{path_and_query}").parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(target, "[PROXY] bad upstream uri: {e}");
            return status_response(StatusCode::BAD_GATEWAY, "bad upstream target");
        }
    };

    let upgrading = is_upgrade(&req);
    set_forwarding_headers(&mut req, external_host, client_ip, upgrading);
    *req.uri_mut() = uri;

    if upgrading {
        return forward_upgrade(req, target).await;
    }

    match tokio::time::timeout(timeout, client.request(req)).await {
        Ok(Ok(response)) => response.map(BodyExt::boxed),
        Ok(Err(e)) => {
            warn!(target, host = external_host, "[PROXY] upstream error: {e}");
            status_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
        Err(_) => {
            warn!(target, host = external_host, "[PROXY] upstream timed out");
            status_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out")
        }
    }
}

fn is_upgrade(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
        && req.headers().contains_key(hyper::header::UPGRADE)
}

fn set_forwarding_headers(
    req: &mut Request<Incoming>,
    external_host: &str,
    client_ip: IpAddr,
    keep_upgrade: bool,
) {
    rewrite_headers(req.headers_mut(), external_host, client_ip, keep_upgrade);
}

/// Strip hop-by-hop headers (unless tunnelling an upgrade) and stamp
/// the standard forwarding trio.
fn rewrite_headers(
    headers: &mut hyper::HeaderMap,
    external_host: &str,
    client_ip: IpAddr,
    keep_upgrade: bool,
) {
    if !keep_upgrade {
        for name in HOP_BY_HOP {
            headers.remove(*name);
        }
    }

    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("https"),
    );
    if let Ok(value) = HeaderValue::from_str(external_host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
}

/// Tunnel an upgrade request: complete the 101 exchange on both sides,
/// then splice the two upgraded connections together.
async fn forward_upgrade(mut req: Request<Incoming>, target: &str) -> Response<ProxyBody> {
    let downstream_upgrade = hyper::upgrade::on(&mut req);

    let stream = match tokio::net::TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(target, "[PROXY] upgrade connect failed: {e}");
            return status_response(StatusCode::BAD_GATEWAY, "upstream unreachable");
        }
    };

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
    {
        Ok(parts) => parts,
        Err(e) => {
            warn!(target, "[PROXY] upgrade handshake failed: {e}");
            return status_response(StatusCode::BAD_GATEWAY, "upstream handshake failed");
        }
    };
    tokio::spawn(conn.with_upgrades());

    let mut response = match sender.send_request(req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(target, "[PROXY] upgrade request failed: {e}");
            return status_response(StatusCode::BAD_GATEWAY, "upstream request failed");
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        // The upstream declined the upgrade; relay its answer as-is.
        return response.map(BodyExt::boxed);
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    tokio::spawn(async move {
        let upstream = match upstream_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!("[PROXY] upstream upgrade dropped: {e}");
                return;
            }
        };
        let downstream = match downstream_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!("[PROXY] downstream upgrade dropped: {e}");
                return;
            }
        };
        let mut upstream = TokioIo::new(upstream);
        let mut downstream = TokioIo::new(downstream);
        if let Err(e) = copy_bidirectional(&mut downstream, &mut upstream).await {
            debug!("[PROXY] upgrade tunnel closed: {e}");
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, empty_body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::HeaderMap;

    #[test]
    fn status_response_carries_text() {
        let response = status_response(StatusCode::NOT_FOUND, "no route for host");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn hop_by_hop_headers_are_stripped_and_forwarding_set() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        rewrite_headers(
            &mut headers,
            "demo.example",
            "203.0.113.9".parse().unwrap(),
            false,
        );

        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("transfer-encoding"));
        assert_eq!(headers["accept"], "*/*");
        assert_eq!(headers["x-forwarded-for"], "203.0.113.9");
        assert_eq!(headers["x-forwarded-proto"], "https");
        assert_eq!(headers["x-forwarded-host"], "demo.example");
    }

    #[test]
    fn existing_forwarded_for_is_appended() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.7"));
        rewrite_headers(
            &mut headers,
            "demo.example",
            "203.0.113.9".parse().unwrap(),
            false,
        );
        assert_eq!(headers["x-forwarded-for"], "198.51.100.7, 203.0.113.9");
    }

    #[test]
    fn upgrade_tunnels_keep_connection_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        rewrite_headers(
            &mut headers,
            "demo.example",
            "203.0.113.9".parse().unwrap(),
            true,
        );
        assert_eq!(headers["connection"], "Upgrade");
        assert_eq!(headers["upgrade"], "websocket");
    }
}
