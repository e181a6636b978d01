//! The shared streaming proxy primitive.
//!
//! Used by the gateway for registered routes and by the registry for
//! `service-call`: filter the inbound headers through an allow-list, append
//! this hop to the forwarded chain, pipe the request body to the target
//! without buffering, and pipe the target's status, headers, and body back.
//!
//! An upstream failure before response headers arrive surfaces as 502; a
//! failure mid-stream simply ends the body, since the status line is
//! already on the wire.

use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::error::YamfError;
use crate::forwarded;

/// Standard request headers that cross the proxy unchanged. Everything not
/// listed here (and not a `yamf-*` header) is dropped.
const ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "authorization",
    "cache-control",
    "content-type",
    "cookie",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-range",
    "if-unmodified-since",
    "range",
    "user-agent",
];

/// Response headers that must not be relayed hop-to-hop.
const STRIPPED_RESPONSE_HEADERS: &[&str] =
    &["connection", "keep-alive", "transfer-encoding", "upgrade", "trailer"];

fn is_forwardable(name: &str) -> bool {
    name.starts_with("yamf-") || ALLOWED_HEADERS.contains(&name)
}

/// Build the outbound header set: allow-listed inbound headers plus the
/// appended forwarded hop.
fn outbound_headers(inbound: &HeaderMap, sender: &str, by: &str) -> HeaderMap {
    let mut outbound = HeaderMap::new();
    for (name, value) in inbound {
        let lower = name.as_str().to_ascii_lowercase();
        if is_forwardable(&lower) {
            outbound.append(name.clone(), value.clone());
        }
    }
    // Carry the existing chain across so append_hop extends rather than restarts it.
    for chain_header in [
        forwarded::FORWARDED,
        forwarded::X_FORWARDED_FOR,
        forwarded::X_FORWARDED_HOST,
        forwarded::X_FORWARDED_PROTO,
    ] {
        if let Some(value) = inbound.get(chain_header) {
            outbound.insert(axum::http::HeaderName::from_static(chain_header), value.clone());
        }
    }
    let original_host = inbound
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    forwarded::append_hop(&mut outbound, sender, by, original_host.as_deref(), "http");
    outbound
}

/// Stream-proxy `request` to `target_base`, preserving the original path
/// and query. `sender` is the peer the request came from; `by` names this
/// hop in the forwarded chain.
pub async fn proxy_request(
    http: &reqwest::Client,
    target_base: &str,
    request: Request,
    sender: &str,
    by: &str,
) -> Response {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target_url = format!("{}{}", target_base.trim_end_matches('/'), path_and_query);

    let headers = outbound_headers(&parts.headers, sender, by);

    let upstream = http
        .request(parts.method, &target_url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(target = %target_url, error = %e, "upstream unreachable");
            let err = if e.is_timeout() {
                YamfError::Timeout(format!("upstream timed out: {target_url}"))
            } else {
                YamfError::Proxy(format!("upstream unreachable: {target_url}"))
            };
            return err.into_response();
        }
    };

    let mut builder = Response::builder().status(upstream.status());
    if let Some(response_headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
                response_headers.append(name.clone(), value.clone());
            }
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| {
            YamfError::Internal("failed to assemble proxied response".to_string()).into_response()
        })
}
