use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::Full;
use hyper::ext::ReasonPhrase;
use hyper::header::{CONNECTION, CONTENT_TYPE, HeaderName, HeaderValue};
use hyper::{HeaderMap, Response, StatusCode};

/// Body type of every response the proxy writes to a client.
pub type ProxyBody = Full<Bytes>;

// Headers that describe one hop and must not be forwarded.
static HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in Connection are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Canned client-facing responses.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Acknowledgement for a CONNECT whose origin connection is ready.
    pub fn connection_established() -> Response<ProxyBody> {
        let mut response = Response::new(Full::new(Bytes::new()));
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        response
    }

    /// Local rejection of a request the proxy does not handle. The client is
    /// told not to keep the connection alive.
    pub fn bad_request(message: &str) -> Response<ProxyBody> {
        let mut response = Self::error(StatusCode::BAD_REQUEST, message);
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        response
    }

    pub fn proxy_error(err: &ProxyError) -> Response<ProxyBody> {
        Self::error(err.status_code(), &format!("Proxy Error: {}", err))
    }

    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }
}
