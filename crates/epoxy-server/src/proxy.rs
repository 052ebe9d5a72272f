//! The extension reverse-proxy.
//!
//! The proxy rewrites a client request into the canonical extension
//! envelope and forwards it to the registered backend. The original client
//! body is discarded wholesale; unrelated client headers travel with the
//! request. The backend's status and body are relayed to the client
//! verbatim, streamed rather than buffered. Fire-and-forward: no caching,
//! no retries.

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderName, Response};

use crate::error::BootError;

/// Hop-by-hop headers that must not cross the proxy in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Forwards `envelope` to `url` and relays the backend response.
///
/// # Errors
///
/// Returns [`BootError::BadGateway`] when the backend cannot be reached and
/// [`BootError::Internal`] if the relayed response cannot be assembled.
pub async fn forward(
    client: &reqwest::Client,
    url: reqwest::Url,
    envelope: String,
    client_headers: &HeaderMap,
) -> Result<Response<Body>, BootError> {
    // Carry the client's headers along, except those tied to the transport
    // or to the body we are replacing.
    let mut headers = HeaderMap::new();
    for (name, value) in client_headers {
        if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let backend = client
        .post(url)
        .headers(headers)
        .body(envelope)
        .send()
        .await
        .map_err(|err| BootError::BadGateway(err.to_string()))?;

    let mut response = Response::builder().status(backend.status());
    for (name, value) in backend.headers() {
        if !is_hop_by_hop(name) {
            response = response.header(name, value);
        }
    }
    response
        .body(Body::from_stream(backend.bytes_stream()))
        .map_err(|err| BootError::Internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("x-custom")));
    }
}
