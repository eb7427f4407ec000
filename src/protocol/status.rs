use http::{header, HeaderValue, Response, StatusCode};

use crate::body::{self, ProxyBody};

/// Written to a raw client stream once its tunnel is up.
pub const OK_200: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

pub fn status_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(body::full(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub fn gateway_timeout() -> Response<ProxyBody> {
    status_response(StatusCode::GATEWAY_TIMEOUT, "Gateway timeout")
}
