//! HTTP/1.1 wire form of a proxied request.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::{Method, Request, Uri, Version};

use crate::error::CodecError;

const MAX_HEADERS: usize = 128;

static HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Serializes a request head and body with an absolute-URI request line and
/// a `Content-Length` framed body.
pub fn write_request(parts: &Parts, body: &[u8]) -> Result<Bytes, CodecError> {
    if parts.uri.scheme().is_none() || parts.uri.authority().is_none() {
        return Err(CodecError::InvalidUri(parts.uri.to_string()));
    }

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);

    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(parts.method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(parts.uri.to_string().as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !headers.contains_key(header::HOST) {
        if let Some(authority) = parts.uri.authority() {
            put_header(&mut buf, "host", authority.as_str().as_bytes());
        }
    }
    for (name, value) in &headers {
        put_header(&mut buf, name.as_str(), value.as_bytes());
    }
    if !body.is_empty() || method_allows_body(&parts.method) {
        put_header(&mut buf, "content-length", body.len().to_string().as_bytes());
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
    Ok(buf.freeze())
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

fn method_allows_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Parses the output of [`write_request`].
pub fn parse_request(data: &[u8]) -> Result<Request<Bytes>, CodecError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut slots);
    let head_len = match parsed.parse(data) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Err(CodecError::Incomplete),
        Err(e) => return Err(CodecError::Parse(e.to_string())),
    };

    let method = parsed
        .method
        .ok_or(CodecError::Incomplete)
        .and_then(|m| Method::from_bytes(m.as_bytes()).map_err(|e| CodecError::Parse(e.to_string())))?;
    let target = parsed.path.ok_or(CodecError::Incomplete)?;
    let uri: Uri = target
        .parse()
        .map_err(|_| CodecError::InvalidUri(target.to_string()))?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(CodecError::InvalidUri(target.to_string()));
    }
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| CodecError::Parse(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|e| CodecError::Parse(e.to_string()))?;
        headers.append(name, value);
    }
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return Err(CodecError::Parse(
            "transfer-encoding is not allowed in an envelope".into(),
        ));
    }

    let content_length = match headers.get(header::CONTENT_LENGTH) {
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or_else(|| CodecError::Parse("invalid content-length".into()))?,
        None => 0,
    };
    let rest = &data[head_len..];
    if rest.len() < content_length {
        return Err(CodecError::Incomplete);
    }
    let body = Bytes::copy_from_slice(&rest[..content_length]);

    let mut request = Request::new(body);
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = version;
    *request.headers_mut() = headers;
    Ok(request)
}
