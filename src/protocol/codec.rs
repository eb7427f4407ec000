//! Relay envelopes.
//!
//! A request envelope is the whole request in wire form, passed through the
//! transform and POSTed to the relay. A response envelope is the body of the
//! relay's `200 OK`: a 4-byte big-endian length, that many bytes of
//! transformed JSON metadata, then the origin body streamed as-is.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Body;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::transform::{Identity, WireTransform};
use super::wire;
use crate::body::{self, BoxError, PrefixedBody, ProxyBody};
use crate::error::CodecError;

/// Default bound on a request envelope and on response metadata.
pub const DEFAULT_MAX_ENVELOPE: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
struct ResponseMeta {
    status: u16,
    version: String,
    headers: Vec<(String, Vec<u8>)>,
    content_length: Option<u64>,
}

#[derive(Clone)]
pub struct TunnelCodec {
    transform: Arc<dyn WireTransform>,
    max_envelope: usize,
}

impl Default for TunnelCodec {
    fn default() -> Self {
        Self::new(Arc::new(Identity))
    }
}

impl TunnelCodec {
    pub fn new(transform: Arc<dyn WireTransform>) -> Self {
        Self {
            transform,
            max_envelope: DEFAULT_MAX_ENVELOPE,
        }
    }

    pub fn with_max_envelope(mut self, max_envelope: usize) -> Self {
        self.max_envelope = max_envelope;
        self
    }

    /// Wraps `req` as the body of a POST to `remote`.
    pub async fn marshal_request(
        &self,
        req: Request<ProxyBody>,
        remote: &Uri,
    ) -> Result<Request<Bytes>, CodecError> {
        let (parts, payload) = req.into_parts();
        let payload = body::collect_limited(payload, self.max_envelope).await?;
        let sealed = self.transform.seal(wire::write_request(&parts, &payload)?)?;

        Request::post(remote.clone())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(sealed)
            .map_err(|e| CodecError::InvalidUri(e.to_string()))
    }

    /// Relay side: recovers the original request from a POSTed envelope.
    pub async fn unmarshal_request<B>(&self, req: Request<B>) -> Result<Request<Bytes>, CodecError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let sealed = body::collect_limited(req.into_body(), self.max_envelope).await?;
        let plain = self.transform.open(sealed)?;
        wire::parse_request(&plain)
    }

    /// Relay side: wraps an origin response into the `200 OK` envelope.
    /// The origin body is streamed, not buffered.
    pub fn marshal_response<B>(&self, resp: Response<B>) -> Result<Response<ProxyBody>, CodecError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, origin) = resp.into_parts();
        let content_length =
            declared_length(&parts.headers).or_else(|| origin.size_hint().exact());

        let mut headers = parts.headers;
        wire::strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        let meta = ResponseMeta {
            status: parts.status.as_u16(),
            version: format!("{:?}", parts.version),
            headers: headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
            content_length,
        };
        let sealed = self.transform.seal(Bytes::from(serde_json::to_vec(&meta)?))?;
        let len = u32::try_from(sealed.len()).map_err(|_| CodecError::TooLarge {
            limit: u32::MAX as usize,
        })?;

        let mut head = BytesMut::with_capacity(LENGTH_PREFIX + sealed.len());
        head.extend_from_slice(&len.to_be_bytes());
        head.extend_from_slice(&sealed);

        let mut envelope = Response::new(
            PrefixedBody::new(head.freeze(), body::boxed(origin)).boxed_unsync(),
        );
        envelope.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        Ok(envelope)
    }

    /// Local side: rebuilds the origin response from a relay `200 OK`.
    /// `method` is the method of the original request, needed to decide
    /// whether a body can follow.
    pub async fn unmarshal_response<B>(
        &self,
        resp: Response<B>,
        method: &Method,
    ) -> Result<Response<ProxyBody>, CodecError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut stream = body::boxed(resp.into_body());
        let mut buf = BytesMut::new();

        fill(&mut stream, &mut buf, LENGTH_PREFIX).await?;
        let meta_len = buf.get_u32() as usize;
        if meta_len > self.max_envelope {
            return Err(CodecError::TooLarge {
                limit: self.max_envelope,
            });
        }
        fill(&mut stream, &mut buf, meta_len).await?;
        let sealed = buf.split_to(meta_len).freeze();
        let meta: ResponseMeta = serde_json::from_slice(&self.transform.open(sealed)?)?;

        let status = StatusCode::from_u16(meta.status)
            .map_err(|e| CodecError::Parse(format!("status {}: {e}", meta.status)))?;
        let mut headers = HeaderMap::with_capacity(meta.headers.len());
        for (name, value) in &meta.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CodecError::Parse(e.to_string()))?;
            let value =
                HeaderValue::from_bytes(value).map_err(|e| CodecError::Parse(e.to_string()))?;
            headers.append(name, value);
        }

        let bodiless = *method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        if let Some(len) = meta.content_length {
            if status != StatusCode::NO_CONTENT && !status.is_informational() {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
        }

        let payload = if bodiless {
            body::empty()
        } else {
            PrefixedBody::new(buf.freeze(), stream).boxed_unsync()
        };

        let mut response = Response::new(payload);
        *response.status_mut() = status;
        *response.version_mut() = if meta.version == "HTTP/1.0" {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Reads from `stream` until `buf` holds at least `need` bytes.
async fn fill(stream: &mut ProxyBody, buf: &mut BytesMut, need: usize) -> Result<(), CodecError> {
    while buf.len() < need {
        match stream.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    buf.extend_from_slice(&data);
                }
            }
            Some(Err(e)) => return Err(CodecError::Body(e.to_string())),
            None => return Err(CodecError::Incomplete),
        }
    }
    Ok(())
}
