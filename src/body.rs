//! Body plumbing shared by the fetchers, the codec and both listeners.
//!
//! Every component speaks [`ProxyBody`], a boxed streaming body. Request
//! bodies are single-pass, so the smart fetcher wraps them in a
//! [`BodyRecorder`] before the direct attempt and replays the recording if it
//! has to fall back to the relay.

use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use crate::error::FetchError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Default cap on how much of a request body is kept for replay (8 MiB).
pub const DEFAULT_REPLAY_LIMIT: usize = 8 * 1024 * 1024;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// Adapter that makes a [`ProxyBody`] `Sync` so it can be handed to reqwest.
///
/// The body is only ever polled through `&mut self`, so the mutex is never
/// contended.
pub struct SyncBody {
    inner: Mutex<ProxyBody>,
    hint: SizeHint,
    ended: bool,
}

impl SyncBody {
    pub fn new(body: ProxyBody) -> Self {
        let hint = body.size_hint();
        let ended = body.is_end_stream();
        Self {
            inner: Mutex::new(body),
            hint,
            ended,
        }
    }
}

impl Body for SyncBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = &mut *self;
        let inner = match this.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let polled = ready!(Pin::new(&mut *inner).poll_frame(cx));
        this.hint = inner.size_hint();
        this.ended = inner.is_end_stream();
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.ended
    }

    fn size_hint(&self) -> SizeHint {
        self.hint.clone()
    }
}

/// A body that yields `head` first and then everything from `rest`.
pub struct PrefixedBody {
    head: Option<Bytes>,
    rest: ProxyBody,
}

impl PrefixedBody {
    pub fn new(head: Bytes, rest: ProxyBody) -> Self {
        let head = if head.is_empty() { None } else { Some(head) };
        Self { head, rest }
    }
}

impl Body for PrefixedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        if let Some(head) = self.head.take() {
            return Poll::Ready(Some(Ok(Frame::data(head))));
        }
        Pin::new(&mut self.rest).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.head.is_none() && self.rest.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let head = self.head.as_ref().map_or(0, |h| h.len() as u64);
        let rest = self.rest.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(rest.lower() + head);
        if let Some(upper) = rest.upper() {
            hint.set_upper(upper + head);
        }
        hint
    }
}

struct Recording {
    source: Option<ProxyBody>,
    recorded: BytesMut,
    overflowed: bool,
    finished: bool,
}

impl Recording {
    fn record(&mut self, data: &Bytes, limit: usize) {
        if self.overflowed {
            return;
        }
        if self.recorded.len() + data.len() > limit {
            self.overflowed = true;
            self.recorded = BytesMut::new();
            return;
        }
        self.recorded.extend_from_slice(data);
    }
}

/// Records a request body while it streams to a first attempt, so it can be
/// replayed to a second one.
///
/// At most `limit` bytes are kept. Once a body grows past the limit the
/// recording is dropped and [`BodyRecorder::reborn`] fails with
/// [`FetchError::BodyTooLarge`].
pub struct BodyRecorder {
    shared: Arc<Mutex<Recording>>,
    limit: usize,
}

impl BodyRecorder {
    pub fn new(body: ProxyBody, limit: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Recording {
                source: Some(body),
                recorded: BytesMut::new(),
                overflowed: false,
                finished: false,
            })),
            limit,
        }
    }

    /// The body handed to the first attempt. Frames are recorded as they
    /// pass through.
    pub fn tap(&self) -> ProxyBody {
        RecordingBody {
            shared: self.shared.clone(),
            limit: self.limit,
        }
        .boxed_unsync()
    }

    /// Bytes recorded so far.
    pub fn recorded_len(&self) -> usize {
        lock(&self.shared).recorded.len()
    }

    /// Builds a fresh, replayable body: everything recorded so far followed
    /// by whatever the first attempt left unread.
    pub async fn reborn(self) -> Result<ProxyBody, FetchError> {
        let (remainder, finished) = {
            let mut recording = lock(&self.shared);
            (recording.source.take(), recording.finished)
        };

        if let (Some(remainder), false) = (remainder, finished) {
            let rest = Limited::collect(remainder, self.limit)
                .await
                .map_err(|e| match e {
                    LimitedError::TooLarge => FetchError::BodyTooLarge { limit: self.limit },
                    LimitedError::Body(e) => FetchError::Body(e.to_string()),
                })?;
            lock(&self.shared).record(&rest, self.limit);
        }

        let mut recording = lock(&self.shared);
        if recording.overflowed {
            return Err(FetchError::BodyTooLarge { limit: self.limit });
        }
        let data = std::mem::take(&mut recording.recorded).freeze();
        Ok(full(data))
    }
}

fn lock(shared: &Mutex<Recording>) -> MutexGuard<'_, Recording> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct RecordingBody {
    shared: Arc<Mutex<Recording>>,
    limit: usize,
}

impl Body for RecordingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let mut recording = lock(&self.shared);
        let polled = match recording.source.as_mut() {
            Some(source) => ready!(Pin::new(source).poll_frame(cx)),
            None => return Poll::Ready(None),
        };
        match polled {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    recording.record(data, self.limit);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e))),
            None => {
                recording.finished = true;
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        let recording = lock(&self.shared);
        recording.finished || recording.source.as_ref().map_or(true, |s| s.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        lock(&self.shared)
            .source
            .as_ref()
            .map_or_else(|| SizeHint::with_exact(0), |s| s.size_hint())
    }
}

enum LimitedError {
    TooLarge,
    Body(BoxError),
}

/// Collects a body into memory, refusing to go past `limit` bytes.
struct Limited;

impl Limited {
    async fn collect(mut body: ProxyBody, limit: usize) -> Result<Bytes, LimitedError> {
        let mut buf = BytesMut::new();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(LimitedError::Body)?;
            if let Ok(data) = frame.into_data() {
                if buf.len() + data.len() > limit {
                    return Err(LimitedError::TooLarge);
                }
                buf.extend_from_slice(&data);
            }
        }
        Ok(buf.freeze())
    }
}

/// Collects a body into memory with an upper bound, for envelopes.
pub async fn collect_limited<B>(body: B, limit: usize) -> Result<Bytes, crate::error::CodecError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    Limited::collect(boxed(body), limit)
        .await
        .map_err(|e| match e {
            LimitedError::TooLarge => crate::error::CodecError::TooLarge { limit },
            LimitedError::Body(e) => crate::error::CodecError::Body(e.to_string()),
        })
}
