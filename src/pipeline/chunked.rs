//! Chunked response writer (`chunkWriter` stage).
//!
//! # Responsibilities
//! - Re-slice response DATA frames to at most `output_content_buffer_size`
//! - Pass trailers and errors through untouched
//!
//! # Design Decisions
//! - Slices share the original allocation (`Bytes::split_to`)
//! - The codec polls the body only when the socket is writable, so a slow
//!   reader stalls the producer instead of growing a buffer

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use hyper::Request;
use tower::util::BoxCloneService;

use crate::http::body::{self, Body, BoxError};
use crate::pipeline::{HttpService, Stage, StageKind};

/// Body adapter emitting DATA frames no larger than `max_frame`.
pub struct ChunkedBody {
    inner: Body,
    pending: Bytes,
    max_frame: usize,
}

impl ChunkedBody {
    pub fn new(inner: Body, max_frame: usize) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            max_frame: max_frame.max(1),
        }
    }

    fn next_slice(&mut self) -> Bytes {
        let n = self.pending.len().min(self.max_frame);
        self.pending.split_to(n)
    }
}

impl HttpBody for ChunkedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();

        if !this.pending.is_empty() {
            return Poll::Ready(Some(Ok(Frame::data(this.next_slice()))));
        }

        loop {
            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) if data.is_empty() => continue,
                    Ok(data) => {
                        this.pending = data;
                        return Poll::Ready(Some(Ok(Frame::data(this.next_slice()))));
                    }
                    Err(frame) => return Poll::Ready(Some(Ok(frame))),
                },
                other => return Poll::Ready(other),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_empty() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let inner = self.inner.size_hint();
        let pending = self.pending.len() as u64;
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + pending);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + pending);
        }
        hint
    }
}

#[derive(Debug, Clone)]
pub struct ChunkWriter {
    max_frame: usize,
}

impl ChunkWriter {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Stage for ChunkWriter {
    fn kind(&self) -> StageKind {
        StageKind::ChunkWriter
    }

    fn wrap(&self, inner: HttpService) -> HttpService {
        let max_frame = self.max_frame;
        BoxCloneService::new(tower::service_fn(move |req: Request<Body>| {
            let inner = inner.clone();
            async move {
                let response = match super::oneshot(inner, req).await {
                    Ok(response) => response,
                    Err(never) => match never {},
                };
                Ok::<_, Infallible>(response.map(|b| body::boxed(ChunkedBody::new(b, max_frame))))
            }
        }))
    }
}
