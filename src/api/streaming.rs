//! Streaming passthrough for upstream responses.
//!
//! When a response streams, status and headers go out as soon as the
//! upstream head arrives and body chunks are copied to the caller one at a
//! time, never accumulated. The wrapper stream tracks first-byte latency,
//! sniffs SSE frames for token usage, and finalizes the request log record
//! exactly once, whether the stream completes, fails, or the caller
//! disconnects mid-body (drop without completion, no cooldown involved).

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::core::header_policy::inbound_response_headers;
use crate::core::request_log::{
    RequestLogRecord, RequestLogRing, UsageSniffer, STREAMED_BODY_MARKER,
};

/// Everything the stream needs to finalize its log record.
pub struct StreamLogContext {
    pub ring: Arc<RequestLogRing>,
    pub record: RequestLogRecord,
    pub request_start: Instant,
}

struct PassthroughState {
    ctx: Option<StreamLogContext>,
    sniffer: UsageSniffer,
    first_chunk_at: Option<Instant>,
    completed: bool,
}

impl PassthroughState {
    fn finalize(&mut self) {
        let Some(ctx) = self.ctx.take() else { return };
        let StreamLogContext {
            ring,
            mut record,
            request_start,
        } = ctx;

        record.is_streaming = true;
        record.latency_ms = Some(request_start.elapsed().as_millis() as u64);
        record.first_token_ms = self
            .first_chunk_at
            .map(|at| (at - request_start).as_millis() as u64);
        record.response_body = Some(STREAMED_BODY_MARKER.to_string());
        std::mem::take(&mut self.sniffer).finish().apply_to(&mut record);

        if !self.completed {
            tracing::debug!(
                request_id = %record.request_id,
                "Stream ended before upstream completion (caller disconnect or upstream error)"
            );
        }
        ring.push(record);
    }
}

/// Byte stream copied from the upstream response to the caller.
struct PassthroughStream<S> {
    inner: S,
    state: PassthroughState,
}

impl<S, E> Stream for PassthroughStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
{
    type Item = std::result::Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if this.state.first_chunk_at.is_none() && !chunk.is_empty() {
                    this.state.first_chunk_at = Some(Instant::now());
                }
                this.state.sniffer.feed(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => Poll::Ready(Some(Err(error))),
            Poll::Ready(None) => {
                this.state.completed = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for PassthroughStream<S> {
    fn drop(&mut self) {
        self.state.finalize();
    }
}

/// Build the caller-facing streaming response from an upstream response.
pub fn passthrough_response(upstream: reqwest::Response, ctx: StreamLogContext) -> Response {
    let status = upstream.status();
    let headers = inbound_response_headers(upstream.headers());

    let stream = PassthroughStream {
        inner: upstream.bytes_stream().boxed(),
        state: PassthroughState {
            ctx: Some(ctx),
            sniffer: UsageSniffer::default(),
            first_chunk_at: None,
            completed: false,
        },
    };

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn test_ctx(ring: Arc<RequestLogRing>) -> StreamLogContext {
        StreamLogContext {
            ring,
            record: RequestLogRecord {
                request_id: "req-1".to_string(),
                endpoint: "/v1/chat/completions".to_string(),
                status_code: Some(200),
                ..Default::default()
            },
            request_start: Instant::now(),
        }
    }

    fn chunk_stream(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    #[tokio::test]
    async fn test_passthrough_preserves_bytes_and_logs() {
        let ring = Arc::new(RequestLogRing::new(10));
        let mut stream = PassthroughStream {
            inner: chunk_stream(vec![
                b"data: {\"delta\":\"a\"}\n\n".as_slice(),
                b"data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n\n".as_slice(),
                b"data: [DONE]\n\n".as_slice(),
            ]),
            state: PassthroughState {
                ctx: Some(test_ctx(ring.clone())),
                sniffer: UsageSniffer::default(),
                first_chunk_at: None,
                completed: false,
            },
        };

        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        drop(stream);

        assert!(collected.starts_with(b"data: {\"delta\":\"a\"}"));
        assert!(collected.ends_with(b"data: [DONE]\n\n"));

        let records = ring.recent(10);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.is_streaming);
        assert_eq!(record.status_code, Some(200));
        assert_eq!(record.response_body.as_deref(), Some(STREAMED_BODY_MARKER));
        assert!(record.first_token_ms.is_some());
        assert_eq!(record.tokens_total, Some(4));
    }

    #[tokio::test]
    async fn test_drop_mid_stream_still_logs_once() {
        let ring = Arc::new(RequestLogRing::new(10));
        let mut stream = PassthroughStream {
            inner: chunk_stream(vec![b"data: {\"delta\":\"a\"}\n\n".as_slice()]),
            state: PassthroughState {
                ctx: Some(test_ctx(ring.clone())),
                sniffer: UsageSniffer::default(),
                first_chunk_at: None,
                completed: false,
            },
        };

        // Consume one chunk, then drop without draining.
        let _ = stream.next().await;
        drop(stream);

        let records = ring.recent(10);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_streaming);
    }
}
