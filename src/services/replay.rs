//! Replayable request bodies
//!
//! An inbound body can only be read once, but a request may be sent upstream
//! with several credentials in turn. [`ReplayBody::split`] turns one source
//! stream into N readers that all yield the same chunks:
//!
//! - the source is pulled lazily, by whichever reader gets ahead first
//! - a chunk stays buffered until every live reader has moved past it
//! - a dropped reader stops holding chunks back
//!
//! A source error is recorded once and reported to every reader that reaches
//! that point.

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reported by a reader when the shared source failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Request body could not be read: {0}")]
pub struct ReplayError(pub String);

const RELEASED: usize = usize::MAX;

struct Buffer {
    source: Option<BoxStream<'static, Result<Bytes, BoxError>>>,
    chunks: VecDeque<Bytes>,
    /// Absolute position of `chunks[0]`
    base: usize,
    failure: Option<ReplayError>,
}

struct Shared {
    buffer: Mutex<Buffer>,
    /// Next absolute position per reader, `RELEASED` once dropped
    cursors: Vec<AtomicUsize>,
}

impl Shared {
    /// Drop buffered chunks that no live reader still needs
    fn trim(&self, buffer: &mut Buffer) {
        let low = self
            .cursors
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .min()
            .unwrap_or(RELEASED);

        while buffer.base < low && !buffer.chunks.is_empty() {
            buffer.chunks.pop_front();
            buffer.base += 1;
        }
    }
}

/// Splits a body into independent readers
pub struct ReplayBody;

impl ReplayBody {
    pub fn split<S, E>(source: S, readers: usize) -> Vec<ReplayReader>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer {
                source: Some(source.map(|item| item.map_err(Into::into)).boxed()),
                chunks: VecDeque::new(),
                base: 0,
                failure: None,
            }),
            cursors: (0..readers).map(|_| AtomicUsize::new(0)).collect(),
        });

        (0..readers)
            .map(|id| ReplayReader {
                shared: Arc::clone(&shared),
                id,
            })
            .collect()
    }
}

/// One replay of the shared body
pub struct ReplayReader {
    shared: Arc<Shared>,
    id: usize,
}

impl ReplayReader {
    /// Next chunk, or `None` at the end of the body
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, ReplayError>> {
        let mut buffer = self.shared.buffer.lock().await;
        let cursor = &self.shared.cursors[self.id];
        let position = cursor.load(Ordering::Acquire);

        if position < buffer.base {
            return Some(Err(ReplayError("body chunk released before it was read".to_string())));
        }

        let cached = buffer.chunks.get(position - buffer.base).cloned();
        let chunk = match cached {
            Some(chunk) => chunk,
            None => {
                if let Some(failure) = &buffer.failure {
                    return Some(Err(failure.clone()));
                }

                let next = match buffer.source.as_mut() {
                    Some(source) => source.next().await,
                    None => None,
                };

                match next {
                    Some(Ok(chunk)) => {
                        buffer.chunks.push_back(chunk.clone());
                        chunk
                    }
                    Some(Err(err)) => {
                        let failure = ReplayError(err.to_string());
                        buffer.source = None;
                        buffer.failure = Some(failure.clone());
                        return Some(Err(failure));
                    }
                    None => {
                        buffer.source = None;
                        return None;
                    }
                }
            }
        };

        cursor.store(position + 1, Ordering::Release);
        self.shared.trim(&mut buffer);
        Some(Ok(chunk))
    }

    /// Consume the reader as a byte stream
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, ReplayError>> + Send + 'static {
        stream::unfold(self, |mut reader| async move {
            reader.next_chunk().await.map(|item| (item, reader))
        })
    }

    /// Chunks currently held for slower readers
    pub async fn buffered(&self) -> usize {
        self.shared.buffer.lock().await.chunks.len()
    }
}

impl Drop for ReplayReader {
    fn drop(&mut self) {
        self.shared.cursors[self.id].store(RELEASED, Ordering::Release);
        if let Ok(mut buffer) = self.shared.buffer.try_lock() {
            self.shared.trim(&mut buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, BoxError>> + Send + 'static {
        let items: Vec<Result<Bytes, BoxError>> = parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        stream::iter(items)
    }

    async fn collect(reader: ReplayReader) -> Result<Vec<u8>, ReplayError> {
        let parts: Vec<Bytes> = reader.into_stream().try_collect().await?;
        Ok(parts.concat())
    }

    #[tokio::test]
    async fn test_every_reader_sees_full_body() {
        let mut readers = ReplayBody::split(chunks(&["{\"in", "puts\":", "\"hi\"}"]), 3);
        let third = readers.pop().unwrap();
        let second = readers.pop().unwrap();
        let first = readers.pop().unwrap();

        assert_eq!(collect(first).await.unwrap(), b"{\"inputs\":\"hi\"}");
        assert_eq!(collect(second).await.unwrap(), b"{\"inputs\":\"hi\"}");
        assert_eq!(collect(third).await.unwrap(), b"{\"inputs\":\"hi\"}");
    }

    #[tokio::test]
    async fn test_source_is_pulled_once() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulls);
        let source = chunks(&["a", "b"]).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let readers = ReplayBody::split(source, 2);
        for reader in readers {
            assert_eq!(collect(reader).await.unwrap(), b"ab");
        }
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chunks_released_when_all_readers_pass() {
        let mut readers = ReplayBody::split(chunks(&["a", "b", "c"]), 2);
        let mut second = readers.pop().unwrap();
        let mut first = readers.pop().unwrap();

        first.next_chunk().await.unwrap().unwrap();
        first.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.buffered().await, 2);

        second.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.buffered().await, 1);
    }

    #[tokio::test]
    async fn test_dropped_reader_does_not_pin_buffer() {
        let mut readers = ReplayBody::split(chunks(&["a", "b", "c"]), 2);
        let unused = readers.pop().unwrap();
        let mut first = readers.pop().unwrap();
        drop(unused);

        while let Some(chunk) = first.next_chunk().await {
            chunk.unwrap();
        }
        assert_eq!(first.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_source_error_reaches_every_reader() {
        let items: Vec<Result<Bytes, BoxError>> = vec![Ok(Bytes::from_static(b"a")), Err("connection reset".into())];
        let readers = ReplayBody::split(stream::iter(items), 2);

        for reader in readers {
            let err = collect(reader).await.unwrap_err();
            assert!(err.0.contains("connection reset"));
        }
    }

    #[tokio::test]
    async fn test_empty_body() {
        let readers = ReplayBody::split(chunks(&[]), 2);
        for reader in readers {
            assert!(collect(reader).await.unwrap().is_empty());
        }
    }
}
