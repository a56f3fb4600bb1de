use crate::cache::{CacheEntry, DiskCache, FlightGuard, ShardKey};
use crate::config::{SupportedFormat, DEFAULT_CLIENT_TIMEOUT};
use crate::transform::{EncodeError, Encoder};
use crate::SipError;
use bytes::Bytes;
use futures::StreamExt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

/// Chunks buffered between the encoder and a slow client.
const CLIENT_BUFFER: usize = 4;
const READ_CHUNK: usize = 64 * 1024;

/// One cache miss to be transcoded.
pub struct TranscodeJob {
    pub shard: ShardKey,
    pub format: SupportedFormat,
    pub source: fs::File,
    /// Token for `(shard, format)`, released once the entry is registered
    /// or the attempt has failed.
    pub guard: FlightGuard,
}

/// A running transcode.
///
/// `body` yields the encoded bytes for the client; `done` resolves once the
/// cache side has finished, with the new entry or the reason there is none.
/// Dropping `body` does not stop the cache write.
pub struct Transcode {
    pub body: mpsc::Receiver<Result<Bytes, EncodeError>>,
    pub done: JoinHandle<Result<CacheEntry, SipError>>,
}

/// Streams source → encoder → (client, cache file).
///
/// Failure isolation:
/// - encoder error: both sinks abort, nothing is cached
/// - cache write error: the client still gets every byte, nothing is cached
/// - client gone, or not reading for `client_timeout`: the client is
///   detached, encoding continues and the entry is still registered
#[derive(Clone)]
pub struct TranscodePipeline {
    cache: Arc<DiskCache>,
    encoder: Arc<dyn Encoder>,
    timeout: Option<Duration>,
    client_timeout: Duration,
}

impl TranscodePipeline {
    pub fn new(cache: Arc<DiskCache>, encoder: Arc<dyn Encoder>, timeout: Option<Duration>) -> Self {
        Self { cache, encoder, timeout, client_timeout: DEFAULT_CLIENT_TIMEOUT }
    }

    /// How long a full client buffer may hold up the cache write.
    pub fn with_client_timeout(mut self, client_timeout: Duration) -> Self {
        self.client_timeout = client_timeout;
        self
    }

    pub fn start(&self, job: TranscodeJob) -> Transcode {
        let (tx, body) = mpsc::channel(CLIENT_BUFFER);
        let pipeline = self.clone();
        let done = tokio::spawn(async move { pipeline.run(job, tx).await });
        Transcode { body, done }
    }

    async fn bounded<T>(&self, step: impl Future<Output = Result<T, EncodeError>>) -> Result<T, EncodeError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, step).await.unwrap_or(Err(EncodeError::Timeout)),
            None => step.await,
        }
    }

    /// Hands one item to the client. An error means the client is gone or
    /// stalled and must be detached.
    async fn deliver(
        &self,
        tx: &mpsc::Sender<Result<Bytes, EncodeError>>,
        item: Result<Bytes, EncodeError>,
    ) -> Result<(), &'static str> {
        match tokio::time::timeout(self.client_timeout, tx.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err("client went away"),
            Err(_) => Err("client stopped reading"),
        }
    }

    async fn run(
        self,
        job: TranscodeJob,
        tx: mpsc::Sender<Result<Bytes, EncodeError>>,
    ) -> Result<CacheEntry, SipError> {
        let TranscodeJob { shard, format, source, guard } = job;
        let mut client = Some(tx);

        let source = ReaderStream::with_capacity(source, READ_CHUNK).boxed();
        let mut encoded = match self.bounded(self.encoder.encode(source, format)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(shard = %shard, %format, error = %e, "Encoder failed to start");
                if let Some(tx) = client.take() {
                    let _ = self.deliver(&tx, Err(e.clone())).await;
                }
                return Err(SipError::Encode(e));
            }
        };

        let (mut sink, mut cache_error) = match self.cache.begin_write(&shard, format).await {
            Ok(writer) => (Some(writer), None),
            Err(e) => {
                tracing::warn!(shard = %shard, %format, error = %e, "Cannot open cache file, serving uncached");
                (None, Some(e))
            }
        };

        loop {
            let chunk = match self.bounded(async { encoded.next().await.transpose() }).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(shard = %shard, %format, error = %e, "Encoder failed");
                    if let Some(tx) = client.take() {
                        let _ = self.deliver(&tx, Err(e.clone())).await;
                    }
                    return Err(SipError::Encode(e));
                }
            };

            let failed = match sink.as_mut() {
                Some(writer) => writer.write(&chunk).await.err(),
                None => None,
            };
            if let Some(e) = failed {
                tracing::warn!(shard = %shard, %format, error = %e, "Cache write failed, finishing response uncached");
                sink = None;
                cache_error = Some(e);
            }

            if let Some(tx) = client.as_ref() {
                if let Err(reason) = self.deliver(tx, Ok(chunk)).await {
                    tracing::debug!(shard = %shard, %format, reason, "Detaching client, completing cache write");
                    client = None;
                }
            }
        }

        let result = match sink {
            Some(writer) => self.cache.commit(writer).await.map_err(SipError::CacheWrite),
            None => Err(SipError::CacheWrite(
                cache_error.unwrap_or_else(|| io::Error::other("cache writer unavailable")),
            )),
        };
        if let Err(e) = &result {
            tracing::warn!(shard = %shard, %format, error = %e, "Transcoded image was not cached");
        }

        // Waiters re-check the index as soon as the token drops.
        drop(guard);
        drop(client);
        result
    }
}
