use bytes::Bytes;
use futures::stream::{self, StreamExt};
use imagesip::cache::{DiskCache, ShardKey};
use imagesip::config::SupportedFormat;
use imagesip::pipeline::{TranscodeJob, TranscodePipeline};
use imagesip::transform::{EncodeError, EncodedStream, Encoder, SourceStream};
use imagesip::SipError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CHUNK: &[u8] = b"0123456789";

/// Drains the source, then emits `chunks` copies of CHUNK, optionally
/// failing after `fail_after` of them.
struct ScriptedEncoder {
    chunks: usize,
    fail_after: Option<usize>,
}

#[async_trait::async_trait]
impl Encoder for ScriptedEncoder {
    async fn encode(&self, mut source: SourceStream, _format: SupportedFormat) -> Result<EncodedStream, EncodeError> {
        while let Some(chunk) = source.next().await {
            chunk.map_err(EncodeError::Source)?;
        }
        let fail_after = self.fail_after;
        let out = stream::iter(0..self.chunks).then(move |i| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if Some(i) == fail_after {
                Err(EncodeError::Codec("bitstream overflow".into()))
            } else {
                Ok(Bytes::from_static(CHUNK))
            }
        });
        Ok(out.boxed())
    }
}

/// Never produces output.
struct StuckEncoder;

#[async_trait::async_trait]
impl Encoder for StuckEncoder {
    async fn encode(&self, _source: SourceStream, _format: SupportedFormat) -> Result<EncodedStream, EncodeError> {
        Ok(stream::pending().boxed())
    }
}

struct Setup {
    _tmp: TempDir,
    cache: Arc<DiskCache>,
    source: std::path::PathBuf,
}

async fn setup() -> Setup {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source.png");
    std::fs::write(&source, b"source bytes").unwrap();
    let cache = Arc::new(DiskCache::open(tmp.path().join("cache"), Duration::from_secs(3600)).await.unwrap());
    Setup { _tmp: tmp, cache, source }
}

async fn job(setup: &Setup, shard: &ShardKey) -> TranscodeJob {
    TranscodeJob {
        shard: shard.clone(),
        format: SupportedFormat::Webp,
        source: tokio::fs::File::open(&setup.source).await.unwrap(),
        guard: setup.cache.lock(shard, SupportedFormat::Webp).await,
    }
}

fn shard_files(cache: &DiskCache, shard: &ShardKey) -> usize {
    std::fs::read_dir(cache.shard_dir(shard)).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn client_and_cache_receive_the_same_bytes() {
    let setup = setup().await;
    let shard = ShardKey::digest("/?src=source.png");
    let pipeline = TranscodePipeline::new(
        setup.cache.clone(),
        Arc::new(ScriptedEncoder { chunks: 8, fail_after: None }),
        None,
    );

    let mut transcode = pipeline.start(job(&setup, &shard).await);
    let mut received = Vec::new();
    while let Some(chunk) = transcode.body.recv().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    let entry = transcode.done.await.unwrap().unwrap();

    assert_eq!(received, CHUNK.repeat(8));
    assert_eq!(std::fs::read(setup.cache.entry_path(&entry)).unwrap(), received);
    assert_eq!(setup.cache.lookup(&shard, SupportedFormat::Webp).await, Some(entry));
}

#[tokio::test]
async fn client_disconnect_still_completes_cache_entry() {
    let setup = setup().await;
    let shard = ShardKey::digest("/?src=source.png");
    let pipeline = TranscodePipeline::new(
        setup.cache.clone(),
        Arc::new(ScriptedEncoder { chunks: 20, fail_after: None }),
        None,
    );

    let mut transcode = pipeline.start(job(&setup, &shard).await);
    let first = transcode.body.recv().await.unwrap().unwrap();
    assert_eq!(first, CHUNK);
    drop(transcode.body);

    let entry = transcode.done.await.unwrap().unwrap();
    assert_eq!(std::fs::read(setup.cache.entry_path(&entry)).unwrap(), CHUNK.repeat(20));
    assert_eq!(setup.cache.len(), 1);
}

#[tokio::test]
async fn encoder_failure_aborts_both_sinks() {
    let setup = setup().await;
    let shard = ShardKey::digest("/?src=source.png");
    let pipeline = TranscodePipeline::new(
        setup.cache.clone(),
        Arc::new(ScriptedEncoder { chunks: 5, fail_after: Some(2) }),
        None,
    );

    let mut transcode = pipeline.start(job(&setup, &shard).await);
    let mut ok_chunks = 0;
    let mut failed = false;
    while let Some(chunk) = transcode.body.recv().await {
        match chunk {
            Ok(_) => ok_chunks += 1,
            Err(EncodeError::Codec(msg)) => {
                assert_eq!(msg, "bitstream overflow");
                failed = true;
            }
            Err(other) => panic!("unexpected {:?}", other),
        }
    }

    assert_eq!(ok_chunks, 2);
    assert!(failed);
    assert!(matches!(transcode.done.await.unwrap(), Err(SipError::Encode(_))));
    assert!(setup.cache.is_empty());
    assert_eq!(shard_files(&setup.cache, &shard), 0);
}

#[tokio::test]
async fn stalled_encoder_times_out() {
    let setup = setup().await;
    let shard = ShardKey::digest("/?src=source.png");
    let pipeline = TranscodePipeline::new(
        setup.cache.clone(),
        Arc::new(StuckEncoder),
        Some(Duration::from_millis(50)),
    );

    let mut transcode = pipeline.start(job(&setup, &shard).await);
    assert!(matches!(transcode.body.recv().await, Some(Err(EncodeError::Timeout))));
    assert!(transcode.body.recv().await.is_none());
    assert!(matches!(
        transcode.done.await.unwrap(),
        Err(SipError::Encode(EncodeError::Timeout))
    ));
    assert_eq!(shard_files(&setup.cache, &shard), 0);
}

#[tokio::test]
async fn token_is_held_until_entry_is_registered() {
    let setup = setup().await;
    let shard = ShardKey::digest("/?src=source.png");
    let pipeline = TranscodePipeline::new(
        setup.cache.clone(),
        Arc::new(ScriptedEncoder { chunks: 10, fail_after: None }),
        None,
    );

    let transcode = pipeline.start(job(&setup, &shard).await);
    drop(transcode.body);

    // The next holder only gets the token once the entry is visible.
    let _guard = setup.cache.lock(&shard, SupportedFormat::Webp).await;
    assert!(setup.cache.lookup(&shard, SupportedFormat::Webp).await.is_some());
}

#[tokio::test]
async fn stalled_reader_does_not_hold_the_cache() {
    let setup = setup().await;
    let shard = ShardKey::digest("/?src=source.png");
    let pipeline = TranscodePipeline::new(
        setup.cache.clone(),
        Arc::new(ScriptedEncoder { chunks: 32, fail_after: None }),
        None,
    )
    .with_client_timeout(Duration::from_millis(50));

    // Connected, but never reads.
    let transcode = pipeline.start(job(&setup, &shard).await);
    let _body = transcode.body;

    let guard = tokio::time::timeout(
        Duration::from_secs(2),
        setup.cache.lock(&shard, SupportedFormat::Webp),
    )
    .await;
    assert!(guard.is_ok(), "token still held by the stalled transcode");

    let entry = transcode.done.await.unwrap().unwrap();
    assert_eq!(std::fs::read(setup.cache.entry_path(&entry)).unwrap(), CHUNK.repeat(32));
    assert_eq!(setup.cache.lookup(&shard, SupportedFormat::Webp).await, Some(entry));
}
