use super::flight::{FlightGuard, Flights};
use super::index::{CacheEntry, CacheIndex, PARTIAL_SUFFIX};
use super::key::{entry_filename, ShardKey};
use crate::config::SupportedFormat;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

/// Milliseconds since the Unix epoch; doubles as entry creation stamp.
pub fn now_millis() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

/// Sharded on-disk cache of transcoded variants.
///
/// Layout: `{root}/{shard key}/{epochMillis}{extension}`. The index is the
/// only shared mutable state and is touched exclusively through the short
/// critical sections below; no lock is held across an await.
pub struct DiskCache {
    root: PathBuf,
    ttl: Duration,
    index: Mutex<CacheIndex>,
    flights: Flights,
}

impl DiskCache {
    /// Creates `root` if needed and rebuilds the index from its contents.
    pub async fn open(root: impl Into<PathBuf>, ttl: Duration) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let index = CacheIndex::load(&root).await?;
        tracing::info!(root = %root.display(), entries = index.len(), "Cache index loaded");
        Ok(Self {
            root,
            ttl,
            index: Mutex::new(index),
            flights: Flights::new(),
        })
    }

    pub fn shard_dir(&self, shard: &ShardKey) -> PathBuf {
        self.root.join(shard.as_str())
    }

    pub fn entry_path(&self, entry: &CacheEntry) -> PathBuf {
        self.shard_dir(&entry.shard).join(&entry.filename)
    }

    pub fn len(&self) -> usize {
        self.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index().is_empty()
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Recovered from poisoned cache index lock");
                poisoned.into_inner()
            }
        }
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }

    /// Fresh entry for `(shard, format)`, if any.
    ///
    /// Expired entries met along the way are deleted from disk and index.
    pub async fn lookup(&self, shard: &ShardKey, format: SupportedFormat) -> Option<CacheEntry> {
        loop {
            let entry = self.index().lookup(shard, format)?;
            if !entry.is_expired(now_millis(), self.ttl_ms()) {
                return Some(entry);
            }
            tracing::info!(shard = %shard, file = %entry.filename, "Cache entry expired");
            self.evict(&entry).await;
        }
    }

    /// Opens a looked-up entry for streaming. A file that disappeared from
    /// disk is dropped from the index and reported as `None`.
    pub async fn open_entry(&self, entry: &CacheEntry) -> io::Result<Option<fs::File>> {
        match fs::File::open(self.entry_path(entry)).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(shard = %entry.shard, file = %entry.filename, "Indexed cache file is missing");
                self.index().remove(&entry.shard, &entry.filename);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Removes an entry from the index, then its file.
    pub async fn evict(&self, entry: &CacheEntry) {
        if !self.index().remove(&entry.shard, &entry.filename) {
            return;
        }
        match fs::remove_file(self.entry_path(entry)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(shard = %entry.shard, file = %entry.filename, error = %e, "Failed to delete cache file"),
        }
    }

    /// Deletes every expired entry. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let ttl_ms = self.ttl_ms();
        let expired: Vec<CacheEntry> = self
            .index()
            .entries()
            .into_iter()
            .filter(|entry| entry.is_expired(now, ttl_ms))
            .collect();
        for entry in &expired {
            self.evict(entry).await;
        }
        expired.len()
    }

    /// Waits for the exclusive right to create a `(shard, format)` entry.
    pub async fn lock(&self, shard: &ShardKey, format: SupportedFormat) -> FlightGuard {
        self.flights.acquire(shard, format).await
    }

    /// Opens a hidden temporary file inside the shard directory.
    pub async fn begin_write(&self, shard: &ShardKey, format: SupportedFormat) -> io::Result<CacheWriter> {
        let dir = self.shard_dir(shard);
        fs::create_dir_all(&dir).await?;
        let (file, temp) = tempfile::Builder::new()
            .prefix(".")
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(&dir)?
            .into_parts();
        Ok(CacheWriter {
            shard: shard.clone(),
            format,
            dir,
            file: fs::File::from_std(file),
            temp,
            written: 0,
        })
    }

    /// Renames a finished write into place and registers it.
    pub async fn commit(&self, mut writer: CacheWriter) -> io::Result<CacheEntry> {
        writer.file.flush().await?;
        let CacheWriter { shard, format, dir, file, temp, written } = writer;
        drop(file);

        let filename = entry_filename(now_millis(), format);
        temp.persist(dir.join(&filename)).map_err(|e| e.error)?;
        self.index().insert(&shard, &filename);
        tracing::info!(shard = %shard, file = %filename, bytes = written, "Cache entry created");

        CacheEntry::from_filename(&shard, &filename)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unparseable entry filename"))
    }
}

/// An in-progress cache file. Dropping it without [`DiskCache::commit`]
/// deletes the temporary file.
pub struct CacheWriter {
    shard: ShardKey,
    format: SupportedFormat,
    dir: PathBuf,
    file: fs::File,
    temp: TempPath,
    written: u64,
}

impl CacheWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }
}

/// Periodically deletes expired entries, for deployments that do not want
/// stale files to linger until their next request.
pub fn spawn_sweeper(cache: Arc<DiskCache>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.sweep_expired().await;
            if removed > 0 {
                tracing::info!(removed, "Swept expired cache entries");
            }
        }
    })
}
