use super::key::{parse_entry_filename, ShardKey};
use crate::config::SupportedFormat;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;
use tokio::fs;

/// Suffix of in-progress writes. Such files are never indexed.
pub const PARTIAL_SUFFIX: &str = ".part";

/// One cached variant, recovered from its filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub shard: ShardKey,
    pub filename: String,
    pub created_at_ms: u64,
    pub format: SupportedFormat,
}

impl CacheEntry {
    pub fn from_filename(shard: &ShardKey, filename: &str) -> Option<Self> {
        let (created_at_ms, format) = parse_entry_filename(filename)?;
        Some(Self {
            shard: shard.clone(),
            filename: filename.to_string(),
            created_at_ms,
            format,
        })
    }

    /// Stale once strictly older than `ttl_ms`.
    pub fn is_expired(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > ttl_ms
    }
}

/// In-memory view of the shard directories under the cache root.
///
/// Plain data: callers serialize access (see `DiskCache`).
#[derive(Debug, Default)]
pub struct CacheIndex {
    shards: HashMap<ShardKey, BTreeSet<String>>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the index from `root`, one shard per subdirectory.
    ///
    /// Leftover partial writes from an interrupted process are deleted.
    pub async fn load(root: &Path) -> io::Result<Self> {
        let mut index = CacheIndex::new();
        let mut dirs = fs::read_dir(root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let Some(shard) = dir.file_name().to_str().and_then(ShardKey::from_dir_name) else {
                tracing::debug!("Skipping foreign directory {:?}", dir.path());
                continue;
            };
            let mut files = fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) {
                    tracing::debug!(shard = %shard, file = name, "Removing partial write");
                    let _ = fs::remove_file(file.path()).await;
                    continue;
                }
                if parse_entry_filename(name).is_some() && file.file_type().await?.is_file() {
                    index.insert(&shard, name);
                }
            }
        }
        Ok(index)
    }

    /// Newest entry in `shard` carrying `format`'s extension.
    pub fn lookup(&self, shard: &ShardKey, format: SupportedFormat) -> Option<CacheEntry> {
        self.shards
            .get(shard)?
            .iter()
            .filter(|name| name.ends_with(format.extension()))
            .filter_map(|name| CacheEntry::from_filename(shard, name))
            .max_by_key(|entry| entry.created_at_ms)
    }

    pub fn insert(&mut self, shard: &ShardKey, filename: &str) {
        self.shards
            .entry(shard.clone())
            .or_default()
            .insert(filename.to_string());
    }

    /// Returns whether the file was indexed. Empty shards are dropped.
    pub fn remove(&mut self, shard: &ShardKey, filename: &str) -> bool {
        let Some(files) = self.shards.get_mut(shard) else { return false };
        let removed = files.remove(filename);
        if files.is_empty() {
            self.shards.remove(shard);
        }
        removed
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.shards
            .iter()
            .flat_map(|(shard, files)| files.iter().filter_map(|f| CacheEntry::from_filename(shard, f)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
