use crate::config::{ConfigError, SupportedFormat};
use sha2::{Digest, Sha256};
use std::str::FromStr;

/// Hex encoded SHA-256 digest naming one shard directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey(String);

impl ShardKey {
    pub const LEN: usize = 64;

    /// Hashes an already normalized request identifier.
    pub fn digest(identifier: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(identifier.as_bytes());
        ShardKey(hex::encode(hasher.finalize()))
    }

    /// Accepts a directory name found under the cache root, if it looks like a key.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        let valid = name.len() == Self::LEN
            && name.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| ShardKey(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What gets hashed into the shard key.
///
/// `FullRequest` shards by the exact request target, so every distinct URL
/// gets its own directory holding one file per negotiated format.
/// `SourcePath` shards by the decoded source path only, so URLs that differ
/// in unrelated query parameters share their cached variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyPolicy {
    #[default]
    FullRequest,
    SourcePath,
}

impl FromStr for KeyPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "request" | "full-request" => Ok(KeyPolicy::FullRequest),
            "source" | "source-path" => Ok(KeyPolicy::SourcePath),
            other => Err(ConfigError::UnknownKeyPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyDeriver {
    policy: KeyPolicy,
}

impl KeyDeriver {
    pub fn new(policy: KeyPolicy) -> Self {
        Self { policy }
    }

    /// `target` is the raw `path?query` as received, `src` the decoded source path.
    pub fn derive(&self, target: &str, src: &str) -> ShardKey {
        match self.policy {
            KeyPolicy::FullRequest => ShardKey::digest(target),
            KeyPolicy::SourcePath => ShardKey::digest(src),
        }
    }
}

/// Name of a cache file created at `created_at_ms`: `{epochMillis}{extension}`.
pub fn entry_filename(created_at_ms: u64, format: SupportedFormat) -> String {
    format!("{}{}", created_at_ms, format.extension())
}

/// Inverse of [`entry_filename`]. Anything else in a shard directory is ignored.
pub fn parse_entry_filename(name: &str) -> Option<(u64, SupportedFormat)> {
    let dot = name.find('.')?;
    let (stamp, ext) = name.split_at(dot);
    if stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let format = SupportedFormat::from_extension(ext)?;
    Some((stamp.parse().ok()?, format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        let key = ShardKey::digest("/?src=cat.jpg");
        assert_eq!(key.as_str().len(), ShardKey::LEN);
        assert!(ShardKey::from_dir_name(key.as_str()).is_some());
        // sha256("")
        assert_eq!(
            ShardKey::digest("").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn dir_names_must_be_keys() {
        assert!(ShardKey::from_dir_name("not-a-key").is_none());
        assert!(ShardKey::from_dir_name(&"A".repeat(64)).is_none());
        assert!(ShardKey::from_dir_name(&"a".repeat(63)).is_none());
    }

    #[test]
    fn policies_hash_different_identifiers() {
        let full = KeyDeriver::new(KeyPolicy::FullRequest);
        let source = KeyDeriver::new(KeyPolicy::SourcePath);

        assert_ne!(
            full.derive("/?src=cat.jpg&v=1", "cat.jpg"),
            full.derive("/?src=cat.jpg&v=2", "cat.jpg")
        );
        assert_eq!(
            source.derive("/?src=cat.jpg&v=1", "cat.jpg"),
            source.derive("/?src=cat.jpg&v=2", "cat.jpg")
        );
    }

    #[test]
    fn filenames_round_trip() {
        let name = entry_filename(1_700_000_000_123, SupportedFormat::Avif);
        assert_eq!(name, "1700000000123.avif");
        assert_eq!(parse_entry_filename(&name), Some((1_700_000_000_123, SupportedFormat::Avif)));
    }

    #[test]
    fn foreign_files_are_not_entries() {
        assert_eq!(parse_entry_filename(".tmpXYZ.part"), None);
        assert_eq!(parse_entry_filename("123.png"), None);
        assert_eq!(parse_entry_filename("abc.webp"), None);
        assert_eq!(parse_entry_filename("123"), None);
    }

    #[test]
    fn key_policy_from_str() {
        assert_eq!("request".parse::<KeyPolicy>().unwrap(), KeyPolicy::FullRequest);
        assert_eq!("Source".parse::<KeyPolicy>().unwrap(), KeyPolicy::SourcePath);
        assert!("hash".parse::<KeyPolicy>().is_err());
    }
}
