use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::cache::KeyPolicy;

/// Output formats the proxy can transcode into.
///
/// Every variant owns exactly one file extension and one MIME type, so the
/// extension of a cached file is enough to recover its format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportedFormat {
    Avif,
    Webp,
    Jpeg,
}

impl SupportedFormat {
    pub const ALL: [SupportedFormat; 3] = [SupportedFormat::Avif, SupportedFormat::Webp, SupportedFormat::Jpeg];

    pub fn mime_type(self) -> &'static str {
        match self {
            SupportedFormat::Avif => "image/avif",
            SupportedFormat::Webp => "image/webp",
            SupportedFormat::Jpeg => "image/jpeg",
        }
    }

    /// Canonical extension, leading dot included.
    pub fn extension(self) -> &'static str {
        match self {
            SupportedFormat::Avif => ".avif",
            SupportedFormat::Webp => ".webp",
            SupportedFormat::Jpeg => ".jpeg",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.mime_type().eq_ignore_ascii_case(mime))
    }
}

impl std::fmt::Display for SupportedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupportedFormat::Avif => write!(f, "avif"),
            SupportedFormat::Webp => write!(f, "webp"),
            SupportedFormat::Jpeg => write!(f, "jpeg"),
        }
    }
}

impl FromStr for SupportedFormat {
    type Err = ConfigError;

    /// Accepts either the short name (`webp`) or the MIME type (`image/webp`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(format) = Self::from_mime(s) {
            return Ok(format);
        }
        match s.to_ascii_lowercase().as_str() {
            "avif" => Ok(SupportedFormat::Avif),
            "webp" => Ok(SupportedFormat::Webp),
            "jpeg" | "jpg" => Ok(SupportedFormat::Jpeg),
            _ => Err(ConfigError::UnknownFormat(s.to_string())),
        }
    }
}

pub const DEFAULT_TTL: Duration = Duration::from_millis(1000 * 60 * 60 * 24 * 7);
pub const DEFAULT_QUALITY: u8 = 80;
pub const DEFAULT_ENCODE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PORT: u16 = 7000;

#[derive(Debug, Clone)]
pub struct SipConfig {
    /// Root of the sharded cache tree. Must be absolute.
    pub output: PathBuf,
    /// Directory source images are resolved against. Must be absolute.
    pub context: PathBuf,
    /// Formats offered to clients, in preference order.
    pub formats: Vec<SupportedFormat>,
    pub ttl: Duration,
    pub key_policy: KeyPolicy,
    pub encode_timeout: Option<Duration>,
    /// A client that reads nothing for this long is cut loose so the cache
    /// write can finish.
    pub client_timeout: Duration,
    pub sweep_interval: Option<Duration>,
    pub quality: u8,
    pub max_input_size: usize, // bytes
}

impl Default for SipConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self {
            output: cwd.join("_images"),
            context: cwd.join("_dist"),
            formats: vec![SupportedFormat::Avif, SupportedFormat::Webp],
            ttl: DEFAULT_TTL,
            key_policy: KeyPolicy::FullRequest,
            encode_timeout: Some(DEFAULT_ENCODE_TIMEOUT),
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            sweep_interval: None,
            quality: DEFAULT_QUALITY,
            max_input_size: 8 * 1024 * 1024,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("'output' should be an absolute path")] RelativeOutput,
    #[error("'context' should be an absolute path")] RelativeContext,
    #[error("At least one output format is required")] NoFormats,
    #[error("Format listed twice: {0}")] DuplicateFormat(SupportedFormat),
    #[error("TTL must be > 0")] ZeroTtl,
    #[error("Client timeout must be > 0")] ZeroClientTimeout,
    #[error("Quality must be within 1..=100")] InvalidQuality,
    #[error("Max input size must be > 0")] InvalidMaxInput,
    #[error("Unknown format: {0}")] UnknownFormat(String),
    #[error("Unknown key policy: {0}")] UnknownKeyPolicy(String),
    #[error("Invalid value for {name}: {value}")] InvalidVar { name: &'static str, value: String },
}

impl SipConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.output.is_absolute() { return Err(ConfigError::RelativeOutput); }
        if !self.context.is_absolute() { return Err(ConfigError::RelativeContext); }
        if self.formats.is_empty() { return Err(ConfigError::NoFormats); }
        for (i, format) in self.formats.iter().enumerate() {
            if self.formats[..i].contains(format) {
                return Err(ConfigError::DuplicateFormat(*format));
            }
        }
        if self.ttl.is_zero() { return Err(ConfigError::ZeroTtl); }
        if self.client_timeout.is_zero() { return Err(ConfigError::ZeroClientTimeout); }
        if self.quality == 0 || self.quality > 100 { return Err(ConfigError::InvalidQuality); }
        if self.max_input_size == 0 { return Err(ConfigError::InvalidMaxInput); }
        Ok(())
    }

    /// Builds a configuration from `SIP_*` environment variables, falling
    /// back to [`SipConfig::default`] for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = SipConfig::default();
        if let Some(output) = env_var("SIP_OUTPUT") { cfg.output = PathBuf::from(output); }
        if let Some(context) = env_var("SIP_CONTEXT") { cfg.context = PathBuf::from(context); }
        if let Some(formats) = env_var("SIP_FORMATS") { cfg.formats = parse_formats(&formats)?; }
        if let Some(ms) = env_parse::<u64>("SIP_TTL_MS")? { cfg.ttl = Duration::from_millis(ms); }
        if let Some(policy) = env_var("SIP_KEY_POLICY") { cfg.key_policy = policy.parse()?; }
        if let Some(secs) = env_parse::<u64>("SIP_ENCODE_TIMEOUT_SECS")? {
            cfg.encode_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = env_parse::<u64>("SIP_CLIENT_TIMEOUT_MS")? { cfg.client_timeout = Duration::from_millis(ms); }
        if let Some(secs) = env_parse::<u64>("SIP_SWEEP_INTERVAL_SECS")? {
            cfg.sweep_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(q) = env_parse::<u8>("SIP_QUALITY")? { cfg.quality = q; }
        if let Some(size) = env_parse::<usize>("SIP_MAX_INPUT_SIZE")? { cfg.max_input_size = size; }
        Ok(cfg)
    }
}

/// Parses a comma separated list such as `image/avif, webp`.
pub fn parse_formats(list: &str) -> Result<Vec<SupportedFormat>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(SupportedFormat::from_str)
        .collect()
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env_var(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn absolute_config() -> SipConfig {
        SipConfig {
            output: PathBuf::from("/tmp/sip-out"),
            context: PathBuf::from("/tmp/sip-src"),
            ..SipConfig::default()
        }
    }

    #[test]
    fn extension_mapping_is_bijective() {
        for format in SupportedFormat::ALL {
            assert_eq!(SupportedFormat::from_extension(format.extension()), Some(format));
            assert_eq!(SupportedFormat::from_mime(format.mime_type()), Some(format));
        }
        let mut exts: Vec<_> = SupportedFormat::ALL.iter().map(|f| f.extension()).collect();
        exts.sort();
        exts.dedup();
        assert_eq!(exts.len(), SupportedFormat::ALL.len());
    }

    #[test]
    fn parses_mime_and_short_names() {
        let formats = parse_formats("image/avif, webp ,JPG").unwrap();
        assert_eq!(formats, vec![SupportedFormat::Avif, SupportedFormat::Webp, SupportedFormat::Jpeg]);
        assert!(parse_formats("image/gif").is_err());
    }

    #[test]
    fn default_with_absolute_paths_validates() {
        assert!(absolute_config().validate().is_ok());
    }

    #[test]
    fn rejects_relative_roots() {
        let cfg = SipConfig { output: PathBuf::from("cache"), ..absolute_config() };
        assert!(matches!(cfg.validate(), Err(ConfigError::RelativeOutput)));

        let cfg = SipConfig { context: PathBuf::from("./images"), ..absolute_config() };
        assert!(matches!(cfg.validate(), Err(ConfigError::RelativeContext)));
    }

    #[test]
    fn rejects_duplicate_and_empty_formats() {
        let cfg = SipConfig { formats: vec![], ..absolute_config() };
        assert!(matches!(cfg.validate(), Err(ConfigError::NoFormats)));

        let cfg = SipConfig {
            formats: vec![SupportedFormat::Webp, SupportedFormat::Webp],
            ..absolute_config()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateFormat(SupportedFormat::Webp))));
    }

    #[test]
    fn rejects_bad_bounds() {
        let cfg = SipConfig { ttl: Duration::ZERO, ..absolute_config() };
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroTtl)));

        let cfg = SipConfig { quality: 101, ..absolute_config() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidQuality)));

        let cfg = SipConfig { client_timeout: Duration::ZERO, ..absolute_config() };
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroClientTimeout)));
    }
}
