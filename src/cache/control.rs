use std::time::Duration;

/// `Cache-Control` directives sent with every transcoded image.
///
/// The browser lifetime mirrors the on-disk TTL so clients revalidate at
/// roughly the moment the proxy would re-encode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheControl {
    /// Seconds, via the max-age directive.
    pub max_age: u64,

    /// Allow shared caches (CDNs, proxies) to store the response.
    pub public: bool,

    /// Forbid serving the response stale once `max_age` has passed.
    pub must_revalidate: bool,
}

impl CacheControl {
    pub fn for_ttl(ttl: Duration) -> Self {
        Self {
            max_age: ttl.as_secs(),
            public: true,
            must_revalidate: true,
        }
    }

    pub fn value(&self) -> String {
        let mut parts = Vec::new();

        parts.push(if self.public { "public" } else { "private" }.to_string());
        parts.push(format!("max-age={}", self.max_age));

        if self.must_revalidate {
            parts.push("must-revalidate".to_string());
        }

        parts.join(", ")
    }
}
