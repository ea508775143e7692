//! Key rendering.
//!
//! Caller keys are rendered as `prefix:version:key` before they reach the
//! server. The rendered [`CacheKey`] keeps the caller's raw key alongside,
//! since shard routing hashes the raw key.

use std::fmt;
use std::sync::Arc;

/// Renders `(key, prefix, version)` into a server key.
pub type KeyFunc = Arc<dyn Fn(&str, &str, i64) -> String + Send + Sync>;

/// Recovers the caller key from a rendered server key.
pub type ReverseKeyFunc = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// `prefix:version:key`.
pub fn default_key_func(key: &str, prefix: &str, version: i64) -> String {
    format!("{}:{}:{}", prefix, version, key)
}

/// Everything after the second `:`; keys without two separators are
/// returned unchanged.
pub fn default_reverse_key(key: &str) -> String {
    key.splitn(3, ':').nth(2).unwrap_or(key).to_string()
}

/// A rendered server key together with the raw key it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    rendered: String,
    raw: String,
}

impl CacheKey {
    /// Pair a rendered key with its raw form.
    pub fn new(rendered: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            rendered: rendered.into(),
            raw: raw.into(),
        }
    }

    /// A key used verbatim, rendered and raw alike.
    pub fn verbatim(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            rendered: key.clone(),
            raw: key,
        }
    }

    /// The server key.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    /// The caller's key.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

/// Escape glob metacharacters so `text` matches only itself in a
/// `SCAN MATCH` / `KEYS` pattern: `*`, `?` and `[` become `[*]`, `[?]`
/// and `[[]`.
pub fn glob_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Render `raw` with `key_func`.
pub fn make_key(raw: &str, key_func: &KeyFunc, version: i64, prefix: &str) -> CacheKey {
    CacheKey::new(key_func(raw, prefix, version), raw)
}

/// Render a glob pattern with `key_func`. The prefix is escaped (versions
/// are numeric and need none); `pattern` keeps its wildcards.
pub fn make_pattern(pattern: &str, key_func: &KeyFunc, version: i64, prefix: &str) -> String {
    key_func(pattern, &glob_escape(prefix), version)
}

/// Key rendering settings for one cache.
#[derive(Clone)]
pub struct KeyMaker {
    prefix: String,
    version: i64,
    key_func: KeyFunc,
    reverse_key_func: ReverseKeyFunc,
}

impl Default for KeyMaker {
    fn default() -> Self {
        Self::new("", 1)
    }
}

impl KeyMaker {
    /// Key maker with the default `prefix:version:key` layout.
    pub fn new(prefix: impl Into<String>, version: i64) -> Self {
        Self {
            prefix: prefix.into(),
            version,
            key_func: Arc::new(default_key_func),
            reverse_key_func: Arc::new(default_reverse_key),
        }
    }

    /// Replace the rendering function.
    pub fn with_key_func(mut self, key_func: KeyFunc) -> Self {
        self.key_func = key_func;
        self
    }

    /// Replace the reverse function used by `keys` and `iter_keys`.
    pub fn with_reverse_key_func(mut self, reverse: ReverseKeyFunc) -> Self {
        self.reverse_key_func = reverse;
        self
    }

    /// Same settings with another default version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Default version.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Render `raw` at `version` (default when `None`).
    pub fn make_key(&self, raw: &str, version: Option<i64>) -> CacheKey {
        make_key(raw, &self.key_func, version.unwrap_or(self.version), &self.prefix)
    }

    /// Render a glob pattern at `version` (default when `None`).
    pub fn make_pattern(&self, pattern: &str, version: Option<i64>) -> String {
        make_pattern(pattern, &self.key_func, version.unwrap_or(self.version), &self.prefix)
    }

    /// Recover the caller key from a server key.
    pub fn reverse_key(&self, key: &str) -> String {
        (self.reverse_key_func)(key)
    }
}

impl fmt::Debug for KeyMaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaker")
            .field("prefix", &self.prefix)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
