//! Canonical cache keys and wildcard patterns.
//!
//! Every key that reaches a tier has been normalized by [`KeyCodec`], which
//! prepends the service namespace (`cache:` by default). Patterns used by
//! `keys()` and `clear()` support a single wildcard, `*`; every other
//! character matches literally, so keys such as `stats.daily` or `f(x)` are
//! never interpreted as regex syntax.

use regex::Regex;

/// Namespace prepended to every key when none is configured.
pub const DEFAULT_NAMESPACE: &str = "cache:";

/// Turns caller-supplied keys into canonical, namespaced keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    namespace: String,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl KeyCodec {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prepend the namespace unless the key already carries it.
    #[inline]
    pub fn normalize(&self, raw: &str) -> String {
        if raw.starts_with(&self.namespace) {
            raw.to_string()
        } else {
            format!("{}{}", self.namespace, raw)
        }
    }

    pub fn normalize_all<K: AsRef<str>>(&self, raw: &[K]) -> Vec<String> {
        raw.iter().map(|k| self.normalize(k.as_ref())).collect()
    }

    /// Compile a glob into a matcher over canonical keys.
    ///
    /// The glob is normalized like a key, so `user:*` matches `cache:user:42`.
    pub fn compile_pattern(&self, glob: &str) -> KeyPattern {
        KeyPattern::new(&self.normalize(glob))
    }
}

/// A compiled `*`-only glob over canonical keys.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Option<Regex>,
}

impl KeyPattern {
    /// Compile a glob as-is (no namespace handling).
    pub fn new(glob: &str) -> Self {
        let body = glob
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        let regex = match Regex::new(&format!("^{body}$")) {
            Ok(regex) => Some(regex),
            Err(e) => {
                // Only reachable when the pattern exceeds the regex size limit.
                tracing::warn!(pattern = %glob, error = %e, "Pattern too large, falling back to exact match");
                None
            }
        };

        Self {
            glob: glob.to_string(),
            regex,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    pub fn is_match(&self, key: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(key),
            None => self.glob == key,
        }
    }

    /// The same pattern as a Redis `SCAN MATCH` glob.
    ///
    /// Redis globs also treat `?`, `[`, `]` and `\` as syntax; those are
    /// escaped so that `*` remains the only wildcard.
    pub fn to_remote_glob(&self) -> String {
        let mut out = String::with_capacity(self.glob.len() + 4);
        for ch in self.glob.chars() {
            if matches!(ch, '?' | '[' | ']' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
        out
    }
}
