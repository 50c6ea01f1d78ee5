//! Identity-to-key derivation.

use std::fmt;
use std::sync::Arc;

/// Turns a caller identity into the key a limiter stores its state under.
///
/// Limiters without a generator use the raw identity. Keys only ever index
/// the owning limiter's store, so two limiters deriving the same key from the
/// same identity still track it independently.
#[derive(Clone)]
pub struct KeyGenerator {
    derive: Arc<dyn Fn(&str) -> String + Send + Sync>,
    label: String,
}

impl KeyGenerator {
    /// Wrap an arbitrary derivation function.
    pub fn new<F>(label: impl Into<String>, derive: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self {
            derive: Arc::new(derive),
            label: label.into(),
        }
    }

    /// Key is the identity unchanged.
    pub fn identity() -> Self {
        Self::new("identity", |identity| identity.to_string())
    }

    /// Key is `"{prefix}:{identity}"`.
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let label = format!("prefixed({})", prefix);
        Self::new(label, move |identity| format!("{}:{}", prefix, identity))
    }

    /// Key is the identity trimmed and lowercased, so `" Ops@Example.com"`
    /// and `"ops@example.com"` share one quota.
    pub fn normalized() -> Self {
        Self::new("normalized", |identity| identity.trim().to_lowercase())
    }

    /// Derive the key for an identity.
    pub fn derive(&self, identity: &str) -> String {
        (self.derive)(identity)
    }

    /// Human-readable name of this generator.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyGenerator").field(&self.label).finish()
    }
}

/// Derive a key with an optional generator, falling back to the raw identity.
pub(crate) fn derive_key(generator: Option<&KeyGenerator>, identity: &str) -> String {
    match generator {
        Some(generator) => generator.derive(identity),
        None => identity.to_string(),
    }
}
