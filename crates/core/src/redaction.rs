//! Secret redaction for logged command lines and captured output
//!
//! The command executor logs every argv it runs and, at debug level, the
//! output it captured. Anything registered here (Portainer credentials,
//! agent secrets from the global settings) is replaced with a placeholder
//! before it reaches a log sink.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Values shorter than this are never registered; redacting them would
/// mangle ordinary output.
const MIN_REDACTION_LENGTH: usize = 8;

/// Replacement text for redacted secrets
const REDACTION_PLACEHOLDER: &str = "****";

/// Thread-safe registry of secret strings to scrub from log output.
#[derive(Debug, Clone, Default)]
pub struct SecretRegistry {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl SecretRegistry {
    /// Create a new empty secret registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret value. Values below the minimum length are ignored.
    pub fn add_secret(&self, secret: &str) {
        if secret.len() < MIN_REDACTION_LENGTH {
            return;
        }
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(secret.to_string());
        }
    }

    /// Register every secret in the iterator.
    pub fn add_secrets<I>(&self, secrets: I)
    where
        I: IntoIterator<Item = String>,
    {
        for secret in secrets {
            self.add_secret(&secret);
        }
    }

    /// Return `text` with every registered secret replaced by the placeholder.
    pub fn redact_text(&self, text: &str) -> String {
        match self.inner.read() {
            Ok(inner) => {
                let mut result = text.to_string();
                for secret in inner.iter() {
                    if result.contains(secret.as_str()) {
                        result = result.replace(secret.as_str(), REDACTION_PLACEHOLDER);
                    }
                }
                result
            }
            Err(_) => text.to_string(),
        }
    }

    /// Number of registered secrets.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.len()).unwrap_or(0)
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
