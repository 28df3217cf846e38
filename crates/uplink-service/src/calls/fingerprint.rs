use std::fmt::{self, Write};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::request::CallRequest;

/// Deterministic key derived from a call's normalized inputs.
///
/// Two requests with identical normalized inputs always produce the same
/// fingerprint, regardless of how the caller assembled its parameter map.
/// Equality and hashing are based purely on the digest; the human-readable
/// material the digest was computed from is kept around for diagnostics.
#[derive(Debug, Clone, Eq)]
pub struct Fingerprint {
    material: Arc<str>,
    hash: [u8; 32],
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for Fingerprint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl PartialOrd for Fingerprint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fingerprint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Fingerprint {
    /// Creates the [`Fingerprint`] for the given [`CallRequest`].
    pub fn from_request(request: &CallRequest) -> Self {
        let mut builder = FingerprintBuilder::new(request.operation());
        builder.write_params(request.params()).unwrap();
        builder.build()
    }

    /// Returns the human-readable material that forms the basis of this
    /// fingerprint.
    pub fn material(&self) -> &str {
        &self.material
    }
}

/// A builder for [`Fingerprint`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the
/// intention of it is to accept human readable, but most importantly
/// **stable**, input: parameter maps are written in key order and text is
/// whitespace-normalized, so formatting-only differences between callers do
/// not produce distinct keys. The accumulated material is then SHA-256 hashed
/// to form the [`Fingerprint`].
pub struct FingerprintBuilder {
    material: String,
}

impl FingerprintBuilder {
    pub fn new(operation: &str) -> Self {
        let material = format!("operation: {}\n", normalize_text(operation));
        Self { material }
    }

    /// Writes a whole parameter map into the fingerprint material.
    pub fn write_params(&mut self, params: &serde_json::Map<String, Value>) -> fmt::Result {
        // `serde_json::Map` iterates in key order, which makes the material
        // independent of the order in which parameters were inserted.
        for (key, value) in params {
            self.material.write_fmt(format_args!("{key}: "))?;
            write_value(&mut self.material, value)?;
            self.material.write_char('\n')?;
        }
        Ok(())
    }

    /// Finalize the [`Fingerprint`].
    pub fn build(self) -> Fingerprint {
        let hash = Sha256::digest(&self.material);
        let hash = <[u8; 32]>::try_from(hash).expect("sha256 outputs 32 bytes");

        Fingerprint {
            material: self.material.into(),
            hash,
        }
    }
}

impl fmt::Write for FingerprintBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.material.write_str(s)
    }
}

fn write_value(out: &mut String, value: &Value) -> fmt::Result {
    match value {
        Value::Null => out.write_str("null"),
        Value::Bool(b) => write!(out, "{b}"),
        Value::Number(n) => write!(out, "{n}"),
        Value::String(s) => write!(out, "{:?}", normalize_text(s)),
        Value::Array(items) => {
            out.write_char('[')?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.write_char(',')?;
                }
                write_value(out, item)?;
            }
            out.write_char(']')
        }
        Value::Object(map) => {
            out.write_char('{')?;
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.write_char(',')?;
                }
                write!(out, "{key}=")?;
                write_value(out, item)?;
            }
            out.write_char('}')
        }
    }
}

/// Collapses runs of whitespace into single spaces and trims the ends, so
/// that formatting-only differences do not change the key.
fn normalize_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for word in s.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}
