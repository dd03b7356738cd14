//! Cache key fingerprinting.
//!
//! A key is a SHA-256 digest over a canonical encoding of the render unit's
//! identity and its ordered argument list. Object keys inside arguments are
//! sorted before hashing, so two arguments that compare equal as JSON always
//! hash identically regardless of how their maps were built.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

const DOMAIN_TAG: &[u8] = b"edge-cache/v1\0";

/// Fingerprinting errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    /// An argument has no stable serialized form.
    #[error("argument {index} of unit '{unit}' is not serializable: {reason}")]
    UnserializableArgument {
        unit: String,
        index: usize,
        reason: String,
    },
}

/// Stable identity of a render unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Create a unit identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UnitId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A fingerprint identifying one cached render output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an existing key string (for backends that persist keys).
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which output of a unit invocation a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyVariant {
    /// The complete rendered value.
    Full,
    /// The static shell produced by a shell-only pass.
    Shell,
}

impl KeyVariant {
    fn as_byte(self) -> u8 {
        match self {
            Self::Full => b'F',
            Self::Shell => b'S',
        }
    }
}

/// One argument passed to a render unit.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderArg {
    /// A plain serializable value.
    Value(Value),
    /// A per-request handle (connection, stream, live object) with no
    /// stable serialized form.
    Opaque { description: String },
}

/// Ordered arguments of a render unit invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderArgs(Vec<RenderArg>);

impl RenderArgs {
    /// Empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a serializable argument.
    ///
    /// A value whose `Serialize` impl fails is recorded as opaque, so the
    /// failure surfaces when the key is derived.
    pub fn with<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        let arg = match serde_json::to_value(value) {
            Ok(value) => RenderArg::Value(value),
            Err(err) => RenderArg::Opaque {
                description: err.to_string(),
            },
        };
        self.0.push(arg);
        self
    }

    /// Append a raw JSON argument.
    pub fn with_value(mut self, value: Value) -> Self {
        self.0.push(RenderArg::Value(value));
        self
    }

    /// Append a per-request handle.
    pub fn with_opaque(mut self, description: impl Into<String>) -> Self {
        self.0.push(RenderArg::Opaque {
            description: description.into(),
        });
        self
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over arguments in order.
    pub fn iter(&self) -> impl Iterator<Item = &RenderArg> {
        self.0.iter()
    }

    /// Raw JSON value of the argument at `index`.
    pub fn value(&self, index: usize) -> Option<&Value> {
        match self.0.get(index)? {
            RenderArg::Value(value) => Some(value),
            RenderArg::Opaque { .. } => None,
        }
    }

    /// Deserialize the argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Option<T> {
        self.value(index)
            .and_then(|value| T::deserialize(value).ok())
    }
}

/// Derive the cache key for a unit invocation.
///
/// Deterministic and side-effect-free. Fails if any argument is opaque.
pub fn derive_key(
    unit: &UnitId,
    args: &RenderArgs,
    variant: KeyVariant,
) -> Result<CacheKey, FingerprintError> {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    hasher.update([variant.as_byte()]);
    update_framed(&mut hasher, unit.as_str().as_bytes());
    hasher.update((args.len() as u64).to_be_bytes());

    let mut encoded = String::new();
    for (index, arg) in args.iter().enumerate() {
        match arg {
            RenderArg::Value(value) => {
                encoded.clear();
                write_canonical(&mut encoded, value);
                update_framed(&mut hasher, encoded.as_bytes());
            }
            RenderArg::Opaque { description } => {
                return Err(FingerprintError::UnserializableArgument {
                    unit: unit.to_string(),
                    index,
                    reason: description.clone(),
                });
            }
        }
    }

    Ok(CacheKey(hex::encode(hasher.finalize())))
}

fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, item)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, name);
                out.push(':');
                write_canonical(out, item);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push_str(&Value::from(s).to_string());
}
