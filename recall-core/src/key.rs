//! Deterministic cache key derivation
//!
//! Keys have the form `<prefix>:<sha256-hex>`. The digest covers the
//! operation identity and a canonical encoding of the call arguments, so the
//! same call yields the same key in every process and across restarts.
//!
//! # Canonical encoding
//!
//! Every [`ArgValue`] is written as a one-byte tag followed by its payload.
//! Variable-length payloads carry a big-endian `u64` length prefix, so two
//! adjacent values can never be read as one. Maps are ordered by key, sets by
//! the encoding of their elements. Unsigned integers that fit in `i64` are
//! encoded as signed integers and `-0.0` is encoded as `0.0`.

use crate::KeyGenerationError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Prefix used when neither settings nor options provide one.
pub const DEFAULT_KEY_PREFIX: &str = "recall";

const KEY_FORMAT_VERSION: &[u8] = b"recall-key-v1";

const TAG_UNIT: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_UINT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_MAP: u8 = 0x08;
const TAG_SET: u8 = 0x09;

// ============================================================================
// OPERATION IDENTITY
// ============================================================================

/// Stable identity of a cacheable operation.
///
/// Built from a module path and a name rather than anything address-based,
/// so keys survive restarts. See [`operation_id!`](crate::operation_id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId {
    module: String,
    name: String,
}

impl OperationId {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}::{}", self.module, self.name)
        }
    }
}

/// Build an [`OperationId`] qualified by the calling module's path.
#[macro_export]
macro_rules! operation_id {
    ($name:expr) => {
        $crate::OperationId::new(module_path!(), $name)
    };
}

// ============================================================================
// ARGUMENT VALUES
// ============================================================================

/// A call argument reduced to a form with a canonical encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Unit,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
    /// Unordered collection; element order never affects the key.
    Set(Vec<ArgValue>),
    /// A value with no deterministic form. Keying it always fails.
    Opaque(String),
}

impl ArgValue {
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        ArgValue::Bytes(value.into())
    }

    pub fn opaque<T: ?Sized>() -> Self {
        ArgValue::Opaque(std::any::type_name::<T>().to_string())
    }

    /// Convert any serializable value through its JSON data model.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(ArgValue::from)
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), String> {
        match self {
            ArgValue::Unit => out.push(TAG_UNIT),
            ArgValue::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*b));
            }
            ArgValue::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&i.to_be_bytes());
            }
            ArgValue::UInt(u) => match i64::try_from(*u) {
                Ok(i) => ArgValue::Int(i).encode(out)?,
                Err(_) => {
                    out.push(TAG_UINT);
                    out.extend_from_slice(&u.to_be_bytes());
                }
            },
            ArgValue::Float(f) => {
                if !f.is_finite() {
                    return Err(format!("non-finite float {f}"));
                }
                let normalized = if *f == 0.0 { 0.0f64 } else { *f };
                out.push(TAG_FLOAT);
                out.extend_from_slice(&normalized.to_bits().to_be_bytes());
            }
            ArgValue::Str(s) => {
                out.push(TAG_STR);
                write_len_prefixed(out, s.as_bytes());
            }
            ArgValue::Bytes(b) => {
                out.push(TAG_BYTES);
                write_len_prefixed(out, b);
            }
            ArgValue::List(items) => {
                out.push(TAG_LIST);
                write_len(out, items.len());
                for item in items {
                    item.encode(out)?;
                }
            }
            ArgValue::Map(entries) => {
                out.push(TAG_MAP);
                write_len(out, entries.len());
                for (name, value) in entries {
                    write_len_prefixed(out, name.as_bytes());
                    value.encode(out)?;
                }
            }
            ArgValue::Set(items) => {
                let mut encoded = items
                    .iter()
                    .map(|item| {
                        let mut buf = Vec::new();
                        item.encode(&mut buf).map(|_| buf)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                encoded.sort();
                encoded.dedup();
                out.push(TAG_SET);
                write_len(out, encoded.len());
                for item in encoded {
                    out.extend_from_slice(&item);
                }
            }
            ArgValue::Opaque(type_name) => {
                return Err(format!("value of type {type_name} has no canonical form"));
            }
        }
        Ok(())
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_be_bytes());
}

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    write_len(out, bytes.len());
    out.extend_from_slice(bytes);
}

macro_rules! impl_from_signed {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ArgValue {
            fn from(value: $ty) -> Self {
                ArgValue::Int(i64::from(value))
            }
        })*
    };
}

macro_rules! impl_from_unsigned {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ArgValue {
            fn from(value: $ty) -> Self {
                ArgValue::UInt(u64::from(value))
            }
        })*
    };
}

impl_from_signed!(i8, i16, i32, i64);
impl_from_unsigned!(u8, u16, u32, u64);

impl From<isize> for ArgValue {
    fn from(value: isize) -> Self {
        ArgValue::Int(value as i64)
    }
}

impl From<usize> for ArgValue {
    fn from(value: usize) -> Self {
        ArgValue::UInt(value as u64)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<f32> for ArgValue {
    fn from(value: f32) -> Self {
        ArgValue::Float(f64::from(value))
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<()> for ArgValue {
    fn from(_: ()) -> Self {
        ArgValue::Unit
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

impl From<&String> for ArgValue {
    fn from(value: &String) -> Self {
        ArgValue::Str(value.clone())
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ArgValue::Unit, Into::into)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(value: Vec<T>) -> Self {
        ArgValue::List(value.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<ArgValue>> From<BTreeMap<String, V>> for ArgValue {
    fn from(value: BTreeMap<String, V>) -> Self {
        ArgValue::Map(value.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<V: Into<ArgValue>, S> From<HashMap<String, V, S>> for ArgValue {
    fn from(value: HashMap<String, V, S>) -> Self {
        ArgValue::Map(value.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<ArgValue>> From<BTreeSet<T>> for ArgValue {
    fn from(value: BTreeSet<T>) -> Self {
        ArgValue::Set(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ArgValue>, S> From<HashSet<T, S>> for ArgValue {
    fn from(value: HashSet<T, S>) -> Self {
        ArgValue::Set(value.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for ArgValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => ArgValue::Unit,
            Value::Bool(b) => ArgValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ArgValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    ArgValue::UInt(u)
                } else {
                    ArgValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => ArgValue::Str(s),
            Value::Array(items) => ArgValue::List(items.into_iter().map(ArgValue::from).collect()),
            Value::Object(entries) => {
                ArgValue::Map(entries.into_iter().map(|(k, v)| (k, ArgValue::from(v))).collect())
            }
        }
    }
}

// ============================================================================
// CALL ARGUMENTS
// ============================================================================

/// Positional and named arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<ArgValue>,
    named: BTreeMap<String, ArgValue>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named argument, replacing any previous value for `name`.
    pub fn named(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn positional(&self) -> &[ArgValue] {
        &self.positional
    }

    pub fn named_args(&self) -> &BTreeMap<String, ArgValue> {
        &self.named
    }

    pub fn positional_count(&self) -> usize {
        self.positional.len()
    }

    pub fn named_count(&self) -> usize {
        self.named.len()
    }
}

// ============================================================================
// CACHE KEYS
// ============================================================================

/// A derived cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap a key produced outside the default derivation.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Replaces default key derivation for one operation.
pub trait KeyBuilder: Send + Sync {
    fn build_key(&self, operation: &OperationId, args: &Args) -> Result<CacheKey, KeyGenerationError>;
}

impl<F> KeyBuilder for F
where
    F: Fn(&OperationId, &Args) -> Result<CacheKey, KeyGenerationError> + Send + Sync,
{
    fn build_key(&self, operation: &OperationId, args: &Args) -> Result<CacheKey, KeyGenerationError> {
        self(operation, args)
    }
}

/// Key-related part of a resolved cache configuration.
#[derive(Clone)]
pub struct KeyPolicy {
    pub prefix: String,
    /// Argument names left out of the key.
    pub exclusions: BTreeSet<String>,
    /// Parameter names by position, used to exclude positional arguments.
    pub signature: Vec<String>,
    pub builder: Option<Arc<dyn KeyBuilder>>,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            exclusions: BTreeSet::new(),
            signature: Vec::new(),
            builder: None,
        }
    }
}

impl fmt::Debug for KeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPolicy")
            .field("prefix", &self.prefix)
            .field("exclusions", &self.exclusions)
            .field("signature", &self.signature)
            .field("custom_builder", &self.builder.is_some())
            .finish()
    }
}

/// Derive the key for a call, using the custom builder when one is set.
pub fn generate_key(
    operation: &OperationId,
    args: &Args,
    policy: &KeyPolicy,
) -> Result<CacheKey, KeyGenerationError> {
    match &policy.builder {
        Some(builder) => builder.build_key(operation, args),
        None => canonical_key(
            operation,
            args,
            &policy.prefix,
            &policy.exclusions,
            &policy.signature,
        ),
    }
}

/// Default derivation: `prefix:sha256(identity, canonical args)`.
///
/// Excluded names are dropped before anything is encoded, so a
/// non-serializable excluded argument never fails key generation.
/// Positional arguments keep their original index in the encoding.
pub fn canonical_key(
    operation: &OperationId,
    args: &Args,
    prefix: &str,
    excluded: &BTreeSet<String>,
    signature: &[String],
) -> Result<CacheKey, KeyGenerationError> {
    let function = operation.to_string();
    let mut buf = Vec::with_capacity(128);
    write_len_prefixed(&mut buf, KEY_FORMAT_VERSION);
    write_len_prefixed(&mut buf, function.as_bytes());

    let positional: Vec<(usize, &ArgValue)> = args
        .positional
        .iter()
        .enumerate()
        .filter(|(idx, _)| {
            signature
                .get(*idx)
                .map_or(true, |name| !excluded.contains(name))
        })
        .collect();
    buf.push(b'P');
    write_len(&mut buf, positional.len());
    for (idx, value) in positional {
        buf.extend_from_slice(&(idx as u64).to_be_bytes());
        value
            .encode(&mut buf)
            .map_err(|reason| KeyGenerationError::NonDeterministic {
                function: function.clone(),
                argument: signature
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| format!("#{idx}")),
                reason,
            })?;
    }

    let named: Vec<(&String, &ArgValue)> = args
        .named
        .iter()
        .filter(|(name, _)| !excluded.contains(*name))
        .collect();
    buf.push(b'N');
    write_len(&mut buf, named.len());
    for (name, value) in named {
        write_len_prefixed(&mut buf, name.as_bytes());
        value
            .encode(&mut buf)
            .map_err(|reason| KeyGenerationError::NonDeterministic {
                function: function.clone(),
                argument: name.clone(),
                reason,
            })?;
    }

    let digest = Sha256::digest(&buf);
    Ok(CacheKey(format!("{prefix}:{}", hex::encode(digest))))
}
