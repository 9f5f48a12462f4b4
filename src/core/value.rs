use super::types::{EndpointGuid, Timestamp};
use crate::core::{Result, SettingsError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content-addressed reference to a blob payload (§3 "Blob").
///
/// `stream_id` is `None` for an in-memory value that has not yet been
/// committed through the stream store (C2); `write` fills it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub hash: [u8; 32],
    pub stream_id: Option<u32>,
}

impl BlobRef {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        BlobRef {
            hash: *blake3::hash(bytes).as_bytes(),
            stream_id: None,
        }
    }

    pub fn hash_hex(&self) -> String {
        hex_encode(&self.hash)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Variant tag of a [`Value`], used for type-mismatch reporting and for
/// the `Type` column of the 13-column encoding (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Deleted,
    Dword,
    Qword,
    Bool,
    String,
    Blob,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Deleted => "deleted",
            DataType::Dword => "dword",
            DataType::Qword => "qword",
            DataType::Bool => "bool",
            DataType::String => "string",
            DataType::Blob => "blob",
        };
        write!(f, "{name}")
    }
}

/// The typed value payload (§3 "Value"). `Deleted` is a tombstone, not
/// row removal — it takes a place in the history like any other write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Deleted,
    Dword(u32),
    Qword(u64),
    Bool(bool),
    String(String),
    Blob(BlobRef),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Deleted => DataType::Deleted,
            Value::Dword(_) => DataType::Dword,
            Value::Qword(_) => DataType::Qword,
            Value::Bool(_) => DataType::Bool,
            Value::String(_) => DataType::String,
            Value::Blob(_) => DataType::Blob,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Deleted)
    }

    pub fn as_dword(&self) -> Result<u32> {
        match self {
            Value::Dword(v) => Ok(*v),
            Value::Deleted => Err(SettingsError::NotFound("value is a tombstone".into())),
            other => Err(mismatch(DataType::Dword, other)),
        }
    }

    pub fn as_qword(&self) -> Result<u64> {
        match self {
            Value::Qword(v) => Ok(*v),
            Value::Deleted => Err(SettingsError::NotFound("value is a tombstone".into())),
            other => Err(mismatch(DataType::Qword, other)),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            Value::Deleted => Err(SettingsError::NotFound("value is a tombstone".into())),
            other => Err(mismatch(DataType::Bool, other)),
        }
    }

    pub fn as_string(&self) -> Result<&str> {
        match self {
            Value::String(v) => Ok(v.as_str()),
            Value::Deleted => Err(SettingsError::NotFound("value is a tombstone".into())),
            other => Err(mismatch(DataType::String, other)),
        }
    }

    pub fn as_blob(&self) -> Result<&BlobRef> {
        match self {
            Value::Blob(v) => Ok(v),
            Value::Deleted => Err(SettingsError::NotFound("value is a tombstone".into())),
            other => Err(mismatch(DataType::Blob, other)),
        }
    }
}

fn mismatch(expected: DataType, found: &Value) -> SettingsError {
    SettingsError::TypeMismatch {
        expected: expected.to_string(),
        found: found.data_type().to_string(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Deleted => write!(f, "<deleted>"),
            Value::Dword(v) => write!(f, "{v}"),
            Value::Qword(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Blob(v) => write!(f, "blob({})", v.hash_hex()),
        }
    }
}

/// One row of a key's history: the value plus its `when`/`by` metadata
/// (§3 "Value"). Ordering within a key's history is by `(when, by)`
/// (§3 invariant 3, §8 invariant 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRecord {
    pub value: Value,
    pub when: Timestamp,
    pub by: EndpointGuid,
}

impl ValueRecord {
    pub fn new(value: Value, when: Timestamp, by: EndpointGuid) -> Self {
        ValueRecord { value, when, by }
    }

    /// Structural comparison (§4.1). With `ignore_metadata = false` this
    /// is full row equality (used by the idempotence check in C4 and by
    /// the "same point" short-circuit in the sync engine, §4.6); with
    /// `ignore_metadata = true` only the payload is compared (used by
    /// the subsumption matcher, which matches by `(type, payload, when, by)`
    /// but still wants a payload-only helper for diagnostics).
    pub fn compare(&self, other: &ValueRecord, ignore_metadata: bool) -> bool {
        if self.value != other.value {
            return false;
        }
        ignore_metadata || (self.when == other.when && self.by == other.by)
    }

    pub fn ordering_key(&self) -> (Timestamp, EndpointGuid) {
        (self.when, self.by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(v: Value, ticks: i64, guid: EndpointGuid) -> ValueRecord {
        ValueRecord::new(v, Timestamp::from_ticks(ticks), guid)
    }

    #[test]
    fn compare_structural_ignores_metadata_when_asked() {
        let guid_a = EndpointGuid::new();
        let guid_b = EndpointGuid::new();
        let a = rec(Value::Dword(1), 10, guid_a);
        let b = rec(Value::Dword(1), 20, guid_b);
        assert!(a.compare(&b, true));
        assert!(!a.compare(&b, false));
    }

    #[test]
    fn type_mismatch_on_wrong_accessor() {
        let v = Value::String("x".into());
        assert!(v.as_dword().is_err());
    }

    #[test]
    fn tombstone_read_is_not_found() {
        let v = Value::Deleted;
        assert!(v.as_string().is_err());
        assert!(v.is_tombstone());
    }

    #[test]
    fn blob_ref_hashes_content() {
        let a = BlobRef::from_bytes(b"hello");
        let b = BlobRef::from_bytes(b"hello");
        assert_eq!(a, b);
        let c = BlobRef::from_bytes(b"world");
        assert_ne!(a, c);
    }
}
