//! Dynamically shaped pipeline values
//!
//! Pipelines that cross the process boundary move a single sum type,
//! [`Value`], whose leaves are raw byte buffers of known size. Composite
//! shapes are ordered tuples, lists and string-keyed maps with sorted
//! iteration order, so the packed layout of a value is deterministic.
//!
//! The [`Bytes`] leaf either owns its storage or borrows it from a
//! shared-memory slot; the borrowed form is what makes zero-copy transport
//! observable to the user while the slot's ref-count keeps it alive.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::de::{ self, Visitor };
use serde::{ Deserialize, Deserializer, Serialize, Serializer };

use crate::prefetch::arena::SlotHandle;

/// Byte buffer leaf, owned or borrowed from a shared-memory slot
#[derive(Clone)]
pub struct Bytes(BytesRepr);

#[derive(Clone)]
enum BytesRepr {
    Owned(Vec<u8>),
    Shared {
        slot: Arc<SlotHandle>,
        offset: usize,
        len: usize,
    },
}

impl Bytes {
    pub(crate) fn shared(slot: Arc<SlotHandle>, offset: usize, len: usize) -> Self {
        Self(BytesRepr::Shared { slot, offset, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.0 {
            BytesRepr::Owned(v) => v,
            BytesRepr::Shared { slot, offset, len } => &slot.bytes()[*offset..*offset + *len],
        }
    }

    /// Whether this buffer borrows from a shared-memory slot
    pub fn is_shared(&self) -> bool {
        matches!(self.0, BytesRepr::Shared { .. })
    }

    pub fn len(&self) -> usize {
        match &self.0 {
            BytesRepr::Owned(v) => v.len(),
            BytesRepr::Shared { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy into an owned buffer, detaching from any shared slot
    pub fn to_owned_bytes(&self) -> Bytes {
        Bytes(BytesRepr::Owned(self.as_slice().to_vec()))
    }
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(BytesRepr::Owned(v))
    }
}

impl From<&[u8]> for Bytes {
    fn from(v: &[u8]) -> Self {
        Self(BytesRepr::Owned(v.to_vec()))
    }
}

impl PartialEq for Bytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_shared() { "shared" } else { "owned" };
        write!(f, "Bytes({kind}, {} bytes)", self.len())
    }
}

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.as_slice())
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Bytes;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte buffer")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Bytes, E> {
                Ok(Bytes::from(v))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Bytes, E> {
                Ok(Bytes::from(v))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Bytes, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(Bytes::from(out))
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

/// Dynamically shaped value moved through a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip_through_bincode() {
        let v = Value::Tuple(
            vec![
                Value::Int(42),
                Value::Bytes(Bytes::from(vec![1u8, 2, 3])),
                Value::Map(BTreeMap::from([("k".to_string(), Value::Float(0.5))]))
            ]
        );
        let enc = bincode::serde::encode_to_vec(&v, bincode::config::standard()).unwrap();
        let (back, _): (Value, usize) = bincode::serde
            ::decode_from_slice(&enc, bincode::config::standard())
            .unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_map_iterates_in_key_order() {
        let m = BTreeMap::from([
            ("zz".to_string(), Value::Int(1)),
            ("aa".to_string(), Value::Int(2)),
        ]);
        let keys: Vec<&str> = m.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["aa", "zz"]);
    }

    #[test]
    fn test_bytes_equality_ignores_storage() {
        let owned = Bytes::from(vec![1u8, 2, 3]);
        assert_eq!(owned, Bytes::from(&[1u8, 2, 3][..]));
        assert_eq!(owned.to_owned_bytes(), owned);
    }
}
