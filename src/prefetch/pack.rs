//! Byte-level layout of values over shared-memory slots
//!
//! A packed value is two things: its buffer leaves written contiguously
//! into the assigned arena slot, and a small recursive descriptor (the
//! [`PackedNode`]) listing, for every leaf, the `(offset, len)` range it
//! occupies. The descriptor travels through the worker's result pipe; the
//! bulk bytes never leave the slot, and reconstruction borrows them in
//! place.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{ Deserialize, Serialize };
use thiserror::Error;

use crate::error::{ Result, SlipstreamError };
use crate::prefetch::arena::SlotView;
use crate::value::Value;

/// Failure to pack a value into its assigned slot.
///
/// Overflow is not fatal: the worker falls back to serialized transport
/// for the offending item.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("packed payload needs {needed} bytes but the slot holds {available}")]
    Overflow {
        needed: usize,
        available: usize,
    },
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Recursive descriptor of a packed value.
///
/// Scalars ride inline; buffer leaves are `(offset, len)` ranges inside
/// the slot. Map entries are keyed and sorted, so pack and unpack walk
/// leaves in the same order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PackedNode {
    Int(i64),
    Float(f64),
    Str(String),
    Leaf {
        offset: u32,
        len: u32,
    },
    Tuple(Vec<PackedNode>),
    List(Vec<PackedNode>),
    Map(BTreeMap<String, PackedNode>),
}

/// Bump writer over an arena slot
pub struct SlotWriter<'a> {
    buf: &'a mut [u8],
    used: usize,
}

impl<'a> SlotWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, used: 0 }
    }

    /// Append `bytes` to the slot, returning their `(offset, len)` range.
    pub fn put(&mut self, bytes: &[u8]) -> std::result::Result<(u32, u32), PackError> {
        let offset = self.used;
        let end = offset + bytes.len();
        if end > self.buf.len() {
            return Err(PackError::Overflow { needed: end, available: self.buf.len() });
        }
        self.buf[offset..end].copy_from_slice(bytes);
        self.used = end;
        Ok((offset as u32, bytes.len() as u32))
    }

    /// Bytes written so far
    pub fn used(&self) -> usize {
        self.used
    }
}

/// Values that can ride the shared-memory transport.
///
/// The default methods move the whole bincode encoding through the slot as
/// a single leaf, so any serde type opts in with an empty impl. [`Value`]
/// overrides them with leaf-level packing, which is what makes its byte
/// buffers zero-copy on the consumer side.
pub trait Packable: Serialize + DeserializeOwned + Send + 'static {
    /// Write buffer leaves into the slot and describe the layout.
    fn pack(&self, writer: &mut SlotWriter<'_>) -> std::result::Result<PackedNode, PackError> {
        let encoded = bincode::serde
            ::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PackError::Encode(e.to_string()))?;
        let (offset, len) = writer.put(&encoded)?;
        Ok(PackedNode::Leaf { offset, len })
    }

    /// Reconstruct a value from its descriptor and slot.
    fn unpack(node: &PackedNode, slot: &SlotView) -> Result<Self> {
        match node {
            PackedNode::Leaf { offset, len } => {
                let start = *offset as usize;
                let end = start + (*len as usize);
                let bytes = slot
                    .bytes()
                    .get(start..end)
                    .ok_or_else(|| {
                        SlipstreamError::serialization("packed range escapes the slot")
                    })?;
                let (value, _) = bincode::serde
                    ::decode_from_slice(bytes, bincode::config::standard())
                    .map_err(|e| SlipstreamError::serialization(e.to_string()))?;
                Ok(value)
            }
            _ => Err(SlipstreamError::serialization("expected a single packed leaf")),
        }
    }
}

impl Packable for Value {
    fn pack(&self, writer: &mut SlotWriter<'_>) -> std::result::Result<PackedNode, PackError> {
        match self {
            Value::Int(v) => Ok(PackedNode::Int(*v)),
            Value::Float(v) => Ok(PackedNode::Float(*v)),
            Value::Str(v) => Ok(PackedNode::Str(v.clone())),
            Value::Bytes(b) => {
                let (offset, len) = writer.put(b.as_slice())?;
                Ok(PackedNode::Leaf { offset, len })
            }
            Value::Tuple(items) => {
                let nodes = items
                    .iter()
                    .map(|v| v.pack(writer))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(PackedNode::Tuple(nodes))
            }
            Value::List(items) => {
                let nodes = items
                    .iter()
                    .map(|v| v.pack(writer))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(PackedNode::List(nodes))
            }
            Value::Map(entries) => {
                let mut nodes = BTreeMap::new();
                for (key, value) in entries {
                    nodes.insert(key.clone(), value.pack(writer)?);
                }
                Ok(PackedNode::Map(nodes))
            }
        }
    }

    fn unpack(node: &PackedNode, slot: &SlotView) -> Result<Self> {
        match node {
            PackedNode::Int(v) => Ok(Value::Int(*v)),
            PackedNode::Float(v) => Ok(Value::Float(*v)),
            PackedNode::Str(v) => Ok(Value::Str(v.clone())),
            PackedNode::Leaf { offset, len } => {
                Ok(Value::Bytes(slot.shared_bytes(*offset as usize, *len as usize)?))
            }
            PackedNode::Tuple(nodes) => {
                let items = nodes
                    .iter()
                    .map(|n| Value::unpack(n, slot))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Tuple(items))
            }
            PackedNode::List(nodes) => {
                let items = nodes
                    .iter()
                    .map(|n| Value::unpack(n, slot))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::List(items))
            }
            PackedNode::Map(nodes) => {
                let mut items = BTreeMap::new();
                for (key, node) in nodes {
                    items.insert(key.clone(), Value::unpack(node, slot)?);
                }
                Ok(Value::Map(items))
            }
        }
    }
}

macro_rules! impl_packable_with_defaults {
    ($($ty:ty),* $(,)?) => {
        $(impl Packable for $ty {})*
    };
}

impl_packable_with_defaults!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, bool, String);

impl<T> Packable for Vec<T> where T: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Packable for Option<T> where T: Serialize + DeserializeOwned + Send + 'static {}

impl<A, B> Packable for (A, B)
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        B: Serialize + DeserializeOwned + Send + 'static {}
