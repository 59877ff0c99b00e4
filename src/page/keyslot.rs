//! Key slot encoding.
//!
//! A slot's key is either inlined or, when the schema-encoded key would
//! not leave room for at least two slots per page, stored as an
//! out-of-row key object and referenced here by [`ObjectId`] (spec §4.1
//! "Key table layout", §3 "Key object").

use crate::types::{decode_varint, encode_varint, ObjectId, PageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRepr {
    Inline(Vec<u8>),
    Indirect(ObjectId),
}

/// What a slot points at: a value-file object (leaf) or a child page
/// (internal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Value(ObjectId),
    Child(PageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCell {
    pub key: KeyRepr,
    pub payload: Payload,
}

impl NodeCell {
    pub fn new_leaf(key: KeyRepr, value: ObjectId) -> Self {
        Self {
            key,
            payload: Payload::Value(value),
        }
    }

    pub fn new_interior(key: KeyRepr, child: PageId) -> Self {
        Self {
            key,
            payload: Payload::Child(child),
        }
    }

    pub fn value(&self) -> Option<ObjectId> {
        match self.payload {
            Payload::Value(v) => Some(v),
            Payload::Child(_) => None,
        }
    }

    pub fn child(&self) -> Option<PageId> {
        match self.payload {
            Payload::Child(c) => Some(c),
            Payload::Value(_) => None,
        }
    }

    pub fn encoded_size(&self) -> usize {
        let key_size = match &self.key {
            KeyRepr::Inline(bytes) => 1 + encode_varint(bytes.len() as u64).len() + bytes.len(),
            KeyRepr::Indirect(_) => 1 + crate::types::OBJECT_ID_DISK_SIZE,
        };
        let payload_size = match self.payload {
            Payload::Value(_) => crate::types::OBJECT_ID_DISK_SIZE,
            Payload::Child(_) => 4,
        };
        key_size + payload_size
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        match &self.key {
            KeyRepr::Inline(bytes) => {
                buf.push(0);
                buf.extend(encode_varint(bytes.len() as u64));
                buf.extend(bytes);
            }
            KeyRepr::Indirect(object_id) => {
                buf.push(1);
                let mut id_buf = [0u8; crate::types::OBJECT_ID_DISK_SIZE];
                object_id.write(&mut id_buf);
                buf.extend(id_buf);
            }
        }
        match self.payload {
            Payload::Value(object_id) => {
                let mut id_buf = [0u8; crate::types::OBJECT_ID_DISK_SIZE];
                object_id.write(&mut id_buf);
                buf.extend(id_buf);
            }
            Payload::Child(page_id) => buf.extend(page_id.value().to_be_bytes()),
        }
        buf
    }

    pub fn decode_leaf(bytes: &[u8]) -> Option<(Self, usize)> {
        let (key, mut offset) = Self::decode_key(bytes)?;
        let value = ObjectId::read(&bytes[offset..])?;
        offset += crate::types::OBJECT_ID_DISK_SIZE;
        Some((Self::new_leaf(key, value), offset))
    }

    pub fn decode_interior(bytes: &[u8]) -> Option<(Self, usize)> {
        let (key, mut offset) = Self::decode_key(bytes)?;
        if bytes.len() < offset + 4 {
            return None;
        }
        let child = PageId::new(u32::from_be_bytes(bytes[offset..offset + 4].try_into().ok()?));
        offset += 4;
        Some((Self::new_interior(key, child), offset))
    }

    fn decode_key(bytes: &[u8]) -> Option<(KeyRepr, usize)> {
        if bytes.is_empty() {
            return None;
        }
        let tag = bytes[0];
        let mut offset = 1;
        match tag {
            0 => {
                let (len, n) = decode_varint(&bytes[offset..])?;
                offset += n;
                let len = len as usize;
                if bytes.len() < offset + len {
                    return None;
                }
                let key_bytes = bytes[offset..offset + len].to_vec();
                offset += len;
                Some((KeyRepr::Inline(key_bytes), offset))
            }
            1 => {
                let id = ObjectId::read(&bytes[offset..])?;
                offset += crate::types::OBJECT_ID_DISK_SIZE;
                Some((KeyRepr::Indirect(id), offset))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_cell_roundtrip_inline() {
        let cell = NodeCell::new_leaf(
            KeyRepr::Inline(b"hello".to_vec()),
            ObjectId::new(PageId::new(3), 1),
        );
        let encoded = cell.encode();
        let (decoded, size) = NodeCell::decode_leaf(&encoded).unwrap();
        assert_eq!(size, encoded.len());
        assert_eq!(decoded, cell);
    }

    #[test]
    fn interior_cell_roundtrip_indirect() {
        let cell = NodeCell::new_interior(
            KeyRepr::Indirect(ObjectId::new(PageId::new(9), 2)),
            PageId::new(42),
        );
        let encoded = cell.encode();
        let (decoded, size) = NodeCell::decode_interior(&encoded).unwrap();
        assert_eq!(size, encoded.len());
        assert_eq!(decoded, cell);
    }
}
