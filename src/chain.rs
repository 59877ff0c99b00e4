//! Outside-object framing: chaining page areas so a single field's value
//! can span more than one page (spec §3 "Key object"/"Outside object",
//! §4.2 "Value File", §6 "File-format contract").
//!
//! A fragment is tagged `Normal`/`Compressed` when it is the chain's last
//! (or only) piece, `Divide`/`DivideCompressed` when another fragment
//! follows. The first fragment additionally carries the pair
//! `(uncompressed_len, compressed_len)` when the chain holds compressed
//! bytes — written once, not repeated per fragment. This module only
//! frames bytes the caller already compressed or not; it does not choose
//! or run a compression algorithm (spec §1 Non-goals).
//!
//! [`AreaStore`] abstracts "a place that can allocate/read/rewrite/free
//! an area, sized to fit one page". Both the Value file (outside
//! variable/array fields) and the Tree file (outside key objects) chain
//! through this same trait, grounded in the teacher's `DiskManager`/
//! `BufferPool` split between "where bytes live" and "how they are
//! shaped".

use crate::error::{Result, StorageError};
use crate::types::{ObjectId, ObjectType};

/// Something that can allocate, read, rewrite and free one area at a
/// time, sized to fit in a single page (spec §6 "area-level on a page").
pub trait AreaStore {
    fn alloc(&self, bytes: &[u8]) -> Result<ObjectId>;
    fn read(&self, id: ObjectId) -> Result<Vec<u8>>;
    fn rewrite(&self, id: ObjectId, bytes: &[u8]) -> Result<()>;
    fn free(&self, id: ObjectId) -> Result<()>;
    /// Largest content payload (excluding this module's own framing
    /// overhead) a single fragment can carry.
    fn max_fragment_payload(&self) -> usize;
}

const NEXT_ID_SIZE: usize = crate::types::OBJECT_ID_DISK_SIZE;
const COMPRESSED_HEADER_SIZE: usize = 8;

/// Write `payload` as a chain of fragments, returning the first
/// fragment's object ID. `compressed_lens`, when set, marks the payload
/// as already-compressed bytes and records `(uncompressed_len,
/// compressed_len)` once, in the first fragment.
pub fn write_chain(
    store: &dyn AreaStore,
    payload: &[u8],
    compressed_lens: Option<(u32, u32)>,
    even_byte_chunks: bool,
) -> Result<ObjectId> {
    write_chain_typed(store, payload, compressed_lens, even_byte_chunks, false)
}

/// As [`write_chain`], but tags every fragment as part of an array chain
/// (`Array`/`DivideArray`) instead of a plain variable-length one. Array
/// chains never carry the compressed-length header.
pub fn write_array_chain(store: &dyn AreaStore, payload: &[u8]) -> Result<ObjectId> {
    write_chain_typed(store, payload, None, false, true)
}

fn write_chain_typed(
    store: &dyn AreaStore,
    payload: &[u8],
    compressed_lens: Option<(u32, u32)>,
    even_byte_chunks: bool,
    array: bool,
) -> Result<ObjectId> {
    let base_type = if array {
        ObjectType::from_byte(ObjectType::ARRAY)
    } else if compressed_lens.is_some() {
        ObjectType::from_byte(ObjectType::COMPRESSED)
    } else {
        ObjectType::normal()
    };

    let budget = store.max_fragment_payload();
    if budget <= NEXT_ID_SIZE {
        return Err(StorageError::invalid_operation(
            "page too small to hold even one chained fragment",
        ));
    }

    let first_overhead = if compressed_lens.is_some() {
        COMPRESSED_HEADER_SIZE
    } else {
        0
    };
    let first_budget = budget.saturating_sub(first_overhead);
    let cont_budget = budget;

    // Single-fragment fast path.
    if payload.len() <= first_budget {
        let mut buf = Vec::with_capacity(1 + first_overhead + payload.len());
        buf.push(base_type.as_byte());
        if let Some((u, c)) = compressed_lens {
            buf.extend(u.to_be_bytes());
            buf.extend(c.to_be_bytes());
        }
        buf.extend(payload);
        return store.alloc(&buf);
    }

    // Reserve room for the next-object-id in every fragment that will
    // carry one (every fragment but the last).
    let first_chunk_cap = first_budget.saturating_sub(NEXT_ID_SIZE).max(1);
    let cont_chunk_cap = cont_budget.saturating_sub(NEXT_ID_SIZE).max(1);

    let mut chunks: Vec<&[u8]> = Vec::new();
    let first_len = chunk_len(payload.len(), first_chunk_cap, even_byte_chunks);
    let (first_chunk, mut rest) = payload.split_at(first_len);
    chunks.push(first_chunk);
    while !rest.is_empty() {
        let len = chunk_len(rest.len(), cont_chunk_cap, even_byte_chunks).min(rest.len());
        let (c, r) = rest.split_at(len);
        chunks.push(c);
        rest = r;
    }

    let last_index = chunks.len() - 1;
    let mut next_id = ObjectId::NULL;
    let mut first_id = ObjectId::NULL;
    for i in (0..chunks.len()).rev() {
        let is_terminal = i == last_index;
        let ty = if is_terminal {
            base_type
        } else {
            base_type.next_fragment_tag()
        };
        let mut buf = Vec::with_capacity(1 + NEXT_ID_SIZE + first_overhead + chunks[i].len());
        buf.push(ty.as_byte());
        if !is_terminal {
            let mut id_buf = [0u8; NEXT_ID_SIZE];
            next_id.write(&mut id_buf);
            buf.extend(id_buf);
        }
        if i == 0 {
            if let Some((u, c)) = compressed_lens {
                buf.extend(u.to_be_bytes());
                buf.extend(c.to_be_bytes());
            }
        }
        buf.extend(chunks[i]);
        let id = store.alloc(&buf)?;
        next_id = id;
        if i == 0 {
            first_id = id;
        }
    }
    Ok(first_id)
}

/// For `String` fields the per-fragment payload must stay an even byte
/// count so a UTF-16 re-encoding never splits a surrogate pair across
/// fragments (spec §4.2).
fn chunk_len(remaining: usize, cap: usize, even: bool) -> usize {
    let len = remaining.min(cap);
    if even && len % 2 != 0 && len < remaining {
        len - 1
    } else {
        len
    }
}

/// Concatenated fragment payloads plus, if the chain was written
/// compressed, the `(uncompressed_len, compressed_len)` recorded in the
/// first fragment.
pub struct ChainRead {
    pub bytes: Vec<u8>,
    pub compressed_lens: Option<(u32, u32)>,
}

pub fn read_chain(store: &dyn AreaStore, first: ObjectId) -> Result<ChainRead> {
    let mut bytes = Vec::new();
    let mut compressed_lens = None;
    let mut current = first;
    let mut first_fragment = true;
    loop {
        let raw = store.read(current)?;
        if raw.is_empty() {
            return Err(StorageError::corruption("empty outside-object fragment"));
        }
        let ty = ObjectType::from_byte(raw[0]);
        let mut offset = 1;
        let next = if ty.is_divide() {
            let id = ObjectId::read(&raw[offset..])
                .ok_or_else(|| StorageError::corruption("truncated chain next-id"))?;
            offset += NEXT_ID_SIZE;
            Some(id)
        } else {
            None
        };
        if first_fragment && ty.is_compressed() {
            if raw.len() < offset + COMPRESSED_HEADER_SIZE {
                return Err(StorageError::corruption("truncated compressed header"));
            }
            let u = u32::from_be_bytes(raw[offset..offset + 4].try_into().unwrap());
            let c = u32::from_be_bytes(raw[offset + 4..offset + 8].try_into().unwrap());
            compressed_lens = Some((u, c));
            offset += COMPRESSED_HEADER_SIZE;
        }
        bytes.extend(&raw[offset..]);
        first_fragment = false;
        match next {
            Some(id) => current = id,
            None => break,
        }
    }
    Ok(ChainRead {
        bytes,
        compressed_lens,
    })
}

/// Free every fragment in a chain.
pub fn free_chain(store: &dyn AreaStore, first: ObjectId) -> Result<()> {
    let mut current = first;
    loop {
        let raw = store.read(current)?;
        if raw.is_empty() {
            return Err(StorageError::corruption("empty outside-object fragment"));
        }
        let ty = ObjectType::from_byte(raw[0]);
        let next = if ty.is_divide() {
            Some(
                ObjectId::read(&raw[1..])
                    .ok_or_else(|| StorageError::corruption("truncated chain next-id"))?,
            )
        } else {
            None
        };
        store.free(current)?;
        match next {
            Some(id) => current = id,
            None => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use crate::types::PageId;

    /// An in-memory `AreaStore` standing in for a single, generously
    /// sized page so chain logic can be tested without the buffer pool.
    struct MemStore {
        budget: usize,
        areas: RefCell<HashMap<u16, Vec<u8>>>,
        next: RefCell<u16>,
    }

    impl MemStore {
        fn new(budget: usize) -> Self {
            Self {
                budget,
                areas: RefCell::new(HashMap::new()),
                next: RefCell::new(0),
            }
        }
    }

    impl AreaStore for MemStore {
        fn alloc(&self, bytes: &[u8]) -> Result<ObjectId> {
            let mut next = self.next.borrow_mut();
            let id = *next;
            *next += 1;
            self.areas.borrow_mut().insert(id, bytes.to_vec());
            Ok(ObjectId::new(PageId::new(1), id))
        }

        fn read(&self, id: ObjectId) -> Result<Vec<u8>> {
            Ok(self.areas.borrow()[&id.area_id()].clone())
        }

        fn rewrite(&self, id: ObjectId, bytes: &[u8]) -> Result<()> {
            self.areas.borrow_mut().insert(id.area_id(), bytes.to_vec());
            Ok(())
        }

        fn free(&self, id: ObjectId) -> Result<()> {
            self.areas.borrow_mut().remove(&id.area_id());
            Ok(())
        }

        fn max_fragment_payload(&self) -> usize {
            self.budget
        }
    }

    #[test]
    fn single_fragment_roundtrip() {
        let store = MemStore::new(4096);
        let id = write_chain(&store, b"small value", None, false).unwrap();
        let read = read_chain(&store, id).unwrap();
        assert_eq!(read.bytes, b"small value");
        assert!(read.compressed_lens.is_none());
    }

    #[test]
    fn chained_fragments_roundtrip() {
        let store = MemStore::new(16);
        let payload: Vec<u8> = (0..200u16).map(|i| (i % 251) as u8).collect();
        let id = write_chain(&store, &payload, None, false).unwrap();
        let read = read_chain(&store, id).unwrap();
        assert_eq!(read.bytes, payload);
    }

    #[test]
    fn compressed_header_roundtrips_once() {
        let store = MemStore::new(32);
        let payload: Vec<u8> = (0..100u8).collect();
        let id = write_chain(&store, &payload, Some((500, 100)), false).unwrap();
        let read = read_chain(&store, id).unwrap();
        assert_eq!(read.bytes, payload);
        assert_eq!(read.compressed_lens, Some((500, 100)));
    }

    #[test]
    fn free_chain_removes_all_fragments() {
        let store = MemStore::new(16);
        let payload: Vec<u8> = (0..100u8).collect();
        let id = write_chain(&store, &payload, None, false).unwrap();
        free_chain(&store, id).unwrap();
        assert!(store.areas.borrow().is_empty());
    }
}
