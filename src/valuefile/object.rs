//! Representative value object: the fixed-size record a leaf's key slot
//! points at, holding the row's value fields (spec §3 "Value object",
//! §4.2 "Value File", §6 "packed fields").
//!
//! Every value field gets a cell whose width never varies with the
//! value actually stored: an `Inside` variable-length field
//! (`String`/`Binary`) pads to its schema's `max_len`, and an `Outside`
//! or array field stores a fixed six-byte [`ObjectId`] pointing at a
//! (possibly chained) object elsewhere in the Value file. A
//! representative object can therefore always be rewritten in place —
//! only the chains it references ever grow or shrink.

use crate::chain::{self, AreaStore};
use crate::error::{Result, StorageError};
use crate::types::{
    decode_scalar, decode_varint, encode_scalar, encode_varint, FieldDescriptor, FieldType,
    FieldValue, ObjectId, ObjectType, PageId, Placement, Schema,
};

/// Offset of the owning leaf's page ID.
pub const LEAF_PID_OFFSET: usize = 1;
/// Offset of the key's slot index within that leaf.
pub const KEY_SLOT_OFFSET: usize = 5;
/// Offset where the null bitmap, and then the packed field cells, begin.
pub const FIELDS_OFFSET_BASE: usize = 9;

pub fn null_bitmap_len(n_fields: usize) -> usize {
    (n_fields + 7) / 8
}

fn bit_get(bitmap: &[u8], i: usize) -> bool {
    bitmap[i / 8] & (1 << (i % 8)) != 0
}

fn bit_set(bitmap: &mut [u8], i: usize, v: bool) {
    if v {
        bitmap[i / 8] |= 1 << (i % 8);
    }
}

/// A field stored as a fixed [`ObjectId`] reference rather than inline
/// bytes: arrays always, and `Outside`-placed variable-length fields.
fn is_reference(field: &FieldDescriptor) -> bool {
    field.ty.is_array() || field.placement == Placement::Outside
}

/// Fixed cell width for one value field's slot (not counting its
/// null-bitmap bit).
pub fn field_cell_size(field: &FieldDescriptor) -> usize {
    if is_reference(field) {
        crate::types::OBJECT_ID_DISK_SIZE
    } else {
        match &field.ty {
            FieldType::String { max_len } | FieldType::Binary { max_len } => 1 + max_len,
            other => other.fixed_cell_size(),
        }
    }
}

/// Total byte size of a representative object for `schema` — constant
/// regardless of the values it holds.
pub fn representative_size(schema: &Schema) -> usize {
    let fields = schema.value_fields();
    FIELDS_OFFSET_BASE
        + null_bitmap_len(fields.len())
        + fields.iter().map(field_cell_size).sum::<usize>()
}

/// A decoded representative object.
pub struct Representative {
    pub leaf_pid: PageId,
    pub key_slot: u32,
    pub values: Vec<FieldValue>,
}

/// Encode a representative object. `store` is only consulted for
/// `Outside`/array fields, whose bytes are chained off to their own
/// areas; everything else is packed inline.
pub fn encode_representative(
    schema: &Schema,
    leaf_pid: PageId,
    key_slot: u32,
    values: &[FieldValue],
    store: &dyn AreaStore,
) -> Result<Vec<u8>> {
    let fields = schema.value_fields();
    if values.len() != fields.len() {
        return Err(StorageError::invalid_operation(format!(
            "value tuple has {} fields, schema expects {}",
            values.len(),
            fields.len()
        )));
    }

    let mut buf = vec![0u8; representative_size(schema)];
    buf[0] = ObjectType::normal().as_byte();
    buf[LEAF_PID_OFFSET..LEAF_PID_OFFSET + 4].copy_from_slice(&leaf_pid.value().to_be_bytes());
    buf[KEY_SLOT_OFFSET..KEY_SLOT_OFFSET + 4].copy_from_slice(&key_slot.to_be_bytes());

    let bitmap_len = null_bitmap_len(fields.len());
    let bitmap_start = FIELDS_OFFSET_BASE;
    let mut cell_offset = bitmap_start + bitmap_len;

    for (i, (field, value)) in fields.iter().zip(values).enumerate() {
        let size = field_cell_size(field);
        if value.is_null() {
            if !field.nullable {
                return Err(StorageError::invalid_operation("null in non-nullable field"));
            }
            bit_set(&mut buf[bitmap_start..bitmap_start + bitmap_len], i, true);
            cell_offset += size;
            continue;
        }
        let cell = &mut buf[cell_offset..cell_offset + size];
        if is_reference(field) {
            let id = write_reference(field, value, store)?;
            id.write(cell);
        } else {
            write_inline(field, value, cell)?;
        }
        cell_offset += size;
    }

    Ok(buf)
}

/// Decode a representative object. References into `Outside`/array
/// fields are resolved eagerly; callers that only need a projection of
/// a few fields should slice `schema` down before calling this.
pub fn decode_representative(
    schema: &Schema,
    bytes: &[u8],
    store: &dyn AreaStore,
) -> Result<Representative> {
    if bytes.len() < FIELDS_OFFSET_BASE {
        return Err(StorageError::corruption("representative object truncated"));
    }
    let leaf_pid = PageId::new(u32::from_be_bytes(
        bytes[LEAF_PID_OFFSET..LEAF_PID_OFFSET + 4].try_into().unwrap(),
    ));
    let key_slot = u32::from_be_bytes(
        bytes[KEY_SLOT_OFFSET..KEY_SLOT_OFFSET + 4].try_into().unwrap(),
    );

    let fields = schema.value_fields();
    let bitmap_len = null_bitmap_len(fields.len());
    let bitmap_start = FIELDS_OFFSET_BASE;
    let bitmap = &bytes[bitmap_start..bitmap_start + bitmap_len];
    let mut cell_offset = bitmap_start + bitmap_len;

    let mut values = Vec::with_capacity(fields.len());
    for (i, field) in fields.iter().enumerate() {
        let size = field_cell_size(field);
        if bit_get(bitmap, i) {
            values.push(FieldValue::Null);
            cell_offset += size;
            continue;
        }
        let cell = &bytes[cell_offset..cell_offset + size];
        let value = if is_reference(field) {
            let id = ObjectId::read(cell)
                .ok_or_else(|| StorageError::corruption("truncated object id"))?;
            read_reference(field, id, store)?
        } else {
            read_inline(field, cell)?
        };
        values.push(value);
        cell_offset += size;
    }

    Ok(Representative {
        leaf_pid,
        key_slot,
        values,
    })
}

/// Free every `Outside`/array chain a representative object references,
/// without touching the representative object's own area — the caller
/// frees that separately once this returns.
pub fn free_representative_references(
    schema: &Schema,
    bytes: &[u8],
    store: &dyn AreaStore,
) -> Result<()> {
    let fields = schema.value_fields();
    let bitmap_len = null_bitmap_len(fields.len());
    let bitmap_start = FIELDS_OFFSET_BASE;
    let bitmap = &bytes[bitmap_start..bitmap_start + bitmap_len];
    let mut cell_offset = bitmap_start + bitmap_len;
    for (i, field) in fields.iter().enumerate() {
        let size = field_cell_size(field);
        if !bit_get(bitmap, i) && is_reference(field) {
            let cell = &bytes[cell_offset..cell_offset + size];
            if let Some(id) = ObjectId::read(cell) {
                chain::free_chain(store, id)?;
            }
        }
        cell_offset += size;
    }
    Ok(())
}

fn write_reference(field: &FieldDescriptor, value: &FieldValue, store: &dyn AreaStore) -> Result<ObjectId> {
    match (&field.ty, value) {
        (FieldType::Array { element, .. }, FieldValue::Array(items)) => {
            let mut payload = Vec::new();
            payload.extend(encode_varint(items.len() as u64));
            for item in items {
                if item.is_null() {
                    payload.push(1);
                } else {
                    payload.push(0);
                    encode_scalar(element, item, &mut payload)?;
                }
            }
            chain::write_array_chain(store, &payload)
        }
        (FieldType::String { .. }, FieldValue::String(s)) => {
            chain::write_chain(store, s.as_bytes(), None, true)
        }
        (FieldType::Binary { .. }, FieldValue::Binary(b)) => chain::write_chain(store, b, None, false),
        _ => Err(StorageError::invalid_operation("value does not match field type")),
    }
}

fn read_reference(field: &FieldDescriptor, id: ObjectId, store: &dyn AreaStore) -> Result<FieldValue> {
    let read = chain::read_chain(store, id)?;
    match &field.ty {
        FieldType::Array { element, .. } => {
            let (count, mut offset) =
                decode_varint(&read.bytes).ok_or_else(|| StorageError::corruption("bad array length"))?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                if offset >= read.bytes.len() {
                    return Err(StorageError::corruption("truncated array"));
                }
                let is_null = read.bytes[offset] != 0;
                offset += 1;
                if is_null {
                    items.push(FieldValue::Null);
                    continue;
                }
                let (value, consumed) = decode_scalar(element, &read.bytes[offset..])?;
                offset += consumed;
                items.push(value);
            }
            Ok(FieldValue::Array(items))
        }
        FieldType::String { .. } => Ok(FieldValue::String(
            String::from_utf8(read.bytes).map_err(|_| StorageError::corruption("invalid utf-8"))?,
        )),
        FieldType::Binary { .. } => Ok(FieldValue::Binary(read.bytes)),
        _ => Err(StorageError::invalid_operation("unexpected reference field type")),
    }
}

fn write_inline(field: &FieldDescriptor, value: &FieldValue, cell: &mut [u8]) -> Result<()> {
    match &field.ty {
        FieldType::String { max_len } | FieldType::Binary { max_len } => {
            let bytes: &[u8] = match value {
                FieldValue::String(s) => s.as_bytes(),
                FieldValue::Binary(b) => b,
                _ => return Err(StorageError::invalid_operation("value does not match field type")),
            };
            if bytes.len() > *max_len {
                return Err(StorageError::ValueTooLarge {
                    size: bytes.len(),
                    max: *max_len,
                });
            }
            cell[0] = bytes.len() as u8;
            cell[1..1 + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
        other => {
            let mut scratch = Vec::with_capacity(cell.len());
            encode_scalar(other, value, &mut scratch)?;
            if scratch.len() != cell.len() {
                return Err(StorageError::corruption("fixed field cell size mismatch"));
            }
            cell.copy_from_slice(&scratch);
            Ok(())
        }
    }
}

fn read_inline(field: &FieldDescriptor, cell: &[u8]) -> Result<FieldValue> {
    match &field.ty {
        FieldType::String { .. } => {
            let len = cell[0] as usize;
            Ok(FieldValue::String(
                String::from_utf8(cell[1..1 + len].to_vec())
                    .map_err(|_| StorageError::corruption("invalid utf-8"))?,
            ))
        }
        FieldType::Binary { .. } => {
            let len = cell[0] as usize;
            Ok(FieldValue::Binary(cell[1..1 + len].to_vec()))
        }
        other => {
            let (value, _) = decode_scalar(other, cell)?;
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDescriptor as FD, Uniqueness};
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MemStore {
        areas: RefCell<HashMap<u16, Vec<u8>>>,
        next: RefCell<u16>,
    }

    impl MemStore {
        fn new() -> Self {
            Self {
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
            4000
        }
    }

    fn schema() -> Schema {
        Schema::new(
            vec![
                FD::new(FieldType::Int32),
                FD::new(FieldType::String { max_len: 16 }).nullable(true),
                FD::new(FieldType::String { max_len: 10_000 }).outside(),
                FD::new(FieldType::Array {
                    element: Box::new(FieldType::Int32),
                    max_elements: 100,
                })
                .outside(),
            ],
            1,
            Uniqueness::KeyUnique,
        )
    }

    #[test]
    fn representative_size_is_constant() {
        let schema = schema();
        let store = MemStore::new();
        let a = encode_representative(
            &schema,
            PageId::new(3),
            0,
            &[
                FieldValue::String("hi".into()),
                FieldValue::String("a longer outside string value".into()),
                FieldValue::Array(vec![FieldValue::Int32(1), FieldValue::Int32(2)]),
            ],
            &store,
        )
        .unwrap();
        let b = encode_representative(
            &schema,
            PageId::new(9),
            7,
            &[
                FieldValue::Null,
                FieldValue::String("x".into()),
                FieldValue::Array(vec![]),
            ],
            &store,
        )
        .unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a.len(), representative_size(&schema));
    }

    #[test]
    fn roundtrip_with_outside_and_array_fields() {
        let schema = schema();
        let store = MemStore::new();
        let values = vec![
            FieldValue::String("hi".into()),
            FieldValue::String("a longer outside string value".into()),
            FieldValue::Array(vec![FieldValue::Int32(1), FieldValue::Int32(2), FieldValue::Int32(3)]),
        ];
        let bytes = encode_representative(&schema, PageId::new(5), 2, &values, &store).unwrap();
        let decoded = decode_representative(&schema, &bytes, &store).unwrap();
        assert_eq!(decoded.leaf_pid, PageId::new(5));
        assert_eq!(decoded.key_slot, 2);
        assert_eq!(decoded.values, values);
    }

    #[test]
    fn null_bit_skips_reference_read() {
        let schema = schema();
        let store = MemStore::new();
        let values = vec![FieldValue::Null, FieldValue::String("y".into()), FieldValue::Null];
        let bytes = encode_representative(&schema, PageId::new(1), 0, &values, &store).unwrap();
        let decoded = decode_representative(&schema, &bytes, &store).unwrap();
        assert_eq!(decoded.values, values);
    }
}
