//! Field schema and value types.
//!
//! An index maps a key tuple (the first `key_field_count` fields of the
//! schema) to a value tuple (the remaining fields). Each field has a type,
//! a nullability flag, a sort direction (key fields only matter here) and a
//! placement (inside the representative object, or referenced as an
//! outside object when it is variable-length or an array).

use crate::error::{Result, StorageError};
use crate::types::varint::{decode_varint, encode_varint};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sort direction for a key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    /// Apply this direction as a +1/-1 multiplier to a raw comparison.
    pub fn apply(self, ord: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        }
    }
}

/// Where a field's value physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Value is always inlined in its owning object.
    Inside,
    /// Value may be written as a separate, possibly chained, area object
    /// when it does not fit inline. Only meaningful for variable-length
    /// and array fields.
    Outside,
}

/// The uniqueness mode of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Uniqueness {
    NotUnique,
    /// Distinct key tuples must compare unequal.
    KeyUnique,
    /// Distinct (key, value) tuples must compare unequal; a null in any
    /// participating field short-circuits the check as "distinct".
    TupleUnique,
}

/// The type of a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Int32,
    Int64,
    Float64Bits,
    /// Fixed-width opaque bytes (e.g. a packed timestamp).
    FixedBinary(usize),
    /// UTF-8 text, NO-PAD compared (shorter is less on a tied prefix).
    String { max_len: usize },
    /// Opaque variable-length bytes.
    Binary { max_len: usize },
    /// A homogeneous array of a (non-array) element type.
    Array {
        element: Box<FieldType>,
        max_elements: usize,
    },
}

impl FieldType {
    /// Whether values of this type are fixed-width on the wire.
    pub fn is_fixed(&self) -> bool {
        matches!(
            self,
            FieldType::Int32 | FieldType::Int64 | FieldType::Float64Bits | FieldType::FixedBinary(_)
        )
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldType::Array { .. })
    }

    /// Size of the fixed in-row cell for this type, not counting the null
    /// bitmap bit. Variable/array fields use an `ObjectId`-sized cell when
    /// placed `Outside`, or a length-prefixed inline cell when `Inside`.
    pub fn fixed_cell_size(&self) -> usize {
        match self {
            FieldType::Int32 => 4,
            FieldType::Int64 => 8,
            FieldType::Float64Bits => 8,
            FieldType::FixedBinary(n) => *n,
            FieldType::String { max_len } | FieldType::Binary { max_len } => *max_len,
            FieldType::Array { .. } => 0,
        }
    }
}

/// One field's schema entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub ty: FieldType,
    pub nullable: bool,
    pub direction: Direction,
    pub placement: Placement,
}

impl FieldDescriptor {
    pub fn new(ty: FieldType) -> Self {
        Self {
            ty,
            nullable: false,
            direction: Direction::Ascending,
            placement: Placement::Inside,
        }
    }

    pub fn nullable(mut self, yes: bool) -> Self {
        self.nullable = yes;
        self
    }

    pub fn direction(mut self, dir: Direction) -> Self {
        self.direction = dir;
        self
    }

    pub fn outside(mut self) -> Self {
        self.placement = Placement::Outside;
        self
    }
}

/// One field's runtime value. `Null` is represented out-of-band by the
/// owning null bitmap; a decoded tuple still carries `FieldValue::Null` in
/// the corresponding slot so callers need not consult the bitmap directly.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Int32(i32),
    Int64(i64),
    Float64(f64),
    FixedBinary(Vec<u8>),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

/// The full schema of an index: field descriptors plus the split between
/// key fields and value fields, and the uniqueness mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<FieldDescriptor>,
    pub key_field_count: usize,
    pub uniqueness: Uniqueness,
}

impl Schema {
    pub fn new(fields: Vec<FieldDescriptor>, key_field_count: usize, uniqueness: Uniqueness) -> Self {
        assert!(key_field_count >= 1, "an index needs at least one key field");
        assert!(key_field_count <= fields.len());
        Self {
            fields,
            key_field_count,
            uniqueness,
        }
    }

    pub fn key_fields(&self) -> &[FieldDescriptor] {
        &self.fields[..self.key_field_count]
    }

    pub fn value_fields(&self) -> &[FieldDescriptor] {
        &self.fields[self.key_field_count..]
    }

    /// Whether every key field is fixed-width, making the per-slot key
    /// stride constant and average-key-byte computation exact (spec §4.6).
    pub fn has_fixed_width_key(&self) -> bool {
        self.key_fields().iter().all(|f| f.ty.is_fixed())
    }

    /// Encode a key tuple to bytes suitable for inlining in a key slot, or
    /// for chaining through a key object when it does not fit.
    ///
    /// Layout per field: one null-flag byte, then the field's payload. This
    /// is not order-preserving; comparisons always go through
    /// [`Schema::compare_keys`] on the decoded tuple, never on raw bytes.
    pub fn encode_key(&self, key: &[FieldValue]) -> Result<Vec<u8>> {
        self.encode_tuple(self.key_fields(), key)
    }

    pub fn decode_key(&self, bytes: &[u8]) -> Result<Vec<FieldValue>> {
        let (tuple, _) = self.decode_tuple(self.key_fields(), bytes)?;
        Ok(tuple)
    }

    pub fn encode_value(&self, value: &[FieldValue]) -> Result<Vec<u8>> {
        self.encode_tuple(self.value_fields(), value)
    }

    pub fn decode_value(&self, bytes: &[u8]) -> Result<Vec<FieldValue>> {
        let (tuple, _) = self.decode_tuple(self.value_fields(), bytes)?;
        Ok(tuple)
    }

    fn encode_tuple(&self, fields: &[FieldDescriptor], tuple: &[FieldValue]) -> Result<Vec<u8>> {
        if tuple.len() != fields.len() {
            return Err(StorageError::invalid_operation(format!(
                "tuple has {} fields, schema expects {}",
                tuple.len(),
                fields.len()
            )));
        }
        let mut buf = Vec::new();
        for (field, value) in fields.iter().zip(tuple) {
            if value.is_null() {
                if !field.nullable {
                    return Err(StorageError::invalid_operation("null in non-nullable field"));
                }
                buf.push(1);
                continue;
            }
            buf.push(0);
            encode_value(&field.ty, value, &mut buf)?;
        }
        Ok(buf)
    }

    fn decode_tuple(&self, fields: &[FieldDescriptor], bytes: &[u8]) -> Result<(Vec<FieldValue>, usize)> {
        let mut offset = 0;
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            if offset >= bytes.len() {
                return Err(StorageError::corruption("tuple truncated"));
            }
            let is_null = bytes[offset] != 0;
            offset += 1;
            if is_null {
                out.push(FieldValue::Null);
                continue;
            }
            let (value, consumed) = decode_value(&field.ty, &bytes[offset..])?;
            offset += consumed;
            out.push(value);
        }
        Ok((out, offset))
    }

    /// Multi-field comparison: each field's directional comparison result
    /// is taken in turn, first non-zero wins. Nulls sort first under
    /// ascending direction, last under descending (spec §4.1 "Ordering").
    /// Strings compare NO-PAD (shorter is less on a tied prefix).
    pub fn compare_keys(&self, a: &[FieldValue], b: &[FieldValue]) -> Ordering {
        for (field, (av, bv)) in self.key_fields().iter().zip(a.iter().zip(b.iter())) {
            let raw = match (av, bv) {
                (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
                (FieldValue::Null, _) => Ordering::Less,
                (_, FieldValue::Null) => Ordering::Greater,
                _ => compare_values(av, bv),
            };
            // Null-first-ascending convention: reversing the raw
            // Less/Greater above under Descending gives null-last.
            let directed = field.direction.apply(raw);
            if directed != Ordering::Equal {
                return directed;
            }
        }
        Ordering::Equal
    }
}

fn compare_values(a: &FieldValue, b: &FieldValue) -> Ordering {
    match (a, b) {
        (FieldValue::Int32(x), FieldValue::Int32(y)) => x.cmp(y),
        (FieldValue::Int64(x), FieldValue::Int64(y)) => x.cmp(y),
        (FieldValue::Float64(x), FieldValue::Float64(y)) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (FieldValue::FixedBinary(x), FieldValue::FixedBinary(y)) => x.cmp(y),
        (FieldValue::String(x), FieldValue::String(y)) => x.as_str().cmp(y.as_str()),
        (FieldValue::Binary(x), FieldValue::Binary(y)) => x.cmp(y),
        (FieldValue::Array(x), FieldValue::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(xi, yi)| compare_values(xi, yi))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => Ordering::Equal,
    }
}

/// Encode one field's scalar payload, no length/null framing. Exposed to
/// [`crate::valuefile`] so the representative object's fixed-width cells
/// can reuse the same per-type wire format as the general tuple codec
/// above (spec §6 "packed fields").
pub(crate) fn encode_value(ty: &FieldType, value: &FieldValue, buf: &mut Vec<u8>) -> Result<()> {
    match (ty, value) {
        (FieldType::Int32, FieldValue::Int32(v)) => buf.extend(v.to_be_bytes()),
        (FieldType::Int64, FieldValue::Int64(v)) => buf.extend(v.to_be_bytes()),
        (FieldType::Float64Bits, FieldValue::Float64(v)) => buf.extend(v.to_bits().to_be_bytes()),
        (FieldType::FixedBinary(n), FieldValue::FixedBinary(v)) => {
            if v.len() != *n {
                return Err(StorageError::invalid_operation("fixed binary length mismatch"));
            }
            buf.extend(v);
        }
        (FieldType::String { max_len }, FieldValue::String(v)) => {
            let bytes = v.as_bytes();
            if bytes.len() > *max_len {
                return Err(StorageError::ValueTooLarge {
                    size: bytes.len(),
                    max: *max_len,
                });
            }
            buf.extend(encode_varint(bytes.len() as u64));
            buf.extend(bytes);
        }
        (FieldType::Binary { max_len }, FieldValue::Binary(v)) => {
            if v.len() > *max_len {
                return Err(StorageError::ValueTooLarge {
                    size: v.len(),
                    max: *max_len,
                });
            }
            buf.extend(encode_varint(v.len() as u64));
            buf.extend(v);
        }
        (FieldType::Array { element, max_elements }, FieldValue::Array(items)) => {
            if items.len() > *max_elements {
                return Err(StorageError::invalid_operation("array exceeds max element count"));
            }
            buf.extend(encode_varint(items.len() as u64));
            for item in items {
                if item.is_null() {
                    buf.push(1);
                } else {
                    buf.push(0);
                    encode_value(element, item, buf)?;
                }
            }
        }
        _ => return Err(StorageError::invalid_operation("value does not match field type")),
    }
    Ok(())
}

pub(crate) fn decode_value(ty: &FieldType, bytes: &[u8]) -> Result<(FieldValue, usize)> {
    match ty {
        FieldType::Int32 => {
            if bytes.len() < 4 {
                return Err(StorageError::corruption("truncated i32"));
            }
            Ok((
                FieldValue::Int32(i32::from_be_bytes(bytes[0..4].try_into().unwrap())),
                4,
            ))
        }
        FieldType::Int64 => {
            if bytes.len() < 8 {
                return Err(StorageError::corruption("truncated i64"));
            }
            Ok((
                FieldValue::Int64(i64::from_be_bytes(bytes[0..8].try_into().unwrap())),
                8,
            ))
        }
        FieldType::Float64Bits => {
            if bytes.len() < 8 {
                return Err(StorageError::corruption("truncated f64"));
            }
            let bits = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
            Ok((FieldValue::Float64(f64::from_bits(bits)), 8))
        }
        FieldType::FixedBinary(n) => {
            if bytes.len() < *n {
                return Err(StorageError::corruption("truncated fixed binary"));
            }
            Ok((FieldValue::FixedBinary(bytes[..*n].to_vec()), *n))
        }
        FieldType::String { .. } => {
            let (len, n) = decode_varint(bytes).ok_or_else(|| StorageError::corruption("bad varint"))?;
            let len = len as usize;
            if bytes.len() < n + len {
                return Err(StorageError::corruption("truncated string"));
            }
            let s = String::from_utf8(bytes[n..n + len].to_vec())
                .map_err(|_| StorageError::corruption("invalid utf-8"))?;
            Ok((FieldValue::String(s), n + len))
        }
        FieldType::Binary { .. } => {
            let (len, n) = decode_varint(bytes).ok_or_else(|| StorageError::corruption("bad varint"))?;
            let len = len as usize;
            if bytes.len() < n + len {
                return Err(StorageError::corruption("truncated binary"));
            }
            Ok((FieldValue::Binary(bytes[n..n + len].to_vec()), n + len))
        }
        FieldType::Array { element, .. } => {
            let (count, mut offset) =
                decode_varint(bytes).ok_or_else(|| StorageError::corruption("bad varint"))?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                if offset >= bytes.len() {
                    return Err(StorageError::corruption("truncated array"));
                }
                let is_null = bytes[offset] != 0;
                offset += 1;
                if is_null {
                    items.push(FieldValue::Null);
                    continue;
                }
                let (value, consumed) = decode_value(element, &bytes[offset..])?;
                offset += consumed;
                items.push(value);
            }
            Ok((FieldValue::Array(items), offset))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_int_string() -> Schema {
        Schema::new(
            vec![
                FieldDescriptor::new(FieldType::Int32),
                FieldDescriptor::new(FieldType::String { max_len: 64 }).nullable(true),
            ],
            1,
            Uniqueness::KeyUnique,
        )
    }

    #[test]
    fn key_roundtrip() {
        let schema = schema_int_string();
        let key = vec![FieldValue::Int32(42)];
        let encoded = schema.encode_key(&key).unwrap();
        let decoded = schema.decode_key(&encoded).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn value_roundtrip_with_null() {
        let schema = schema_int_string();
        let value = vec![FieldValue::Null];
        let encoded = schema.encode_value(&value).unwrap();
        let decoded = schema.decode_value(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn compare_respects_direction() {
        let schema = Schema::new(
            vec![FieldDescriptor::new(FieldType::Int32).direction(Direction::Descending)],
            1,
            Uniqueness::NotUnique,
        );
        let a = vec![FieldValue::Int32(1)];
        let b = vec![FieldValue::Int32(2)];
        assert_eq!(schema.compare_keys(&a, &b), Ordering::Greater);
    }

    #[test]
    fn string_no_pad_shorter_is_less() {
        let schema = Schema::new(
            vec![FieldDescriptor::new(FieldType::String { max_len: 8 })],
            1,
            Uniqueness::NotUnique,
        );
        let a = vec![FieldValue::String("ab".into())];
        let b = vec![FieldValue::String("abc".into())];
        assert_eq!(schema.compare_keys(&a, &b), Ordering::Less);
    }

    #[test]
    fn null_sorts_first_ascending() {
        let schema = schema_int_string();
        let a = vec![FieldValue::Int32(1)];
        let fields = vec![
            FieldDescriptor::new(FieldType::Int32).nullable(true),
        ];
        let s2 = Schema::new(fields, 1, Uniqueness::NotUnique);
        let null_key = vec![FieldValue::Null];
        let some_key = vec![FieldValue::Int32(0)];
        assert_eq!(s2.compare_keys(&null_key, &some_key), Ordering::Less);
        let _ = (&schema, &a);
    }
}
