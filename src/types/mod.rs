//! Common types used throughout the storage engine.

mod field;
mod object_id;
mod object_type;
mod page_id;
mod varint;

pub use field::{
    Direction, FieldDescriptor, FieldType, FieldValue, Placement, Schema, Uniqueness,
};
/// Single-field scalar wire codec, shared with [`crate::valuefile`] for
/// encoding a representative object's fixed-width cells.
pub(crate) use field::{decode_value as decode_scalar, encode_value as encode_scalar};
pub use object_id::{ObjectId, OBJECT_ID_DISK_SIZE};
pub use object_type::ObjectType;
pub use page_id::PageId;
pub use varint::{decode_varint, encode_varint, varint_size};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// A node is redistributed rather than split/merged outright while its
/// fill stays within this band; below the low-water mark it is a
/// concatenation candidate, above the high-water mark a split candidate.
pub const REDISTRIBUTE_LOW_WATER: f64 = 0.20;
pub const REDISTRIBUTE_HIGH_WATER: f64 = 0.40;

/// Delete-side underflow threshold (spec.md "If after the update the
/// page ends up below 40% fill, attempt redistribution or
/// concatenation"). Distinct from [`REDISTRIBUTE_LOW_WATER`], which
/// governs the insert-side sibling-acceptance test instead.
pub const DELETE_UNDERFLOW_WATER: f64 = 0.40;

/// Minimum fill a sibling must retain after donating a cell during
/// delete-side redistribution (spec.md: redistribution triggers only
/// "if one side is above 50% fill"). Distinct from
/// [`REDISTRIBUTE_HIGH_WATER`], which governs insert-side overflow
/// redistribution instead.
pub const DELETE_DONOR_MIN_WATER: f64 = 0.50;
