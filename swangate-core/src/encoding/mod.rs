//! Columnar binary encoding of query results.
//!
//! Layout (header fields little-endian):
//!
//! ```text
//! u32 total length | u32 row count | u16 column count N
//! N x (u16 declared width, u16 type id)
//! per row: fixed region (sum of declared widths) + null bitmap (ceil(N/8) bytes, MSB first)
//! heap: every variable-length value, in encoding order
//! ```
//!
//! Fixed-width values are copied verbatim in the database's binary
//! representation. Variable-length values occupy an 8-byte
//! `{heap offset: u32, length: u32}` slot in the fixed region. Null cells are
//! zero-filled and flagged in the bitmap.

mod column;
mod decoder;
mod encoder;

pub use column::{fixed_width_for_oid, ColumnSpec, ColumnWidth, VARIABLE_SLOT_WIDTH};
pub use decoder::{decode, DecodeError, DecodedColumn, DecodedPayload};
pub use encoder::{EncodeError, ResultEncoder};

/// Bytes before the per-column metadata: total length, row count, column count.
pub const HEADER_PREFIX_LEN: usize = 4 + 4 + 2;

/// Bytes of metadata written per column.
pub const COLUMN_META_LEN: usize = 2 + 2;

/// Size of the header for `columns` columns.
pub fn header_len(columns: usize) -> usize {
    HEADER_PREFIX_LEN + columns * COLUMN_META_LEN
}

/// Size of the per-row null bitmap for `columns` columns.
pub fn null_bitmap_len(columns: usize) -> usize {
    columns.div_ceil(8)
}
