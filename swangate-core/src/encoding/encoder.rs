use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{header_len, null_bitmap_len, ColumnSpec, ColumnWidth};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("result has {0} columns; at most 65535 can be encoded")]
    TooManyColumns(usize),
    #[error("row has {actual} values but the result declares {expected} columns")]
    ColumnCountMismatch { expected: usize, actual: usize },
    #[error("column {column} declares {expected} bytes but the value has {actual}")]
    WidthMismatch {
        column: usize,
        expected: u16,
        actual: usize,
    },
    #[error("encoded result exceeds the 4 GiB payload limit")]
    PayloadTooLarge,
}

/// Streams rows into the binary result layout.
///
/// Rows are appended with [`push_row`](Self::push_row); [`finish`](Self::finish)
/// appends the heap and patches the header. After any error the encoder is
/// left in an unspecified state and must be discarded.
#[derive(Debug)]
pub struct ResultEncoder {
    columns: Vec<ColumnSpec>,
    buf: BytesMut,
    heap: BytesMut,
    bitmap: Vec<u8>,
    rows: u32,
}

impl ResultEncoder {
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self, EncodeError> {
        let column_count =
            u16::try_from(columns.len()).map_err(|_| EncodeError::TooManyColumns(columns.len()))?;

        let mut buf = BytesMut::with_capacity(header_len(columns.len()));
        // total length and row count are patched in `finish`
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf.put_u16_le(column_count);
        for column in &columns {
            buf.put_u16_le(column.declared_width());
            buf.put_u16_le(column.wire_type_id());
        }

        Ok(Self {
            bitmap: vec![0; null_bitmap_len(columns.len())],
            columns,
            buf,
            heap: BytesMut::new(),
            rows: 0,
        })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn row_count(&self) -> u32 {
        self.rows
    }

    /// Append one row. `values` yields one entry per column, `None` for SQL NULL.
    pub fn push_row<'v, I>(&mut self, values: I) -> Result<(), EncodeError>
    where
        I: IntoIterator<Item = Option<&'v [u8]>>,
    {
        self.rows = self
            .rows
            .checked_add(1)
            .ok_or(EncodeError::PayloadTooLarge)?;
        self.bitmap.fill(0);

        let mut seen = 0usize;
        for value in values {
            let column = *self
                .columns
                .get(seen)
                .ok_or(EncodeError::ColumnCountMismatch {
                    expected: self.columns.len(),
                    actual: seen + 1,
                })?;

            match (value, column.width) {
                (None, _) => {
                    self.bitmap[seen / 8] |= 0x80 >> (seen % 8);
                    self.buf.put_bytes(0, usize::from(column.declared_width()));
                }
                (Some(bytes), ColumnWidth::Fixed(width)) => {
                    if bytes.len() != usize::from(width) {
                        return Err(EncodeError::WidthMismatch {
                            column: seen,
                            expected: width,
                            actual: bytes.len(),
                        });
                    }
                    self.buf.put_slice(bytes);
                }
                (Some(bytes), ColumnWidth::Variable) => {
                    let offset =
                        u32::try_from(self.heap.len()).map_err(|_| EncodeError::PayloadTooLarge)?;
                    let length =
                        u32::try_from(bytes.len()).map_err(|_| EncodeError::PayloadTooLarge)?;
                    self.buf.put_u32_le(offset);
                    self.buf.put_u32_le(length);
                    self.heap.put_slice(bytes);
                }
            }
            seen += 1;
        }

        if seen != self.columns.len() {
            return Err(EncodeError::ColumnCountMismatch {
                expected: self.columns.len(),
                actual: seen,
            });
        }
        self.buf.put_slice(&self.bitmap);
        Ok(())
    }

    /// Append the heap and patch total length and row count.
    pub fn finish(mut self) -> Result<Bytes, EncodeError> {
        let total = self.buf.len() + self.heap.len();
        let total_len = u32::try_from(total).map_err(|_| EncodeError::PayloadTooLarge)?;

        self.buf.unsplit(self.heap);
        let mut header = &mut self.buf[..8];
        header.put_u32_le(total_len);
        header.put_u32_le(self.rows);
        Ok(self.buf.freeze())
    }
}
