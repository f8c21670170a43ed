use bytes::{Buf, Bytes};
use thiserror::Error;

use super::{
    fixed_width_for_oid, header_len, null_bitmap_len, COLUMN_META_LEN, HEADER_PREFIX_LEN,
    VARIABLE_SLOT_WIDTH,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload truncated: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("header declares {declared} bytes but payload has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("column {column} declares width {width} for a variable-length type")]
    InvalidVariableWidth { column: usize, width: u16 },
    #[error("row {row} column {column} points outside the heap")]
    HeapOutOfBounds { row: usize, column: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedColumn {
    pub width: u16,
    pub type_id: u16,
}

impl DecodedColumn {
    /// Whether the column stores heap references.
    ///
    /// A column is fixed only when its declared width is the known width of
    /// its type id. User-defined OIDs truncate onto built-in ids, so the type
    /// id alone can look fixed while the slot is a heap reference.
    pub fn is_variable(&self) -> bool {
        fixed_width_for_oid(u32::from(self.type_id)) != Some(self.width)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    pub columns: Vec<DecodedColumn>,
    /// `None` marks a NULL cell; otherwise the raw value bytes.
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
}

fn ensure_remaining(buf: &Bytes, len: usize, total: usize) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        return Err(DecodeError::Truncated {
            needed: total - buf.remaining() + len,
            available: total,
        });
    }
    Ok(())
}

/// Parse a payload produced by [`ResultEncoder`](super::ResultEncoder).
pub fn decode(payload: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let total = payload.len();
    let mut buf = Bytes::copy_from_slice(payload);

    ensure_remaining(&buf, HEADER_PREFIX_LEN, total)?;
    let total_len = buf.get_u32_le() as usize;
    if total_len != total {
        return Err(DecodeError::LengthMismatch {
            declared: total_len,
            actual: total,
        });
    }
    let row_count = buf.get_u32_le() as usize;
    let column_count = usize::from(buf.get_u16_le());

    ensure_remaining(&buf, column_count * COLUMN_META_LEN, total)?;
    let mut columns = Vec::with_capacity(column_count);
    for column in 0..column_count {
        let decoded = DecodedColumn {
            width: buf.get_u16_le(),
            type_id: buf.get_u16_le(),
        };
        if decoded.is_variable() && decoded.width != VARIABLE_SLOT_WIDTH {
            return Err(DecodeError::InvalidVariableWidth {
                column,
                width: decoded.width,
            });
        }
        columns.push(decoded);
    }

    let bitmap_len = null_bitmap_len(column_count);
    let row_len: usize =
        columns.iter().map(|c| usize::from(c.width)).sum::<usize>() + bitmap_len;
    let rows_end = row_count
        .checked_mul(row_len)
        .and_then(|len| len.checked_add(header_len(column_count)))
        .ok_or(DecodeError::Truncated {
            needed: usize::MAX,
            available: total,
        })?;
    ensure_remaining(&buf, rows_end - header_len(column_count), total)?;
    let heap = buf.slice(rows_end - header_len(column_count)..);

    let mut rows = Vec::with_capacity(row_count);
    for row in 0..row_count {
        let mut slots = Vec::with_capacity(column_count);
        for column in &columns {
            slots.push(buf.split_to(usize::from(column.width)));
        }
        let bitmap = buf.split_to(bitmap_len);

        let mut cells = Vec::with_capacity(column_count);
        for (index, (column, mut slot)) in columns.iter().zip(slots).enumerate() {
            let is_null = bitmap[index / 8] & (0x80 >> (index % 8)) != 0;
            if is_null {
                cells.push(None);
            } else if column.is_variable() {
                let offset = slot.get_u32_le() as usize;
                let length = slot.get_u32_le() as usize;
                let value = offset
                    .checked_add(length)
                    .and_then(|end| heap.get(offset..end))
                    .ok_or(DecodeError::HeapOutOfBounds { row, column: index })?;
                cells.push(Some(value.to_vec()));
            } else {
                cells.push(Some(slot.to_vec()));
            }
        }
        rows.push(cells);
    }

    Ok(DecodedPayload { columns, rows })
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::encoding::{ColumnSpec, ResultEncoder};

    const BOOL: u32 = 16;
    const INT8: u32 = 20;
    const TEXT: u32 = 25;
    const JSONB: u32 = 3802;

    #[test]
    fn round_trip_preserves_values_and_nulls() -> Result<()> {
        let columns = vec![
            ColumnSpec::for_type_oid(INT8),
            ColumnSpec::for_type_oid(TEXT),
            ColumnSpec::for_type_oid(BOOL),
            ColumnSpec::for_type_oid(JSONB),
        ];
        let rows: Vec<Vec<Option<Vec<u8>>>> = vec![
            vec![
                Some(42i64.to_be_bytes().to_vec()),
                Some(b"alpha".to_vec()),
                Some(vec![1]),
                Some(b"\x01{\"a\":1}".to_vec()),
            ],
            vec![None, None, Some(vec![0]), None],
            vec![
                Some((-7i64).to_be_bytes().to_vec()),
                Some(Vec::new()),
                None,
                Some(b"\x01[]".to_vec()),
            ],
        ];

        let mut encoder = ResultEncoder::new(columns)?;
        for row in &rows {
            encoder.push_row(row.iter().map(|cell| cell.as_deref()))?;
        }
        let payload = encoder.finish()?;
        let decoded = decode(&payload)?;

        assert_eq!(decoded.columns.len(), 4);
        assert_eq!(
            decoded.columns[1],
            DecodedColumn {
                width: 8,
                type_id: 25
            }
        );
        assert_eq!(decoded.rows, rows);
        Ok(())
    }

    #[test]
    fn header_only_payload_decodes_to_no_rows() -> Result<()> {
        let payload = ResultEncoder::new(vec![ColumnSpec::for_type_oid(TEXT)])?.finish()?;
        let decoded = decode(&payload)?;
        assert!(decoded.rows.is_empty());
        assert_eq!(decoded.columns.len(), 1);
        Ok(())
    }

    #[test]
    fn truncated_payload_is_rejected() -> Result<()> {
        let mut encoder = ResultEncoder::new(vec![ColumnSpec::for_type_oid(TEXT)])?;
        encoder.push_row([Some(&b"abc"[..])])?;
        let payload = encoder.finish()?;

        assert!(matches!(
            decode(&payload[..payload.len() - 1]),
            Err(DecodeError::LengthMismatch { .. })
        ));
        assert!(matches!(
            decode(&payload[..3]),
            Err(DecodeError::Truncated { .. })
        ));
        Ok(())
    }

    #[test]
    fn heap_reference_past_end_is_rejected() -> Result<()> {
        let mut encoder = ResultEncoder::new(vec![ColumnSpec::for_type_oid(TEXT)])?;
        encoder.push_row([Some(&b"abc"[..])])?;
        let mut payload = encoder.finish()?.to_vec();
        let slot = header_len(1) + 4;
        payload[slot..slot + 4].copy_from_slice(&10u32.to_le_bytes());

        assert_eq!(
            decode(&payload),
            Err(DecodeError::HeapOutOfBounds { row: 0, column: 0 })
        );
        Ok(())
    }

    #[test]
    fn declared_width_decides_the_column_kind() {
        let int4 = DecodedColumn {
            width: 4,
            type_id: 23,
        };
        assert!(!int4.is_variable());

        // user OID 65559 truncates onto int4's id but keeps the heap slot
        let truncated = DecodedColumn {
            width: 8,
            type_id: 23,
        };
        assert!(truncated.is_variable());

        let text = DecodedColumn {
            width: 8,
            type_id: 25,
        };
        assert!(text.is_variable());
    }

    #[test]
    fn user_type_oid_aliasing_a_builtin_still_reads_from_the_heap() -> Result<()> {
        let mut encoder = ResultEncoder::new(vec![ColumnSpec::for_type_oid(65_559)])?;
        encoder.push_row([Some(&b"custom-value"[..])])?;
        encoder.push_row([None])?;
        let decoded = decode(&encoder.finish()?)?;

        assert_eq!(
            decoded.columns,
            vec![DecodedColumn {
                width: 8,
                type_id: 23
            }]
        );
        assert_eq!(
            decoded.rows,
            vec![vec![Some(b"custom-value".to_vec())], vec![None]]
        );
        Ok(())
    }

    #[test]
    fn undersized_variable_slot_is_rejected() -> Result<()> {
        let mut payload = ResultEncoder::new(vec![ColumnSpec::for_type_oid(TEXT)])?
            .finish()?
            .to_vec();
        // declared width 4 for text
        payload[HEADER_PREFIX_LEN..HEADER_PREFIX_LEN + 2].copy_from_slice(&4u16.to_le_bytes());
        assert_eq!(
            decode(&payload),
            Err(DecodeError::InvalidVariableWidth {
                column: 0,
                width: 4
            })
        );
        Ok(())
    }
}
