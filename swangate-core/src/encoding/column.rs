//! Column classification for the result encoding.

/// Width reserved in the fixed region for a variable-length value
/// (`u32` heap offset + `u32` length).
pub const VARIABLE_SLOT_WIDTH: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnWidth {
    Fixed(u16),
    Variable,
}

/// Per-column metadata the encoder needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub type_oid: u32,
    pub width: ColumnWidth,
}

impl ColumnSpec {
    /// Classify a column from its PostgreSQL type OID.
    pub fn for_type_oid(type_oid: u32) -> Self {
        let width = match fixed_width_for_oid(type_oid) {
            Some(width) => ColumnWidth::Fixed(width),
            None => ColumnWidth::Variable,
        };
        Self { type_oid, width }
    }

    pub fn declared_width(&self) -> u16 {
        match self.width {
            ColumnWidth::Fixed(width) => width,
            ColumnWidth::Variable => VARIABLE_SLOT_WIDTH,
        }
    }

    /// Type identifier as written to the header. OIDs above `u16::MAX`
    /// (user-defined types) are truncated.
    pub fn wire_type_id(&self) -> u16 {
        self.type_oid as u16
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.width, ColumnWidth::Fixed(_))
    }
}

/// Byte width of the binary wire representation of built-in fixed-size types.
///
/// Types whose binary form is not a constant size (text, numeric, arrays,
/// `name`, ...) return `None` and are encoded through the heap.
pub fn fixed_width_for_oid(type_oid: u32) -> Option<u16> {
    let width = match type_oid {
        oid::BOOL | oid::CHAR => 1,
        oid::INT2 => 2,
        oid::INT4 | oid::OID | oid::XID | oid::CID | oid::FLOAT4 | oid::DATE | oid::REGPROC => 4,
        oid::TID | oid::MACADDR => 6,
        oid::INT8
        | oid::FLOAT8
        | oid::MONEY
        | oid::TIME
        | oid::TIMESTAMP
        | oid::TIMESTAMPTZ
        | oid::PG_LSN
        | oid::MACADDR8
        | oid::XID8 => 8,
        oid::TIMETZ => 12,
        oid::POINT | oid::INTERVAL | oid::UUID => 16,
        oid::LINE | oid::CIRCLE => 24,
        oid::LSEG | oid::BOX => 32,
        _ => return None,
    };
    Some(width)
}

mod oid {
    pub const BOOL: u32 = 16;
    pub const CHAR: u32 = 18;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const REGPROC: u32 = 24;
    pub const OID: u32 = 26;
    pub const TID: u32 = 27;
    pub const XID: u32 = 28;
    pub const CID: u32 = 29;
    pub const POINT: u32 = 600;
    pub const LSEG: u32 = 601;
    pub const BOX: u32 = 603;
    pub const LINE: u32 = 628;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const CIRCLE: u32 = 718;
    pub const MACADDR8: u32 = 774;
    pub const MONEY: u32 = 790;
    pub const MACADDR: u32 = 829;
    pub const DATE: u32 = 1082;
    pub const TIME: u32 = 1083;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const INTERVAL: u32 = 1186;
    pub const TIMETZ: u32 = 1266;
    pub const UUID: u32 = 2950;
    pub const PG_LSN: u32 = 3220;
    pub const XID8: u32 = 5069;
}
