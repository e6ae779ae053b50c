use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Device type opcode.
///
/// Stored as a single byte in chunk column metadata and in expression program nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeOpcode {
    Bool = 1,
    Int1 = 2,
    Int2 = 3,
    Int4 = 4,
    Int8 = 5,
    Float2 = 6,
    Float4 = 7,
    Float8 = 8,
    Text = 9,
    Bytea = 10,
}

impl TypeOpcode {
    /// Fixed byte width, or `None` for variable-length types.
    #[inline]
    pub fn width(self) -> Option<usize> {
        match self {
            TypeOpcode::Bool | TypeOpcode::Int1 => Some(1),
            TypeOpcode::Int2 | TypeOpcode::Float2 => Some(2),
            TypeOpcode::Int4 | TypeOpcode::Float4 => Some(4),
            TypeOpcode::Int8 | TypeOpcode::Float8 => Some(8),
            TypeOpcode::Text | TypeOpcode::Bytea => None,
        }
    }

    /// Width as stored in column metadata: `-1` marks a varlena.
    #[inline]
    pub fn typlen(self) -> i16 {
        self.width().map_or(-1, |w| w as i16)
    }

    #[inline]
    pub fn align(self) -> usize {
        match self.width() {
            Some(w) => w,
            None => 4,
        }
    }

    #[inline]
    pub fn is_varlena(self) -> bool {
        self.width().is_none()
    }

    #[inline]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            TypeOpcode::Int1 | TypeOpcode::Int2 | TypeOpcode::Int4 | TypeOpcode::Int8
        )
    }

    #[inline]
    pub fn is_float(self) -> bool {
        matches!(
            self,
            TypeOpcode::Float2 | TypeOpcode::Float4 | TypeOpcode::Float8
        )
    }

    #[inline]
    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeOpcode::Bool => "bool",
            TypeOpcode::Int1 => "int1",
            TypeOpcode::Int2 => "int2",
            TypeOpcode::Int4 => "int4",
            TypeOpcode::Int8 => "int8",
            TypeOpcode::Float2 => "float2",
            TypeOpcode::Float4 => "float4",
            TypeOpcode::Float8 => "float8",
            TypeOpcode::Text => "text",
            TypeOpcode::Bytea => "bytea",
        }
    }

    /// Message raised when a value does not fit this integer type.
    pub fn out_of_range_message(self) -> &'static str {
        match self {
            TypeOpcode::Int1 => "tinyint out of range",
            TypeOpcode::Int2 => "smallint out of range",
            TypeOpcode::Int8 => "bigint out of range",
            _ => "integer out of range",
        }
    }

    /// Inclusive value range of an integer type.
    pub fn int_range(self) -> Option<(i64, i64)> {
        match self {
            TypeOpcode::Int1 => Some((i8::MIN as i64, i8::MAX as i64)),
            TypeOpcode::Int2 => Some((i16::MIN as i64, i16::MAX as i64)),
            TypeOpcode::Int4 => Some((i32::MIN as i64, i32::MAX as i64)),
            TypeOpcode::Int8 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }
}
