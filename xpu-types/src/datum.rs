use std::fmt;

use half::f16;
use xpu_result::{Error, Result};

use crate::type_op::TypeOpcode;

/// A typed, nullable value.
///
/// `Null` is untyped; the declared type of the producing node or column says what it would
/// have been.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int1(i8),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float2(f16),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
}

impl Datum {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn type_opcode(&self) -> Option<TypeOpcode> {
        Some(match self {
            Datum::Null => return None,
            Datum::Bool(_) => TypeOpcode::Bool,
            Datum::Int1(_) => TypeOpcode::Int1,
            Datum::Int2(_) => TypeOpcode::Int2,
            Datum::Int4(_) => TypeOpcode::Int4,
            Datum::Int8(_) => TypeOpcode::Int8,
            Datum::Float2(_) => TypeOpcode::Float2,
            Datum::Float4(_) => TypeOpcode::Float4,
            Datum::Float8(_) => TypeOpcode::Float8,
            Datum::Text(_) => TypeOpcode::Text,
            Datum::Bytea(_) => TypeOpcode::Bytea,
        })
    }

    /// Integer value widened to `i64`.
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Datum::Int1(v) => Some(v as i64),
            Datum::Int2(v) => Some(v as i64),
            Datum::Int4(v) => Some(v as i64),
            Datum::Int8(v) => Some(v),
            _ => None,
        }
    }

    /// Float value widened to `f64`.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Datum::Float2(v) => Some(v.to_f64()),
            Datum::Float4(v) => Some(v as f64),
            Datum::Float8(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Datum::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Payload of a variable-length value.
    #[inline]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Datum::Text(s) => Some(s.as_bytes()),
            Datum::Bytea(b) => Some(b),
            _ => None,
        }
    }

    /// Build an integer datum of type `ty`, failing if `value` is out of its range.
    pub fn from_i64(ty: TypeOpcode, value: i64) -> std::result::Result<Datum, &'static str> {
        let out = match ty {
            TypeOpcode::Int1 => i8::try_from(value).ok().map(Datum::Int1),
            TypeOpcode::Int2 => i16::try_from(value).ok().map(Datum::Int2),
            TypeOpcode::Int4 => i32::try_from(value).ok().map(Datum::Int4),
            TypeOpcode::Int8 => Some(Datum::Int8(value)),
            _ => return Err("not an integer type"),
        };
        out.ok_or(ty.out_of_range_message())
    }

    /// Byte length of the value inside a tuple, excluding alignment padding.
    /// Varlena values carry a 4-byte length prefix.
    pub fn stored_len(&self) -> usize {
        match self {
            Datum::Null => 0,
            Datum::Text(_) | Datum::Bytea(_) => 4 + self.as_bytes().map_or(0, <[u8]>::len),
            other => other.type_opcode().and_then(TypeOpcode::width).unwrap_or(0),
        }
    }

    /// Write a fixed-width value little-endian into `out`, which must be exactly
    /// `width` bytes.
    pub fn write_fixed(&self, out: &mut [u8]) -> Result<()> {
        match *self {
            Datum::Bool(v) => out.copy_from_slice(&[v as u8]),
            Datum::Int1(v) => out.copy_from_slice(&v.to_le_bytes()),
            Datum::Int2(v) => out.copy_from_slice(&v.to_le_bytes()),
            Datum::Int4(v) => out.copy_from_slice(&v.to_le_bytes()),
            Datum::Int8(v) => out.copy_from_slice(&v.to_le_bytes()),
            Datum::Float2(v) => out.copy_from_slice(&v.to_le_bytes()),
            Datum::Float4(v) => out.copy_from_slice(&v.to_le_bytes()),
            Datum::Float8(v) => out.copy_from_slice(&v.to_le_bytes()),
            Datum::Null | Datum::Text(_) | Datum::Bytea(_) => {
                return Err(Error::Internal(format!(
                    "write_fixed called on non fixed-width datum {self:?}"
                )));
            }
        }
        Ok(())
    }

    /// Inverse of [`Datum::write_fixed`].
    pub fn read_fixed(ty: TypeOpcode, bytes: &[u8]) -> Result<Datum> {
        let need = ty
            .width()
            .ok_or_else(|| Error::Internal(format!("read_fixed on varlena type {}", ty.name())))?;
        let b = bytes
            .get(..need)
            .ok_or_else(|| Error::corrupt("datum", format!("{} needs {need} bytes", ty.name())))?;
        Ok(match ty {
            TypeOpcode::Bool => Datum::Bool(b[0] != 0),
            TypeOpcode::Int1 => Datum::Int1(b[0] as i8),
            TypeOpcode::Int2 => Datum::Int2(i16::from_le_bytes([b[0], b[1]])),
            TypeOpcode::Int4 => Datum::Int4(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            TypeOpcode::Int8 => Datum::Int8(i64::from_le_bytes(array8(b))),
            TypeOpcode::Float2 => Datum::Float2(f16::from_le_bytes([b[0], b[1]])),
            TypeOpcode::Float4 => Datum::Float4(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            TypeOpcode::Float8 => Datum::Float8(f64::from_le_bytes(array8(b))),
            TypeOpcode::Text | TypeOpcode::Bytea => unreachable!("varlena handled above"),
        })
    }

    /// Build a varlena datum of type `ty` from its payload.
    pub fn from_varlena(ty: TypeOpcode, payload: &[u8]) -> Result<Datum> {
        match ty {
            TypeOpcode::Text => std::str::from_utf8(payload)
                .map(|s| Datum::Text(s.to_string()))
                .map_err(|e| Error::corrupt("text datum", e)),
            TypeOpcode::Bytea => Ok(Datum::Bytea(payload.to_vec())),
            other => Err(Error::Internal(format!(
                "from_varlena on fixed-width type {}",
                other.name()
            ))),
        }
    }

    /// Check that a non-null datum matches the declared type.
    pub fn check_type(&self, ty: TypeOpcode) -> Result<()> {
        match self.type_opcode() {
            None => Ok(()),
            Some(actual) if actual == ty => Ok(()),
            Some(actual) => Err(Error::InvalidArgumentError(format!(
                "datum of type {} where {} was expected",
                actual.name(),
                ty.name()
            ))),
        }
    }
}

#[inline]
fn array8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Bool(v) => f.write_str(if *v { "t" } else { "f" }),
            Datum::Int1(v) => write!(f, "{v}"),
            Datum::Int2(v) => write!(f, "{v}"),
            Datum::Int4(v) => write!(f, "{v}"),
            Datum::Int8(v) => write!(f, "{v}"),
            Datum::Float2(v) => write!(f, "{v}"),
            Datum::Float4(v) => write!(f, "{v}"),
            Datum::Float8(v) => write!(f, "{v}"),
            Datum::Text(s) => f.write_str(s),
            Datum::Bytea(b) => {
                f.write_str("\\x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// A named, typed column of a target schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_op: TypeOpcode,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, type_op: TypeOpcode) -> Self {
        Self {
            name: name.into(),
            type_op,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_values_use_little_endian() {
        let mut buf = [0u8; 4];
        Datum::Int4(0x0102_0304).write_fixed(&mut buf).unwrap();
        assert_eq!(buf, [4, 3, 2, 1]);
        assert_eq!(
            Datum::read_fixed(TypeOpcode::Int4, &buf).unwrap(),
            Datum::Int4(0x0102_0304)
        );
    }

    #[test]
    fn float2_is_half_precision() {
        let mut buf = [0u8; 2];
        Datum::Float2(f16::from_f32(1.5)).write_fixed(&mut buf).unwrap();
        let back = Datum::read_fixed(TypeOpcode::Float2, &buf).unwrap();
        assert_eq!(back.as_f64(), Some(1.5));
    }

    #[test]
    fn from_i64_range_checks() {
        assert_eq!(Datum::from_i64(TypeOpcode::Int2, 42), Ok(Datum::Int2(42)));
        assert_eq!(
            Datum::from_i64(TypeOpcode::Int2, 40_000),
            Err("smallint out of range")
        );
        assert_eq!(
            Datum::from_i64(TypeOpcode::Int4, i64::from(i32::MIN) - 1),
            Err("integer out of range")
        );
    }

    #[test]
    fn short_buffer_is_corrupt() {
        let err = Datum::read_fixed(TypeOpcode::Int8, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn invalid_utf8_text_is_rejected() {
        assert!(Datum::from_varlena(TypeOpcode::Text, &[0xff, 0xfe]).is_err());
        assert_eq!(
            Datum::from_varlena(TypeOpcode::Bytea, &[0xff]).unwrap(),
            Datum::Bytea(vec![0xff])
        );
    }

    #[test]
    fn display_matches_host_output() {
        assert_eq!(Datum::Bool(true).to_string(), "t");
        assert_eq!(Datum::Bytea(vec![0xde, 0xad]).to_string(), "\\xdead");
        assert_eq!(Datum::Null.to_string(), "NULL");
    }
}
