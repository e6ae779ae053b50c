//! Little-endian cursor helpers shared by every wire format in the workspace
//! (expression programs, warp context blobs, cache logs).
//!
//! A datum is encoded as a one-byte tag (`0` for NULL, otherwise the [`TypeOpcode`]) followed
//! by the fixed-width value, or by a `u32` length and the payload for varlena types.

use xpu_result::{Error, Result};

use crate::datum::Datum;
use crate::type_op::TypeOpcode;

const NULL_TAG: u8 = 0;

#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed byte string.
    pub fn put_blob(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_bytes(bytes);
    }

    /// Zero-fill up to the next multiple of `align`.
    pub fn pad_to(&mut self, align: usize) {
        let target = crate::align_up(self.buf.len(), align);
        self.buf.resize(target, 0);
    }

    /// Overwrite a `u32` previously reserved at `offset`.
    pub fn patch_u32(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_datum(&mut self, datum: &Datum) -> Result<()> {
        match datum.type_opcode() {
            None => self.put_u8(NULL_TAG),
            Some(ty) => {
                self.put_u8(u8::from(ty));
                match datum.as_bytes() {
                    Some(payload) => self.put_blob(payload),
                    None => {
                        let width = ty.width().unwrap_or(0);
                        let start = self.buf.len();
                        self.buf.resize(start + width, 0);
                        datum.write_fixed(&mut self.buf[start..])?;
                    }
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked reader over a wire image. Every short read is reported as
/// [`Error::Corrupt`] tagged with the kind of image being decoded.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn corrupt(&self, detail: impl std::fmt::Display) -> Error {
        Error::corrupt(self.what, format!("{detail} at offset {}", self.pos))
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(self.corrupt(format!("truncated, wanted {n} bytes")));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn skip_to_align(&mut self, align: usize) -> Result<()> {
        let target = crate::align_up(self.pos, align);
        self.take(target - self.pos).map(|_| ())
    }

    pub fn get_type(&mut self) -> Result<TypeOpcode> {
        let raw = self.get_u8()?;
        TypeOpcode::try_from(raw).map_err(|_| self.corrupt(format!("unknown type opcode {raw}")))
    }

    pub fn get_datum(&mut self) -> Result<Datum> {
        let tag = self.get_u8()?;
        if tag == NULL_TAG {
            return Ok(Datum::Null);
        }
        let ty = TypeOpcode::try_from(tag)
            .map_err(|_| self.corrupt(format!("unknown datum tag {tag}")))?;
        match ty.width() {
            Some(width) => Datum::read_fixed(ty, self.take(width)?),
            None => {
                let payload = self.get_blob()?;
                Datum::from_varlena(ty, payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn datums_survive_the_wire() {
        let values = vec![
            Datum::Null,
            Datum::Bool(false),
            Datum::Int1(-3),
            Datum::Int2(300),
            Datum::Int4(-70_000),
            Datum::Int8(1 << 40),
            Datum::Float2(f16::from_f32(0.25)),
            Datum::Float4(2.5),
            Datum::Float8(-1.0e300),
            Datum::Text("héllo".into()),
            Datum::Bytea(vec![0, 1, 2]),
        ];
        let mut w = WireWriter::new();
        for v in &values {
            w.put_datum(v).unwrap();
        }
        let bytes = w.into_inner();
        let mut r = WireReader::new(&bytes, "test");
        for v in &values {
            assert_eq!(&r.get_datum().unwrap(), v);
        }
        assert!(r.is_empty());
    }

    #[test]
    fn truncated_input_is_corrupt() {
        let mut w = WireWriter::new();
        w.put_datum(&Datum::Text("abcdef".into())).unwrap();
        let bytes = w.into_inner();
        let mut r = WireReader::new(&bytes[..bytes.len() - 2], "test");
        let err = r.get_datum().unwrap_err();
        assert!(matches!(err, Error::Corrupt { what: "test", .. }));
    }

    #[test]
    fn padding_and_patching() {
        let mut w = WireWriter::new();
        w.put_u8(7);
        w.pad_to(8);
        assert_eq!(w.len(), 8);
        w.put_u32(0);
        w.patch_u32(8, 0xfeed);
        let bytes = w.into_inner();
        let mut r = WireReader::new(&bytes, "test");
        assert_eq!(r.get_u8().unwrap(), 7);
        r.skip_to_align(8).unwrap();
        assert_eq!(r.get_u32().unwrap(), 0xfeed);
    }
}
