//! Byte storage of a chunk body.
//!
//! Parallel appenders write disjoint, previously reserved byte ranges through a shared
//! reference, so the body is a slice of atomic bytes accessed with relaxed ordering. The
//! end of the population phase (the appender borrow ending, or the launch returning) is the
//! happens-before edge that makes the bytes visible to readers.

use std::sync::atomic::{AtomicU8, Ordering};

use xpu_result::{Error, Result};

pub(crate) struct DeviceBuffer {
    bytes: Box<[AtomicU8]>,
}

impl DeviceBuffer {
    pub(crate) fn zeroed(len: usize) -> Self {
        Self {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub(crate) fn from_slice(data: &[u8]) -> Self {
        Self {
            bytes: data.iter().map(|&b| AtomicU8::new(b)).collect(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    fn range(&self, offset: usize, len: usize) -> Result<&[AtomicU8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| {
                Error::corrupt(
                    "chunk",
                    format!(
                        "access [{offset}, +{len}) beyond body of {} bytes",
                        self.bytes.len()
                    ),
                )
            })
    }

    pub(crate) fn read_into(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let src = self.range(offset, out.len())?;
        for (dst, byte) in out.iter_mut().zip(src) {
            *dst = byte.load(Ordering::Relaxed);
        }
        Ok(())
    }

    pub(crate) fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    pub(crate) fn read_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.range(offset, 1)?[0].load(Ordering::Relaxed))
    }

    pub(crate) fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_into(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        for (dst, &src) in self.range(offset, data.len())?.iter().zip(data) {
            dst.store(src, Ordering::Relaxed);
        }
        Ok(())
    }

    pub(crate) fn write_u32(&self, offset: usize, v: u32) -> Result<()> {
        self.write(offset, &v.to_le_bytes())
    }

    pub(crate) fn to_vec(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_see_earlier_writes() {
        let buf = DeviceBuffer::zeroed(16);
        buf.write(3, b"chunk").unwrap();
        buf.write_u32(8, 0xDEAD_BEEF).unwrap();
        assert_eq!(buf.read_vec(3, 5).unwrap(), b"chunk");
        assert_eq!(buf.read_u32(8).unwrap(), 0xDEAD_BEEF);
        assert_eq!(buf.read_u8(15).unwrap(), 0);
    }

    #[test]
    fn out_of_range_reads_are_corrupt() {
        let buf = DeviceBuffer::from_slice(&[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        buf.read_into(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(matches!(buf.read_into(2, &mut out), Err(Error::Corrupt { .. })));
        assert!(buf.read_u32(usize::MAX).is_err());
    }
}
