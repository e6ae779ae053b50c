//! Chunk wire image.
//!
//! The image is what crosses the host/device boundary and what a cache persists, so it is
//! fully determined by the chunk contents: `to_bytes(from_bytes(b)) == b`.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "XKDS"
//! 4       1     format ('r' | 'c' | 'h' | 'b')
//! 5       1     has_varlena
//! 6       2     ncols
//! 8       4     nitems
//! 12      4     nrooms
//! 16      8     length (whole image)
//! 24      4     usage
//! 28      4     hash_nslots
//! 32      4     block_size
//! 36      4     table_oid
//! 40      4     head_sz (offset of the body)
//! 44      4     fixed_area
//! 48      16    reserved, zero
//! 64      16*n  column metadata
//!         ...   column names, padded to 8
//!         4*s   hash slots, padded to 8
//! head_sz ...   body
//! ```
//!
//! Column metadata entry: `type u8, nullable u8, attalign u8, name_len u8, attlen i16,
//! reserved u16, values_offset u32, nulls_offset u32`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use xpu_result::{Error, Result};
use xpu_types::ColumnDef;
use xpu_types::codec::{WireReader, WireWriter};

use crate::buffer::DeviceBuffer;
use crate::kds::{Kds, KdsFormat, layout, pack_state};

pub const KDS_MAGIC: u32 = u32::from_le_bytes(*b"XKDS");
pub const KDS_HEADER_SZ: usize = 64;
const COLUMN_META_SZ: usize = 16;

impl Kds {
    /// Serialize the chunk into its wire image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let names_len: usize = self.columns.iter().map(|c| c.name.len()).sum();
        let head_sz = xpu_types::maxalign(
            xpu_types::maxalign(KDS_HEADER_SZ + self.columns.len() * COLUMN_META_SZ + names_len)
                + self.hash_slots.len() * 4,
        );
        let total = head_sz + self.body.len();
        let state = self.state.load(Ordering::Acquire);

        let mut w = WireWriter::with_capacity(total);
        w.put_u32(KDS_MAGIC);
        w.put_u8(u8::from(self.format));
        w.put_u8(self.has_varlena() as u8);
        w.put_u16(self.columns.len() as u16);
        w.put_u32(state as u32);
        w.put_u32(self.nrooms);
        w.put_u64(total as u64);
        w.put_u32((state >> 32) as u32);
        w.put_u32(self.hash_slots.len() as u32);
        w.put_u32(self.block_size);
        w.put_u32(self.table_oid);
        w.put_u32(head_sz as u32);
        w.put_u32(self.fixed_area);
        w.pad_to(KDS_HEADER_SZ);

        for (c, m) in self.columns.iter().zip(&self.meta) {
            w.put_u8(u8::from(c.type_op));
            w.put_u8(c.nullable as u8);
            w.put_u8(m.attalign);
            w.put_u8(c.name.len() as u8);
            w.put_u16(m.attlen as u16);
            w.put_u16(0);
            w.put_u32(m.values_offset);
            w.put_u32(m.nulls_offset);
        }
        for c in &self.columns {
            w.put_bytes(c.name.as_bytes());
        }
        w.pad_to(8);
        for slot in self.hash_slots.iter() {
            w.put_u32(slot.load(Ordering::Acquire));
        }
        w.pad_to(8);
        debug_assert_eq!(w.len(), head_sz);
        w.put_bytes(&self.body.to_vec());
        w.into_inner()
    }

    /// Rebuild a chunk from its wire image, validating every header field against the
    /// layout the columns imply.
    pub fn from_bytes(bytes: &[u8]) -> Result<Kds> {
        let mut r = WireReader::new(bytes, "chunk");
        if r.get_u32()? != KDS_MAGIC {
            return Err(r.corrupt("bad magic"));
        }
        let raw_format = r.get_u8()?;
        let format = KdsFormat::try_from(raw_format)
            .map_err(|_| r.corrupt(format!("unknown format tag {raw_format:#04x}")))?;
        let _has_varlena = r.get_u8()?;
        let ncols = r.get_u16()? as usize;
        let nitems = r.get_u32()?;
        let nrooms = r.get_u32()?;
        let total = r.get_u64()?;
        let usage = r.get_u32()?;
        let nslots = r.get_u32()? as usize;
        let block_size = r.get_u32()?;
        let table_oid = r.get_u32()?;
        let head_sz = r.get_u32()? as usize;
        let fixed_area = r.get_u32()?;
        r.skip_to_align(KDS_HEADER_SZ)?;

        if total != bytes.len() as u64 {
            return Err(r.corrupt(format!(
                "header length {total} but image is {} bytes",
                bytes.len()
            )));
        }
        if nitems > nrooms {
            return Err(r.corrupt(format!("nitems {nitems} exceeds nrooms {nrooms}")));
        }

        let expect_slots = if format == KdsFormat::Hash {
            nrooms.max(1) as usize
        } else {
            0
        };
        if nslots != expect_slots {
            return Err(r.corrupt(format!("{nslots} hash slots, expected {expect_slots}")));
        }

        let mut raw_meta = Vec::with_capacity(ncols);
        for _ in 0..ncols {
            let type_op = r.get_type()?;
            let nullable = r.get_u8()? != 0;
            let _attalign = r.get_u8()?;
            let name_len = r.get_u8()? as usize;
            let _attlen = r.get_u16()?;
            let _reserved = r.get_u16()?;
            let values_offset = r.get_u32()?;
            let nulls_offset = r.get_u32()?;
            raw_meta.push((type_op, nullable, name_len, values_offset, nulls_offset));
        }
        let mut columns = Vec::with_capacity(ncols);
        for &(type_op, nullable, name_len, _, _) in &raw_meta {
            let name = std::str::from_utf8(r.take(name_len)?)
                .map_err(|e| Error::corrupt("chunk", format!("column name: {e}")))?;
            columns.push(ColumnDef {
                name: name.to_string(),
                type_op,
                nullable,
            });
        }
        r.skip_to_align(8)?;
        let mut slots = Vec::with_capacity(nslots);
        for _ in 0..nslots {
            slots.push(AtomicU32::new(r.get_u32()?));
        }
        r.skip_to_align(8)?;
        if r.position() != head_sz {
            return Err(r.corrupt(format!("body expected at {head_sz}")));
        }

        let block_size_arg = if format == KdsFormat::Block { block_size } else { 0 };
        let (meta, expect_fixed) = layout(format, &columns, nrooms, block_size_arg)?;
        if expect_fixed as u32 != fixed_area {
            return Err(r.corrupt(format!(
                "fixed area {fixed_area} does not match layout {expect_fixed}"
            )));
        }
        for (m, &(_, _, _, values_offset, nulls_offset)) in meta.iter().zip(&raw_meta) {
            if m.values_offset != values_offset || m.nulls_offset != nulls_offset {
                return Err(r.corrupt("column offsets do not match layout"));
            }
        }
        let body = &bytes[head_sz..];
        if (body.len() as u64) < u64::from(fixed_area) + u64::from(usage) {
            return Err(r.corrupt("usage exceeds the body"));
        }

        Ok(Kds {
            format,
            table_oid,
            nrooms,
            block_size: block_size_arg,
            fixed_area,
            columns,
            meta,
            state: AtomicU64::new(pack_state(nitems, usage)),
            hash_slots: slots.into_boxed_slice(),
            body: DeviceBuffer::from_slice(body),
        })
    }
}
