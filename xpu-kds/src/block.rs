//! BLOCK-format pages.
//!
//! ```text
//! +-----------+----------+------------------+ ...free... +---------+---------+
//! | nlp (u32) | reserved | lp[0] .. lp[n-1] |            | tuple 1 | tuple 0 |
//! +-----------+----------+------------------+            +---------+---------+
//! ```
//!
//! Line pointers are page-relative `u32` offsets; tuples are packed from the end of the
//! page. Pages are built on the host, one at a time, and are read-only afterwards.

use std::sync::atomic::Ordering;

use xpu_result::{Error, Result};
use xpu_types::Datum;

use crate::kds::{Kds, KdsFormat, PAGE_HEADER_SZ, pack_state, unpack_state};
use crate::tuple;

impl Kds {
    /// Pack as many leading `rows` as fit into the next free page. Returns how many rows
    /// were consumed.
    pub fn push_block(&mut self, rows: &[Vec<Datum>]) -> Result<usize> {
        self.expect_format(KdsFormat::Block)?;
        let (nblocks, usage) = unpack_state(*self.state.get_mut());
        if nblocks >= self.nrooms {
            return Err(Error::DataStoreNoSpace(format!(
                "all {} blocks are in use",
                self.nrooms
            )));
        }
        let block_size = self.block_size as usize;
        let mut page = vec![0u8; block_size];
        let mut lower = PAGE_HEADER_SZ;
        let mut upper = block_size;
        let mut nlp = 0usize;
        for row in rows {
            let tup = tuple::encode_tuple(&self.columns, row)?;
            if lower + 4 + tup.len() > upper {
                break;
            }
            upper -= tup.len();
            page[upper..upper + tup.len()].copy_from_slice(&tup);
            page[lower..lower + 4].copy_from_slice(&(upper as u32).to_le_bytes());
            lower += 4;
            nlp += 1;
        }
        if nlp == 0 && !rows.is_empty() {
            return Err(Error::InvalidArgumentError(format!(
                "row does not fit in a {block_size} byte block"
            )));
        }
        page[0..4].copy_from_slice(&(nlp as u32).to_le_bytes());
        self.body.write(nblocks as usize * block_size, &page)?;
        *self.state.get_mut() = pack_state(nblocks + 1, usage);
        tracing::trace!("[KDS] block {} packed with {} tuples", nblocks, nlp);
        Ok(nlp)
    }

    /// Build a BLOCK chunk holding all `rows`.
    pub fn block_from_rows(
        columns: Vec<xpu_types::ColumnDef>,
        rows: &[Vec<Datum>],
        block_size: u32,
    ) -> Result<Kds> {
        let mut nblocks = 0u32;
        let mut rest = rows;
        // dry run against a scratch chunk to size the real one
        let mut scratch = Kds::new_block(columns.clone(), 1, block_size)?;
        while !rest.is_empty() {
            *scratch.state.get_mut() = 0;
            let n = scratch.push_block(rest)?;
            rest = &rest[n..];
            nblocks += 1;
        }
        let mut kds = Kds::new_block(columns, nblocks, block_size)?;
        let mut rest = rows;
        while !rest.is_empty() {
            let n = kds.push_block(rest)?;
            rest = &rest[n..];
        }
        Ok(kds)
    }

    /// Number of populated pages.
    #[inline]
    pub fn nblocks(&self) -> u32 {
        if self.format == KdsFormat::Block {
            unpack_state(self.state.load(Ordering::Acquire)).0
        } else {
            0
        }
    }

    /// Body offsets of the tuples of page `block`, in line-pointer order.
    pub fn block_tuples(&self, block: u32) -> Result<Vec<u32>> {
        self.expect_format(KdsFormat::Block)?;
        if block >= self.nblocks() {
            return Err(Error::InvalidArgumentError(format!(
                "block {block} out of range, chunk has {} blocks",
                self.nblocks()
            )));
        }
        let block_size = self.block_size as usize;
        let base = block as usize * block_size;
        let nlp = self.body.read_u32(base)? as usize;
        if PAGE_HEADER_SZ + nlp * 4 > block_size {
            return Err(Error::corrupt("chunk", format!("block {block} claims {nlp} items")));
        }
        (0..nlp)
            .map(|i| {
                let lp = self.body.read_u32(base + PAGE_HEADER_SZ + i * 4)? as usize;
                if lp < PAGE_HEADER_SZ || lp >= block_size {
                    return Err(Error::corrupt(
                        "chunk",
                        format!("line pointer {i} of block {block} is {lp}"),
                    ));
                }
                let end = base + lp + tuple::TUPLE_HEADER_SZ;
                if end > base + block_size {
                    return Err(Error::corrupt("chunk", "tuple header crosses the page end"));
                }
                Ok((base + lp) as u32)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpu_types::{ColumnDef, TypeOpcode};

    fn rows(n: i64) -> Vec<Vec<Datum>> {
        (0..n)
            .map(|i| vec![Datum::Int8(i), Datum::Text(format!("row-{i}"))])
            .collect()
    }

    fn cols() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", TypeOpcode::Int8),
            ColumnDef::new("label", TypeOpcode::Text),
        ]
    }

    #[test]
    fn pages_fill_and_read_back_in_order() {
        let src = rows(100);
        let kds = Kds::block_from_rows(cols(), &src, 512).unwrap();
        assert!(kds.nblocks() > 1);
        assert_eq!(kds.rows().unwrap(), src);
    }

    #[test]
    fn full_chunk_rejects_more_pages() {
        let mut kds = Kds::new_block(cols(), 1, 512).unwrap();
        kds.push_block(&rows(2)).unwrap();
        assert!(matches!(
            kds.push_block(&rows(2)),
            Err(Error::DataStoreNoSpace(_))
        ));
    }

    #[test]
    fn oversized_row_is_rejected() {
        let mut kds = Kds::new_block(cols(), 1, 128).unwrap();
        let big = vec![vec![Datum::Int8(1), Datum::Text("x".repeat(200))]];
        assert!(matches!(
            kds.push_block(&big),
            Err(Error::InvalidArgumentError(_))
        ));
    }
}
