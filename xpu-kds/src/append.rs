//! Parallel population of ROW, HASH and COLUMN chunks.

use std::sync::atomic::Ordering;

use xpu_result::{Error, Result};
use xpu_types::{Datum, align_up};

use crate::kds::{HASH_ITEM_PREFIX, Kds, KdsFormat, pack_state, unpack_state};
use crate::tuple;

/// Rows claimed by one [`KdsAppender::reserve`] call.
///
/// The reserved bytes form one contiguous range of the dynamic area. Row `i` of the
/// reservation starts at `base + exclusive_prefix(i)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub first_row: u32,
    pub nrows: u32,
    base: u32,
}

impl Reservation {
    /// Row number and body offset of the `i`-th reserved row, given the same inclusive
    /// prefix sums passed to `reserve`.
    #[inline]
    pub fn placement(&self, i: usize, prefix: &[u32]) -> (u32, u32) {
        let before = if i == 0 { 0 } else { prefix[i - 1] };
        (self.first_row + i as u32, self.base + before)
    }
}

/// Concurrent writer over a chunk.
///
/// Created by [`Kds::appender`], which holds the chunk's exclusive borrow for as long as any
/// copy of the appender is alive. The appender itself is `Copy + Sync`, so every worker
/// thread of a launch may hold one.
#[derive(Debug, Clone, Copy)]
pub struct KdsAppender<'a> {
    kds: &'a Kds,
}

impl Kds {
    /// Begin a population phase.
    pub fn appender(&mut self) -> KdsAppender<'_> {
        KdsAppender { kds: self }
    }

    /// Single-threaded convenience: append one row.
    pub fn push_row(&mut self, values: &[Datum]) -> Result<u32> {
        self.appender().append_row(values)
    }

    /// Single-threaded convenience: append one HASH item.
    pub fn push_hash_row(&mut self, hash: u32, values: &[Datum]) -> Result<u32> {
        self.appender().append_hash_row(hash, values)
    }
}

impl<'a> KdsAppender<'a> {
    #[inline]
    pub fn kds(&self) -> &'a Kds {
        self.kds
    }

    #[inline]
    pub fn footprint(&self, values: &[Datum]) -> Result<u32> {
        self.kds.row_footprint(values)
    }

    /// Atomically claim as many leading rows as fit.
    ///
    /// `prefix` holds inclusive prefix sums of the per-row footprints (a warp computes them
    /// with one stair-add). The call claims the longest leading run of rows for which both
    /// a room and the bytes are available, or nothing. Neither `nitems` nor `usage` is ever
    /// advanced past capacity.
    pub fn reserve(&self, prefix: &[u32]) -> Option<Reservation> {
        if prefix.is_empty() {
            return None;
        }
        let kds = self.kds;
        let capacity = kds.body.len() as u32 - kds.fixed_area;
        let mut cur = kds.state.load(Ordering::Acquire);
        loop {
            let (nitems, usage) = unpack_state(cur);
            let rooms = (kds.nrooms - nitems) as usize;
            let avail = capacity - usage;
            let by_rooms = &prefix[..prefix.len().min(rooms)];
            let k = by_rooms.partition_point(|&p| p <= avail);
            if k == 0 {
                return None;
            }
            let new_usage = usage + prefix[k - 1];
            let next = pack_state(nitems + k as u32, new_usage);
            match kds
                .state
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Some(Reservation {
                        first_row: nitems,
                        nrows: k as u32,
                        base: kds.body.len() as u32 - new_usage,
                    });
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Write row `i` of a reservation. Not for HASH chunks.
    pub fn write_row(
        &self,
        res: &Reservation,
        i: usize,
        prefix: &[u32],
        values: &[Datum],
    ) -> Result<u32> {
        let (row, offset) = res.placement(i, prefix);
        match self.kds.format {
            KdsFormat::Row => {
                let bytes = tuple::encode_tuple(&self.kds.columns, values)?;
                self.kds.body.write(offset as usize, &bytes)?;
                self.kds.body.write_u32(row as usize * 4, offset)?;
            }
            KdsFormat::Column => self.write_column_row(row, offset, values)?,
            format => {
                return Err(Error::InvalidArgumentError(format!(
                    "write_row does not populate {format:?} chunks"
                )));
            }
        }
        Ok(row)
    }

    /// Write row `i` of a reservation on a HASH chunk and link it into its slot.
    pub fn write_hash_row(
        &self,
        res: &Reservation,
        i: usize,
        prefix: &[u32],
        hash: u32,
        values: &[Datum],
    ) -> Result<u32> {
        self.kds.expect_format(KdsFormat::Hash)?;
        let (row, offset) = res.placement(i, prefix);
        let offset = offset as usize;
        let bytes = tuple::encode_tuple(&self.kds.columns, values)?;
        self.kds.body.write_u32(offset, hash)?;
        self.kds.body.write(offset + HASH_ITEM_PREFIX, &bytes)?;
        self.kds.body.write_u32(row as usize * 4, offset as u32)?;

        let slot = &self.kds.hash_slots[(hash as usize) % self.kds.hash_slots.len()];
        let mut head = slot.load(Ordering::Acquire);
        loop {
            self.kds.body.write_u32(offset + 4, head)?;
            match slot.compare_exchange_weak(head, row + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(row),
                Err(actual) => head = actual,
            }
        }
    }

    fn write_column_row(&self, row: u32, offset: u32, values: &[Datum]) -> Result<()> {
        let kds = self.kds;
        let row = row as usize;
        let mut extra = offset as usize;
        for (m, v) in kds.meta.iter().zip(values) {
            kds.body
                .write(m.nulls_offset as usize + row, &[v.is_null() as u8])?;
            if v.is_null() {
                continue;
            }
            match (m.type_op.width(), v.as_bytes()) {
                (Some(width), _) => {
                    let mut raw = [0u8; 8];
                    v.write_fixed(&mut raw[..width])?;
                    kds.body
                        .write(m.values_offset as usize + row * width, &raw[..width])?;
                }
                (None, Some(payload)) => {
                    kds.body.write_u32(extra, payload.len() as u32)?;
                    kds.body.write(extra + 4, payload)?;
                    kds.body
                        .write_u32(m.values_offset as usize + row * 4, extra as u32)?;
                    extra += align_up(4 + payload.len(), 4);
                }
                (None, None) => {
                    return Err(Error::Internal(format!(
                        "fixed-width datum {v:?} in varlena column"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reserve and write one row; [`Error::DataStoreNoSpace`] if it does not fit.
    pub fn append_row(&self, values: &[Datum]) -> Result<u32> {
        let prefix = [self.footprint(values)?];
        let res = self.reserve(&prefix).ok_or_else(|| self.no_space(prefix[0]))?;
        self.write_row(&res, 0, &prefix, values)
    }

    /// Reserve and write one HASH item.
    pub fn append_hash_row(&self, hash: u32, values: &[Datum]) -> Result<u32> {
        let prefix = [self.footprint(values)?];
        let res = self.reserve(&prefix).ok_or_else(|| self.no_space(prefix[0]))?;
        self.write_hash_row(&res, 0, &prefix, hash, values)
    }

    fn no_space(&self, bytes: u32) -> Error {
        Error::DataStoreNoSpace(format!(
            "{} of {} rooms used, {} bytes requested with {} of {} free",
            self.kds.nitems(),
            self.kds.nrooms,
            bytes,
            self.kds.body.len() as u32 - self.kds.fixed_area - self.kds.usage(),
            self.kds.body.len() as u32 - self.kds.fixed_area
        ))
    }
}
