//! Per-warp resumable state.
//!
//! Everything a warp needs to pick up where it left off lives in its [`WarpContext`]:
//! the source cursor, the depth it was working on, the inter-depth rings with the row
//! combinations still in flight, per-lane join progress, the claimed source tuples and the
//! local pre-aggregation table. The host keeps the contexts between launches, or parks
//! them as opaque blobs with [`WarpContext::to_blob`].

use xpu_compute::KVars;
use xpu_kds::TupleLoc;
use xpu_result::{DeviceError, Error, Result};
use xpu_types::WARP_SIZE;
use xpu_types::codec::{WireReader, WireWriter};

use crate::preagg::GroupTable;

/// Entries each inter-depth ring holds.
pub const UNIT_TUPLES_PER_DEPTH: usize = 2 * WARP_SIZE;

/// `l_state` of a lane that has no more inner rows to visit.
pub const LSTATE_DONE: u32 = u32::MAX;

const WCTX_MAGIC: u32 = u32::from_le_bytes(*b"XWCX");

/// One row combination waiting for the next depth.
#[derive(Debug, Clone, PartialEq)]
pub struct KVarsEntry {
    /// Source tuple the combination descends from: a row number, or the tuple offset for
    /// BLOCK sources.
    pub src: u32,
    pub kvars: KVars,
}

/// Bounded queue between two depths. `read` and `write` only grow; their difference is the
/// number of buffered entries.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthRing {
    slots: Vec<Option<KVarsEntry>>,
    read: u32,
    write: u32,
}

impl Default for DepthRing {
    fn default() -> Self {
        Self {
            slots: vec![None; UNIT_TUPLES_PER_DEPTH],
            read: 0,
            write: 0,
        }
    }
}

impl DepthRing {
    #[inline]
    pub fn len(&self) -> usize {
        self.write.wrapping_sub(self.read) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free entries.
    #[inline]
    pub fn room(&self) -> usize {
        UNIT_TUPLES_PER_DEPTH - self.len()
    }

    #[inline]
    pub fn positions(&self) -> (u32, u32) {
        (self.read, self.write)
    }

    pub(crate) fn push(&mut self, entry: KVarsEntry) -> std::result::Result<(), DeviceError> {
        if self.room() == 0 {
            return Err(DeviceError::fatal("depth_ring", "inter-depth queue overflow"));
        }
        let idx = self.write as usize % UNIT_TUPLES_PER_DEPTH;
        self.slots[idx] = Some(entry);
        self.write = self.write.wrapping_add(1);
        Ok(())
    }

    /// The `i`-th buffered entry counted from the read position.
    pub(crate) fn peek(&self, i: usize) -> Option<&KVarsEntry> {
        if i >= self.len() {
            return None;
        }
        let idx = (self.read as usize + i) % UNIT_TUPLES_PER_DEPTH;
        self.slots[idx].as_ref()
    }

    /// Drop the `n` oldest entries.
    pub(crate) fn consume(&mut self, n: usize) {
        let n = n.min(self.len());
        for i in 0..n {
            let idx = (self.read as usize + i) % UNIT_TUPLES_PER_DEPTH;
            self.slots[idx] = None;
        }
        self.read = self.read.wrapping_add(n as u32);
    }
}

/// Lane state of one join depth.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinLanes {
    /// Outer entries taken from the previous depth's ring; lane `i` works on entry `i`.
    pub nbatch: usize,
    /// Nested loop: next inner row. Hash join: chain item + 1, 0 before the probe.
    pub l_state: [u32; WARP_SIZE],
    /// Whether the lane's outer entry has produced a match (LEFT OUTER bookkeeping).
    pub matched: [bool; WARP_SIZE],
    /// Probe hash of the lane's outer entry (hash joins).
    pub hash: [u32; WARP_SIZE],
}

impl Default for JoinLanes {
    fn default() -> Self {
        Self {
            nbatch: 0,
            l_state: [0; WARP_SIZE],
            matched: [false; WARP_SIZE],
            hash: [0; WARP_SIZE],
        }
    }
}

impl JoinLanes {
    pub(crate) fn reset(&mut self) {
        *self = JoinLanes::default();
    }
}

/// Source tuples a warp has claimed but not loaded yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceCursor {
    /// BLOCK sources: the page being drained.
    pub block: Option<u32>,
    /// Row numbers, or tuple offsets of the page, in load order.
    pub pending: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct WarpContext {
    pub warp_id: u32,
    /// Source units this warp has claimed (rows in units of `WARP_SIZE`, or blocks).
    pub smx_row_count: u32,
    pub depth: u16,
    /// Smallest depth that may still produce tuples.
    pub scan_done: u16,
    /// `rings[d]` holds combinations that passed depth `d`.
    pub rings: Vec<DepthRing>,
    /// `joins[d - 1]` belongs to join depth `d`.
    pub joins: Vec<JoinLanes>,
    pub source: SourceCursor,
    pub groups: GroupTable,
}

impl WarpContext {
    pub fn new(warp_id: u32, n_rels: usize) -> Self {
        Self {
            warp_id,
            rings: vec![DepthRing::default(); n_rels + 1],
            joins: vec![JoinLanes::default(); n_rels],
            ..Self::default()
        }
    }

    #[inline]
    pub fn n_rels(&self) -> usize {
        self.joins.len()
    }

    /// Past the last depth with every queue drained and every group flushed.
    pub fn is_done(&self) -> bool {
        self.scan_done as usize > self.n_rels() + 1
            && self.rings.iter().all(DepthRing::is_empty)
            && self.groups.is_empty()
    }

    /// Combinations currently buffered across all depths.
    pub fn in_flight(&self) -> usize {
        self.rings.iter().map(DepthRing::len).sum()
    }

    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        w.put_u32(WCTX_MAGIC);
        w.put_u32(self.warp_id);
        w.put_u32(self.smx_row_count);
        w.put_u16(self.depth);
        w.put_u16(self.scan_done);
        w.put_u16(self.rings.len() as u16);
        for ring in &self.rings {
            w.put_u32(ring.read);
            w.put_u32(ring.write);
            w.put_u16(ring.len() as u16);
            for i in 0..ring.len() {
                let entry = ring
                    .peek(i)
                    .ok_or_else(|| Error::Internal("hole in a depth ring".into()))?;
                w.put_u32(entry.src);
                entry.kvars.encode(&mut w)?;
            }
        }
        w.put_u16(self.joins.len() as u16);
        for j in &self.joins {
            w.put_u16(j.nbatch as u16);
            for lane in 0..WARP_SIZE {
                w.put_u32(j.l_state[lane]);
                w.put_u8(j.matched[lane] as u8);
                w.put_u32(j.hash[lane]);
            }
        }
        match self.source.block {
            Some(b) => {
                w.put_u8(1);
                w.put_u32(b);
            }
            None => w.put_u8(0),
        }
        w.put_u32(self.source.pending.len() as u32);
        for &off in &self.source.pending {
            w.put_u32(off);
        }
        self.groups.encode(&mut w)?;
        Ok(w.into_inner())
    }

    pub fn from_blob(blob: &[u8]) -> Result<WarpContext> {
        let mut r = WireReader::new(blob, "warp context");
        if r.get_u32()? != WCTX_MAGIC {
            return Err(r.corrupt("bad magic"));
        }
        let warp_id = r.get_u32()?;
        let smx_row_count = r.get_u32()?;
        let depth = r.get_u16()?;
        let scan_done = r.get_u16()?;
        let nrings = r.get_u16()? as usize;
        let mut rings = Vec::with_capacity(nrings);
        for _ in 0..nrings {
            let read = r.get_u32()?;
            let write = r.get_u32()?;
            let n = r.get_u16()? as usize;
            if n != write.wrapping_sub(read) as usize || n > UNIT_TUPLES_PER_DEPTH {
                return Err(r.corrupt(format!("ring ({read}, {write}) holds {n} entries")));
            }
            let mut ring = DepthRing {
                read,
                write: read,
                ..DepthRing::default()
            };
            for _ in 0..n {
                let src = r.get_u32()?;
                let kvars = KVars::decode(&mut r)?;
                ring.push(KVarsEntry { src, kvars })
                    .map_err(|e| r.corrupt(e.message))?;
            }
            rings.push(ring);
        }
        let njoins = r.get_u16()? as usize;
        if njoins + 1 != nrings {
            return Err(r.corrupt(format!("{nrings} rings for {njoins} joins")));
        }
        let mut joins = Vec::with_capacity(njoins);
        for _ in 0..njoins {
            let mut j = JoinLanes {
                nbatch: r.get_u16()? as usize,
                ..JoinLanes::default()
            };
            if j.nbatch > WARP_SIZE {
                return Err(r.corrupt(format!("join batch of {}", j.nbatch)));
            }
            for lane in 0..WARP_SIZE {
                j.l_state[lane] = r.get_u32()?;
                j.matched[lane] = r.get_u8()? != 0;
                j.hash[lane] = r.get_u32()?;
            }
            joins.push(j);
        }
        let block = match r.get_u8()? {
            0 => None,
            1 => Some(r.get_u32()?),
            other => return Err(r.corrupt(format!("bad block flag {other}"))),
        };
        let npending = r.get_u32()? as usize;
        let pending = (0..npending)
            .map(|_| r.get_u32())
            .collect::<Result<Vec<_>>>()?;
        let groups = GroupTable::decode(&mut r)?;
        if !r.is_empty() {
            return Err(r.corrupt(format!("{} trailing bytes", r.remaining())));
        }
        Ok(WarpContext {
            warp_id,
            smx_row_count,
            depth,
            scan_done,
            rings,
            joins,
            source: SourceCursor { block, pending },
            groups,
        })
    }
}

/// Location of source tuple `src` in a chunk of the given addressing.
#[inline]
pub(crate) fn source_loc(is_block: bool, src: u32) -> TupleLoc {
    if is_block {
        TupleLoc::Offset(src)
    } else {
        TupleLoc::Row(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpu_types::Datum;

    fn entry(src: u32) -> KVarsEntry {
        let mut kvars = KVars::new(2);
        kvars.set(0, Datum::Int8(src as i64));
        kvars.set(1, Datum::Text(format!("s{src}")));
        KVarsEntry { src, kvars }
    }

    #[test]
    fn ring_is_bounded_and_fifo() {
        let mut ring = DepthRing::default();
        for i in 0..UNIT_TUPLES_PER_DEPTH as u32 {
            ring.push(entry(i)).unwrap();
        }
        assert_eq!(ring.room(), 0);
        assert!(ring.push(entry(99)).is_err());
        ring.consume(3);
        assert_eq!(ring.peek(0).unwrap().src, 3);
        ring.push(entry(64)).unwrap();
        assert_eq!(ring.peek(ring.len() - 1).unwrap().src, 64);
        assert_eq!(ring.positions(), (3, 65));
    }

    #[test]
    fn blob_round_trip_keeps_in_flight_state() {
        let mut wc = WarpContext::new(5, 1);
        wc.smx_row_count = 7;
        wc.depth = 1;
        wc.scan_done = 1;
        for i in 0..40 {
            wc.rings[0].push(entry(i)).unwrap();
        }
        wc.rings[0].consume(33);
        wc.rings[1].push(entry(100)).unwrap();
        wc.joins[0].nbatch = 2;
        wc.joins[0].l_state[1] = LSTATE_DONE;
        wc.joins[0].matched[0] = true;
        wc.joins[0].hash[0] = 0xdead_beef;
        wc.source.block = Some(3);
        wc.source.pending = vec![8000, 7900];

        let blob = wc.to_blob().unwrap();
        let back = WarpContext::from_blob(&blob).unwrap();
        assert_eq!(back.smx_row_count, 7);
        assert_eq!((back.depth, back.scan_done), (1, 1));
        assert_eq!(back.rings, wc.rings);
        assert_eq!(back.joins, wc.joins);
        assert_eq!(back.source, wc.source);
        assert_eq!(back.in_flight(), 8);
        assert!(!back.is_done());

        assert!(WarpContext::from_blob(&blob[..blob.len() - 1]).is_err());
    }
}
