//! Committed-row cache of one table, kept current by log replay.
//!
//! Every row is keyed by its row id and carries up to three versions of state: the
//! committed tuple, a provisional insert and a provisional delete. INSERT and DELETE only
//! touch the provisional state; COMMIT promotes it and ABORT drops it. Scans go through
//! [`GpuCache::snapshot`], which only ever sees committed tuples.
//!
//! Replay is an upsert-or-skip: a record whose effect is already present is counted as
//! skipped and changes nothing, so re-applying a log (or a prefix of it) converges to the
//! same committed state.

use std::io::Read;
use std::ops::AddAssign;

use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;
use xpu_kds::tuple::tuple_footprint;
use xpu_kds::{Kds, KdsFormat};
use xpu_result::{Error, Result};
use xpu_types::{ColumnDef, Datum};

use crate::ident::CacheIdent;
use crate::log::TxLogReader;
use crate::record::LogRecord;
use crate::redo::{RedoLogBuffer, check_record, check_tuple};

/// Per-replay counters. A record is either applied (and counted by kind) or skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub inserts: u64,
    pub deletes: u64,
    pub commits: u64,
    pub aborts: u64,
    pub skipped: u64,
}

impl ReplayStats {
    pub fn applied(&self) -> u64 {
        self.inserts + self.deletes + self.commits + self.aborts
    }

    pub fn records(&self) -> u64 {
        self.applied() + self.skipped
    }
}

impl AddAssign for ReplayStats {
    fn add_assign(&mut self, rhs: Self) {
        self.inserts += rhs.inserts;
        self.deletes += rhs.deletes;
        self.commits += rhs.commits;
        self.aborts += rhs.aborts;
        self.skipped += rhs.skipped;
    }
}

#[derive(Debug, Clone, Default)]
struct CachedRow {
    committed: Option<Vec<Datum>>,
    pending_insert: Option<Vec<Datum>>,
    /// Deleting transaction.
    pending_delete: Option<u32>,
}

impl CachedRow {
    fn is_empty(&self) -> bool {
        self.committed.is_none() && self.pending_insert.is_none() && self.pending_delete.is_none()
    }
}

#[derive(Debug)]
pub struct GpuCache {
    ident: CacheIdent,
    columns: Vec<ColumnDef>,
    rows: FxHashMap<u32, CachedRow>,
    /// Row ids with a committed tuple.
    visible: RoaringBitmap,
    valid: bool,
    stats: ReplayStats,
}

impl GpuCache {
    /// Empty cache for `ident`.
    pub fn new(ident: CacheIdent, columns: Vec<ColumnDef>) -> Self {
        Self {
            ident,
            columns,
            rows: FxHashMap::default(),
            visible: RoaringBitmap::new(),
            valid: true,
            stats: ReplayStats::default(),
        }
    }

    /// Cache initialised from a full table load. Every row is committed.
    pub fn load(
        ident: CacheIdent,
        columns: Vec<ColumnDef>,
        rows: impl IntoIterator<Item = (u32, Vec<Datum>)>,
    ) -> Result<Self> {
        let mut cache = Self::new(ident, columns);
        cache.fill(rows)?;
        tracing::debug!(
            "[CACHE] loaded {} rows into {}",
            cache.visible.len(),
            cache.ident
        );
        Ok(cache)
    }

    /// Discard every row and rebuild from a full table load under a (possibly new)
    /// signature. This is the only way back from an invalidated cache.
    pub fn reload(
        &mut self,
        ident: CacheIdent,
        rows: impl IntoIterator<Item = (u32, Vec<Datum>)>,
    ) -> Result<()> {
        if !self.ident.same_table(&ident) {
            return Err(Error::InvalidArgumentError(format!(
                "cannot reload cache of {} from {ident}",
                self.ident
            )));
        }
        self.clear();
        self.ident = ident;
        self.valid = true;
        self.fill(rows)?;
        tracing::info!(
            "[CACHE] reloaded {} with {} rows",
            self.ident,
            self.visible.len()
        );
        Ok(())
    }

    fn fill(&mut self, rows: impl IntoIterator<Item = (u32, Vec<Datum>)>) -> Result<()> {
        for (rowid, values) in rows {
            check_tuple(rowid, &values, &self.columns)?;
            if !self.visible.insert(rowid) {
                return Err(Error::InvalidArgumentError(format!(
                    "row id {rowid} loaded twice into {}",
                    self.ident
                )));
            }
            self.rows.insert(
                rowid,
                CachedRow {
                    committed: Some(values),
                    ..CachedRow::default()
                },
            );
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.rows.clear();
        self.visible.clear();
        self.stats = ReplayStats::default();
    }

    /// Drop all cached state. Replay and snapshots fail until [`GpuCache::reload`].
    pub fn invalidate(&mut self) {
        self.clear();
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn ident(&self) -> CacheIdent {
        self.ident
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Committed rows.
    pub fn nitems(&self) -> u64 {
        self.visible.len()
    }

    pub fn is_visible(&self, rowid: u32) -> bool {
        self.visible.contains(rowid)
    }

    /// Committed tuple of `rowid`.
    pub fn row(&self, rowid: u32) -> Option<&[Datum]> {
        self.rows.get(&rowid)?.committed.as_deref()
    }

    /// Row ids in snapshot order.
    pub fn visible_rowids(&self) -> impl Iterator<Item = u32> + '_ {
        self.visible.iter()
    }

    /// Rows with an unresolved INSERT or DELETE.
    pub fn npending(&self) -> usize {
        self.rows
            .values()
            .filter(|r| r.pending_insert.is_some() || r.pending_delete.is_some())
            .count()
    }

    /// Counters accumulated since the last load.
    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    fn require_valid(&self) -> Result<()> {
        if self.valid {
            return Ok(());
        }
        Err(Error::InvalidArgumentError(format!(
            "cache of {} is invalidated; reload required",
            self.ident
        )))
    }

    /// Gate every replay on the log's identity. A signature mismatch invalidates the cache.
    fn check_ident(&mut self, ident: &CacheIdent) -> Result<()> {
        self.require_valid()?;
        if !self.ident.same_table(ident) {
            return Err(Error::InvalidArgumentError(format!(
                "log of {ident} replayed into cache of {}",
                self.ident
            )));
        }
        if self.ident.signature != ident.signature {
            tracing::warn!(
                "[CACHE] signature mismatch on {}: log carries {:016x}, invalidating",
                self.ident,
                ident.signature
            );
            let expected = self.ident.signature;
            self.invalidate();
            return Err(Error::CacheSignatureMismatch {
                expected,
                found: ident.signature,
            });
        }
        Ok(())
    }

    /// Apply one record. Returns `false` when it was skipped.
    pub fn apply(&mut self, record: &LogRecord) -> Result<bool> {
        self.require_valid()?;
        check_record(record, &self.columns)?;
        let applied = match record {
            LogRecord::Insert { rowid, values } => {
                let row = self.rows.entry(*rowid).or_default();
                let present = row.pending_insert.as_ref() == Some(values)
                    || (row.pending_insert.is_none() && row.committed.as_ref() == Some(values));
                if !present {
                    row.pending_insert = Some(values.clone());
                }
                !present
            }
            LogRecord::Delete { xid, rowid, .. } => match self.rows.get_mut(rowid) {
                Some(row) if row.committed.is_some() || row.pending_insert.is_some() => {
                    let present = row.pending_delete == Some(*xid);
                    row.pending_delete = Some(*xid);
                    !present
                }
                _ => false,
            },
            LogRecord::CommitIns { rowid } => match self.rows.get_mut(rowid) {
                Some(row) => match row.pending_insert.take() {
                    Some(values) => {
                        row.committed = Some(values);
                        self.visible.insert(*rowid);
                        true
                    }
                    None => false,
                },
                None => false,
            },
            LogRecord::CommitDel { rowid } => {
                let hit = match self.rows.get_mut(rowid) {
                    Some(row) if row.pending_delete.is_some() => {
                        row.pending_delete = None;
                        row.committed = None;
                        self.visible.remove(*rowid);
                        true
                    }
                    _ => false,
                };
                self.forget_if_empty(*rowid);
                hit
            }
            LogRecord::AbortIns { rowid } => {
                let hit = self
                    .rows
                    .get_mut(rowid)
                    .is_some_and(|row| row.pending_insert.take().is_some());
                self.forget_if_empty(*rowid);
                hit
            }
            LogRecord::AbortDel { rowid } => self
                .rows
                .get_mut(rowid)
                .is_some_and(|row| row.pending_delete.take().is_some()),
        };

        if applied {
            match record {
                LogRecord::Insert { .. } => self.stats.inserts += 1,
                LogRecord::Delete { .. } => self.stats.deletes += 1,
                LogRecord::CommitIns { .. } | LogRecord::CommitDel { .. } => {
                    self.stats.commits += 1
                }
                LogRecord::AbortIns { .. } | LogRecord::AbortDel { .. } => self.stats.aborts += 1,
            }
        } else {
            self.stats.skipped += 1;
            tracing::trace!(
                "[CACHE] skipped {} of row {} on {}",
                record.log_type().name(),
                record.rowid(),
                self.ident
            );
        }
        Ok(applied)
    }

    fn forget_if_empty(&mut self, rowid: u32) {
        if self.rows.get(&rowid).is_some_and(CachedRow::is_empty) {
            self.rows.remove(&rowid);
        }
    }

    /// Replay `records`, logged under `ident`, in order.
    pub fn replay<'a>(
        &mut self,
        ident: &CacheIdent,
        records: impl IntoIterator<Item = &'a LogRecord>,
    ) -> Result<ReplayStats> {
        self.check_ident(ident)?;
        let before = self.stats;
        for rec in records {
            self.apply(rec)?;
        }
        Ok(self.replay_done(before))
    }

    /// Replay a whole log stream.
    pub fn replay_log<R: Read>(&mut self, mut reader: TxLogReader<R>) -> Result<ReplayStats> {
        self.check_ident(&reader.ident())?;
        let before = self.stats;
        while let Some(rec) = reader.next_record()? {
            self.apply(&rec)?;
        }
        Ok(self.replay_done(before))
    }

    /// Apply a filled redo buffer. The buffer is decoded in parallel first, so a bad record
    /// rejects the whole buffer before anything is applied.
    pub fn apply_redo(&mut self, buffer: &RedoLogBuffer) -> Result<ReplayStats> {
        self.check_ident(&buffer.ident())?;
        let records = buffer.decode(&self.columns)?;
        let before = self.stats;
        for rec in &records {
            self.apply(rec)?;
        }
        Ok(self.replay_done(before))
    }

    fn replay_done(&self, before: ReplayStats) -> ReplayStats {
        let delta = ReplayStats {
            inserts: self.stats.inserts - before.inserts,
            deletes: self.stats.deletes - before.deletes,
            commits: self.stats.commits - before.commits,
            aborts: self.stats.aborts - before.aborts,
            skipped: self.stats.skipped - before.skipped,
        };
        tracing::debug!(
            "[CACHE] replayed {} records into {}: {} applied, {} skipped, {} visible, {} pending",
            delta.records(),
            self.ident,
            delta.applied(),
            delta.skipped,
            self.visible.len(),
            self.npending()
        );
        delta
    }

    /// ROW chunk of the committed rows in ascending row id order, tagged with the table
    /// oid. Provisional state never reaches it.
    pub fn snapshot(&self) -> Result<Kds> {
        self.require_valid()?;
        let nrooms = u32::try_from(self.visible.len())
            .map_err(|_| Error::Internal(format!("{} rows do not fit a chunk", self.visible.len())))?
            .max(1);
        let mut bytes = 0usize;
        for values in self.committed_rows() {
            bytes += tuple_footprint(&self.columns, values?)?;
        }
        let length = Kds::estimate_length(KdsFormat::Row, &self.columns, nrooms, 0) + bytes;
        let mut kds =
            Kds::new_row(self.columns.clone(), nrooms, length)?.with_table_oid(self.ident.table_oid);
        for values in self.committed_rows() {
            kds.push_row(values?)?;
        }
        tracing::debug!(
            "[CACHE] snapshot of {}: {} rows, {} bytes",
            self.ident,
            kds.nitems(),
            kds.length()
        );
        Ok(kds)
    }

    fn committed_rows(&self) -> impl Iterator<Item = Result<&[Datum]>> + '_ {
        self.visible.iter().map(move |rowid| {
            self.row(rowid).ok_or_else(|| {
                Error::Internal(format!("visible row {rowid} has no committed tuple"))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Ctid;
    use xpu_types::TypeOpcode;

    fn ident() -> CacheIdent {
        CacheIdent::new(1, 500, 0xABCD)
    }

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("k", TypeOpcode::Int8).not_null(),
            ColumnDef::new("v", TypeOpcode::Text),
        ]
    }

    fn tuple(k: i64) -> Vec<Datum> {
        vec![Datum::Int8(k), Datum::Text(format!("v{k}"))]
    }

    fn insert(rowid: u32, k: i64) -> LogRecord {
        LogRecord::Insert {
            rowid,
            values: tuple(k),
        }
    }

    fn delete(rowid: u32) -> LogRecord {
        LogRecord::Delete {
            xid: 900,
            rowid,
            ctid: Ctid::new(0, rowid as u16),
        }
    }

    #[test]
    fn insert_commit_twice_is_visible_once() {
        let mut cache = GpuCache::new(ident(), columns());
        let log = [insert(3, 30), LogRecord::CommitIns { rowid: 3 }];
        let first = cache.replay(&ident(), &log).unwrap();
        assert_eq!(first.applied(), 2);
        let second = cache.replay(&ident(), &log).unwrap();
        assert_eq!(second.skipped, 2);
        assert_eq!(cache.nitems(), 1);
        assert_eq!(cache.row(3), Some(tuple(30).as_slice()));
        assert_eq!(cache.npending(), 0);
    }

    #[test]
    fn aborted_insert_leaves_nothing() {
        let mut cache = GpuCache::new(ident(), columns());
        cache
            .replay(&ident(), &[insert(1, 1), LogRecord::AbortIns { rowid: 1 }])
            .unwrap();
        assert_eq!(cache.nitems(), 0);
        assert!(cache.row(1).is_none());
        assert_eq!(cache.npending(), 0);
    }

    #[test]
    fn aborted_delete_keeps_the_prior_row() {
        let mut cache = GpuCache::load(ident(), columns(), [(1, tuple(1))]).unwrap();
        cache.apply(&delete(1)).unwrap();
        // a pending delete does not hide the committed tuple
        assert!(cache.is_visible(1));
        assert_eq!(cache.npending(), 1);
        cache.apply(&LogRecord::AbortDel { rowid: 1 }).unwrap();
        assert!(cache.is_visible(1));
        assert_eq!(cache.row(1), Some(tuple(1).as_slice()));
    }

    #[test]
    fn committed_delete_removes_the_row() {
        let mut cache = GpuCache::load(ident(), columns(), [(1, tuple(1)), (2, tuple(2))]).unwrap();
        let stats = cache
            .replay(&ident(), &[delete(1), LogRecord::CommitDel { rowid: 1 }])
            .unwrap();
        assert_eq!((stats.deletes, stats.commits), (1, 1));
        assert!(!cache.is_visible(1));
        assert_eq!(cache.visible_rowids().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn second_commit_of_a_delete_is_skipped() {
        let mut cache = GpuCache::load(ident(), columns(), [(3, tuple(3))]).unwrap();
        assert!(cache.apply(&delete(3)).unwrap());
        assert!(cache.apply(&LogRecord::CommitDel { rowid: 3 }).unwrap());
        assert!(!cache.apply(&LogRecord::CommitDel { rowid: 3 }).unwrap());
        assert_eq!(cache.npending(), 0);
        assert!(cache.row(3).is_none());
    }

    #[test]
    fn pending_insert_is_not_visible() {
        let mut cache = GpuCache::new(ident(), columns());
        cache.apply(&insert(8, 8)).unwrap();
        assert!(!cache.is_visible(8));
        assert_eq!(cache.snapshot().unwrap().nitems(), 0);
    }

    #[test]
    fn resolutions_without_provisional_state_are_skipped() {
        let mut cache = GpuCache::new(ident(), columns());
        for rec in [
            LogRecord::CommitIns { rowid: 1 },
            LogRecord::CommitDel { rowid: 1 },
            LogRecord::AbortIns { rowid: 1 },
            LogRecord::AbortDel { rowid: 1 },
            delete(1),
        ] {
            assert!(!cache.apply(&rec).unwrap());
        }
        assert_eq!(cache.stats().skipped, 5);
    }

    #[test]
    fn signature_mismatch_invalidates() {
        let mut cache = GpuCache::load(ident(), columns(), [(0, tuple(0))]).unwrap();
        let stale = CacheIdent::new(1, 500, 0x1234);
        let err = cache.replay(&stale, &[insert(1, 1)]).unwrap_err();
        assert!(matches!(
            err,
            Error::CacheSignatureMismatch {
                expected: 0xABCD,
                found: 0x1234
            }
        ));
        assert!(!cache.is_valid());
        assert_eq!(cache.nitems(), 0);
        assert!(cache.snapshot().is_err());
        assert!(cache.replay(&ident(), &[insert(1, 1)]).is_err());

        cache.reload(stale, [(5, tuple(5))]).unwrap();
        assert!(cache.is_valid());
        assert_eq!(cache.ident(), stale);
        assert_eq!(cache.visible_rowids().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn other_tables_are_rejected_without_invalidating() {
        let mut cache = GpuCache::new(ident(), columns());
        let other = CacheIdent::new(1, 501, 0xABCD);
        assert!(matches!(
            cache.replay(&other, &[insert(1, 1)]),
            Err(Error::InvalidArgumentError(_))
        ));
        assert!(cache.is_valid());
    }

    #[test]
    fn malformed_insert_is_corrupt() {
        let mut cache = GpuCache::new(ident(), columns());
        let bad = LogRecord::Insert {
            rowid: 1,
            values: vec![Datum::Text("x".into())],
        };
        assert!(matches!(cache.apply(&bad), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn snapshot_is_in_row_id_order() {
        let rows = [(9, tuple(9)), (2, tuple(2)), (5, tuple(5))];
        let cache = GpuCache::load(ident(), columns(), rows).unwrap();
        let kds = cache.snapshot().unwrap();
        assert_eq!(kds.table_oid(), 500);
        assert_eq!(kds.rows().unwrap(), vec![tuple(2), tuple(5), tuple(9)]);
    }
}
