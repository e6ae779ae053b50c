//! Depth state machine of one warp.
//!
//! Depth 0 loads source tuples and applies the scan qualifiers, depths `1..=n_rels` run
//! the joins and depth `n_rels + 1` projects or pre-aggregates into the destination chunk.
//! Depth `d` hands its results to depth `d + 1` through `rings[d]`. A warp works on one
//! depth per [`WarpRunner::step`]; it moves downstream once a full warp of entries is
//! buffered, and back upstream when the current depth runs dry while `scan_done` says an
//! earlier depth can still produce.
//!
//! Every step leaves the warp context consistent: source tuples are either still pending
//! or have been loaded, ring entries are consumed only after their results are written,
//! and nothing is written for an entry that stays in its ring. A suspended warp therefore
//! resumes from its context without scanning any tuple twice.

use std::ops::Range;
use std::sync::atomic::Ordering;

use xpu_compute::{DevResult, KVars, KernContext};
use xpu_kds::{KdsAppender, KdsFormat, TupleLoc};
use xpu_result::{DeviceError, ErrorCode, ErrorRecord};
use xpu_types::{Datum, WARP_SIZE};

use crate::context::{KVarsEntry, LSTATE_DONE, UNIT_TUPLES_PER_DEPTH, WarpContext, source_loc};
use crate::coop::{CooperativeGroup, LockstepWarp};
use crate::preagg::PreAggLayout;
use crate::session::{InnerRel, JoinKind, JoinMethod, KernSession};
use crate::task::{CancelHandle, FallbackBuffer, FallbackEntry, TaskStats};

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Work was done; call again.
    Progress,
    /// The warp saved its state and must be relaunched.
    Suspended(SuspendReason),
    /// Every depth is exhausted and every result written.
    Done,
    /// An error was reported to the task's error record.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspendReason {
    DestinationFull,
    FallbackFull,
    Cancelled,
}

/// Host-side error raised while touching a chunk from device code.
fn chunk_fault(err: xpu_result::Error) -> DeviceError {
    DeviceError::fatal("kds", err.to_string())
}

/// What one lane of a join pass did.
enum LaneOutcome {
    Emitted(KVars),
    Idle,
    /// A deferred failure did not fit into the fallback buffer.
    Blocked,
}

/// State shared by all warps of a launch.
pub(crate) struct LaunchShared<'r> {
    pub(crate) nwarps: u32,
    pub(crate) dest: KdsAppender<'r>,
    pub(crate) stats: &'r TaskStats,
    pub(crate) error: &'r ErrorRecord,
    pub(crate) fallback: &'r FallbackBuffer,
    pub(crate) cancel: &'r CancelHandle,
    pub(crate) suspend_count: &'r std::sync::atomic::AtomicU32,
    pub(crate) preagg: Option<&'r PreAggLayout>,
}

pub struct WarpRunner<'r, 'a> {
    session: &'r KernSession<'a>,
    ctx: KernContext<'a>,
    warp: LockstepWarp,
    wc: &'r mut WarpContext,
    shared: &'r LaunchShared<'r>,
}

impl<'r, 'a> WarpRunner<'r, 'a> {
    pub(crate) fn new(
        session: &'r KernSession<'a>,
        wc: &'r mut WarpContext,
        shared: &'r LaunchShared<'r>,
    ) -> Self {
        Self {
            session,
            ctx: session.device_context(),
            warp: LockstepWarp::new(),
            wc,
            shared,
        }
    }

    /// Step until the warp suspends, finishes or aborts.
    pub fn run(&mut self) -> Step {
        loop {
            match self.step() {
                Step::Progress => continue,
                other => return other,
            }
        }
    }

    /// Advance the state machine by one depth visit.
    pub fn step(&mut self) -> Step {
        if self.shared.cancel.is_cancelled() {
            return self.suspend(SuspendReason::Cancelled);
        }
        if self.shared.error.has_error() {
            return Step::Aborted;
        }
        if self.wc.is_done() {
            return Step::Done;
        }
        let n = self.session.n_rels();
        let depth = self.wc.depth as usize;
        let result = if depth == 0 {
            self.load_source()
        } else if depth <= n {
            self.join(depth)
        } else {
            self.output()
        };
        match result {
            Ok(step) => step,
            Err(err) => {
                if self.shared.error.report(&err) {
                    tracing::warn!("[WARP {}] aborted at depth {}: {}", self.wc.warp_id, depth, err);
                }
                Step::Aborted
            }
        }
    }

    fn suspend(&mut self, reason: SuspendReason) -> Step {
        self.shared.suspend_count.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            "[WARP {}] suspended at depth {} ({:?}), {} entries in flight",
            self.wc.warp_id,
            self.wc.depth,
            reason,
            self.wc.in_flight()
        );
        Step::Suspended(reason)
    }

    #[inline]
    fn go(&mut self, depth: usize) -> DevResult<Step> {
        self.wc.depth = depth as u16;
        Ok(Step::Progress)
    }

    /// All depths before `depth` are exhausted.
    #[inline]
    fn upstream_done(&self, depth: usize) -> bool {
        self.wc.scan_done as usize >= depth
    }

    /// Route a recoverable evaluation failure to the fallback buffer. Returns `Ok(false)`
    /// when the buffer is full, and the error itself when it cannot be deferred.
    fn defer(&self, err: DeviceError, eligible: bool, entry: FallbackEntry) -> DevResult<bool> {
        if !eligible || !self.session.config().cpu_fallback || err.code != ErrorCode::ExpressionEval
        {
            return Err(err);
        }
        tracing::debug!(
            "[WARP {}] deferring source tuple {} at depth {} to the host: {}",
            self.wc.warp_id,
            entry.src,
            entry.depth,
            err.message
        );
        match self.shared.fallback.try_push(entry) {
            Ok(()) => {
                self.shared.stats.add_fallback(1);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    // ------------------------------------------------------------------ depth 0

    /// Refill the pending list with the next source unit of this warp. Returns `false`
    /// once the source is exhausted.
    fn claim_source(&mut self) -> DevResult<bool> {
        let source = self.session.source();
        loop {
            let unit = u64::from(self.wc.smx_row_count) * u64::from(self.shared.nwarps)
                + u64::from(self.wc.warp_id);
            if source.format() == KdsFormat::Block {
                if unit >= u64::from(source.nblocks()) {
                    return Ok(false);
                }
                let block = unit as u32;
                self.wc.smx_row_count += 1;
                self.wc.source.block = Some(block);
                self.wc.source.pending = source.block_tuples(block).map_err(chunk_fault)?;
            } else {
                let start = unit * WARP_SIZE as u64;
                let nitems = u64::from(source.nitems());
                if start >= nitems {
                    return Ok(false);
                }
                self.wc.smx_row_count += 1;
                self.wc.source.pending = (start as u32..nitems.min(start + WARP_SIZE as u64) as u32).collect();
            }
            if !self.wc.source.pending.is_empty() {
                return Ok(true);
            }
        }
    }

    fn load_source(&mut self) -> DevResult<Step> {
        if self.upstream_done(1) || self.wc.rings[0].len() >= WARP_SIZE {
            return self.go(1);
        }
        if self.wc.source.pending.is_empty() && !self.claim_source()? {
            self.wc.scan_done = self.wc.scan_done.max(1);
            self.wc.source.block = None;
            tracing::trace!(
                "[WARP {}] source exhausted after {} units",
                self.wc.warp_id,
                self.wc.smx_row_count
            );
            return self.go(1);
        }
        let source = self.session.source();
        let is_block = source.format() == KdsFormat::Block;
        let quals = self.session.program().entries().scan_quals;
        let batch = self.wc.source.pending.len().min(WARP_SIZE);
        let mut loaded = 0;
        let mut passed = Vec::with_capacity(batch);
        let mut blocked = false;
        for lane in 0..batch {
            let src = self.wc.source.pending[lane];
            let mut kvars = self.ctx.new_kvars();
            let result = self
                .ctx
                .load_vars(0, source, Some(source_loc(is_block, src)), &mut kvars)
                .and_then(|_| self.ctx.eval_qual(quals, &mut kvars));
            match result {
                Ok(true) => passed.push(KVarsEntry { src, kvars }),
                Ok(false) => {}
                Err(err) => {
                    let entry = FallbackEntry {
                        src,
                        depth: 0,
                        inner: None,
                        kvars: KVars::new(0),
                    };
                    if !self.defer(err, true, entry)? {
                        blocked = true;
                        break;
                    }
                }
            }
            loaded += 1;
        }
        self.wc.source.pending.drain(..loaded);
        self.shared.stats.add_raw(loaded);
        self.shared.stats.add_in(passed.len());
        for entry in passed {
            self.wc.rings[0].push(entry)?;
        }
        if blocked {
            return Ok(self.suspend(SuspendReason::FallbackFull));
        }
        if self.wc.rings[0].len() >= WARP_SIZE {
            return self.go(1);
        }
        Ok(Step::Progress)
    }

    // ------------------------------------------------------------------ joins

    fn join(&mut self, depth: usize) -> DevResult<Step> {
        let rel = *self
            .session
            .rels()
            .at(depth)
            .ok_or_else(|| DeviceError::fatal("join", format!("no relation at depth {depth}")))?;
        if self.wc.rings[depth].room() < WARP_SIZE {
            return self.go(depth + 1);
        }
        if self.wc.joins[depth - 1].nbatch == 0 {
            let upstream = self.wc.rings[depth - 1].len();
            let done = self.upstream_done(depth);
            if upstream == 0 {
                if done {
                    self.wc.scan_done = self.wc.scan_done.max(depth as u16 + 1);
                    return self.go(depth + 1);
                }
                return self.go(depth - 1);
            }
            if upstream < WARP_SIZE && !done {
                return self.go(depth - 1);
            }
            let lanes = &mut self.wc.joins[depth - 1];
            lanes.reset();
            lanes.nbatch = upstream.min(WARP_SIZE);
        }

        let nbatch = self.wc.joins[depth - 1].nbatch;
        let mut emitted = Vec::with_capacity(nbatch);
        let mut votes = [false; WARP_SIZE];
        let mut blocked = false;
        for (lane, vote) in votes.iter_mut().enumerate().take(nbatch) {
            if self.wc.joins[depth - 1].l_state[lane] == LSTATE_DONE {
                continue;
            }
            match self.join_lane(depth, &rel, lane)? {
                LaneOutcome::Emitted(kvars) => {
                    *vote = true;
                    let src = self.outer(depth, lane)?.src;
                    emitted.push(KVarsEntry { src, kvars });
                }
                LaneOutcome::Idle => {}
                LaneOutcome::Blocked => blocked = true,
            }
        }
        let nemit = self.warp.ballot(&votes).count_ones() as usize;
        debug_assert_eq!(nemit, emitted.len());
        for entry in emitted {
            self.wc.rings[depth].push(entry)?;
        }
        self.shared.stats.add_depth_out(depth, nemit);

        let active: Vec<u32> = self.wc.joins[depth - 1].l_state[..nbatch]
            .iter()
            .map(|&s| (s != LSTATE_DONE) as u32)
            .collect();
        if self.warp.reduce_max(&active) == 0 {
            self.wc.rings[depth - 1].consume(nbatch);
            self.wc.joins[depth - 1].reset();
        }
        if blocked {
            return Ok(self.suspend(SuspendReason::FallbackFull));
        }
        if self.wc.rings[depth].len() >= WARP_SIZE {
            return self.go(depth + 1);
        }
        Ok(Step::Progress)
    }

    fn outer(&self, depth: usize, lane: usize) -> DevResult<&KVarsEntry> {
        self.wc.rings[depth - 1]
            .peek(lane)
            .ok_or_else(|| DeviceError::fatal("join", format!("lane {lane} has no outer entry")))
    }

    /// Advance one lane until it emits a combination or runs out of inner rows.
    fn join_lane(&mut self, depth: usize, rel: &InnerRel<'a>, lane: usize) -> DevResult<LaneOutcome> {
        let inner = rel.kds;
        let quals = self.session.program().entries().join_quals[depth - 1];
        let outer = self.outer(depth, lane)?.clone();

        if rel.method == JoinMethod::Hash && self.wc.joins[depth - 1].l_state[lane] == 0 {
            let mut probe = outer.kvars.clone();
            match self.ctx.hash_value(depth, &mut probe) {
                Ok(Some(h)) => {
                    let head = inner.hash_first(h).map_err(chunk_fault)?;
                    let lanes = &mut self.wc.joins[depth - 1];
                    lanes.hash[lane] = h;
                    lanes.l_state[lane] = head.map_or(LSTATE_DONE, |r| r + 1);
                }
                Ok(None) => {
                    return Err(DeviceError::fatal(
                        "hash_join",
                        format!("depth {depth} has no hash keys"),
                    ));
                }
                Err(err) => {
                    let entry = FallbackEntry {
                        src: outer.src,
                        depth: depth as u16,
                        inner: None,
                        kvars: outer.kvars.clone(),
                    };
                    if !self.defer(err, rel.kind == JoinKind::Inner, entry)? {
                        return Ok(LaneOutcome::Blocked);
                    }
                    self.wc.joins[depth - 1].l_state[lane] = LSTATE_DONE;
                    return Ok(LaneOutcome::Idle);
                }
            }
        }

        loop {
            let state = self.wc.joins[depth - 1].l_state[lane];
            // next candidate and the state that follows it
            let candidate = match rel.method {
                JoinMethod::NestLoop if state < inner.nitems() => Some((state, state + 1)),
                JoinMethod::NestLoop => None,
                JoinMethod::Hash if state == LSTATE_DONE => None,
                JoinMethod::Hash => {
                    let row = state - 1;
                    let next = inner.hash_next(row).map_err(chunk_fault)?;
                    let after = next.map_or(LSTATE_DONE, |r| r + 1);
                    if inner.hash_value(row).map_err(chunk_fault)? != self.wc.joins[depth - 1].hash[lane] {
                        self.wc.joins[depth - 1].l_state[lane] = after;
                        continue;
                    }
                    Some((row, after))
                }
            };
            let Some((row, after)) = candidate else {
                let lanes = &mut self.wc.joins[depth - 1];
                lanes.l_state[lane] = LSTATE_DONE;
                if rel.kind == JoinKind::Left && !lanes.matched[lane] {
                    let mut kvars = outer.kvars.clone();
                    self.ctx.load_vars(depth, inner, None, &mut kvars)?;
                    return Ok(LaneOutcome::Emitted(kvars));
                }
                return Ok(LaneOutcome::Idle);
            };

            let mut kvars = outer.kvars.clone();
            let result = self
                .ctx
                .load_vars(depth, inner, Some(TupleLoc::Row(row)), &mut kvars)
                .and_then(|_| self.ctx.eval_qual(quals, &mut kvars));
            match result {
                Ok(true) => {
                    let lanes = &mut self.wc.joins[depth - 1];
                    lanes.l_state[lane] = after;
                    lanes.matched[lane] = true;
                    return Ok(LaneOutcome::Emitted(kvars));
                }
                Ok(false) => self.wc.joins[depth - 1].l_state[lane] = after,
                Err(err) => {
                    let entry = FallbackEntry {
                        src: outer.src,
                        depth: depth as u16,
                        inner: Some(TupleLoc::Row(row)),
                        kvars: outer.kvars.clone(),
                    };
                    // a LEFT OUTER lane must know whether it matched before it can finish
                    if !self.defer(err, rel.kind == JoinKind::Inner, entry)? {
                        return Ok(LaneOutcome::Blocked);
                    }
                    self.wc.joins[depth - 1].l_state[lane] = after;
                }
            }
        }
    }

    // ------------------------------------------------------------------ last depth

    fn output(&mut self) -> DevResult<Step> {
        let n = self.session.n_rels();
        let done = self.upstream_done(n + 1);
        let buffered = self.wc.rings[n].len();
        if buffered == 0 {
            if !done {
                return self.go(n);
            }
            if !self.flush_groups()? {
                return Ok(self.suspend(SuspendReason::DestinationFull));
            }
            self.wc.scan_done = n as u16 + 2;
            tracing::trace!("[WARP {}] done", self.wc.warp_id);
            return Ok(Step::Done);
        }
        if buffered < WARP_SIZE && !done {
            return self.go(n);
        }
        let batch = buffered.min(WARP_SIZE);
        let step = match self.shared.preagg {
            Some(layout) => self.aggregate(batch, layout)?,
            None => self.project(batch)?,
        };
        if step != Step::Progress {
            return Ok(step);
        }
        if self.wc.rings[n].len() < WARP_SIZE && !done {
            return self.go(n);
        }
        Ok(Step::Progress)
    }

    /// `DataStoreNoSpace` if nothing fits into a destination nobody has written to.
    fn check_empty_destination(&self, bytes: u32) -> DevResult<()> {
        let kds = self.shared.dest.kds();
        if kds.nitems() == 0 {
            return Err(DeviceError::no_space(
                "projection",
                format!(
                    "row of {bytes} bytes does not fit an empty destination of {} bytes",
                    kds.length()
                ),
            ));
        }
        Ok(())
    }

    /// Write the leading rows that fit. Returns how many were written.
    fn write_rows(&self, rows: &[Vec<Datum>]) -> DevResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let dest = self.shared.dest;
        let sizes = rows
            .iter()
            .map(|r| dest.footprint(r))
            .collect::<xpu_result::Result<Vec<u32>>>()
            .map_err(chunk_fault)?;
        let (prefix, _total) = self.warp.stair_add(&sizes);
        let Some(res) = dest.reserve(&prefix) else {
            self.check_empty_destination(sizes[0])?;
            return Ok(0);
        };
        for (i, row) in rows.iter().enumerate().take(res.nrows as usize) {
            dest.write_row(&res, i, &prefix, row).map_err(chunk_fault)?;
        }
        self.shared.stats.add_out(res.nrows as usize);
        Ok(res.nrows as usize)
    }

    fn project(&mut self, batch: usize) -> DevResult<Step> {
        let n = self.session.n_rels();
        let mut results = Vec::with_capacity(batch);
        for lane in 0..batch {
            let mut kvars = self.lane_entry(n, lane)?.kvars.clone();
            results.push(self.ctx.projection(&mut kvars));
        }

        let cpu_fallback = self.session.config().cpu_fallback;
        if let Some(err) = results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .find(|e| !cpu_fallback || e.code != ErrorCode::ExpressionEval)
        {
            return Err(err.clone());
        }

        // fallback slots for the failed lanes, claimed up front in lane order
        let failed: Vec<usize> = (0..batch).filter(|&l| results[l].is_err()).collect();
        let slots: Range<usize> = if failed.is_empty() {
            0..0
        } else {
            self.shared.fallback.reserve(failed.len())
        };
        let limit = failed.get(slots.len()).copied().unwrap_or(batch);

        let mut emit_lanes = Vec::new();
        let mut rows = Vec::new();
        for (lane, r) in results.iter().enumerate().take(limit) {
            if let Ok(row) = r {
                emit_lanes.push(lane);
                rows.push(row.clone());
            }
        }
        let written = self.write_rows(&rows)?;
        let consumed = emit_lanes.get(written).copied().unwrap_or(limit);

        for (i, &lane) in failed.iter().enumerate().take(slots.len()) {
            if lane >= consumed {
                break;
            }
            let entry = self.lane_entry(n, lane)?;
            let fb = FallbackEntry {
                src: entry.src,
                depth: n as u16 + 1,
                inner: None,
                kvars: entry.kvars.clone(),
            };
            if let Some(Err(err)) = results.get(lane) {
                tracing::debug!(
                    "[WARP {}] deferring source tuple {} to the host: {}",
                    self.wc.warp_id,
                    fb.src,
                    err.message
                );
            }
            self.shared.fallback.fill(slots.start + i, fb);
            self.shared.stats.add_fallback(1);
        }
        self.wc.rings[n].consume(consumed);

        if written < rows.len() {
            return Ok(self.suspend(SuspendReason::DestinationFull));
        }
        if slots.len() < failed.len() {
            return Ok(self.suspend(SuspendReason::FallbackFull));
        }
        Ok(Step::Progress)
    }

    fn lane_entry(&self, depth: usize, lane: usize) -> DevResult<&KVarsEntry> {
        self.wc.rings[depth]
            .peek(lane)
            .ok_or_else(|| DeviceError::fatal("output", format!("lane {lane} has no entry")))
    }

    /// Fold one combination into the local group table. `Ok(false)` means the table is
    /// full and the combination's group is new.
    fn fold(&mut self, kvars: &KVars, layout: &PreAggLayout, capacity: usize) -> DevResult<bool> {
        let mut kvars = kvars.clone();
        let input = self.ctx.preagg_input(&mut kvars)?;
        let Some(partials) = self.wc.groups.entry(&input.keys, layout, capacity) else {
            return Ok(false);
        };
        let mut next = partials.clone();
        layout.accumulate(&mut next, &input.args)?;
        *partials = next;
        Ok(true)
    }

    fn aggregate(&mut self, batch: usize, layout: &PreAggLayout) -> DevResult<Step> {
        let n = self.session.n_rels();
        let capacity = self.session.config().preagg_local_groups;
        let mut consumed = 0;
        let mut suspend = None;
        for lane in 0..batch {
            let entry = self.lane_entry(n, lane)?.clone();
            let mut folded = self.fold(&entry.kvars, layout, capacity);
            if let Ok(false) = folded {
                if !self.flush_groups()? {
                    suspend = Some(SuspendReason::DestinationFull);
                    break;
                }
                folded = self.fold(&entry.kvars, layout, capacity);
            }
            match folded {
                Ok(true) => {}
                Ok(false) => {
                    return Err(DeviceError::fatal(
                        "preagg",
                        "group table has no room after a flush",
                    ));
                }
                Err(err) => {
                    let fb = FallbackEntry {
                        src: entry.src,
                        depth: n as u16 + 1,
                        inner: None,
                        kvars: entry.kvars,
                    };
                    if !self.defer(err, true, fb)? {
                        suspend = Some(SuspendReason::FallbackFull);
                        break;
                    }
                }
            }
            consumed += 1;
        }
        self.wc.rings[n].consume(consumed);
        Ok(match suspend {
            Some(reason) => self.suspend(reason),
            None => Step::Progress,
        })
    }

    /// Write the local group table out as partial rows. Returns `false` if the destination
    /// filled up first; the unwritten groups stay in the table.
    fn flush_groups(&mut self) -> DevResult<bool> {
        while !self.wc.groups.is_empty() {
            let rows: Vec<Vec<Datum>> = self.wc.groups.rows().take(WARP_SIZE).collect();
            let written = self.write_rows(&rows)?;
            self.wc.groups.drain_front(written);
            if written < rows.len() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// a join pass pushes at most one warp of entries into a ring with that much room
const _: () = assert!(UNIT_TUPLES_PER_DEPTH >= 2 * WARP_SIZE);
