//! Task descriptor shared by every launch of one scan.

use std::fmt::Write as _;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use xpu_compute::KVars;
use xpu_kds::TupleLoc;
use xpu_result::{ErrorRecord, Result};

use crate::config::EngineConfig;
use crate::context::WarpContext;
use crate::session::KernSession;

/// Launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskGeometry {
    pub grid_size: u32,
    pub block_size: u32,
    pub nwarps: u32,
}

/// Shape of the per-combination kvars array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvarsLayout {
    pub nslots: u16,
    /// Varlena byte quota per combination.
    pub nbytes: usize,
    /// Pipeline depths: the source, one per join, and the final stage.
    pub ndims: u16,
}

/// Counters shared by the warps of a task. Cumulative across launches.
#[derive(Debug)]
pub struct TaskStats {
    nitems_raw: AtomicU64,
    nitems_in: AtomicU64,
    nitems_out: AtomicU64,
    nitems_fallback: AtomicU64,
    /// Combinations produced by join depth `d` at index `d - 1`.
    depth_out: Vec<AtomicU64>,
}

/// Plain copy of [`TaskStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub nitems_raw: u64,
    pub nitems_in: u64,
    pub nitems_out: u64,
    pub nitems_fallback: u64,
    pub depth_out: Vec<u64>,
    pub suspend_count: u32,
    pub launches: u32,
}

impl TaskStats {
    pub fn new(n_rels: usize) -> Self {
        Self {
            nitems_raw: AtomicU64::new(0),
            nitems_in: AtomicU64::new(0),
            nitems_out: AtomicU64::new(0),
            nitems_fallback: AtomicU64::new(0),
            depth_out: (0..n_rels).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    pub(crate) fn add_raw(&self, n: usize) {
        self.nitems_raw.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_in(&self, n: usize) {
        self.nitems_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_out(&self, n: usize) {
        self.nitems_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_fallback(&self, n: usize) {
        self.nitems_fallback.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_depth_out(&self, depth: usize, n: usize) {
        if let Some(c) = depth.checked_sub(1).and_then(|d| self.depth_out.get(d)) {
            c.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn nitems_out(&self) -> u64 {
        self.nitems_out.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            nitems_raw: self.nitems_raw.load(Ordering::Relaxed),
            nitems_in: self.nitems_in.load(Ordering::Relaxed),
            nitems_out: self.nitems_out.load(Ordering::Relaxed),
            nitems_fallback: self.nitems_fallback.load(Ordering::Relaxed),
            depth_out: self
                .depth_out
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            ..StatsSnapshot::default()
        }
    }
}

impl StatsSnapshot {
    /// One-line summary for diagnostics. Launch and suspend counts depend on timing and
    /// are left out when `stable` is set.
    pub fn describe(&self, stable: bool) -> String {
        let mut s = format!(
            "raw={} in={} out={}",
            self.nitems_raw, self.nitems_in, self.nitems_out
        );
        for (d, n) in self.depth_out.iter().enumerate() {
            let _ = write!(s, " join{}={}", d + 1, n);
        }
        if self.nitems_fallback > 0 {
            let _ = write!(s, " fallback={}", self.nitems_fallback);
        }
        if !stable {
            let _ = write!(s, " launches={} suspends={}", self.launches, self.suspend_count);
        }
        s
    }
}

/// A combination whose evaluation raised a recoverable error on the device and must be
/// finished on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackEntry {
    pub src: u32,
    /// Depth that failed: 0 for the source, `1..=n_rels` for a join, `n_rels + 1` for the
    /// projection or pre-aggregation.
    pub depth: u16,
    /// Inner tuple of a failed join qualifier; `None` when the whole join of the outer
    /// entry has to be redone (its probe hash failed).
    pub inner: Option<TupleLoc>,
    /// Variables of the combination as they were before `depth` ran.
    pub kvars: KVars,
}

/// Bounded, lock-free collection of [`FallbackEntry`]s.
#[derive(Debug)]
pub struct FallbackBuffer {
    slots: Box<[OnceLock<FallbackEntry>]>,
    len: AtomicUsize,
}

impl FallbackBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).min(self.capacity())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim up to `n` consecutive slots. The returned range may be shorter, or empty once
    /// the buffer is full; the length never passes the capacity.
    pub fn reserve(&self, n: usize) -> Range<usize> {
        let mut cur = self.len.load(Ordering::Acquire);
        loop {
            let take = n.min(self.capacity().saturating_sub(cur));
            if take == 0 {
                return cur..cur;
            }
            match self.len.compare_exchange_weak(
                cur,
                cur + take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return cur..cur + take,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Store `entry` in a reserved slot. Reserved slots left unfilled are skipped by
    /// [`FallbackBuffer::drain`].
    pub fn fill(&self, slot: usize, entry: FallbackEntry) {
        if let Some(s) = self.slots.get(slot) {
            let _ = s.set(entry);
        }
    }

    /// Reserve one slot and store `entry` in it; hands the entry back if the buffer is full.
    pub fn try_push(&self, entry: FallbackEntry) -> std::result::Result<(), FallbackEntry> {
        let slot = self.reserve(1);
        if slot.is_empty() {
            return Err(entry);
        }
        self.fill(slot.start, entry);
        Ok(())
    }

    /// Take every entry. Exclusive access means no warp is running.
    pub fn drain(&mut self) -> Vec<FallbackEntry> {
        let n = self.len();
        let out = self.slots[..n]
            .iter_mut()
            .filter_map(OnceLock::take)
            .collect();
        *self.len.get_mut() = 0;
        out
    }
}

/// Host handle that requests cancellation of a running scan.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Task descriptor: geometry, kvars layout, the warps' contexts and the state every warp
/// shares. Created before the first launch and reused, unchanged in shape, by every
/// relaunch of the scan.
#[derive(Debug)]
pub struct GpuTask {
    pub geometry: TaskGeometry,
    pub kvars: KvarsLayout,
    pub n_rels: u16,
    pub warps: Vec<WarpContext>,
    /// Set for every launch after the first.
    pub resume: bool,
    pub launches: u32,
    pub(crate) suspend_count: AtomicU32,
    pub(crate) stats: TaskStats,
    pub(crate) error: ErrorRecord,
    pub(crate) fallback: FallbackBuffer,
    pub(crate) cancel: CancelHandle,
}

impl GpuTask {
    pub fn new(config: &EngineConfig, session: &KernSession<'_>) -> Result<GpuTask> {
        config.validate()?;
        let nwarps = config.nwarps();
        let n_rels = session.n_rels();
        let program = session.program();
        tracing::debug!(
            "[TASK] {} warps over {} relations, {} kvars slots",
            nwarps,
            n_rels,
            program.nslots()
        );
        Ok(GpuTask {
            geometry: TaskGeometry {
                grid_size: config.grid_size,
                block_size: config.block_size,
                nwarps: nwarps as u32,
            },
            kvars: KvarsLayout {
                nslots: program.nslots(),
                nbytes: config.kvars_nbytes,
                ndims: n_rels as u16 + 2,
            },
            n_rels: n_rels as u16,
            warps: (0..nwarps as u32)
                .map(|w| WarpContext::new(w, n_rels))
                .collect(),
            resume: false,
            launches: 0,
            suspend_count: AtomicU32::new(0),
            stats: TaskStats::new(n_rels),
            error: ErrorRecord::new(),
            fallback: FallbackBuffer::new(if config.cpu_fallback {
                config.fallback_capacity
            } else {
                0
            }),
            cancel: CancelHandle::default(),
        })
    }

    #[inline]
    pub fn error_record(&self) -> &ErrorRecord {
        &self.error
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    #[inline]
    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            suspend_count: self.suspend_count(),
            launches: self.launches,
            ..self.stats.snapshot()
        }
    }

    /// Every warp has finished.
    pub fn is_done(&self) -> bool {
        self.warps.iter().all(WarpContext::is_done)
    }

    /// Take the rows deferred to the host by the last launches.
    pub fn drain_fallback(&mut self) -> Vec<FallbackEntry> {
        self.fallback.drain()
    }
}
