//! Warp-cooperative scan, join and pre-aggregation pipeline.
//!
//! A scan is described by a [`KernSession`] (configuration, expression program, parameters,
//! outer source chunk and inner relations) and executed by a [`ScanExecutor`]. The executor
//! builds a [`GpuTask`] holding one [`WarpContext`] per warp, launches it against a fresh
//! destination chunk, and relaunches until every warp has finished:
//!
//! - A warp that finds the destination full saves its place and suspends; the next launch
//!   resumes it with a new destination, so no source tuple is scanned twice.
//! - Rows that raise a recoverable expression error are deferred into a bounded fallback
//!   buffer and finished on the host (see [`host`]) when `cpu_fallback` is enabled.
//! - The first error reported by any warp wins the task's error record and stops the scan.
//!
//! Warps run on the rayon pool; lanes within a warp are emulated in lock step by
//! [`LockstepWarp`].

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod coop;
pub mod executor;
pub mod host;
pub mod launch;
pub mod pipeline;
pub mod preagg;
pub mod session;
pub mod task;

pub use config::EngineConfig;
pub use context::{
    DepthRing, JoinLanes, KVarsEntry, LSTATE_DONE, SourceCursor, UNIT_TUPLES_PER_DEPTH,
    WarpContext,
};
pub use coop::{CooperativeGroup, LockstepWarp};
pub use executor::{ScanExecutor, ScanOutput};
pub use launch::{LaunchSummary, launch_join, launch_scan};
pub use pipeline::{Step, SuspendReason};
pub use preagg::{GroupTable, PreAggLayout, finalize_preagg};
pub use session::{InnerRel, JoinKind, JoinMethod, KernSession, MultiRels};
pub use task::{
    CancelHandle, FallbackBuffer, FallbackEntry, GpuTask, KvarsLayout, StatsSnapshot,
    TaskGeometry, TaskStats,
};
