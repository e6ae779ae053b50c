//! One kernel launch: every warp of the task runs until it finishes or suspends.
//!
//! Warps are scheduled on the rayon pool. They share the destination chunk through a
//! [`KdsAppender`](xpu_kds::KdsAppender), the task's counters, error record and fallback
//! buffer; everything else a warp touches is its own [`WarpContext`](crate::WarpContext).

use rayon::prelude::*;

use xpu_kds::{Kds, KdsFormat};
use xpu_result::{Error, Result};

use crate::pipeline::{LaunchShared, Step, SuspendReason, WarpRunner};
use crate::preagg::PreAggLayout;
use crate::session::KernSession;
use crate::task::GpuTask;

/// How the warps of one launch ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchSummary {
    pub done: usize,
    pub aborted: usize,
    pub dest_full: usize,
    pub fallback_full: usize,
    pub cancelled: usize,
    /// Rows in the destination after the launch.
    pub nitems_out: u32,
}

impl LaunchSummary {
    #[inline]
    pub fn suspended(&self) -> usize {
        self.dest_full + self.fallback_full + self.cancelled
    }

    fn record(&mut self, step: Step) {
        match step {
            Step::Done => self.done += 1,
            Step::Aborted => self.aborted += 1,
            Step::Suspended(SuspendReason::DestinationFull) => self.dest_full += 1,
            Step::Suspended(SuspendReason::FallbackFull) => self.fallback_full += 1,
            Step::Suspended(SuspendReason::Cancelled) => self.cancelled += 1,
            // `WarpRunner::run` never stops on progress
            Step::Progress => {}
        }
    }
}

/// Launch a plain scan.
pub fn launch_scan(
    session: &KernSession<'_>,
    task: &mut GpuTask,
    dest: &mut Kds,
) -> Result<LaunchSummary> {
    if session.n_rels() != 0 {
        return Err(Error::InvalidArgumentError(format!(
            "launch_scan on a session with {} joins",
            session.n_rels()
        )));
    }
    launch(session, task, dest)
}

/// Launch a multi-relation join.
pub fn launch_join(
    session: &KernSession<'_>,
    task: &mut GpuTask,
    dest: &mut Kds,
) -> Result<LaunchSummary> {
    if session.n_rels() == 0 {
        return Err(Error::InvalidArgumentError(
            "launch_join on a session without inner relations".into(),
        ));
    }
    launch(session, task, dest)
}

pub(crate) fn launch(
    session: &KernSession<'_>,
    task: &mut GpuTask,
    dest: &mut Kds,
) -> Result<LaunchSummary> {
    if usize::from(task.n_rels) != session.n_rels() {
        return Err(Error::InvalidArgumentError(format!(
            "task was built for {} joins, session has {}",
            task.n_rels,
            session.n_rels()
        )));
    }
    if !matches!(dest.format(), KdsFormat::Row | KdsFormat::Column) {
        return Err(Error::InvalidArgumentError(format!(
            "destination must be a ROW or COLUMN chunk, got {:?}",
            dest.format()
        )));
    }
    let expected = session.program().output_columns().len();
    if dest.ncols() != expected {
        return Err(Error::InvalidArgumentError(format!(
            "destination has {} columns, program emits {expected}",
            dest.ncols()
        )));
    }

    task.resume = task.launches > 0;
    task.launches += 1;
    tracing::debug!(
        "[LAUNCH] #{} ({}) over {} warps, destination {} rooms / {} bytes",
        task.launches,
        if task.resume { "resume" } else { "initial" },
        task.warps.len(),
        dest.nrooms(),
        dest.length()
    );

    let preagg = PreAggLayout::from_program(session.program());
    let GpuTask {
        geometry,
        warps,
        suspend_count,
        stats,
        error,
        fallback,
        cancel,
        ..
    } = &mut *task;
    let shared = LaunchShared {
        nwarps: geometry.nwarps,
        dest: dest.appender(),
        stats,
        error,
        fallback,
        cancel,
        suspend_count,
        preagg: preagg.as_ref(),
    };
    let steps: Vec<Step> = warps
        .par_iter_mut()
        .map(|wc| WarpRunner::new(session, wc, &shared).run())
        .collect();

    let mut summary = LaunchSummary::default();
    for step in steps {
        summary.record(step);
    }
    summary.nitems_out = dest.nitems();
    tracing::debug!(
        "[LAUNCH] #{} finished: {} done, {} suspended, {} aborted, {} rows out",
        task.launches,
        summary.done,
        summary.suspended(),
        summary.aborted,
        summary.nitems_out
    );
    Ok(summary)
}
