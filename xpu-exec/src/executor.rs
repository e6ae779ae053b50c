//! Host driver of a scan: launch, collect, relaunch until every warp is done.

use xpu_expr::ExprProgram;
use xpu_kds::Kds;
use xpu_result::{Error, Result};
use xpu_types::Datum;

use crate::host;
use crate::launch::launch;
use crate::preagg::finalize_preagg;
use crate::session::KernSession;
use crate::task::{CancelHandle, GpuTask, StatsSnapshot};

/// Everything a finished scan produced.
#[derive(Debug)]
pub struct ScanOutput {
    /// Destination chunks in launch order; empty ones are dropped.
    pub chunks: Vec<Kds>,
    /// Rows the host produced for deferred combinations, in the same layout as the chunks.
    pub fallback_rows: Vec<Vec<Datum>>,
    pub stats: StatsSnapshot,
    pub launches: u32,
}

impl ScanOutput {
    /// Chunk rows followed by the host rows.
    pub fn rows(&self) -> Result<Vec<Vec<Datum>>> {
        let mut out = Vec::new();
        for chunk in &self.chunks {
            out.extend(chunk.rows()?);
        }
        out.extend(self.fallback_rows.iter().cloned());
        Ok(out)
    }

    /// Final rows: the projected rows, or for a pre-aggregating program one finished row
    /// per group merged across chunks and host rows.
    pub fn finalize(&self, program: &ExprProgram) -> Result<Vec<Vec<Datum>>> {
        if program.is_preagg() {
            finalize_preagg(program, &self.chunks, &self.fallback_rows)
        } else {
            self.rows()
        }
    }
}

pub struct ScanExecutor<'a> {
    session: KernSession<'a>,
    cancel: CancelHandle,
}

impl<'a> ScanExecutor<'a> {
    pub fn new(session: KernSession<'a>) -> Self {
        Self {
            session,
            cancel: CancelHandle::default(),
        }
    }

    #[inline]
    pub fn session(&self) -> &KernSession<'a> {
        &self.session
    }

    /// Handle another thread may use to stop the scan at the next step boundary.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn run(&self) -> Result<ScanOutput> {
        let config = self.session.config();
        if !config.enabled {
            tracing::info!("[SCAN] device execution disabled, evaluating on the host");
            let rows = host::evaluate_source(&self.session)?;
            return Ok(ScanOutput {
                chunks: Vec::new(),
                fallback_rows: rows,
                stats: StatsSnapshot::default(),
                launches: 0,
            });
        }

        let mut task = GpuTask::new(config, &self.session)?;
        task.cancel = self.cancel.clone();
        let columns = self.session.program().output_columns();
        let mut chunks = Vec::new();
        let mut deferred = Vec::new();
        loop {
            if task.launches >= config.max_relaunches {
                return Err(Error::Internal(format!(
                    "scan still running after {} launches",
                    task.launches
                )));
            }
            let mut dest = Kds::new_row(columns.clone(), config.dest_nrooms, config.dest_length)?;
            let summary = launch(&self.session, &mut task, &mut dest)?;
            let drained = task.drain_fallback();
            let ndrained = drained.len();
            deferred.extend(drained);

            if let Some(err) = task.error_record().to_error() {
                let code = task.error_record().code();
                tracing::warn!(
                    "[SCAN] launch #{} failed ({:?} recovery): {}",
                    task.launches,
                    code.recovery(),
                    err
                );
                return Err(err);
            }
            if summary.cancelled > 0 {
                tracing::info!("[SCAN] cancelled after {} launches", task.launches);
                return Err(Error::Cancelled);
            }

            let produced = dest.nitems();
            if produced > 0 {
                chunks.push(dest);
            }
            if task.is_done() {
                break;
            }
            if produced == 0 && ndrained == 0 {
                return Err(Error::DataStoreNoSpace(format!(
                    "launch #{} made no progress",
                    task.launches
                )));
            }
        }

        let fallback_rows = host::reevaluate_fallback(&self.session, &deferred)?;
        let stats = task.stats();
        tracing::info!("[SCAN] {}", stats.describe(config.regression_test_mode));
        Ok(ScanOutput {
            chunks,
            fallback_rows,
            stats,
            launches: task.launches,
        })
    }
}
