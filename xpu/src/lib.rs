//! xPU: device-resident scans, joins and pre-aggregation with suspend/resume kernels.
//!
//! This crate is the entrypoint of the workspace. It re-exports the pieces a host needs to
//! describe a scan, run it, and keep a cached table current.
//!
//! # Quick Start
//!
//! Build an expression program, wrap a source chunk in a session and run it:
//!
//! ```rust
//! use xpu::expr::{BuildOptions, FuncOpcode, ProgramBuilder};
//! use xpu::kds::Kds;
//! use xpu::types::{ColumnDef, Datum, TypeOpcode};
//! use xpu::{EngineConfig, KernSession, ScanExecutor};
//!
//! let columns = vec![ColumnDef::new("n", TypeOpcode::Int4).not_null()];
//! let mut source = Kds::new_row(columns, 100, 1 << 14).unwrap();
//! for n in 0..100 {
//!     source.push_row(&[Datum::Int4(n)]).unwrap();
//! }
//!
//! // SELECT n WHERE n < 10
//! let mut b = ProgramBuilder::new(0);
//! b.load_vars(0, &[(0, 0, TypeOpcode::Int4)]);
//! let n = b.var(0);
//! let ten = b.constant(Datum::Int4(10));
//! let qual = b.func(FuncOpcode::Int4Lt, &[n, ten]);
//! b.scan_quals(qual);
//! b.projection(&[("n", n)]);
//! let program = b.build(&BuildOptions::default()).unwrap();
//!
//! let config = EngineConfig::default();
//! let session = KernSession::scan(&config, &program, &[], &source).unwrap();
//! let output = ScanExecutor::new(session).run().unwrap();
//! assert_eq!(output.rows().unwrap().len(), 10);
//! ```
//!
//! # Architecture
//!
//! - **Types** (`xpu-types`): device type codes, datums, wire cursors.
//! - **Chunks** (`xpu-kds`): the ROW, COLUMN, HASH and BLOCK chunk formats.
//! - **Programs** (`xpu-expr`, `xpu-compute`): expression programs and their evaluator.
//! - **Execution** (`xpu-exec`): the warp pipeline, launches, suspend/resume and host
//!   fallback.
//! - **Cache** (`xpu-cache`): committed-row table cache replayed from a transaction log.
//! - **Errors** (`xpu-result`): host error enum and the device first-failure record.

#![forbid(unsafe_code)]

pub use xpu_exec::{
    EngineConfig, JoinKind, JoinMethod, KernSession, MultiRels, ScanExecutor, ScanOutput,
    StatsSnapshot,
};
pub use xpu_result::{Error, Result};

pub mod types {
    //! Device types and datums.
    pub use xpu_types::{ColumnDef, Datum, DatumKey, TypeOpcode, WARP_SIZE, hash_datums};
}

pub mod kds {
    //! Chunk formats and their wire image.
    pub use xpu_kds::{Kds, KdsFormat, TupleLoc};
}

pub mod expr {
    //! Expression programs.
    pub use xpu_expr::{
        AggKind, BuildOptions, DevKind, ExprProgram, FuncOpcode, NodeId, ProgramBuilder,
    };
}

pub mod exec {
    //! Lower-level launch control for callers that manage tasks themselves.
    pub use xpu_exec::{
        CancelHandle, FallbackEntry, GpuTask, LaunchSummary, Step, SuspendReason, WarpContext,
        finalize_preagg, host, launch_join, launch_scan,
    };
}

pub mod cache {
    //! Table cache and its transaction log.
    pub use xpu_cache::{
        CacheIdent, Ctid, GpuCache, LogRecord, LogType, RedoLogBuffer, ReplayStats, TxLogReader,
        TxLogWriter,
    };
}

pub mod errors {
    //! Device error codes and the shared error record.
    pub use xpu_result::{DeviceError, ErrorClass, ErrorCode, ErrorRecord, Recovery};
}

pub mod compute {
    //! Direct access to the expression evaluator.
    pub use xpu_compute::{KVars, KernContext, datum_cmp};
}
