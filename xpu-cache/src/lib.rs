//! Columnar table cache maintained from a transaction log.
//!
//! Writers append tagged records ([`LogRecord`]) to a log identified by a [`CacheIdent`].
//! A [`GpuCache`] replays the log: INSERT and DELETE are provisional until the matching
//! COMMIT or ABORT resolves them, and re-applying records that are already reflected is a
//! no-op. Scans read [`GpuCache::snapshot`], a ROW chunk of the committed rows only.
//!
//! A log whose signature differs from the cache's invalidates the whole cache; the caller
//! must [`GpuCache::reload`] it from the base table.

#![forbid(unsafe_code)]

pub mod cache;
pub mod ident;
pub mod log;
pub mod record;
pub mod redo;

pub use cache::{GpuCache, ReplayStats};
pub use ident::CacheIdent;
pub use log::{TX_LOG_FILE_MAGIC, TX_LOG_HEADER_SZ, TxLogReader, TxLogWriter};
pub use record::{Ctid, LogRecord, LogType, TX_LOG_MAGIC};
pub use redo::RedoLogBuffer;
