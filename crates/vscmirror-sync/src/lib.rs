//! Synchronization engine: resolves what the mirror should hold against what
//! it does hold, downloads the difference through a bounded worker pool, and
//! publishes consistent records behind the store's atomic-rename discipline.
//!
//! A pass never leaves the store inconsistent: version directories fill up
//! invisibly and only fully materialized versions are pointed at by any
//! `latest.json`. Individual item failures are counted and skipped; only an
//! unreachable upstream or a broken artifact root aborts the pass.

pub mod concurrency;
pub mod config;
pub mod pool;
pub mod resolver;
pub mod sync;

pub use concurrency::{install_signal_handler, shutdown_requested, StoreLock};
pub use config::SyncConfig;
pub use pool::{DownloadPool, PoolReport, Progress};
pub use resolver::{
    resolve, Catalog, ExtensionTarget, ResolvedCatalog, SyncMode, WorkItem, WorkKind,
};
pub use sync::{PassSummary, SyncOps, Synchronizer};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] vscmirror_store::StoreError),
    #[error("upstream error: {0}")]
    Upstream(#[from] vscmirror_upstream::UpstreamError),
    #[error("another sync pass holds the store lock: {0}")]
    LockHeld(String),
    #[error("every upstream endpoint was unreachable")]
    UpstreamUnreachable,
    #[error("sync pass cancelled")]
    Cancelled,
}
