//! Storage backends.
//!
//! Results and run metadata go to one of three backends, chosen once at
//! startup: `numpy` spools `.npz` blobs and JSON documents to disk, `mongo`
//! writes documents to a collection (feature `storage_mongo`), and `null`
//! discards everything. All three sit behind the same capability set:
//!
//! - `store_one` — write a single free-form document (the run-config
//!   document at startup uses this),
//! - `store_metadata` — write the run's metadata document, including the
//!   serialized dispatch sequence that later re-associates result rows with
//!   channel pairs,
//! - `store_result` — write one task's gathered result array for one chunk.
//!
//! A metadata failure at startup is fatal; a per-chunk result failure is
//! logged by the pipeline and the run continues.

pub mod null;
pub mod numpy;

#[cfg(feature = "storage_mongo")]
pub mod mongo;

use std::sync::Arc;

use async_trait::async_trait;
use ndarray::ArrayD;

use crate::analysis::task::DispatchSeqEntry;
use crate::config::{BackendKind, Settings};
use crate::error::{DeltaError, Result};

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Writes one free-form document.
    async fn store_one(&self, doc: serde_json::Value) -> Result<()>;

    /// Writes the run metadata document: run id, frozen configuration, UTC
    /// timestamp and the serialized dispatch sequence. Returns a backend
    /// document id.
    async fn store_metadata(
        &self,
        cfg: &Settings,
        run_id: &str,
        dispatch_seq: &[DispatchSeqEntry],
    ) -> Result<String>;

    /// Writes one task's gathered result rows for chunk `tidx`, plus an
    /// index document pointing at them.
    async fn store_result(
        &self,
        task_name: &str,
        tidx: u64,
        data: &ArrayD<f64>,
        info: serde_json::Value,
    ) -> Result<()>;

    /// Flushes and releases backend resources at the end of the run.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<dyn StorageBackend>")
    }
}

/// Constructs the backend selected by `storage.backend`. No hot-swap:
/// the choice is fixed for the lifetime of the run.
pub async fn create_backend(cfg: &Settings, run_id: &str) -> Result<Arc<dyn StorageBackend>> {
    match cfg.storage.backend {
        BackendKind::Numpy => {
            let datadir = cfg.storage.datadir.as_deref().ok_or_else(|| {
                DeltaError::Configuration("storage.datadir is required for the numpy backend".into())
            })?;
            Ok(Arc::new(numpy::NumpyBackend::new(datadir, run_id)?))
        }
        BackendKind::Null => Ok(Arc::new(null::NullBackend)),
        #[cfg(feature = "storage_mongo")]
        BackendKind::Mongo => Ok(Arc::new(mongo::MongoBackend::connect(cfg, run_id).await?)),
        #[cfg(not(feature = "storage_mongo"))]
        BackendKind::Mongo => Err(DeltaError::FeatureNotEnabled("storage_mongo".into())),
    }
}

/// The UTC timestamp format used in metadata and index documents.
pub(crate) fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
