//! Backend that discards everything. Useful for throughput measurements and
//! as the storage stand-in for transport-level tests.

use async_trait::async_trait;
use log::debug;
use ndarray::ArrayD;

use crate::analysis::task::DispatchSeqEntry;
use crate::config::Settings;
use crate::error::Result;
use crate::storage::StorageBackend;

pub struct NullBackend;

#[async_trait]
impl StorageBackend for NullBackend {
    async fn store_one(&self, doc: serde_json::Value) -> Result<()> {
        debug!("null backend: dropping document {doc}");
        Ok(())
    }

    async fn store_metadata(
        &self,
        _cfg: &Settings,
        run_id: &str,
        dispatch_seq: &[DispatchSeqEntry],
    ) -> Result<String> {
        debug!(
            "null backend: dropping metadata for run {run_id} with {} tasks",
            dispatch_seq.len()
        );
        Ok("null".to_string())
    }

    async fn store_result(
        &self,
        task_name: &str,
        tidx: u64,
        data: &ArrayD<f64>,
        _info: serde_json::Value,
    ) -> Result<()> {
        debug!(
            "null backend: dropping result {task_name}/{tidx} with shape {:?}",
            data.shape()
        );
        Ok(())
    }
}
