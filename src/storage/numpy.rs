//! On-disk backend: `.npz` result blobs plus JSON documents.
//!
//! Layout under `<datadir>/<run_id>/`:
//!
//! - `metadata.json` — the run metadata document (config, timestamp,
//!   serialized dispatch sequence),
//! - `<uuid>.npz` — one blob per (task, chunk) result, a single `data` key
//!   holding the gathered array with pair rows leading,
//! - `catalog.jsonl` — one index document per line: free-form documents
//!   from `store_one` and `{task_name, tidx, run_id, blob_ref, timestamp}`
//!   entries pointing at the blobs.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use ndarray::ArrayD;
use ndarray_npy::NpzWriter;
use uuid::Uuid;

use crate::analysis::task::DispatchSeqEntry;
use crate::config::Settings;
use crate::error::{DeltaError, Result};
use crate::storage::{utc_timestamp, StorageBackend};

pub struct NumpyBackend {
    dir: PathBuf,
    run_id: String,
    // Index lines are appended from concurrent storage continuations.
    catalog: Mutex<()>,
}

impl NumpyBackend {
    pub fn new(datadir: &Path, run_id: &str) -> Result<Self> {
        let dir = datadir.join(run_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| DeltaError::Backend(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            run_id: run_id.to_string(),
            catalog: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append_catalog_line(&self, doc: &serde_json::Value) -> Result<()> {
        let line = serde_json::to_string(doc)
            .map_err(|e| DeltaError::Backend(format!("cannot encode index document: {e}")))?;
        let _guard = self.catalog.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("catalog.jsonl"))
            .map_err(|e| DeltaError::Backend(format!("cannot open catalog: {e}")))?;
        writeln!(file, "{line}").map_err(|e| DeltaError::Backend(format!("catalog write: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for NumpyBackend {
    async fn store_one(&self, doc: serde_json::Value) -> Result<()> {
        self.append_catalog_line(&doc)
    }

    async fn store_metadata(
        &self,
        cfg: &Settings,
        run_id: &str,
        dispatch_seq: &[DispatchSeqEntry],
    ) -> Result<String> {
        let doc = serde_json::json!({
            "run_id": run_id,
            "run_config": cfg,
            "timestamp": utc_timestamp(),
            "channel_serialization": dispatch_seq,
            "description": "metadata",
        });
        let path = self.dir.join("metadata.json");
        let body = serde_json::to_vec_pretty(&doc)
            .map_err(|e| DeltaError::Backend(format!("cannot encode metadata: {e}")))?;
        std::fs::write(&path, body)
            .map_err(|e| DeltaError::Backend(format!("cannot write {}: {e}", path.display())))?;
        Ok(path.display().to_string())
    }

    async fn store_result(
        &self,
        task_name: &str,
        tidx: u64,
        data: &ArrayD<f64>,
        info: serde_json::Value,
    ) -> Result<()> {
        let blob_ref = format!("{}.npz", Uuid::new_v4());
        let path = self.dir.join(&blob_ref);
        let file = File::create(&path)
            .map_err(|e| DeltaError::Backend(format!("cannot create {}: {e}", path.display())))?;
        let mut npz = NpzWriter::new(file);
        npz.add_array("data", data)
            .map_err(|e| DeltaError::Backend(format!("cannot write {}: {e}", path.display())))?;
        npz.finish()
            .map_err(|e| DeltaError::Backend(format!("cannot finish {}: {e}", path.display())))?;

        let mut doc = serde_json::json!({
            "task_name": task_name,
            "tidx": tidx,
            "run_id": self.run_id,
            "blob_ref": blob_ref,
            "timestamp": utc_timestamp(),
            "description": "analysis results",
        });
        if let (Some(doc_map), serde_json::Value::Object(extra)) = (doc.as_object_mut(), info) {
            for (k, v) in extra {
                doc_map.insert(k, v);
            }
        }
        self.append_catalog_line(&doc)
    }
}
