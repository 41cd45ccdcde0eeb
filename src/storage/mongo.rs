//! Document-database backend (feature `storage_mongo`).
//!
//! Documents go to the collection `analysis_<run_id>` of the configured
//! database. Result arrays are stored either inline as binary blobs inside
//! their index documents (`datastore = "inline"`, the default) or as `.npz`
//! files under `<datadir>/<run_id>/` with the document holding the blob
//! reference (`datastore = "numpy"`), matching the layout of the plain
//! numpy backend.

use std::path::PathBuf;

use async_trait::async_trait;
use mongodb::bson::{doc, spec::BinarySubtype, Binary, Bson, Document};
use mongodb::{Client, Collection};
use ndarray::ArrayD;

use crate::analysis::task::DispatchSeqEntry;
use crate::config::{DatastoreKind, Settings};
use crate::error::{DeltaError, Result};
use crate::storage::{numpy::NumpyBackend, utc_timestamp, StorageBackend};

const DEFAULT_URI: &str = "mongodb://localhost:27017/delta";

pub struct MongoBackend {
    collection: Collection<Document>,
    datastore: DatastoreKind,
    npz_store: Option<NumpyBackend>,
    run_id: String,
}

impl MongoBackend {
    pub async fn connect(cfg: &Settings, run_id: &str) -> Result<Self> {
        let uri = cfg
            .storage
            .connection
            .clone()
            .unwrap_or_else(|| DEFAULT_URI.to_string());
        let client = Client::with_uri_str(&uri)
            .await
            .map_err(|e| DeltaError::Backend(format!("cannot connect to {uri}: {e}")))?;
        let db = client
            .default_database()
            .ok_or_else(|| DeltaError::Backend(format!("{uri} names no database")))?;
        let collection = db.collection(&format!("analysis_{run_id}"));

        let datastore = cfg.storage.datastore.unwrap_or(DatastoreKind::Inline);
        let npz_store = match datastore {
            DatastoreKind::Inline => None,
            DatastoreKind::Numpy => {
                let datadir: PathBuf = cfg.storage.datadir.clone().ok_or_else(|| {
                    DeltaError::Configuration(
                        "storage.datadir is required for datastore = numpy".into(),
                    )
                })?;
                Some(NumpyBackend::new(&datadir, run_id)?)
            }
        };

        Ok(Self {
            collection,
            datastore,
            npz_store,
            run_id: run_id.to_string(),
        })
    }

    fn to_document(value: serde_json::Value) -> Result<Document> {
        let bson = mongodb::bson::to_bson(&value)
            .map_err(|e| DeltaError::Backend(format!("cannot convert document: {e}")))?;
        match bson {
            Bson::Document(doc) => Ok(doc),
            other => Err(DeltaError::Backend(format!(
                "expected a document, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl StorageBackend for MongoBackend {
    async fn store_one(&self, doc: serde_json::Value) -> Result<()> {
        self.collection
            .insert_one(Self::to_document(doc)?, None)
            .await
            .map_err(|e| DeltaError::Backend(format!("insert failed: {e}")))?;
        Ok(())
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
        let inserted = self
            .collection
            .insert_one(Self::to_document(doc)?, None)
            .await
            .map_err(|e| DeltaError::Backend(format!("metadata insert failed: {e}")))?;
        Ok(inserted.inserted_id.to_string())
    }

    async fn store_result(
        &self,
        task_name: &str,
        tidx: u64,
        data: &ArrayD<f64>,
        info: serde_json::Value,
    ) -> Result<()> {
        let mut doc = doc! {
            "task_name": task_name,
            "tidx": tidx as i64,
            "run_id": &self.run_id,
            "timestamp": utc_timestamp(),
            "description": "analysis results",
            "shape": data.shape().iter().map(|&d| d as i64).collect::<Vec<i64>>(),
        };
        match self.datastore {
            DatastoreKind::Inline => {
                let mut bytes = Vec::with_capacity(data.len() * 8);
                for v in data.iter() {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                doc.insert(
                    "data",
                    Bson::Binary(Binary {
                        subtype: BinarySubtype::Generic,
                        bytes,
                    }),
                );
            }
            DatastoreKind::Numpy => {
                // Delegate the blob to the on-disk layout and keep only the
                // reference here.
                let store = self.npz_store.as_ref().ok_or_else(|| {
                    DeltaError::Backend("numpy datastore not initialized".into())
                })?;
                store
                    .store_result(task_name, tidx, data, info.clone())
                    .await?;
            }
        }
        if let serde_json::Value::Object(extra) = info {
            for (k, v) in extra {
                let bson = mongodb::bson::to_bson(&v)
                    .map_err(|e| DeltaError::Backend(format!("cannot convert info: {e}")))?;
                doc.insert(k, bson);
            }
        }
        self.collection
            .insert_one(doc, None)
            .await
            .map_err(|e| DeltaError::Backend(format!("result insert failed: {e}")))?;
        Ok(())
    }
}
