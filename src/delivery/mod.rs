//! Handing the finished payload to the consumer.
//!
//! The latest payload and its metadata always land in a [`ModelStore`]
//! first; that store is what the preview server serves, so a failed push
//! still leaves the model available for the next poll.

#[cfg(feature = "server")]
pub mod server;
pub mod upload;

pub use upload::HttpUploader;

use crate::error::Result;
use crate::scene::Scene;
use crate::stages::MaterialReadiness;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Compression settings as reported to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSettingsSummary {
    pub compression: String,
    pub compression_enabled: bool,
}

/// Material readiness as reported to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterialsSummary {
    pub total: usize,
    pub ready: usize,
    pub unsupported: Vec<String>,
    pub analysis: BTreeMap<String, MaterialReadiness>,
}

/// Metadata record sent alongside the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportMetadata {
    pub filename: String,
    pub scene_name: String,
    pub timestamp: DateTime<Utc>,
    pub size: usize,
    /// Size in MiB with two decimals.
    pub size_mb: String,
    pub export_settings: ExportSettingsSummary,
    pub object_count: usize,
    /// Stage summary fragments.
    pub summary: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub materials: Option<MaterialsSummary>,
}

impl ExportMetadata {
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Size in MiB.
pub fn megabytes(size: usize) -> f64 {
    size as f64 / (1024.0 * 1024.0)
}

/// Metadata for a payload that arrived without any.
pub fn minimal_metadata(size: usize) -> Value {
    serde_json::json!({
        "filename": "model.glb",
        "size": size,
        "size_mb": format!("{:.2}", megabytes(size)),
        "timestamp": null,
    })
}

/// `<scene file stem>.glb`, or `untitled.glb` for scenes never saved.
pub fn payload_filename(scene: &Scene, name_override: Option<&str>) -> String {
    if let Some(name) = name_override.filter(|n| !n.trim().is_empty()) {
        return if name.ends_with(".glb") {
            name.to_string()
        } else {
            format!("{}.glb", name)
        };
    }
    scene
        .source_path
        .as_deref()
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
        .map(|stem| format!("{}.glb", stem))
        .unwrap_or_else(|| "untitled.glb".to_string())
}

/// A delivered payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredModel {
    pub payload: Arc<Vec<u8>>,
    pub metadata: Value,
}

/// The latest payload, shared between the exporter and the preview server.
#[derive(Debug, Default)]
pub struct ModelStore {
    latest: Mutex<Option<StoredModel>>,
}

impl ModelStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Option<StoredModel>> {
        self.latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the stored model.
    pub fn store(&self, payload: Vec<u8>, metadata: Value) {
        debug!(size = payload.len(), "Stored latest model");
        *self.lock() = Some(StoredModel {
            payload: Arc::new(payload),
            metadata,
        });
    }

    pub fn latest(&self) -> Option<StoredModel> {
        self.lock().clone()
    }

    pub fn latest_metadata(&self) -> Option<Value> {
        self.lock().as_ref().map(|m| m.metadata.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }
}

/// Where finished payloads go.
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &'static str;

    fn deliver(&self, payload: Vec<u8>, metadata: Value) -> Result<()>;
}

impl DeliveryChannel for ModelStore {
    fn name(&self) -> &'static str {
        "local"
    }

    fn deliver(&self, payload: Vec<u8>, metadata: Value) -> Result<()> {
        self.store(payload, metadata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_payload_filename() {
        let mut scene = Scene::new("Scene");
        assert_eq!(payload_filename(&scene, None), "untitled.glb");
        scene.source_path = Some(PathBuf::from("/work/props/barrel.zip"));
        assert_eq!(payload_filename(&scene, None), "barrel.glb");
        assert_eq!(payload_filename(&scene, Some("crate")), "crate.glb");
        assert_eq!(payload_filename(&scene, Some("crate.glb")), "crate.glb");
        assert_eq!(payload_filename(&scene, Some("  ")), "barrel.glb");
    }

    #[test]
    fn test_store_keeps_latest() {
        let store = ModelStore::new();
        assert!(store.is_empty());
        store.deliver(vec![1, 2, 3], minimal_metadata(3)).unwrap();
        store.deliver(vec![4, 5], minimal_metadata(2)).unwrap();
        let latest = store.latest().unwrap();
        assert_eq!(*latest.payload, vec![4, 5]);
        assert_eq!(latest.metadata["size"], 2);
        assert_eq!(store.latest_metadata().unwrap()["size_mb"], "0.00");
    }

    #[test]
    fn test_metadata_serializes_materials_only_when_present() {
        let metadata = ExportMetadata {
            filename: "a.glb".to_string(),
            scene_name: "Scene".to_string(),
            timestamp: Utc::now(),
            size: 2 * 1024 * 1024,
            size_mb: format!("{:.2}", megabytes(2 * 1024 * 1024)),
            export_settings: ExportSettingsSummary {
                compression: "MEDIUM".to_string(),
                compression_enabled: true,
            },
            object_count: 1,
            summary: vec!["Uncompressed".to_string()],
            materials: None,
        };
        let value = metadata.to_value().unwrap();
        assert_eq!(value["size_mb"], "2.00");
        assert!(value.get("materials").is_none());
        assert!(value["timestamp"].is_string());
    }
}
