//! # GLB Bridge
//!
//! Non-destructive export of a scene selection to a single GLB payload.
//!
//! ## Overview
//!
//! An export run binds temporary working copies onto the selected objects,
//! runs the optional stages (subdivision clamp, material pruning, UV
//! generation, mesh reduction, material analysis, texture downscaling)
//! against those copies, serializes the result and hands it to a delivery
//! channel. The source scene comes out of the run exactly as it went in;
//! temporary data is reclaimed on the host's main loop shortly after.
//!
//! ## Quick Start
//!
//! ```ignore
//! use glb_bridge::{load_scene, ExportOptions, Exporter, Host, ModelStore};
//!
//! // Load a scene bundle (directory or ZIP with a scene.json)
//! let mut scene = load_scene("path/to/scene.zip")?;
//! scene.select(&["Crate", "Barrel"]);
//!
//! // Export into a local store
//! let store = ModelStore::new();
//! let exporter = Exporter::new(store.clone());
//! let mut host = Host::new(scene);
//! let outcome = exporter.run(&mut host, &ExportOptions::default())?;
//! println!("{}", outcome.message);
//!
//! // Let deferred reclamation run
//! host.run_until_idle();
//! ```
//!
//! ## Custom stages
//!
//! The UV unwrapper, material validator, texture scaler and asset writer
//! are traits; hand the exporter your own with the `with_*` builders.

pub mod config;
pub mod delivery;
pub mod error;
pub mod export;
pub mod host;
pub mod pipeline;
pub mod reclaim;
pub mod reduce;
pub mod scene;
pub mod shadow;
pub mod stages;
pub mod types;

// Re-export main types for convenience
pub use config::{CompressionPreset, ExportOptions};
pub use delivery::{DeliveryChannel, ExportMetadata, HttpUploader, ModelStore};
pub use error::{BridgeError, Result};
pub use export::{AssetWriter, GlbWriter, ImageMode};
pub use host::{Host, SharedState};
pub use pipeline::{ExportOutcome, Exporter, PipelineReport, Stage};
pub use reduce::{ReductionEngine, ReductionMethod};
pub use scene::{MeshData, Scene};
pub use types::ObjectRef;

/// Load a scene bundle from a file path (ZIP or directory).
pub fn load_scene<P: AsRef<std::path::Path>>(path: P) -> Result<Scene> {
    scene::loader::load_from_path(path)
}

/// Load a zipped scene bundle from bytes.
pub fn load_scene_from_bytes(data: &[u8]) -> Result<Scene> {
    scene::loader::load_from_bytes(data)
}
