//! Export orchestration.
//!
//! [`Exporter::run`] takes the scene's current selection through a single
//! pass of stages:
//!
//! ```text
//! Resolving selection -> Overriding subdivision -> Swapping data
//!   -> Pruning materials -> Generating UVs -> Reducing
//!   -> Validating materials -> Optimizing textures -> Serializing
//!   -> Delivering -> Reclaiming
//! ```
//!
//! Stages only touch working copies bound by [`crate::shadow`]. Whatever
//! happens in between, teardown restores texture references, then
//! subdivision levels, then mesh bindings, and finally schedules
//! reclamation and the selection restore on the main loop.

pub mod report;

pub use report::{capped_list, Notice, PipelineReport, Severity};

use crate::config::{ExportOptions, UvOptions};
use crate::delivery::{
    megabytes, payload_filename, DeliveryChannel, ExportMetadata, ExportSettingsSummary, MaterialsSummary,
};
use crate::error::{BridgeError, Result};
use crate::export::{AssetWriter, ExportSet, GlbWriter, ImageMode, SerializeSettings};
use crate::host::{panic_message, Host, SharedState, STATUS_CLEAR_FAILURE, STATUS_CLEAR_SUCCESS};
use crate::reclaim::{schedule_selection_restore, ReclamationPlan};
use crate::reduce::ReductionEngine;
use crate::scene::Scene;
use crate::shadow::{self, SwapRecord};
use crate::stages::validate::gather_materials;
use crate::stages::{
    materials, subdivision, textures, AtlasUnwrapper, LanczosScaler, MaterialValidator, NodeGraphValidator,
    SubdivisionOverrideRecord, TextureScaler, TextureSubstitution, UvStats, UvUnwrapper,
};
use crate::types::ObjectRef;
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolvingSelection,
    OverridingSubdivision,
    SwappingData,
    PruningMaterials,
    GeneratingUvs,
    Reducing,
    ValidatingMaterials,
    OptimizingTextures,
    Serializing,
    Delivering,
    Reclaiming,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::ResolvingSelection => "Resolving selection",
            Stage::OverridingSubdivision => "Applying subdivision override",
            Stage::SwappingData => "Creating temporary mesh data",
            Stage::PruningMaterials => "Removing unused materials",
            Stage::GeneratingUvs => "Generating UVs",
            Stage::Reducing => "Decimating meshes",
            Stage::ValidatingMaterials => "Analyzing materials",
            Stage::OptimizingTextures => "Optimizing textures",
            Stage::Serializing => "Exporting GLB",
            Stage::Delivering => "Delivering",
            Stage::Reclaiming => "Reclaiming temporary data",
        };
        f.write_str(label)
    }
}

/// A finished run.
#[derive(Debug)]
pub struct ExportOutcome {
    pub payload: Vec<u8>,
    pub metadata: ExportMetadata,
    pub report: PipelineReport,
    /// Stages entered, in order.
    pub stages: Vec<Stage>,
    /// Image mode of the serialization attempt that succeeded.
    pub image_mode: ImageMode,
    /// One-line summary, e.g. "Exported 1.20MB (Uncompressed)".
    pub message: String,
}

/// Names present before a run; anything else found at teardown was created by the run.
#[derive(Debug, Default)]
struct Inventory {
    objects: BTreeSet<String>,
    meshes: BTreeSet<String>,
    images: BTreeSet<String>,
}

impl Inventory {
    fn of(scene: &Scene) -> Self {
        Self {
            objects: scene.objects.keys().cloned().collect(),
            meshes: scene.meshes.keys().cloned().collect(),
            images: scene.images.keys().cloned().collect(),
        }
    }
}

/// Everything a run must undo or reclaim.
#[derive(Debug, Default)]
struct RunLedger {
    before: Inventory,
    subdivision: Vec<SubdivisionOverrideRecord>,
    swaps: Vec<SwapRecord>,
    textures: Vec<TextureSubstitution>,
}

impl RunLedger {
    fn reclamation_plan(&self, scene: &Scene) -> ReclamationPlan {
        let mut plan = ReclamationPlan::new();
        plan.add_swaps(&self.swaps);
        for sub in &self.textures {
            plan.add_image(sub.replacement.clone());
        }

        // Synthetic objects (atlases) and anything a failed stage left behind.
        for name in scene.objects.keys().filter(|n| !self.before.objects.contains(*n)) {
            if !plan.proxies.contains(name) {
                plan.add_object(name.clone());
            }
        }
        for name in scene.meshes.keys().filter(|n| !self.before.meshes.contains(*n)) {
            if !plan.working_meshes.contains(name) {
                plan.add_mesh(name.clone());
            }
        }
        for name in scene.images.keys().filter(|n| !self.before.images.contains(*n)) {
            if !plan.images.contains(name) {
                plan.add_image(name.clone());
            }
        }
        plan
    }
}

/// The selection, expanded.
#[derive(Debug, Default)]
struct Resolved {
    /// The user's selection.
    selection: Vec<ObjectRef>,
    /// Mesh objects to process, including members of instanced collections.
    sources: Vec<ObjectRef>,
    /// Objects reached through an instancing empty.
    instance_sources: HashSet<ObjectRef>,
    /// Selected objects exported as top-level nodes.
    top_level: Vec<ObjectRef>,
}

fn resolve_selection(scene: &Scene) -> Result<Resolved> {
    fn visit(scene: &Scene, name: &str, from_instance: bool, seen: &mut HashSet<String>, out: &mut Resolved) {
        if from_instance {
            out.instance_sources.insert(ObjectRef::new(name));
        }
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(object) = scene.object(name) else {
            return;
        };
        if object.is_mesh() {
            out.sources.push(ObjectRef::new(name));
        }
        if let Some(collection) = object.instance_collection() {
            for member in scene.collection_objects(collection) {
                visit(scene, &member.name, true, seen, out);
            }
        }
    }

    let mut resolved = Resolved {
        selection: scene.selected(),
        ..Default::default()
    };
    if resolved.selection.is_empty() {
        return Err(BridgeError::EmptySelection);
    }

    let mut seen = HashSet::new();
    for name in resolved.selection.clone() {
        visit(scene, name.as_str(), false, &mut seen, &mut resolved);
    }

    // Instanced sources are written through their instancer, not on their own.
    resolved.top_level = resolved
        .selection
        .iter()
        .filter(|o| !resolved.instance_sources.contains(*o))
        .cloned()
        .collect();
    if resolved.top_level.is_empty() {
        return Err(BridgeError::EmptySelection);
    }

    debug!(
        selected = resolved.selection.len(),
        sources = resolved.sources.len(),
        instanced = resolved.instance_sources.len(),
        "Resolved selection"
    );
    Ok(resolved)
}

/// Mutable state of one run.
struct Run<'a> {
    scene: &'a mut Scene,
    state: &'a SharedState,
    options: &'a ExportOptions,
    ledger: RunLedger,
    report: PipelineReport,
    stages: Vec<Stage>,
}

impl Run<'_> {
    /// Enter `stage` and run `body`, turning a panic into [`BridgeError::StagePanicked`].
    fn stage<T>(&mut self, stage: Stage, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.stages.push(stage);
        self.state.set_status(format!("{}...", stage));
        debug!(stage = %stage, "Entering stage");
        match catch_unwind(AssertUnwindSafe(|| body(self))) {
            Ok(result) => result,
            Err(panic) => Err(BridgeError::StagePanicked {
                stage: stage.to_string(),
                message: panic_message(&panic),
            }),
        }
    }
}

/// What the stages produced, before teardown.
struct Delivered {
    payload: Vec<u8>,
    metadata: ExportMetadata,
    image_mode: ImageMode,
}

/// Runs the export pipeline with a fixed set of collaborators.
pub struct Exporter {
    uv: Box<dyn UvUnwrapper>,
    validator: Box<dyn MaterialValidator>,
    scaler: Box<dyn TextureScaler>,
    writer: Box<dyn AssetWriter>,
    delivery: Arc<dyn DeliveryChannel>,
}

impl Exporter {
    /// Built-in collaborators, delivering to `delivery`.
    pub fn new(delivery: Arc<dyn DeliveryChannel>) -> Self {
        Self {
            uv: Box::new(AtlasUnwrapper),
            validator: Box::new(NodeGraphValidator),
            scaler: Box::new(LanczosScaler),
            writer: Box::new(GlbWriter),
            delivery,
        }
    }

    pub fn with_uv_unwrapper(mut self, uv: impl UvUnwrapper + 'static) -> Self {
        self.uv = Box::new(uv);
        self
    }

    pub fn with_validator(mut self, validator: impl MaterialValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn with_texture_scaler(mut self, scaler: impl TextureScaler + 'static) -> Self {
        self.scaler = Box::new(scaler);
        self
    }

    pub fn with_writer(mut self, writer: impl AssetWriter + 'static) -> Self {
        self.writer = Box::new(writer);
        self
    }

    /// Export the host scene's current selection.
    ///
    /// Fails with [`BridgeError::AlreadyExporting`] without touching anything
    /// while another run holds the export slot. Every other exit path runs
    /// the full teardown first; reclamation and the selection restore are
    /// left scheduled on the host's main loop.
    pub fn run(&self, host: &mut Host, options: &ExportOptions) -> Result<ExportOutcome> {
        let _guard = host.state.try_begin_export()?;

        let mut options = options.clone();
        if let Err(e) = options.validate() {
            return Err(fail(host, e));
        }

        host.state.set_status("Preparing export...");
        info!(scene = %host.scene.name, selected = host.scene.selection.len(), "Starting export");

        let selection = host.scene.selection.clone();
        let active = host.scene.active.clone();

        let mut run = Run {
            scene: &mut host.scene,
            state: &host.state,
            options: &options,
            ledger: RunLedger::default(),
            report: PipelineReport::new(),
            stages: Vec::new(),
        };
        run.ledger.before = Inventory::of(run.scene);

        let result = self.execute(&mut run);
        let Run {
            ledger,
            mut report,
            mut stages,
            ..
        } = run;

        teardown(&mut host.scene, &ledger);
        stages.push(Stage::Reclaiming);
        let mut plan = ledger.reclamation_plan(&host.scene);
        plan.add_orphan_candidates(host.state.take_unreclaimed());
        plan.schedule(&mut host.main_loop, Arc::clone(&host.state));
        schedule_selection_restore(&mut host.main_loop, selection, active);

        let delivered = match result {
            Ok(delivered) => delivered,
            Err(e) => return Err(fail(host, e)),
        };

        let size_mb = megabytes(delivered.payload.len());
        let message = format!("Exported {:.2}MB{}", size_mb, report.summary_suffix());
        report.info(message.clone());
        let generation = host.state.set_status(format!("✓ Export complete! ({:.2}MB)", size_mb));
        schedule_status_clear(host, generation, STATUS_CLEAR_SUCCESS);

        Ok(ExportOutcome {
            payload: delivered.payload,
            metadata: delivered.metadata,
            report,
            stages,
            image_mode: delivered.image_mode,
            message,
        })
    }

    fn execute(&self, run: &mut Run<'_>) -> Result<Delivered> {
        let options: &ExportOptions = run.options;
        let resolved = run.stage(Stage::ResolvingSelection, |run| resolve_selection(run.scene))?;

        if options.subdivision.enabled {
            run.stage(Stage::OverridingSubdivision, |run| {
                run.ledger.subdivision = subdivision::apply_override(run.scene, &resolved.sources, &options.subdivision);
                if !run.ledger.subdivision.is_empty() {
                    run.report
                        .fragment(format!("Subdiv Override: Level {}", options.subdivision.level));
                }
                Ok(())
            })?;
        }

        run.stage(Stage::SwappingData, |run| {
            run.ledger.swaps = shadow::materialize(run.scene, &resolved.sources, &mut run.report);
            Ok(())
        })?;

        // Sources whose copy failed are left out of the export entirely.
        let swapped: HashSet<&ObjectRef> = run.ledger.swaps.iter().map(|r| &r.object).collect();
        let mut export_objects: Vec<ObjectRef> = resolved
            .top_level
            .iter()
            .filter(|o| !resolved.sources.contains(o) || swapped.contains(o))
            .cloned()
            .collect();
        if export_objects.is_empty() {
            return Err(BridgeError::EmptySelection);
        }

        if options.prune_materials {
            run.stage(Stage::PruningMaterials, |run| {
                let removed = prune_materials(run.scene, &run.ledger.swaps);
                if removed > 0 {
                    run.report.fragment(format!("Removed {} unused materials", removed));
                }
                Ok(())
            })?;
        }

        // (export name, object the stage works on)
        let mut reduction_targets: Vec<(String, ObjectRef)> = run
            .ledger
            .swaps
            .iter()
            .map(|r| (r.object.as_str().to_string(), r.target().clone()))
            .collect();

        if options.uv.enabled {
            let stats = run.stage(Stage::GeneratingUvs, |run| {
                Ok(self.generate_uvs(run, &resolved.instance_sources))
            })?;
            export_objects.retain(|o| !stats.atlased_sources.contains(o));
            export_objects.extend(stats.atlas_objects.iter().cloned());
            reduction_targets.retain(|(name, _)| !stats.atlased_sources.iter().any(|s| s.as_str() == name.as_str()));
            reduction_targets.extend(stats.atlas_objects.iter().map(|o| (o.as_str().to_string(), o.clone())));
        }

        if options.reduction.enabled {
            run.stage(Stage::Reducing, |run| {
                reduce_targets(run, &mut reduction_targets);
                Ok(())
            })?;
        }

        let materials = run.stage(Stage::ValidatingMaterials, |run| Ok(self.validate_materials(run, &resolved.selection)))?;

        if options.textures.enabled {
            run.stage(Stage::OptimizingTextures, |run| {
                let t = &options.textures;
                let result = self
                    .scaler
                    .process(run.scene, &materials, t.max_size, &t.excluded_materials);
                if result.processed > 0 {
                    run.report
                        .fragment(format!("Scaled {} texture(s) to {}px", result.processed, t.max_size));
                }
                for error in result.errors.iter().take(3) {
                    run.report.warn(error.clone());
                }
                run.ledger.textures = result.substitutions;
                Ok(())
            })?;
        }

        let set = ExportSet::new(export_objects);
        let (payload, image_mode) = run.stage(Stage::Serializing, |run| self.serialize(run, &set))?;

        let metadata = run.stage(Stage::Delivering, |run| {
            let metadata = build_metadata(run, &resolved, payload.len());
            match self.delivery.deliver(payload.clone(), metadata.to_value()?) {
                Ok(()) => debug!(channel = self.delivery.name(), "Delivered payload"),
                Err(e) => run
                    .report
                    .warn(format!("Delivery via {} failed: {}", self.delivery.name(), e)),
            }
            Ok(metadata)
        })?;

        Ok(Delivered {
            payload,
            metadata,
            image_mode,
        })
    }

    fn generate_uvs(&self, run: &mut Run<'_>, instance_sources: &HashSet<ObjectRef>) -> UvStats {
        let (instanced, direct): (Vec<&SwapRecord>, Vec<&SwapRecord>) = run
            .ledger
            .swaps
            .iter()
            .partition(|r| instance_sources.contains(&r.object));
        let direct: Vec<ObjectRef> = direct.iter().map(|r| r.target().clone()).collect();
        let instanced: Vec<ObjectRef> = instanced.iter().map(|r| r.target().clone()).collect();

        let mut stats = self.uv.unwrap(run.scene, &direct, &run.options.uv);
        if !instanced.is_empty() {
            // Joining instanced sources would export them twice.
            let options = UvOptions {
                atlasing: false,
                ..run.options.uv.clone()
            };
            let more = self.uv.unwrap(run.scene, &instanced, &options);
            stats.unwrapped += more.unwrapped;
            stats.skipped += more.skipped;
            stats.failed += more.failed;
        }

        if stats.atlases_created > 0 {
            run.report.fragment(format!(
                "Atlased {} objects into {} mesh(es)",
                stats.atlased_objects, stats.atlases_created
            ));
        }
        if stats.unwrapped > 0 {
            run.report.fragment(format!("UV unwrapped {} objects", stats.unwrapped));
        }
        if stats.failed > 0 {
            run.report
                .warn(format!("{} object(s) could not be UV unwrapped", stats.failed));
        }
        stats
    }

    fn validate_materials(&self, run: &mut Run<'_>, selection: &[ObjectRef]) -> BTreeSet<String> {
        let names = gather_materials(run.scene, selection);
        for name in &names {
            let Some(material) = run.scene.material(name) else {
                continue;
            };
            let readiness = self.validator.analyze(material);
            if !readiness.is_ready {
                run.report.unsupported_materials.push(name.clone());
            }
            run.report.materials.insert(name.clone(), readiness);
        }

        let unsupported = &run.report.unsupported_materials;
        if !unsupported.is_empty() {
            let message = format!(
                "{} unsupported material(s) detected: {}",
                unsupported.len(),
                capped_list(unsupported)
            );
            run.report.warn(message);
        }
        names
    }

    /// Walk the image-mode fallback chain until one attempt succeeds.
    fn serialize(&self, run: &mut Run<'_>, set: &ExportSet) -> Result<(Vec<u8>, ImageMode)> {
        let quantization = run.options.compression.quantization();
        match quantization {
            Some(q) => run.report.fragment(format!("Quantized Level {}", q.level)),
            None => run.report.fragment("Uncompressed"),
        }

        let chain = run.options.image_mode.fallback_chain();
        let mut last = String::new();
        for (attempt, mode) in chain.iter().copied().enumerate() {
            let settings = SerializeSettings {
                image_mode: mode,
                quantization,
            };
            match self.writer.write(run.scene, set, &settings) {
                Ok(payload) => {
                    if attempt > 0 {
                        run.report.warn(fallback_notice(mode));
                    }
                    debug!(mode = %mode, size = payload.len(), "Serialized payload");
                    return Ok((payload, mode));
                }
                Err(e) => {
                    warn!(mode = %mode, error = %e, "Serialization attempt failed");
                    last = e.to_string();
                }
            }
        }

        Err(BridgeError::SerializationFailed {
            attempts: chain.len(),
            last,
        })
    }
}

fn fallback_notice(mode: ImageMode) -> String {
    match mode {
        ImageMode::Auto => "Some textures couldn't convert to WebP - exported with AUTO format".to_string(),
        ImageMode::None => "Export completed with original texture formats (conversion failed)".to_string(),
        ImageMode::Webp => "Exported with WEBP textures".to_string(),
    }
}

/// Drop unused slots on every working target. Returns the slots removed.
fn prune_materials(scene: &mut Scene, swaps: &[SwapRecord]) -> usize {
    let mut removed = 0;
    for record in swaps {
        let target = record.target();
        let Some(object) = scene.objects.get_mut(target.as_str()) else {
            continue;
        };
        let Some(mesh) = object.data.as_deref().and_then(|d| scene.meshes.get_mut(d)) else {
            continue;
        };
        removed += materials::prune_unused(mesh, &mut object.materials);
        shadow::sync_proxy_slots(scene, record);
    }
    removed
}

fn reduce_targets(run: &mut Run<'_>, targets: &mut [(String, ObjectRef)]) {
    let options: &ExportOptions = run.options;
    let engine = ReductionEngine::for_method(options.reduction.method);
    if let Some(note) = &engine.fallback_note {
        run.report.info(note.clone());
    }

    targets.sort_by(|a, b| a.0.cmp(&b.0));
    let candidates: Vec<&(String, ObjectRef)> = targets
        .iter()
        .filter(|(name, _)| !options.reduction.excluded.contains(name))
        .collect();

    let mut reduced = 0;
    let mut faces_before = 0;
    let mut faces_after = 0;
    for (index, (name, target)) in candidates.iter().enumerate() {
        let faces = run
            .scene
            .object_mesh(target.as_str())
            .map(|m| m.face_count())
            .unwrap_or(0);
        if faces <= options.reduction.min_faces {
            continue;
        }
        run.state
            .set_status(format!("Decimating {} ({}/{})...", name, index + 1, candidates.len()));

        let Some(mesh) = run.scene.object_mesh_mut(target.as_str()) else {
            continue;
        };
        let outcome = engine.reduce(mesh, options.reduction_ratio(name));
        if outcome.success {
            reduced += 1;
            faces_before += outcome.faces_before;
            faces_after += outcome.faces_after;
            run.report
                .reductions
                .insert(name.clone(), (outcome.faces_before, outcome.faces_after));
            debug!(
                object = %name,
                before = outcome.faces_before,
                after = outcome.faces_after,
                method = engine.method_name(),
                "Reduced mesh"
            );
        } else {
            run.report.warn(format!("{}: {}", name, outcome.diagnostic_text()));
        }
    }

    if reduced > 0 {
        let percent = (faces_before - faces_after) as f64 / faces_before.max(1) as f64 * 100.0;
        run.report
            .fragment(format!("Decimated {} objects ({:.0}% reduction)", reduced, percent));
    }
}

fn build_metadata(run: &Run<'_>, resolved: &Resolved, size: usize) -> ExportMetadata {
    let report = &run.report;
    let materials = (!report.materials.is_empty()).then(|| MaterialsSummary {
        total: report.materials.len(),
        ready: report.materials.values().filter(|r| r.is_ready).count(),
        unsupported: report.unsupported_materials.clone(),
        analysis: report.materials.clone(),
    });

    ExportMetadata {
        filename: payload_filename(run.scene, run.options.filename.as_deref()),
        scene_name: run.scene.name.clone(),
        timestamp: Utc::now(),
        size,
        size_mb: format!("{:.2}", megabytes(size)),
        export_settings: ExportSettingsSummary {
            compression: run.options.compression.preset.to_string(),
            compression_enabled: run.options.compression.is_enabled(),
        },
        object_count: resolved.selection.len(),
        summary: report.fragments.clone(),
        materials,
    }
}

/// Undo every in-place change of a run, strictly in this order.
fn teardown(scene: &mut Scene, ledger: &RunLedger) {
    teardown_step("restore textures", || textures::restore(scene, &ledger.textures));
    teardown_step("restore subdivision", || subdivision::restore(scene, &ledger.subdivision));
    teardown_step("rebind originals", || shadow::revert(scene, &ledger.swaps));
}

fn teardown_step(step: &str, body: impl FnOnce() -> usize) {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(count) => debug!(step, count, "Teardown step done"),
        Err(panic) => error!(step, message = %panic_message(&panic), "Teardown step panicked"),
    }
}

fn fail(host: &mut Host, e: BridgeError) -> BridgeError {
    error!(error = %e, "Export failed");
    let generation = host.state.set_status(format!("✗ Export failed: {}", e));
    schedule_status_clear(host, generation, STATUS_CLEAR_FAILURE);
    e
}

fn schedule_status_clear(host: &mut Host, generation: u64, delay: Duration) {
    let state = Arc::clone(&host.state);
    host.main_loop.register(delay, "clear-status", move |_scene: &mut Scene| {
        state.clear_status_if(generation);
    });
}
