//! Deferred two-phase reclamation of ephemeral run data.
//!
//! A run only marks what it created (a [`ReclamationPlan`]); the actual
//! deletion is registered on the main loop and happens after the run has
//! returned control. Every step is independent: a failed deletion is logged
//! and the remaining resources are still reclaimed.
//!
//! Meshes a plan could not delete (still in use) are handed back to the
//! shared state and swept by the next run's plan once nothing uses them.
//! Only names a run created are ever candidates; a user's mesh is never
//! swept because of its name.

use crate::error::BridgeError;
use crate::host::{MainLoop, SharedState, RECLAIM_DELAY, SELECTION_RESTORE_DELAY};
use crate::scene::Scene;
use crate::shadow::SwapRecord;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ephemeral resources created by one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclamationPlan {
    /// Proxy and synthetic (atlas) objects.
    pub proxies: Vec<String>,
    /// Working mesh data blocks.
    pub working_meshes: Vec<String>,
    /// Replacement images created by texture downscaling.
    pub images: Vec<String>,
    /// Run-created meshes left behind by earlier executions.
    pub orphan_candidates: BTreeSet<String>,
}

/// What one execution of a plan achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclamationOutcome {
    pub proxies_removed: usize,
    pub meshes_removed: usize,
    pub images_removed: usize,
    pub orphans_removed: usize,
    pub failures: Vec<String>,
    /// Run-created meshes still present afterwards.
    pub leftovers: BTreeSet<String>,
}

impl ReclamationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the proxies and working meshes of a set of swaps.
    pub fn add_swaps(&mut self, records: &[SwapRecord]) {
        for record in records {
            if let Some(proxy) = &record.proxy {
                self.proxies.push(proxy.as_str().to_string());
            }
            self.working_meshes.push(record.working_mesh.clone());
        }
    }

    pub fn add_object(&mut self, name: impl Into<String>) {
        self.proxies.push(name.into());
    }

    pub fn add_mesh(&mut self, name: impl Into<String>) {
        self.working_meshes.push(name.into());
    }

    pub fn add_image(&mut self, name: impl Into<String>) {
        self.images.push(name.into());
    }

    /// Retry meshes an earlier execution could not delete.
    pub fn add_orphan_candidates(&mut self, names: impl IntoIterator<Item = String>) {
        self.orphan_candidates.extend(names);
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
            && self.working_meshes.is_empty()
            && self.images.is_empty()
            && self.orphan_candidates.is_empty()
    }

    /// Delete everything in the plan that still exists, then sweep orphans.
    ///
    /// Safe to run more than once.
    pub fn execute(&self, scene: &mut Scene) -> ReclamationOutcome {
        let mut outcome = ReclamationOutcome::default();

        for name in &self.proxies {
            match scene.remove_object(name) {
                Ok(_) => {
                    debug!(object = %name, "Removed proxy");
                    outcome.proxies_removed += 1;
                }
                Err(BridgeError::NotFound(_)) => {}
                Err(e) => outcome.failures.push(format!("proxy {}: {}", name, e)),
            }
        }

        for name in &self.working_meshes {
            match scene.remove_mesh(name) {
                Ok(_) => {
                    debug!(mesh = %name, "Removed working mesh");
                    outcome.meshes_removed += 1;
                }
                Err(BridgeError::NotFound(_)) => {}
                Err(e) => outcome.failures.push(format!("mesh {}: {}", name, e)),
            }
        }

        for name in &self.images {
            if !scene.images.contains_key(name) {
                continue;
            }
            let referenced_by = scene
                .materials
                .values()
                .find(|m| m.images().any(|i| i == name))
                .map(|m| m.name.clone());
            if let Some(material) = referenced_by {
                outcome
                    .failures
                    .push(format!("image {}: still used by material {}", name, material));
                continue;
            }
            match scene.remove_image(name) {
                Ok(_) => {
                    debug!(image = %name, "Removed replacement image");
                    outcome.images_removed += 1;
                }
                Err(e) => outcome.failures.push(format!("image {}: {}", name, e)),
            }
        }

        outcome.orphans_removed = sweep_orphans(scene, &self.orphan_candidates);
        outcome.leftovers = self
            .working_meshes
            .iter()
            .chain(self.orphan_candidates.iter())
            .filter(|name| scene.meshes.contains_key(*name))
            .cloned()
            .collect();

        for failure in &outcome.failures {
            warn!(failure = %failure, "Reclamation step failed");
        }
        info!(
            proxies = outcome.proxies_removed,
            meshes = outcome.meshes_removed,
            images = outcome.images_removed,
            orphans = outcome.orphans_removed,
            "Reclaimed run data"
        );
        outcome
    }

    /// Register the plan to run once on the main loop after [`RECLAIM_DELAY`].
    ///
    /// Leftovers are recorded in `state` for the next plan.
    pub fn schedule(self, main_loop: &mut MainLoop, state: Arc<SharedState>) {
        main_loop.register(RECLAIM_DELAY, "reclaim", move |scene: &mut Scene| {
            let outcome = self.execute(scene);
            if !outcome.leftovers.is_empty() {
                debug!(count = outcome.leftovers.len(), "Keeping unreclaimed meshes for the next run");
                state.note_unreclaimed(outcome.leftovers);
            }
        });
    }
}

/// Remove the unused meshes among `candidates`.
///
/// Candidates still in use or already gone are left alone.
pub fn sweep_orphans(scene: &mut Scene, candidates: &BTreeSet<String>) -> usize {
    let orphans: Vec<String> = candidates
        .iter()
        .filter(|name| scene.meshes.contains_key(*name))
        .filter(|name| scene.mesh_users(name) == 0)
        .cloned()
        .collect();

    let mut removed = 0;
    for name in orphans {
        match scene.remove_mesh(&name) {
            Ok(_) => {
                debug!(mesh = %name, "Swept orphaned working mesh");
                removed += 1;
            }
            Err(e) => warn!(mesh = %name, error = %e, "Failed to sweep orphaned mesh"),
        }
    }
    removed
}

/// Reinstate a captured selection after [`SELECTION_RESTORE_DELAY`].
///
/// Runs after reclamation, so it never selects a proxy or touches swapped data.
pub fn schedule_selection_restore(main_loop: &mut MainLoop, selection: BTreeSet<String>, active: Option<String>) {
    main_loop.register(SELECTION_RESTORE_DELAY, "restore-selection", move |scene: &mut Scene| {
        scene.selection = selection
            .into_iter()
            .filter(|name| scene.objects.contains_key(name))
            .collect();
        scene.active = active.filter(|name| scene.objects.contains_key(name));
        debug!(selected = scene.selection.len(), "Restored selection");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{ImageData, Material, MeshData, Object};

    fn scene_with_leftovers() -> Scene {
        let mut scene = Scene::new("Test");
        let working = scene.add_mesh(MeshData::cube("SHADOW_Rock", 1.0));
        scene.add_object(Object::mesh("PROXY_Rock", working.as_str()));
        scene.add_mesh(MeshData::cube("SHADOW_Stale", 1.0));
        scene.add_mesh(MeshData::cube("RockMesh", 1.0));
        scene.add_image(ImageData::solid("wood_Scaled", 2, 2, [0, 0, 0, 255]));
        scene
    }

    #[test]
    fn test_execute_removes_everything_in_order() {
        let mut scene = scene_with_leftovers();
        let mut plan = ReclamationPlan::new();
        plan.add_object("PROXY_Rock");
        plan.add_mesh("SHADOW_Rock");
        plan.add_image("wood_Scaled");
        plan.add_orphan_candidates(["SHADOW_Stale".to_string()]);

        let outcome = plan.execute(&mut scene);
        assert_eq!(outcome.proxies_removed, 1);
        assert_eq!(outcome.meshes_removed, 1);
        assert_eq!(outcome.images_removed, 1);
        assert_eq!(outcome.orphans_removed, 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(scene.meshes.keys().collect::<Vec<_>>(), vec!["RockMesh"]);

        let again = plan.execute(&mut scene);
        assert_eq!(again, ReclamationOutcome::default());
    }

    #[test]
    fn test_failure_does_not_block_other_steps() {
        let mut scene = scene_with_leftovers();
        scene.add_object(Object::mesh("Keeper", "SHADOW_Rock"));
        scene.add_material(Material::principled("Wood", Some("wood_Scaled")));

        let mut plan = ReclamationPlan::new();
        plan.add_object("PROXY_Rock");
        plan.add_mesh("SHADOW_Rock");
        plan.add_image("wood_Scaled");
        plan.add_orphan_candidates(["SHADOW_Stale".to_string()]);

        let outcome = plan.execute(&mut scene);
        assert_eq!(outcome.proxies_removed, 1);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.orphans_removed, 1);
        assert!(scene.meshes.contains_key("SHADOW_Rock"));
        assert!(!scene.meshes.contains_key("SHADOW_Stale"));
        assert_eq!(outcome.leftovers, BTreeSet::from(["SHADOW_Rock".to_string()]));
    }

    #[test]
    fn test_sweep_ignores_meshes_not_created_by_a_run() {
        let mut scene = scene_with_leftovers();
        scene.add_mesh(MeshData::cube("SHADOW_UserNamedThis", 1.0));

        let outcome = ReclamationPlan::new().execute(&mut scene);
        assert_eq!(outcome.orphans_removed, 0);
        assert!(scene.meshes.contains_key("SHADOW_UserNamedThis"));
        assert!(scene.meshes.contains_key("SHADOW_Stale"));
    }

    #[test]
    fn test_leftovers_are_swept_by_the_next_plan() {
        let mut scene = scene_with_leftovers();
        scene.add_object(Object::mesh("Keeper", "SHADOW_Rock"));
        let state = SharedState::new();
        let mut main_loop = MainLoop::new();

        let mut first = ReclamationPlan::new();
        first.add_object("PROXY_Rock");
        first.add_mesh("SHADOW_Rock");
        first.schedule(&mut main_loop, Arc::clone(&state));
        main_loop.run_until_idle(&mut scene);
        assert!(scene.meshes.contains_key("SHADOW_Rock"));

        scene.remove_object("Keeper").unwrap();
        let mut second = ReclamationPlan::new();
        second.add_orphan_candidates(state.take_unreclaimed());
        assert!(second.orphan_candidates.contains("SHADOW_Rock"));
        second.schedule(&mut main_loop, Arc::clone(&state));
        main_loop.run_until_idle(&mut scene);
        assert!(!scene.meshes.contains_key("SHADOW_Rock"));
        assert!(state.take_unreclaimed().is_empty());
    }

    #[test]
    fn test_schedule_runs_after_delay() {
        let mut scene = scene_with_leftovers();
        let mut main_loop = MainLoop::new();
        let mut plan = ReclamationPlan::new();
        plan.add_object("PROXY_Rock");
        plan.schedule(&mut main_loop, SharedState::new());

        main_loop.advance(&mut scene, RECLAIM_DELAY / 2);
        assert!(scene.object("PROXY_Rock").is_some());
        main_loop.advance(&mut scene, RECLAIM_DELAY);
        assert!(scene.object("PROXY_Rock").is_none());
    }

    #[test]
    fn test_selection_restore_skips_removed_objects() {
        let mut scene = Scene::new("Test");
        scene.add_object(Object::mesh("A", "MeshA"));
        let mut main_loop = MainLoop::new();
        let selection: BTreeSet<String> = ["A".to_string(), "Gone".to_string()].into_iter().collect();
        schedule_selection_restore(&mut main_loop, selection, Some("Gone".to_string()));
        main_loop.run_until_idle(&mut scene);
        assert_eq!(scene.selection.len(), 1);
        assert!(scene.active.is_none());
    }
}
