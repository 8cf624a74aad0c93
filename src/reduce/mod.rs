//! Mesh reduction: repair pre-pass followed by edge-collapse simplification.
//!
//! Two interchangeable simplifiers implement [`Simplifier`]: meshopt's
//! quadric simplifier (behind the `quadric` feature) and a shortest-edge
//! collapse that is always available. [`ReductionEngine::for_method`] picks one
//! once per run.

mod collapse;
#[cfg(feature = "quadric")]
mod quadric;
pub mod repair;

use crate::scene::MeshData;
use collapse::{collapse_to, ShortestEdgePolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

#[cfg(feature = "quadric")]
pub use quadric::QuadricSimplifier;
pub use repair::{repair, RepairReport};

/// Which simplifier to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReductionMethod {
    /// Quadric when available, otherwise shortest-edge collapse.
    #[default]
    Auto,
    Quadric,
    Collapse,
}

impl fmt::Display for ReductionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReductionMethod::Auto => write!(f, "auto"),
            ReductionMethod::Quadric => write!(f, "quadric"),
            ReductionMethod::Collapse => write!(f, "collapse"),
        }
    }
}

/// A simplification strategy working on an all-triangle mesh.
pub trait Simplifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reduce `mesh` toward `target_faces`, returning the resulting face count.
    fn simplify(&self, mesh: &mut MeshData, target_faces: usize) -> Result<usize, String>;
}

/// Shortest-edge collapse; slower to converge on good shapes but always available.
#[derive(Debug, Default)]
pub struct CollapseSimplifier;

impl Simplifier for CollapseSimplifier {
    fn name(&self) -> &'static str {
        "collapse"
    }

    fn simplify(&self, mesh: &mut MeshData, target_faces: usize) -> Result<usize, String> {
        let mut policy = ShortestEdgePolicy::default();
        Ok(collapse_to(mesh, target_faces, &mut policy))
    }
}

/// Whether the quadric simplifier was compiled in.
pub fn quadric_available() -> bool {
    cfg!(feature = "quadric")
}

/// Result of reducing one mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionOutcome {
    pub success: bool,
    pub faces_before: usize,
    pub faces_after: usize,
    /// Repair actions and failure reasons, one line each.
    pub diagnostic: Vec<String>,
}

impl ReductionOutcome {
    pub fn diagnostic_text(&self) -> String {
        self.diagnostic.join("; ")
    }
}

/// Repair-then-simplify engine bound to one simplifier for the whole run.
pub struct ReductionEngine {
    simplifier: Box<dyn Simplifier>,
    /// Set when the requested method was not available.
    pub fallback_note: Option<String>,
}

impl ReductionEngine {
    /// Choose the simplifier for `method` based on what is available.
    pub fn for_method(method: ReductionMethod) -> Self {
        let (simplifier, fallback_note): (Box<dyn Simplifier>, Option<String>) = match method {
            ReductionMethod::Collapse => (Box::new(CollapseSimplifier), None),
            #[cfg(feature = "quadric")]
            ReductionMethod::Auto | ReductionMethod::Quadric => (Box::new(QuadricSimplifier), None),
            #[cfg(not(feature = "quadric"))]
            ReductionMethod::Auto => (Box::new(CollapseSimplifier), None),
            #[cfg(not(feature = "quadric"))]
            ReductionMethod::Quadric => (
                Box::new(CollapseSimplifier),
                Some("quadric simplifier unavailable, using edge collapse".to_string()),
            ),
        };
        debug!(requested = %method, selected = simplifier.name(), "Selected reduction method");
        Self {
            simplifier,
            fallback_note,
        }
    }

    pub fn with_simplifier(simplifier: Box<dyn Simplifier>) -> Self {
        Self {
            simplifier,
            fallback_note: None,
        }
    }

    pub fn method_name(&self) -> &'static str {
        self.simplifier.name()
    }

    /// Repair and reduce `mesh` to about `ratio` of its faces.
    ///
    /// The ratio is clamped to (0, 1]. On failure the mesh is left exactly
    /// as it was passed in.
    pub fn reduce(&self, mesh: &mut MeshData, ratio: f32) -> ReductionOutcome {
        let faces_before = mesh.face_count();
        let ratio = if ratio.is_finite() { ratio.clamp(f32::MIN_POSITIVE, 1.0) } else { 1.0 };
        let target = ((faces_before as f64 * ratio as f64).round() as usize).max(1);

        let backup = mesh.clone();
        let fail = |mesh: &mut MeshData, mut diagnostic: Vec<String>, reason: String| {
            *mesh = backup.clone();
            diagnostic.push(reason);
            ReductionOutcome {
                success: false,
                faces_before,
                faces_after: faces_before,
                diagnostic,
            }
        };

        let repair_report = repair(mesh);
        let diagnostic = repair_report.actions;

        if mesh.faces.is_empty() {
            return fail(mesh, diagnostic, "repair removed every face".to_string());
        }

        match self.simplifier.simplify(mesh, target) {
            Ok(faces_after) if faces_after > 0 => {
                if faces_after > target {
                    debug!(target, faces_after, "Simplifier stopped above target");
                }
                ReductionOutcome {
                    success: true,
                    faces_before,
                    faces_after,
                    diagnostic,
                }
            }
            Ok(_) => fail(mesh, diagnostic, "simplification produced an empty mesh".to_string()),
            Err(e) => {
                warn!(mesh = %mesh.name, error = %e, "Simplification failed");
                fail(mesh, diagnostic, format!("simplification failed: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Face;

    #[test]
    fn test_auto_method_selection() {
        let engine = ReductionEngine::for_method(ReductionMethod::Auto);
        if quadric_available() {
            assert_eq!(engine.method_name(), "quadric");
        } else {
            assert_eq!(engine.method_name(), "collapse");
        }
        assert!(engine.fallback_note.is_none());
        assert_eq!(ReductionEngine::for_method(ReductionMethod::Collapse).method_name(), "collapse");
    }

    #[test]
    fn test_reduce_sphere_to_ratio() {
        let engine = ReductionEngine::for_method(ReductionMethod::Auto);
        let mut mesh = MeshData::uv_sphere("Sphere", 25, 21, 1.0);
        let outcome = engine.reduce(&mut mesh, 0.1);
        assert!(outcome.success, "{:?}", outcome.diagnostic);
        assert_eq!(outcome.faces_before, 1000);
        assert!(outcome.faces_after <= 100);
        assert!(outcome.faces_after >= 80);
        assert_eq!(mesh.face_count(), outcome.faces_after);
    }

    #[test]
    fn test_ratio_is_clamped() {
        let engine = ReductionEngine::for_method(ReductionMethod::Collapse);
        let mut mesh = MeshData::uv_sphere("Sphere", 8, 6, 1.0);
        let outcome = engine.reduce(&mut mesh, 3.0);
        assert!(outcome.success);
        assert_eq!(outcome.faces_after, outcome.faces_before);

        let outcome = engine.reduce(&mut mesh, -1.0);
        assert!(outcome.success);
        assert!(outcome.faces_after > 0);
    }

    #[test]
    fn test_failure_keeps_original_mesh() {
        let engine = ReductionEngine::for_method(ReductionMethod::Auto);
        let mut mesh = MeshData::with_geometry(
            "Plane",
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
            vec![Face::new(vec![0, 1, 2, 3])],
        );
        let before = mesh.clone();
        let outcome = engine.reduce(&mut mesh, 0.5);
        assert!(!outcome.success);
        assert_eq!(mesh, before);
        assert!(outcome.diagnostic_text().contains("repair removed every face"));
    }

    #[test]
    fn test_reduction_bound_across_ratios() {
        let ratios = [0.01, 0.1, 0.25, 0.5, 0.9, 1.0];
        let mut simplifiers: Vec<fn() -> Box<dyn Simplifier>> = vec![|| -> Box<dyn Simplifier> { Box::new(CollapseSimplifier) }];
        #[cfg(feature = "quadric")]
        simplifiers.push(|| -> Box<dyn Simplifier> { Box::new(QuadricSimplifier) });

        for make in &simplifiers {
            let engine = ReductionEngine::with_simplifier(make());
            for ratio in ratios {
                let mut mesh = MeshData::uv_sphere("Sphere", 25, 21, 1.0);
                let outcome = engine.reduce(&mut mesh, ratio);
                let bound = (1000.0 * ratio as f64).ceil() as usize;
                let case = format!("{} at {}", engine.method_name(), ratio);
                assert!(outcome.success, "{}: {:?}", case, outcome.diagnostic);
                assert_eq!(outcome.faces_before, 1000, "{}", case);
                assert!(outcome.faces_after <= bound, "{}: {} faces", case, outcome.faces_after);
                assert!(outcome.faces_after > 0, "{}", case);
                assert_eq!(mesh.face_count(), outcome.faces_after, "{}", case);
            }
        }
    }

    #[cfg(not(feature = "quadric"))]
    #[test]
    fn test_quadric_request_falls_back() {
        let engine = ReductionEngine::for_method(ReductionMethod::Quadric);
        assert_eq!(engine.method_name(), "collapse");
        assert!(engine.fallback_note.is_some());
    }

    struct Failing;

    impl Simplifier for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn simplify(&self, mesh: &mut MeshData, _target_faces: usize) -> Result<usize, String> {
            mesh.faces.truncate(1);
            Err("out of budget".to_string())
        }
    }

    #[test]
    fn test_simplifier_error_is_reported() {
        let engine = ReductionEngine::with_simplifier(Box::new(Failing));
        let mut mesh = MeshData::uv_sphere("Sphere", 8, 6, 1.0);
        let before = mesh.clone();
        let outcome = engine.reduce(&mut mesh, 0.5);
        assert!(!outcome.success);
        assert_eq!(mesh, before);
        assert!(outcome.diagnostic_text().contains("out of budget"));
    }
}
