//! Greedy edge-collapse over a triangle mesh.
//!
//! Candidate edges sit in a min-heap keyed by the cost a [`CollapsePolicy`]
//! assigns. Each vertex carries a version stamp; heap entries whose stamps no
//! longer match are stale and skipped. A collapse is only applied when it
//! keeps the surface two-manifold (link condition), does not pinch two
//! boundaries together and does not flip any surrounding triangle.

use crate::scene::{Face, MeshData};
use glam::Vec3;
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

/// Minimum cosine between a triangle normal before and after a collapse.
const FLIP_THRESHOLD: f32 = 0.2;

/// Triangle mesh with incidence lists, mutated in place by collapses.
pub(crate) struct CollapseMesh {
    pub positions: Vec<Vec3>,
    pub faces: Vec<Face>,
    pub face_alive: Vec<bool>,
    pub vertex_alive: Vec<bool>,
    pub vertex_faces: Vec<Vec<usize>>,
    pub live_faces: usize,
}

impl CollapseMesh {
    /// Build from an all-triangle mesh.
    pub fn new(mesh: &MeshData) -> Self {
        let mut vertex_faces = vec![Vec::new(); mesh.positions.len()];
        for (fi, face) in mesh.faces.iter().enumerate() {
            for &v in &face.vertices {
                vertex_faces[v as usize].push(fi);
            }
        }
        Self {
            positions: mesh.positions.iter().map(|&p| Vec3::from(p)).collect(),
            faces: mesh.faces.clone(),
            face_alive: vec![true; mesh.faces.len()],
            vertex_alive: vec![true; mesh.positions.len()],
            vertex_faces,
            live_faces: mesh.faces.len(),
        }
    }

    pub fn faces_of(&self, v: u32) -> impl Iterator<Item = usize> + '_ {
        self.vertex_faces[v as usize]
            .iter()
            .copied()
            .filter(|&f| self.face_alive[f])
    }

    pub fn neighbors(&self, v: u32) -> BTreeSet<u32> {
        let mut out = BTreeSet::new();
        for f in self.faces_of(v) {
            for &u in &self.faces[f].vertices {
                if u != v {
                    out.insert(u);
                }
            }
        }
        out
    }

    /// Live faces containing both `a` and `b`.
    pub fn edge_faces(&self, a: u32, b: u32) -> Vec<usize> {
        self.faces_of(a)
            .filter(|&f| self.faces[f].vertices.contains(&b))
            .collect()
    }

    pub fn is_boundary_vertex(&self, v: u32) -> bool {
        self.neighbors(v)
            .into_iter()
            .any(|n| self.edge_faces(v, n).len() == 1)
    }

    pub fn face_normal(&self, f: usize) -> Vec3 {
        let v = &self.faces[f].vertices;
        let a = self.positions[v[0] as usize];
        let b = self.positions[v[1] as usize];
        let c = self.positions[v[2] as usize];
        (b - a).cross(c - a)
    }

    /// Every live edge once, as (lower, higher).
    pub fn edges(&self) -> BTreeSet<(u32, u32)> {
        let mut edges = BTreeSet::new();
        for (fi, face) in self.faces.iter().enumerate() {
            if !self.face_alive[fi] {
                continue;
            }
            for i in 0..3 {
                let (a, b) = (face.vertices[i], face.vertices[(i + 1) % 3]);
                edges.insert((a.min(b), a.max(b)));
            }
        }
        edges
    }

    /// Write the surviving faces back, compacting vertices.
    pub fn write_back(self, mesh: &mut MeshData) {
        mesh.positions = self.positions.iter().map(|p| p.to_array()).collect();
        mesh.faces = self
            .faces
            .into_iter()
            .zip(self.face_alive)
            .filter_map(|(face, alive)| alive.then_some(face))
            .collect();
        mesh.remove_loose_vertices();
    }
}

/// Cost model for collapsing an edge.
pub(crate) trait CollapsePolicy {
    /// Called once before the first collapse.
    fn prepare(&mut self, mesh: &CollapseMesh);

    /// Cost of collapsing `a`-`b` and where the merged vertex would go.
    fn evaluate(&self, mesh: &CollapseMesh, a: u32, b: u32) -> (f32, Vec3);

    /// `removed` has been merged into `keep`.
    fn merge(&mut self, keep: u32, removed: u32);
}

#[derive(Debug)]
struct Candidate {
    cost: f32,
    a: u32,
    b: u32,
    stamp_a: u32,
    stamp_b: u32,
    target: Vec3,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Reversed so the BinaryHeap pops the cheapest edge first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| (other.a, other.b).cmp(&(self.a, self.b)))
    }
}

/// Collapse edges until at most `target_faces` remain or no legal collapse is left.
///
/// Never removes the last face. Returns the surviving face count.
pub(crate) fn collapse_to<P: CollapsePolicy>(mesh: &mut MeshData, target_faces: usize, policy: &mut P) -> usize {
    let target_faces = target_faces.max(1);
    if mesh.faces.len() <= target_faces {
        return mesh.faces.len();
    }

    let mut work = CollapseMesh::new(mesh);
    policy.prepare(&work);

    let mut stamps = vec![0u32; work.positions.len()];
    let mut heap = BinaryHeap::new();
    for (a, b) in work.edges() {
        push_candidate(&mut heap, &work, policy, &stamps, a, b);
    }

    // Rejected edges are only requeued when a neighbour changes; once the
    // heap runs dry, requeue every edge as long as the last pass made progress.
    let mut progressed = false;
    while work.live_faces > target_faces {
        let Some(candidate) = heap.pop() else {
            if !progressed {
                break;
            }
            progressed = false;
            for (a, b) in work.edges() {
                push_candidate(&mut heap, &work, policy, &stamps, a, b);
            }
            continue;
        };
        let (a, b) = (candidate.a, candidate.b);
        if !work.vertex_alive[a as usize]
            || !work.vertex_alive[b as usize]
            || stamps[a as usize] != candidate.stamp_a
            || stamps[b as usize] != candidate.stamp_b
        {
            continue;
        }

        let shared = work.edge_faces(a, b);
        if shared.is_empty() || shared.len() > 2 {
            continue;
        }
        // A closed surface can not go below a tetrahedron.
        if work.live_faces <= shared.len() || (shared.len() == 2 && work.live_faces < 6) {
            continue;
        }
        if !link_condition(&work, a, b, shared.len()) {
            continue;
        }
        if shared.len() == 2 && work.is_boundary_vertex(a) && work.is_boundary_vertex(b) {
            continue;
        }
        if flips(&work, a, b, candidate.target) {
            continue;
        }

        apply_collapse(&mut work, a, b, candidate.target);
        policy.merge(a, b);
        progressed = true;
        stamps[a as usize] += 1;
        stamps[b as usize] += 1;

        for n in work.neighbors(a) {
            push_candidate(&mut heap, &work, policy, &stamps, a.min(n), a.max(n));
        }
    }

    let remaining = work.live_faces;
    work.write_back(mesh);
    remaining
}

fn push_candidate<P: CollapsePolicy>(
    heap: &mut BinaryHeap<Candidate>,
    work: &CollapseMesh,
    policy: &P,
    stamps: &[u32],
    a: u32,
    b: u32,
) {
    let (cost, target) = policy.evaluate(work, a, b);
    if !cost.is_finite() || !target.is_finite() {
        return;
    }
    heap.push(Candidate {
        cost,
        a,
        b,
        stamp_a: stamps[a as usize],
        stamp_b: stamps[b as usize],
        target,
    });
}

/// The endpoints may only share the vertices opposite the collapsed edge.
fn link_condition(work: &CollapseMesh, a: u32, b: u32, shared_faces: usize) -> bool {
    let na = work.neighbors(a);
    let nb = work.neighbors(b);
    na.intersection(&nb).count() == shared_faces
}

/// Would moving `a` and `b` to `target` turn any surviving triangle over?
fn flips(work: &CollapseMesh, a: u32, b: u32, target: Vec3) -> bool {
    for v in [a, b] {
        for f in work.faces_of(v) {
            let verts = &work.faces[f].vertices;
            if verts.contains(&a) && verts.contains(&b) {
                continue;
            }
            let before = work.face_normal(f);
            let moved: Vec<Vec3> = verts
                .iter()
                .map(|&u| if u == a || u == b { target } else { work.positions[u as usize] })
                .collect();
            let after = (moved[1] - moved[0]).cross(moved[2] - moved[0]);
            let (lb, la) = (before.length(), after.length());
            if la <= f32::EPSILON * lb.max(1.0) {
                return true;
            }
            if lb > 0.0 && before.dot(after) < FLIP_THRESHOLD * lb * la {
                return true;
            }
        }
    }
    false
}

fn apply_collapse(work: &mut CollapseMesh, keep: u32, removed: u32, target: Vec3) {
    work.positions[keep as usize] = target;

    let faces: Vec<usize> = work.faces_of(removed).collect();
    for f in faces {
        if work.faces[f].vertices.contains(&keep) {
            work.face_alive[f] = false;
            work.live_faces -= 1;
        } else {
            for v in &mut work.faces[f].vertices {
                if *v == removed {
                    *v = keep;
                }
            }
            work.vertex_faces[keep as usize].push(f);
        }
    }

    work.vertex_alive[removed as usize] = false;
    work.vertex_faces[removed as usize].clear();
    work.vertex_faces[keep as usize].retain(|&f| work.face_alive[f]);
}

/// Collapses the shortest edge first, merging at the midpoint.
///
/// A boundary vertex stays put when merged with an interior one.
#[derive(Debug, Default)]
pub(crate) struct ShortestEdgePolicy {
    boundary: Vec<bool>,
}

impl CollapsePolicy for ShortestEdgePolicy {
    fn prepare(&mut self, mesh: &CollapseMesh) {
        self.boundary = (0..mesh.positions.len() as u32)
            .map(|v| mesh.is_boundary_vertex(v))
            .collect();
    }

    fn evaluate(&self, mesh: &CollapseMesh, a: u32, b: u32) -> (f32, Vec3) {
        let pa = mesh.positions[a as usize];
        let pb = mesh.positions[b as usize];
        let target = match (self.boundary[a as usize], self.boundary[b as usize]) {
            (true, false) => pa,
            (false, true) => pb,
            _ => (pa + pb) * 0.5,
        };
        (pa.distance_squared(pb), target)
    }

    fn merge(&mut self, keep: u32, removed: u32) {
        self.boundary[keep as usize] |= self.boundary[removed as usize];
    }
}
