//! Unused material slot pruning.

use crate::scene::MeshData;

/// Drop slots no face references and remap face material indices.
///
/// Faces pointing past the slot list are clamped to the last kept slot.
/// Returns the number of slots removed.
pub fn prune_unused(mesh: &mut MeshData, slots: &mut Vec<Option<String>>) -> usize {
    if slots.is_empty() {
        return 0;
    }

    let mut used = vec![false; slots.len()];
    for face in &mesh.faces {
        let index = (face.material_index as usize).min(slots.len() - 1);
        used[index] = true;
    }

    let mut remap = vec![0u32; slots.len()];
    let mut kept = Vec::with_capacity(slots.len());
    for (i, slot) in slots.iter().enumerate() {
        if used[i] {
            remap[i] = kept.len() as u32;
            kept.push(slot.clone());
        }
    }

    let removed = slots.len() - kept.len();
    if removed == 0 {
        return 0;
    }

    for face in &mut mesh.faces {
        let index = (face.material_index as usize).min(slots.len() - 1);
        face.material_index = remap[index];
    }
    *slots = kept;
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Face;

    fn slots(names: &[&str]) -> Vec<Option<String>> {
        names.iter().map(|n| Some(n.to_string())).collect()
    }

    #[test]
    fn test_prune_remaps_indices() {
        let mut mesh = MeshData::cube("Cube", 1.0);
        for (i, face) in mesh.faces.iter_mut().enumerate() {
            face.material_index = if i < 3 { 1 } else { 3 };
        }
        let mut slots = slots(&["A", "B", "C", "D"]);

        assert_eq!(prune_unused(&mut mesh, &mut slots), 2);
        assert_eq!(slots, vec![Some("B".to_string()), Some("D".to_string())]);
        assert_eq!(mesh.faces[0].material_index, 0);
        assert_eq!(mesh.faces[5].material_index, 1);
    }

    #[test]
    fn test_nothing_to_prune() {
        let mut mesh = MeshData::with_geometry(
            "Tri",
            vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![Face::new(vec![0, 1, 2])],
        );
        let mut slots = slots(&["Only"]);
        assert_eq!(prune_unused(&mut mesh, &mut slots), 0);
        let mut empty = Vec::new();
        assert_eq!(prune_unused(&mut mesh, &mut empty), 0);
    }
}
