//! Local h-refinement and coarsening of a [`Mesh`].
//!
//! Refinement bisects line segments and splits quadrilaterals into four children. New vertices
//! are identified by a label (the edge or element they subdivide), so that neighbors refined
//! in the same pass share their midpoints. Refinement only produces conforming meshes: a
//! quadrilateral may only be refined if every neighbor is refined in the same pass.
use crate::error::{Result, SystemError};
use crate::mesh::{BoundarySide, Element, ElementType, Mesh, MeshTopology};
use log::{debug, warn};
use nalgebra::Point3;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefinementFlag {
    DoNothing,
    Refine,
    Coarsen,
}

impl Default for RefinementFlag {
    fn default() -> Self {
        Self::DoNothing
    }
}

/// Everything that changed in one refinement pass.
///
/// Used to project solution vectors from the old to the new degree of freedom layout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefinementRecord {
    /// Vertices that became part of the active mesh, with the vertices they interpolate.
    pub new_nodes: Vec<(usize, Vec<usize>)>,
    /// Elements that were refined, with their (now active) children.
    pub refined: Vec<(usize, Vec<usize>)>,
    /// Elements that were reactivated, with their (now inactive) children.
    pub coarsened: Vec<(usize, Vec<usize>)>,
}

impl RefinementRecord {
    pub fn is_empty(&self) -> bool {
        self.refined.is_empty() && self.coarsened.is_empty()
    }

    /// The element an active element was refined from in this pass, if any.
    pub fn refined_parent_of(&self, element: usize) -> Option<usize> {
        self.refined
            .iter()
            .find(|(_, children)| children.contains(&element))
            .map(|(parent, _)| *parent)
    }

    pub fn coarsened_children_of(&self, element: usize) -> Option<&[usize]> {
        self.coarsened
            .iter()
            .find(|(parent, _)| *parent == element)
            .map(|(_, children)| children.as_slice())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum VertexLabel {
    Vertex(usize),
    Edge(usize, usize),
    Face(usize),
}

impl VertexLabel {
    fn edge(a: usize, b: usize) -> Self {
        Self::Edge(a.min(b), a.max(b))
    }

    fn interpolated_vertices(&self, parent: &Element) -> Vec<usize> {
        match *self {
            Self::Vertex(v) => vec![v],
            Self::Edge(a, b) => vec![a, b],
            Self::Face(_) => parent.nodes.clone(),
        }
    }
}

/// Vertex labels of the children of an element, in child order.
fn child_labels(element_idx: usize, element: &Element) -> Vec<Vec<VertexLabel>> {
    use VertexLabel::{Face, Vertex};
    let n = &element.nodes;
    match element.kind {
        ElementType::Edge2 => {
            let m = VertexLabel::edge(n[0], n[1]);
            vec![vec![Vertex(n[0]), m], vec![m, Vertex(n[1])]]
        }
        ElementType::Quad4 => {
            let m01 = VertexLabel::edge(n[0], n[1]);
            let m12 = VertexLabel::edge(n[1], n[2]);
            let m23 = VertexLabel::edge(n[2], n[3]);
            let m30 = VertexLabel::edge(n[3], n[0]);
            let c = Face(element_idx);
            vec![
                vec![Vertex(n[0]), m01, c, m30],
                vec![m01, Vertex(n[1]), m12, c],
                vec![c, m12, Vertex(n[2]), m23],
                vec![m30, c, m23, Vertex(n[3])],
            ]
        }
    }
}

/// `(child, child side)` pairs covering the given side of the parent.
fn child_sides(kind: ElementType, side: usize) -> &'static [(usize, usize)] {
    const EDGE: [[(usize, usize); 1]; 2] = [[(0, 0)], [(1, 1)]];
    const QUAD: [[(usize, usize); 2]; 4] = [
        [(0, 0), (1, 0)],
        [(1, 1), (2, 1)],
        [(2, 2), (3, 2)],
        [(3, 3), (0, 3)],
    ];
    match kind {
        ElementType::Edge2 => &EDGE[side],
        ElementType::Quad4 => &QUAD[side],
    }
}

/// Refines every active element once.
pub fn refine_uniformly(mesh: &mut Mesh) -> Result<RefinementRecord> {
    let flags = vec![RefinementFlag::Refine; mesh.num_elements()];
    refine_and_coarsen(mesh, &flags, 0)
}

/// Applies refinement and coarsening flags to the active elements of the mesh.
///
/// `flags` is indexed by element id; flags on inactive elements are ignored. Elements at or
/// beyond `max_h_level` are not refined (zero means unlimited). A group of siblings is
/// coarsened only if every sibling is active and flagged for coarsening. Quadrilateral
/// coarsening is not supported and is skipped.
pub fn refine_and_coarsen(
    mesh: &mut Mesh,
    flags: &[RefinementFlag],
    max_h_level: u32,
) -> Result<RefinementRecord> {
    if flags.len() != mesh.num_elements() {
        return Err(SystemError::DimensionMismatch {
            expected: mesh.num_elements(),
            actual: flags.len(),
        });
    }

    let to_refine: Vec<usize> = mesh
        .active_elements()
        .filter(|&e| flags[e] == RefinementFlag::Refine)
        .filter(|&e| max_h_level == 0 || mesh.element(e).level < max_h_level)
        .collect();
    check_conforming(mesh, &to_refine)?;

    let to_coarsen = coarsening_candidates(mesh, flags);

    let mut record = RefinementRecord::default();
    for parent in to_coarsen {
        let children = mesh.element(parent).children.clone();
        for &child in &children {
            mesh.elements_mut()[child].active = false;
        }
        mesh.elements_mut()[parent].active = true;
        record.coarsened.push((parent, children));
    }

    let mut label_to_vertex: FxHashMap<VertexLabel, usize> = FxHashMap::default();
    for parent_idx in to_refine {
        let parent = mesh.element(parent_idx).clone();
        let labels = child_labels(parent_idx, &parent);

        let children = if parent.children.is_empty() {
            let mut children = Vec::with_capacity(labels.len());
            for child_labels in &labels {
                let mut nodes = Vec::with_capacity(child_labels.len());
                for label in child_labels {
                    let node = match label_to_vertex.get(label) {
                        Some(&node) => node,
                        None => {
                            let node = create_vertex(mesh, label, &parent);
                            label_to_vertex.insert(*label, node);
                            if !matches!(label, VertexLabel::Vertex(_)) {
                                record.new_nodes.push((node, label.interpolated_vertices(&parent)));
                            }
                            node
                        }
                    };
                    nodes.push(node);
                }
                let child = Element {
                    kind: parent.kind,
                    nodes,
                    subdomain: parent.subdomain,
                    level: parent.level + 1,
                    parent: Some(parent_idx),
                    children: Vec::new(),
                    active: true,
                };
                children.push(mesh.push_element(child));
            }
            mesh.elements_mut()[parent_idx].children = children.clone();
            children
        } else {
            // Previously coarsened: reactivate the existing children and their vertices
            for (&child, child_labels) in parent.children.iter().zip(&labels) {
                mesh.elements_mut()[child].active = true;
                let child_nodes = mesh.element(child).nodes.clone();
                for (label, node) in child_labels.iter().zip(child_nodes) {
                    if !matches!(label, VertexLabel::Vertex(_)) && label_to_vertex.insert(*label, node).is_none() {
                        record.new_nodes.push((node, label.interpolated_vertices(&parent)));
                    }
                }
            }
            parent.children.clone()
        };
        mesh.elements_mut()[parent_idx].active = false;

        let parent_sides: Vec<BoundarySide> = mesh
            .boundary_sides()
            .iter()
            .filter(|s| s.element == parent_idx)
            .copied()
            .collect();
        for side in parent_sides {
            for &(child, child_side) in child_sides(parent.kind, side.side) {
                let entry = BoundarySide {
                    element: children[child],
                    side: child_side,
                    boundary: side.boundary,
                };
                if !mesh.boundary_sides().contains(&entry) {
                    mesh.push_boundary_side(entry);
                }
            }
        }
        record.refined.push((parent_idx, children));
    }

    // A vertex shared by a refined and a reactivated element may have been recorded twice
    record.new_nodes.sort_unstable_by_key(|(node, _)| *node);
    record.new_nodes.dedup_by_key(|(node, _)| *node);

    debug!(
        "refinement pass: {} elements refined, {} coarsened, {} new vertices",
        record.refined.len(),
        record.coarsened.len(),
        record.new_nodes.len()
    );
    Ok(record)
}

fn create_vertex(mesh: &mut Mesh, label: &VertexLabel, parent: &Element) -> usize {
    match *label {
        VertexLabel::Vertex(v) => v,
        _ => {
            let vertices = label.interpolated_vertices(parent);
            let n = vertices.len() as f64;
            let position = vertices
                .iter()
                .fold(Point3::origin(), |acc, &v| acc + mesh.vertices()[v].coords / n);
            mesh.push_vertex(position)
        }
    }
}

fn check_conforming(mesh: &Mesh, to_refine: &[usize]) -> Result<()> {
    if mesh.dim() == 1 || to_refine.is_empty() {
        return Ok(());
    }
    let mut refined = vec![false; mesh.num_elements()];
    for &e in to_refine {
        refined[e] = true;
    }
    let topology = MeshTopology::build(mesh);
    let offending = topology
        .interior_faces()
        .iter()
        .find(|face| refined[face.element] != refined[face.neighbor]);
    match offending {
        Some(face) => Err(SystemError::NonConformingRefinement(format!(
            "element {} and its neighbor {} would be refined to different levels",
            face.element, face.neighbor
        ))),
        None => Ok(()),
    }
}

fn coarsening_candidates(mesh: &Mesh, flags: &[RefinementFlag]) -> Vec<usize> {
    let mut parents: Vec<usize> = mesh
        .active_elements()
        .filter(|&e| flags[e] == RefinementFlag::Coarsen)
        .filter_map(|e| mesh.element(e).parent)
        .collect();
    parents.sort_unstable();
    parents.dedup();

    let mut skipped_quads = 0;
    let candidates = parents
        .into_iter()
        .filter(|&p| {
            let parent = mesh.element(p);
            let siblings_agree = parent
                .children
                .iter()
                .all(|&c| mesh.element(c).active && flags[c] == RefinementFlag::Coarsen);
            if siblings_agree && parent.kind == ElementType::Quad4 {
                skipped_quads += 1;
                return false;
            }
            siblings_agree
        })
        .collect();
    if skipped_quads > 0 {
        warn!("coarsening of quadrilaterals is not supported; skipped {skipped_quads} candidates");
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::procedural::{create_rectangular_uniform_quad_mesh, create_uniform_line_mesh};

    #[test]
    fn quad_children_are_counter_clockwise() {
        let mut mesh = create_rectangular_uniform_quad_mesh(1, 1, [0.0, 1.0], [0.0, 1.0]).unwrap();
        let record = refine_uniformly(&mut mesh).unwrap();
        assert_eq!(record.refined.len(), 1);
        assert_eq!(record.new_nodes.len(), 5);
        for &child in &record.refined[0].1 {
            let nodes = &mesh.element(child).nodes;
            let p: Vec<_> = nodes.iter().map(|&n| mesh.vertices()[n]).collect();
            let area = (0..4)
                .map(|i| {
                    let (a, b) = (p[i], p[(i + 1) % 4]);
                    a.x * b.y - b.x * a.y
                })
                .sum::<f64>()
                / 2.0;
            assert!((area - 0.25).abs() < 1e-14);
        }
    }

    #[test]
    fn line_coarsening_reactivates_parent() {
        let mut mesh = create_uniform_line_mesh(0.0, 1.0, 2).unwrap();
        let mut flags = vec![RefinementFlag::DoNothing; 2];
        flags[0] = RefinementFlag::Refine;
        let record = refine_and_coarsen(&mut mesh, &flags, 0).unwrap();
        assert_eq!(mesh.num_active_elements(), 3);
        let children = record.refined[0].1.clone();

        let mut flags = vec![RefinementFlag::DoNothing; mesh.num_elements()];
        for &c in &children {
            flags[c] = RefinementFlag::Coarsen;
        }
        let record = refine_and_coarsen(&mut mesh, &flags, 0).unwrap();
        assert_eq!(record.coarsened, vec![(0, children)]);
        assert_eq!(mesh.num_active_elements(), 2);
        assert!(mesh.element(0).active);
    }
}
