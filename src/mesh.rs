//! Mesh representation, derived topology and the cached mesh state of a coupled system.
use crate::dofs::DofMap;
use crate::error::{Result, SystemError};
use itertools::Itertools;
use log::warn;
use nalgebra::{DVector, Point3};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub mod displaced;
pub mod procedural;
pub mod refinement;

pub use displaced::DisplacedMesh;

pub type SubdomainId = u16;
pub type BoundaryId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// Two-node line segment.
    Edge2,
    /// Four-node bilinear quadrilateral with counter-clockwise node ordering.
    Quad4,
}

impl ElementType {
    pub fn num_nodes(&self) -> usize {
        match self {
            Self::Edge2 => 2,
            Self::Quad4 => 4,
        }
    }

    pub fn num_sides(&self) -> usize {
        match self {
            Self::Edge2 => 2,
            Self::Quad4 => 4,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::Edge2 => 1,
            Self::Quad4 => 2,
        }
    }

    /// Local node indices of the given side, ordered along the counter-clockwise boundary.
    pub fn side_nodes(&self, side: usize) -> &'static [usize] {
        const EDGE_SIDES: [[usize; 1]; 2] = [[0], [1]];
        const QUAD_SIDES: [[usize; 2]; 4] = [[0, 1], [1, 2], [2, 3], [3, 0]];
        match self {
            Self::Edge2 => &EDGE_SIDES[side],
            Self::Quad4 => &QUAD_SIDES[side],
        }
    }
}

/// An element of the mesh, including its place in the refinement tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub kind: ElementType,
    pub nodes: Vec<usize>,
    pub subdomain: SubdomainId,
    pub level: u32,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Only active (leaf) elements take part in assembly.
    pub active: bool,
}

impl Element {
    pub fn new(kind: ElementType, nodes: Vec<usize>, subdomain: SubdomainId) -> Self {
        Self {
            kind,
            nodes,
            subdomain,
            level: 0,
            parent: None,
            children: Vec::new(),
            active: true,
        }
    }

    /// Global node indices of the given side.
    pub fn side_node_indices(&self, side: usize) -> impl Iterator<Item = usize> + '_ {
        self.kind
            .side_nodes(side)
            .iter()
            .map(move |&local| self.nodes[local])
    }
}

/// A side of an element that lies on a labelled boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoundarySide {
    pub element: usize,
    pub side: usize,
    pub boundary: BoundaryId,
}

/// An unstructured mesh of line segments (1D) or quadrilaterals (2D).
///
/// Vertices are stored as 3D points with unused coordinates set to zero. Elements are never
/// removed: refinement deactivates parents and appends children, coarsening deactivates
/// children and reactivates their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    dim: usize,
    vertices: Vec<Point3<f64>>,
    elements: Vec<Element>,
    boundary_sides: Vec<BoundarySide>,
}

impl Mesh {
    pub fn from_vertices_and_elements(
        dim: usize,
        vertices: Vec<Point3<f64>>,
        elements: Vec<Element>,
    ) -> Result<Self> {
        if !(1..=2).contains(&dim) {
            return Err(SystemError::Setup(format!("unsupported mesh dimension {dim}")));
        }
        for (index, element) in elements.iter().enumerate() {
            if element.kind.dim() != dim {
                return Err(SystemError::Setup(format!(
                    "element {index} of type {:?} does not fit a {dim}-dimensional mesh",
                    element.kind
                )));
            }
            if element.nodes.len() != element.kind.num_nodes() {
                return Err(SystemError::Setup(format!(
                    "element {index} has {} nodes, expected {}",
                    element.nodes.len(),
                    element.kind.num_nodes()
                )));
            }
            if let Some(node) = element.nodes.iter().find(|&&n| n >= vertices.len()) {
                return Err(SystemError::Setup(format!(
                    "element {index} references vertex {node}, but the mesh only has {} vertices",
                    vertices.len()
                )));
            }
        }
        Ok(Self {
            dim,
            vertices,
            elements,
            boundary_sides: Vec::new(),
        })
    }

    /// Labels a side of an element as part of a boundary.
    pub fn add_boundary_side(&mut self, element: usize, side: usize, boundary: BoundaryId) -> Result<()> {
        let kind = self
            .elements
            .get(element)
            .map(|e| e.kind)
            .ok_or_else(|| SystemError::Setup(format!("boundary side references unknown element {element}")))?;
        if side >= kind.num_sides() {
            return Err(SystemError::Setup(format!(
                "element {element} has no side {side}"
            )));
        }
        let entry = BoundarySide {
            element,
            side,
            boundary,
        };
        if !self.boundary_sides.contains(&entry) {
            self.boundary_sides.push(entry);
        }
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vertices(&self) -> &[Point3<f64>] {
        &self.vertices
    }

    pub fn vertices_mut(&mut self) -> &mut [Point3<f64>] {
        &mut self.vertices
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn element(&self, index: usize) -> &Element {
        &self.elements[index]
    }

    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }

    pub fn active_elements(&self) -> impl Iterator<Item = usize> + '_ {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, element)| element.active)
            .map(|(index, _)| index)
    }

    pub fn num_active_elements(&self) -> usize {
        self.active_elements().count()
    }

    pub fn boundary_sides(&self) -> &[BoundarySide] {
        &self.boundary_sides
    }

    pub fn subdomain_ids(&self) -> BTreeSet<SubdomainId> {
        self.elements.iter().map(|e| e.subdomain).collect()
    }

    pub fn boundary_ids(&self) -> BTreeSet<BoundaryId> {
        self.boundary_sides.iter().map(|s| s.boundary).collect()
    }

    pub fn max_level(&self) -> u32 {
        self.elements
            .iter()
            .filter(|e| e.active)
            .map(|e| e.level)
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn push_vertex(&mut self, vertex: Point3<f64>) -> usize {
        self.vertices.push(vertex);
        self.vertices.len() - 1
    }

    pub(crate) fn push_element(&mut self, element: Element) -> usize {
        self.elements.push(element);
        self.elements.len() - 1
    }

    pub(crate) fn elements_mut(&mut self) -> &mut [Element] {
        &mut self.elements
    }

    pub(crate) fn push_boundary_side(&mut self, side: BoundarySide) {
        self.boundary_sides.push(side);
    }
}

/// A side shared by two active elements.
///
/// `element < neighbor` always holds. `reversed` is set when the neighbor traverses the shared
/// side in the opposite direction, which is the case for any pair of consistently oriented
/// quadrilaterals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteriorFace {
    pub element: usize,
    pub side: usize,
    pub neighbor: usize,
    pub neighbor_side: usize,
    pub reversed: bool,
}

/// Connectivity derived from the active elements of a mesh.
#[derive(Debug, Clone, Default)]
pub struct MeshTopology {
    neighbors: Vec<Vec<Option<usize>>>,
    interior_faces: Vec<InteriorFace>,
    boundary_sides: Vec<BoundarySide>,
    node_to_elements: Vec<Vec<usize>>,
    boundary_nodes: BTreeMap<BoundaryId, Vec<usize>>,
}

impl MeshTopology {
    pub fn build(mesh: &Mesh) -> Self {
        let mut neighbors: Vec<Vec<Option<usize>>> = mesh
            .elements()
            .iter()
            .map(|e| if e.active { vec![None; e.kind.num_sides()] } else { Vec::new() })
            .collect();
        let mut node_to_elements = vec![Vec::new(); mesh.num_vertices()];
        let mut interior_faces = Vec::new();
        let mut open_sides: FxHashMap<[usize; 2], (usize, usize)> = FxHashMap::default();

        for element_idx in mesh.active_elements() {
            let element = mesh.element(element_idx);
            for &node in &element.nodes {
                node_to_elements[node].push(element_idx);
            }
            for side in 0..element.kind.num_sides() {
                let key = side_key(element, side);
                if let Some((other, other_side)) = open_sides.remove(&key) {
                    neighbors[element_idx][side] = Some(other);
                    neighbors[other][other_side] = Some(element_idx);
                    let first = mesh.element(other).side_node_indices(other_side).next();
                    let own_first = element.side_node_indices(side).next();
                    interior_faces.push(InteriorFace {
                        element: other,
                        side: other_side,
                        neighbor: element_idx,
                        neighbor_side: side,
                        reversed: element.kind.dim() > 1 && first != own_first,
                    });
                } else {
                    open_sides.insert(key, (element_idx, side));
                }
            }
        }
        interior_faces.sort_unstable_by_key(|face| (face.element, face.side));

        let mut boundary_sides: Vec<BoundarySide> = mesh
            .boundary_sides()
            .iter()
            .filter(|s| mesh.element(s.element).active)
            .copied()
            .collect();
        boundary_sides.sort_unstable();

        let mut boundary_nodes: BTreeMap<BoundaryId, Vec<usize>> = BTreeMap::new();
        for side in &boundary_sides {
            boundary_nodes
                .entry(side.boundary)
                .or_default()
                .extend(mesh.element(side.element).side_node_indices(side.side));
        }
        for nodes in boundary_nodes.values_mut() {
            *nodes = nodes.iter().copied().sorted_unstable().dedup().collect();
        }

        let unmatched = open_sides
            .values()
            .filter(|&&(e, s)| {
                !boundary_sides
                    .iter()
                    .any(|b| b.element == e && b.side == s)
            })
            .count();
        if unmatched > 0 {
            warn!("{unmatched} exterior element sides carry no boundary label");
        }

        Self {
            neighbors,
            interior_faces,
            boundary_sides,
            node_to_elements,
            boundary_nodes,
        }
    }

    /// The neighbor across the given side, if any.
    pub fn neighbor(&self, element: usize, side: usize) -> Option<usize> {
        self.neighbors
            .get(element)
            .and_then(|sides| sides.get(side))
            .copied()
            .flatten()
    }

    pub fn interior_faces(&self) -> &[InteriorFace] {
        &self.interior_faces
    }

    /// Interior faces owned by `element`, i.e. those where it is the lower-indexed side.
    pub fn faces_of(&self, element: usize) -> &[InteriorFace] {
        let start = self.interior_faces.partition_point(|f| f.element < element);
        let end = self.interior_faces.partition_point(|f| f.element <= element);
        &self.interior_faces[start..end]
    }

    /// Labelled boundary sides of active elements, sorted by element, side and boundary.
    pub fn boundary_sides(&self) -> &[BoundarySide] {
        &self.boundary_sides
    }

    pub fn elements_of_node(&self, node: usize) -> &[usize] {
        self.node_to_elements
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Sorted nodes on the given boundary.
    pub fn boundary_nodes(&self, boundary: BoundaryId) -> &[usize] {
        self.boundary_nodes
            .get(&boundary)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn boundary_node_sets(&self) -> &BTreeMap<BoundaryId, Vec<usize>> {
        &self.boundary_nodes
    }
}

fn side_key(element: &Element, side: usize) -> [usize; 2] {
    let mut key = [usize::MAX; 2];
    for (slot, node) in key.iter_mut().zip(element.side_node_indices(side)) {
        *slot = node;
    }
    key.sort_unstable();
    key
}

/// The mesh owned by a coupled system, with lazily built caches.
///
/// Caches are dropped by [`invalidate`](Self::invalidate) and rebuilt on first use. The
/// returned ranges are shared, read-only snapshots.
#[derive(Debug, Clone)]
pub struct MeshState {
    mesh: Mesh,
    displaced: Option<DisplacedMesh>,
    topology: Option<Arc<MeshTopology>>,
    active_elements: Option<Arc<[usize]>>,
    active_nodes: Option<Arc<[usize]>>,
    changed: bool,
}

impl MeshState {
    pub fn new(mesh: Mesh) -> Self {
        Self {
            mesh,
            displaced: None,
            topology: None,
            active_elements: None,
            active_nodes: None,
            changed: true,
        }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Mutable access to the mesh. Invalidates every cache.
    pub fn mesh_mut(&mut self) -> &mut Mesh {
        self.invalidate();
        &mut self.mesh
    }

    pub fn invalidate(&mut self) {
        self.topology = None;
        self.active_elements = None;
        self.active_nodes = None;
        self.changed = true;
    }

    /// Whether the mesh changed since the flag was last taken.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn take_changed(&mut self) -> bool {
        std::mem::replace(&mut self.changed, false)
    }

    pub fn is_cached(&self) -> bool {
        self.topology.is_some() && self.active_elements.is_some() && self.active_nodes.is_some()
    }

    pub fn topology(&mut self) -> Arc<MeshTopology> {
        let mesh = &self.mesh;
        self.topology
            .get_or_insert_with(|| Arc::new(MeshTopology::build(mesh)))
            .clone()
    }

    /// Active elements in ascending order.
    pub fn active_element_range(&mut self) -> Arc<[usize]> {
        let mesh = &self.mesh;
        self.active_elements
            .get_or_insert_with(|| mesh.active_elements().collect())
            .clone()
    }

    /// Nodes touched by at least one active element, in ascending order.
    pub fn active_node_range(&mut self) -> Arc<[usize]> {
        let mesh = &self.mesh;
        self.active_nodes
            .get_or_insert_with(|| {
                let mut touched = vec![false; mesh.num_vertices()];
                for element in mesh.active_elements() {
                    for &node in &mesh.element(element).nodes {
                        touched[node] = true;
                    }
                }
                touched
                    .iter()
                    .enumerate()
                    .filter(|(_, &t)| t)
                    .map(|(node, _)| node)
                    .collect()
            })
            .clone()
    }

    pub fn displaced(&self) -> Option<&DisplacedMesh> {
        self.displaced.as_ref()
    }

    pub fn displaced_mut(&mut self) -> Option<&mut DisplacedMesh> {
        self.displaced.as_mut()
    }

    pub fn set_displaced(&mut self, displaced: DisplacedMesh) {
        self.displaced = Some(displaced);
    }

    /// Re-projects the displaced view, if any, from the displacement values in `solution`.
    pub fn update_displaced(&mut self, dofs: &DofMap, solution: &DVector<f64>) -> Result<()> {
        match &mut self.displaced {
            Some(displaced) => displaced.update(&self.mesh, dofs, solution),
            None => Ok(()),
        }
    }

    /// Vertex positions to evaluate against. Falls back to the reference geometry when no
    /// displaced view exists.
    pub fn geometry(&self, use_displaced: bool) -> &[Point3<f64>] {
        match (use_displaced, &self.displaced) {
            (true, Some(displaced)) => displaced.vertices(),
            _ => self.mesh.vertices(),
        }
    }
}
