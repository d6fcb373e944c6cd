//! Displaced geometry derived from displacement variables.
use crate::dofs::DofMap;
use crate::error::{Result, SystemError};
use crate::mesh::Mesh;
use crate::variables::VariableId;
use nalgebra::{DVector, Point3};

/// A view of the mesh whose vertices are the reference vertices plus the nodal values of one
/// displacement variable per spatial dimension.
///
/// The view owns only vertex positions. Connectivity is always taken from the reference mesh,
/// and synchronization flows in one direction: [`update`](Self::update) overwrites the
/// displaced positions from the reference mesh and a solution vector.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacedMesh {
    displacements: Vec<VariableId>,
    vertices: Vec<Point3<f64>>,
}

impl DisplacedMesh {
    pub fn new(reference: &Mesh, displacements: Vec<VariableId>) -> Result<Self> {
        if displacements.len() != reference.dim() {
            return Err(SystemError::Setup(format!(
                "a displaced mesh of dimension {} needs {} displacement variables, got {}",
                reference.dim(),
                reference.dim(),
                displacements.len()
            )));
        }
        Ok(Self {
            displacements,
            vertices: reference.vertices().to_vec(),
        })
    }

    pub fn displacement_variables(&self) -> &[VariableId] {
        &self.displacements
    }

    pub fn vertices(&self) -> &[Point3<f64>] {
        &self.vertices
    }

    /// Recomputes displaced vertex positions.
    ///
    /// Vertices without a degree of freedom for a displacement variable keep their reference
    /// coordinate in that direction.
    pub fn update(&mut self, reference: &Mesh, dofs: &DofMap, solution: &DVector<f64>) -> Result<()> {
        if solution.len() != dofs.num_dofs() {
            return Err(SystemError::DimensionMismatch {
                expected: dofs.num_dofs(),
                actual: solution.len(),
            });
        }
        self.vertices.clear();
        self.vertices.extend_from_slice(reference.vertices());
        for (direction, &variable) in self.displacements.iter().enumerate() {
            for (node, vertex) in self.vertices.iter_mut().enumerate() {
                if let Some(dof) = dofs.node_dof(variable.0, node) {
                    vertex[direction] += solution[dof];
                }
            }
        }
        Ok(())
    }
}
