//! Degree of freedom numbering.
//!
//! Degrees of freedom are numbered variable-major: all dofs of variable 0 come first, then
//! all dofs of variable 1, and so on. Within a variable, first order Lagrange dofs follow
//! ascending node ids and constant monomial dofs follow ascending element ids.
use crate::error::{Result, SystemError};
use crate::mesh::refinement::RefinementRecord;
use crate::mesh::{Mesh, SubdomainId};
use crate::variables::{FeFamily, Variable};
use log::warn;
use nalgebra::DVector;
use std::collections::BTreeSet;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDofs {
    family: FeFamily,
    subdomains: Option<BTreeSet<SubdomainId>>,
    node_dofs: Vec<Option<usize>>,
    element_dofs: Vec<Option<usize>>,
    range: Range<usize>,
}

impl VariableDofs {
    pub fn family(&self) -> FeFamily {
        self.family
    }

    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn num_dofs(&self) -> usize {
        self.range.len()
    }

    pub fn is_active_on(&self, subdomain: SubdomainId) -> bool {
        self.subdomains
            .as_ref()
            .map(|set| set.contains(&subdomain))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DofMap {
    variables: Vec<VariableDofs>,
    num_dofs: usize,
}

impl DofMap {
    /// Numbers the dofs of the given variables on the active elements of the mesh.
    pub fn build(mesh: &Mesh, active_elements: &[usize], variables: &[Variable]) -> Self {
        let mut next = 0;
        let mut variable_dofs = Vec::with_capacity(variables.len());
        for variable in variables {
            let start = next;
            let mut node_dofs = vec![None; mesh.num_vertices()];
            let mut element_dofs = vec![None; mesh.num_elements()];
            let elements = active_elements
                .iter()
                .copied()
                .filter(|&e| variable.is_active_on(mesh.element(e).subdomain));
            match variable.fe_type.family {
                FeFamily::Lagrange => {
                    let mut touched = vec![false; mesh.num_vertices()];
                    for element in elements {
                        for &node in &mesh.element(element).nodes {
                            touched[node] = true;
                        }
                    }
                    for (node, _) in touched.iter().enumerate().filter(|(_, &t)| t) {
                        node_dofs[node] = Some(next);
                        next += 1;
                    }
                }
                FeFamily::Monomial => {
                    for element in elements {
                        element_dofs[element] = Some(next);
                        next += 1;
                    }
                }
            }
            variable_dofs.push(VariableDofs {
                family: variable.fe_type.family,
                subdomains: variable.subdomains.clone(),
                node_dofs,
                element_dofs,
                range: start..next,
            });
        }
        Self {
            variables: variable_dofs,
            num_dofs: next,
        }
    }

    pub fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn variable(&self, var: usize) -> &VariableDofs {
        &self.variables[var]
    }

    pub fn node_dof(&self, var: usize, node: usize) -> Option<usize> {
        self.variables
            .get(var)
            .and_then(|v| v.node_dofs.get(node).copied().flatten())
    }

    pub fn element_dof(&self, var: usize, element: usize) -> Option<usize> {
        self.variables
            .get(var)
            .and_then(|v| v.element_dofs.get(element).copied().flatten())
    }

    /// The variable owning the given dof.
    pub fn dof_variable(&self, dof: usize) -> Option<usize> {
        self.variables.iter().position(|v| v.range.contains(&dof))
    }

    /// Fills `dofs` with the dofs of one variable on an element, in local shape function order.
    ///
    /// Leaves `dofs` empty if the variable does not live on the element.
    pub fn populate_element_dofs(&self, var: usize, mesh: &Mesh, element: usize, dofs: &mut Vec<usize>) {
        dofs.clear();
        let Some(variable) = self.variables.get(var) else {
            return;
        };
        if !variable.is_active_on(mesh.element(element).subdomain) {
            return;
        }
        match variable.family {
            FeFamily::Lagrange => {
                dofs.extend(
                    mesh.element(element)
                        .nodes
                        .iter()
                        .filter_map(|&n| variable.node_dofs.get(n).copied().flatten()),
                );
            }
            FeFamily::Monomial => {
                if let Some(dof) = variable.element_dofs.get(element).copied().flatten() {
                    dofs.push(dof);
                }
            }
        }
    }

    /// Transfers a vector from the layout `old` to this layout.
    ///
    /// Values of surviving nodes and elements are copied. Without a refinement record, dofs
    /// that did not exist before are set to zero.
    pub fn project(
        &self,
        old: &DofMap,
        record: Option<&RefinementRecord>,
        old_values: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        if old_values.len() != old.num_dofs() {
            return Err(SystemError::DimensionMismatch {
                expected: old.num_dofs(),
                actual: old_values.len(),
            });
        }
        let mut values = DVector::zeros(self.num_dofs);
        let mut missing = 0;
        for (var, dofs) in self.variables.iter().enumerate() {
            let old_value = |dof: Option<usize>| dof.map(|d| old_values[d]);
            match dofs.family {
                FeFamily::Lagrange => {
                    for (node, dof) in dofs.node_dofs.iter().enumerate() {
                        let Some(dof) = *dof else { continue };
                        let value = old_value(old.node_dof(var, node)).or_else(|| {
                            let (_, parents) = record?
                                .new_nodes
                                .iter()
                                .find(|(new_node, _)| *new_node == node)?;
                            average(parents.iter().map(|&p| old_value(old.node_dof(var, p))))
                        });
                        values[dof] = value.unwrap_or_else(|| {
                            missing += 1;
                            0.0
                        });
                    }
                }
                FeFamily::Monomial => {
                    for (element, dof) in dofs.element_dofs.iter().enumerate() {
                        let Some(dof) = *dof else { continue };
                        let value = old_value(old.element_dof(var, element)).or_else(|| {
                            let record = record?;
                            if let Some(parent) = record.refined_parent_of(element) {
                                old_value(old.element_dof(var, parent))
                            } else {
                                let children = record.coarsened_children_of(element)?;
                                average(children.iter().map(|&c| old_value(old.element_dof(var, c))))
                            }
                        });
                        values[dof] = value.unwrap_or_else(|| {
                            missing += 1;
                            0.0
                        });
                    }
                }
            }
        }
        if missing > 0 {
            warn!("{missing} degrees of freedom had no value to project from and were set to zero");
        }
        Ok(values)
    }
}

fn average(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0;
    for value in values {
        sum += value?;
        count += 1;
    }
    (count > 0).then(|| sum / count as f64)
}
