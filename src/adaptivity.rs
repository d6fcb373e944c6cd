//! Error estimation and the flagging policy for h-adaptivity.
use crate::config::AdaptivityConfig;
use crate::error::Result;
use crate::fe_data::{FeData, FeDataKind, FeInputs};
use crate::mesh::refinement::RefinementFlag;
use crate::mesh::{Mesh, MeshTopology};
use crate::variables::{CoupledVariableId, VariableId};
use log::{debug, warn};

/// Error indicator per element. Entries of inactive elements are zero.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorVector {
    values: Vec<f64>,
}

impl ErrorVector {
    pub fn zeros(num_elements: usize) -> Self {
        Self {
            values: vec![0.0; num_elements],
        }
    }

    pub fn from_values(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, element: usize) -> f64 {
        self.values.get(element).copied().unwrap_or(0.0)
    }

    /// Minimum and maximum over the given elements.
    pub fn range_over(&self, elements: &[usize]) -> Option<(f64, f64)> {
        elements
            .iter()
            .map(|&e| self.get(e))
            .fold(None, |acc, e| match acc {
                None => Some((e, e)),
                Some((lo, hi)) => Some((lo.min(e), hi.max(e))),
            })
    }
}

/// Maps a solution to an error indicator per element.
pub trait ErrorEstimator: Send + Sync {
    fn estimate_error(&self, inputs: &FeInputs, topology: &MeshTopology, active: &[usize]) -> Result<ErrorVector>;
}

/// Kelly-type estimator based on the jump of the normal gradient across interior faces.
///
/// For each active element `K`, `η_K² = h_K Σ_{F ⊂ ∂K} ∫_F [∇u · n]²`, summed over the selected
/// nonlinear variables.
#[derive(Debug, Clone, Default)]
pub struct GradientJumpEstimator {
    /// Variables to include. `None` selects every nonlinear variable.
    pub variables: Option<Vec<VariableId>>,
}

impl ErrorEstimator for GradientJumpEstimator {
    fn estimate_error(&self, inputs: &FeInputs, topology: &MeshTopology, _active: &[usize]) -> Result<ErrorVector> {
        let mut squared = vec![0.0; inputs.mesh.num_elements()];
        let num_coupled = inputs.registry.num_coupled();
        let mut element_side = FeData::new(FeDataKind::Side, num_coupled);
        let mut neighbor_side = FeData::new(FeDataKind::NeighborSide, num_coupled);
        let variables: Vec<CoupledVariableId> = match &self.variables {
            Some(vars) => vars.iter().map(|v| CoupledVariableId(v.0)).collect(),
            None => (0..inputs.registry.num_variables())
                .map(CoupledVariableId)
                .collect(),
        };

        for face in topology.interior_faces() {
            element_side.reinit_side(inputs, face.element, face.side)?;
            neighbor_side.reinit_neighbor_side(inputs, face, &element_side)?;
            let mut jump_integral = 0.0;
            for &var in &variables {
                let (own, other) = (element_side.variable(var), neighbor_side.variable(var));
                if !own.is_active() || !other.is_active() {
                    continue;
                }
                for qp in 0..element_side.num_qp() {
                    let normal = element_side.normal(qp);
                    let jump = (own.grad_u(qp) - other.grad_u(qp)).dot(&normal);
                    jump_integral += element_side.jxw()[qp] * jump * jump;
                }
            }
            squared[face.element] += element_side.element_size() * jump_integral;
            squared[face.neighbor] += neighbor_side.element_size() * jump_integral;
        }
        Ok(ErrorVector::from_values(squared.into_iter().map(f64::sqrt).collect()))
    }
}

/// Turns an error vector into refinement flags.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptivityPolicy {
    pub refine_fraction: f64,
    pub coarsen_fraction: f64,
    /// Zero means unlimited.
    pub max_h_level: u32,
    pub refine_threshold: f64,
}

impl From<&AdaptivityConfig> for AdaptivityPolicy {
    fn from(config: &AdaptivityConfig) -> Self {
        Self {
            refine_fraction: config.refine_fraction,
            coarsen_fraction: config.coarsen_fraction,
            max_h_level: config.max_h_level,
            refine_threshold: config.refine_threshold,
        }
    }
}

impl AdaptivityPolicy {
    /// Flags active elements by the error fraction method.
    ///
    /// With `Δ = max - min` over active elements, an element is refined when its error exceeds
    /// both `min + (1 - refine_fraction) Δ` and `refine_threshold`, and coarsened when it lies
    /// below `min + coarsen_fraction Δ`. On quadrilateral meshes the refined set is then closed
    /// so that the refined mesh stays conforming.
    pub fn flag(
        &self,
        mesh: &Mesh,
        topology: &MeshTopology,
        active: &[usize],
        errors: &ErrorVector,
    ) -> Vec<RefinementFlag> {
        let mut flags = vec![RefinementFlag::DoNothing; mesh.num_elements()];
        let (min, max) = match errors.range_over(active) {
            Some(range) => range,
            None => return flags,
        };
        let delta = max - min;
        let refine_above = (min + (1.0 - self.refine_fraction) * delta).max(self.refine_threshold);
        let coarsen_below = min + self.coarsen_fraction * delta;
        for &e in active {
            let error = errors.get(e);
            let level = mesh.element(e).level;
            if error > refine_above {
                if self.max_h_level == 0 || level < self.max_h_level {
                    flags[e] = RefinementFlag::Refine;
                }
            } else if self.coarsen_fraction > 0.0 && error < coarsen_below && level > 0 {
                flags[e] = RefinementFlag::Coarsen;
            }
        }
        if mesh.dim() > 1 {
            self.close_refinement(mesh, topology, &mut flags);
        }
        flags
    }

    fn can_refine(&self, mesh: &Mesh, element: usize) -> bool {
        self.max_h_level == 0 || mesh.element(element).level < self.max_h_level
    }

    /// Extends every flagged element to the group of active elements connected to it through
    /// interior faces, since no face may separate a refined from an unrefined quadrilateral.
    /// A group containing an element at the maximum level is left unrefined.
    fn close_refinement(&self, mesh: &Mesh, topology: &MeshTopology, flags: &mut [RefinementFlag]) {
        let mut adjacency = vec![Vec::new(); mesh.num_elements()];
        for face in topology.interior_faces() {
            adjacency[face.element].push(face.neighbor);
            adjacency[face.neighbor].push(face.element);
        }

        let mut visited = vec![false; mesh.num_elements()];
        for seed in 0..flags.len() {
            if visited[seed] || flags[seed] != RefinementFlag::Refine {
                continue;
            }
            visited[seed] = true;
            let mut group = vec![seed];
            let mut next = 0;
            while let Some(&element) = group.get(next) {
                next += 1;
                for &neighbor in &adjacency[element] {
                    if !visited[neighbor] {
                        visited[neighbor] = true;
                        group.push(neighbor);
                    }
                }
            }

            let flagged = group.iter().filter(|&&e| flags[e] == RefinementFlag::Refine).count();
            let flag = if group.iter().all(|&e| self.can_refine(mesh, e)) {
                if flagged < group.len() {
                    debug!(
                        "extended refinement from {flagged} to {} elements to keep the mesh conforming",
                        group.len()
                    );
                }
                RefinementFlag::Refine
            } else {
                warn!(
                    "{flagged} elements flagged for refinement are connected to elements at the maximum \
                     refinement level {}; not refining them",
                    self.max_h_level
                );
                RefinementFlag::DoNothing
            };
            for &e in &group {
                flags[e] = flag;
            }
        }
    }
}

/// Result of one call to [`CoupledSystem::adapt`](crate::system::CoupledSystem::adapt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptivityOutcome {
    /// No element was flagged.
    Unchanged,
    Changed { refined: usize, coarsened: usize },
    /// The per-step cycle limit was reached; nothing was done.
    CycleLimitReached,
}

impl AdaptivityOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

/// Adaptivity state of a coupled system.
pub struct Adaptivity {
    pub(crate) policy: AdaptivityPolicy,
    max_cycles: usize,
    initial_cycles: usize,
    cycles_this_step: usize,
    estimator: Box<dyn ErrorEstimator>,
    errors: Option<ErrorVector>,
}

impl Adaptivity {
    pub fn new(config: &AdaptivityConfig) -> Self {
        Self {
            policy: AdaptivityPolicy::from(config),
            max_cycles: config.max_cycles,
            initial_cycles: config.initial_cycles,
            cycles_this_step: 0,
            estimator: Box::new(GradientJumpEstimator::default()),
            errors: None,
        }
    }

    pub fn configure(&mut self, max_cycles: usize, initial_cycles: usize) {
        self.max_cycles = max_cycles;
        self.initial_cycles = initial_cycles;
    }

    pub fn max_cycles(&self) -> usize {
        self.max_cycles
    }

    pub fn initial_cycles(&self) -> usize {
        self.initial_cycles
    }

    pub fn policy(&self) -> &AdaptivityPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: AdaptivityPolicy) {
        self.policy = policy;
    }

    pub fn set_estimator(&mut self, estimator: Box<dyn ErrorEstimator>) {
        self.estimator = estimator;
    }

    /// Error indicators of the most recent estimation.
    pub fn errors(&self) -> Option<&ErrorVector> {
        self.errors.as_ref()
    }

    pub(crate) fn begin_step(&mut self) {
        self.cycles_this_step = 0;
    }

    pub(crate) fn cycle_available(&self) -> bool {
        self.cycles_this_step < self.max_cycles
    }

    pub(crate) fn count_cycle(&mut self) {
        self.cycles_this_step += 1;
    }

    /// Estimates the error with the configured estimator.
    pub(crate) fn estimate(&mut self, inputs: &FeInputs, topology: &MeshTopology, active: &[usize]) -> Result<()> {
        let errors = self.estimator.estimate_error(inputs, topology, active)?;
        debug!(
            "estimated error on {} elements, range {:?}",
            active.len(),
            errors.range_over(active)
        );
        self.errors = Some(errors);
        Ok(())
    }

    /// Replaces the stored error indicators.
    pub fn set_errors(&mut self, errors: ErrorVector) {
        self.errors = Some(errors);
    }

    pub(crate) fn flag(&self, mesh: &Mesh, topology: &MeshTopology, active: &[usize]) -> Vec<RefinementFlag> {
        match &self.errors {
            Some(errors) => self.policy.flag(mesh, topology, active, errors),
            None => vec![RefinementFlag::DoNothing; mesh.num_elements()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::procedural::{create_rectangular_uniform_quad_mesh, create_uniform_line_mesh};

    #[test]
    fn uniform_error_flags_nothing() {
        let mesh = create_uniform_line_mesh(0.0, 1.0, 4).unwrap();
        let active: Vec<_> = mesh.active_elements().collect();
        let topology = MeshTopology::build(&mesh);
        let policy = AdaptivityPolicy::from(&AdaptivityConfig::default());
        let flags = policy.flag(&mesh, &topology, &active, &ErrorVector::from_values(vec![0.3; 4]));
        assert!(flags.iter().all(|f| *f == RefinementFlag::DoNothing));
    }

    #[test]
    fn largest_errors_are_refined() {
        let mesh = create_uniform_line_mesh(0.0, 1.0, 4).unwrap();
        let active: Vec<_> = mesh.active_elements().collect();
        let topology = MeshTopology::build(&mesh);
        let policy = AdaptivityPolicy::from(&AdaptivityConfig::default());
        let flags = policy.flag(&mesh, &topology, &active, &ErrorVector::from_values(vec![0.0, 0.1, 0.9, 1.0]));
        assert_eq!(
            flags,
            vec![
                RefinementFlag::DoNothing,
                RefinementFlag::DoNothing,
                RefinementFlag::Refine,
                RefinementFlag::Refine
            ]
        );
    }

    #[test]
    fn quad_refinement_is_closed_over_connected_elements() {
        let mesh = create_rectangular_uniform_quad_mesh(2, 2, [0.0, 1.0], [0.0, 1.0]).unwrap();
        let active: Vec<_> = mesh.active_elements().collect();
        let topology = MeshTopology::build(&mesh);
        let policy = AdaptivityPolicy::from(&AdaptivityConfig::default());
        let flags = policy.flag(&mesh, &topology, &active, &ErrorVector::from_values(vec![1.0, 0.0, 0.0, 0.0]));
        assert_eq!(flags, vec![RefinementFlag::Refine; 4]);
    }

    #[test]
    fn quad_group_at_maximum_level_is_not_refined() {
        let mut mesh = create_rectangular_uniform_quad_mesh(2, 2, [0.0, 1.0], [0.0, 1.0]).unwrap();
        crate::mesh::refinement::refine_uniformly(&mut mesh).unwrap();
        let active: Vec<_> = mesh.active_elements().collect();
        let topology = MeshTopology::build(&mesh);
        let policy = AdaptivityPolicy {
            max_h_level: 1,
            ..AdaptivityPolicy::from(&AdaptivityConfig::default())
        };
        let mut errors = vec![0.0; mesh.num_elements()];
        errors[active[0]] = 1.0;
        let flags = policy.flag(&mesh, &topology, &active, &ErrorVector::from_values(errors));
        assert!(flags.iter().all(|f| *f == RefinementFlag::DoNothing));
    }
}
