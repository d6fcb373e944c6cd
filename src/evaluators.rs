//! Capability interfaces for physics evaluators.
//!
//! Every evaluator implements [`Evaluable`] plus exactly one category trait. Evaluators compute
//! pointwise contributions from the read-only views in [`fe_data`](crate::fe_data) and return
//! them as values; the assembly engine integrates, scatters and accumulates them. Evaluator code
//! reports failures through [`eyre::Result`].
use crate::error::{Result, SystemError};
use crate::fe_data::{EvalEnv, MaterialWriter, PointContext, QpContext, TimeView, VariableQp};
use crate::mesh::{BoundaryId, SubdomainId};
use crate::params::Parameters;
use crate::variables::{AuxVariableId, CoupledVariableId, VariableId, VariableRef};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod aux_kernels;
pub mod boundary_conditions;
pub mod dampers;
pub mod dg_kernels;
pub mod functions;
pub mod initial_conditions;
pub mod kernels;
pub mod materials;
pub mod postprocessors;
pub mod stabilizers;

/// Configuration shared by all evaluators.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvaluatorBase {
    pub name: String,
    /// Subdomains the evaluator is restricted to. `None` means every subdomain.
    pub blocks: Option<Vec<SubdomainId>>,
    /// Boundaries a boundary condition acts on.
    pub boundaries: Vec<BoundaryId>,
    pub use_displaced_mesh: bool,
}

impl EvaluatorBase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Reads the common `block`, `boundary` and `use_displaced_mesh` parameters.
    pub fn from_params(name: &str, params: &Parameters) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            blocks: params.id_list("block")?,
            boundaries: params.id_list("boundary")?.unwrap_or_default(),
            use_displaced_mesh: params.bool_or("use_displaced_mesh", false)?,
        })
    }

    pub fn applies_to_block(&self, subdomain: SubdomainId) -> bool {
        self.blocks
            .as_ref()
            .map(|blocks| blocks.contains(&subdomain))
            .unwrap_or(true)
    }

    pub fn applies_to_boundary(&self, boundary: BoundaryId) -> bool {
        self.boundaries.contains(&boundary)
    }
}

/// The contract common to every evaluator category.
pub trait Evaluable: Send {
    fn base(&self) -> &EvaluatorBase;

    fn name(&self) -> &str {
        &self.base().name
    }

    /// Called once per time step, before the first nonlinear iteration.
    fn timestep_setup(&mut self, _time: &TimeView) -> eyre::Result<()> {
        Ok(())
    }

    /// Called whenever a worker's traversal enters a new subdomain.
    fn subdomain_setup(&mut self, _subdomain: SubdomainId) -> eyre::Result<()> {
        Ok(())
    }
}

/// A volumetric contribution to the residual of one nonlinear variable.
///
/// The residual of test function `i` on an element is `Σ_qp JxW · compute_qp_residual(qp, i)`.
pub trait Kernel: Evaluable {
    fn variable(&self) -> VariableId;

    /// Variables (of either family) for which off-diagonal Jacobian blocks are provided.
    fn coupled_variables(&self) -> &[CoupledVariableId] {
        &[]
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64>;

    /// Derivative of the residual of test function `i` with respect to dof `j` of the
    /// kernel's own variable.
    fn compute_qp_jacobian(&mut self, _qp: &VariableQp, _i: usize, _j: usize) -> eyre::Result<f64> {
        Ok(0.0)
    }

    /// Derivative with respect to dof `j` of the coupled variable `jvar`.
    fn compute_qp_off_diag_jacobian(
        &mut self,
        _qp: &VariableQp,
        _i: usize,
        _j: usize,
        _jvar: CoupledVariableId,
    ) -> eyre::Result<f64> {
        Ok(0.0)
    }
}

/// Which side of an interior face a DG residual belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DgResidualType {
    Element,
    Neighbor,
}

/// Test function side and trial function side of a DG Jacobian entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DgJacobianType {
    ElementElement,
    ElementNeighbor,
    NeighborElement,
    NeighborNeighbor,
}

/// The two sides of an interior face at one quadrature point.
#[derive(Clone, Copy)]
pub struct DgQp<'a> {
    pub element: VariableQp<'a>,
    pub neighbor: VariableQp<'a>,
}

/// An interior face contribution coupling an element and its neighbor.
pub trait DgKernel: Evaluable {
    fn variable(&self) -> VariableId;

    fn compute_qp_residual(&mut self, qp: &DgQp, kind: DgResidualType, i: usize) -> eyre::Result<f64>;

    fn compute_qp_jacobian(
        &mut self,
        _qp: &DgQp,
        _kind: DgJacobianType,
        _i: usize,
        _j: usize,
    ) -> eyre::Result<f64> {
        Ok(0.0)
    }
}

/// A boundary contribution integrated over boundary sides.
pub trait IntegratedBc: Evaluable {
    fn variable(&self) -> VariableId;

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64>;

    fn compute_qp_jacobian(&mut self, _qp: &VariableQp, _i: usize, _j: usize) -> eyre::Result<f64> {
        Ok(0.0)
    }
}

/// A boundary condition that replaces the residual of a nodal dof.
///
/// The Jacobian row of the dof is replaced by `compute_qp_jacobian` on the diagonal.
pub trait NodalBc: Evaluable {
    fn variable(&self) -> VariableId;

    fn compute_qp_residual(&mut self, qp: &VariableQp) -> eyre::Result<f64>;

    fn compute_qp_jacobian(&mut self, _qp: &VariableQp) -> eyre::Result<f64> {
        Ok(1.0)
    }
}

/// Boundary conditions of either kind.
pub enum BoundaryCondition {
    Integrated(Box<dyn IntegratedBc>),
    Nodal(Box<dyn NodalBc>),
}

impl BoundaryCondition {
    pub fn base(&self) -> &EvaluatorBase {
        match self {
            Self::Integrated(bc) => bc.base(),
            Self::Nodal(bc) => bc.base(),
        }
    }

    pub fn variable(&self) -> VariableId {
        match self {
            Self::Integrated(bc) => bc.variable(),
            Self::Nodal(bc) => bc.variable(),
        }
    }
}

/// Computes the value of an auxiliary variable.
///
/// Kernels of nodal (Lagrange) auxiliary variables are evaluated once per node, kernels of
/// elemental (monomial) variables at every quadrature point and averaged with the quadrature
/// weights.
pub trait AuxKernel: Evaluable {
    fn variable(&self) -> AuxVariableId;

    fn compute_value(&mut self, qp: &QpContext) -> eyre::Result<f64>;
}

/// Provides material properties at quadrature points.
pub trait Material: Evaluable {
    fn declared_properties(&self) -> Vec<String>;

    fn compute_qp_properties(&mut self, qp: &QpContext, out: &mut MaterialWriter) -> eyre::Result<()>;
}

/// A stabilization contribution layered on the volumetric terms of a variable.
pub trait Stabilizer: Evaluable {
    fn variable(&self) -> VariableId;

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64>;

    fn compute_qp_jacobian(&mut self, _qp: &VariableQp, _i: usize, _j: usize) -> eyre::Result<f64> {
        Ok(0.0)
    }
}

/// Pointwise initial values of a variable. Nodal variables are interpolated at vertices,
/// elemental variables sampled at element centroids.
pub trait InitialCondition: Evaluable {
    fn variable(&self) -> VariableRef;

    fn value(&mut self, point: &PointContext) -> eyre::Result<f64>;
}

/// Where a postprocessor gathers its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostprocessorScope {
    /// Quadrature points of active elements.
    Element,
    /// Active nodes.
    Nodal,
    /// Evaluated once, without a traversal.
    General,
}

/// How per-thread partial values combine into the final value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    Sum,
    Min,
    Max,
    /// Sum of values divided by the sum of weights.
    Average,
}

/// The contribution of one worker to a postprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PartialValue {
    pub value: f64,
    /// For averages, the accumulated weight. Otherwise the number of samples.
    pub weight: f64,
}

impl Aggregation {
    /// Combines partial values in the given order.
    pub fn combine(&self, partials: impl IntoIterator<Item = PartialValue>) -> f64 {
        let mut partials = partials.into_iter().filter(|p| p.weight > 0.0).peekable();
        match self {
            Self::Sum => partials.map(|p| p.value).sum(),
            Self::Min => partials.map(|p| p.value).fold(f64::INFINITY, f64::min),
            Self::Max => partials.map(|p| p.value).fold(f64::NEG_INFINITY, f64::max),
            Self::Average => {
                if partials.peek().is_none() {
                    return 0.0;
                }
                let (value, weight) = partials.fold((0.0, 0.0), |(v, w), p| (v + p.value, w + p.weight));
                value / weight
            }
        }
    }
}

/// A scalar quantity computed from the solution.
pub trait Postprocessor: Evaluable {
    fn scope(&self) -> PostprocessorScope;

    fn aggregation(&self) -> Aggregation;

    /// Resets accumulated state before a traversal.
    fn initialize(&mut self) {}

    /// Accumulates one quadrature point (element scope) or node (nodal scope).
    fn execute_qp(&mut self, _qp: &QpContext) -> eyre::Result<()> {
        Ok(())
    }

    /// Computes the value of a general postprocessor.
    fn execute_general(&mut self, _env: &EvalEnv) -> eyre::Result<f64> {
        Ok(0.0)
    }

    /// The partial value accumulated since the last [`initialize`](Self::initialize).
    fn partial(&self) -> PartialValue {
        PartialValue::default()
    }
}

/// A function of space and time.
pub trait Function: Evaluable {
    fn value(&self, t: f64, p: &Point3<f64>) -> f64;

    fn gradient(&self, _t: f64, _p: &Point3<f64>) -> Vector3<f64> {
        Vector3::zeros()
    }
}

/// Limits the size of a proposed solution update.
///
/// The damping factor of a pass is the minimum over all dampers and quadrature points.
pub trait Damper: Evaluable {
    fn compute_qp_damping(&mut self, qp: &QpContext) -> eyre::Result<f64>;
}

/// Latest values of all postprocessors, by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostprocessorValues(BTreeMap<String, f64>);

impl PostprocessorValues {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Wraps a failing evaluator call with the evaluator's name.
pub(crate) fn evaluate<T, E>(evaluator: &E, result: eyre::Result<T>) -> Result<T>
where
    E: Evaluable + ?Sized,
{
    result.map_err(|report| SystemError::evaluation(evaluator.name(), report))
}
