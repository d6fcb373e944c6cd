//! Built-in boundary conditions.
use crate::evaluators::{BoundaryCondition, Evaluable, EvaluatorBase, IntegratedBc, NodalBc};
use crate::factory::{Factory, SetupContext};
use crate::fe_data::VariableQp;
use crate::variables::VariableId;
use eyre::eyre;

pub(crate) fn register(factory: &mut Factory) {
    factory.register_boundary_condition("DirichletBC", |ctx| {
        Ok(BoundaryCondition::Nodal(Box::new(DirichletBc::new(ctx)?)))
    });
    factory.register_boundary_condition("FunctionDirichletBC", |ctx| {
        Ok(BoundaryCondition::Nodal(Box::new(FunctionDirichletBc::new(ctx)?)))
    });
    factory.register_boundary_condition("NeumannBC", |ctx| {
        Ok(BoundaryCondition::Integrated(Box::new(NeumannBc::new(ctx)?)))
    });
    factory.register_boundary_condition("FunctionNeumannBC", |ctx| {
        Ok(BoundaryCondition::Integrated(Box::new(FunctionNeumannBc::new(ctx)?)))
    });
}

fn boundary_base(ctx: &SetupContext) -> eyre::Result<EvaluatorBase> {
    let base = ctx.base()?;
    if base.boundaries.is_empty() {
        return Err(eyre!("boundary conditions require a non-empty `boundary` parameter"));
    }
    Ok(base)
}

/// Enforces `u = value` at boundary nodes.
#[derive(Debug, Clone)]
pub struct DirichletBc {
    base: EvaluatorBase,
    variable: VariableId,
    value: f64,
}

impl DirichletBc {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: boundary_base(ctx)?,
            variable: ctx.variable()?,
            value: ctx.params.real_or("value", 0.0)?,
        })
    }
}

impl Evaluable for DirichletBc {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl NodalBc for DirichletBc {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp) -> eyre::Result<f64> {
        Ok(qp.u() - self.value)
    }
}

/// Enforces `u = f(t, x)` at boundary nodes.
#[derive(Debug, Clone)]
pub struct FunctionDirichletBc {
    base: EvaluatorBase,
    variable: VariableId,
    function: String,
}

impl FunctionDirichletBc {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: boundary_base(ctx)?,
            variable: ctx.variable()?,
            function: ctx.params.string("function")?.to_string(),
        })
    }
}

impl Evaluable for FunctionDirichletBc {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl NodalBc for FunctionDirichletBc {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp) -> eyre::Result<f64> {
        Ok(qp.u() - qp.function_value(&self.function)?)
    }
}

/// Prescribes the flux `∇u · n = value`, i.e. contributes `-∫ value · φ_i`.
#[derive(Debug, Clone)]
pub struct NeumannBc {
    base: EvaluatorBase,
    variable: VariableId,
    value: f64,
}

impl NeumannBc {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: boundary_base(ctx)?,
            variable: ctx.variable()?,
            value: ctx.params.real_or("value", 0.0)?,
        })
    }
}

impl Evaluable for NeumannBc {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl IntegratedBc for NeumannBc {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64> {
        Ok(-self.value * qp.phi(i))
    }
}

/// Prescribes the flux `∇u · n = f(t, x)`.
#[derive(Debug, Clone)]
pub struct FunctionNeumannBc {
    base: EvaluatorBase,
    variable: VariableId,
    function: String,
}

impl FunctionNeumannBc {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: boundary_base(ctx)?,
            variable: ctx.variable()?,
            function: ctx.params.string("function")?.to_string(),
        })
    }
}

impl Evaluable for FunctionNeumannBc {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl IntegratedBc for FunctionNeumannBc {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64> {
        Ok(-qp.function_value(&self.function)? * qp.phi(i))
    }
}
