//! Built-in volumetric kernels.
use crate::evaluators::{Evaluable, EvaluatorBase, Kernel};
use crate::factory::{Factory, SetupContext};
use crate::fe_data::VariableQp;
use crate::variables::{CoupledVariableId, VariableId};

pub(crate) fn register(factory: &mut Factory) {
    factory.register_kernel("Diffusion", |ctx| Ok(Box::new(Diffusion::new(ctx)?)));
    factory.register_kernel("MatDiffusion", |ctx| Ok(Box::new(MatDiffusion::new(ctx)?)));
    factory.register_kernel("BodyForce", |ctx| Ok(Box::new(BodyForce::new(ctx)?)));
    factory.register_kernel("TimeDerivative", |ctx| Ok(Box::new(TimeDerivative::new(ctx)?)));
    factory.register_kernel("CoupledForce", |ctx| Ok(Box::new(CoupledForce::new(ctx)?)));
    factory.register_kernel("Reaction", |ctx| Ok(Box::new(Reaction::new(ctx)?)));
    factory.register_kernel("PostprocessorSource", |ctx| {
        Ok(Box::new(PostprocessorSource::new(ctx)?))
    });
}

/// `∫ ∇u · ∇φ_i`.
#[derive(Debug, Clone)]
pub struct Diffusion {
    base: EvaluatorBase,
    variable: VariableId,
}

impl Diffusion {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.variable()?,
        })
    }
}

impl Evaluable for Diffusion {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Kernel for Diffusion {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64> {
        Ok(qp.grad_u().dot(qp.grad_phi(i)))
    }

    fn compute_qp_jacobian(&mut self, qp: &VariableQp, i: usize, j: usize) -> eyre::Result<f64> {
        Ok(qp.grad_phi(j).dot(qp.grad_phi(i)))
    }
}

/// `∫ D ∇u · ∇φ_i` with the diffusivity `D` taken from a material property.
#[derive(Debug, Clone)]
pub struct MatDiffusion {
    base: EvaluatorBase,
    variable: VariableId,
    diffusivity: String,
}

impl MatDiffusion {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.variable()?,
            diffusivity: ctx
                .params
                .optional_string("diffusivity")?
                .unwrap_or("diffusivity")
                .to_string(),
        })
    }
}

impl Evaluable for MatDiffusion {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Kernel for MatDiffusion {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64> {
        let d = qp.material(&self.diffusivity)?;
        Ok(d * qp.grad_u().dot(qp.grad_phi(i)))
    }

    fn compute_qp_jacobian(&mut self, qp: &VariableQp, i: usize, j: usize) -> eyre::Result<f64> {
        let d = qp.material(&self.diffusivity)?;
        Ok(d * qp.grad_phi(j).dot(qp.grad_phi(i)))
    }
}

/// `-∫ value · f(t, x) · φ_i`, where `f` is an optional function (one if absent).
#[derive(Debug, Clone)]
pub struct BodyForce {
    base: EvaluatorBase,
    variable: VariableId,
    value: f64,
    function: Option<String>,
}

impl BodyForce {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.variable()?,
            value: ctx.params.real_or("value", 1.0)?,
            function: ctx.params.optional_string("function")?.map(str::to_string),
        })
    }
}

impl Evaluable for BodyForce {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Kernel for BodyForce {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64> {
        let f = match &self.function {
            Some(name) => qp.function_value(name)?,
            None => 1.0,
        };
        Ok(-self.value * f * qp.phi(i))
    }
}

/// `∫ u̇ φ_i`.
#[derive(Debug, Clone)]
pub struct TimeDerivative {
    base: EvaluatorBase,
    variable: VariableId,
}

impl TimeDerivative {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.variable()?,
        })
    }
}

impl Evaluable for TimeDerivative {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Kernel for TimeDerivative {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64> {
        Ok(qp.u_dot() * qp.phi(i))
    }

    fn compute_qp_jacobian(&mut self, qp: &VariableQp, i: usize, j: usize) -> eyre::Result<f64> {
        Ok(qp.du_dot_du() * qp.phi(j) * qp.phi(i))
    }
}

/// `-∫ coef · v · φ_i` for a coupled variable `v` of either family.
#[derive(Debug, Clone)]
pub struct CoupledForce {
    base: EvaluatorBase,
    variable: VariableId,
    coupled: [CoupledVariableId; 1],
    coef: f64,
}

impl CoupledForce {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.variable()?,
            coupled: [ctx.coupled("v")?],
            coef: ctx.params.real_or("coef", 1.0)?,
        })
    }
}

impl Evaluable for CoupledForce {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Kernel for CoupledForce {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn coupled_variables(&self) -> &[CoupledVariableId] {
        &self.coupled
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64> {
        Ok(-self.coef * qp.coupled_value(self.coupled[0]) * qp.phi(i))
    }

    fn compute_qp_off_diag_jacobian(
        &mut self,
        qp: &VariableQp,
        i: usize,
        j: usize,
        jvar: CoupledVariableId,
    ) -> eyre::Result<f64> {
        if jvar == self.coupled[0] {
            Ok(-self.coef * qp.coupled_phi(jvar, j) * qp.phi(i))
        } else {
            Ok(0.0)
        }
    }
}

/// `∫ rate · u · φ_i`.
#[derive(Debug, Clone)]
pub struct Reaction {
    base: EvaluatorBase,
    variable: VariableId,
    rate: f64,
}

impl Reaction {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.variable()?,
            rate: ctx.params.real_or("rate", 1.0)?,
        })
    }
}

impl Evaluable for Reaction {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Kernel for Reaction {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64> {
        Ok(self.rate * qp.u() * qp.phi(i))
    }

    fn compute_qp_jacobian(&mut self, qp: &VariableQp, i: usize, j: usize) -> eyre::Result<f64> {
        Ok(self.rate * qp.phi(j) * qp.phi(i))
    }
}

/// `-∫ coef · p · φ_i` where `p` is the latest value of a postprocessor.
#[derive(Debug, Clone)]
pub struct PostprocessorSource {
    base: EvaluatorBase,
    variable: VariableId,
    postprocessor: String,
    coef: f64,
}

impl PostprocessorSource {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.variable()?,
            postprocessor: ctx.params.string("postprocessor")?.to_string(),
            coef: ctx.params.real_or("coef", 1.0)?,
        })
    }
}

impl Evaluable for PostprocessorSource {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Kernel for PostprocessorSource {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64> {
        Ok(-self.coef * qp.postprocessor(&self.postprocessor)? * qp.phi(i))
    }
}
