//! Built-in stabilizers.
use crate::evaluators::{Evaluable, EvaluatorBase, Stabilizer};
use crate::factory::{Factory, SetupContext};
use crate::fe_data::VariableQp;
use crate::variables::VariableId;

pub(crate) fn register(factory: &mut Factory) {
    factory.register_stabilizer("ArtificialDiffusion", |ctx| {
        Ok(Box::new(ArtificialDiffusion::new(ctx)?))
    });
}

/// Isotropic artificial diffusion scaled with the element size: `∫ c h ∇u · ∇φ_i`.
#[derive(Debug, Clone)]
pub struct ArtificialDiffusion {
    base: EvaluatorBase,
    variable: VariableId,
    coef: f64,
}

impl ArtificialDiffusion {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.variable()?,
            coef: ctx.params.real_or("coef", 0.5)?,
        })
    }
}

impl Evaluable for ArtificialDiffusion {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Stabilizer for ArtificialDiffusion {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &VariableQp, i: usize) -> eyre::Result<f64> {
        Ok(self.coef * qp.element_size() * qp.grad_u().dot(qp.grad_phi(i)))
    }

    fn compute_qp_jacobian(&mut self, qp: &VariableQp, i: usize, j: usize) -> eyre::Result<f64> {
        Ok(self.coef * qp.element_size() * qp.grad_phi(j).dot(qp.grad_phi(i)))
    }
}
