//! Built-in interior face kernels.
use crate::evaluators::{DgJacobianType, DgKernel, DgQp, DgResidualType, Evaluable, EvaluatorBase};
use crate::factory::{Factory, SetupContext};
use crate::variables::VariableId;

pub(crate) fn register(factory: &mut Factory) {
    factory.register_dg_kernel("PenaltyJump", |ctx| Ok(Box::new(PenaltyJump::new(ctx)?)));
}

/// Penalizes the jump of a variable across interior faces: `∫ σ [u] [φ_i]`.
///
/// Only meaningful for discontinuous (monomial) variables; for continuous variables the jump
/// vanishes identically.
#[derive(Debug, Clone)]
pub struct PenaltyJump {
    base: EvaluatorBase,
    variable: VariableId,
    penalty: f64,
}

impl PenaltyJump {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.variable()?,
            penalty: ctx.params.real_or("penalty", 1.0)?,
        })
    }
}

impl Evaluable for PenaltyJump {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl DgKernel for PenaltyJump {
    fn variable(&self) -> VariableId {
        self.variable
    }

    fn compute_qp_residual(&mut self, qp: &DgQp, kind: DgResidualType, i: usize) -> eyre::Result<f64> {
        let jump = qp.element.u() - qp.neighbor.u();
        Ok(match kind {
            DgResidualType::Element => self.penalty * jump * qp.element.phi(i),
            DgResidualType::Neighbor => -self.penalty * jump * qp.neighbor.phi(i),
        })
    }

    fn compute_qp_jacobian(
        &mut self,
        qp: &DgQp,
        kind: DgJacobianType,
        i: usize,
        j: usize,
    ) -> eyre::Result<f64> {
        let (e, n) = (&qp.element, &qp.neighbor);
        Ok(self.penalty
            * match kind {
                DgJacobianType::ElementElement => e.phi(j) * e.phi(i),
                DgJacobianType::ElementNeighbor => -n.phi(j) * e.phi(i),
                DgJacobianType::NeighborElement => -e.phi(j) * n.phi(i),
                DgJacobianType::NeighborNeighbor => n.phi(j) * n.phi(i),
            })
    }
}
