//! Built-in dampers.
use crate::evaluators::{Damper, Evaluable, EvaluatorBase};
use crate::factory::{Factory, SetupContext};
use crate::fe_data::QpContext;
use crate::variables::{CoupledVariableId, VariableRef};
use eyre::eyre;

pub(crate) fn register(factory: &mut Factory) {
    factory.register_damper("ConstantDamper", |ctx| Ok(Box::new(ConstantDamper::new(ctx)?)));
    factory.register_damper("MaxIncrementDamper", |ctx| Ok(Box::new(MaxIncrementDamper::new(ctx)?)));
}

#[derive(Debug, Clone)]
pub struct ConstantDamper {
    base: EvaluatorBase,
    damping: f64,
}

impl ConstantDamper {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        let damping = ctx.params.real("damping")?;
        if !(damping > 0.0 && damping <= 1.0) {
            return Err(eyre!("damping {damping} must lie in (0, 1]"));
        }
        Ok(Self {
            base: ctx.base()?,
            damping,
        })
    }
}

impl Evaluable for ConstantDamper {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Damper for ConstantDamper {
    fn compute_qp_damping(&mut self, _qp: &QpContext) -> eyre::Result<f64> {
        Ok(self.damping)
    }
}

/// Scales the update so that the increment of a variable never exceeds `max_increment`.
#[derive(Debug, Clone)]
pub struct MaxIncrementDamper {
    base: EvaluatorBase,
    variable: CoupledVariableId,
    max_increment: f64,
}

impl MaxIncrementDamper {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        let max_increment = ctx.params.real("max_increment")?;
        if !(max_increment > 0.0) {
            return Err(eyre!("`max_increment` must be positive"));
        }
        let var = ctx.variable()?;
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.coupled_id(VariableRef::Nonlinear(var)),
            max_increment,
        })
    }
}

impl Evaluable for MaxIncrementDamper {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Damper for MaxIncrementDamper {
    fn compute_qp_damping(&mut self, qp: &QpContext) -> eyre::Result<f64> {
        let increment = qp.coupled_increment(self.variable).abs();
        if increment > self.max_increment {
            Ok(self.max_increment / increment)
        } else {
            Ok(1.0)
        }
    }
}
