//! Built-in initial conditions.
use crate::evaluators::{Evaluable, EvaluatorBase, InitialCondition};
use crate::factory::{Factory, SetupContext};
use crate::fe_data::PointContext;
use crate::variables::VariableRef;

pub(crate) fn register(factory: &mut Factory) {
    factory.register_initial_condition("ConstantIC", |ctx| Ok(Box::new(ConstantIc::new(ctx)?)));
    factory.register_initial_condition("FunctionIC", |ctx| Ok(Box::new(FunctionIc::new(ctx)?)));
}

#[derive(Debug, Clone)]
pub struct ConstantIc {
    base: EvaluatorBase,
    variable: VariableRef,
    value: f64,
}

impl ConstantIc {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.any_variable()?,
            value: ctx.params.real("value")?,
        })
    }
}

impl Evaluable for ConstantIc {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl InitialCondition for ConstantIc {
    fn variable(&self) -> VariableRef {
        self.variable
    }

    fn value(&mut self, _point: &PointContext) -> eyre::Result<f64> {
        Ok(self.value)
    }
}

/// Initial values sampled from a function at the start time.
#[derive(Debug, Clone)]
pub struct FunctionIc {
    base: EvaluatorBase,
    variable: VariableRef,
    function: String,
}

impl FunctionIc {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.any_variable()?,
            function: ctx.params.string("function")?.to_string(),
        })
    }
}

impl Evaluable for FunctionIc {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl InitialCondition for FunctionIc {
    fn variable(&self) -> VariableRef {
        self.variable
    }

    fn value(&mut self, point: &PointContext) -> eyre::Result<f64> {
        point.function_value(&self.function)
    }
}
