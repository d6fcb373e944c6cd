//! Built-in postprocessors.
use crate::evaluators::{Aggregation, Evaluable, EvaluatorBase, PartialValue, Postprocessor, PostprocessorScope};
use crate::factory::{Factory, SetupContext};
use crate::fe_data::{EvalEnv, QpContext};
use crate::variables::CoupledVariableId;

pub(crate) fn register(factory: &mut Factory) {
    factory.register_postprocessor("ElementIntegralVariable", |ctx| {
        Ok(Box::new(ElementIntegral::variable(ctx, Aggregation::Sum)?))
    });
    factory.register_postprocessor("ElementAverageValue", |ctx| {
        Ok(Box::new(ElementIntegral::variable(ctx, Aggregation::Average)?))
    });
    factory.register_postprocessor("ElementIntegralMaterialProperty", |ctx| {
        Ok(Box::new(ElementIntegral::material(ctx)?))
    });
    factory.register_postprocessor("NodalMaxValue", |ctx| Ok(Box::new(NodalMaxValue::new(ctx)?)));
    factory.register_postprocessor("TimestepSize", |ctx| Ok(Box::new(TimestepSize::new(ctx)?)));
}

#[derive(Debug, Clone)]
enum Integrand {
    Variable(CoupledVariableId),
    Material(String),
}

/// Integral (or integral average) of a variable or material property over active elements.
#[derive(Debug, Clone)]
pub struct ElementIntegral {
    base: EvaluatorBase,
    integrand: Integrand,
    aggregation: Aggregation,
    integral: f64,
    volume: f64,
}

impl ElementIntegral {
    pub fn variable(ctx: &SetupContext, aggregation: Aggregation) -> eyre::Result<Self> {
        let var = ctx.any_variable()?;
        Ok(Self {
            base: ctx.base()?,
            integrand: Integrand::Variable(ctx.coupled_id(var)),
            aggregation,
            integral: 0.0,
            volume: 0.0,
        })
    }

    pub fn material(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            integrand: Integrand::Material(ctx.params.string("property")?.to_string()),
            aggregation: Aggregation::Sum,
            integral: 0.0,
            volume: 0.0,
        })
    }
}

impl Evaluable for ElementIntegral {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Postprocessor for ElementIntegral {
    fn scope(&self) -> PostprocessorScope {
        PostprocessorScope::Element
    }

    fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    fn initialize(&mut self) {
        self.integral = 0.0;
        self.volume = 0.0;
    }

    fn execute_qp(&mut self, qp: &QpContext) -> eyre::Result<()> {
        let value = match &self.integrand {
            Integrand::Variable(var) => qp.coupled_value(*var),
            Integrand::Material(name) => qp.material(name)?,
        };
        self.integral += qp.jxw() * value;
        self.volume += qp.jxw();
        Ok(())
    }

    fn partial(&self) -> PartialValue {
        PartialValue {
            value: self.integral,
            weight: self.volume,
        }
    }
}

/// Maximum nodal value of a Lagrange variable.
#[derive(Debug, Clone)]
pub struct NodalMaxValue {
    base: EvaluatorBase,
    variable: CoupledVariableId,
    max: f64,
    count: usize,
}

impl NodalMaxValue {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        let var = ctx.any_variable()?;
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.coupled_id(var),
            max: f64::NEG_INFINITY,
            count: 0,
        })
    }
}

impl Evaluable for NodalMaxValue {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Postprocessor for NodalMaxValue {
    fn scope(&self) -> PostprocessorScope {
        PostprocessorScope::Nodal
    }

    fn aggregation(&self) -> Aggregation {
        Aggregation::Max
    }

    fn initialize(&mut self) {
        self.max = f64::NEG_INFINITY;
        self.count = 0;
    }

    fn execute_qp(&mut self, qp: &QpContext) -> eyre::Result<()> {
        if qp.coupled(self.variable).is_active() {
            self.max = self.max.max(qp.coupled_value(self.variable));
            self.count += 1;
        }
        Ok(())
    }

    fn partial(&self) -> PartialValue {
        PartialValue {
            value: self.max,
            weight: self.count as f64,
        }
    }
}

/// The current time step size.
#[derive(Debug, Clone)]
pub struct TimestepSize {
    base: EvaluatorBase,
}

impl TimestepSize {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self { base: ctx.base()? })
    }
}

impl Evaluable for TimestepSize {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl Postprocessor for TimestepSize {
    fn scope(&self) -> PostprocessorScope {
        PostprocessorScope::General
    }

    fn aggregation(&self) -> Aggregation {
        Aggregation::Sum
    }

    fn execute_general(&mut self, env: &EvalEnv) -> eyre::Result<f64> {
        Ok(env.time.dt)
    }
}
