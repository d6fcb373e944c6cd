//! Built-in auxiliary kernels.
use crate::evaluators::{AuxKernel, Evaluable, EvaluatorBase};
use crate::factory::{Factory, SetupContext};
use crate::fe_data::QpContext;
use crate::variables::{AuxVariableId, CoupledVariableId};

pub(crate) fn register(factory: &mut Factory) {
    factory.register_aux_kernel("ConstantAux", |ctx| Ok(Box::new(ConstantAux::new(ctx)?)));
    factory.register_aux_kernel("FunctionAux", |ctx| Ok(Box::new(FunctionAux::new(ctx)?)));
    factory.register_aux_kernel("CoupledValueAux", |ctx| Ok(Box::new(CoupledValueAux::new(ctx)?)));
    factory.register_aux_kernel("MaterialRealAux", |ctx| Ok(Box::new(MaterialRealAux::new(ctx)?)));
}

#[derive(Debug, Clone)]
pub struct ConstantAux {
    base: EvaluatorBase,
    variable: AuxVariableId,
    value: f64,
}

impl ConstantAux {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.aux_variable()?,
            value: ctx.params.real_or("value", 0.0)?,
        })
    }
}

impl Evaluable for ConstantAux {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl AuxKernel for ConstantAux {
    fn variable(&self) -> AuxVariableId {
        self.variable
    }

    fn compute_value(&mut self, _qp: &QpContext) -> eyre::Result<f64> {
        Ok(self.value)
    }
}

/// Samples a function at the current point and time.
#[derive(Debug, Clone)]
pub struct FunctionAux {
    base: EvaluatorBase,
    variable: AuxVariableId,
    function: String,
}

impl FunctionAux {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.aux_variable()?,
            function: ctx.params.string("function")?.to_string(),
        })
    }
}

impl Evaluable for FunctionAux {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl AuxKernel for FunctionAux {
    fn variable(&self) -> AuxVariableId {
        self.variable
    }

    fn compute_value(&mut self, qp: &QpContext) -> eyre::Result<f64> {
        qp.function_value(&self.function)
    }
}

/// `coef · v` for a coupled variable `v`.
#[derive(Debug, Clone)]
pub struct CoupledValueAux {
    base: EvaluatorBase,
    variable: AuxVariableId,
    coupled: CoupledVariableId,
    coef: f64,
}

impl CoupledValueAux {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.aux_variable()?,
            coupled: ctx.coupled("v")?,
            coef: ctx.params.real_or("coef", 1.0)?,
        })
    }
}

impl Evaluable for CoupledValueAux {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl AuxKernel for CoupledValueAux {
    fn variable(&self) -> AuxVariableId {
        self.variable
    }

    fn compute_value(&mut self, qp: &QpContext) -> eyre::Result<f64> {
        Ok(self.coef * qp.coupled_value(self.coupled))
    }
}

/// Copies a material property into an elemental auxiliary variable.
#[derive(Debug, Clone)]
pub struct MaterialRealAux {
    base: EvaluatorBase,
    variable: AuxVariableId,
    property: String,
}

impl MaterialRealAux {
    pub fn new(ctx: &SetupContext) -> eyre::Result<Self> {
        Ok(Self {
            base: ctx.base()?,
            variable: ctx.aux_variable()?,
            property: ctx.params.string("property")?.to_string(),
        })
    }
}

impl Evaluable for MaterialRealAux {
    fn base(&self) -> &EvaluatorBase {
        &self.base
    }
}

impl AuxKernel for MaterialRealAux {
    fn variable(&self) -> AuxVariableId {
        self.variable
    }

    fn compute_value(&mut self, qp: &QpContext) -> eyre::Result<f64> {
        qp.material(&self.property)
    }
}
