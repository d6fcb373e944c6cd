//! Named, parameterized construction of evaluators.
use crate::error::{Result, SystemError};
use crate::evaluators::{
    aux_kernels, boundary_conditions, dampers, dg_kernels, functions, initial_conditions, kernels, materials,
    postprocessors, stabilizers, AuxKernel, BoundaryCondition, Damper, DgKernel, EvaluatorBase, Function,
    InitialCondition, Kernel, Material, Postprocessor, Stabilizer,
};
use crate::params::Parameters;
use crate::variables::{AuxVariableId, CoupledVariableId, VariableId, VariableRef, VariableRegistry};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Evaluator categories, in the order their warehouses are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Kernel,
    DgKernel,
    BoundaryCondition,
    AuxKernel,
    Material,
    Stabilizer,
    InitialCondition,
    Postprocessor,
    Function,
    Damper,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kernel => "kernel",
            Self::DgKernel => "DG kernel",
            Self::BoundaryCondition => "boundary condition",
            Self::AuxKernel => "auxiliary kernel",
            Self::Material => "material",
            Self::Stabilizer => "stabilizer",
            Self::InitialCondition => "initial condition",
            Self::Postprocessor => "postprocessor",
            Self::Function => "function",
            Self::Damper => "damper",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Construction-time view handed to evaluator builders.
///
/// Gives access to the parameters of the registration and resolves variable names. Builders run
/// once per worker thread; `thread` identifies the replica being built.
#[derive(Clone, Copy)]
pub struct SetupContext<'a> {
    pub name: &'a str,
    pub params: &'a Parameters,
    pub variables: &'a VariableRegistry,
    pub thread: usize,
}

impl<'a> SetupContext<'a> {
    pub fn base(&self) -> Result<EvaluatorBase> {
        EvaluatorBase::from_params(self.name, self.params)
    }

    /// The nonlinear variable named by the `variable` parameter.
    pub fn variable(&self) -> Result<VariableId> {
        self.variables.variable_number(self.params.string("variable")?)
    }

    /// The auxiliary variable named by the `variable` parameter.
    pub fn aux_variable(&self) -> Result<AuxVariableId> {
        self.variables.aux_variable_number(self.params.string("variable")?)
    }

    /// The variable of either family named by the `variable` parameter.
    pub fn any_variable(&self) -> Result<VariableRef> {
        let name = self.params.string("variable")?;
        self.variables.lookup(name).ok_or_else(|| SystemError::Unknown {
            category: "variable",
            name: name.to_string(),
        })
    }

    pub fn coupled_id(&self, var: VariableRef) -> CoupledVariableId {
        self.variables.coupled_id(var)
    }

    /// The variable of either family named by the given parameter.
    pub fn coupled(&self, key: &str) -> Result<CoupledVariableId> {
        self.variables.coupled_id_by_name(self.params.string(key)?)
    }

    pub fn coupled_list(&self, key: &str) -> Result<Vec<CoupledVariableId>> {
        self.params
            .string_list(key)?
            .iter()
            .map(|name| self.variables.coupled_id_by_name(name))
            .collect()
    }
}

/// Builds one replica of an evaluator.
pub type Builder<T> = Box<dyn Fn(&SetupContext) -> eyre::Result<T> + Send + Sync>;

struct BuilderRegistry<T> {
    builders: FxHashMap<String, Builder<T>>,
}

impl<T> Default for BuilderRegistry<T> {
    fn default() -> Self {
        Self {
            builders: FxHashMap::default(),
        }
    }
}

impl<T> BuilderRegistry<T> {
    fn register(&mut self, type_name: &str, builder: Builder<T>) {
        self.builders.insert(type_name.to_string(), builder);
    }

    fn build(&self, category: Category, type_name: &str, ctx: &SetupContext) -> Result<T> {
        let builder = self.builders.get(type_name).ok_or_else(|| SystemError::Unknown {
            category: category.as_str(),
            name: format!("type {type_name}"),
        })?;
        builder(ctx).map_err(|report| {
            SystemError::Setup(format!(
                "cannot construct {category} `{}` of type {type_name}: {report:#}",
                ctx.name
            ))
        })
    }

    fn contains(&self, type_name: &str) -> bool {
        self.builders.contains_key(type_name)
    }
}

/// Maps evaluator type names to builders, per category.
#[derive(Default)]
pub struct Factory {
    kernels: BuilderRegistry<Box<dyn Kernel>>,
    dg_kernels: BuilderRegistry<Box<dyn DgKernel>>,
    boundary_conditions: BuilderRegistry<BoundaryCondition>,
    aux_kernels: BuilderRegistry<Box<dyn AuxKernel>>,
    materials: BuilderRegistry<Box<dyn Material>>,
    stabilizers: BuilderRegistry<Box<dyn Stabilizer>>,
    initial_conditions: BuilderRegistry<Box<dyn InitialCondition>>,
    postprocessors: BuilderRegistry<Box<dyn Postprocessor>>,
    functions: BuilderRegistry<Box<dyn Function>>,
    dampers: BuilderRegistry<Box<dyn Damper>>,
}

macro_rules! register_method {
    ($method:ident, $field:ident, $ty:ty) => {
        pub fn $method<F>(&mut self, type_name: &str, builder: F)
        where
            F: Fn(&SetupContext) -> eyre::Result<$ty> + Send + Sync + 'static,
        {
            self.$field.register(type_name, Box::new(builder));
        }
    };
}

macro_rules! build_method {
    ($method:ident, $field:ident, $category:expr, $ty:ty) => {
        pub fn $method(&self, type_name: &str, ctx: &SetupContext) -> Result<$ty> {
            self.$field.build($category, type_name, ctx)
        }
    };
}

impl Factory {
    /// An empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with every built-in evaluator registered.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        kernels::register(&mut factory);
        dg_kernels::register(&mut factory);
        boundary_conditions::register(&mut factory);
        aux_kernels::register(&mut factory);
        materials::register(&mut factory);
        stabilizers::register(&mut factory);
        initial_conditions::register(&mut factory);
        postprocessors::register(&mut factory);
        functions::register(&mut factory);
        dampers::register(&mut factory);
        factory
    }

    register_method!(register_kernel, kernels, Box<dyn Kernel>);
    register_method!(register_dg_kernel, dg_kernels, Box<dyn DgKernel>);
    register_method!(register_boundary_condition, boundary_conditions, BoundaryCondition);
    register_method!(register_aux_kernel, aux_kernels, Box<dyn AuxKernel>);
    register_method!(register_material, materials, Box<dyn Material>);
    register_method!(register_stabilizer, stabilizers, Box<dyn Stabilizer>);
    register_method!(register_initial_condition, initial_conditions, Box<dyn InitialCondition>);
    register_method!(register_postprocessor, postprocessors, Box<dyn Postprocessor>);
    register_method!(register_function, functions, Box<dyn Function>);
    register_method!(register_damper, dampers, Box<dyn Damper>);

    build_method!(build_kernel, kernels, Category::Kernel, Box<dyn Kernel>);
    build_method!(build_dg_kernel, dg_kernels, Category::DgKernel, Box<dyn DgKernel>);
    build_method!(
        build_boundary_condition,
        boundary_conditions,
        Category::BoundaryCondition,
        BoundaryCondition
    );
    build_method!(build_aux_kernel, aux_kernels, Category::AuxKernel, Box<dyn AuxKernel>);
    build_method!(build_material, materials, Category::Material, Box<dyn Material>);
    build_method!(build_stabilizer, stabilizers, Category::Stabilizer, Box<dyn Stabilizer>);
    build_method!(
        build_initial_condition,
        initial_conditions,
        Category::InitialCondition,
        Box<dyn InitialCondition>
    );
    build_method!(
        build_postprocessor,
        postprocessors,
        Category::Postprocessor,
        Box<dyn Postprocessor>
    );
    build_method!(build_function, functions, Category::Function, Box<dyn Function>);
    build_method!(build_damper, dampers, Category::Damper, Box<dyn Damper>);

    /// Whether a builder is registered for the type name in the given category.
    pub fn has_type(&self, category: Category, type_name: &str) -> bool {
        match category {
            Category::Kernel => self.kernels.contains(type_name),
            Category::DgKernel => self.dg_kernels.contains(type_name),
            Category::BoundaryCondition => self.boundary_conditions.contains(type_name),
            Category::AuxKernel => self.aux_kernels.contains(type_name),
            Category::Material => self.materials.contains(type_name),
            Category::Stabilizer => self.stabilizers.contains(type_name),
            Category::InitialCondition => self.initial_conditions.contains(type_name),
            Category::Postprocessor => self.postprocessors.contains(type_name),
            Category::Function => self.functions.contains(type_name),
            Category::Damper => self.dampers.contains(type_name),
        }
    }
}
