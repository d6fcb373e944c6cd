//! Storage of registered evaluators, replicated once per worker thread.
//!
//! Every registration is kept as a [`Registration`] record so that the replicas can be rebuilt
//! from scratch whenever the number of worker threads changes. Within a category, replicas
//! appear in registration order on every thread, so an index computed on one thread (see
//! [`ApplicabilityTables`]) is valid on all of them.
use crate::error::{Result, SystemError};
use crate::evaluators::{
    evaluate, AuxKernel, BoundaryCondition, Damper, DgKernel, Evaluable, Function, InitialCondition,
    IntegratedBc, Kernel, Material, NodalBc, Postprocessor, PostprocessorScope, Stabilizer,
};
use crate::factory::{Category, Factory, SetupContext};
use crate::fe_data::TimeView;
use crate::mesh::{BoundaryId, SubdomainId};
use crate::params::Parameters;
use crate::variables::{FeFamily, VariableId, VariableRegistry};
use itertools::Itertools;
use log::{debug, warn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Evaluators of one category on one thread, in registration order.
pub struct Warehouse<E: ?Sized> {
    entries: Vec<Box<E>>,
}

impl<E: ?Sized> Default for Warehouse<E> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<E: Evaluable + ?Sized> Warehouse<E> {
    pub fn push(&mut self, evaluator: Box<E>) {
        self.entries.push(evaluator);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&E> {
        self.entries.get(index).map(Box::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut E> {
        self.entries.get_mut(index).map(Box::as_mut)
    }

    /// The evaluator at `index`, which must come from an applicability table of this set.
    pub(crate) fn entry_mut(&mut self, index: usize) -> Result<&mut E> {
        let len = self.entries.len();
        self.entries
            .get_mut(index)
            .map(Box::as_mut)
            .ok_or_else(|| {
                SystemError::ContractViolation(format!(
                    "evaluator index {index} out of range for a warehouse of {len} entries"
                ))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.iter().map(Box::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.entries.iter_mut().map(Box::as_mut)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name() == name)
    }

    fn timestep_setup(&mut self, time: &TimeView) -> Result<()> {
        for evaluator in self.iter_mut() {
            let result = evaluator.timestep_setup(time);
            evaluate(&*evaluator, result)?;
        }
        Ok(())
    }
}

/// Functions on one thread, addressable by name.
#[derive(Default)]
pub struct FunctionWarehouse {
    functions: Warehouse<dyn Function>,
    by_name: FxHashMap<String, usize>,
}

impl FunctionWarehouse {
    pub fn push(&mut self, function: Box<dyn Function>) {
        self.by_name.insert(function.name().to_string(), self.functions.len());
        self.functions.push(function);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Function> {
        self.by_name
            .get(name)
            .and_then(|&index| self.functions.get(index))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// One worker's replica of every registered evaluator.
#[derive(Default)]
pub struct ThreadWarehouse {
    pub kernels: Warehouse<dyn Kernel>,
    pub dg_kernels: Warehouse<dyn DgKernel>,
    pub integrated_bcs: Warehouse<dyn IntegratedBc>,
    pub nodal_bcs: Warehouse<dyn NodalBc>,
    pub aux_kernels: Warehouse<dyn AuxKernel>,
    pub materials: Warehouse<dyn Material>,
    pub stabilizers: Warehouse<dyn Stabilizer>,
    pub initial_conditions: Warehouse<dyn InitialCondition>,
    pub postprocessors: Warehouse<dyn Postprocessor>,
    pub functions: FunctionWarehouse,
    pub dampers: Warehouse<dyn Damper>,
}

impl ThreadWarehouse {
    /// Runs the per-step setup hook of every evaluator except functions.
    pub fn timestep_setup(&mut self, time: &TimeView) -> Result<()> {
        self.kernels.timestep_setup(time)?;
        self.dg_kernels.timestep_setup(time)?;
        self.integrated_bcs.timestep_setup(time)?;
        self.nodal_bcs.timestep_setup(time)?;
        self.aux_kernels.timestep_setup(time)?;
        self.materials.timestep_setup(time)?;
        self.stabilizers.timestep_setup(time)?;
        self.initial_conditions.timestep_setup(time)?;
        self.postprocessors.timestep_setup(time)?;
        self.dampers.timestep_setup(time)
    }

    fn insert(&mut self, evaluator: Built) {
        match evaluator {
            Built::Kernel(e) => self.kernels.push(e),
            Built::DgKernel(e) => self.dg_kernels.push(e),
            Built::BoundaryCondition(BoundaryCondition::Integrated(e)) => self.integrated_bcs.push(e),
            Built::BoundaryCondition(BoundaryCondition::Nodal(e)) => self.nodal_bcs.push(e),
            Built::AuxKernel(e) => self.aux_kernels.push(e),
            Built::Material(e) => self.materials.push(e),
            Built::Stabilizer(e) => self.stabilizers.push(e),
            Built::InitialCondition(e) => self.initial_conditions.push(e),
            Built::Postprocessor(e) => self.postprocessors.push(e),
            Built::Function(e) => self.functions.push(e),
            Built::Damper(e) => self.dampers.push(e),
        }
    }
}

enum Built {
    Kernel(Box<dyn Kernel>),
    DgKernel(Box<dyn DgKernel>),
    BoundaryCondition(BoundaryCondition),
    AuxKernel(Box<dyn AuxKernel>),
    Material(Box<dyn Material>),
    Stabilizer(Box<dyn Stabilizer>),
    InitialCondition(Box<dyn InitialCondition>),
    Postprocessor(Box<dyn Postprocessor>),
    Function(Box<dyn Function>),
    Damper(Box<dyn Damper>),
}

fn build(factory: &Factory, registration: &Registration, ctx: &SetupContext) -> Result<Built> {
    let t = registration.type_name.as_str();
    Ok(match registration.category {
        Category::Kernel => Built::Kernel(factory.build_kernel(t, ctx)?),
        Category::DgKernel => Built::DgKernel(factory.build_dg_kernel(t, ctx)?),
        Category::BoundaryCondition => Built::BoundaryCondition(factory.build_boundary_condition(t, ctx)?),
        Category::AuxKernel => Built::AuxKernel(factory.build_aux_kernel(t, ctx)?),
        Category::Material => Built::Material(factory.build_material(t, ctx)?),
        Category::Stabilizer => Built::Stabilizer(factory.build_stabilizer(t, ctx)?),
        Category::InitialCondition => Built::InitialCondition(factory.build_initial_condition(t, ctx)?),
        Category::Postprocessor => Built::Postprocessor(factory.build_postprocessor(t, ctx)?),
        Category::Function => Built::Function(factory.build_function(t, ctx)?),
        Category::Damper => Built::Damper(factory.build_damper(t, ctx)?),
    })
}

/// A registration request, kept so that replicas can be rebuilt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub category: Category,
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    #[serde(default)]
    pub params: Parameters,
}

/// Evaluators of every category, replicated for each worker thread.
pub struct WarehouseSet {
    threads: Vec<ThreadWarehouse>,
    registrations: Vec<Registration>,
}

impl WarehouseSet {
    pub fn new(num_threads: usize) -> Self {
        Self {
            threads: (0..num_threads.max(1)).map(|_| ThreadWarehouse::default()).collect(),
            registrations: Vec::new(),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// Builds one replica of the evaluator per thread and stores them.
    ///
    /// Names are unique within a category. On failure nothing is stored.
    pub fn add(&mut self, factory: &Factory, registry: &VariableRegistry, registration: Registration) -> Result<()> {
        let duplicate = self
            .registrations
            .iter()
            .any(|r| r.category == registration.category && r.name == registration.name);
        if duplicate {
            return Err(SystemError::DuplicateName {
                category: registration.category.as_str(),
                name: registration.name,
            });
        }
        let replicas = (0..self.threads.len())
            .map(|thread| {
                let ctx = SetupContext {
                    name: &registration.name,
                    params: &registration.params,
                    variables: registry,
                    thread,
                };
                build(factory, &registration, &ctx)
            })
            .collect::<Result<Vec<_>>>()?;
        for (warehouse, replica) in self.threads.iter_mut().zip(replicas) {
            warehouse.insert(replica);
        }
        debug!(
            "registered {} `{}` of type {}",
            registration.category, registration.name, registration.type_name
        );
        self.registrations.push(registration);
        Ok(())
    }

    /// Discards every replica and rebuilds all registrations for a new number of threads.
    pub fn replicate(&mut self, factory: &Factory, registry: &VariableRegistry, num_threads: usize) -> Result<()> {
        let registrations = std::mem::take(&mut self.registrations);
        let previous = std::mem::take(&mut self.threads);
        self.threads = (0..num_threads.max(1)).map(|_| ThreadWarehouse::default()).collect();
        for registration in registrations.iter().cloned() {
            if let Err(err) = self.add(factory, registry, registration) {
                self.threads = previous;
                self.registrations = registrations;
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn thread(&self, index: usize) -> Result<&ThreadWarehouse> {
        let len = self.threads.len();
        self.threads
            .get(index)
            .ok_or(SystemError::ThreadIndexOutOfRange { index, len })
    }

    pub fn thread_mut(&mut self, index: usize) -> Result<&mut ThreadWarehouse> {
        let len = self.threads.len();
        self.threads
            .get_mut(index)
            .ok_or(SystemError::ThreadIndexOutOfRange { index, len })
    }

    pub fn threads(&self) -> &[ThreadWarehouse] {
        &self.threads
    }

    pub fn threads_mut(&mut self) -> &mut [ThreadWarehouse] {
        &mut self.threads
    }

    /// Every material property declared by some material, sorted and without duplicates.
    pub fn material_properties(&self) -> Vec<String> {
        self.threads
            .first()
            .map(|warehouse| {
                warehouse
                    .materials
                    .iter()
                    .flat_map(|m| m.declared_properties())
                    .sorted()
                    .dedup()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn timestep_setup(&mut self, time: &TimeView) -> Result<()> {
        self.threads
            .iter_mut()
            .try_for_each(|warehouse| warehouse.timestep_setup(time))
    }

    /// Computes which evaluators apply where.
    pub fn build_tables(
        &self,
        registry: &VariableRegistry,
        subdomains: &BTreeSet<SubdomainId>,
        boundaries: &BTreeSet<BoundaryId>,
    ) -> Result<ApplicabilityTables> {
        let warehouse = self.thread(0)?;
        ApplicabilityTables::build(warehouse, registry, subdomains, boundaries)
    }
}

/// Evaluator indices applicable on one subdomain, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubdomainTable {
    pub variables: Vec<VariableId>,
    pub kernels: Vec<usize>,
    pub dg_kernels: Vec<usize>,
    pub stabilizers: Vec<usize>,
    pub materials: Vec<usize>,
    pub elemental_aux: Vec<usize>,
    pub nodal_aux: Vec<usize>,
    pub dampers: Vec<usize>,
    pub element_postprocessors: Vec<usize>,
    pub nodal_postprocessors: Vec<usize>,
}

/// Precomputed lookup of the evaluators that apply to each subdomain and boundary.
///
/// An evaluator applies to a subdomain when its block restriction admits the subdomain and the
/// variable it acts on is active there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicabilityTables {
    subdomains: BTreeMap<SubdomainId, SubdomainTable>,
    integrated_bcs: BTreeMap<BoundaryId, Vec<usize>>,
    nodal_bcs: BTreeMap<BoundaryId, Vec<usize>>,
    general_postprocessors: Vec<usize>,
}

impl ApplicabilityTables {
    fn build(
        warehouse: &ThreadWarehouse,
        registry: &VariableRegistry,
        subdomain_ids: &BTreeSet<SubdomainId>,
        boundary_ids: &BTreeSet<BoundaryId>,
    ) -> Result<Self> {
        let nonlinear_active = |var: VariableId, s: SubdomainId| {
            registry
                .variable(var)
                .map(|v| v.is_active_on(s))
                .unwrap_or(false)
        };

        let mut subdomains = BTreeMap::new();
        for &s in subdomain_ids {
            let mut table = SubdomainTable {
                variables: registry
                    .variables()
                    .iter()
                    .filter(|v| v.is_active_on(s))
                    .map(|v| VariableId(v.number))
                    .collect(),
                ..Default::default()
            };
            table.kernels = indices(warehouse.kernels.iter(), |k| {
                k.base().applies_to_block(s) && nonlinear_active(k.variable(), s)
            });
            table.dg_kernels = indices(warehouse.dg_kernels.iter(), |k| {
                k.base().applies_to_block(s) && nonlinear_active(k.variable(), s)
            });
            table.stabilizers = indices(warehouse.stabilizers.iter(), |k| {
                k.base().applies_to_block(s) && nonlinear_active(k.variable(), s)
            });
            table.materials = indices(warehouse.materials.iter(), |m| m.base().applies_to_block(s));
            for (index, aux) in warehouse.aux_kernels.iter().enumerate() {
                let variable = registry
                    .aux_variable(aux.variable())
                    .ok_or_else(|| SystemError::Unknown {
                        category: "auxiliary variable",
                        name: format!("#{}", aux.variable().0),
                    })?;
                if !(aux.base().applies_to_block(s) && variable.is_active_on(s)) {
                    continue;
                }
                match variable.fe_type.family {
                    FeFamily::Lagrange => table.nodal_aux.push(index),
                    FeFamily::Monomial => table.elemental_aux.push(index),
                }
            }
            table.dampers = indices(warehouse.dampers.iter(), |d| d.base().applies_to_block(s));
            table.element_postprocessors = indices(warehouse.postprocessors.iter(), |p| {
                p.scope() == PostprocessorScope::Element && p.base().applies_to_block(s)
            });
            table.nodal_postprocessors = indices(warehouse.postprocessors.iter(), |p| {
                p.scope() == PostprocessorScope::Nodal && p.base().applies_to_block(s)
            });

            for var in &table.variables {
                let covered = table.kernels.iter().any(|&k| {
                    warehouse
                        .kernels
                        .get(k)
                        .map(|k| k.variable() == *var)
                        .unwrap_or(false)
                });
                if !covered {
                    warn!("variable #{} has no kernel on subdomain {s}", var.0);
                }
            }
            subdomains.insert(s, table);
        }

        let mut integrated_bcs = BTreeMap::new();
        let mut nodal_bcs = BTreeMap::new();
        for &b in boundary_ids {
            integrated_bcs.insert(
                b,
                indices(warehouse.integrated_bcs.iter(), |bc| bc.base().applies_to_boundary(b)),
            );
            nodal_bcs.insert(
                b,
                indices(warehouse.nodal_bcs.iter(), |bc| bc.base().applies_to_boundary(b)),
            );
        }
        for bc in warehouse.integrated_bcs.iter().map(|bc| bc.base()).chain(
            warehouse.nodal_bcs.iter().map(|bc| bc.base()),
        ) {
            if let Some(b) = bc.boundaries.iter().find(|b| !boundary_ids.contains(b)) {
                warn!("boundary condition `{}` refers to boundary {b}, which the mesh does not have", bc.name);
            }
        }

        let general_postprocessors = indices(warehouse.postprocessors.iter(), |p| {
            p.scope() == PostprocessorScope::General
        });

        Ok(Self {
            subdomains,
            integrated_bcs,
            nodal_bcs,
            general_postprocessors,
        })
    }

    pub fn subdomain(&self, subdomain: SubdomainId) -> Option<&SubdomainTable> {
        self.subdomains.get(&subdomain)
    }

    pub fn subdomains(&self) -> impl Iterator<Item = (SubdomainId, &SubdomainTable)> {
        self.subdomains.iter().map(|(&s, t)| (s, t))
    }

    pub fn integrated_bcs(&self, boundary: BoundaryId) -> &[usize] {
        self.integrated_bcs
            .get(&boundary)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn nodal_bcs(&self, boundary: BoundaryId) -> &[usize] {
        self.nodal_bcs.get(&boundary).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn general_postprocessors(&self) -> &[usize] {
        &self.general_postprocessors
    }

    /// Whether any nodal auxiliary kernel applies anywhere.
    pub fn has_nodal_aux(&self) -> bool {
        self.subdomains.values().any(|t| !t.nodal_aux.is_empty())
    }
}

fn indices<'a, E: ?Sized + 'a>(iter: impl Iterator<Item = &'a E>, predicate: impl Fn(&E) -> bool) -> Vec<usize> {
    iter.enumerate()
        .filter(|(_, e)| predicate(e))
        .map(|(i, _)| i)
        .collect()
}
