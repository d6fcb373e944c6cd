//! Registry of nonlinear and auxiliary field variables.
//!
//! Nonlinear variables are numbered `0..N` in registration order, auxiliary variables `0..K`.
//! Whenever the two families have to be addressed together (coupling between a nonlinear
//! and an auxiliary field, off-diagonal Jacobian blocks), auxiliary variable `k` is remapped
//! to the coupled id `N + k`. The remapping is refreshed by
//! [`VariableRegistry::refresh_numbering`], which the thread data manager calls on every resize.
use crate::error::{Result, SystemError};
use crate::mesh::SubdomainId;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeFamily {
    Lagrange,
    Monomial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    Constant,
    First,
    Second,
}

/// Finite element family and order of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeType {
    pub family: FeFamily,
    pub order: Order,
}

impl FeType {
    /// Continuous, piecewise linear (bilinear on quadrilaterals).
    pub const LAGRANGE_FIRST: Self = Self {
        family: FeFamily::Lagrange,
        order: Order::First,
    };

    /// Piecewise constant, one value per element.
    pub const MONOMIAL_CONSTANT: Self = Self {
        family: FeFamily::Monomial,
        order: Order::Constant,
    };

    pub fn is_supported(&self) -> bool {
        *self == Self::LAGRANGE_FIRST || *self == Self::MONOMIAL_CONSTANT
    }
}

impl Default for FeType {
    fn default() -> Self {
        Self::LAGRANGE_FIRST
    }
}

impl fmt::Display for FeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.family, self.order)
    }
}

/// Id of a nonlinear (solved) variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableId(pub usize);

/// Id of an auxiliary variable within the auxiliary family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AuxVariableId(pub usize);

/// Id in the joint numbering of both families: nonlinear ids first, then auxiliary ids
/// offset by the number of nonlinear variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoupledVariableId(pub usize);

/// A variable of either family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableRef {
    Nonlinear(VariableId),
    Auxiliary(AuxVariableId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub number: usize,
    pub fe_type: FeType,
    /// Subdomains the variable lives on. `None` means every subdomain.
    pub subdomains: Option<BTreeSet<SubdomainId>>,
}

impl Variable {
    pub fn is_active_on(&self, subdomain: SubdomainId) -> bool {
        self.subdomains
            .as_ref()
            .map(|set| set.contains(&subdomain))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    nonlinear: Vec<Variable>,
    auxiliary: Vec<Variable>,
    names: FxHashMap<String, VariableRef>,
    aux_offset: usize,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_name(&mut self, name: &str, var: VariableRef) -> Result<()> {
        if self.names.contains_key(name) {
            return Err(SystemError::DuplicateName {
                category: "variable",
                name: name.to_string(),
            });
        }
        self.names.insert(name.to_string(), var);
        Ok(())
    }

    fn make_variable(
        name: &str,
        number: usize,
        fe_type: FeType,
        subdomains: Option<&[SubdomainId]>,
    ) -> Result<Variable> {
        if !fe_type.is_supported() {
            return Err(SystemError::UnsupportedFeType(fe_type.to_string()));
        }
        Ok(Variable {
            name: name.to_string(),
            number,
            fe_type,
            subdomains: subdomains.map(|ids| ids.iter().copied().collect()),
        })
    }

    /// Registers a nonlinear variable. Names are unique across both families.
    pub fn add_variable(
        &mut self,
        name: &str,
        fe_type: FeType,
        subdomains: Option<&[SubdomainId]>,
    ) -> Result<VariableId> {
        let id = VariableId(self.nonlinear.len());
        let variable = Self::make_variable(name, id.0, fe_type, subdomains)?;
        self.insert_name(name, VariableRef::Nonlinear(id))?;
        self.nonlinear.push(variable);
        self.aux_offset = self.nonlinear.len();
        Ok(id)
    }

    /// Registers an auxiliary variable. Names are unique across both families.
    pub fn add_aux_variable(
        &mut self,
        name: &str,
        fe_type: FeType,
        subdomains: Option<&[SubdomainId]>,
    ) -> Result<AuxVariableId> {
        let id = AuxVariableId(self.auxiliary.len());
        let variable = Self::make_variable(name, id.0, fe_type, subdomains)?;
        self.insert_name(name, VariableRef::Auxiliary(id))?;
        self.auxiliary.push(variable);
        Ok(id)
    }

    /// Recomputes the auxiliary offset from the current nonlinear variable count.
    pub fn refresh_numbering(&mut self) {
        self.aux_offset = self.nonlinear.len();
    }

    pub fn num_variables(&self) -> usize {
        self.nonlinear.len()
    }

    pub fn num_aux_variables(&self) -> usize {
        self.auxiliary.len()
    }

    pub fn num_coupled(&self) -> usize {
        self.aux_offset + self.auxiliary.len()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.nonlinear
    }

    pub fn aux_variables(&self) -> &[Variable] {
        &self.auxiliary
    }

    pub fn variable(&self, id: VariableId) -> Option<&Variable> {
        self.nonlinear.get(id.0)
    }

    pub fn aux_variable(&self, id: AuxVariableId) -> Option<&Variable> {
        self.auxiliary.get(id.0)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        matches!(self.names.get(name), Some(VariableRef::Nonlinear(_)))
    }

    pub fn has_aux_variable(&self, name: &str) -> bool {
        matches!(self.names.get(name), Some(VariableRef::Auxiliary(_)))
    }

    pub fn lookup(&self, name: &str) -> Option<VariableRef> {
        self.names.get(name).copied()
    }

    pub fn variable_number(&self, name: &str) -> Result<VariableId> {
        match self.lookup(name) {
            Some(VariableRef::Nonlinear(id)) => Ok(id),
            _ => Err(SystemError::Unknown {
                category: "variable",
                name: name.to_string(),
            }),
        }
    }

    pub fn aux_variable_number(&self, name: &str) -> Result<AuxVariableId> {
        match self.lookup(name) {
            Some(VariableRef::Auxiliary(id)) => Ok(id),
            _ => Err(SystemError::Unknown {
                category: "auxiliary variable",
                name: name.to_string(),
            }),
        }
    }

    /// The coupled id of the given auxiliary variable, `N + k`.
    pub fn modified_aux_var_num(&self, id: AuxVariableId) -> CoupledVariableId {
        CoupledVariableId(self.aux_offset + id.0)
    }

    pub fn coupled_id(&self, var: VariableRef) -> CoupledVariableId {
        match var {
            VariableRef::Nonlinear(id) => CoupledVariableId(id.0),
            VariableRef::Auxiliary(id) => self.modified_aux_var_num(id),
        }
    }

    pub fn coupled_id_by_name(&self, name: &str) -> Result<CoupledVariableId> {
        self.lookup(name)
            .map(|var| self.coupled_id(var))
            .ok_or_else(|| SystemError::Unknown {
                category: "variable",
                name: name.to_string(),
            })
    }

    /// Inverse of [`coupled_id`](Self::coupled_id).
    pub fn resolve(&self, id: CoupledVariableId) -> Option<VariableRef> {
        if id.0 < self.aux_offset {
            (id.0 < self.nonlinear.len()).then_some(VariableRef::Nonlinear(VariableId(id.0)))
        } else {
            let k = id.0 - self.aux_offset;
            (k < self.auxiliary.len()).then_some(VariableRef::Auxiliary(AuxVariableId(k)))
        }
    }

    pub fn get(&self, var: VariableRef) -> Option<&Variable> {
        match var {
            VariableRef::Nonlinear(id) => self.variable(id),
            VariableRef::Auxiliary(id) => self.aux_variable(id),
        }
    }

    /// Iterates over all variables of both families in coupled id order.
    pub fn iter_coupled(&self) -> impl Iterator<Item = (CoupledVariableId, VariableRef, &Variable)> {
        let nonlinear = self
            .nonlinear
            .iter()
            .enumerate()
            .map(|(i, var)| (CoupledVariableId(i), VariableRef::Nonlinear(VariableId(i)), var));
        let offset = self.aux_offset;
        let auxiliary = self.auxiliary.iter().enumerate().map(move |(k, var)| {
            (
                CoupledVariableId(offset + k),
                VariableRef::Auxiliary(AuxVariableId(k)),
                var,
            )
        });
        nonlinear.chain(auxiliary)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nonlinear
            .iter()
            .chain(self.auxiliary.iter())
            .map(|var| var.name.as_str())
    }
}
