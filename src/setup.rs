//! Declarative problem setup read from JSON.
//!
//! ```json
//! {
//!   "variables": [{ "name": "u", "fe_type": { "family": "Lagrange", "order": "First" } }],
//!   "registrations": [
//!     { "category": "Kernel", "type": "Diffusion", "name": "diff", "params": { "variable": "u" } }
//!   ]
//! }
//! ```
use crate::error::Result;
use crate::mesh::SubdomainId;
use crate::system::CoupledSystem;
use crate::variables::FeType;
use crate::warehouse::Registration;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub fe_type: FeType,
    #[serde(default)]
    pub blocks: Option<Vec<SubdomainId>>,
}

/// Variables and evaluators of a problem, applied to a system in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemSetup {
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub aux_variables: Vec<VariableSpec>,
    /// Names of the displacement variables driving a displaced mesh, one per dimension.
    #[serde(default)]
    pub displacements: Option<Vec<String>>,
    #[serde(default)]
    pub registrations: Vec<Registration>,
}

impl ProblemSetup {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Adds every variable and registration to an uninitialized system.
    pub fn apply(&self, system: &mut CoupledSystem) -> Result<()> {
        for var in &self.variables {
            system.add_variable(&var.name, var.fe_type, var.blocks.as_deref())?;
        }
        for var in &self.aux_variables {
            system.add_aux_variable(&var.name, var.fe_type, var.blocks.as_deref())?;
        }
        if let Some(names) = &self.displacements {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            system.init_displaced_mesh(&names)?;
        }
        for registration in &self.registrations {
            debug!(
                "registering {} `{}` of type {}",
                registration.category.as_str(),
                registration.name,
                registration.type_name
            );
            system.register(
                registration.category,
                &registration.type_name,
                &registration.name,
                registration.params.clone(),
            )?;
        }
        Ok(())
    }
}
