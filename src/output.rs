//! Output of solution snapshots to external writers.
use crate::dofs::DofMap;
use crate::error::Result;
use crate::evaluators::PostprocessorValues;
use crate::mesh::Mesh;
use crate::variables::{FeFamily, VariableRef, VariableRegistry};
use nalgebra::DVector;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

/// Everything a writer may persist for one output step.
pub struct OutputSnapshot<'a> {
    pub step: usize,
    pub time: f64,
    pub mesh: &'a Mesh,
    pub registry: &'a VariableRegistry,
    pub dofs: &'a DofMap,
    pub aux_dofs: &'a DofMap,
    pub solution: &'a DVector<f64>,
    pub aux_solution: &'a DVector<f64>,
    pub postprocessors: &'a PostprocessorValues,
    /// Whether the mesh changed since the previous output.
    pub mesh_changed: bool,
}

impl<'a> OutputSnapshot<'a> {
    /// Values of a variable per vertex (nodal variables) or per element (elemental variables).
    ///
    /// Entities without a dof for the variable are reported as `None`.
    pub fn values(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let (dofs, number, vector) = match self.registry.lookup(name)? {
            VariableRef::Nonlinear(v) => (self.dofs, v.0, self.solution),
            VariableRef::Auxiliary(a) => (self.aux_dofs, a.0, self.aux_solution),
        };
        let values = match dofs.variable(number).family() {
            FeFamily::Lagrange => (0..self.mesh.num_vertices())
                .map(|node| dofs.node_dof(number, node).map(|d| vector[d]))
                .collect(),
            FeFamily::Monomial => (0..self.mesh.num_elements())
                .map(|element| dofs.element_dof(number, element).map(|d| vector[d]))
                .collect(),
        };
        Some(values)
    }
}

/// A consumer of output snapshots, such as a file writer.
pub trait SolutionWriter: Send {
    fn write(&mut self, snapshot: &OutputSnapshot) -> Result<()>;
}

/// Postprocessor values recorded at one output step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostprocessorRow {
    pub step: usize,
    pub time: f64,
    pub values: PostprocessorValues,
}

/// Collects postprocessor values of every output step.
///
/// Clones share the same storage, so a handle kept by the caller observes what the system
/// writes into the registered copy.
#[derive(Debug, Clone, Default)]
pub struct PostprocessorHistory {
    rows: Arc<Mutex<Vec<PostprocessorRow>>>,
}

impl PostprocessorHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<PostprocessorRow> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&*self.rows.lock())?)
    }
}

impl SolutionWriter for PostprocessorHistory {
    fn write(&mut self, snapshot: &OutputSnapshot) -> Result<()> {
        self.rows.lock().push(PostprocessorRow {
            step: snapshot.step,
            time: snapshot.time,
            values: snapshot.postprocessors.clone(),
        });
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    step: usize,
    time: f64,
    mesh_changed: bool,
    num_vertices: usize,
    num_elements: usize,
    variables: BTreeMap<&'a str, Vec<Option<f64>>>,
    postprocessors: &'a PostprocessorValues,
}

/// Writes one JSON document per snapshot and line.
pub struct JsonLinesWriter<W> {
    writer: W,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> SolutionWriter for JsonLinesWriter<W> {
    fn write(&mut self, snapshot: &OutputSnapshot) -> Result<()> {
        let variables = snapshot
            .registry
            .names()
            .filter_map(|name| snapshot.values(name).map(|values| (name, values)))
            .collect();
        let record = JsonRecord {
            step: snapshot.step,
            time: snapshot.time,
            mesh_changed: snapshot.mesh_changed,
            num_vertices: snapshot.mesh.num_vertices(),
            num_elements: snapshot.mesh.num_elements(),
            variables,
            postprocessors: snapshot.postprocessors,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
