//! Evaluation buffers for elements, sides and nodes, and the read-only views handed to
//! evaluators.
//!
//! An [`FeData`] holds, for one element (or side, or node) at a time, the mapped quadrature
//! points and weights together with shape functions and interpolated values of every variable
//! in coupled id order. Evaluators never see the buffers directly; they receive a
//! [`QpContext`] or [`VariableQp`] pinned to a single quadrature point.
use crate::dofs::DofMap;
use crate::element::{
    element_diameter, evaluate_at, outward_normal, side_measure_factor, side_reference_point, PointEvaluation,
    MAX_NODES,
};
use crate::error::{Result, SystemError};
use crate::evaluators::{Function, PostprocessorValues};
use crate::mesh::{InteriorFace, Mesh, SubdomainId};
use crate::quadrature::{QuadratureRule, QuadratureTable};
use crate::variables::{CoupledVariableId, FeFamily, VariableRef, VariableRegistry};
use crate::warehouse::FunctionWarehouse;
use eyre::eyre;
use nalgebra::{DVector, Point3, Vector3};
use rustc_hash::FxHashMap;
use std::ops::Deref;

/// Time information visible to evaluators.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeView {
    pub time: f64,
    pub time_old: f64,
    pub dt: f64,
    pub dt_old: f64,
    pub t_step: usize,
    pub transient: bool,
}

/// The vectors an evaluation pass interpolates from.
#[derive(Debug, Clone, Copy)]
pub struct SolutionView<'a> {
    pub current: &'a DVector<f64>,
    pub aux: &'a DVector<f64>,
    pub u_dot: Option<&'a DVector<f64>>,
    pub du_dot_du: f64,
    pub old: Option<&'a DVector<f64>>,
    pub older: Option<&'a DVector<f64>>,
    /// Proposed solution update, only present in damping passes.
    pub increment: Option<&'a DVector<f64>>,
}

/// Everything needed to reinitialize evaluation buffers.
#[derive(Debug, Clone, Copy)]
pub struct FeInputs<'a> {
    pub mesh: &'a Mesh,
    /// Vertex positions to evaluate against, either reference or displaced.
    pub vertices: &'a [Point3<f64>],
    pub registry: &'a VariableRegistry,
    pub dofs: &'a DofMap,
    pub aux_dofs: &'a DofMap,
    pub quadrature: &'a QuadratureTable,
    pub solution: SolutionView<'a>,
}

impl<'a> FeInputs<'a> {
    /// The same inputs evaluated against a different geometry.
    pub fn with_vertices(&self, vertices: &'a [Point3<f64>]) -> Self {
        Self { vertices, ..*self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeDataKind {
    Element,
    Side,
    NeighborSide,
    Node,
}

/// Shape functions and interpolated values of one variable.
#[derive(Debug, Clone, Default)]
pub struct VariableValues {
    active: bool,
    dofs: Vec<usize>,
    phi: Vec<Vec<f64>>,
    grad_phi: Vec<Vec<Vector3<f64>>>,
    u: Vec<f64>,
    grad_u: Vec<Vector3<f64>>,
    u_old: Vec<f64>,
    u_older: Vec<f64>,
    u_dot: Vec<f64>,
    du_dot_du: f64,
    increment: Vec<f64>,
}

impl VariableValues {
    fn prepare(&mut self, num_qp: usize) {
        let n = self.dofs.len();
        self.active = n > 0;
        self.phi.resize_with(n, Vec::new);
        self.grad_phi.resize_with(n, Vec::new);
        for (phi, grad) in self.phi.iter_mut().zip(&mut self.grad_phi) {
            phi.clear();
            phi.resize(num_qp, 0.0);
            grad.clear();
            grad.resize(num_qp, Vector3::zeros());
        }
        for buffer in [
            &mut self.u,
            &mut self.u_old,
            &mut self.u_older,
            &mut self.u_dot,
            &mut self.increment,
        ] {
            buffer.clear();
            buffer.resize(num_qp, 0.0);
        }
        self.grad_u.clear();
        self.grad_u.resize(num_qp, Vector3::zeros());
        self.du_dot_du = 0.0;
    }

    fn interpolate(&mut self, solution: &SolutionView, nonlinear: bool) {
        let vector = if nonlinear { solution.current } else { solution.aux };
        let num_qp = self.u.len();
        for qp in 0..num_qp {
            let mut u = 0.0;
            let mut grad_u = Vector3::zeros();
            let mut u_old = 0.0;
            let mut u_older = 0.0;
            let mut u_dot = 0.0;
            let mut increment = 0.0;
            for (i, &dof) in self.dofs.iter().enumerate() {
                let phi = self.phi[i][qp];
                u += vector[dof] * phi;
                grad_u += self.grad_phi[i][qp] * vector[dof];
                if nonlinear {
                    u_old += solution.old.map_or(0.0, |v| v[dof]) * phi;
                    u_older += solution.older.map_or(0.0, |v| v[dof]) * phi;
                    u_dot += solution.u_dot.map_or(0.0, |v| v[dof]) * phi;
                    increment += solution.increment.map_or(0.0, |v| v[dof]) * phi;
                }
            }
            self.u[qp] = u;
            self.grad_u[qp] = grad_u;
            self.u_old[qp] = u_old;
            self.u_older[qp] = u_older;
            self.u_dot[qp] = u_dot;
            self.increment[qp] = increment;
        }
        if nonlinear {
            self.du_dot_du = solution.du_dot_du;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Global dofs of the variable on the current entity, within its family's numbering.
    pub fn dofs(&self) -> &[usize] {
        &self.dofs
    }

    pub fn num_dofs(&self) -> usize {
        self.dofs.len()
    }

    pub fn phi(&self, i: usize, qp: usize) -> f64 {
        self.phi[i][qp]
    }

    pub fn grad_phi(&self, i: usize, qp: usize) -> &Vector3<f64> {
        &self.grad_phi[i][qp]
    }

    pub fn u(&self, qp: usize) -> f64 {
        self.u.get(qp).copied().unwrap_or(0.0)
    }

    pub fn grad_u(&self, qp: usize) -> Vector3<f64> {
        self.grad_u.get(qp).copied().unwrap_or_else(Vector3::zeros)
    }
}

/// Evaluation buffers for one geometric entity.
#[derive(Debug, Clone)]
pub struct FeData {
    kind: FeDataKind,
    element: usize,
    side: Option<usize>,
    node: Option<usize>,
    subdomain: SubdomainId,
    q_points: Vec<Point3<f64>>,
    jxw: Vec<f64>,
    normals: Vec<Vector3<f64>>,
    element_size: f64,
    volume: f64,
    variables: Vec<VariableValues>,
    evaluations: Vec<PointEvaluation>,
    reference_points: Vec<Point3<f64>>,
}

impl FeData {
    pub fn new(kind: FeDataKind, num_coupled: usize) -> Self {
        Self {
            kind,
            element: 0,
            side: None,
            node: None,
            subdomain: 0,
            q_points: Vec::new(),
            jxw: Vec::new(),
            normals: Vec::new(),
            element_size: 0.0,
            volume: 0.0,
            variables: vec![VariableValues::default(); num_coupled],
            evaluations: Vec::new(),
            reference_points: Vec::new(),
        }
    }

    pub fn kind(&self) -> FeDataKind {
        self.kind
    }

    pub fn num_coupled(&self) -> usize {
        self.variables.len()
    }

    pub fn element(&self) -> usize {
        self.element
    }

    pub fn side(&self) -> Option<usize> {
        self.side
    }

    pub fn node(&self) -> Option<usize> {
        self.node
    }

    pub fn subdomain(&self) -> SubdomainId {
        self.subdomain
    }

    pub fn num_qp(&self) -> usize {
        self.jxw.len()
    }

    pub fn q_points(&self) -> &[Point3<f64>] {
        &self.q_points
    }

    pub fn jxw(&self) -> &[f64] {
        &self.jxw
    }

    pub fn element_size(&self) -> f64 {
        self.element_size
    }

    /// Outward unit normal at a side quadrature point. Zero on element interiors and nodes.
    pub fn normal(&self, qp: usize) -> Vector3<f64> {
        self.normals.get(qp).copied().unwrap_or_else(Vector3::zeros)
    }

    /// Sum of all quadrature weights, i.e. the measure of the entity.
    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn variable(&self, id: CoupledVariableId) -> &VariableValues {
        &self.variables[id.0]
    }

    fn check_layout(&self, registry: &VariableRegistry) -> Result<()> {
        if self.variables.len() != registry.num_coupled() {
            return Err(SystemError::ContractViolation(format!(
                "evaluation buffers are sized for {} variables, but {} are registered",
                self.variables.len(),
                registry.num_coupled()
            )));
        }
        Ok(())
    }

    fn evaluate_points(&mut self, inputs: &FeInputs, element: usize) -> Result<()> {
        let el = inputs.mesh.element(element);
        let mut coords = [Point3::origin(); MAX_NODES];
        for (coord, &node) in coords.iter_mut().zip(&el.nodes) {
            *coord = inputs.vertices[node];
        }
        let coords = &coords[..el.nodes.len()];
        self.evaluations.clear();
        self.q_points.clear();
        for xi in &self.reference_points {
            let evaluation = evaluate_at(el.kind, element, coords, xi)?;
            self.q_points.push(evaluation.x);
            self.evaluations.push(evaluation);
        }
        self.element = element;
        self.subdomain = el.subdomain;
        self.element_size = element_diameter(el.kind, coords);
        Ok(())
    }

    fn compute_variables(&mut self, inputs: &FeInputs) {
        let num_qp = self.evaluations.len();
        let evaluations = &self.evaluations;
        for (id, var, variable) in inputs.registry.iter_coupled() {
            let values = &mut self.variables[id.0];
            let (dofs, number, nonlinear) = match var {
                VariableRef::Nonlinear(v) => (inputs.dofs, v.0, true),
                VariableRef::Auxiliary(v) => (inputs.aux_dofs, v.0, false),
            };
            dofs.populate_element_dofs(number, inputs.mesh, self.element, &mut values.dofs);
            values.prepare(num_qp);
            for (qp, evaluation) in evaluations.iter().enumerate() {
                match variable.fe_type.family {
                    FeFamily::Lagrange => {
                        for i in 0..values.dofs.len() {
                            values.phi[i][qp] = evaluation.phi[i];
                            values.grad_phi[i][qp] = evaluation.grad_phi[i];
                        }
                    }
                    FeFamily::Monomial => {
                        for i in 0..values.dofs.len() {
                            values.phi[i][qp] = 1.0;
                        }
                    }
                }
            }
            values.interpolate(&inputs.solution, nonlinear);
        }
    }

    /// Reinitializes the buffers on the interior quadrature points of an element.
    pub fn reinit_element(&mut self, inputs: &FeInputs, element: usize) -> Result<()> {
        self.check_layout(inputs.registry)?;
        let kind = inputs.mesh.element(element).kind;
        let rule = inputs.quadrature.element_rule(kind);
        self.reference_points.clone_from(&rule.points);
        self.evaluate_points(inputs, element)?;
        self.jxw.clear();
        self.jxw
            .extend(rule.weights.iter().zip(&self.evaluations).map(|(w, e)| w * e.det_j));
        self.volume = self.jxw.iter().sum();
        self.normals.clear();
        self.side = None;
        self.node = None;
        self.compute_variables(inputs);
        Ok(())
    }

    /// Reinitializes the buffers on one side of an element.
    pub fn reinit_side(&mut self, inputs: &FeInputs, element: usize, side: usize) -> Result<()> {
        self.check_layout(inputs.registry)?;
        let kind = inputs.mesh.element(element).kind;
        let rule: &QuadratureRule = inputs.quadrature.side_rule(kind, side);
        self.reference_points.clone_from(&rule.points);
        self.evaluate_points(inputs, element)?;
        let vertices = self.element_vertices(inputs, element);
        let factor = side_measure_factor(kind, &vertices, side);
        let normal = outward_normal(kind, &vertices, side);
        self.jxw.clear();
        self.jxw.extend(rule.weights.iter().map(|w| w * factor));
        self.volume = self.jxw.iter().sum();
        self.normals.clear();
        self.normals.resize(self.jxw.len(), normal);
        self.side = Some(side);
        self.node = None;
        self.compute_variables(inputs);
        Ok(())
    }

    /// Reinitializes the buffers on the neighbor's side of an interior face, with quadrature
    /// points matching those of `element_side`, which must have been reinitialized on the
    /// element's side of the same face.
    pub fn reinit_neighbor_side(
        &mut self,
        inputs: &FeInputs,
        face: &InteriorFace,
        element_side: &FeData,
    ) -> Result<()> {
        self.check_layout(inputs.registry)?;
        let kind = inputs.mesh.element(face.neighbor).kind;
        let parameters = QuadratureRule::side_parameters(kind, inputs.quadrature.points_per_dim())?;
        self.reference_points.clear();
        self.reference_points.extend(parameters.iter().map(|&t| {
            let t = if face.reversed { -t } else { t };
            side_reference_point(kind, face.neighbor_side, t)
        }));
        self.evaluate_points(inputs, face.neighbor)?;
        self.jxw.clone_from(&element_side.jxw);
        self.volume = element_side.volume;
        self.normals.clear();
        self.normals.extend(element_side.normals.iter().map(|n| -n));
        self.side = Some(face.neighbor_side);
        self.node = None;
        self.compute_variables(inputs);
        Ok(())
    }

    /// Reinitializes the buffers at a single node. Only nodal (Lagrange) variables are active.
    pub fn reinit_node(&mut self, inputs: &FeInputs, node: usize, subdomain: SubdomainId) -> Result<()> {
        self.check_layout(inputs.registry)?;
        self.evaluations.clear();
        self.reference_points.clear();
        self.q_points.clear();
        self.q_points.push(inputs.vertices[node]);
        self.jxw.clear();
        self.jxw.push(1.0);
        self.volume = 1.0;
        self.normals.clear();
        self.element_size = 0.0;
        self.side = None;
        self.node = Some(node);
        self.subdomain = subdomain;
        for (id, var, variable) in inputs.registry.iter_coupled() {
            let values = &mut self.variables[id.0];
            let (dofs, number, nonlinear) = match var {
                VariableRef::Nonlinear(v) => (inputs.dofs, v.0, true),
                VariableRef::Auxiliary(v) => (inputs.aux_dofs, v.0, false),
            };
            values.dofs.clear();
            if variable.fe_type.family == FeFamily::Lagrange {
                values.dofs.extend(dofs.node_dof(number, node));
            }
            values.prepare(1);
            if values.active {
                values.phi[0][0] = 1.0;
            }
            values.interpolate(&inputs.solution, nonlinear);
        }
        Ok(())
    }

    /// Replaces the values of a variable by a constant, e.g. after an auxiliary kernel
    /// computed a new value for the current entity.
    pub fn override_constant(&mut self, id: CoupledVariableId, value: f64) {
        let values = &mut self.variables[id.0];
        values.u.iter_mut().for_each(|u| *u = value);
        values.grad_u.iter_mut().for_each(|g| *g = Vector3::zeros());
    }

    fn element_vertices(&self, inputs: &FeInputs, element: usize) -> Vec<Point3<f64>> {
        inputs
            .mesh
            .element(element)
            .nodes
            .iter()
            .map(|&n| inputs.vertices[n])
            .collect()
    }
}

/// Material property values at the quadrature points of the current entity.
#[derive(Debug, Clone, Default)]
pub struct MaterialData {
    index: FxHashMap<String, usize>,
    values: Vec<Vec<f64>>,
    computed: Vec<bool>,
}

impl MaterialData {
    pub fn new(properties: &[String]) -> Self {
        let index = properties
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            index,
            values: vec![Vec::new(); properties.len()],
            computed: vec![false; properties.len()],
        }
    }

    pub fn num_properties(&self) -> usize {
        self.values.len()
    }

    /// Clears all values and sizes the buffers for `num_qp` quadrature points.
    pub fn prepare(&mut self, num_qp: usize) {
        for values in &mut self.values {
            values.clear();
            values.resize(num_qp, 0.0);
        }
        self.computed.iter_mut().for_each(|c| *c = false);
    }

    pub fn get(&self, name: &str, qp: usize) -> Option<f64> {
        let &index = self.index.get(name)?;
        if self.computed[index] {
            self.values[index].get(qp).copied()
        } else {
            None
        }
    }

    pub fn writer(&mut self, qp: usize) -> MaterialWriter<'_> {
        MaterialWriter { data: self, qp }
    }
}

/// Write access to the material properties at one quadrature point.
pub struct MaterialWriter<'a> {
    data: &'a mut MaterialData,
    qp: usize,
}

impl MaterialWriter<'_> {
    pub fn set(&mut self, name: &str, value: f64) -> eyre::Result<()> {
        let &index = self
            .data
            .index
            .get(name)
            .ok_or_else(|| eyre!("material property `{name}` was not declared"))?;
        let slot = self.data.values[index]
            .get_mut(self.qp)
            .ok_or_else(|| eyre!("quadrature point {} is out of range", self.qp))?;
        *slot = value;
        self.data.computed[index] = true;
        Ok(())
    }
}

/// Shared, read-only state visible to every evaluator during a pass.
#[derive(Clone, Copy)]
pub struct EvalEnv<'a> {
    pub time: TimeView,
    pub functions: &'a FunctionWarehouse,
    pub postprocessors: &'a PostprocessorValues,
}

impl<'a> EvalEnv<'a> {
    pub fn function(&self, name: &str) -> eyre::Result<&'a dyn Function> {
        self.functions
            .get(name)
            .ok_or_else(|| eyre!("unknown function `{name}`"))
    }

    pub fn postprocessor(&self, name: &str) -> eyre::Result<f64> {
        self.postprocessors
            .get(name)
            .ok_or_else(|| eyre!("unknown postprocessor `{name}`"))
    }
}

/// Read access to everything at a single quadrature point (or node).
#[derive(Clone, Copy)]
pub struct QpContext<'a> {
    fe: &'a FeData,
    qp: usize,
    material: Option<&'a MaterialData>,
    env: &'a EvalEnv<'a>,
}

impl<'a> QpContext<'a> {
    pub fn new(fe: &'a FeData, qp: usize, material: Option<&'a MaterialData>, env: &'a EvalEnv<'a>) -> Self {
        Self {
            fe,
            qp,
            material,
            env,
        }
    }

    pub fn qp(&self) -> usize {
        self.qp
    }

    pub fn q_point(&self) -> &Point3<f64> {
        &self.fe.q_points[self.qp]
    }

    pub fn jxw(&self) -> f64 {
        self.fe.jxw[self.qp]
    }

    /// Outward unit normal. Zero on element interiors and nodes.
    pub fn normal(&self) -> Vector3<f64> {
        self.fe.normal(self.qp)
    }

    pub fn element(&self) -> usize {
        self.fe.element
    }

    pub fn subdomain(&self) -> SubdomainId {
        self.fe.subdomain
    }

    pub fn element_size(&self) -> f64 {
        self.fe.element_size
    }

    pub fn time(&self) -> f64 {
        self.env.time.time
    }

    pub fn dt(&self) -> f64 {
        self.env.time.dt
    }

    pub fn time_view(&self) -> &TimeView {
        &self.env.time
    }

    pub fn coupled(&self, var: CoupledVariableId) -> &'a VariableValues {
        &self.fe.variables[var.0]
    }

    pub fn coupled_value(&self, var: CoupledVariableId) -> f64 {
        self.coupled(var).u(self.qp)
    }

    pub fn coupled_gradient(&self, var: CoupledVariableId) -> Vector3<f64> {
        self.coupled(var).grad_u(self.qp)
    }

    pub fn coupled_dot(&self, var: CoupledVariableId) -> f64 {
        self.coupled(var).u_dot.get(self.qp).copied().unwrap_or(0.0)
    }

    pub fn coupled_increment(&self, var: CoupledVariableId) -> f64 {
        self.coupled(var)
            .increment
            .get(self.qp)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn coupled_phi(&self, var: CoupledVariableId, j: usize) -> f64 {
        self.coupled(var).phi(j, self.qp)
    }

    pub fn coupled_grad_phi(&self, var: CoupledVariableId, j: usize) -> &'a Vector3<f64> {
        self.coupled(var).grad_phi(j, self.qp)
    }

    pub fn material(&self, name: &str) -> eyre::Result<f64> {
        let material = self
            .material
            .ok_or_else(|| eyre!("material properties are not available in this context"))?;
        material.get(name, self.qp).ok_or_else(|| {
            eyre!(
                "material property `{name}` is not computed on subdomain {}",
                self.fe.subdomain
            )
        })
    }

    pub fn function(&self, name: &str) -> eyre::Result<&'a dyn Function> {
        self.env.function(name)
    }

    /// Evaluates a named function at the current point and time.
    pub fn function_value(&self, name: &str) -> eyre::Result<f64> {
        Ok(self.function(name)?.value(self.time(), self.q_point()))
    }

    pub fn postprocessor(&self, name: &str) -> eyre::Result<f64> {
        self.env.postprocessor(name)
    }
}

/// A [`QpContext`] together with the variable an evaluator acts on.
#[derive(Clone, Copy)]
pub struct VariableQp<'a> {
    ctx: QpContext<'a>,
    var: &'a VariableValues,
}

impl<'a> VariableQp<'a> {
    pub fn new(ctx: QpContext<'a>, var: CoupledVariableId) -> Self {
        let var = ctx.coupled(var);
        Self { ctx, var }
    }

    pub fn u(&self) -> f64 {
        self.var.u(self.ctx.qp)
    }

    pub fn grad_u(&self) -> Vector3<f64> {
        self.var.grad_u(self.ctx.qp)
    }

    pub fn u_old(&self) -> f64 {
        self.var.u_old[self.ctx.qp]
    }

    pub fn u_older(&self) -> f64 {
        self.var.u_older[self.ctx.qp]
    }

    pub fn u_dot(&self) -> f64 {
        self.var.u_dot[self.ctx.qp]
    }

    pub fn du_dot_du(&self) -> f64 {
        self.var.du_dot_du
    }

    pub fn increment(&self) -> f64 {
        self.var.increment[self.ctx.qp]
    }

    /// Number of test (and trial) functions of the variable.
    pub fn n_test(&self) -> usize {
        self.var.num_dofs()
    }

    pub fn phi(&self, i: usize) -> f64 {
        self.var.phi(i, self.ctx.qp)
    }

    pub fn grad_phi(&self, i: usize) -> &'a Vector3<f64> {
        self.var.grad_phi(i, self.ctx.qp)
    }
}

impl<'a> Deref for VariableQp<'a> {
    type Target = QpContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

/// A point in space and time, used by initial conditions.
#[derive(Clone, Copy)]
pub struct PointContext<'a> {
    pub point: Point3<f64>,
    pub time: f64,
    functions: &'a FunctionWarehouse,
}

impl<'a> PointContext<'a> {
    pub fn new(point: Point3<f64>, time: f64, functions: &'a FunctionWarehouse) -> Self {
        Self {
            point,
            time,
            functions,
        }
    }

    pub fn function_value(&self, name: &str) -> eyre::Result<f64> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| eyre!("unknown function `{name}`"))?;
        Ok(function.value(self.time, &self.point))
    }
}
