//! Parallel assembly of residuals, Jacobians, damping factors and postprocessor values.
//!
//! Every pass partitions its items (active elements, boundary sides or active nodes) into
//! contiguous slices, one per worker thread. A worker only writes into its own
//! [`ThreadContext`] and its own evaluator replicas. Once all workers are done, their
//! contributions are merged sequentially in thread order, so the result of a pass depends on
//! the number of threads but never on scheduling.
//!
//! If a worker fails, the others stop at their next item and the error of the failing worker
//! with the lowest index is returned. Nothing is merged from a failed pass.
use crate::dofs::DofMap;
use crate::error::{Result, SystemError};
use crate::evaluators::{
    evaluate, DgJacobianType, DgKernel, DgQp, DgResidualType, Evaluable, EvaluatorBase, Material,
    PostprocessorScope, PostprocessorValues,
};
use crate::fe_data::{EvalEnv, FeData, FeInputs, MaterialData, PointContext, QpContext, SolutionView, TimeView, VariableQp};
use crate::mesh::{InteriorFace, Mesh, MeshTopology, SubdomainId};
use crate::quadrature::QuadratureTable;
use crate::thread_data::ThreadContext;
use crate::variables::{CoupledVariableId, FeFamily, VariableId, VariableRef, VariableRegistry};
use crate::warehouse::{ApplicabilityTables, FunctionWarehouse, SubdomainTable, ThreadWarehouse, Warehouse};
use log::debug;
use nalgebra::{DMatrix, DVector, Point3, Vector3};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

/// Read-only data shared by all workers during a pass.
#[derive(Clone, Copy)]
pub struct AssemblyInputs<'a> {
    pub mesh: &'a Mesh,
    /// Displaced vertex positions, if a displaced mesh is in use.
    pub displaced: Option<&'a [Point3<f64>]>,
    pub topology: &'a MeshTopology,
    pub active_elements: &'a [usize],
    pub active_nodes: &'a [usize],
    pub registry: &'a VariableRegistry,
    pub dofs: &'a DofMap,
    pub aux_dofs: &'a DofMap,
    pub quadrature: &'a QuadratureTable,
    pub tables: &'a ApplicabilityTables,
    pub time: TimeView,
    pub postprocessors: &'a PostprocessorValues,
}

impl<'a> AssemblyInputs<'a> {
    fn fe_inputs<'b>(&self, solution: SolutionView<'b>) -> FeInputs<'b>
    where
        'a: 'b,
    {
        FeInputs {
            mesh: self.mesh,
            vertices: self.mesh.vertices(),
            registry: self.registry,
            dofs: self.dofs,
            aux_dofs: self.aux_dofs,
            quadrature: self.quadrature,
            solution,
        }
    }

    /// The subdomain a node is evaluated in: that of the lowest-index active element touching it.
    fn node_subdomain(&self, node: usize) -> Option<SubdomainId> {
        self.topology
            .elements_of_node(node)
            .first()
            .map(|&e| self.mesh.element(e).subdomain)
    }

    fn env<'b>(&self, functions: &'b FunctionWarehouse) -> EvalEnv<'b>
    where
        'a: 'b,
    {
        EvalEnv {
            time: self.time,
            functions,
            postprocessors: self.postprocessors,
        }
    }
}

/// Nonlinear solution vectors a pass interpolates from.
#[derive(Debug, Clone, Copy)]
pub struct SystemVectors<'a> {
    pub current: &'a DVector<f64>,
    pub u_dot: Option<&'a DVector<f64>>,
    pub du_dot_du: f64,
    pub old: Option<&'a DVector<f64>>,
    pub older: Option<&'a DVector<f64>>,
}

impl<'a> SystemVectors<'a> {
    fn view<'b>(&self, aux: &'b DVector<f64>, increment: Option<&'b DVector<f64>>) -> SolutionView<'b>
    where
        'a: 'b,
    {
        SolutionView {
            current: self.current,
            aux,
            u_dot: self.u_dot,
            du_dot_du: self.du_dot_du,
            old: self.old,
            older: self.older,
            increment,
        }
    }
}

/// Which part of the Jacobian to assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianTarget {
    /// The full matrix over all nonlinear dofs.
    Full,
    /// The block coupling the equations of `ivar` to the unknowns of `jvar`.
    Block { ivar: VariableId, jvar: CoupledVariableId },
}

impl JacobianTarget {
    fn wants(&self, row: VariableId, col: CoupledVariableId, num_variables: usize) -> bool {
        match *self {
            Self::Full => col.0 < num_variables,
            Self::Block { ivar, jvar } => row == ivar && col == jvar,
        }
    }

    fn includes_diagonal_of(&self, row: VariableId) -> bool {
        match *self {
            Self::Full => true,
            Self::Block { ivar, jvar } => row == ivar && jvar.0 == ivar.0,
        }
    }
}

/// Output of a residual pass.
#[derive(Debug, Clone)]
pub struct ResidualOutput {
    pub residual: DVector<f64>,
    /// The residual before boundary conditions were applied, if requested.
    pub copy: Option<DVector<f64>>,
    /// Dofs whose residual rows were replaced by nodal boundary conditions.
    pub constrained: Vec<usize>,
}

/// Runs `work` for every item, partitioned into contiguous slices over the worker threads.
fn run_parallel<F>(
    pool: &ThreadPool,
    contexts: &mut [ThreadContext],
    warehouses: &mut [ThreadWarehouse],
    items: &[usize],
    work: F,
) -> Result<()>
where
    F: Fn(&mut ThreadContext, &mut ThreadWarehouse, usize) -> Result<()> + Sync,
{
    if contexts.len() != warehouses.len() || contexts.is_empty() {
        return Err(SystemError::ContractViolation(format!(
            "{} thread contexts for {} evaluator replicas",
            contexts.len(),
            warehouses.len()
        )));
    }
    let chunk_size = (items.len() + contexts.len() - 1) / contexts.len();
    let abort = AtomicBool::new(false);
    let first_error: Mutex<Option<(usize, SystemError)>> = Mutex::new(None);

    pool.install(|| {
        contexts
            .par_iter_mut()
            .zip(warehouses.par_iter_mut())
            .enumerate()
            .for_each(|(thread, (context, warehouse))| {
                let start = (thread * chunk_size).min(items.len());
                let end = (start + chunk_size).min(items.len());
                for &item in &items[start..end] {
                    if abort.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Err(err) = work(context, warehouse, item) {
                        abort.store(true, Ordering::Relaxed);
                        let mut slot = first_error.lock();
                        if slot.as_ref().map_or(true, |(t, _)| thread < *t) {
                            *slot = Some((thread, err));
                        }
                        return;
                    }
                }
            });
    });

    match first_error.into_inner() {
        Some((_, err)) => Err(err),
        None => Ok(()),
    }
}

fn select<'c>(base: &EvaluatorBase, reference: &'c FeData, displaced: &'c FeData, has_displaced: bool) -> &'c FeData {
    if has_displaced && base.use_displaced_mesh {
        displaced
    } else {
        reference
    }
}

fn setup_subdomain<E: Evaluable + ?Sized>(
    warehouse: &mut Warehouse<E>,
    indices: &[usize],
    subdomain: SubdomainId,
) -> Result<()> {
    for &index in indices {
        let evaluator = warehouse.entry_mut(index)?;
        let result = evaluator.subdomain_setup(subdomain);
        evaluate(&*evaluator, result)?;
    }
    Ok(())
}

/// Runs the subdomain setup hooks when a worker moves into a new subdomain.
fn enter_subdomain(
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    subdomain: SubdomainId,
    table: &SubdomainTable,
) -> Result<()> {
    if ctx.current_subdomain == Some(subdomain) {
        return Ok(());
    }
    setup_subdomain(&mut warehouse.kernels, &table.kernels, subdomain)?;
    setup_subdomain(&mut warehouse.dg_kernels, &table.dg_kernels, subdomain)?;
    setup_subdomain(&mut warehouse.stabilizers, &table.stabilizers, subdomain)?;
    setup_subdomain(&mut warehouse.materials, &table.materials, subdomain)?;
    setup_subdomain(&mut warehouse.aux_kernels, &table.elemental_aux, subdomain)?;
    setup_subdomain(&mut warehouse.dampers, &table.dampers, subdomain)?;
    setup_subdomain(&mut warehouse.postprocessors, &table.element_postprocessors, subdomain)?;
    ctx.current_subdomain = Some(subdomain);
    Ok(())
}

fn reinit_element(inputs: &AssemblyInputs, fe_inputs: &FeInputs, ctx: &mut ThreadContext, element: usize) -> Result<()> {
    ctx.element.reinit_element(fe_inputs, element)?;
    if let Some(vertices) = inputs.displaced {
        ctx.displaced_element
            .reinit_element(&fe_inputs.with_vertices(vertices), element)?;
    }
    Ok(())
}

fn compute_materials(
    materials: &mut Warehouse<dyn Material>,
    indices: &[usize],
    reference: &FeData,
    displaced: Option<&FeData>,
    out: &mut MaterialData,
    env: &EvalEnv,
) -> Result<()> {
    out.prepare(reference.num_qp());
    for &index in indices {
        let material = materials.entry_mut(index)?;
        let fe = match displaced {
            Some(displaced) if material.base().use_displaced_mesh => displaced,
            _ => reference,
        };
        for qp in 0..fe.num_qp() {
            let ctx = QpContext::new(fe, qp, None, env);
            let mut writer = out.writer(qp);
            let result = material.compute_qp_properties(&ctx, &mut writer);
            evaluate(&*material, result)?;
        }
    }
    Ok(())
}

fn integrate_residual<F>(
    fe: &FeData,
    var: CoupledVariableId,
    material: Option<&MaterialData>,
    env: &EvalEnv,
    residual: &mut DVector<f64>,
    mut f: F,
) -> eyre::Result<()>
where
    F: FnMut(&VariableQp, usize) -> eyre::Result<f64>,
{
    let values = fe.variable(var);
    if !values.is_active() {
        return Ok(());
    }
    for qp in 0..fe.num_qp() {
        let jxw = fe.jxw()[qp];
        let vqp = VariableQp::new(QpContext::new(fe, qp, material, env), var);
        for (i, &dof) in values.dofs().iter().enumerate() {
            residual[dof] += jxw * f(&vqp, i)?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn integrate_jacobian<F>(
    fe: &FeData,
    row: CoupledVariableId,
    col: CoupledVariableId,
    material: Option<&MaterialData>,
    env: &EvalEnv,
    local: &mut DMatrix<f64>,
    triplets: &mut Vec<(usize, usize, f64)>,
    mut f: F,
) -> eyre::Result<()>
where
    F: FnMut(&VariableQp, usize, usize) -> eyre::Result<f64>,
{
    let (rows, cols) = (fe.variable(row), fe.variable(col));
    if !rows.is_active() || !cols.is_active() {
        return Ok(());
    }
    reset_local(local, rows.num_dofs(), cols.num_dofs());
    for qp in 0..fe.num_qp() {
        let jxw = fe.jxw()[qp];
        let vqp = VariableQp::new(QpContext::new(fe, qp, material, env), row);
        for i in 0..rows.num_dofs() {
            for j in 0..cols.num_dofs() {
                local[(i, j)] += jxw * f(&vqp, i, j)?;
            }
        }
    }
    scatter_local(local, rows.dofs(), cols.dofs(), triplets);
    Ok(())
}

fn reset_local(local: &mut DMatrix<f64>, nrows: usize, ncols: usize) {
    if local.shape() == (nrows, ncols) {
        local.fill(0.0);
    } else {
        *local = DMatrix::zeros(nrows, ncols);
    }
}

fn scatter_local(local: &DMatrix<f64>, rows: &[usize], cols: &[usize], triplets: &mut Vec<(usize, usize, f64)>) {
    for (i, &r) in rows.iter().enumerate() {
        for (j, &c) in cols.iter().enumerate() {
            triplets.push((r, c, local[(i, j)]));
        }
    }
}

fn face_qp<'c>(element: &'c FeData, neighbor: &'c FeData, qp: usize, var: CoupledVariableId, env: &'c EvalEnv<'c>) -> DgQp<'c> {
    DgQp {
        element: VariableQp::new(QpContext::new(element, qp, None, env), var),
        neighbor: VariableQp::new(QpContext::new(neighbor, qp, None, env), var),
    }
}

fn integrate_dg_residual<F>(
    element: &FeData,
    neighbor: &FeData,
    var: CoupledVariableId,
    env: &EvalEnv,
    residual: &mut DVector<f64>,
    mut f: F,
) -> eyre::Result<()>
where
    F: FnMut(&DgQp, DgResidualType, usize) -> eyre::Result<f64>,
{
    let (own, other) = (element.variable(var), neighbor.variable(var));
    if !own.is_active() || !other.is_active() {
        return Ok(());
    }
    for qp in 0..element.num_qp() {
        let jxw = element.jxw()[qp];
        let dg = face_qp(element, neighbor, qp, var, env);
        for (i, &dof) in own.dofs().iter().enumerate() {
            residual[dof] += jxw * f(&dg, DgResidualType::Element, i)?;
        }
        for (i, &dof) in other.dofs().iter().enumerate() {
            residual[dof] += jxw * f(&dg, DgResidualType::Neighbor, i)?;
        }
    }
    Ok(())
}

fn integrate_dg_jacobian<F>(
    element: &FeData,
    neighbor: &FeData,
    var: CoupledVariableId,
    env: &EvalEnv,
    local: &mut DMatrix<f64>,
    triplets: &mut Vec<(usize, usize, f64)>,
    mut f: F,
) -> eyre::Result<()>
where
    F: FnMut(&DgQp, DgJacobianType, usize, usize) -> eyre::Result<f64>,
{
    let (own, other) = (element.variable(var), neighbor.variable(var));
    if !own.is_active() || !other.is_active() {
        return Ok(());
    }
    for kind in [
        DgJacobianType::ElementElement,
        DgJacobianType::ElementNeighbor,
        DgJacobianType::NeighborElement,
        DgJacobianType::NeighborNeighbor,
    ] {
        let (rows, cols) = match kind {
            DgJacobianType::ElementElement => (own, own),
            DgJacobianType::ElementNeighbor => (own, other),
            DgJacobianType::NeighborElement => (other, own),
            DgJacobianType::NeighborNeighbor => (other, other),
        };
        reset_local(local, rows.num_dofs(), cols.num_dofs());
        for qp in 0..element.num_qp() {
            let jxw = element.jxw()[qp];
            let dg = face_qp(element, neighbor, qp, var, env);
            for i in 0..rows.num_dofs() {
                for j in 0..cols.num_dofs() {
                    local[(i, j)] += jxw * f(&dg, kind, i, j)?;
                }
            }
        }
        scatter_local(local, rows.dofs(), cols.dofs(), triplets);
    }
    Ok(())
}

fn reinit_face(fe_inputs: &FeInputs, ctx: &mut ThreadContext, face: &InteriorFace) -> Result<()> {
    ctx.face.reinit_side(fe_inputs, face.element, face.side)?;
    ctx.neighbor_face
        .reinit_neighbor_side(fe_inputs, face, &ctx.face)
}

fn dg_residual(
    fe_inputs: &FeInputs,
    ctx: &mut ThreadContext,
    dg_kernels: &mut Warehouse<dyn DgKernel>,
    indices: &[usize],
    face: &InteriorFace,
    env: &EvalEnv,
) -> Result<()> {
    reinit_face(fe_inputs, ctx, face)?;
    for &index in indices {
        let kernel = dg_kernels.entry_mut(index)?;
        let var = CoupledVariableId(kernel.variable().0);
        let result = integrate_dg_residual(&ctx.face, &ctx.neighbor_face, var, env, &mut ctx.residual, |qp, kind, i| {
            kernel.compute_qp_residual(qp, kind, i)
        });
        evaluate(&*kernel, result)?;
    }
    Ok(())
}

/// Evaluates the elemental auxiliary kernels of the current element as JxW-weighted averages
/// and makes the new values visible to the remaining evaluators of the element.
fn update_elemental_aux(
    inputs: &AssemblyInputs,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    table: &SubdomainTable,
    element: usize,
) -> Result<()> {
    let ThreadWarehouse {
        aux_kernels, functions, ..
    } = warehouse;
    let env = inputs.env(functions);
    let has_displaced = inputs.displaced.is_some();
    for &index in &table.elemental_aux {
        let kernel = aux_kernels.entry_mut(index)?;
        let var = kernel.variable();
        let dof = match inputs.aux_dofs.element_dof(var.0, element) {
            Some(dof) => dof,
            None => continue,
        };
        let fe = select(kernel.base(), &ctx.element, &ctx.displaced_element, has_displaced);
        let mut integral = 0.0;
        for qp in 0..fe.num_qp() {
            let result = kernel.compute_value(&QpContext::new(fe, qp, Some(&ctx.material), &env));
            integral += fe.jxw()[qp] * evaluate(&*kernel, result)?;
        }
        let value = if fe.volume() > 0.0 { integral / fe.volume() } else { 0.0 };
        let id = inputs.registry.modified_aux_var_num(var);
        ctx.element.override_constant(id, value);
        ctx.displaced_element.override_constant(id, value);
        ctx.aux_elemental.push((dof, value));
    }
    Ok(())
}

/// Reinitializes the element, computes its materials and refreshes elemental auxiliary values.
fn prepare_element(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    table: &SubdomainTable,
    element: usize,
) -> Result<()> {
    let subdomain = inputs.mesh.element(element).subdomain;
    enter_subdomain(ctx, warehouse, subdomain, table)?;
    reinit_element(inputs, fe_inputs, ctx, element)?;
    let ThreadWarehouse {
        materials, functions, ..
    } = &mut *warehouse;
    let env = inputs.env(functions);
    let displaced = inputs.displaced.is_some().then_some(&ctx.displaced_element);
    compute_materials(materials, &table.materials, &ctx.element, displaced, &mut ctx.material, &env)?;
    update_elemental_aux(inputs, ctx, warehouse, table, element)
}

fn element_residual(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    element: usize,
) -> Result<()> {
    let subdomain = inputs.mesh.element(element).subdomain;
    let table = match inputs.tables.subdomain(subdomain) {
        Some(table) => table,
        None => return Ok(()),
    };
    if table.kernels.is_empty()
        && table.stabilizers.is_empty()
        && table.dg_kernels.is_empty()
        && table.elemental_aux.is_empty()
    {
        return Ok(());
    }
    prepare_element(inputs, fe_inputs, ctx, warehouse, table, element)?;

    let ThreadWarehouse {
        kernels,
        dg_kernels,
        stabilizers,
        functions,
        ..
    } = warehouse;
    let env = inputs.env(functions);
    let has_displaced = inputs.displaced.is_some();

    for &index in &table.kernels {
        let kernel = kernels.entry_mut(index)?;
        let var = CoupledVariableId(kernel.variable().0);
        let fe = select(kernel.base(), &ctx.element, &ctx.displaced_element, has_displaced);
        let result = integrate_residual(fe, var, Some(&ctx.material), &env, &mut ctx.residual, |qp, i| {
            kernel.compute_qp_residual(qp, i)
        });
        evaluate(&*kernel, result)?;
    }

    for &index in &table.stabilizers {
        let stabilizer = stabilizers.entry_mut(index)?;
        let var = CoupledVariableId(stabilizer.variable().0);
        let fe = select(stabilizer.base(), &ctx.element, &ctx.displaced_element, has_displaced);
        let result = integrate_residual(fe, var, Some(&ctx.material), &env, &mut ctx.residual, |qp, i| {
            stabilizer.compute_qp_residual(qp, i)
        });
        evaluate(&*stabilizer, result)?;
    }

    if !table.dg_kernels.is_empty() {
        for face in inputs.topology.faces_of(element) {
            dg_residual(fe_inputs, ctx, dg_kernels, &table.dg_kernels, face, &env)?;
        }
    }
    Ok(())
}

fn element_jacobian(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    target: JacobianTarget,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    element: usize,
) -> Result<()> {
    let subdomain = inputs.mesh.element(element).subdomain;
    let table = match inputs.tables.subdomain(subdomain) {
        Some(table) => table,
        None => return Ok(()),
    };
    if table.kernels.is_empty() && table.stabilizers.is_empty() && table.dg_kernels.is_empty() {
        return Ok(());
    }
    prepare_element(inputs, fe_inputs, ctx, warehouse, table, element)?;
    // Only the values are refreshed in a Jacobian pass; the global aux vector stays as it is.
    ctx.aux_elemental.clear();

    let ThreadWarehouse {
        kernels,
        dg_kernels,
        stabilizers,
        functions,
        ..
    } = warehouse;
    let env = inputs.env(functions);
    let has_displaced = inputs.displaced.is_some();
    let num_variables = inputs.registry.num_variables();

    for &index in &table.kernels {
        let kernel = kernels.entry_mut(index)?;
        let row = kernel.variable();
        let row_id = CoupledVariableId(row.0);
        let fe = select(kernel.base(), &ctx.element, &ctx.displaced_element, has_displaced);
        if target.wants(row, row_id, num_variables) {
            let result = integrate_jacobian(
                fe,
                row_id,
                row_id,
                Some(&ctx.material),
                &env,
                &mut ctx.local_matrix,
                &mut ctx.triplets,
                |qp, i, j| kernel.compute_qp_jacobian(qp, i, j),
            );
            evaluate(&*kernel, result)?;
        }
        for c in 0..kernel.coupled_variables().len() {
            let jvar = kernel.coupled_variables()[c];
            if jvar == row_id || !target.wants(row, jvar, num_variables) {
                continue;
            }
            let result = integrate_jacobian(
                fe,
                row_id,
                jvar,
                Some(&ctx.material),
                &env,
                &mut ctx.local_matrix,
                &mut ctx.triplets,
                |qp, i, j| kernel.compute_qp_off_diag_jacobian(qp, i, j, jvar),
            );
            evaluate(&*kernel, result)?;
        }
    }

    for &index in &table.stabilizers {
        let stabilizer = stabilizers.entry_mut(index)?;
        let row = stabilizer.variable();
        let row_id = CoupledVariableId(row.0);
        if !target.wants(row, row_id, num_variables) {
            continue;
        }
        let fe = select(stabilizer.base(), &ctx.element, &ctx.displaced_element, has_displaced);
        let result = integrate_jacobian(
            fe,
            row_id,
            row_id,
            Some(&ctx.material),
            &env,
            &mut ctx.local_matrix,
            &mut ctx.triplets,
            |qp, i, j| stabilizer.compute_qp_jacobian(qp, i, j),
        );
        evaluate(&*stabilizer, result)?;
    }

    let wanted_dg: Vec<usize> = table
        .dg_kernels
        .iter()
        .copied()
        .filter(|&index| {
            dg_kernels
                .get(index)
                .map(|k| target.wants(k.variable(), CoupledVariableId(k.variable().0), num_variables))
                .unwrap_or(false)
        })
        .collect();
    if !wanted_dg.is_empty() {
        for face in inputs.topology.faces_of(element) {
            reinit_face(fe_inputs, ctx, face)?;
            for &index in &wanted_dg {
                let kernel = dg_kernels.entry_mut(index)?;
                let var = CoupledVariableId(kernel.variable().0);
                let result = integrate_dg_jacobian(
                    &ctx.face,
                    &ctx.neighbor_face,
                    var,
                    &env,
                    &mut ctx.local_matrix,
                    &mut ctx.triplets,
                    |qp, kind, i, j| kernel.compute_qp_jacobian(qp, kind, i, j),
                );
                evaluate(&*kernel, result)?;
            }
        }
    }
    Ok(())
}

/// Reinitializes the face buffers on a boundary side and computes boundary materials.
fn prepare_side(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    element: usize,
    side: usize,
) -> Result<()> {
    ctx.face.reinit_side(fe_inputs, element, side)?;
    if let Some(vertices) = inputs.displaced {
        ctx.displaced_face
            .reinit_side(&fe_inputs.with_vertices(vertices), element, side)?;
    }
    let subdomain = inputs.mesh.element(element).subdomain;
    let ThreadWarehouse {
        materials, functions, ..
    } = warehouse;
    let env = inputs.env(functions);
    match inputs.tables.subdomain(subdomain) {
        Some(table) => {
            let displaced = inputs.displaced.is_some().then_some(&ctx.displaced_face);
            compute_materials(
                materials,
                &table.materials,
                &ctx.face,
                displaced,
                &mut ctx.boundary_material,
                &env,
            )
        }
        None => {
            ctx.boundary_material.prepare(ctx.face.num_qp());
            Ok(())
        }
    }
}

fn side_residual(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    side_index: usize,
) -> Result<()> {
    let side = inputs.topology.boundary_sides()[side_index];
    let bcs = inputs.tables.integrated_bcs(side.boundary);
    if bcs.is_empty() {
        return Ok(());
    }
    prepare_side(inputs, fe_inputs, ctx, warehouse, side.element, side.side)?;
    let ThreadWarehouse {
        integrated_bcs,
        functions,
        ..
    } = warehouse;
    let env = inputs.env(functions);
    let has_displaced = inputs.displaced.is_some();
    for &index in bcs {
        let bc = integrated_bcs.entry_mut(index)?;
        let var = CoupledVariableId(bc.variable().0);
        let fe = select(bc.base(), &ctx.face, &ctx.displaced_face, has_displaced);
        let result = integrate_residual(fe, var, Some(&ctx.boundary_material), &env, &mut ctx.residual, |qp, i| {
            bc.compute_qp_residual(qp, i)
        });
        evaluate(&*bc, result)?;
    }
    Ok(())
}

fn side_jacobian(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    target: JacobianTarget,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    side_index: usize,
) -> Result<()> {
    let side = inputs.topology.boundary_sides()[side_index];
    let num_variables = inputs.registry.num_variables();
    let bcs: Vec<usize> = inputs
        .tables
        .integrated_bcs(side.boundary)
        .iter()
        .copied()
        .filter(|&index| {
            warehouse
                .integrated_bcs
                .get(index)
                .map(|bc| target.wants(bc.variable(), CoupledVariableId(bc.variable().0), num_variables))
                .unwrap_or(false)
        })
        .collect();
    if bcs.is_empty() {
        return Ok(());
    }
    prepare_side(inputs, fe_inputs, ctx, warehouse, side.element, side.side)?;
    let ThreadWarehouse {
        integrated_bcs,
        functions,
        ..
    } = warehouse;
    let env = inputs.env(functions);
    let has_displaced = inputs.displaced.is_some();
    for index in bcs {
        let bc = integrated_bcs.entry_mut(index)?;
        let var = CoupledVariableId(bc.variable().0);
        let fe = select(bc.base(), &ctx.face, &ctx.displaced_face, has_displaced);
        let result = integrate_jacobian(
            fe,
            var,
            var,
            Some(&ctx.boundary_material),
            &env,
            &mut ctx.local_matrix,
            &mut ctx.triplets,
            |qp, i, j| bc.compute_qp_jacobian(qp, i, j),
        );
        evaluate(&*bc, result)?;
    }
    Ok(())
}

fn nodal_aux(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    node: usize,
) -> Result<()> {
    let subdomain = match inputs.node_subdomain(node) {
        Some(subdomain) => subdomain,
        None => return Ok(()),
    };
    let table = match inputs.tables.subdomain(subdomain) {
        Some(table) if !table.nodal_aux.is_empty() => table,
        _ => return Ok(()),
    };
    ctx.node.reinit_node(fe_inputs, node, subdomain)?;
    let ThreadWarehouse {
        aux_kernels, functions, ..
    } = warehouse;
    let env = inputs.env(functions);
    for &index in &table.nodal_aux {
        let kernel = aux_kernels.entry_mut(index)?;
        let var = kernel.variable();
        let dof = match inputs.aux_dofs.node_dof(var.0, node) {
            Some(dof) => dof,
            None => continue,
        };
        let result = kernel.compute_value(&QpContext::new(&ctx.node, 0, None, &env));
        let value = evaluate(&*kernel, result)?;
        ctx.node
            .override_constant(inputs.registry.modified_aux_var_num(var), value);
        ctx.aux_nodal.push((dof, value));
    }
    Ok(())
}

/// Evaluates the nodal boundary conditions in boundary order, sequentially on one worker.
///
/// Returns the residual (or Jacobian diagonal) value per constrained dof. When several
/// conditions constrain the same dof, the last one wins.
fn evaluate_nodal_bcs(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    jacobian: bool,
) -> Result<BTreeMap<usize, (VariableId, f64)>> {
    let mut values = BTreeMap::new();
    let ThreadWarehouse {
        nodal_bcs, functions, ..
    } = warehouse;
    let env = inputs.env(functions);
    for (&boundary, nodes) in inputs.topology.boundary_node_sets() {
        let indices = inputs.tables.nodal_bcs(boundary);
        if indices.is_empty() {
            continue;
        }
        for &node in nodes {
            let subdomain = match inputs.node_subdomain(node) {
                Some(subdomain) => subdomain,
                None => continue,
            };
            ctx.node.reinit_node(fe_inputs, node, subdomain)?;
            for &index in indices {
                let bc = nodal_bcs.entry_mut(index)?;
                let var = bc.variable();
                let dof = match inputs.dofs.node_dof(var.0, node) {
                    Some(dof) => dof,
                    None => continue,
                };
                let qp = VariableQp::new(QpContext::new(&ctx.node, 0, None, &env), CoupledVariableId(var.0));
                let result = if jacobian {
                    bc.compute_qp_jacobian(&qp)
                } else {
                    bc.compute_qp_residual(&qp)
                };
                values.insert(dof, (var, evaluate(&*bc, result)?));
            }
        }
    }
    Ok(values)
}

fn element_damping(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    element: usize,
) -> Result<()> {
    let subdomain = inputs.mesh.element(element).subdomain;
    let table = match inputs.tables.subdomain(subdomain) {
        Some(table) if !table.dampers.is_empty() => table,
        _ => return Ok(()),
    };
    prepare_element(inputs, fe_inputs, ctx, warehouse, table, element)?;
    ctx.aux_elemental.clear();
    let ThreadWarehouse {
        dampers, functions, ..
    } = warehouse;
    let env = inputs.env(functions);
    let has_displaced = inputs.displaced.is_some();
    for &index in &table.dampers {
        let damper = dampers.entry_mut(index)?;
        let fe = select(damper.base(), &ctx.element, &ctx.displaced_element, has_displaced);
        for qp in 0..fe.num_qp() {
            let result = damper.compute_qp_damping(&QpContext::new(fe, qp, Some(&ctx.material), &env));
            let factor = evaluate(&*damper, result)?;
            ctx.damping = ctx.damping.min(factor);
        }
    }
    Ok(())
}

fn element_postprocessors(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    element: usize,
) -> Result<()> {
    let subdomain = inputs.mesh.element(element).subdomain;
    let table = match inputs.tables.subdomain(subdomain) {
        Some(table) if !table.element_postprocessors.is_empty() => table,
        _ => return Ok(()),
    };
    prepare_element(inputs, fe_inputs, ctx, warehouse, table, element)?;
    ctx.aux_elemental.clear();
    let ThreadWarehouse {
        postprocessors,
        functions,
        ..
    } = warehouse;
    let env = inputs.env(functions);
    let has_displaced = inputs.displaced.is_some();
    for &index in &table.element_postprocessors {
        let postprocessor = postprocessors.entry_mut(index)?;
        let fe = select(postprocessor.base(), &ctx.element, &ctx.displaced_element, has_displaced);
        for qp in 0..fe.num_qp() {
            let result = postprocessor.execute_qp(&QpContext::new(fe, qp, Some(&ctx.material), &env));
            evaluate(&*postprocessor, result)?;
        }
    }
    Ok(())
}

fn nodal_postprocessors(
    inputs: &AssemblyInputs,
    fe_inputs: &FeInputs,
    ctx: &mut ThreadContext,
    warehouse: &mut ThreadWarehouse,
    node: usize,
) -> Result<()> {
    let subdomain = match inputs.node_subdomain(node) {
        Some(subdomain) => subdomain,
        None => return Ok(()),
    };
    let table = match inputs.tables.subdomain(subdomain) {
        Some(table) if !table.nodal_postprocessors.is_empty() => table,
        _ => return Ok(()),
    };
    ctx.node.reinit_node(fe_inputs, node, subdomain)?;
    let ThreadWarehouse {
        postprocessors,
        functions,
        ..
    } = warehouse;
    let env = inputs.env(functions);
    for &index in &table.nodal_postprocessors {
        let postprocessor = postprocessors.entry_mut(index)?;
        let result = postprocessor.execute_qp(&QpContext::new(&ctx.node, 0, None, &env));
        evaluate(&*postprocessor, result)?;
    }
    Ok(())
}

fn first_worker<'c>(
    contexts: &'c mut [ThreadContext],
    warehouses: &'c mut [ThreadWarehouse],
) -> Result<(&'c mut ThreadContext, &'c mut ThreadWarehouse)> {
    match (contexts.first_mut(), warehouses.first_mut()) {
        (Some(ctx), Some(warehouse)) => Ok((ctx, warehouse)),
        _ => Err(SystemError::ContractViolation("no worker threads allocated".to_string())),
    }
}

/// Drives the assembly passes over one set of [`AssemblyInputs`].
pub struct Assembler<'a> {
    pool: &'a ThreadPool,
    inputs: AssemblyInputs<'a>,
}

impl<'a> Assembler<'a> {
    pub fn new(pool: &'a ThreadPool, inputs: AssemblyInputs<'a>) -> Self {
        Self { pool, inputs }
    }

    pub fn inputs(&self) -> &AssemblyInputs<'a> {
        &self.inputs
    }

    fn begin_pass(&self, contexts: &mut [ThreadContext]) {
        let num_dofs = self.inputs.dofs.num_dofs();
        for ctx in contexts.iter_mut() {
            ctx.begin_pass(num_dofs);
        }
    }

    fn boundary_side_indices(&self) -> Vec<usize> {
        (0..self.inputs.topology.boundary_sides().len()).collect()
    }

    /// Evaluates the nodal auxiliary kernels and writes their values into `aux`.
    pub fn update_nodal_aux(
        &self,
        contexts: &mut [ThreadContext],
        warehouses: &mut [ThreadWarehouse],
        vectors: SystemVectors,
        aux: &mut DVector<f64>,
    ) -> Result<()> {
        if !self.inputs.tables.has_nodal_aux() {
            return Ok(());
        }
        self.begin_pass(contexts);
        {
            let fe_inputs = self.inputs.fe_inputs(vectors.view(aux, None));
            let inputs = &self.inputs;
            run_parallel(self.pool, contexts, warehouses, inputs.active_nodes, |ctx, warehouse, node| {
                nodal_aux(inputs, &fe_inputs, ctx, warehouse, node)
            })?;
        }
        for ctx in contexts.iter() {
            for &(dof, value) in &ctx.aux_nodal {
                aux[dof] = value;
            }
        }
        Ok(())
    }

    /// Computes the residual.
    ///
    /// Nodal auxiliary kernels run first, followed by one element pass for kernels,
    /// stabilizers, elemental auxiliary kernels and interior face terms, then a pass over
    /// boundary sides for integrated boundary conditions. Nodal boundary conditions are applied
    /// last and overwrite their rows. `aux` receives the updated auxiliary values.
    pub fn residual(
        &self,
        contexts: &mut [ThreadContext],
        warehouses: &mut [ThreadWarehouse],
        vectors: SystemVectors,
        aux: &mut DVector<f64>,
        need_copy: bool,
    ) -> Result<ResidualOutput> {
        let num_dofs = self.inputs.dofs.num_dofs();
        if vectors.current.len() != num_dofs {
            return Err(SystemError::DimensionMismatch {
                expected: num_dofs,
                actual: vectors.current.len(),
            });
        }
        self.update_nodal_aux(contexts, warehouses, vectors, aux)?;
        let inputs = &self.inputs;

        self.begin_pass(contexts);
        {
            let fe_inputs = inputs.fe_inputs(vectors.view(aux, None));
            run_parallel(self.pool, contexts, warehouses, inputs.active_elements, |ctx, warehouse, element| {
                element_residual(inputs, &fe_inputs, ctx, warehouse, element)
            })?;
        }
        let mut residual = DVector::zeros(num_dofs);
        for ctx in contexts.iter() {
            residual += &ctx.residual;
            for &(dof, value) in &ctx.aux_elemental {
                aux[dof] = value;
            }
        }

        self.begin_pass(contexts);
        let fe_inputs = inputs.fe_inputs(vectors.view(aux, None));
        let sides = self.boundary_side_indices();
        run_parallel(self.pool, contexts, warehouses, &sides, |ctx, warehouse, side| {
            side_residual(inputs, &fe_inputs, ctx, warehouse, side)
        })?;
        for ctx in contexts.iter() {
            residual += &ctx.residual;
        }
        let copy = need_copy.then(|| residual.clone());

        let (ctx, warehouse) = first_worker(contexts, warehouses)?;
        let nodal = evaluate_nodal_bcs(inputs, &fe_inputs, ctx, warehouse, false)?;
        for (&dof, &(_, value)) in &nodal {
            residual[dof] = value;
        }
        debug!(
            "assembled residual with {num_dofs} dofs over {} elements and {} boundary sides, {} constrained dofs",
            inputs.active_elements.len(),
            sides.len(),
            nodal.len()
        );
        Ok(ResidualOutput {
            residual,
            copy,
            constrained: nodal.into_keys().collect(),
        })
    }

    fn block_ranges(&self, target: JacobianTarget) -> Result<(Range<usize>, Range<usize>)> {
        match target {
            JacobianTarget::Full => {
                let n = self.inputs.dofs.num_dofs();
                Ok((0..n, 0..n))
            }
            JacobianTarget::Block { ivar, jvar } => {
                let unknown = |name: String| SystemError::Unknown {
                    category: "variable",
                    name,
                };
                if ivar.0 >= self.inputs.dofs.num_variables() {
                    return Err(unknown(format!("{ivar:?}")));
                }
                let rows = self.inputs.dofs.variable(ivar.0).range();
                let cols = match self.inputs.registry.resolve(jvar) {
                    Some(VariableRef::Nonlinear(v)) => self.inputs.dofs.variable(v.0).range(),
                    Some(VariableRef::Auxiliary(a)) => self.inputs.aux_dofs.variable(a.0).range(),
                    None => return Err(unknown(format!("{jvar:?}"))),
                };
                Ok((rows, cols))
            }
        }
    }

    /// Computes the Jacobian, or one block of it.
    ///
    /// Rows constrained by nodal boundary conditions are replaced by the condition's diagonal
    /// entry. Every diagonal entry of the target is stored, even if it is zero. Auxiliary
    /// kernels are not evaluated; `aux` is used as it is.
    pub fn jacobian(
        &self,
        contexts: &mut [ThreadContext],
        warehouses: &mut [ThreadWarehouse],
        vectors: SystemVectors,
        aux: &DVector<f64>,
        target: JacobianTarget,
    ) -> Result<CsrMatrix<f64>> {
        let (rows, cols) = self.block_ranges(target)?;
        let inputs = &self.inputs;
        let fe_inputs = inputs.fe_inputs(vectors.view(aux, None));

        self.begin_pass(contexts);
        run_parallel(self.pool, contexts, warehouses, inputs.active_elements, |ctx, warehouse, element| {
            element_jacobian(inputs, &fe_inputs, target, ctx, warehouse, element)
        })?;
        let mut triplets: Vec<(usize, usize, f64)> = Vec::new();
        for ctx in contexts.iter_mut() {
            triplets.append(&mut ctx.triplets);
        }

        let sides = self.boundary_side_indices();
        run_parallel(self.pool, contexts, warehouses, &sides, |ctx, warehouse, side| {
            side_jacobian(inputs, &fe_inputs, target, ctx, warehouse, side)
        })?;
        for ctx in contexts.iter_mut() {
            triplets.append(&mut ctx.triplets);
        }

        let (ctx, warehouse) = first_worker(contexts, warehouses)?;
        let nodal = evaluate_nodal_bcs(inputs, &fe_inputs, ctx, warehouse, true)?;

        let mut coo_rows = Vec::with_capacity(triplets.len() + rows.len());
        let mut coo_cols = Vec::with_capacity(triplets.len() + rows.len());
        let mut values = Vec::with_capacity(triplets.len() + rows.len());
        if let JacobianTarget::Block { ivar, jvar } = target {
            if jvar.0 == ivar.0 {
                for local in 0..rows.len() {
                    coo_rows.push(local);
                    coo_cols.push(local);
                    values.push(0.0);
                }
            }
        } else {
            for local in 0..rows.len() {
                coo_rows.push(local);
                coo_cols.push(local);
                values.push(0.0);
            }
        }
        for (r, c, v) in triplets {
            if nodal.contains_key(&r) || !rows.contains(&r) || !cols.contains(&c) {
                continue;
            }
            coo_rows.push(r - rows.start);
            coo_cols.push(c - cols.start);
            values.push(v);
        }
        for (&dof, &(var, value)) in &nodal {
            if rows.contains(&dof) && target.includes_diagonal_of(var) {
                coo_rows.push(dof - rows.start);
                coo_cols.push(dof - cols.start);
                values.push(value);
            }
        }

        let coo = CooMatrix::try_from_triplets(rows.len(), cols.len(), coo_rows, coo_cols, values)
            .map_err(|err| SystemError::ContractViolation(format!("invalid Jacobian triplets: {err}")))?;
        debug!(
            "assembled {:?} Jacobian of size {}x{} with {} stored entries",
            target,
            rows.len(),
            cols.len(),
            coo.nnz()
        );
        Ok(CsrMatrix::from(&coo))
    }

    /// The largest fraction of `update` that all dampers accept. Returns 1 without dampers.
    pub fn damping(
        &self,
        contexts: &mut [ThreadContext],
        warehouses: &mut [ThreadWarehouse],
        vectors: SystemVectors,
        aux: &DVector<f64>,
        update: &DVector<f64>,
    ) -> Result<f64> {
        if warehouses.iter().all(|w| w.dampers.is_empty()) {
            return Ok(1.0);
        }
        if update.len() != self.inputs.dofs.num_dofs() {
            return Err(SystemError::DimensionMismatch {
                expected: self.inputs.dofs.num_dofs(),
                actual: update.len(),
            });
        }
        let inputs = &self.inputs;
        let fe_inputs = inputs.fe_inputs(vectors.view(aux, Some(update)));
        self.begin_pass(contexts);
        run_parallel(self.pool, contexts, warehouses, inputs.active_elements, |ctx, warehouse, element| {
            element_damping(inputs, &fe_inputs, ctx, warehouse, element)
        })?;
        let factor = contexts.iter().map(|ctx| ctx.damping).fold(1.0, f64::min);
        debug!("damping factor {factor}");
        Ok(factor)
    }

    /// Evaluates every postprocessor. General postprocessors run last, on the first worker,
    /// and see the values of the element and nodal ones.
    pub fn postprocessors(
        &self,
        contexts: &mut [ThreadContext],
        warehouses: &mut [ThreadWarehouse],
        vectors: SystemVectors,
        aux: &DVector<f64>,
    ) -> Result<PostprocessorValues> {
        for warehouse in warehouses.iter_mut() {
            warehouse
                .postprocessors
                .iter_mut()
                .for_each(|postprocessor| postprocessor.initialize());
        }
        let inputs = &self.inputs;
        let fe_inputs = inputs.fe_inputs(vectors.view(aux, None));
        self.begin_pass(contexts);
        run_parallel(self.pool, contexts, warehouses, inputs.active_elements, |ctx, warehouse, element| {
            element_postprocessors(inputs, &fe_inputs, ctx, warehouse, element)
        })?;
        run_parallel(self.pool, contexts, warehouses, inputs.active_nodes, |ctx, warehouse, node| {
            nodal_postprocessors(inputs, &fe_inputs, ctx, warehouse, node)
        })?;

        let mut values = inputs.postprocessors.clone();
        let (reference, _) = warehouses
            .split_first()
            .ok_or_else(|| SystemError::ContractViolation("no worker threads allocated".to_string()))?;
        for (index, postprocessor) in reference.postprocessors.iter().enumerate() {
            if postprocessor.scope() == PostprocessorScope::General {
                continue;
            }
            let partials = warehouses
                .iter()
                .filter_map(|w| w.postprocessors.get(index))
                .map(|p| p.partial());
            values.set(postprocessor.name(), postprocessor.aggregation().combine(partials));
        }

        let (_, warehouse) = first_worker(contexts, warehouses)?;
        let ThreadWarehouse {
            postprocessors,
            functions,
            ..
        } = warehouse;
        for &index in inputs.tables.general_postprocessors() {
            let postprocessor = postprocessors.entry_mut(index)?;
            let value = {
                let env = EvalEnv {
                    time: inputs.time,
                    functions: &*functions,
                    postprocessors: &values,
                };
                let result = postprocessor.execute_general(&env);
                evaluate(&*postprocessor, result)?
            };
            values.set(postprocessor.name(), value);
        }
        Ok(values)
    }

    /// Sets initial values of every variable with an initial condition.
    ///
    /// Nodal variables are sampled at the vertices of active nodes, elemental variables at the
    /// centroids of active elements.
    pub fn project_initial_conditions(
        &self,
        warehouse: &mut ThreadWarehouse,
        start_time: f64,
        solution: &mut DVector<f64>,
        aux: &mut DVector<f64>,
    ) -> Result<()> {
        let inputs = &self.inputs;
        let ThreadWarehouse {
            initial_conditions,
            functions,
            ..
        } = warehouse;
        let functions = &*functions;
        for ic in initial_conditions.iter_mut() {
            let (dofs, number, target) = match ic.variable() {
                VariableRef::Nonlinear(v) => (inputs.dofs, v.0, &mut *solution),
                VariableRef::Auxiliary(a) => (inputs.aux_dofs, a.0, &mut *aux),
            };
            if number >= dofs.num_variables() {
                return Err(SystemError::Unknown {
                    category: "variable",
                    name: format!("{:?}", ic.variable()),
                });
            }
            match dofs.variable(number).family() {
                FeFamily::Lagrange => {
                    for &node in inputs.active_nodes {
                        let dof = match dofs.node_dof(number, node) {
                            Some(dof) => dof,
                            None => continue,
                        };
                        if let Some(subdomain) = inputs.node_subdomain(node) {
                            if !ic.base().applies_to_block(subdomain) {
                                continue;
                            }
                        }
                        let point = PointContext::new(inputs.mesh.vertices()[node], start_time, functions);
                        let result = ic.value(&point);
                        target[dof] = evaluate(&*ic, result)?;
                    }
                }
                FeFamily::Monomial => {
                    for &element in inputs.active_elements {
                        let dof = match dofs.element_dof(number, element) {
                            Some(dof) => dof,
                            None => continue,
                        };
                        let el = inputs.mesh.element(element);
                        if !ic.base().applies_to_block(el.subdomain) {
                            continue;
                        }
                        let sum = el
                            .nodes
                            .iter()
                            .fold(Vector3::zeros(), |acc, &n| acc + inputs.mesh.vertices()[n].coords);
                        let centroid = Point3::from(sum / el.nodes.len() as f64);
                        let point = PointContext::new(centroid, start_time, functions);
                        let result = ic.value(&point);
                        target[dof] = evaluate(&*ic, result)?;
                    }
                }
            }
        }
        Ok(())
    }
}
