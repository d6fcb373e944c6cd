//! The coupled system: owns mesh, variables, evaluators, thread data and solution history, and
//! exposes the setup, solver-callback and output entry points.
use crate::adaptivity::{Adaptivity, AdaptivityOutcome, ErrorEstimator};
use crate::assembly::{Assembler, AssemblyInputs, JacobianTarget, SystemVectors};
use crate::config::SystemConfig;
use crate::dofs::DofMap;
use crate::error::{Result, SystemError};
use crate::evaluators::{Evaluable, PostprocessorValues};
use crate::factory::{Category, Factory};
use crate::fe_data::{FeInputs, SolutionView};
use crate::mesh::refinement::{refine_and_coarsen, RefinementFlag, RefinementRecord};
use crate::mesh::{BoundaryId, DisplacedMesh, Mesh, MeshState, SubdomainId};
use crate::output::{OutputSnapshot, SolutionWriter};
use crate::params::Parameters;
use crate::quadrature::QuadratureTable;
use crate::state::SystemState;
use crate::thread_data::{ThreadContext, ThreadDataManager};
use crate::time::{TimeIntegrator, TimeScheme};
use crate::variables::{AuxVariableId, CoupledVariableId, FeType, VariableId, VariableRegistry};
use crate::warehouse::{ApplicabilityTables, Registration, ThreadWarehouse, WarehouseSet};
use log::{info, warn};
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeSet;
use std::sync::Arc;

fn build_pool(num_threads: usize) -> Result<ThreadPool> {
    Ok(ThreadPoolBuilder::new().num_threads(num_threads).build()?)
}

/// A coupled multiphysics system on a single mesh.
///
/// Typical use:
///
/// 1. [`new`](Self::new), [`set_mesh`](Self::set_mesh), register variables and evaluators.
/// 2. [`init`](Self::init), which numbers dofs and applies initial conditions.
/// 3. Hand [`compute_residual`](Self::compute_residual) and
///    [`compute_jacobian`](Self::compute_jacobian) to a nonlinear solver, and drive time steps
///    through [`on_timestep_begin`](Self::on_timestep_begin),
///    [`set_solution`](Self::set_solution) and [`advance_history`](Self::advance_history).
pub struct CoupledSystem {
    config: SystemConfig,
    state: SystemState,
    mesh: Option<MeshState>,
    variables: VariableRegistry,
    factory: Factory,
    warehouses: WarehouseSet,
    thread_data: ThreadDataManager,
    pool: ThreadPool,
    quadrature: QuadratureTable,
    dofs: DofMap,
    aux_dofs: DofMap,
    aux_solution: DVector<f64>,
    time: TimeIntegrator,
    adaptivity: Adaptivity,
    postprocessor_values: PostprocessorValues,
    /// Residual scaling factor per nonlinear variable.
    scaling: Vec<f64>,
    residual_copy: Option<DVector<f64>>,
    first_pass_done: bool,
    tables: ApplicabilityTables,
    writers: Vec<Box<dyn SolutionWriter>>,
    displacement_names: Option<Vec<String>>,
    mesh_changed_since_output: bool,
}

impl CoupledSystem {
    /// A system with every built-in evaluator type available.
    pub fn new(config: SystemConfig) -> Result<Self> {
        Self::with_factory(config, Factory::with_builtins())
    }

    /// A system constructing evaluators with the given factory.
    pub fn with_factory(config: SystemConfig, factory: Factory) -> Result<Self> {
        config.validate()?;
        let pool = build_pool(config.num_threads)?;
        let num_threads = pool.current_num_threads();
        Ok(Self {
            state: SystemState::Uninitialized,
            mesh: None,
            variables: VariableRegistry::new(),
            factory,
            warehouses: WarehouseSet::new(num_threads),
            thread_data: ThreadDataManager::new(),
            pool,
            quadrature: QuadratureTable::new(config.quadrature_points)?,
            dofs: DofMap::default(),
            aux_dofs: DofMap::default(),
            aux_solution: DVector::zeros(0),
            time: TimeIntegrator::new(&config.time),
            adaptivity: Adaptivity::new(&config.adaptivity),
            postprocessor_values: PostprocessorValues::default(),
            scaling: Vec::new(),
            residual_copy: None,
            first_pass_done: false,
            tables: ApplicabilityTables::default(),
            writers: Vec::new(),
            displacement_names: None,
            mesh_changed_since_output: true,
            config,
        })
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// The factory used for subsequent registrations, e.g. to add custom evaluator types.
    pub fn factory_mut(&mut self) -> &mut Factory {
        &mut self.factory
    }

    fn require_not_destroyed(&self, operation: &'static str) -> Result<()> {
        match self.state {
            SystemState::Destroyed => Err(SystemError::InvalidState {
                operation,
                state: self.state,
            }),
            _ => Ok(()),
        }
    }

    fn mesh_state(&self) -> Result<&MeshState> {
        self.mesh
            .as_ref()
            .ok_or_else(|| SystemError::Setup("no mesh has been set".to_string()))
    }

    fn mesh_state_mut(&mut self) -> Result<&mut MeshState> {
        self.mesh
            .as_mut()
            .ok_or_else(|| SystemError::Setup("no mesh has been set".to_string()))
    }

    // Mesh

    pub fn set_mesh(&mut self, mesh: Mesh) -> Result<()> {
        self.state.require_uninitialized("set_mesh")?;
        self.mesh = Some(MeshState::new(mesh));
        Ok(())
    }

    /// Requests a displaced view of the mesh driven by one displacement variable per dimension.
    pub fn init_displaced_mesh(&mut self, displacements: &[&str]) -> Result<()> {
        self.state.require_uninitialized("init_displaced_mesh")?;
        self.displacement_names = Some(displacements.iter().map(|s| s.to_string()).collect());
        Ok(())
    }

    pub fn mesh(&self) -> Result<&Mesh> {
        Ok(self.mesh_state()?.mesh())
    }

    /// Mutable access to the mesh.
    ///
    /// On an initialized system this enters the mesh-changed state: every assembly, adaptivity
    /// and output entry point fails until [`mesh_changed`](Self::mesh_changed) is called.
    pub fn mesh_mut(&mut self) -> Result<&mut Mesh> {
        self.require_not_destroyed("mesh_mut")?;
        self.state.mark_mesh_modified();
        Ok(self.mesh_state_mut()?.mesh_mut())
    }

    /// Rebuilds everything derived from the mesh after a modification and transfers the
    /// solution history to the new dof layout.
    pub fn mesh_changed(&mut self) -> Result<()> {
        self.state.require_alive("mesh_changed")?;
        self.remesh(None)
    }

    pub fn active_element_range(&mut self) -> Result<Arc<[usize]>> {
        self.state.require_initialized("active_element_range")?;
        Ok(self.mesh_state_mut()?.active_element_range())
    }

    pub fn active_node_range(&mut self) -> Result<Arc<[usize]>> {
        self.state.require_initialized("active_node_range")?;
        Ok(self.mesh_state_mut()?.active_node_range())
    }

    // Variables

    pub fn add_variable(
        &mut self,
        name: &str,
        fe_type: FeType,
        blocks: Option<&[SubdomainId]>,
    ) -> Result<VariableId> {
        self.state.require_uninitialized("add_variable")?;
        let id = self.variables.add_variable(name, fe_type, blocks)?;
        self.scaling.push(1.0);
        Ok(id)
    }

    pub fn add_aux_variable(
        &mut self,
        name: &str,
        fe_type: FeType,
        blocks: Option<&[SubdomainId]>,
    ) -> Result<AuxVariableId> {
        self.state.require_uninitialized("add_aux_variable")?;
        self.variables.add_aux_variable(name, fe_type, blocks)
    }

    pub fn variables(&self) -> &VariableRegistry {
        &self.variables
    }

    pub fn dofs(&self) -> &DofMap {
        &self.dofs
    }

    pub fn aux_dofs(&self) -> &DofMap {
        &self.aux_dofs
    }

    // Evaluators

    /// Registers an evaluator of the given category.
    ///
    /// Registration is closed once the first assembly pass has run.
    pub fn register(&mut self, category: Category, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.require_not_destroyed("register")?;
        if self.first_pass_done {
            return Err(SystemError::RegistrationClosed {
                category: category.as_str(),
                name: name.to_string(),
            });
        }
        let registration = Registration {
            category,
            type_name: type_name.to_string(),
            name: name.to_string(),
            params,
        };
        self.warehouses
            .add(&self.factory, &self.variables, registration)?;
        if self.state != SystemState::Uninitialized {
            self.rebuild_layout()?;
        }
        Ok(())
    }

    pub fn add_kernel(&mut self, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.register(Category::Kernel, type_name, name, params)
    }

    pub fn add_dg_kernel(&mut self, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.register(Category::DgKernel, type_name, name, params)
    }

    pub fn add_bc(&mut self, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.register(Category::BoundaryCondition, type_name, name, params)
    }

    pub fn add_aux_kernel(&mut self, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.register(Category::AuxKernel, type_name, name, params)
    }

    pub fn add_material(&mut self, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.register(Category::Material, type_name, name, params)
    }

    pub fn add_stabilizer(&mut self, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.register(Category::Stabilizer, type_name, name, params)
    }

    pub fn add_initial_condition(&mut self, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.register(Category::InitialCondition, type_name, name, params)
    }

    pub fn add_postprocessor(&mut self, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.register(Category::Postprocessor, type_name, name, params)
    }

    pub fn add_function(&mut self, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.register(Category::Function, type_name, name, params)
    }

    pub fn add_damper(&mut self, type_name: &str, name: &str, params: Parameters) -> Result<()> {
        self.register(Category::Damper, type_name, name, params)
    }

    pub fn warehouses(&self) -> &WarehouseSet {
        &self.warehouses
    }

    pub fn tables(&self) -> &ApplicabilityTables {
        &self.tables
    }

    // Threads

    pub fn num_threads(&self) -> usize {
        self.warehouses.num_threads()
    }

    pub fn thread_data(&self) -> &ThreadDataManager {
        &self.thread_data
    }

    /// Changes the number of worker threads.
    ///
    /// Every evaluator is rebuilt from its registration for the new worker count and all
    /// thread data is reallocated.
    pub fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        self.require_not_destroyed("set_num_threads")?;
        let pool = build_pool(num_threads)?;
        let count = pool.current_num_threads();
        self.warehouses
            .replicate(&self.factory, &self.variables, count)?;
        self.pool = pool;
        self.config.num_threads = num_threads;
        if self.state != SystemState::Uninitialized {
            self.resize_thread_data();
        }
        info!("using {count} worker threads");
        Ok(())
    }

    fn resize_thread_data(&mut self) {
        let properties = self.warehouses.material_properties();
        self.thread_data
            .resize_all(self.warehouses.num_threads(), &mut self.variables, &properties);
    }

    // Lifecycle

    /// Numbers dofs, builds applicability tables and thread data, and applies initial
    /// conditions.
    pub fn init(&mut self) -> Result<()> {
        self.state.require_uninitialized("init")?;
        if let Some(names) = &self.displacement_names {
            let ids = names
                .iter()
                .map(|name| self.variables.variable_number(name))
                .collect::<Result<Vec<_>>>()?;
            let state = self
                .mesh
                .as_mut()
                .ok_or_else(|| SystemError::Setup("no mesh has been set".to_string()))?;
            let displaced = DisplacedMesh::new(state.mesh(), ids)?;
            state.set_displaced(displaced);
        }
        self.rebuild_layout()?;
        self.time.reset_history(DVector::zeros(self.dofs.num_dofs()));
        self.aux_solution = DVector::zeros(self.aux_dofs.num_dofs());
        self.project_initial_conditions()?;
        self.mesh_state_mut()?.take_changed();
        self.state = SystemState::Initialized;
        info!(
            "initialized system with {} nonlinear dofs, {} auxiliary dofs and {} worker threads",
            self.dofs.num_dofs(),
            self.aux_dofs.num_dofs(),
            self.num_threads()
        );
        Ok(())
    }

    /// Rebuilds dof maps, applicability tables and thread data for the current mesh.
    fn rebuild_layout(&mut self) -> Result<()> {
        let state = self
            .mesh
            .as_mut()
            .ok_or_else(|| SystemError::Setup("no mesh has been set".to_string()))?;
        let active = state.active_element_range();
        let mesh = state.mesh();
        self.dofs = DofMap::build(mesh, &active, self.variables.variables());
        self.aux_dofs = DofMap::build(mesh, &active, self.variables.aux_variables());
        self.tables = self
            .warehouses
            .build_tables(&self.variables, &mesh.subdomain_ids(), &mesh.boundary_ids())?;
        self.resize_thread_data();
        Ok(())
    }

    fn remesh(&mut self, record: Option<&RefinementRecord>) -> Result<()> {
        let old_dofs = std::mem::take(&mut self.dofs);
        let old_aux_dofs = std::mem::take(&mut self.aux_dofs);
        self.mesh_state_mut()?.invalidate();
        self.rebuild_layout()?;
        let dofs = &self.dofs;
        self.time
            .remap_history(|values| dofs.project(&old_dofs, record, values))?;
        self.aux_solution = self
            .aux_dofs
            .project(&old_aux_dofs, record, &self.aux_solution)?;
        self.residual_copy = None;
        self.update_displaced()?;
        self.mesh_state_mut()?.take_changed();
        self.mesh_changed_since_output = true;
        self.state = SystemState::Initialized;
        info!(
            "mesh changed: {} active elements, {} nonlinear dofs",
            self.mesh_state()?.mesh().num_active_elements(),
            self.dofs.num_dofs()
        );
        Ok(())
    }

    /// Releases evaluators and writers. Every later call fails.
    pub fn destroy(&mut self) {
        self.writers.clear();
        self.warehouses = WarehouseSet::new(1);
        self.thread_data = ThreadDataManager::new();
        self.state = SystemState::Destroyed;
        info!("system destroyed");
    }

    /// Checks that the registered evaluators describe a consistent problem.
    pub fn check_integrity(&self) -> Result<()> {
        let warehouse = self.warehouses.thread(0)?;
        let kernel_variables: BTreeSet<VariableId> = warehouse.kernels.iter().map(|k| k.variable()).collect();
        if let Some(orphan) = self
            .variables
            .variables()
            .iter()
            .enumerate()
            .find(|(i, _)| !kernel_variables.contains(&VariableId(*i)))
        {
            return Err(SystemError::Setup(format!(
                "nonlinear variable `{}` has no kernel",
                orphan.1.name
            )));
        }

        let mesh = self.mesh_state()?.mesh();
        let subdomains = mesh.subdomain_ids();
        let boundaries = mesh.boundary_ids();
        let check_blocks = |name: &str, blocks: &Option<Vec<SubdomainId>>| -> Result<()> {
            match blocks.iter().flatten().find(|b| !subdomains.contains(b)) {
                Some(block) => Err(SystemError::Setup(format!(
                    "`{name}` is restricted to subdomain {block}, which does not exist in the mesh"
                ))),
                None => Ok(()),
            }
        };
        let check_boundaries = |name: &str, ids: &[BoundaryId]| -> Result<()> {
            match ids.iter().find(|b| !boundaries.contains(b)) {
                Some(boundary) => Err(SystemError::Setup(format!(
                    "`{name}` acts on boundary {boundary}, which does not exist in the mesh"
                ))),
                None => Ok(()),
            }
        };
        let bases = warehouse
            .kernels
            .iter()
            .map(|e| e.base())
            .chain(warehouse.dg_kernels.iter().map(|e| e.base()))
            .chain(warehouse.integrated_bcs.iter().map(|e| e.base()))
            .chain(warehouse.nodal_bcs.iter().map(|e| e.base()))
            .chain(warehouse.aux_kernels.iter().map(|e| e.base()))
            .chain(warehouse.materials.iter().map(|e| e.base()))
            .chain(warehouse.stabilizers.iter().map(|e| e.base()))
            .chain(warehouse.initial_conditions.iter().map(|e| e.base()))
            .chain(warehouse.postprocessors.iter().map(|e| e.base()))
            .chain(warehouse.dampers.iter().map(|e| e.base()));
        for base in bases {
            check_blocks(&base.name, &base.blocks)?;
            check_boundaries(&base.name, &base.boundaries)?;
        }
        Ok(())
    }

    fn begin_assembly(&mut self, operation: &'static str) -> Result<()> {
        self.state.require_initialized(operation)?;
        if !self.first_pass_done {
            self.check_integrity()?;
            self.first_pass_done = true;
        }
        Ok(())
    }

    // Assembly

    fn update_displaced(&mut self) -> Result<()> {
        let state = self
            .mesh
            .as_mut()
            .ok_or_else(|| SystemError::Setup("no mesh has been set".to_string()))?;
        state.update_displaced(&self.dofs, &self.time.history().current)
    }

    /// Records `solution` as the current trial iterate and forms its time derivative.
    fn load_solution(&mut self, solution: &DVector<f64>) -> Result<()> {
        self.time.set_iterate(solution)?;
        if self.time.is_transient() {
            self.time.compute_time_derivative(solution)?;
        }
        self.update_displaced()
    }

    /// Runs `f` with an assembler over the current mesh, thread data and evaluators.
    fn assemble<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(
            &Assembler,
            SystemVectors,
            &mut [ThreadContext],
            &mut [ThreadWarehouse],
            &mut DVector<f64>,
        ) -> Result<T>,
    {
        self.thread_data
            .check_fresh(&self.variables, self.warehouses.num_threads())?;
        let state = self
            .mesh
            .as_mut()
            .ok_or_else(|| SystemError::Setup("no mesh has been set".to_string()))?;
        let topology = state.topology();
        let active_elements = state.active_element_range();
        let active_nodes = state.active_node_range();
        let state = &*state;
        let inputs = AssemblyInputs {
            mesh: state.mesh(),
            displaced: state.displaced().map(|d| d.vertices()),
            topology: &topology,
            active_elements: &active_elements,
            active_nodes: &active_nodes,
            registry: &self.variables,
            dofs: &self.dofs,
            aux_dofs: &self.aux_dofs,
            quadrature: &self.quadrature,
            tables: &self.tables,
            time: self.time.view(),
            postprocessors: &self.postprocessor_values,
        };
        let history = self.time.history();
        let vectors = SystemVectors {
            current: &history.current,
            u_dot: self.time.is_transient().then(|| self.time.u_dot()),
            du_dot_du: self.time.du_dot_du(),
            old: Some(&history.old),
            older: Some(&history.older),
        };
        let assembler = Assembler::new(&self.pool, inputs);
        f(
            &assembler,
            vectors,
            self.thread_data.contexts_mut(),
            self.warehouses.threads_mut(),
            &mut self.aux_solution,
        )
    }

    fn scaling_vector(&self) -> Option<DVector<f64>> {
        if self.scaling.iter().all(|&s| s == 1.0) {
            return None;
        }
        let mut scale = DVector::from_element(self.dofs.num_dofs(), 1.0);
        for (var, &factor) in self.scaling.iter().enumerate() {
            if var < self.dofs.num_variables() {
                scale
                    .rows_mut(self.dofs.variable(var).range().start, self.dofs.variable(var).num_dofs())
                    .fill(factor);
            }
        }
        Some(scale)
    }

    /// Computes the residual at `solution`, which becomes the current iterate.
    pub fn compute_residual(&mut self, solution: &DVector<f64>) -> Result<DVector<f64>> {
        self.begin_assembly("compute_residual")?;
        self.load_solution(solution)?;
        if self.config.compute_postprocessors_each_residual {
            self.run_postprocessors()?;
        }
        let need_copy = self.config.need_residual_copy;
        let output = self.assemble(|assembler, vectors, contexts, warehouses, aux| {
            assembler.residual(contexts, warehouses, vectors, aux, need_copy)
        })?;
        let mut residual = output.residual;
        let mut copy = output.copy;
        if let Some(scale) = self.scaling_vector() {
            residual.component_mul_assign(&scale);
            if let Some(copy) = &mut copy {
                copy.component_mul_assign(&scale);
            }
        }
        self.residual_copy = copy;
        Ok(residual)
    }

    fn scale_rows(&self, matrix: &mut CsrMatrix<f64>, row_offset: usize) {
        if let Some(scale) = self.scaling_vector() {
            for (row, mut lane) in matrix.row_iter_mut().enumerate() {
                let factor = scale[row + row_offset];
                lane.values_mut().iter_mut().for_each(|v| *v *= factor);
            }
        }
    }

    /// Computes the Jacobian of the residual at `solution`.
    pub fn compute_jacobian(&mut self, solution: &DVector<f64>) -> Result<CsrMatrix<f64>> {
        self.begin_assembly("compute_jacobian")?;
        self.load_solution(solution)?;
        let mut matrix = self.assemble(|assembler, vectors, contexts, warehouses, aux| {
            assembler.jacobian(contexts, warehouses, vectors, aux, JacobianTarget::Full)
        })?;
        self.scale_rows(&mut matrix, 0);
        Ok(matrix)
    }

    /// Computes the block of the Jacobian coupling the equations of `ivar` to `jvar`, which
    /// may be a nonlinear or an auxiliary variable.
    pub fn compute_jacobian_block(
        &mut self,
        solution: &DVector<f64>,
        ivar: VariableId,
        jvar: CoupledVariableId,
    ) -> Result<CsrMatrix<f64>> {
        self.begin_assembly("compute_jacobian_block")?;
        self.load_solution(solution)?;
        let target = JacobianTarget::Block { ivar, jvar };
        let mut matrix = self.assemble(|assembler, vectors, contexts, warehouses, aux| {
            assembler.jacobian(contexts, warehouses, vectors, aux, target)
        })?;
        let offset = self.dofs.variable(ivar.0).range().start;
        self.scale_rows(&mut matrix, offset);
        Ok(matrix)
    }

    /// The damping factor for the proposed `update` of `solution`. Returns 1 without dampers.
    pub fn compute_damping(&mut self, solution: &DVector<f64>, update: &DVector<f64>) -> Result<f64> {
        self.begin_assembly("compute_damping")?;
        self.load_solution(solution)?;
        self.assemble(|assembler, vectors, contexts, warehouses, aux| {
            assembler.damping(contexts, warehouses, vectors, aux, update)
        })
    }

    /// Evaluates every postprocessor at `solution`, which becomes the current iterate.
    pub fn compute_postprocessors(&mut self, solution: &DVector<f64>) -> Result<()> {
        self.begin_assembly("compute_postprocessors")?;
        self.load_solution(solution)?;
        self.run_postprocessors()
    }

    fn run_postprocessors(&mut self) -> Result<()> {
        let values = self.assemble(|assembler, vectors, contexts, warehouses, aux| {
            assembler.postprocessors(contexts, warehouses, vectors, aux)
        })?;
        self.postprocessor_values = values;
        Ok(())
    }

    pub fn postprocessor_value(&self, name: &str) -> Result<f64> {
        self.require_not_destroyed("postprocessor_value")?;
        self.postprocessor_values
            .get(name)
            .ok_or_else(|| SystemError::Unknown {
                category: "postprocessor",
                name: name.to_string(),
            })
    }

    pub fn postprocessor_values(&self) -> &PostprocessorValues {
        &self.postprocessor_values
    }

    fn project_initial_conditions(&mut self) -> Result<()> {
        let mut solution = self.time.history().current.clone();
        let start_time = self.config.time.start_time;
        self.assemble(|assembler, _, _, warehouses, aux| {
            let warehouse = warehouses
                .first_mut()
                .ok_or_else(|| SystemError::ContractViolation("no worker threads allocated".to_string()))?;
            assembler.project_initial_conditions(warehouse, start_time, &mut solution, aux)
        })?;
        self.time.reset_history(solution);
        self.update_displaced()
    }

    /// Re-applies the initial conditions on the current mesh and resets the history to them.
    pub fn reapply_initial_conditions(&mut self) -> Result<()> {
        self.state.require_initialized("reapply_initial_conditions")?;
        self.project_initial_conditions()
    }

    pub fn set_variable_scaling(&mut self, var: VariableId, factor: f64) -> Result<()> {
        if !(factor > 0.0 && factor.is_finite()) {
            return Err(SystemError::Setup(format!("scaling factor must be positive, got {factor}")));
        }
        let slot = self.scaling.get_mut(var.0).ok_or_else(|| SystemError::Unknown {
            category: "variable",
            name: format!("{var:?}"),
        })?;
        *slot = factor;
        Ok(())
    }

    pub fn need_residual_copy(&mut self, need: bool) {
        self.config.need_residual_copy = need;
    }

    /// The residual of the last pass before boundary conditions were applied, if requested.
    pub fn residual_copy(&self) -> Option<&DVector<f64>> {
        self.residual_copy.as_ref()
    }

    pub fn need_postprocessors_for_residuals(&mut self, need: bool) {
        self.config.compute_postprocessors_each_residual = need;
    }

    // Time integration

    pub fn time(&self) -> &TimeIntegrator {
        &self.time
    }

    /// The current solution.
    pub fn solution(&self) -> &DVector<f64> {
        &self.time.history().current
    }

    pub fn aux_solution(&self) -> &DVector<f64> {
        &self.aux_solution
    }

    /// Once-per-step hook: runs the timestep setup of every evaluator and resets the adaptivity
    /// cycle count.
    pub fn on_timestep_begin(&mut self) -> Result<()> {
        self.state.require_initialized("on_timestep_begin")?;
        self.warehouses.timestep_setup(&self.time.view())?;
        self.adaptivity.begin_step();
        Ok(())
    }

    /// Records the accepted solution of the current step.
    pub fn set_solution(&mut self, solution: &DVector<f64>) -> Result<()> {
        self.state.require_initialized("set_solution")?;
        self.time.set_current(solution)?;
        self.update_displaced()
    }

    /// Shifts the solution history. Must be called exactly once per accepted step.
    pub fn advance_history(&mut self) -> Result<()> {
        self.state.require_initialized("advance_history")?;
        self.time.advance_history()
    }

    pub fn set_dt(&mut self, dt: f64) -> Result<()> {
        self.require_not_destroyed("set_dt")?;
        self.time.set_dt(dt)
    }

    pub fn on_step_size_changed(&mut self) -> Result<()> {
        self.require_not_destroyed("on_step_size_changed")?;
        self.time.on_step_size_changed();
        Ok(())
    }

    /// Selects the time integration scheme. Must be followed by
    /// [`on_step_size_changed`](Self::on_step_size_changed).
    pub fn select_scheme(&mut self, scheme: TimeScheme) -> Result<()> {
        self.require_not_destroyed("select_scheme")?;
        self.time.select_scheme(scheme);
        Ok(())
    }

    // Adaptivity

    pub fn adaptivity(&self) -> &Adaptivity {
        &self.adaptivity
    }

    pub fn adaptivity_mut(&mut self) -> &mut Adaptivity {
        &mut self.adaptivity
    }

    pub fn configure_adaptivity(&mut self, max_cycles: usize, initial_cycles: usize) -> Result<()> {
        self.require_not_destroyed("configure_adaptivity")?;
        self.adaptivity.configure(max_cycles, initial_cycles);
        Ok(())
    }

    pub fn set_error_estimator(&mut self, estimator: Box<dyn ErrorEstimator>) {
        self.adaptivity.set_estimator(estimator);
    }

    /// Estimates the error of the current solution, refines and coarsens the mesh accordingly
    /// and transfers the solution to the new mesh.
    pub fn adapt(&mut self) -> Result<AdaptivityOutcome> {
        self.state.require_initialized("adapt")?;
        if !self.adaptivity.cycle_available() {
            info!(
                "adaptivity cycle limit of {} reached for this step",
                self.adaptivity.max_cycles()
            );
            return Ok(AdaptivityOutcome::CycleLimitReached);
        }
        self.adaptivity.count_cycle();

        let state = self
            .mesh
            .as_mut()
            .ok_or_else(|| SystemError::Setup("no mesh has been set".to_string()))?;
        let topology = state.topology();
        let active = state.active_element_range();
        let mesh = state.mesh();
        let inputs = FeInputs {
            mesh,
            vertices: mesh.vertices(),
            registry: &self.variables,
            dofs: &self.dofs,
            aux_dofs: &self.aux_dofs,
            quadrature: &self.quadrature,
            solution: SolutionView {
                current: &self.time.history().current,
                aux: &self.aux_solution,
                u_dot: None,
                du_dot_du: 0.0,
                old: None,
                older: None,
                increment: None,
            },
        };
        self.adaptivity.estimate(&inputs, &topology, &active)?;
        let flags = self.adaptivity.flag(mesh, &topology, &active);
        if flags.iter().all(|flag| *flag == RefinementFlag::DoNothing) {
            info!("adaptivity flagged no elements");
            return Ok(AdaptivityOutcome::Unchanged);
        }

        let max_level = self.adaptivity.policy().max_h_level;
        let record = refine_and_coarsen(state.mesh_mut(), &flags, max_level)?;
        if record.is_empty() {
            warn!("adaptivity flagged elements, but none could be refined or coarsened");
            state.take_changed();
            return Ok(AdaptivityOutcome::Unchanged);
        }
        self.remesh(Some(&record))?;
        let outcome = AdaptivityOutcome::Changed {
            refined: record.refined.len(),
            coarsened: record.coarsened.len(),
        };
        info!("adaptivity: {outcome:?}");
        Ok(outcome)
    }

    /// Adapts the mesh to the initial condition before any solve.
    ///
    /// Runs up to `initial_cycles` rounds of applying initial conditions and adapting, then
    /// applies the initial conditions once more on the final mesh.
    pub fn run_initial_adaptivity(&mut self) -> Result<()> {
        self.state.require_initialized("run_initial_adaptivity")?;
        for _ in 0..self.adaptivity.initial_cycles() {
            self.project_initial_conditions()?;
            self.adaptivity.begin_step();
            if !self.adapt()?.is_changed() {
                break;
            }
        }
        self.adaptivity.begin_step();
        self.project_initial_conditions()
    }

    // Output

    pub fn add_output(&mut self, writer: Box<dyn SolutionWriter>) {
        self.writers.push(writer);
    }

    /// Hands the current state to every registered writer.
    pub fn output_system(&mut self, step: usize, time: f64) -> Result<()> {
        self.state.require_initialized("output_system")?;
        let state = self
            .mesh
            .as_ref()
            .ok_or_else(|| SystemError::Setup("no mesh has been set".to_string()))?;
        let snapshot = OutputSnapshot {
            step,
            time,
            mesh: state.mesh(),
            registry: &self.variables,
            dofs: &self.dofs,
            aux_dofs: &self.aux_dofs,
            solution: &self.time.history().current,
            aux_solution: &self.aux_solution,
            postprocessors: &self.postprocessor_values,
            mesh_changed: self.mesh_changed_since_output,
        };
        for writer in &mut self.writers {
            writer.write(&snapshot)?;
        }
        for (name, value) in self.postprocessor_values.iter() {
            info!("step {step}, t = {time}: {name} = {value}");
        }
        self.mesh_changed_since_output = false;
        Ok(())
    }
}
