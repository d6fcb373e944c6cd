use crate::line_poisson;
use fenris_multiphysics::config::SystemConfig;
use fenris_multiphysics::mesh::procedural::create_uniform_line_mesh;
use fenris_multiphysics::params::Parameters;
use fenris_multiphysics::state::SystemState;
use fenris_multiphysics::time::TimeScheme;
use fenris_multiphysics::variables::FeType;
use fenris_multiphysics::{CoupledSystem, SystemError};
use nalgebra::DVector;

#[test]
fn assembly_before_init_is_rejected() {
    let mut system = line_poisson(2, 1);
    assert_eq!(system.state(), SystemState::Uninitialized);
    let result = system.compute_residual(&DVector::zeros(3));
    assert!(matches!(
        result,
        Err(SystemError::InvalidState {
            state: SystemState::Uninitialized,
            ..
        })
    ));
    assert!(system.active_element_range().is_err());
}

#[test]
fn variables_cannot_be_added_after_init() {
    let mut system = line_poisson(2, 1);
    system.init().unwrap();
    assert_eq!(system.state(), SystemState::Initialized);
    let result = system.add_variable("v", FeType::LAGRANGE_FIRST, None);
    assert!(matches!(result, Err(SystemError::InvalidState { .. })));
    assert!(matches!(system.init(), Err(SystemError::InvalidState { .. })));
}

#[test]
fn init_without_mesh_fails() {
    let mut system = CoupledSystem::new(SystemConfig::default()).unwrap();
    system.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
    assert!(matches!(system.init(), Err(SystemError::Setup(_))));
}

#[test]
fn registration_closes_after_first_assembly() {
    let mut system = line_poisson(2, 1);
    system.init().unwrap();
    // Still open: nothing has been assembled yet
    system
        .add_kernel(
            "Reaction",
            "react",
            Parameters::new().with("variable", "u").with("rate", 1.0),
        )
        .unwrap();
    system.compute_residual(&DVector::zeros(3)).unwrap();
    let result = system.add_kernel("Diffusion", "late", Parameters::new().with("variable", "u"));
    assert!(matches!(
        result,
        Err(SystemError::RegistrationClosed { category: "kernel", .. })
    ));
}

#[test]
fn duplicate_names_and_unknown_types_are_rejected() {
    let mut system = line_poisson(2, 1);
    let duplicate = system.add_kernel("Diffusion", "diff", Parameters::new().with("variable", "u"));
    assert!(matches!(duplicate, Err(SystemError::DuplicateName { .. })));

    let unknown = system.add_kernel("NoSuchKernel", "x", Parameters::new().with("variable", "u"));
    assert!(matches!(unknown, Err(SystemError::Unknown { .. })));

    let bad_variable = system.add_kernel("Diffusion", "y", Parameters::new().with("variable", "nope"));
    assert!(matches!(bad_variable, Err(SystemError::Setup(_))));
}

#[test]
fn variable_without_kernel_fails_integrity_check() {
    let mut system = line_poisson(2, 1);
    system.add_variable("orphan", FeType::LAGRANGE_FIRST, None).unwrap();
    system.init().unwrap();
    let n = system.dofs().num_dofs();
    let result = system.compute_residual(&DVector::zeros(n));
    assert!(matches!(result, Err(SystemError::Setup(_))));
}

#[test]
fn restriction_to_missing_boundary_fails_integrity_check() {
    let mut system = line_poisson(2, 1);
    system
        .add_bc(
            "DirichletBC",
            "nowhere",
            Parameters::new().with("variable", "u").with("boundary", 7i64),
        )
        .unwrap();
    system.init().unwrap();
    assert!(matches!(system.check_integrity(), Err(SystemError::Setup(_))));
}

#[test]
fn pending_mesh_change_blocks_assembly_until_resolved() {
    let mut system = line_poisson(2, 1);
    system.init().unwrap();
    system.compute_residual(&DVector::zeros(3)).unwrap();

    system.mesh_mut().unwrap();
    assert_eq!(system.state(), SystemState::MeshChanged);
    let result = system.compute_residual(&DVector::zeros(3));
    assert!(matches!(result, Err(SystemError::PendingMeshChange { .. })));
    assert!(matches!(system.output_system(0, 0.0), Err(SystemError::PendingMeshChange { .. })));

    system.mesh_changed().unwrap();
    assert_eq!(system.state(), SystemState::Initialized);
    assert!(system.compute_residual(&DVector::zeros(3)).is_ok());
}

#[test]
fn mesh_change_without_refinement_keeps_the_solution() {
    let mut system = line_poisson(2, 1);
    system.init().unwrap();
    system.set_solution(&DVector::from_element(3, 1.5)).unwrap();

    *system.mesh_mut().unwrap() = create_uniform_line_mesh(0.0, 1.0, 2).unwrap();
    system.mesh_changed().unwrap();
    assert_eq!(system.solution().len(), 3);
    assert_eq!(system.solution(), &DVector::from_element(3, 1.5));
}

#[test]
fn destroyed_system_rejects_everything() {
    let mut system = line_poisson(2, 1);
    system.init().unwrap();
    system.destroy();
    assert_eq!(system.state(), SystemState::Destroyed);
    assert!(system.compute_residual(&DVector::zeros(3)).is_err());
    assert!(system.compute_jacobian(&DVector::zeros(3)).is_err());
    assert!(system.mesh_changed().is_err());
    assert!(system.mesh_mut().is_err());
    assert!(system
        .add_kernel("Diffusion", "again", Parameters::new().with("variable", "u"))
        .is_err());
    assert!(system.adapt().is_err());
    assert!(system.compute_postprocessors(&DVector::zeros(3)).is_err());
    assert!(matches!(
        system.postprocessor_value("anything"),
        Err(SystemError::InvalidState { .. })
    ));
    assert!(system.on_step_size_changed().is_err());
    assert!(system.select_scheme(TimeScheme::Bdf2).is_err());
    assert!(system.configure_adaptivity(2, 1).is_err());
}

#[test]
fn active_ranges_cover_the_mesh() {
    let mut system = line_poisson(4, 2);
    system.init().unwrap();
    assert_eq!(&*system.active_element_range().unwrap(), &[0, 1, 2, 3]);
    assert_eq!(&*system.active_node_range().unwrap(), &[0, 1, 2, 3, 4]);
}

#[test]
fn invalid_configuration_is_rejected() {
    let config = SystemConfig {
        quadrature_points: 0,
        ..SystemConfig::default()
    };
    assert!(matches!(CoupledSystem::new(config), Err(SystemError::Config(_))));
}
