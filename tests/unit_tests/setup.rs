use fenris_multiphysics::config::SystemConfig;
use fenris_multiphysics::factory::Category;
use fenris_multiphysics::mesh::procedural::create_uniform_line_mesh;
use fenris_multiphysics::setup::ProblemSetup;
use fenris_multiphysics::time::TimeScheme;
use fenris_multiphysics::variables::{CoupledVariableId, FeType, VariableRef};
use fenris_multiphysics::{CoupledSystem, SystemError};
use matrixcompare::assert_matrix_eq;
use nalgebra::DVector;

const POISSON: &str = r#"{
    "variables": [
        { "name": "u", "fe_type": { "family": "Lagrange", "order": "First" } }
    ],
    "aux_variables": [
        { "name": "flux", "fe_type": { "family": "Monomial", "order": "Constant" } }
    ],
    "registrations": [
        { "category": "Kernel", "type": "Diffusion", "name": "diff", "params": { "variable": "u" } },
        { "category": "Kernel", "type": "BodyForce", "name": "force", "params": { "variable": "u", "value": 1.0 } },
        { "category": "BoundaryCondition", "type": "DirichletBC", "name": "left",
          "params": { "variable": "u", "boundary": 0, "value": 0.0 } },
        { "category": "AuxKernel", "type": "ConstantAux", "name": "flux_aux",
          "params": { "variable": "flux", "value": 2.5 } },
        { "category": "Postprocessor", "type": "ElementIntegralVariable", "name": "total",
          "params": { "variable": "u" } }
    ]
}"#;

#[test]
fn problem_setup_from_json_builds_a_working_system() {
    let setup = ProblemSetup::from_json_str(POISSON).unwrap();
    assert_eq!(setup.variables.len(), 1);
    assert_eq!(setup.registrations.len(), 5);
    assert_eq!(setup.registrations[2].category, Category::BoundaryCondition);

    let mut system = CoupledSystem::new(SystemConfig::default()).unwrap();
    system
        .set_mesh(create_uniform_line_mesh(0.0, 1.0, 2).unwrap())
        .unwrap();
    setup.apply(&mut system).unwrap();
    system.init().unwrap();

    let residual = system.compute_residual(&DVector::zeros(3)).unwrap();
    let expected = DVector::from_column_slice(&[0.0, -0.5, -0.25]);
    assert_matrix_eq!(residual, expected, comp = abs, tol = 1e-12);
    assert_eq!(system.aux_solution(), &DVector::from_element(2, 2.5));
}

#[test]
fn problem_setup_survives_serialization() {
    let setup = ProblemSetup::from_json_str(POISSON).unwrap();
    let json = serde_json::to_string(&setup).unwrap();
    assert_eq!(ProblemSetup::from_json_str(&json).unwrap(), setup);
}

#[test]
fn malformed_setup_is_a_json_error() {
    let result = ProblemSetup::from_json_str(r#"{ "variables": [ { "name": 3 } ] }"#);
    assert!(matches!(result, Err(SystemError::Json(_))));
}

#[test]
fn config_from_json_fills_defaults() {
    let config = SystemConfig::from_json_str(
        r#"{ "num_threads": 3, "time": { "transient": true, "scheme": "Bdf2", "dt": 0.01 } }"#,
    )
    .unwrap();
    assert_eq!(config.num_threads, 3);
    assert_eq!(config.quadrature_points, 2);
    assert!(config.time.transient);
    assert_eq!(config.time.scheme, TimeScheme::Bdf2);
    assert_eq!(config.time.dt, 0.01);
    assert_eq!(config.adaptivity.max_cycles, 1);

    let invalid = SystemConfig::from_json_str(r#"{ "time": { "dt": -1.0 } }"#);
    assert!(matches!(invalid, Err(SystemError::Config(_))));
}

#[test]
fn auxiliary_variables_are_numbered_after_nonlinear_ones() {
    let mut system = CoupledSystem::new(SystemConfig::default()).unwrap();
    system
        .set_mesh(create_uniform_line_mesh(0.0, 1.0, 2).unwrap())
        .unwrap();
    let a = system.add_aux_variable("a", FeType::MONOMIAL_CONSTANT, None).unwrap();
    let u = system.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
    let v = system.add_variable("v", FeType::LAGRANGE_FIRST, None).unwrap();
    let b = system.add_aux_variable("b", FeType::LAGRANGE_FIRST, None).unwrap();

    let variables = system.variables();
    assert_eq!(variables.num_coupled(), 4);
    assert_eq!(variables.coupled_id(VariableRef::Nonlinear(u)), CoupledVariableId(0));
    assert_eq!(variables.coupled_id(VariableRef::Nonlinear(v)), CoupledVariableId(1));
    assert_eq!(variables.modified_aux_var_num(a), CoupledVariableId(2));
    assert_eq!(variables.modified_aux_var_num(b), CoupledVariableId(3));
    assert_eq!(variables.resolve(CoupledVariableId(3)), Some(VariableRef::Auxiliary(b)));
    assert_eq!(variables.resolve(CoupledVariableId(4)), None);
    assert!(matches!(
        system.add_variable("a", FeType::LAGRANGE_FIRST, None),
        Err(SystemError::DuplicateName { .. })
    ));
}
