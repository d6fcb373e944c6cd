use fenris_multiphysics::config::{SystemConfig, TimeConfig};
use fenris_multiphysics::mesh::procedural::create_uniform_line_mesh;
use fenris_multiphysics::params::Parameters;
use fenris_multiphysics::time::TimeScheme;
use fenris_multiphysics::variables::FeType;
use fenris_multiphysics::CoupledSystem;
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use nalgebra::DVector;

/// `u_t = 0` on two segments of `[0, 1]`, so the residual is the mass matrix applied to `u_dot`.
fn transient_system(scheme: TimeScheme, dt: f64) -> CoupledSystem {
    let config = SystemConfig {
        num_threads: 1,
        time: TimeConfig {
            transient: true,
            scheme,
            start_time: 0.0,
            dt,
        },
        ..SystemConfig::default()
    };
    let mut system = CoupledSystem::new(config).unwrap();
    system
        .set_mesh(create_uniform_line_mesh(0.0, 1.0, 2).unwrap())
        .unwrap();
    system.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
    system
        .add_kernel("TimeDerivative", "dt", Parameters::new().with("variable", "u"))
        .unwrap();
    system.init().unwrap();
    system
}

#[test]
fn implicit_euler_derivative_is_a_backward_difference() {
    let mut system = transient_system(TimeScheme::ImplicitEuler, 0.1);
    let current = DVector::from_element(3, 1.0);
    let residual = system.compute_residual(&current).unwrap();

    let expected_u_dot = DVector::from_element(3, 10.0);
    assert_matrix_eq!(system.time().u_dot().clone(), expected_u_dot, comp = abs, tol = 1e-12);
    // Mass matrix row sums on two segments of length 1/2
    let expected = DVector::from_column_slice(&[2.5, 5.0, 2.5]);
    assert_matrix_eq!(residual, expected, comp = abs, tol = 1e-10);

    let jacobian = nalgebra::DMatrix::from(&system.compute_jacobian(&current).unwrap());
    // du_dot/du = 1/dt times the consistent mass matrix
    assert_scalar_eq!(jacobian[(0, 0)], 10.0 * 0.5 / 3.0, comp = abs, tol = 1e-10);
    assert_scalar_eq!(jacobian[(0, 1)], 10.0 * 0.5 / 6.0, comp = abs, tol = 1e-10);
}

#[test]
fn advancing_history_moves_the_clock_and_shifts_solutions() {
    let mut system = transient_system(TimeScheme::ImplicitEuler, 0.1);
    assert_scalar_eq!(system.time().time(), 0.1, comp = abs, tol = 1e-14);

    system.on_timestep_begin().unwrap();
    let first = DVector::from_element(3, 2.0);
    system.set_solution(&first).unwrap();
    system.advance_history().unwrap();

    assert_eq!(system.time().t_step(), 1);
    assert_scalar_eq!(system.time().time(), 0.2, comp = abs, tol = 1e-14);
    assert_eq!(system.time().history().old, first);

    // The derivative of the next step is taken relative to the accepted solution
    let second = DVector::from_element(3, 2.5);
    system.compute_residual(&second).unwrap();
    let expected_u_dot = DVector::from_element(3, 5.0);
    assert_matrix_eq!(system.time().u_dot().clone(), expected_u_dot, comp = abs, tol = 1e-10);
}

#[test]
fn advancing_twice_without_a_new_solution_is_a_contract_violation() {
    let mut system = transient_system(TimeScheme::ImplicitEuler, 0.1);
    system.set_solution(&DVector::from_element(3, 1.0)).unwrap();
    system.advance_history().unwrap();
    let error = system.advance_history().unwrap_err();
    assert!(error.is_contract_violation());
}

#[test]
fn residual_iterates_are_not_accepted_steps() {
    let mut system = transient_system(TimeScheme::ImplicitEuler, 0.1);
    let accepted = DVector::from_element(3, 1.0);
    system.set_solution(&accepted).unwrap();
    system.advance_history().unwrap();

    // A trial iterate that the nonlinear solver later rejects
    system.compute_residual(&DVector::from_element(3, 5.0)).unwrap();
    let error = system.advance_history().unwrap_err();
    assert!(error.is_contract_violation());
    assert_eq!(system.time().history().old, accepted);
    assert_eq!(system.time().t_step(), 1);
}

#[test]
fn crank_nicolson_uses_the_trapezoidal_rate() {
    let mut system = transient_system(TimeScheme::CrankNicolson, 0.1);
    assert_eq!(system.time().scheme().order(), 2);

    // u_dot = 2 (u - u_old) / dt - u_dot_old with u_dot_old = 0 on the first step
    let first = DVector::from_element(3, 0.1);
    let residual = system.compute_residual(&first).unwrap();
    assert_matrix_eq!(system.time().u_dot().clone(), DVector::from_element(3, 2.0), comp = abs, tol = 1e-10);
    let expected = DVector::from_column_slice(&[0.5, 1.0, 0.5]);
    assert_matrix_eq!(residual, expected, comp = abs, tol = 1e-10);

    let jacobian = nalgebra::DMatrix::from(&system.compute_jacobian(&first).unwrap());
    assert_scalar_eq!(jacobian[(0, 0)], 20.0 * 0.5 / 3.0, comp = abs, tol = 1e-10);

    system.set_solution(&first).unwrap();
    system.advance_history().unwrap();
    assert_eq!(system.time().history().u_dot_old, DVector::from_element(3, 2.0));

    system.compute_residual(&DVector::from_element(3, 0.3)).unwrap();
    assert_matrix_eq!(system.time().u_dot().clone(), DVector::from_element(3, 2.0), comp = abs, tol = 1e-10);
}

#[test]
fn crank_nicolson_history_requires_fresh_weights() {
    let mut system = transient_system(TimeScheme::CrankNicolson, 0.1);
    system.set_solution(&DVector::from_element(3, 0.1)).unwrap();
    system.set_dt(0.1).unwrap();
    assert!(system.advance_history().unwrap_err().is_contract_violation());

    system.on_step_size_changed().unwrap();
    system.advance_history().unwrap();
    assert_eq!(system.time().history().u_dot_old, DVector::from_element(3, 2.0));
}

#[test]
fn switching_schemes_requires_refreshing_weights() {
    let mut system = transient_system(TimeScheme::ImplicitEuler, 0.1);
    system.select_scheme(TimeScheme::CrankNicolson).unwrap();
    let stale = system.compute_residual(&DVector::from_element(3, 0.1));
    assert!(stale.unwrap_err().is_contract_violation());
    system.on_step_size_changed().unwrap();
    system.compute_residual(&DVector::from_element(3, 0.1)).unwrap();
    assert_matrix_eq!(system.time().u_dot().clone(), DVector::from_element(3, 2.0), comp = abs, tol = 1e-10);
}

#[test]
fn changing_the_step_size_requires_refreshing_weights() {
    let mut system = transient_system(TimeScheme::ImplicitEuler, 0.1);
    system.set_dt(0.05).unwrap();
    let stale = system.compute_residual(&DVector::from_element(3, 1.0));
    assert!(stale.unwrap_err().is_contract_violation());

    system.on_step_size_changed().unwrap();
    system.compute_residual(&DVector::from_element(3, 1.0)).unwrap();
    let expected_u_dot = DVector::from_element(3, 20.0);
    assert_matrix_eq!(system.time().u_dot().clone(), expected_u_dot, comp = abs, tol = 1e-10);

    assert!(system.set_dt(-1.0).is_err());
}

#[test]
fn bdf2_uses_two_previous_solutions_after_the_first_step() {
    let mut system = transient_system(TimeScheme::Bdf2, 0.1);
    // u(t) = t, sampled at t = 0 (initial), 0.1 and 0.2
    system.set_solution(&DVector::from_element(3, 0.1)).unwrap();
    system.advance_history().unwrap();
    system.compute_residual(&DVector::from_element(3, 0.2)).unwrap();
    let expected_u_dot = DVector::from_element(3, 1.0);
    assert_matrix_eq!(system.time().u_dot().clone(), expected_u_dot, comp = abs, tol = 1e-10);
}

#[test]
fn steady_systems_have_no_time_derivative_contribution() {
    let config = SystemConfig {
        num_threads: 1,
        ..SystemConfig::default()
    };
    let mut system = CoupledSystem::new(config).unwrap();
    system
        .set_mesh(create_uniform_line_mesh(0.0, 1.0, 2).unwrap())
        .unwrap();
    system.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
    system
        .add_kernel("TimeDerivative", "dt", Parameters::new().with("variable", "u"))
        .unwrap();
    system.init().unwrap();
    let residual = system.compute_residual(&DVector::from_element(3, 1.0)).unwrap();
    assert_matrix_eq!(residual, DVector::zeros(3), comp = abs, tol = 1e-14);
}
