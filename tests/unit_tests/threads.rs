use crate::{coupled_quad_system, line_poisson};
use fenris_multiphysics::SystemError;
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use nalgebra::{DMatrix, DVector};
use proptest::collection::vec;
use proptest::prelude::*;

fn solution_from_samples(samples: &[f64], len: usize) -> DVector<f64> {
    DVector::from_fn(len, |i, _| samples[i % samples.len()])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn residual_and_jacobian_do_not_depend_on_thread_count(
        cells in 1usize..4,
        num_threads in 2usize..5,
        samples in vec(-1.0..1.0f64, 8..16),
    ) {
        let mut serial = coupled_quad_system(cells, 1);
        let mut parallel = coupled_quad_system(cells, num_threads);
        prop_assert_eq!(parallel.num_threads(), num_threads);
        let x = solution_from_samples(&samples, serial.dofs().num_dofs());

        let r_serial = serial.compute_residual(&x).unwrap();
        let r_parallel = parallel.compute_residual(&x).unwrap();
        assert_matrix_eq!(r_serial, r_parallel, comp = abs, tol = 1e-12);
        assert_matrix_eq!(serial.aux_solution().clone(), parallel.aux_solution().clone(), comp = abs, tol = 1e-12);

        let j_serial = DMatrix::from(&serial.compute_jacobian(&x).unwrap());
        let j_parallel = DMatrix::from(&parallel.compute_jacobian(&x).unwrap());
        assert_matrix_eq!(j_serial, j_parallel, comp = abs, tol = 1e-12);
    }
}

#[test]
fn changing_thread_count_rebuilds_evaluators() {
    let mut system = coupled_quad_system(3, 1);
    let x = DVector::from_fn(system.dofs().num_dofs(), |i, _| (i as f64).sin());
    let before = system.compute_residual(&x).unwrap();

    system.set_num_threads(3).unwrap();
    assert_eq!(system.num_threads(), 3);
    assert_eq!(system.thread_data().num_threads(), 3);
    assert_eq!(system.warehouses().threads().len(), 3);
    let after = system.compute_residual(&x).unwrap();
    assert_matrix_eq!(before, after, comp = abs, tol = 1e-12);
}

#[test]
fn postprocessors_aggregate_across_threads() {
    let mut serial = line_poisson(8, 1);
    let mut parallel = line_poisson(8, 4);
    for system in [&mut serial, &mut parallel] {
        system
            .add_postprocessor(
                "ElementIntegralVariable",
                "integral",
                fenris_multiphysics::params::Parameters::new().with("variable", "u"),
            )
            .unwrap();
        system.init().unwrap();
        let u = DVector::from_fn(9, |i, _| (i as f64 / 8.0).powi(2));
        system.compute_postprocessors(&u).unwrap();
    }
    assert_scalar_eq!(
        serial.postprocessor_value("integral").unwrap(),
        parallel.postprocessor_value("integral").unwrap(),
        comp = abs,
        tol = 1e-14
    );
}

#[test]
fn evaluator_errors_are_reported_from_worker_threads() {
    let mut system = line_poisson(6, 3);
    system
        .add_kernel(
            "PostprocessorSource",
            "source",
            fenris_multiphysics::params::Parameters::new()
                .with("variable", "u")
                .with("postprocessor", "never_computed"),
        )
        .unwrap();
    system.init().unwrap();
    let result = system.compute_residual(&DVector::zeros(7));
    match result {
        Err(SystemError::Evaluation { name, .. }) => assert_eq!(name, "source"),
        other => panic!("expected evaluation error, got {other:?}"),
    }
}
