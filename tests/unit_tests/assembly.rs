use crate::{coupled_quad_system, line_poisson, sample_solution};
use fenris_multiphysics::params::Parameters;
use fenris_multiphysics::variables::{CoupledVariableId, FeType, VariableId};
use fenris_multiphysics::SystemError;
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use nalgebra::{DMatrix, DVector};

#[test]
fn poisson_residual_on_two_segments() {
    let mut system = line_poisson(2, 1);
    system.init().unwrap();
    let residual = system.compute_residual(&DVector::zeros(3)).unwrap();
    let expected = DVector::from_column_slice(&[-0.25, -0.5, -0.25]);
    assert_matrix_eq!(residual, expected, comp = abs, tol = 1e-12);
}

#[test]
fn poisson_jacobian_is_the_stiffness_matrix() {
    let mut system = line_poisson(2, 1);
    system.init().unwrap();
    let jacobian = system.compute_jacobian(&DVector::zeros(3)).unwrap();
    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(3, 3, &[
        2.0, -2.0, 0.0,
        -2.0, 4.0, -2.0,
        0.0, -2.0, 2.0,
    ]);
    assert_matrix_eq!(DMatrix::from(&jacobian), expected, comp = abs, tol = 1e-12);
}

#[test]
fn dirichlet_condition_replaces_residual_and_jacobian_rows() {
    let mut system = line_poisson(2, 1);
    system
        .add_bc(
            "DirichletBC",
            "left",
            Parameters::new()
                .with("variable", "u")
                .with("boundary", 0i64)
                .with("value", 2.0),
        )
        .unwrap();
    system.need_residual_copy(true);
    system.init().unwrap();

    let residual = system.compute_residual(&DVector::zeros(3)).unwrap();
    let expected = DVector::from_column_slice(&[-2.0, -0.5, -0.25]);
    assert_matrix_eq!(residual, expected, comp = abs, tol = 1e-12);

    // The copy is taken before nodal conditions overwrite their rows
    let copy = system.residual_copy().unwrap().clone();
    let expected_copy = DVector::from_column_slice(&[-0.25, -0.5, -0.25]);
    assert_matrix_eq!(copy, expected_copy, comp = abs, tol = 1e-12);

    let jacobian = system.compute_jacobian(&DVector::zeros(3)).unwrap();
    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(3, 3, &[
        1.0, 0.0, 0.0,
        -2.0, 4.0, -2.0,
        0.0, -2.0, 2.0,
    ]);
    assert_matrix_eq!(DMatrix::from(&jacobian), expected, comp = abs, tol = 1e-12);
}

#[test]
fn jacobian_matches_finite_differences_of_the_residual() {
    let mut system = coupled_quad_system(3, 1);
    let n = system.dofs().num_dofs();
    let x = sample_solution(n);
    let jacobian = DMatrix::from(&system.compute_jacobian(&x).unwrap());

    let h = 1e-6;
    let mut fd = DMatrix::zeros(n, n);
    for j in 0..n {
        let mut plus = x.clone();
        let mut minus = x.clone();
        plus[j] += h;
        minus[j] -= h;
        let r_plus = system.compute_residual(&plus).unwrap();
        let r_minus = system.compute_residual(&minus).unwrap();
        fd.set_column(j, &((r_plus - r_minus) / (2.0 * h)));
    }
    assert_matrix_eq!(jacobian, fd, comp = abs, tol = 1e-6);
}

#[test]
fn jacobian_block_is_a_sub_block_of_the_full_jacobian() {
    let mut system = coupled_quad_system(2, 1);
    let n = system.dofs().num_dofs();
    let x = sample_solution(n);
    let full = DMatrix::from(&system.compute_jacobian(&x).unwrap());
    let u = system.dofs().variable(0).range();
    let v = system.dofs().variable(1).range();

    let block = system
        .compute_jacobian_block(&x, VariableId(1), CoupledVariableId(0))
        .unwrap();
    let expected = full.view((v.start, u.start), (v.len(), u.len())).clone_owned();
    assert_matrix_eq!(DMatrix::from(&block), expected, comp = abs, tol = 1e-12);

    let diagonal = system
        .compute_jacobian_block(&x, VariableId(0), CoupledVariableId(0))
        .unwrap();
    let expected = full.view((u.start, u.start), (u.len(), u.len())).clone_owned();
    assert_matrix_eq!(DMatrix::from(&diagonal), expected, comp = abs, tol = 1e-12);
}

#[test]
fn jacobian_block_against_an_auxiliary_variable() {
    let mut system = line_poisson(2, 1);
    let w = system.add_aux_variable("w", FeType::LAGRANGE_FIRST, None).unwrap();
    system
        .add_kernel(
            "CoupledForce",
            "source_from_w",
            Parameters::new().with("variable", "u").with("v", "w"),
        )
        .unwrap();
    system.init().unwrap();
    let w_id = system.variables().modified_aux_var_num(w);
    assert_eq!(w_id, CoupledVariableId(1));

    let x = DVector::from_column_slice(&[0.1, 0.4, 0.2]);
    let block = DMatrix::from(&system.compute_jacobian_block(&x, VariableId(0), w_id).unwrap());
    // -∫ φ_j φ_i: the negated mass matrix of two segments of length 1/2
    #[rustfmt::skip]
    let expected = -DMatrix::from_row_slice(3, 3, &[
        1.0 / 6.0,  1.0 / 12.0, 0.0,
        1.0 / 12.0, 1.0 / 3.0,  1.0 / 12.0,
        0.0,        1.0 / 12.0, 1.0 / 6.0,
    ]);
    assert_matrix_eq!(block, expected, comp = abs, tol = 1e-12);

    // Auxiliary columns never enter the full Jacobian
    let full = system.compute_jacobian(&x).unwrap();
    assert_eq!((full.nrows(), full.ncols()), (3, 3));
}

#[test]
fn jacobian_block_with_unknown_variable_fails() {
    let mut system = coupled_quad_system(1, 1);
    let x = DVector::zeros(system.dofs().num_dofs());
    let result = system.compute_jacobian_block(&x, VariableId(5), CoupledVariableId(0));
    assert!(matches!(result, Err(SystemError::Unknown { .. })));
}

#[test]
fn variable_scaling_multiplies_residual_and_jacobian_rows() {
    let mut system = line_poisson(2, 1);
    system.init().unwrap();
    system.set_variable_scaling(VariableId(0), 10.0).unwrap();
    let residual = system.compute_residual(&DVector::zeros(3)).unwrap();
    let expected = DVector::from_column_slice(&[-2.5, -5.0, -2.5]);
    assert_matrix_eq!(residual, expected, comp = abs, tol = 1e-12);

    let jacobian = DMatrix::from(&system.compute_jacobian(&DVector::zeros(3)).unwrap());
    assert_scalar_eq!(jacobian[(1, 1)], 40.0, comp = abs, tol = 1e-12);

    assert!(system.set_variable_scaling(VariableId(0), 0.0).is_err());
}

#[test]
fn auxiliary_kernels_update_auxiliary_solution_during_residual() {
    let mut system = coupled_quad_system(2, 1);
    let x = sample_solution(system.dofs().num_dofs());
    system.compute_residual(&x).unwrap();

    let num_vertices = system.mesh().unwrap().num_vertices();
    let num_elements = system.mesh().unwrap().num_elements();
    let dofs = system.dofs();
    let aux_dofs = system.aux_dofs();
    let aux = system.aux_solution();
    for node in 0..num_vertices {
        let u = x[dofs.node_dof(0, node).unwrap()];
        let w = aux[aux_dofs.node_dof(0, node).unwrap()];
        assert_scalar_eq!(w, 3.0 * u, comp = abs, tol = 1e-12);
    }
    for element in 0..num_elements {
        let k = aux[aux_dofs.element_dof(1, element).unwrap()];
        assert_scalar_eq!(k, 4.0, comp = abs, tol = 1e-12);
    }
}

#[test]
fn smallest_damping_factor_wins() {
    let mut system = line_poisson(2, 1);
    system
        .add_damper("ConstantDamper", "half", Parameters::new().with("damping", 0.5))
        .unwrap();
    system
        .add_damper("ConstantDamper", "most", Parameters::new().with("damping", 0.8))
        .unwrap();
    system.init().unwrap();
    let damping = system
        .compute_damping(&DVector::zeros(3), &DVector::from_element(3, 1.0))
        .unwrap();
    assert_scalar_eq!(damping, 0.5, comp = abs, tol = 1e-14);
}

#[test]
fn max_increment_damper_limits_the_largest_update() {
    let mut system = line_poisson(2, 1);
    system
        .add_damper(
            "MaxIncrementDamper",
            "limit",
            Parameters::new().with("variable", "u").with("max_increment", 0.1),
        )
        .unwrap();
    system.init().unwrap();
    let update = DVector::from_element(3, -0.4);
    let damping = system.compute_damping(&DVector::zeros(3), &update).unwrap();
    assert_scalar_eq!(damping, 0.25, comp = abs, tol = 1e-12);

    let small = DVector::from_element(3, 0.01);
    let damping = system.compute_damping(&DVector::zeros(3), &small).unwrap();
    assert_scalar_eq!(damping, 1.0, comp = abs, tol = 1e-14);
}

#[test]
fn no_dampers_means_full_step() {
    let mut system = line_poisson(2, 1);
    system.init().unwrap();
    let damping = system
        .compute_damping(&DVector::zeros(3), &DVector::from_element(3, 100.0))
        .unwrap();
    assert_eq!(damping, 1.0);
}

#[test]
fn residual_with_wrong_length_is_rejected() {
    let mut system = line_poisson(2, 1);
    system.init().unwrap();
    let result = system.compute_residual(&DVector::zeros(2));
    assert!(matches!(result, Err(SystemError::DimensionMismatch { expected: 3, actual: 2 })));
}
