use fenris_multiphysics::config::SystemConfig;
use fenris_multiphysics::mesh::procedural::{assign_subdomain, create_uniform_line_mesh};
use fenris_multiphysics::params::Parameters;
use fenris_multiphysics::variables::FeType;
use fenris_multiphysics::CoupledSystem;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};

#[test]
fn penalty_jump_couples_neighboring_elements() {
    let mut system = CoupledSystem::new(SystemConfig::default()).unwrap();
    system
        .set_mesh(create_uniform_line_mesh(0.0, 1.0, 2).unwrap())
        .unwrap();
    system.add_variable("c", FeType::MONOMIAL_CONSTANT, None).unwrap();
    system
        .add_kernel(
            "Reaction",
            "zero",
            Parameters::new().with("variable", "c").with("rate", 0.0),
        )
        .unwrap();
    system
        .add_dg_kernel(
            "PenaltyJump",
            "jump",
            Parameters::new().with("variable", "c").with("penalty", 2.0),
        )
        .unwrap();
    system.init().unwrap();

    let c = DVector::from_column_slice(&[0.0, 1.0]);
    let residual = system.compute_residual(&c).unwrap();
    assert_matrix_eq!(residual, DVector::from_column_slice(&[-2.0, 2.0]), comp = abs, tol = 1e-12);

    let jacobian = DMatrix::from(&system.compute_jacobian(&c).unwrap());
    let expected = DMatrix::from_row_slice(2, 2, &[2.0, -2.0, -2.0, 2.0]);
    assert_matrix_eq!(jacobian, expected, comp = abs, tol = 1e-12);
}

/// A body force on `u`, integrated over the mesh displaced by `disp`.
fn displaced_line() -> CoupledSystem {
    let mut system = CoupledSystem::new(SystemConfig::default()).unwrap();
    system
        .set_mesh(create_uniform_line_mesh(0.0, 1.0, 2).unwrap())
        .unwrap();
    system.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
    system.add_variable("disp", FeType::LAGRANGE_FIRST, None).unwrap();
    system.init_displaced_mesh(&["disp"]).unwrap();
    system
        .add_kernel(
            "BodyForce",
            "force",
            Parameters::new()
                .with("variable", "u")
                .with("value", 1.0)
                .with("use_displaced_mesh", true),
        )
        .unwrap();
    system
        .add_kernel("Reaction", "pin", Parameters::new().with("variable", "disp"))
        .unwrap();
    system.init().unwrap();
    system
}

#[test]
fn translated_mesh_gives_the_reference_residual() {
    let mut system = displaced_line();
    let u_range = system.dofs().variable(0).range();
    let mut x = DVector::zeros(system.dofs().num_dofs());
    for dof in system.dofs().variable(1).range() {
        x[dof] = 0.3;
    }
    let residual = system.compute_residual(&x).unwrap();
    let expected = DVector::from_column_slice(&[-0.25, -0.5, -0.25]);
    assert_matrix_eq!(residual.rows(u_range.start, u_range.len()).clone_owned(), expected, comp = abs, tol = 1e-12);
}

#[test]
fn stretched_mesh_scales_the_body_force() {
    let mut system = displaced_line();
    let mesh = system.mesh().unwrap().clone();
    let u_range = system.dofs().variable(0).range();
    let mut x = DVector::zeros(system.dofs().num_dofs());
    // disp = x doubles the length of every element
    for node in 0..mesh.num_vertices() {
        let dof = system.dofs().node_dof(1, node).unwrap();
        x[dof] = mesh.vertices()[node].x;
    }
    let residual = system.compute_residual(&x).unwrap();
    let expected = DVector::from_column_slice(&[-0.5, -1.0, -0.5]);
    assert_matrix_eq!(residual.rows(u_range.start, u_range.len()).clone_owned(), expected, comp = abs, tol = 1e-12);
}

#[test]
fn block_restricted_variable_lives_on_its_subdomain() {
    let mut mesh = create_uniform_line_mesh(0.0, 1.0, 4).unwrap();
    assign_subdomain(&mut mesh, 1, |p| p.x > 0.5);

    let mut system = CoupledSystem::new(SystemConfig::default()).unwrap();
    system.set_mesh(mesh).unwrap();
    system.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
    system.add_variable("v", FeType::LAGRANGE_FIRST, Some(&[1u16][..])).unwrap();
    system
        .add_kernel("Diffusion", "diff_u", Parameters::new().with("variable", "u"))
        .unwrap();
    system
        .add_kernel(
            "BodyForce",
            "force_v",
            Parameters::new()
                .with("variable", "v")
                .with("value", 1.0)
                .with("block", 1i64),
        )
        .unwrap();
    system.init().unwrap();

    assert_eq!(system.dofs().variable(0).num_dofs(), 5);
    assert_eq!(system.dofs().variable(1).num_dofs(), 3);
    assert_eq!(system.dofs().node_dof(1, 1), None);
    assert!(system.dofs().node_dof(1, 2).is_some());

    let residual = system.compute_residual(&DVector::zeros(8)).unwrap();
    let v = system.dofs().variable(1).range();
    let expected = DVector::from_column_slice(&[-0.125, -0.25, -0.125]);
    assert_matrix_eq!(residual.rows(v.start, v.len()).clone_owned(), expected, comp = abs, tol = 1e-12);
}
