use fenris_multiphysics::adaptivity::AdaptivityOutcome;
use fenris_multiphysics::config::{AdaptivityConfig, SystemConfig};
use fenris_multiphysics::mesh::procedural::{create_rectangular_uniform_quad_mesh, create_uniform_line_mesh};
use fenris_multiphysics::params::Parameters;
use fenris_multiphysics::variables::FeType;
use fenris_multiphysics::CoupledSystem;
use matrixcompare::assert_scalar_eq;

/// `-u'' = 0` on four segments with a hat-shaped initial condition peaking at `x = 0.5`.
fn hat_system(adaptivity: AdaptivityConfig) -> CoupledSystem {
    let config = SystemConfig {
        num_threads: 2,
        adaptivity,
        ..SystemConfig::default()
    };
    let mut system = CoupledSystem::new(config).unwrap();
    system
        .set_mesh(create_uniform_line_mesh(0.0, 1.0, 4).unwrap())
        .unwrap();
    system.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
    system.add_aux_variable("k", FeType::MONOMIAL_CONSTANT, None).unwrap();
    system
        .add_kernel("Diffusion", "diff", Parameters::new().with("variable", "u"))
        .unwrap();
    system
        .add_function(
            "PiecewiseLinear",
            "hat",
            Parameters::new()
                .with("axis", "x")
                .with("x", vec![0.0, 0.5, 1.0])
                .with("y", vec![0.0, 1.0, 0.0]),
        )
        .unwrap();
    system
        .add_initial_condition("FunctionIC", "ic", Parameters::new().with("variable", "u").with("function", "hat"))
        .unwrap();
    system
        .add_initial_condition("ConstantIC", "k_ic", Parameters::new().with("variable", "k").with("value", 3.0))
        .unwrap();
    system.init().unwrap();
    system
}

#[test]
fn error_below_threshold_leaves_mesh_unchanged() {
    let mut system = hat_system(AdaptivityConfig {
        refine_threshold: 1e6,
        ..AdaptivityConfig::default()
    });
    system.on_timestep_begin().unwrap();
    let outcome = system.adapt().unwrap();
    assert_eq!(outcome, AdaptivityOutcome::Unchanged);
    assert_eq!(system.mesh().unwrap().num_active_elements(), 4);
    assert_eq!(system.dofs().num_dofs(), 5);
}

#[test]
fn gradient_jump_refines_the_kink_and_projects_the_solution() {
    let mut system = hat_system(AdaptivityConfig::default());
    system.on_timestep_begin().unwrap();
    let outcome = system.adapt().unwrap();
    assert_eq!(
        outcome,
        AdaptivityOutcome::Changed {
            refined: 2,
            coarsened: 0
        }
    );
    assert_eq!(system.mesh().unwrap().num_active_elements(), 6);
    assert_eq!(system.dofs().num_dofs(), 7);
    assert_eq!(system.solution().len(), 7);

    // The hat is linear on each refined element, so the projection reproduces it exactly
    let mesh = system.mesh().unwrap().clone();
    let dofs = system.dofs();
    for node in 0..mesh.num_vertices() {
        if let Some(dof) = dofs.node_dof(0, node) {
            let x = mesh.vertices()[node].x;
            let expected = 1.0 - (2.0 * x - 1.0).abs();
            assert_scalar_eq!(system.solution()[dof], expected, comp = abs, tol = 1e-12);
        }
    }

    // Elemental auxiliary values are inherited by the children
    assert_eq!(system.aux_solution().len(), 6);
    assert!(system.aux_solution().iter().all(|&k| k == 3.0));

    // Assembly works on the new layout
    let n = system.dofs().num_dofs();
    assert!(system.compute_residual(&nalgebra::DVector::zeros(n)).is_ok());
}

#[test]
fn cycle_limit_is_enforced_per_step() {
    let mut system = hat_system(AdaptivityConfig::default());
    system.on_timestep_begin().unwrap();
    assert!(system.adapt().unwrap().is_changed());
    assert_eq!(system.adapt().unwrap(), AdaptivityOutcome::CycleLimitReached);

    let accepted = system.solution().clone();
    system.set_solution(&accepted).unwrap();
    system.advance_history().unwrap();
    system.on_timestep_begin().unwrap();
    assert_ne!(system.adapt().unwrap(), AdaptivityOutcome::CycleLimitReached);
}

#[test]
fn initial_adaptivity_reapplies_the_initial_condition() {
    let mut system = hat_system(AdaptivityConfig {
        initial_cycles: 2,
        max_h_level: 1,
        ..AdaptivityConfig::default()
    });
    system.run_initial_adaptivity().unwrap();
    let mesh = system.mesh().unwrap().clone();
    assert!(mesh.num_active_elements() > 4);
    assert!(mesh.max_level() <= 1);

    let dofs = system.dofs();
    for node in 0..mesh.num_vertices() {
        if let Some(dof) = dofs.node_dof(0, node) {
            let x = mesh.vertices()[node].x;
            let expected = 1.0 - (2.0 * x - 1.0).abs();
            assert_scalar_eq!(system.solution()[dof], expected, comp = abs, tol = 1e-12);
        }
    }
}

/// `u = max(0, 1 - 4x)` on a 4x4 quad mesh: the gradient only jumps across `x = 0.25`.
fn corner_ramp_on_quads(adaptivity: AdaptivityConfig) -> CoupledSystem {
    let config = SystemConfig {
        num_threads: 2,
        adaptivity,
        ..SystemConfig::default()
    };
    let mut system = CoupledSystem::new(config).unwrap();
    system
        .set_mesh(create_rectangular_uniform_quad_mesh(4, 4, [0.0, 1.0], [0.0, 1.0]).unwrap())
        .unwrap();
    system.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
    system
        .add_kernel("Diffusion", "diff", Parameters::new().with("variable", "u"))
        .unwrap();
    system
        .add_function(
            "PiecewiseLinear",
            "ramp",
            Parameters::new()
                .with("axis", "x")
                .with("x", vec![0.0, 0.25, 1.0])
                .with("y", vec![1.0, 0.0, 0.0]),
        )
        .unwrap();
    system
        .add_initial_condition("FunctionIC", "ic", Parameters::new().with("variable", "u").with("function", "ramp"))
        .unwrap();
    system.init().unwrap();
    system
}

#[test]
fn local_error_on_quads_refines_a_conforming_mesh() {
    let mut system = corner_ramp_on_quads(AdaptivityConfig::default());
    system.on_timestep_begin().unwrap();
    let outcome = system.adapt().unwrap();
    // Only the two columns next to the kink carry error, but a partial refinement would leave
    // hanging nodes, so every connected quadrilateral is refined
    assert_eq!(
        outcome,
        AdaptivityOutcome::Changed {
            refined: 16,
            coarsened: 0
        }
    );
    let mesh = system.mesh().unwrap().clone();
    assert_eq!(mesh.num_active_elements(), 64);
    assert_eq!(system.dofs().num_dofs(), 81);

    let dofs = system.dofs();
    for node in 0..mesh.num_vertices() {
        if let Some(dof) = dofs.node_dof(0, node) {
            let expected = (1.0 - 4.0 * mesh.vertices()[node].x).max(0.0);
            assert_scalar_eq!(system.solution()[dof], expected, comp = abs, tol = 1e-12);
        }
    }
    let n = system.dofs().num_dofs();
    assert!(system.compute_residual(&nalgebra::DVector::zeros(n)).is_ok());
}

#[test]
fn quads_at_the_maximum_level_are_left_alone() {
    let mut system = corner_ramp_on_quads(AdaptivityConfig {
        max_cycles: 2,
        max_h_level: 1,
        ..AdaptivityConfig::default()
    });
    system.on_timestep_begin().unwrap();
    assert!(system.adapt().unwrap().is_changed());
    assert_eq!(system.adapt().unwrap(), AdaptivityOutcome::Unchanged);
    assert_eq!(system.mesh().unwrap().num_active_elements(), 64);
}
