use fenris_multiphysics::config::SystemConfig;
use fenris_multiphysics::mesh::procedural::{create_rectangular_uniform_quad_mesh, create_uniform_line_mesh};
use fenris_multiphysics::params::Parameters;
use fenris_multiphysics::variables::FeType;
use fenris_multiphysics::CoupledSystem;

mod unit_tests;

fn config_with_threads(num_threads: usize) -> SystemConfig {
    SystemConfig {
        num_threads,
        ..SystemConfig::default()
    }
}

/// `-u'' = 1` on `[0, 1]` with `num_elements` segments, not yet initialized.
fn line_poisson(num_elements: usize, num_threads: usize) -> CoupledSystem {
    let mut system = CoupledSystem::new(config_with_threads(num_threads)).unwrap();
    system
        .set_mesh(create_uniform_line_mesh(0.0, 1.0, num_elements).unwrap())
        .unwrap();
    system.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
    system
        .add_kernel("Diffusion", "diff", Parameters::new().with("variable", "u"))
        .unwrap();
    system
        .add_kernel(
            "BodyForce",
            "force",
            Parameters::new().with("variable", "u").with("value", 1.0),
        )
        .unwrap();
    system
}

/// Two coupled fields on a quad mesh with boundary conditions, materials and an auxiliary
/// field, initialized and ready for assembly.
fn coupled_quad_system(cells: usize, num_threads: usize) -> CoupledSystem {
    let mut system = CoupledSystem::new(config_with_threads(num_threads)).unwrap();
    let mesh = create_rectangular_uniform_quad_mesh(cells, cells, [0.0, 1.0], [0.0, 1.0]).unwrap();
    system.set_mesh(mesh).unwrap();
    system.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
    system.add_variable("v", FeType::LAGRANGE_FIRST, None).unwrap();
    system.add_aux_variable("w", FeType::LAGRANGE_FIRST, None).unwrap();
    system.add_aux_variable("k", FeType::MONOMIAL_CONSTANT, None).unwrap();
    system
        .add_material(
            "GenericConstantMaterial",
            "mat",
            Parameters::new()
                .with("prop_names", vec!["diffusivity"])
                .with("prop_values", vec![2.0]),
        )
        .unwrap();
    system
        .add_kernel("MatDiffusion", "diff_u", Parameters::new().with("variable", "u"))
        .unwrap();
    system
        .add_kernel("Diffusion", "diff_v", Parameters::new().with("variable", "v"))
        .unwrap();
    system
        .add_kernel(
            "CoupledForce",
            "couple",
            Parameters::new().with("variable", "v").with("v", "u"),
        )
        .unwrap();
    system
        .add_kernel(
            "Reaction",
            "react",
            Parameters::new().with("variable", "u").with("rate", 0.5),
        )
        .unwrap();
    system
        .add_bc(
            "DirichletBC",
            "left",
            Parameters::new().with("variable", "u").with("boundary", 3i64).with("value", 1.0),
        )
        .unwrap();
    system
        .add_bc(
            "NeumannBC",
            "right",
            Parameters::new().with("variable", "v").with("boundary", 1i64).with("value", 0.25),
        )
        .unwrap();
    system
        .add_aux_kernel(
            "CoupledValueAux",
            "copy_u",
            Parameters::new().with("variable", "w").with("v", "u").with("coef", 3.0),
        )
        .unwrap();
    system
        .add_aux_kernel(
            "ConstantAux",
            "const_k",
            Parameters::new().with("variable", "k").with("value", 4.0),
        )
        .unwrap();
    system.init().unwrap();
    system
}

/// A deterministic, non-trivial solution vector.
fn sample_solution(len: usize) -> nalgebra::DVector<f64> {
    nalgebra::DVector::from_fn(len, |i, _| ((i * 7 + 3) % 11) as f64 / 11.0 - 0.3)
}
