use criterion::{criterion_group, criterion_main, Criterion};
use fenris_multiphysics::config::SystemConfig;
use fenris_multiphysics::mesh::procedural::create_rectangular_uniform_quad_mesh;
use fenris_multiphysics::params::Parameters;
use fenris_multiphysics::variables::FeType;
use fenris_multiphysics::CoupledSystem;
use nalgebra::DVector;
use std::hint::black_box;

fn poisson_system(res: usize, num_threads: usize) -> eyre::Result<CoupledSystem> {
    let config = SystemConfig {
        num_threads,
        ..SystemConfig::default()
    };
    let mut system = CoupledSystem::new(config)?;
    system.set_mesh(create_rectangular_uniform_quad_mesh(res, res, [0.0, 1.0], [0.0, 1.0])?)?;
    system.add_variable("u", FeType::LAGRANGE_FIRST, None)?;
    system.add_kernel("Diffusion", "diff", Parameters::new().with("variable", "u"))?;
    system.add_kernel("BodyForce", "force", Parameters::new().with("variable", "u"))?;
    system.add_bc(
        "DirichletBC",
        "bottom",
        Parameters::new().with("variable", "u").with("boundary", 0i64),
    )?;
    system.init()?;
    Ok(system)
}

pub fn poisson_residual(c: &mut Criterion) {
    let resolutions = vec![16, 32, 64];
    for num_threads in [1, 4] {
        for &res in &resolutions {
            let mut system = poisson_system(res, num_threads).unwrap();
            let u = DVector::repeat(system.dofs().num_dofs(), 0.5);
            c.bench_function(
                &format!("residual poisson quad4 (res={res}, threads={num_threads})"),
                |b| b.iter(|| black_box(system.compute_residual(&u).unwrap())),
            );
        }
    }
}

pub fn poisson_jacobian(c: &mut Criterion) {
    let resolutions = vec![16, 32, 64];
    for num_threads in [1, 4] {
        for &res in &resolutions {
            let mut system = poisson_system(res, num_threads).unwrap();
            let u = DVector::repeat(system.dofs().num_dofs(), 0.5);
            c.bench_function(
                &format!("jacobian poisson quad4 (res={res}, threads={num_threads})"),
                |b| b.iter(|| black_box(system.compute_jacobian(&u).unwrap())),
            );
        }
    }
}

criterion_group!(assembly, poisson_residual, poisson_jacobian);

criterion_main!(assembly);
