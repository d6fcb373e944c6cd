//! Thread-parallel orchestration of coupled multiphysics finite element systems.
//!
//! A [`CoupledSystem`] owns a mesh, a set of nonlinear and auxiliary variables and the
//! evaluators (kernels, boundary conditions, materials, postprocessors and so on) registered
//! against them. It assembles residuals, Jacobians and damping factors for an external
//! nonlinear solver, integrates in time and adapts the mesh between solves.
pub mod adaptivity;
pub mod assembly;
pub mod config;
pub mod dofs;
pub mod element;
pub mod error;
pub mod evaluators;
pub mod factory;
pub mod fe_data;
pub mod mesh;
pub mod output;
pub mod params;
pub mod quadrature;
pub mod setup;
pub mod state;
pub mod system;
pub mod thread_data;
pub mod time;
pub mod variables;
pub mod warehouse;

pub use error::{Result, SystemError};
pub use system::CoupledSystem;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
