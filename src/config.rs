//! Run-time configuration of a coupled system.
use crate::error::{Result, SystemError};
use crate::time::TimeScheme;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for a [`CoupledSystem`](crate::system::CoupledSystem).
///
/// All fields have defaults, so a configuration file only needs to list what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Number of worker threads. Zero selects the rayon default (one per logical core).
    pub num_threads: usize,
    /// Number of Gauss points per reference dimension.
    pub quadrature_points: usize,
    pub need_residual_copy: bool,
    /// Evaluate postprocessors before every residual evaluation instead of once per step.
    pub compute_postprocessors_each_residual: bool,
    pub time: TimeConfig,
    pub adaptivity: AdaptivityConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            quadrature_points: 2,
            need_residual_copy: false,
            compute_postprocessors_each_residual: false,
            time: TimeConfig::default(),
            adaptivity: AdaptivityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    pub transient: bool,
    pub scheme: TimeScheme,
    pub start_time: f64,
    pub dt: f64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            transient: false,
            scheme: TimeScheme::ImplicitEuler,
            start_time: 0.0,
            dt: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptivityConfig {
    /// Maximum number of adaptivity cycles per time step.
    pub max_cycles: usize,
    /// Number of cycles run against the initial condition only.
    pub initial_cycles: usize,
    pub refine_fraction: f64,
    pub coarsen_fraction: f64,
    /// Maximum refinement level of any element. Zero means unlimited.
    pub max_h_level: u32,
    /// Errors at or below this value never trigger refinement.
    pub refine_threshold: f64,
}

impl Default for AdaptivityConfig {
    fn default() -> Self {
        Self {
            max_cycles: 1,
            initial_cycles: 0,
            refine_fraction: 0.5,
            coarsen_fraction: 0.0,
            max_h_level: 0,
            refine_threshold: 0.0,
        }
    }
}

impl SystemConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Rejects configurations that can never describe a valid run.
    pub fn validate(&self) -> Result<()> {
        if !(1..=4).contains(&self.quadrature_points) {
            return Err(SystemError::Config(format!(
                "quadrature_points must be between 1 and 4, got {}",
                self.quadrature_points
            )));
        }
        if !(self.time.dt > 0.0 && self.time.dt.is_finite()) {
            return Err(SystemError::Config(format!(
                "time step must be positive and finite, got {}",
                self.time.dt
            )));
        }
        let adaptivity = &self.adaptivity;
        for (name, fraction) in [
            ("refine_fraction", adaptivity.refine_fraction),
            ("coarsen_fraction", adaptivity.coarsen_fraction),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(SystemError::Config(format!("{name} must lie in [0, 1], got {fraction}")));
            }
        }
        if adaptivity.coarsen_fraction + adaptivity.refine_fraction > 1.0 {
            return Err(SystemError::Config(
                "refine_fraction and coarsen_fraction overlap".to_string(),
            ));
        }
        if adaptivity.refine_threshold < 0.0 {
            return Err(SystemError::Config(format!(
                "refine_threshold must be non-negative, got {}",
                adaptivity.refine_threshold
            )));
        }
        Ok(())
    }
}
