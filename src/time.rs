//! Time integration: solution history and time derivative approximations.
//!
//! The derivative at the new time level is approximated as
//!
//! ```text
//! u̇ = (w₀ u + w₁ u_old + w₂ u_older) / Δt  [- u̇_old for Crank-Nicolson]
//! ```
//!
//! with scheme-dependent weights `w`. The weights depend on the step size and must be refreshed
//! through [`TimeIntegrator::on_step_size_changed`] whenever it changes.
use crate::config::TimeConfig;
use crate::error::{Result, SystemError};
use crate::fe_data::TimeView;
use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeScheme {
    ImplicitEuler,
    /// Variable step second order backward differentiation. The first step falls back to
    /// implicit Euler since no `older` solution exists yet.
    Bdf2,
    CrankNicolson,
}

impl TimeScheme {
    /// Formal order of accuracy.
    pub fn order(&self) -> usize {
        match self {
            Self::ImplicitEuler => 1,
            Self::Bdf2 | Self::CrankNicolson => 2,
        }
    }
}

/// Current and retained solution snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionHistory {
    pub current: DVector<f64>,
    pub old: DVector<f64>,
    pub older: DVector<f64>,
    /// Time derivative at the old time level, only tracked for Crank-Nicolson.
    pub u_dot_old: DVector<f64>,
}

impl SolutionHistory {
    /// A history in which every level equals `initial`.
    pub fn from_initial(initial: DVector<f64>) -> Self {
        Self {
            old: initial.clone(),
            older: initial.clone(),
            u_dot_old: DVector::zeros(initial.len()),
            current: initial,
        }
    }
}

impl Default for SolutionHistory {
    fn default() -> Self {
        Self::from_initial(DVector::zeros(0))
    }
}

#[derive(Debug, Clone)]
pub struct TimeIntegrator {
    scheme: TimeScheme,
    transient: bool,
    time: f64,
    time_old: f64,
    dt: f64,
    dt_old: f64,
    t_step: usize,
    weights: [f64; 3],
    stale: bool,
    history: SolutionHistory,
    u_dot: DVector<f64>,
    /// Whether an accepted solution was recorded since the last history shift.
    current_is_fresh: bool,
}

impl TimeIntegrator {
    pub fn new(config: &TimeConfig) -> Self {
        let mut integrator = Self {
            scheme: config.scheme,
            transient: config.transient,
            time: config.start_time,
            time_old: config.start_time,
            dt: config.dt,
            dt_old: config.dt,
            t_step: 0,
            weights: [0.0; 3],
            stale: true,
            history: SolutionHistory::default(),
            u_dot: DVector::zeros(0),
            current_is_fresh: false,
        };
        if integrator.transient {
            integrator.time = integrator.time_old + integrator.dt;
        }
        integrator.on_step_size_changed();
        integrator
    }

    pub fn scheme(&self) -> TimeScheme {
        self.scheme
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn t_step(&self) -> usize {
        self.t_step
    }

    pub fn weights(&self) -> [f64; 3] {
        self.weights
    }

    /// `∂u̇/∂u`, the factor time derivative kernels multiply their mass terms with.
    pub fn du_dot_du(&self) -> f64 {
        if self.transient {
            self.weights[0] / self.dt
        } else {
            0.0
        }
    }

    pub fn history(&self) -> &SolutionHistory {
        &self.history
    }

    pub fn u_dot(&self) -> &DVector<f64> {
        &self.u_dot
    }

    pub fn view(&self) -> TimeView {
        TimeView {
            time: self.time,
            time_old: self.time_old,
            dt: self.dt,
            dt_old: self.dt_old,
            t_step: self.t_step,
            transient: self.transient,
        }
    }

    /// Selects the scheme. The weights must be refreshed with
    /// [`on_step_size_changed`](Self::on_step_size_changed) before the next evaluation.
    pub fn select_scheme(&mut self, scheme: TimeScheme) {
        self.scheme = scheme;
        self.stale = true;
    }

    pub fn set_transient(&mut self, transient: bool) {
        self.transient = transient;
    }

    /// Changes the size of the current step. The weights become stale.
    pub fn set_dt(&mut self, dt: f64) -> Result<()> {
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(SystemError::Config(format!("time step size must be positive, got {dt}")));
        }
        self.dt = dt;
        self.time = self.time_old + dt;
        self.stale = true;
        Ok(())
    }

    /// Recomputes the derivative weights for the current scheme and step sizes.
    pub fn on_step_size_changed(&mut self) {
        let (dt, dt_old) = (self.dt, self.dt_old);
        self.weights = match self.scheme {
            TimeScheme::ImplicitEuler => [1.0, -1.0, 0.0],
            TimeScheme::Bdf2 if self.t_step == 0 => [1.0, -1.0, 0.0],
            TimeScheme::Bdf2 => {
                let w0 = 1.0 + dt / (dt + dt_old);
                let w1 = -(dt + dt_old) / dt_old;
                let w2 = dt * dt / (dt_old * (dt + dt_old));
                [w0, w1, w2]
            }
            TimeScheme::CrankNicolson => [2.0, -2.0, 0.0],
        };
        self.stale = false;
        debug!("time derivative weights for {:?}, dt = {dt}: {:?}", self.scheme, self.weights);
    }

    /// Replaces the whole history, e.g. after initial conditions were applied.
    pub fn reset_history(&mut self, initial: DVector<f64>) {
        self.u_dot = DVector::zeros(initial.len());
        self.history = SolutionHistory::from_initial(initial);
        self.current_is_fresh = false;
    }

    /// Replaces every level of the history by its projection onto a new dof layout.
    pub fn remap_history<F>(&mut self, mut project: F) -> Result<()>
    where
        F: FnMut(&DVector<f64>) -> Result<DVector<f64>>,
    {
        let history = SolutionHistory {
            current: project(&self.history.current)?,
            old: project(&self.history.old)?,
            older: project(&self.history.older)?,
            u_dot_old: project(&self.history.u_dot_old)?,
        };
        self.u_dot = DVector::zeros(history.current.len());
        self.history = history;
        Ok(())
    }

    /// Records the accepted solution of the current step, allowing the next history shift.
    pub fn set_current(&mut self, solution: &DVector<f64>) -> Result<()> {
        self.set_iterate(solution)?;
        self.current_is_fresh = true;
        Ok(())
    }

    /// Records a trial iterate of the current step. Iterates are not accepted solutions and do
    /// not allow a history shift.
    pub fn set_iterate(&mut self, solution: &DVector<f64>) -> Result<()> {
        self.check_len(solution)?;
        self.history.current.copy_from(solution);
        Ok(())
    }

    fn check_len(&self, solution: &DVector<f64>) -> Result<()> {
        if solution.len() != self.history.current.len() {
            return Err(SystemError::DimensionMismatch {
                expected: self.history.current.len(),
                actual: solution.len(),
            });
        }
        Ok(())
    }

    /// Forms the time derivative of `solution` from the history.
    pub fn compute_time_derivative(&mut self, solution: &DVector<f64>) -> Result<&DVector<f64>> {
        if self.stale {
            return Err(SystemError::ContractViolation(
                "time derivative weights are stale; on_step_size_changed() must run after changing the \
                 step size or scheme"
                    .to_string(),
            ));
        }
        self.check_len(solution)?;
        let [w0, w1, w2] = self.weights;
        let h = &self.history;
        let mut u_dot = solution * (w0 / self.dt);
        u_dot.axpy(w1 / self.dt, &h.old, 1.0);
        if w2 != 0.0 {
            u_dot.axpy(w2 / self.dt, &h.older, 1.0);
        }
        if self.scheme == TimeScheme::CrankNicolson {
            u_dot -= &h.u_dot_old;
        }
        self.u_dot = u_dot;
        Ok(&self.u_dot)
    }

    /// Shifts `current` into `old` and `old` into `older`, and moves to the next step.
    ///
    /// Must run exactly once per accepted step. A second call without an intervening
    /// [`set_current`](Self::set_current) is reported as a contract violation, as is shifting a
    /// Crank-Nicolson history with stale weights.
    pub fn advance_history(&mut self) -> Result<()> {
        if !self.current_is_fresh {
            return Err(SystemError::ContractViolation(
                "advance_history() called twice without an intervening accepted step".to_string(),
            ));
        }
        if self.scheme == TimeScheme::CrankNicolson {
            if self.stale {
                return Err(SystemError::ContractViolation(
                    "Crank-Nicolson history cannot advance with stale weights; on_step_size_changed() must \
                     run after changing the step size or scheme"
                        .to_string(),
                ));
            }
            let current = self.history.current.clone();
            self.compute_time_derivative(&current)?;
            self.history.u_dot_old.copy_from(&self.u_dot);
        }
        let h = &mut self.history;
        std::mem::swap(&mut h.older, &mut h.old);
        h.old.copy_from(&h.current);
        self.time_old = self.time;
        self.dt_old = self.dt;
        self.time = self.time_old + self.dt;
        self.t_step += 1;
        self.current_is_fresh = false;
        if !self.stale {
            self.on_step_size_changed();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient(scheme: TimeScheme, dt: f64) -> TimeIntegrator {
        TimeIntegrator::new(&TimeConfig {
            transient: true,
            scheme,
            start_time: 0.0,
            dt,
        })
    }

    #[test]
    fn bdf2_weights_are_exact_for_quadratics() {
        let mut integrator = transient(TimeScheme::Bdf2, 0.1);
        let u = |t: f64| DVector::from_element(1, t * t);
        integrator.reset_history(u(0.0));
        integrator.set_current(&u(0.1)).unwrap();
        integrator.advance_history().unwrap();
        integrator.set_dt(0.2).unwrap();
        integrator.on_step_size_changed();
        integrator.set_current(&u(0.3)).unwrap();
        integrator.advance_history().unwrap();
        integrator.set_dt(0.15).unwrap();
        integrator.on_step_size_changed();

        let t = integrator.time();
        let u_dot = integrator.compute_time_derivative(&u(t)).unwrap();
        assert!((u_dot[0] - 2.0 * t).abs() < 1e-12);
    }

    #[test]
    fn stale_weights_are_rejected() {
        let mut integrator = transient(TimeScheme::ImplicitEuler, 0.1);
        integrator.reset_history(DVector::zeros(2));
        integrator.set_dt(0.05).unwrap();
        assert!(integrator
            .compute_time_derivative(&DVector::zeros(2))
            .unwrap_err()
            .is_contract_violation());
    }

    #[test]
    fn iterates_do_not_count_as_accepted_steps() {
        let mut integrator = transient(TimeScheme::ImplicitEuler, 0.1);
        integrator.reset_history(DVector::zeros(2));
        integrator.set_current(&DVector::from_element(2, 1.0)).unwrap();
        integrator.advance_history().unwrap();
        integrator.set_iterate(&DVector::from_element(2, 5.0)).unwrap();
        assert!(integrator.advance_history().unwrap_err().is_contract_violation());
        assert_eq!(integrator.history().old, DVector::from_element(2, 1.0));
    }

    #[test]
    fn crank_nicolson_refuses_to_advance_with_stale_weights() {
        let mut integrator = transient(TimeScheme::CrankNicolson, 0.1);
        integrator.reset_history(DVector::zeros(3));
        integrator.set_current(&DVector::from_element(3, 0.1)).unwrap();
        integrator.set_dt(0.1).unwrap();
        assert!(integrator.advance_history().unwrap_err().is_contract_violation());
        assert_eq!(integrator.t_step(), 0);

        integrator.on_step_size_changed();
        integrator.advance_history().unwrap();
        assert_eq!(integrator.history().u_dot_old, DVector::from_element(3, 2.0));
    }
}
