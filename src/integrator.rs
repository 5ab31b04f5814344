//! Stepping strategies.
//!
//! An [`Integrator`] advances a [`BodySet`] to a requested time. The engine only
//! talks to this trait, so the fast fixed-step integrator and the adaptive reference
//! integrator are interchangeable.

use crate::body_set::BodySet;
use crate::forces::{allocate_accelerations, ForceKernel, ParallelDirectGravity};
use log::trace;
use orion_common::{Quantity, SimError, SimParams, Vec3};
use rayon::prelude::*;

/// Work done by one call to [`Integrator::advance`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepReport {
    /// Accepted internal steps.
    pub substeps: u64,
    /// Trial steps thrown away by error control.
    pub rejected: u64,
    /// Smallest accepted step, zero when no step was taken.
    pub smallest_step: f64,
}

impl StepReport {
    pub fn merge(&mut self, other: StepReport) {
        self.substeps += other.substeps;
        self.rejected += other.rejected;
        if other.substeps > 0 && (self.smallest_step == 0.0 || other.smallest_step < self.smallest_step) {
            self.smallest_step = other.smallest_step;
        }
    }
}

/// A time-stepping strategy.
pub trait Integrator {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Advances `bodies` from its current time to `target_time`, mutating it in place.
    fn advance(&mut self, bodies: &mut BodySet, target_time: f64) -> Result<StepReport, SimError>;
}

/// Semi-implicit (symplectic) Euler with a fixed step.
///
/// Each step kicks velocities with the current accelerations and then drifts positions
/// with the *new* velocities:
///
/// 1. v(t + dt) = v(t) + a(x(t)) * dt
/// 2. x(t + dt) = x(t) + v(t + dt) * dt
pub struct FixedStepIntegrator<K = ParallelDirectGravity> {
    kernel: K,
    dt: f64,
    accelerations: Vec<Vec3>,
    steps_taken: u64,
}

impl FixedStepIntegrator<ParallelDirectGravity> {
    /// Fast integrator over the rayon kernel, configured from `params`.
    pub fn from_params(params: &SimParams) -> Self {
        Self::new(ParallelDirectGravity::from_params(params), params.dt)
    }
}

impl<K: ForceKernel> FixedStepIntegrator<K> {
    pub fn new(kernel: K, dt: f64) -> Self {
        Self { kernel, dt, accelerations: Vec::new(), steps_taken: 0 }
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn steps_taken(&self) -> u64 {
        self.steps_taken
    }

    /// Advances by exactly one step of `dt`.
    pub fn step(&mut self, bodies: &mut BodySet) -> Result<(), SimError> {
        if self.accelerations.len() != bodies.len() {
            self.accelerations = allocate_accelerations(bodies.len())?;
        }

        self.kernel
            .accelerations(bodies.masses(), bodies.positions(), &mut self.accelerations);
        if let Some(body) = self.accelerations.par_iter().position_first(|a| !a.is_finite()) {
            return Err(SimError::NumericalInstability {
                step: self.steps_taken + 1,
                time: bodies.time(),
                body,
                quantity: Quantity::Acceleration,
            });
        }

        let dt = self.dt;
        let (positions, velocities) = bodies.state_mut();
        // Kick, then drift with the updated velocity. Each parallel loop joins before the next starts.
        velocities
            .par_iter_mut()
            .zip(self.accelerations.par_iter())
            .for_each(|(v, &a)| *v += a * dt);
        positions
            .par_iter_mut()
            .zip(velocities.par_iter())
            .for_each(|(x, &v)| *x += v * dt);

        bodies.set_time(bodies.time() + dt);
        self.steps_taken += 1;
        trace!("Euler step {} done, t = {:.6e}", self.steps_taken, bodies.time());
        Ok(())
    }
}

impl<K: ForceKernel> Integrator for FixedStepIntegrator<K> {
    fn name(&self) -> &'static str {
        "semi-implicit Euler"
    }

    /// Takes `round((target - t) / dt)` steps; targets are expected on the `dt` lattice.
    fn advance(&mut self, bodies: &mut BodySet, target_time: f64) -> Result<StepReport, SimError> {
        let remaining = target_time - bodies.time();
        let n_steps = if remaining > 0.0 { (remaining / self.dt).round() as u64 } else { 0 };
        for _ in 0..n_steps {
            self.step(bodies)?;
        }
        Ok(StepReport {
            substeps: n_steps,
            rejected: 0,
            smallest_step: if n_steps > 0 { self.dt } else { 0.0 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forces::DirectGravity;

    #[test]
    fn lone_body_at_rest_stays_put() {
        let start = Vec3::new(3.0, -1.0, 2.0);
        let mut bodies = BodySet::new(vec![1.0], vec![start], vec![Vec3::zero()]).unwrap();
        let mut integrator = FixedStepIntegrator::new(DirectGravity::new(1.0, 0.1), 0.01);
        for _ in 0..100 {
            integrator.step(&mut bodies).unwrap();
        }
        assert_eq!(bodies.positions()[0], start);
        assert_eq!(bodies.velocities()[0], Vec3::zero());
    }

    #[test]
    fn position_update_uses_the_new_velocity() {
        // From rest, explicit Euler would leave the positions unchanged after one step.
        let mut bodies = BodySet::new(
            vec![1.0, 1.0],
            vec![Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)],
            vec![Vec3::zero(); 2],
        )
        .unwrap();
        let dt = 0.1;
        let mut integrator = FixedStepIntegrator::new(DirectGravity::new(1.0, 0.0), dt);
        integrator.step(&mut bodies).unwrap();

        let a = 1.0 / 4.0;
        assert!((bodies.velocities()[0].x - a * dt).abs() < 1e-15);
        assert!((bodies.positions()[0].x - (-1.0 + a * dt * dt)).abs() < 1e-15);
        assert!((bodies.time() - dt).abs() < 1e-15);
    }

    #[test]
    fn advance_takes_one_step_per_dt() {
        let mut bodies = BodySet::new(vec![1.0], vec![Vec3::zero()], vec![Vec3::new(1.0, 0.0, 0.0)]).unwrap();
        let mut integrator = FixedStepIntegrator::new(DirectGravity::new(1.0, 0.1), 0.25);
        let report = integrator.advance(&mut bodies, 1.0).unwrap();
        assert_eq!(report.substeps, 4);
        assert_eq!(integrator.steps_taken(), 4);
        assert!((bodies.positions()[0].x - 1.0).abs() < 1e-15);

        let report = integrator.advance(&mut bodies, 0.5).unwrap();
        assert_eq!(report.substeps, 0, "never steps backwards");
    }

    #[test]
    fn non_finite_acceleration_is_fatal() {
        let mut bodies = BodySet::new(
            vec![1.0, 1.0],
            vec![Vec3::zero(), Vec3::new(1.0, 0.0, 0.0)],
            vec![Vec3::zero(); 2],
        )
        .unwrap();
        let mut integrator = FixedStepIntegrator::new(DirectGravity::new(f64::INFINITY, 0.1), 0.1);
        let err = integrator.step(&mut bodies).unwrap_err();
        assert!(matches!(
            err,
            SimError::NumericalInstability { step: 1, quantity: Quantity::Acceleration, .. }
        ));
    }
}
