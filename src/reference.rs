//! Adaptive high-precision reference integration.
//!
//! [`AdaptiveReferenceIntegrator`] is an embedded Dormand-Prince 5(4) Runge-Kutta
//! scheme with first-same-as-last reuse and standard error control. It is slow and
//! strictly sequential; it exists to check the fixed-step engine against.

use crate::body_set::BodySet;
use crate::forces::{allocate_accelerations, DirectGravity, ForceKernel};
use crate::integrator::{Integrator, StepReport};
use log::{debug, trace};
use orion_common::{InitialConditions, Quantity, ReferenceParams, SimError, Vec3};

const STAGES: usize = 7;

// Butcher tableau. Row `s` holds the coefficients used to build stage `s`; row 6 is the
// fifth-order solution, whose derivative becomes the first stage of the next step.
const A: [[f64; 6]; STAGES] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0, 0.0, 0.0],
    [9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0, 0.0],
    [35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0],
];

// Fifth-order minus embedded fourth-order weights.
const E: [f64; STAGES] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;
const ERROR_EXPONENT: f64 = -1.0 / 5.0;

/// Converts velocities between working units and reference units.
///
/// Masses and positions share units on both sides; only velocities are rescaled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConversion {
    pub velocity_to_reference: f64,
}

impl UnitConversion {
    pub fn new(velocity_to_reference: f64) -> Self {
        Self { velocity_to_reference }
    }

    pub fn from_params(params: &ReferenceParams) -> Self {
        Self::new(params.velocity_to_reference)
    }

    pub fn to_reference_units(&self, bodies: &mut BodySet) {
        for v in bodies.velocities_mut() {
            *v = *v * self.velocity_to_reference;
        }
    }

    pub fn from_reference_units(&self, bodies: &mut BodySet) {
        for v in bodies.velocities_mut() {
            *v = *v / self.velocity_to_reference;
        }
    }
}

/// Builds the reference run's starting state: centre-of-mass frame, reference units.
pub fn prepare_reference_bodies(ic: &InitialConditions, params: &ReferenceParams) -> Result<BodySet, SimError> {
    let mut bodies = BodySet::from_initial_conditions(ic)?;
    bodies.move_to_center_of_mass();
    UnitConversion::from_params(params).to_reference_units(&mut bodies);
    debug!(
        "Reference state: {} bodies, total mass {:.4e}, velocities scaled by {:e}",
        bodies.len(),
        bodies.total_mass(),
        params.velocity_to_reference
    );
    Ok(bodies)
}

/// Dormand-Prince 5(4) with adaptive step size.
pub struct AdaptiveReferenceIntegrator<K = DirectGravity> {
    kernel: K,
    rtol: f64,
    atol: f64,
    min_step: f64,
    /// Proposed size of the next step.
    step: f64,
    accepted: u64,

    // Stage derivatives: d(position)/dt and d(velocity)/dt for every stage.
    k_x: Vec<Vec<Vec3>>,
    k_v: Vec<Vec<Vec3>>,
    stage_x: Vec<Vec3>,
    /// Stage 0 holds the derivative of the state cached below. It is reused only while
    /// the body set still matches that state.
    fsal_time: Option<f64>,
    fsal_positions: Vec<Vec3>,
    fsal_masses: Vec<f64>,
}

impl AdaptiveReferenceIntegrator<DirectGravity> {
    pub fn from_params(params: &ReferenceParams) -> Self {
        Self::new(
            DirectGravity::from_reference(params),
            params.rtol,
            params.atol,
            params.initial_step,
            params.min_step,
        )
    }
}

impl<K: ForceKernel> AdaptiveReferenceIntegrator<K> {
    pub fn new(kernel: K, rtol: f64, atol: f64, initial_step: f64, min_step: f64) -> Self {
        Self {
            kernel,
            rtol,
            atol,
            min_step,
            step: initial_step,
            accepted: 0,
            k_x: Vec::new(),
            k_v: Vec::new(),
            stage_x: Vec::new(),
            fsal_time: None,
            fsal_positions: Vec::new(),
            fsal_masses: Vec::new(),
        }
    }

    /// Size the next step will be attempted with.
    pub fn proposed_step(&self) -> f64 {
        self.step
    }

    pub fn accepted_steps(&self) -> u64 {
        self.accepted
    }

    fn ensure_buffers(&mut self, n: usize) -> Result<(), SimError> {
        if self.stage_x.len() == n && self.k_x.len() == STAGES {
            return Ok(());
        }
        self.k_x.clear();
        self.k_v.clear();
        for _ in 0..STAGES {
            self.k_x.push(allocate_accelerations(n)?);
            self.k_v.push(allocate_accelerations(n)?);
        }
        self.stage_x = allocate_accelerations(n)?;
        self.fsal_time = None;
        Ok(())
    }

    /// Whether stage 0 already holds the derivative at `bodies`' current state. Compares
    /// time, positions, velocities and masses, so a different body set that happens to
    /// start at the same time is never served stale derivatives.
    fn fsal_matches(&self, bodies: &BodySet) -> bool {
        self.fsal_time == Some(bodies.time())
            && self.k_x[0] == bodies.velocities()
            && self.fsal_positions == bodies.positions()
            && self.fsal_masses == bodies.masses()
    }

    fn remember_fsal_state(&mut self, bodies: &BodySet) {
        self.fsal_time = Some(bodies.time());
        self.fsal_positions.clear();
        self.fsal_positions.extend_from_slice(bodies.positions());
        self.fsal_masses.clear();
        self.fsal_masses.extend_from_slice(bodies.masses());
    }

    /// Evaluates stage 0 at the current state unless the previous step left it valid.
    fn prime(&mut self, bodies: &BodySet) -> Result<(), SimError> {
        if self.fsal_matches(bodies) {
            return Ok(());
        }
        self.k_x[0].copy_from_slice(bodies.velocities());
        self.kernel
            .accelerations(bodies.masses(), bodies.positions(), &mut self.k_v[0]);
        if let Some(body) = self.k_v[0].iter().position(|a| !a.is_finite()) {
            return Err(SimError::NumericalInstability {
                step: self.accepted,
                time: bodies.time(),
                body,
                quantity: Quantity::Acceleration,
            });
        }
        self.remember_fsal_state(bodies);
        Ok(())
    }

    /// Builds every stage for a trial step of size `h` and returns the scaled error norm
    /// together with the body contributing most to it. A non-finite trial gives an
    /// infinite error.
    fn attempt(&mut self, bodies: &BodySet, h: f64) -> (f64, usize) {
        let x0 = bodies.positions();
        let v0 = bodies.velocities();

        // 1. Stages 1..=6. For the state (x, v) the derivative is (v, a(x)), so the stage
        //    velocity doubles as the position derivative k_x[s] and only the stage
        //    position needs a scratch buffer.
        for s in 1..STAGES {
            let coeffs = &A[s][..s];
            combine(x0, h, coeffs, &self.k_x[..s], &mut self.stage_x);
            combine(v0, h, coeffs, &self.k_v[..s], &mut self.k_x[s]);
            self.kernel
                .accelerations(bodies.masses(), &self.stage_x, &mut self.k_v[s]);
        }

        // 2. The last row of A equals the fifth-order weights, so stage_x and k_x[6] now
        //    hold the fifth-order position and velocity.
        let n = x0.len();
        let mut sum = 0.0;
        let mut worst = (0.0, 0);
        for i in 0..n {
            // 3. Local error estimate: difference of the fifth- and fourth-order solutions,
            //    weighted by E = b5 - b4.
            let mut ex = Vec3::zero();
            let mut ev = Vec3::zero();
            for s in 0..STAGES {
                ex += self.k_x[s][i] * E[s];
                ev += self.k_v[s][i] * E[s];
            }
            // 4. Scale every component by atol + rtol * max(|old|, |new|).
            let body_sum = scaled_sq(ex * h, x0[i], self.stage_x[i], self.atol, self.rtol)
                + scaled_sq(ev * h, v0[i], self.k_x[STAGES - 1][i], self.atol, self.rtol);
            // `!(<=)` also catches NaN, so a blown-up body is the one reported.
            if !(body_sum <= worst.0) {
                worst = (body_sum, i);
            }
            sum += body_sum;
        }
        // 5. RMS over the 6 components of every body.
        let err = (sum / (6 * n) as f64).sqrt();
        if err.is_finite() {
            (err, worst.1)
        } else {
            (f64::INFINITY, worst.1)
        }
    }

    fn accept(&mut self, bodies: &mut BodySet, time: f64) {
        let (positions, velocities) = bodies.state_mut();
        positions.copy_from_slice(&self.stage_x);
        velocities.copy_from_slice(&self.k_x[STAGES - 1]);
        bodies.set_time(time);
        // The last stage was evaluated at the accepted state: it becomes the next stage 0.
        self.k_x.swap(0, STAGES - 1);
        self.k_v.swap(0, STAGES - 1);
        self.remember_fsal_state(bodies);
        self.accepted += 1;
    }
}

impl<K: ForceKernel> Integrator for AdaptiveReferenceIntegrator<K> {
    fn name(&self) -> &'static str {
        "Dormand-Prince 5(4)"
    }

    /// Integrates up to `target_time`, clamping the final substep so the body set lands
    /// on the target exactly.
    fn advance(&mut self, bodies: &mut BodySet, target_time: f64) -> Result<StepReport, SimError> {
        let mut report = StepReport::default();
        if !(target_time > bodies.time()) {
            return Ok(report);
        }
        self.ensure_buffers(bodies.len())?;
        self.prime(bodies)?;

        while bodies.time() < target_time {
            let t = bodies.time();
            let remaining = target_time - t;
            let landing = self.step >= remaining;
            let h = if landing { remaining } else { self.step };
            if !landing && t + h == t {
                return Err(SimError::NumericalInstability {
                    step: self.accepted,
                    time: t,
                    body: 0,
                    quantity: Quantity::StepSize,
                });
            }

            let (err, worst_body) = self.attempt(bodies, h);
            if err <= 1.0 {
                let factor = if err == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * err.powf(ERROR_EXPONENT)).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                let next = h * factor;
                // A step shortened to land on the target does not cap the next proposal.
                if !landing || next > self.step {
                    self.step = next;
                }
                self.accept(bodies, if landing { target_time } else { t + h });
                report.merge(StepReport { substeps: 1, rejected: 0, smallest_step: h });
                trace!("accepted h = {:.3e} at t = {:.6e}, err = {:.3e}", h, bodies.time(), err);
            } else {
                let factor = if err.is_finite() {
                    (SAFETY * err.powf(ERROR_EXPONENT)).max(MIN_FACTOR)
                } else {
                    MIN_FACTOR
                };
                self.step = h * factor.min(1.0);
                report.rejected += 1;
                trace!("rejected h = {:.3e} at t = {:.6e}, err = {:.3e}", h, t, err);
                if self.step < self.min_step {
                    return Err(SimError::NumericalInstability {
                        step: self.accepted,
                        time: t,
                        body: worst_body,
                        quantity: Quantity::StepSize,
                    });
                }
            }
        }
        Ok(report)
    }
}

/// `out[i] = base[i] + h * sum_s coeffs[s] * ks[s][i]`
fn combine(base: &[Vec3], h: f64, coeffs: &[f64], ks: &[Vec<Vec3>], out: &mut [Vec3]) {
    for (i, o) in out.iter_mut().enumerate() {
        let mut delta = Vec3::zero();
        for (&c, k) in coeffs.iter().zip(ks) {
            if c != 0.0 {
                delta += k[i] * c;
            }
        }
        *o = base[i] + delta * h;
    }
}

fn scaled_sq(error: Vec3, old: Vec3, new: Vec3, atol: f64, rtol: f64) -> f64 {
    let component = |e: f64, a: f64, b: f64| {
        let scale = atol + rtol * a.abs().max(b.abs());
        (e / scale) * (e / scale)
    };
    component(error.x, old.x, new.x) + component(error.y, old.y, new.y) + component(error.z, old.z, new.z)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Equal-mass circular binary with G = 1 and no softening; period 2*pi*sqrt(r^3 / (G M)).
    fn binary() -> (BodySet, f64) {
        let v = 0.5;
        let bodies = BodySet::new(
            vec![1.0, 1.0],
            vec![Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)],
            vec![Vec3::new(0.0, -v, 0.0), Vec3::new(0.0, v, 0.0)],
        )
        .unwrap();
        let period = 2.0 * std::f64::consts::PI * (8.0f64 / 2.0).sqrt();
        (bodies, period)
    }

    #[test]
    fn lands_exactly_on_requested_times() {
        let (mut bodies, _) = binary();
        let mut integrator = AdaptiveReferenceIntegrator::new(DirectGravity::new(1.0, 0.0), 1e-9, 1e-12, 0.3, 1e-12);
        for target in [0.1, 0.75, 1.0, 3.3333] {
            integrator.advance(&mut bodies, target).unwrap();
            assert_eq!(bodies.time(), target);
        }
    }

    #[test]
    fn circular_orbit_closes_after_one_period() {
        let (mut bodies, period) = binary();
        let start = bodies.positions().to_vec();
        let mut integrator = AdaptiveReferenceIntegrator::new(DirectGravity::new(1.0, 0.0), 1e-10, 1e-12, 0.01, 1e-12);
        let report = integrator.advance(&mut bodies, period).unwrap();
        assert!(report.substeps > 10);
        for (x, x0) in bodies.positions().iter().zip(&start) {
            assert!(x.distance(*x0) < 1e-6, "drifted to {:?}", x);
        }
        let (com, _) = bodies.center_of_mass();
        assert!(com.length() < 1e-10);
    }

    #[test]
    fn smooth_motion_grows_the_step() {
        let mut bodies = BodySet::new(vec![1.0], vec![Vec3::zero()], vec![Vec3::new(1.0, 0.0, 0.0)]).unwrap();
        let mut integrator = AdaptiveReferenceIntegrator::new(DirectGravity::new(1.0, 0.0), 1e-9, 1e-9, 1e-3, 1e-9);
        integrator.advance(&mut bodies, 1.0).unwrap();
        assert!(integrator.proposed_step() > 1e-3);
        assert!((bodies.positions()[0].x - 1.0).abs() < 1e-12);
    }

    #[test]
    fn step_size_underflow_is_an_instability() {
        let (mut bodies, _) = binary();
        let mut integrator =
            AdaptiveReferenceIntegrator::new(DirectGravity::new(1.0, 0.0), 1e-30, 1e-30, 1.0, 0.5);
        let err = integrator.advance(&mut bodies, 10.0).unwrap_err();
        assert!(matches!(
            err,
            SimError::NumericalInstability { quantity: Quantity::StepSize, .. }
        ));
    }

    #[test]
    fn reused_integrator_does_not_leak_derivatives_between_body_sets() {
        let (mut first, _) = binary();
        let mut shared = AdaptiveReferenceIntegrator::new(DirectGravity::new(1.0, 0.0), 1e-10, 1e-12, 0.05, 1e-12);
        shared.advance(&mut first, 1.0).unwrap();

        // A different system that starts where the first one stopped in time.
        let mut second = BodySet::new(
            vec![2.0, 0.5],
            vec![Vec3::new(0.0, 3.0, 0.0), Vec3::new(0.0, -1.0, 0.0)],
            vec![Vec3::new(0.1, 0.0, 0.0), Vec3::new(-0.4, 0.0, 0.0)],
        )
        .unwrap();
        second.set_time(1.0);
        let mut expected = second.clone();

        shared.advance(&mut second, 2.0).unwrap();
        let mut fresh = AdaptiveReferenceIntegrator::new(DirectGravity::new(1.0, 0.0), 1e-10, 1e-12, 0.05, 1e-12);
        fresh.advance(&mut expected, 2.0).unwrap();
        // Step sequences differ, so agreement is to the integration tolerance.
        for (a, b) in second.positions().iter().zip(expected.positions()) {
            assert!(a.distance(*b) < 1e-7, "{:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn unit_conversion_scales_only_velocities() {
        let (mut bodies, _) = binary();
        let original = bodies.clone();
        let conversion = UnitConversion::new(1.022690e-6);

        conversion.to_reference_units(&mut bodies);
        assert_eq!(bodies.positions(), original.positions());
        assert_eq!(bodies.masses(), original.masses());
        assert!((bodies.velocities()[1].y - 0.5 * 1.022690e-6).abs() < 1e-20);

        conversion.from_reference_units(&mut bodies);
        for (v, v0) in bodies.velocities().iter().zip(original.velocities()) {
            assert!(v.distance(*v0) < 1e-15);
        }
    }

    #[test]
    fn reference_bodies_start_in_the_center_of_mass_frame() {
        let ic = InitialConditions {
            redshift: 7.0,
            masses: vec![1.0, 3.0],
            positions: vec![Vec3::new(10.0, 0.0, 0.0), Vec3::new(14.0, 0.0, 0.0)],
            velocities: vec![Vec3::new(0.0, 100.0, 0.0), Vec3::zero()],
        };
        let mut params = orion_common::SimulationConfig::default().get_reference_params();
        params.velocity_to_reference = 0.5;
        let bodies = prepare_reference_bodies(&ic, &params).unwrap();
        let (x, v) = bodies.center_of_mass();
        assert!(x.length() < 1e-12);
        assert!(v.length() < 1e-12);
        assert!((bodies.velocities()[0].y - 0.75 * 100.0 * 0.5).abs() < 1e-12);
    }
}
