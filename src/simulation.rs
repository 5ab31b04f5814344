use crate::body_set::BodySet;
use crate::integrator::{Integrator, StepReport};
use log::{debug, info, trace, warn};
use orion_common::{InitialConditions, SimError, SimParams, Snapshot, Trajectory};
use std::time::{Duration, Instant};

/// One point of the output schedule: the engine advances to `time`, then optionally records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub step: u64,
    pub time: f64,
    pub snapshot: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Ticks {
    FixedSteps { dt: f64, total_steps: u64, snapshot_every: u64 },
    OutputTimes(Vec<f64>),
}

/// The sequence of times a run visits and which of them are recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchedule {
    ticks: Ticks,
    progress_every: u64,
}

impl OutputSchedule {
    /// One tick per step at `(k + 1) * dt`. Every `snapshot_every`-th step is recorded, and so is the last one.
    pub fn fixed_steps(dt: f64, total_steps: u64, snapshot_every: u64) -> Result<Self, SimError> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(SimError::InvalidConfig(format!("dt must be finite and positive, got {}", dt)));
        }
        if total_steps == 0 {
            return Err(SimError::InvalidConfig("total_steps must be at least 1".to_string()));
        }
        if snapshot_every == 0 {
            return Err(SimError::InvalidConfig("snapshot_every must be at least 1".to_string()));
        }
        Ok(Self { ticks: Ticks::FixedSteps { dt, total_steps, snapshot_every }, progress_every: 1 })
    }

    pub fn from_params(params: &SimParams) -> Result<Self, SimError> {
        Ok(Self::fixed_steps(params.dt, params.total_steps, params.snapshot_every)?
            .with_progress_every(params.progress_every))
    }

    /// One recorded tick per requested time. Times must be finite and non-decreasing.
    pub fn output_times(times: Vec<f64>) -> Result<Self, SimError> {
        if times.is_empty() {
            return Err(SimError::InvalidConfig("no output times requested".to_string()));
        }
        if let Some(bad) = times.iter().find(|t| !t.is_finite()) {
            return Err(SimError::InvalidConfig(format!("output time {} is not finite", bad)));
        }
        if times.windows(2).any(|w| w[1] < w[0]) {
            return Err(SimError::InvalidConfig("output times must be non-decreasing".to_string()));
        }
        Ok(Self { ticks: Ticks::OutputTimes(times), progress_every: 1 })
    }

    /// `count` evenly spaced output times from 0 to `end_time` inclusive.
    pub fn linspace(end_time: f64, count: usize) -> Result<Self, SimError> {
        let times = match count {
            0 => Vec::new(),
            1 => vec![end_time],
            _ => {
                let spacing = end_time / (count - 1) as f64;
                (0..count)
                    .map(|k| if k + 1 == count { end_time } else { k as f64 * spacing })
                    .collect()
            }
        };
        Self::output_times(times)
    }

    pub fn with_progress_every(mut self, progress_every: u64) -> Self {
        self.progress_every = progress_every.max(1);
        self
    }

    pub fn len(&self) -> u64 {
        match &self.ticks {
            Ticks::FixedSteps { total_steps, .. } => *total_steps,
            Ticks::OutputTimes(times) => times.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k`-th tick, `k < len()`.
    pub fn tick(&self, k: u64) -> Tick {
        match &self.ticks {
            Ticks::FixedSteps { dt, total_steps, snapshot_every } => {
                let step = k + 1;
                Tick {
                    step,
                    time: step as f64 * dt,
                    snapshot: step % snapshot_every == 0 || step == *total_steps,
                }
            }
            Ticks::OutputTimes(times) => Tick { step: k, time: times[k as usize], snapshot: true },
        }
    }

    pub fn ticks(&self) -> impl Iterator<Item = Tick> + '_ {
        (0..self.len()).map(move |k| self.tick(k))
    }

    pub fn snapshot_count(&self) -> usize {
        self.ticks().filter(|t| t.snapshot).count()
    }
}

/// How far a run has come.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Ticks completed so far.
    pub step: u64,
    pub total: u64,
    pub fraction: f64,
    pub time: f64,
}

/// Run summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub ticks: u64,
    pub snapshots: usize,
    pub integration: StepReport,
    pub wall_time: Duration,
    pub initial_energy: Option<f64>,
    pub final_energy: Option<f64>,
}

impl RunStats {
    /// `|E_end - E_start| / |E_start|`, when energies were tracked.
    pub fn relative_energy_drift(&self) -> Option<f64> {
        match (self.initial_energy, self.final_energy) {
            (Some(e0), Some(e1)) if e0 != 0.0 => Some(((e1 - e0) / e0).abs()),
            _ => None,
        }
    }
}

pub struct RunOutput {
    pub trajectory: Trajectory,
    pub final_state: BodySet,
    pub stats: RunStats,
}

#[derive(Debug, Clone, Copy)]
struct EnergyProbe {
    g: f64,
    softening_sq: f64,
}

/// Drives an [`Integrator`] over a [`BodySet`] along an [`OutputSchedule`], recording snapshots.
///
/// The engine owns its body set exclusively for the whole run; `run` consumes it.
pub struct SimulationEngine<I: Integrator> {
    bodies: BodySet,
    integrator: I,
    energy: Option<EnergyProbe>,
}

impl<I: Integrator> SimulationEngine<I> {
    pub fn new(bodies: BodySet, integrator: I) -> Self {
        Self { bodies, integrator, energy: None }
    }

    /// Validates the initial conditions and builds an engine around them.
    pub fn from_initial_conditions(ic: &InitialConditions, integrator: I) -> Result<Self, SimError> {
        ic.check_lengths()?;
        Ok(Self::new(BodySet::from_initial_conditions(ic)?, integrator))
    }

    /// Log total energy at the start and end of the run using this force law.
    pub fn with_energy_tracking(mut self, g: f64, softening_sq: f64) -> Self {
        self.energy = Some(EnergyProbe { g, softening_sq });
        self
    }

    pub fn bodies(&self) -> &BodySet {
        &self.bodies
    }

    /// Runs the whole schedule. `progress`, if given, is called every time progress is logged.
    pub fn run(
        mut self,
        schedule: &OutputSchedule,
        mut progress: Option<&mut dyn FnMut(&Progress)>,
    ) -> Result<RunOutput, SimError> {
        let total = schedule.len();
        let start = Instant::now();
        info!(
            "Running {} ticks of {} on {} bodies ({} snapshots).",
            total,
            self.integrator.name(),
            self.bodies.len(),
            schedule.snapshot_count()
        );

        let mut stats = RunStats::default();
        stats.initial_energy = self
            .energy
            .map(|probe| self.bodies.total_energy(probe.g, probe.softening_sq));
        if let Some(e0) = stats.initial_energy {
            info!("Initial total energy: {:.6e}", e0);
        }

        let mut trajectory = Trajectory::new(self.bodies.masses().to_vec());
        for (k, tick) in schedule.ticks().enumerate() {
            // 1. Integrate up to the tick. Pin the clock to the tick time so rounding in
            //    repeated `t += dt` does not accumulate.
            let report = self.integrator.advance(&mut self.bodies, tick.time)?;
            self.bodies.set_time(tick.time);
            stats.integration.merge(report);

            // 2. Abort on the first non-finite position or velocity.
            if let Some((body, quantity)) = self.bodies.first_non_finite() {
                return Err(SimError::NumericalInstability { step: tick.step, time: tick.time, body, quantity });
            }

            // 3. Synchronous copy of the positions into the trajectory.
            if tick.snapshot {
                trajectory.push(Snapshot {
                    step: tick.step,
                    time: tick.time,
                    positions: self.bodies.positions().to_vec(),
                })?;
                trace!("Recorded snapshot {} at t = {:.4}", trajectory.len(), tick.time);
            }

            // 4. Progress every `progress_every` ticks and on the last one.
            let done = k as u64 + 1;
            if done % schedule.progress_every == 0 || done == total {
                let p = Progress { step: done, total, fraction: done as f64 / total as f64, time: tick.time };
                info!(
                    "Step [{}/{}] ({:.1}%) t = {:.4} | substeps: {} | Elapsed: {:.2} s",
                    p.step,
                    p.total,
                    p.fraction * 100.0,
                    p.time,
                    stats.integration.substeps,
                    start.elapsed().as_secs_f64()
                );
                if let Some(callback) = progress.as_mut() {
                    callback(&p);
                }
            } else {
                trace!("Step [{}/{}] t = {:.4}", done, total, tick.time);
            }
        }

        stats.ticks = total;
        stats.snapshots = trajectory.len();
        stats.wall_time = start.elapsed();
        stats.final_energy = self
            .energy
            .map(|probe| self.bodies.total_energy(probe.g, probe.softening_sq));
        if let (Some(e1), Some(drift)) = (stats.final_energy, stats.relative_energy_drift()) {
            info!("Final total energy: {:.6e} (relative drift {:.3e})", e1, drift);
            if drift > 0.05 {
                warn!("Energy drift of {:.2}% exceeds 5%; consider a smaller dt.", drift * 100.0);
            }
        }
        if stats.integration.rejected > 0 {
            debug!(
                "Integrator rejected {} trial steps; smallest accepted step {:.3e}",
                stats.integration.rejected, stats.integration.smallest_step
            );
        }
        info!(
            "Run finished in {:.3} seconds with {} snapshots.",
            stats.wall_time.as_secs_f64(),
            stats.snapshots
        );

        Ok(RunOutput { trajectory, final_state: self.bodies, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forces::DirectGravity;
    use crate::integrator::FixedStepIntegrator;
    use orion_common::{Quantity, Vec3};

    #[test]
    fn fixed_schedule_records_every_nth_and_the_last_step() {
        let schedule = OutputSchedule::fixed_steps(0.5, 10, 3).unwrap();
        let recorded: Vec<u64> = schedule.ticks().filter(|t| t.snapshot).map(|t| t.step).collect();
        assert_eq!(recorded, vec![3, 6, 9, 10]);
        assert_eq!(schedule.tick(0).time, 0.5);
        assert_eq!(schedule.tick(9).time, 5.0);
    }

    #[test]
    fn schedules_reject_bad_input() {
        assert!(OutputSchedule::fixed_steps(0.0, 10, 1).is_err());
        assert!(OutputSchedule::fixed_steps(0.1, 0, 1).is_err());
        assert!(OutputSchedule::fixed_steps(0.1, 10, 0).is_err());
        assert!(OutputSchedule::output_times(vec![0.0, 2.0, 1.0]).is_err());
        assert!(OutputSchedule::output_times(vec![]).is_err());
    }

    #[test]
    fn linspace_includes_both_ends() {
        let schedule = OutputSchedule::linspace(10.0, 5).unwrap();
        let times: Vec<f64> = schedule.ticks().map(|t| t.time).collect();
        assert_eq!(times, vec![0.0, 2.5, 5.0, 7.5, 10.0]);
    }

    #[test]
    fn run_reports_progress_and_snapshots() {
        let bodies = BodySet::new(
            vec![1.0, 1.0],
            vec![Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)],
            vec![Vec3::zero(); 2],
        )
        .unwrap();
        let engine = SimulationEngine::new(bodies, FixedStepIntegrator::new(DirectGravity::new(1.0, 0.1), 0.01));
        let schedule = OutputSchedule::fixed_steps(0.01, 20, 5).unwrap().with_progress_every(7);

        let mut seen = Vec::new();
        let mut reporter = |p: &Progress| seen.push(p.step);
        let output = engine.run(&schedule, Some(&mut reporter)).unwrap();

        assert_eq!(seen, vec![7, 14, 20]);
        assert_eq!(output.trajectory.len(), 4);
        assert_eq!(output.stats.integration.substeps, 20);
        assert!((output.final_state.time() - 0.2).abs() < 1e-12);
        assert!(output.trajectory.len() as u64 <= schedule.len());
    }

    struct Exploding;

    impl Integrator for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn advance(&mut self, bodies: &mut BodySet, _target_time: f64) -> Result<StepReport, SimError> {
            bodies.velocities_mut()[1] = Vec3::new(f64::NAN, 0.0, 0.0);
            Ok(StepReport::default())
        }
    }

    #[test]
    fn non_finite_state_aborts_the_run() {
        let bodies = BodySet::new(vec![1.0, 1.0], vec![Vec3::zero(); 2], vec![Vec3::zero(); 2]).unwrap();
        let schedule = OutputSchedule::fixed_steps(1.0, 5, 1).unwrap();
        let err = SimulationEngine::new(bodies, Exploding).run(&schedule, None).err().unwrap();
        assert_eq!(
            err,
            SimError::NumericalInstability { step: 1, time: 1.0, body: 1, quantity: Quantity::Velocity }
        );
    }

    #[test]
    fn rejects_invalid_initial_conditions() {
        let ic = InitialConditions {
            redshift: 0.0,
            masses: vec![1.0, -2.0],
            positions: vec![Vec3::zero(); 2],
            velocities: vec![Vec3::zero(); 2],
        };
        let integrator = FixedStepIntegrator::new(DirectGravity::new(1.0, 0.1), 0.1);
        assert!(matches!(
            SimulationEngine::from_initial_conditions(&ic, integrator),
            Err(SimError::InvalidInitialState(_))
        ));
    }
}
