use orion_common::{Snapshot, Trajectory, Vec3};
use orion_engine::{
    AdaptiveReferenceIntegrator, BodySet, DirectGravity, FixedStepIntegrator, MergerDetector, OutputSchedule,
    ParallelDirectGravity, SimulationEngine,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const G: f64 = 1.0;
const SOFTENING: f64 = 0.1;
const DT: f64 = 0.01;

/// Two unit masses 2 apart, each on the circular orbit of the softened force law.
fn softened_binary() -> (BodySet, f64) {
    let separation: f64 = 2.0;
    let accel = G * separation / (separation * separation + SOFTENING * SOFTENING).powf(1.5);
    let v = accel.sqrt(); // v^2 / r with r = 1
    let bodies = BodySet::new(
        vec![1.0, 1.0],
        vec![Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)],
        vec![Vec3::new(0.0, -v, 0.0), Vec3::new(0.0, v, 0.0)],
    )
    .unwrap();
    let period = 2.0 * std::f64::consts::PI / v;
    (bodies, period)
}

fn random_bodies(seed: u64, n: usize, extent: f64) -> BodySet {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut point = |scale: f64| {
        Vec3::new(
            rng.random_range(-scale..scale),
            rng.random_range(-scale..scale),
            rng.random_range(-scale..scale),
        )
    };
    let positions: Vec<Vec3> = (0..n).map(|_| point(extent)).collect();
    let velocities: Vec<Vec3> = (0..n).map(|_| point(0.1)).collect();
    let masses = (1..=n).map(|i| 0.5 + (i % 5) as f64 * 0.25).collect();
    BodySet::new(masses, positions, velocities).unwrap()
}

fn fast_integrator() -> FixedStepIntegrator<ParallelDirectGravity> {
    FixedStepIntegrator::new(ParallelDirectGravity::new(G, SOFTENING), DT)
}

#[test]
fn two_body_orbit_over_1000_steps_stays_bound_and_apart() {
    let (bodies, _) = softened_binary();
    let schedule = OutputSchedule::fixed_steps(DT, 1000, 10).unwrap();
    let output = SimulationEngine::new(bodies, fast_integrator())
        .with_energy_tracking(G, SOFTENING * SOFTENING)
        .run(&schedule, None)
        .unwrap();

    assert_eq!(output.trajectory.len(), 100);
    assert_eq!(output.final_state.time(), output.trajectory.final_snapshot().unwrap().time);
    assert!((output.final_state.time() - 10.0).abs() < 1e-9);
    assert!(output.stats.relative_energy_drift().unwrap() < 0.05);

    let last = output.trajectory.final_snapshot().unwrap();
    let separation = last.positions[0].distance(last.positions[1]);
    assert!((1.8..2.2).contains(&separation), "separation {}", separation);

    let report = MergerDetector::new(0.05)
        .unwrap()
        .detect_final(&output.trajectory)
        .unwrap();
    assert_eq!(report.total_clusters(), 2);
    assert_eq!(report.merger_events, 0);
}

#[test]
fn two_body_orbit_conserves_energy_over_a_full_period() {
    let (bodies, period) = softened_binary();
    let steps = (period / DT).ceil() as u64;
    let schedule = OutputSchedule::fixed_steps(DT, steps, 10).unwrap();
    let output = SimulationEngine::new(bodies, fast_integrator())
        .with_energy_tracking(G, SOFTENING * SOFTENING)
        .run(&schedule, None)
        .unwrap();

    let drift = output.stats.relative_energy_drift().unwrap();
    assert!(drift < 0.05, "energy drift {}", drift);
    assert!(output.stats.initial_energy.unwrap() < 0.0);

    for snapshot in output.trajectory.snapshots() {
        let separation = snapshot.positions[0].distance(snapshot.positions[1]);
        assert!((1.8..2.2).contains(&separation), "separation {} at t = {}", separation, snapshot.time);
    }
    assert!(output.trajectory.len() as u64 <= steps);

    let report = MergerDetector::new(0.05)
        .unwrap()
        .detect_final(&output.trajectory)
        .unwrap();
    assert_eq!(report.total_clusters(), 2);
    assert_eq!(report.merger_events, 0);
}

#[test]
fn three_close_bodies_form_one_cluster() {
    let bodies = BodySet::new(
        vec![1.0, 2.0, 3.0],
        vec![Vec3::zero(), Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.5, 0.0)],
        vec![Vec3::zero(); 3],
    )
    .unwrap();
    let schedule = OutputSchedule::fixed_steps(DT, 5, 5).unwrap();
    let output = SimulationEngine::new(bodies, fast_integrator()).run(&schedule, None).unwrap();

    let report = MergerDetector::new(2.0).unwrap().detect_final(&output.trajectory).unwrap();
    assert_eq!(report.total_clusters(), 1);
    assert_eq!(report.merger_events, 1);
    assert_eq!(report.clusters[0].members, vec![0, 1, 2]);
    assert_eq!(report.monster_mass, 6.0);
}

#[test]
fn single_body_drifts_freely() {
    let velocity = Vec3::new(0.5, -0.25, 1.0);
    let bodies = BodySet::new(vec![7.0], vec![Vec3::zero()], vec![velocity]).unwrap();
    let schedule = OutputSchedule::fixed_steps(DT, 100, 10).unwrap();
    let output = SimulationEngine::new(bodies, fast_integrator()).run(&schedule, None).unwrap();

    assert_eq!(output.final_state.velocities()[0], velocity);
    assert!(output.final_state.positions()[0].distance(velocity * 1.0) < 1e-12);
    assert_eq!(output.trajectory.len(), 10);

    let report = MergerDetector::new(1.0).unwrap().detect_final(&output.trajectory).unwrap();
    assert_eq!(report.total_clusters(), 1);
    assert_eq!(report.merger_events, 0);
    assert_eq!(report.monster_mass, 7.0);
}

#[test]
fn identical_runs_are_bit_identical() {
    let schedule = OutputSchedule::fixed_steps(DT, 50, 10).unwrap();
    let run = || {
        SimulationEngine::new(random_bodies(11, 64, 5.0), fast_integrator())
            .run(&schedule, None)
            .unwrap()
    };
    let (a, b) = (run(), run());
    assert_eq!(a.trajectory, b.trajectory);
    assert_eq!(a.final_state, b.final_state);

    let sequential = SimulationEngine::new(
        random_bodies(11, 64, 5.0),
        FixedStepIntegrator::new(DirectGravity::new(G, SOFTENING), DT),
    )
    .run(&schedule, None)
    .unwrap();
    assert_eq!(sequential.trajectory, a.trajectory);
}

#[test]
fn clusters_partition_bodies_and_coarsen_with_radius() {
    let bodies = random_bodies(3, 300, 20.0);
    let positions = bodies.positions();
    let masses = bodies.masses();
    let radii = [0.0, 0.5, 1.0, 2.0, 4.0, 8.0];

    let mut previous: Option<(usize, Vec<usize>)> = None;
    for radius in radii {
        let report = MergerDetector::new(radius).unwrap().detect(positions, masses).unwrap();

        let mut seen: Vec<usize> = report.clusters.iter().flat_map(|c| c.members.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..positions.len()).collect::<Vec<_>>(), "not a partition at R = {}", radius);
        let total_mass: f64 = report.clusters.iter().map(|c| c.mass).sum();
        assert!((total_mass - bodies.total_mass()).abs() < 1e-9);

        let labels = report.labels(positions.len());
        if let Some((count, coarser_than)) = &previous {
            assert!(report.total_clusters() <= *count);
            // Bodies together at a smaller radius stay together at a larger one.
            for i in 0..positions.len() {
                for j in (i + 1)..positions.len() {
                    if coarser_than[i] == coarser_than[j] {
                        assert_eq!(labels[i], labels[j]);
                    }
                }
            }
        }
        previous = Some((report.total_clusters(), labels));
    }
}

#[test]
fn reference_and_fast_engines_agree_on_a_short_arc() {
    let (bodies, period) = softened_binary();
    let end = period / 4.0;

    let steps = 2000;
    let dt = end / steps as f64;
    let fast = SimulationEngine::new(
        bodies.clone(),
        FixedStepIntegrator::new(ParallelDirectGravity::new(G, SOFTENING), dt),
    )
    .run(&OutputSchedule::fixed_steps(dt, steps, steps).unwrap(), None)
    .unwrap();

    let reference = SimulationEngine::new(
        bodies,
        AdaptiveReferenceIntegrator::new(DirectGravity::new(G, SOFTENING), 1e-10, 1e-12, 1e-3, 1e-12),
    )
    .run(&OutputSchedule::linspace(end, 5).unwrap(), None)
    .unwrap();

    assert_eq!(reference.trajectory.len(), 5);
    assert_eq!(reference.final_state.time(), end);
    let fast_final: &Snapshot = fast.trajectory.final_snapshot().unwrap();
    let reference_final = reference.trajectory.final_snapshot().unwrap();
    for (a, b) in fast_final.positions.iter().zip(&reference_final.positions) {
        assert!(a.distance(*b) < 1e-2, "{:?} vs {:?}", a, b);
    }
    // A quarter orbit carries body 1 from +x to +y.
    assert!((reference_final.positions[1].y - 1.0).abs() < 1e-6);
}

#[test]
fn trajectory_rejects_snapshots_of_the_wrong_size() {
    let mut trajectory = Trajectory::new(vec![1.0, 1.0]);
    let result = trajectory.push(Snapshot { step: 1, time: 0.1, positions: vec![Vec3::zero()] });
    assert!(result.is_err());
    assert!(trajectory.is_empty());
}
