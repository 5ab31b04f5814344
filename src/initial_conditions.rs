//! Clustered high-redshift initial conditions.
//!
//! Bodies are born in "nests": a handful of random centres inside a periodic box, with
//! each body scattered around one of them. Velocities combine the Hubble flow at the
//! configured redshift, measured from the box centre, with a Gaussian peculiar velocity.
//! Body 0 is a heavy seed at rest in the exact centre.

use log::{debug, info};
use orion_common::{InitialConditions, InitialConditionsConfig, SimError, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal, Normal};

const PC_PER_MPC: f64 = 1e6;

/// `H(z) = H0 * sqrt(Omega_m (1 + z)^3 + Omega_lambda)`, in the units of `H0` (km/s/Mpc).
pub fn hubble_parameter(config: &InitialConditionsConfig) -> f64 {
    let z1 = 1.0 + config.redshift;
    config.hubble_constant * (config.omega_m * z1 * z1 * z1 + config.omega_lambda).sqrt()
}

/// Generates the scenario described by `config`. The same seed always yields the same bodies.
pub fn generate(config: &InitialConditionsConfig) -> Result<InitialConditions, SimError> {
    if config.num_bodies == 0 {
        return Err(SimError::InvalidConfig("num_bodies must be at least 1".to_string()));
    }
    if !(config.box_size_mpc.is_finite() && config.box_size_mpc > 0.0) {
        return Err(SimError::InvalidConfig(format!(
            "box_size_mpc must be positive, got {}",
            config.box_size_mpc
        )));
    }
    let invalid = |e: rand_distr::NormalError| SimError::InvalidConfig(format!("initial conditions: {}", e));
    let mass_dist = LogNormal::new(config.mean_mass.ln(), config.sigma_mass).map_err(invalid)?;
    let nest_dist = Normal::new(0.0, config.nest_sigma_pc).map_err(invalid)?;
    let peculiar_dist = Normal::new(0.0, config.peculiar_sigma_km_s).map_err(invalid)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let n = config.num_bodies;
    let box_size = config.box_size_mpc * PC_PER_MPC;
    let center = Vec3::splat(box_size / 2.0);
    let hubble_per_pc = hubble_parameter(config) / PC_PER_MPC;
    info!(
        "Generating {} bodies in a {} Mpc box at z = {} (seed {})",
        n, config.box_size_mpc, config.redshift, config.seed
    );
    debug!("H(z) = {:.3} km/s/Mpc", hubble_parameter(config));

    let mut masses: Vec<f64> = (0..n).map(|_| mass_dist.sample(&mut rng)).collect();
    masses[0] = config.seed_mass;

    let n_nests = n / 10 + 1;
    let nests: Vec<Vec3> = (0..n_nests)
        .map(|_| Vec3::new(rng.random::<f64>(), rng.random::<f64>(), rng.random::<f64>()) * box_size)
        .collect();

    let mut positions = Vec::with_capacity(n);
    let mut velocities = Vec::with_capacity(n);
    positions.push(center);
    velocities.push(Vec3::zero());
    for _ in 1..n {
        let nest = nests[rng.random_range(0..n_nests)];
        let offset = Vec3::new(
            nest_dist.sample(&mut rng),
            nest_dist.sample(&mut rng),
            nest_dist.sample(&mut rng),
        );
        let raw = nest + offset;
        // Periodic box.
        let pos = Vec3::new(
            raw.x.rem_euclid(box_size),
            raw.y.rem_euclid(box_size),
            raw.z.rem_euclid(box_size),
        );
        let hubble_flow = (pos - center) * hubble_per_pc;
        let peculiar = Vec3::new(
            peculiar_dist.sample(&mut rng),
            peculiar_dist.sample(&mut rng),
            peculiar_dist.sample(&mut rng),
        );
        positions.push(pos);
        velocities.push(hubble_flow + peculiar);
    }

    Ok(InitialConditions { redshift: config.redshift, masses, positions, velocities })
}
