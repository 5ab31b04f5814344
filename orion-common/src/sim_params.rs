use serde::{Deserialize, Serialize};

/// Parameters derived from the configuration, used on every step of the fixed-step engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    // Force law
    pub g: f64,
    pub softening: f64,
    pub softening_sq: f64,

    // Time
    pub dt: f64,
    pub total_steps: u64,
    pub snapshot_every: u64,
    pub progress_every: u64,
}

/// Parameters for the adaptive reference integrator, all in reference units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceParams {
    pub g: f64,
    pub softening: f64,
    pub softening_sq: f64,
    /// Working-unit velocity times this factor gives the reference-unit velocity.
    pub velocity_to_reference: f64,

    pub end_time: f64,
    pub snapshots: usize,

    // Step-size control
    pub rtol: f64,
    pub atol: f64,
    pub initial_step: f64,
    pub min_step: f64,
}
