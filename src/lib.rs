//! Direct-summation N-body engine with merger detection.
//!
//! The fast path is a rayon-parallel O(N^2) kernel stepped with semi-implicit Euler;
//! the reference path is an adaptive Dormand-Prince integrator. Both implement
//! [`Integrator`] and are driven by the same [`SimulationEngine`]. The final snapshot
//! of a run is handed to [`MergerDetector`] to find clusters of close bodies.

pub mod body_set;
pub mod forces;
pub mod grid;
pub mod initial_conditions;
pub mod integrator;
pub mod merger;
pub mod reference;
pub mod report;
pub mod simulation;

pub use body_set::BodySet;
pub use forces::{DirectGravity, ForceKernel, ParallelDirectGravity};
pub use integrator::{FixedStepIntegrator, Integrator, StepReport};
pub use merger::{Cluster, MergerDetector, MergerReport};
pub use reference::{AdaptiveReferenceIntegrator, UnitConversion};
pub use simulation::{OutputSchedule, Progress, RunOutput, RunStats, SimulationEngine, Tick};
