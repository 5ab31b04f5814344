pub mod config;
pub mod error;
pub mod initial;
pub mod io;
pub mod sim_params;
pub mod snapshot;
pub mod vecmath;

// Re-export key types for easier use by dependent crates
pub use config::{
    AnalysisConfig, EngineKind, InitialConditionsConfig, OutputConfig, OutputFormat, PhysicsConfig,
    ReferenceConfig, SimulationConfig, TimingConfig,
};
pub use error::{Quantity, SimError};
pub use initial::InitialConditions;
pub use sim_params::{ReferenceParams, SimParams};
pub use snapshot::{Snapshot, Trajectory};
pub use vecmath::Vec3;
