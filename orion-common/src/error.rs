use std::fmt;
use std::path::PathBuf;

/// Which part of the state went non-finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Acceleration,
    Velocity,
    Position,
    /// The adaptive integrator could not shrink its step any further.
    StepSize,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantity::Acceleration => "acceleration",
            Quantity::Velocity => "velocity",
            Quantity::Position => "position",
            Quantity::StepSize => "step size",
        };
        f.write_str(name)
    }
}

/// Errors raised by the simulation core.
///
/// None of these are recoverable at the level that raises them; they propagate
/// to the caller, which decides whether to abort the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    /// Empty body set, non-positive mass, mismatched array lengths or non-finite input.
    InvalidInitialState(String),
    /// A non-finite value appeared during integration, or the adaptive step underflowed.
    NumericalInstability {
        step: u64,
        time: f64,
        body: usize,
        quantity: Quantity,
    },
    /// A prerequisite file produced by an earlier stage is absent.
    MissingInput { path: PathBuf, stage: &'static str },
    /// Working buffers for `bodies` bodies could not be allocated.
    ResourceExhaustion { bodies: usize, bytes: usize },
    /// A configuration value is outside its domain.
    InvalidConfig(String),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::InvalidInitialState(msg) => write!(f, "invalid initial state: {}", msg),
            SimError::NumericalInstability { step, time, body, quantity: Quantity::StepSize } => write!(
                f,
                "numerical instability at step {} (t = {}): step size underflow near body {}",
                step, time, body
            ),
            SimError::NumericalInstability { step, time, body, quantity } => write!(
                f,
                "numerical instability at step {} (t = {}): non-finite {} for body {}",
                step, time, quantity, body
            ),
            SimError::MissingInput { path, stage } => write!(
                f,
                "missing input '{}': run the {} stage first",
                path.display(),
                stage
            ),
            SimError::ResourceExhaustion { bodies, bytes } => write!(
                f,
                "could not allocate {} bytes of working buffers for {} bodies",
                bytes, bodies
            ),
            SimError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for SimError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_names_the_prerequisite_stage() {
        let err = SimError::MissingInput {
            path: PathBuf::from("data/processed/trajectory_fast.bin"),
            stage: "run",
        };
        let msg = err.to_string();
        assert!(msg.contains("trajectory_fast.bin"));
        assert!(msg.contains("run the run stage first"));
    }

    #[test]
    fn converts_into_anyhow_and_back() {
        let err: anyhow::Error = SimError::ResourceExhaustion { bodies: 10, bytes: 240 }.into();
        assert_eq!(
            err.downcast_ref::<SimError>(),
            Some(&SimError::ResourceExhaustion { bodies: 10, bytes: 240 })
        );
    }
}
