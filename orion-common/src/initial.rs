use crate::error::SimError;
use crate::vecmath::Vec3;
use serde::{Deserialize, Serialize};

/// Initial conditions handed to the engines: one entry per body plus the seeding redshift.
///
/// Units are the working units of the fast engine (Msun, pc, km/s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialConditions {
    pub redshift: f64,
    pub masses: Vec<f64>,
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
}

impl InitialConditions {
    pub fn len(&self) -> usize {
        self.masses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masses.is_empty()
    }

    /// Checks the three per-body arrays agree in length.
    pub fn check_lengths(&self) -> Result<(), SimError> {
        if self.positions.len() != self.masses.len() || self.velocities.len() != self.masses.len() {
            return Err(SimError::InvalidInitialState(format!(
                "mismatched array lengths: {} masses, {} positions, {} velocities",
                self.masses.len(),
                self.positions.len(),
                self.velocities.len()
            )));
        }
        Ok(())
    }
}
