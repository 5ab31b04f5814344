use crate::error::SimError;
use crate::vecmath::Vec3;
use serde::{Deserialize, Serialize};

/// Positions of every body at one sampled step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Number of integrator ticks completed when the snapshot was taken.
    pub step: u64,
    /// Simulation time at which the snapshot was taken, in the engine's time unit.
    pub time: f64,
    pub positions: Vec<Vec3>,
}

/// Append-only position history of a run, stored with the static masses.
///
/// Every snapshot holds exactly `masses.len()` positions, in body index order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    masses: Vec<f64>,
    snapshots: Vec<Snapshot>,
}

impl Trajectory {
    pub fn new(masses: Vec<f64>) -> Self {
        Trajectory { masses, snapshots: Vec::new() }
    }

    /// Builds a trajectory from loaded parts, checking the body count of every snapshot.
    pub fn from_parts(masses: Vec<f64>, snapshots: Vec<Snapshot>) -> Result<Self, SimError> {
        let trajectory = Trajectory { masses, snapshots };
        trajectory.validate()?;
        Ok(trajectory)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        for (i, snapshot) in self.snapshots.iter().enumerate() {
            if snapshot.positions.len() != self.masses.len() {
                return Err(SimError::InvalidInitialState(format!(
                    "snapshot {} has {} positions but the trajectory has {} masses",
                    i,
                    snapshot.positions.len(),
                    self.masses.len()
                )));
            }
        }
        Ok(())
    }

    pub fn push(&mut self, snapshot: Snapshot) -> Result<(), SimError> {
        if snapshot.positions.len() != self.masses.len() {
            return Err(SimError::InvalidInitialState(format!(
                "snapshot at step {} has {} positions, expected {}",
                snapshot.step,
                snapshot.positions.len(),
                self.masses.len()
            )));
        }
        self.snapshots.push(snapshot);
        Ok(())
    }

    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    pub fn n_bodies(&self) -> usize {
        self.masses.len()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn final_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_rejects_snapshots_with_wrong_body_count() {
        let mut trajectory = Trajectory::new(vec![1.0, 2.0]);
        let ok = Snapshot { step: 1, time: 0.1, positions: vec![Vec3::zero(); 2] };
        let bad = Snapshot { step: 2, time: 0.2, positions: vec![Vec3::zero(); 3] };

        trajectory.push(ok.clone()).unwrap();
        assert!(matches!(trajectory.push(bad), Err(SimError::InvalidInitialState(_))));
        assert_eq!(trajectory.len(), 1);
        assert_eq!(trajectory.final_snapshot(), Some(&ok));
    }
}
