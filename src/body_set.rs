use orion_common::{InitialConditions, Quantity, SimError, Vec3};
use rayon::prelude::*;

/// Holds the state of every body as parallel arrays (structure of arrays).
///
/// The three arrays always share one length and one ordering; the index of a body is
/// its identity for the whole run. Only the contents of positions and velocities can
/// change after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct BodySet {
    masses: Vec<f64>,
    positions: Vec<Vec3>,
    velocities: Vec<Vec3>,
    time: f64,
}

impl BodySet {
    /// Creates a validated body set at time zero.
    pub fn new(masses: Vec<f64>, positions: Vec<Vec3>, velocities: Vec<Vec3>) -> Result<Self, SimError> {
        if masses.is_empty() {
            return Err(SimError::InvalidInitialState("no bodies".to_string()));
        }
        if positions.len() != masses.len() || velocities.len() != masses.len() {
            return Err(SimError::InvalidInitialState(format!(
                "mismatched array lengths: {} masses, {} positions, {} velocities",
                masses.len(),
                positions.len(),
                velocities.len()
            )));
        }
        if let Some((idx, m)) = masses.iter().enumerate().find(|(_, m)| !(m.is_finite() && **m > 0.0)) {
            return Err(SimError::InvalidInitialState(format!("body {} has mass {}", idx, m)));
        }
        if let Some(idx) = positions.iter().position(|p| !p.is_finite()) {
            return Err(SimError::InvalidInitialState(format!("body {} has a non-finite position", idx)));
        }
        if let Some(idx) = velocities.iter().position(|v| !v.is_finite()) {
            return Err(SimError::InvalidInitialState(format!("body {} has a non-finite velocity", idx)));
        }
        Ok(Self { masses, positions, velocities, time: 0.0 })
    }

    pub fn from_initial_conditions(ic: &InitialConditions) -> Result<Self, SimError> {
        Self::new(ic.masses.clone(), ic.positions.clone(), ic.velocities.clone())
    }

    pub fn len(&self) -> usize {
        self.masses.len()
    }

    /// Always false for a constructed set; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.masses.is_empty()
    }

    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn velocities(&self) -> &[Vec3] {
        &self.velocities
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    /// Mutable views of positions and velocities. Slices keep the length invariant intact.
    pub fn state_mut(&mut self) -> (&mut [Vec3], &mut [Vec3]) {
        (&mut self.positions, &mut self.velocities)
    }

    pub fn positions_mut(&mut self) -> &mut [Vec3] {
        &mut self.positions
    }

    pub fn velocities_mut(&mut self) -> &mut [Vec3] {
        &mut self.velocities
    }

    /// Consumes the set, returning masses, positions and velocities.
    pub fn into_parts(self) -> (Vec<f64>, Vec<Vec3>, Vec<Vec3>) {
        (self.masses, self.positions, self.velocities)
    }

    pub fn total_mass(&self) -> f64 {
        self.masses.iter().sum()
    }

    pub fn center_of_mass(&self) -> (Vec3, Vec3) {
        let total = self.total_mass();
        let mut position = Vec3::zero();
        let mut velocity = Vec3::zero();
        for ((&m, &x), &v) in self.masses.iter().zip(&self.positions).zip(&self.velocities) {
            position += x * m;
            velocity += v * m;
        }
        (position / total, velocity / total)
    }

    /// Shifts positions and velocities into the centre-of-mass frame.
    pub fn move_to_center_of_mass(&mut self) {
        let (com_x, com_v) = self.center_of_mass();
        for x in self.positions.iter_mut() {
            *x -= com_x;
        }
        for v in self.velocities.iter_mut() {
            *v -= com_v;
        }
    }

    /// First body with a non-finite velocity or position, if any.
    pub fn first_non_finite(&self) -> Option<(usize, Quantity)> {
        let velocity = self
            .velocities
            .par_iter()
            .position_first(|v| !v.is_finite())
            .map(|idx| (idx, Quantity::Velocity));
        velocity.or_else(|| {
            self.positions
                .par_iter()
                .position_first(|x| !x.is_finite())
                .map(|idx| (idx, Quantity::Position))
        })
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.masses
            .par_iter()
            .zip(self.velocities.par_iter())
            .map(|(&m, v)| 0.5 * m * v.length_squared())
            .sum()
    }

    /// Potential energy of the softened force law, `-G m_i m_j / sqrt(r^2 + eps^2)` per pair.
    pub fn potential_energy(&self, g: f64, softening_sq: f64) -> f64 {
        let n = self.len();
        (0..n)
            .into_par_iter()
            .map(|i| {
                let xi = self.positions[i];
                let mi = self.masses[i];
                ((i + 1)..n)
                    .map(|j| {
                        let d2 = xi.distance_squared(self.positions[j]) + softening_sq;
                        -g * mi * self.masses[j] / d2.sqrt()
                    })
                    .sum::<f64>()
            })
            .sum()
    }

    pub fn total_energy(&self, g: f64, softening_sq: f64) -> f64 {
        self.kinetic_energy() + self.potential_energy(g, softening_sq)
    }
}
