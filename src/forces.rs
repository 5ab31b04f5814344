//! Direct-summation softened gravity.
//!
//! Every body feels every other body, `a_i = sum_{j != i} G m_j (x_j - x_i) / (r_ij^2 + eps^2)^(3/2)`.
//! Each body's sum runs over its partners in index order, so the sequential and the
//! parallel kernel produce bit-identical accelerations.

use orion_common::{ReferenceParams, SimError, SimParams, Vec3};
use rayon::prelude::*;

/// Computes the gravitational acceleration of every body.
pub trait ForceKernel: Send + Sync {
    /// Writes the acceleration of body `i` into `out[i]`.
    ///
    /// `masses`, `positions` and `out` must have the same length.
    fn accelerations(&self, masses: &[f64], positions: &[Vec3], out: &mut [Vec3]);
}

/// Sequential O(N^2) kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectGravity {
    pub g: f64,
    pub softening_sq: f64,
}

impl DirectGravity {
    pub fn new(g: f64, softening: f64) -> Self {
        Self { g, softening_sq: softening * softening }
    }

    pub fn from_params(params: &SimParams) -> Self {
        Self { g: params.g, softening_sq: params.softening_sq }
    }

    pub fn from_reference(params: &ReferenceParams) -> Self {
        Self { g: params.g, softening_sq: params.softening_sq }
    }
}

impl ForceKernel for DirectGravity {
    fn accelerations(&self, masses: &[f64], positions: &[Vec3], out: &mut [Vec3]) {
        debug_assert_eq!(masses.len(), positions.len());
        debug_assert_eq!(out.len(), positions.len());
        for (i, acc) in out.iter_mut().enumerate() {
            *acc = acceleration_on(i, masses, positions, self.g, self.softening_sq);
        }
    }
}

/// Data-parallel O(N^2) kernel; one rayon task per receiving body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParallelDirectGravity {
    pub g: f64,
    pub softening_sq: f64,
}

impl ParallelDirectGravity {
    pub fn new(g: f64, softening: f64) -> Self {
        Self { g, softening_sq: softening * softening }
    }

    pub fn from_params(params: &SimParams) -> Self {
        Self { g: params.g, softening_sq: params.softening_sq }
    }
}

impl ForceKernel for ParallelDirectGravity {
    fn accelerations(&self, masses: &[f64], positions: &[Vec3], out: &mut [Vec3]) {
        debug_assert_eq!(masses.len(), positions.len());
        debug_assert_eq!(out.len(), positions.len());
        let (g, softening_sq) = (self.g, self.softening_sq);
        // The join at the end of for_each is the barrier: all of `out` is written on return.
        out.par_iter_mut().enumerate().for_each(|(i, acc)| {
            *acc = acceleration_on(i, masses, positions, g, softening_sq);
        });
    }
}

#[inline(always)]
fn acceleration_on(i: usize, masses: &[f64], positions: &[Vec3], g: f64, softening_sq: f64) -> Vec3 {
    let xi = positions[i];
    let mut acc = Vec3::zero();
    for (j, (&xj, &mj)) in positions.iter().zip(masses).enumerate() {
        if j == i {
            continue;
        }
        let r = xj - xi;
        let d2 = r.length_squared() + softening_sq;
        let inv_d = d2.sqrt().recip();
        let inv_d3 = inv_d * inv_d * inv_d;
        acc += r * (g * mj * inv_d3);
    }
    acc
}

/// Allocates a zeroed acceleration buffer for `n` bodies without aborting on failure.
pub fn allocate_accelerations(n: usize) -> Result<Vec<Vec3>, SimError> {
    let bytes = n.saturating_mul(std::mem::size_of::<Vec3>());
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(n)
        .map_err(|_| SimError::ResourceExhaustion { bodies: n, bytes })?;
    buffer.resize(n, Vec3::zero());
    Ok(buffer)
}
