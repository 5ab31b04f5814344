//! Merger detection: bodies closer than a merger radius are linked, and every connected
//! component of the resulting proximity graph is one cluster.

use crate::grid::SpatialGrid;
use log::{debug, info, warn};
use orion_common::{AnalysisConfig, SimError, Snapshot, Trajectory, Vec3};
use serde::Serialize;

/// One connected component: the bodies it contains and their combined mass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    /// Body indices, ascending.
    pub members: Vec<usize>,
    pub mass: f64,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// A cluster of more than one body.
    pub fn is_merger(&self) -> bool {
        self.members.len() > 1
    }
}

/// Clusters of one snapshot plus summary statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergerReport {
    pub radius: f64,
    /// Every body appears in exactly one cluster. Ordered by smallest member.
    pub clusters: Vec<Cluster>,
    pub merger_events: usize,
    /// Index into `clusters` of the heaviest cluster, singletons included.
    pub monster: Option<usize>,
    pub monster_mass: f64,
    /// Whether the heaviest merger clears the seed-mass threshold. `None` when no
    /// threshold was configured; `Some(false)` when nothing merged.
    pub seed_viable: Option<bool>,
}

impl MergerReport {
    pub fn total_clusters(&self) -> usize {
        self.clusters.len()
    }

    pub fn monster(&self) -> Option<&Cluster> {
        self.monster.map(|idx| &self.clusters[idx])
    }

    pub fn mergers(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.iter().filter(|c| c.is_merger())
    }

    /// Heaviest cluster of more than one body; the first discovered wins ties.
    pub fn heaviest_merger(&self) -> Option<&Cluster> {
        self.mergers()
            .fold(None, |best: Option<&Cluster>, c| match best {
                Some(b) if c.mass <= b.mass => Some(b),
                _ => Some(c),
            })
    }

    /// Cluster id of every body.
    pub fn labels(&self, n_bodies: usize) -> Vec<usize> {
        let mut labels = vec![usize::MAX; n_bodies];
        for (id, cluster) in self.clusters.iter().enumerate() {
            for &member in &cluster.members {
                labels[member] = id;
            }
        }
        labels
    }
}

/// Finds clusters of bodies whose mutual distances chain together within `radius`.
#[derive(Debug, Clone)]
pub struct MergerDetector {
    radius: f64,
    massive_merger_size: usize,
    seed_mass_threshold: Option<f64>,
}

impl MergerDetector {
    pub fn new(radius: f64) -> Result<Self, SimError> {
        if !(radius.is_finite() && radius >= 0.0) {
            return Err(SimError::InvalidConfig(format!(
                "merger radius must be finite and non-negative, got {}",
                radius
            )));
        }
        Ok(Self { radius, massive_merger_size: usize::MAX, seed_mass_threshold: None })
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Self, SimError> {
        Ok(Self::new(config.merger_radius)?
            .with_massive_merger_size(config.massive_merger_size)
            .with_seed_mass_threshold(config.seed_mass_threshold))
    }

    /// Mergers with more members than `size` are logged as warnings.
    pub fn with_massive_merger_size(mut self, size: usize) -> Self {
        self.massive_merger_size = size;
        self
    }

    /// Merged mass above which a supermassive seed is considered viable. Only
    /// clusters of more than one body count; a lone heavy body is not growth.
    pub fn with_seed_mass_threshold(mut self, threshold: f64) -> Self {
        self.seed_mass_threshold = Some(threshold);
        self
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Clusters the final snapshot of `trajectory`.
    pub fn detect_final(&self, trajectory: &Trajectory) -> Result<MergerReport, SimError> {
        let snapshot: &Snapshot = trajectory
            .final_snapshot()
            .ok_or_else(|| SimError::InvalidInitialState("trajectory has no snapshots".to_string()))?;
        info!(
            "Analysing snapshot at step {} (t = {:.4}) with merger radius {}",
            snapshot.step, snapshot.time, self.radius
        );
        self.detect(&snapshot.positions, trajectory.masses())
    }

    pub fn detect(&self, positions: &[Vec3], masses: &[f64]) -> Result<MergerReport, SimError> {
        if positions.len() != masses.len() {
            return Err(SimError::InvalidInitialState(format!(
                "{} positions but {} masses",
                positions.len(),
                masses.len()
            )));
        }
        if let Some(idx) = positions.iter().position(|p| !p.is_finite()) {
            return Err(SimError::InvalidInitialState(format!("body {} has a non-finite position", idx)));
        }

        let grid = SpatialGrid::for_radius(positions, self.radius);
        let neighbors = grid.neighbors_within(positions, self.radius);
        debug!(
            "Merger grid: {} bodies in {} occupied cells",
            positions.len(),
            grid.occupied_cells()
        );

        let clusters = connected_components(&neighbors, masses);
        let merger_events = clusters.iter().filter(|c| c.is_merger()).count();
        let mut monster: Option<usize> = None;
        for (idx, cluster) in clusters.iter().enumerate() {
            // Strict comparison keeps the first-discovered cluster on ties.
            if monster.map_or(true, |best| cluster.mass > clusters[best].mass) {
                monster = Some(idx);
            }
        }
        let monster_mass = monster.map_or(0.0, |idx| clusters[idx].mass);

        let mut report = MergerReport {
            radius: self.radius,
            clusters,
            merger_events,
            monster,
            monster_mass,
            seed_viable: None,
        };
        report.seed_viable = self.seed_viable(&report);
        self.log_report(&report);
        Ok(report)
    }

    /// Compares the heaviest merger against the seed-mass threshold, if one is set.
    pub fn seed_viable(&self, report: &MergerReport) -> Option<bool> {
        let threshold = self.seed_mass_threshold?;
        Some(report.heaviest_merger().is_some_and(|c| c.mass > threshold))
    }

    fn log_report(&self, report: &MergerReport) {
        info!(
            "Found {} clusters, {} merger events.",
            report.total_clusters(),
            report.merger_events
        );
        for cluster in report.mergers().filter(|c| c.len() > self.massive_merger_size) {
            warn!(
                "Massive merger: {} bodies, combined mass {:.3e} (bodies {:?})",
                cluster.len(),
                cluster.mass,
                cluster.members
            );
        }
        if let Some(monster) = report.monster() {
            info!("Monster: {} bodies, mass {:.3e}", monster.len(), report.monster_mass);
        }
        let (Some(threshold), Some(viable)) = (self.seed_mass_threshold, report.seed_viable) else {
            return;
        };
        let merged_mass = report.heaviest_merger().map_or(0.0, |c| c.mass);
        if viable {
            info!(
                "Heaviest merger {:.3e} exceeds {:.1e}: a supermassive seed can form.",
                merged_mass, threshold
            );
        } else {
            info!(
                "Heaviest merger {:.3e} stays below {:.1e}: insufficient growth, no supermassive seed.",
                merged_mass, threshold
            );
        }
    }
}

/// Labels the connected components of the neighbor graph with an explicit-stack
/// depth-first traversal. Components come out ordered by their smallest member.
fn connected_components(neighbors: &[Vec<usize>], masses: &[f64]) -> Vec<Cluster> {
    let n = neighbors.len();
    let mut visited = vec![false; n];
    let mut stack = Vec::new();
    let mut clusters = Vec::new();

    for root in 0..n {
        if visited[root] {
            continue;
        }
        visited[root] = true;
        stack.push(root);
        let mut members = Vec::new();
        while let Some(current) = stack.pop() {
            members.push(current);
            for &next in &neighbors[current] {
                if !visited[next] {
                    visited[next] = true;
                    stack.push(next);
                }
            }
        }
        members.sort_unstable();
        let mass = members.iter().map(|&i| masses[i]).sum();
        clusters.push(Cluster { members, mass });
    }
    clusters
}
