//! CSV and JSON outputs of the CLI stages.

use crate::body_set::BodySet;
use crate::merger::MergerReport;
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// One row per body: mass, position and velocity of the final state.
pub fn write_final_state_csv(path: &Path, bodies: &BodySet) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Error creating CSV file '{}'", path.display()))?;
    writer.write_record(["index", "mass", "x", "y", "z", "vx", "vy", "vz"])?;
    for (idx, ((&m, x), v)) in bodies
        .masses()
        .iter()
        .zip(bodies.positions())
        .zip(bodies.velocities())
        .enumerate()
    {
        writer.write_record(&[
            idx.to_string(),
            format!("{:e}", m),
            format!("{:.6}", x.x),
            format!("{:.6}", x.y),
            format!("{:.6}", x.z),
            format!("{:.6e}", v.x),
            format!("{:.6e}", v.y),
            format!("{:.6e}", v.z),
        ])?;
    }
    writer.flush()?;
    info!("Final state of {} bodies saved to {}", bodies.len(), path.display());
    Ok(())
}

/// One row per cluster: id, size, combined mass and space-separated member indices.
pub fn write_clusters_csv(path: &Path, report: &MergerReport) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Error creating CSV file '{}'", path.display()))?;
    writer.write_record(["cluster", "size", "mass", "members"])?;
    for (id, cluster) in report.clusters.iter().enumerate() {
        let members: Vec<String> = cluster.members.iter().map(|m| m.to_string()).collect();
        writer.write_record(&[
            id.to_string(),
            cluster.len().to_string(),
            format!("{:e}", cluster.mass),
            members.join(" "),
        ])?;
    }
    writer.flush()?;
    info!("{} clusters saved to {}", report.total_clusters(), path.display());
    Ok(())
}

#[derive(Serialize)]
struct MergerSummary<'a> {
    radius: f64,
    total_clusters: usize,
    merger_events: usize,
    monster_mass: f64,
    monster_members: &'a [usize],
    largest_merger_size: usize,
    heaviest_merger_mass: f64,
    seed_viable: Option<bool>,
}

/// Headline numbers of a merger report as pretty JSON.
pub fn write_merger_summary(path: &Path, report: &MergerReport) -> Result<()> {
    ensure_parent(path)?;
    let summary = MergerSummary {
        radius: report.radius,
        total_clusters: report.total_clusters(),
        merger_events: report.merger_events,
        monster_mass: report.monster_mass,
        monster_members: report.monster().map(|c| c.members.as_slice()).unwrap_or(&[]),
        largest_merger_size: report.mergers().map(|c| c.len()).max().unwrap_or(0),
        heaviest_merger_mass: report.heaviest_merger().map_or(0.0, |c| c.mass),
        seed_viable: report.seed_viable,
    };
    let file = File::create(path).with_context(|| format!("Error creating '{}'", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &summary)
        .with_context(|| format!("Error writing merger summary '{}'", path.display()))?;
    info!("Merger summary saved to {}", path.display());
    Ok(())
}
