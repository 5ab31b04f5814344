//! Reading and writing of initial conditions and trajectories.
//!
//! The serde formats (JSON, bincode, MessagePack) store the records as-is. The
//! flat format stores raw native-endian arrays behind a short header so other
//! tools can map them directly:
//!
//! ```text
//! trajectory:          "ORNTRAJ1" | n_bodies: u64 | n_snapshots: u64 | masses: f64[N]
//!                      | n_snapshots x (step: u64 | time: f64 | positions: f64[N*3])
//! initial conditions:  "ORNTICS1" | n_bodies: u64 | redshift: f64 | masses: f64[N]
//!                      | positions: f64[N*3] | velocities: f64[N*3]
//! ```

use crate::config::OutputFormat;
use crate::error::SimError;
use crate::initial::InitialConditions;
use crate::snapshot::{Snapshot, Trajectory};
use crate::vecmath::Vec3;
use anyhow::{Context, Result};
use log::info;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use zerocopy::{FromBytes, IntoBytes};

const TRAJECTORY_MAGIC: &[u8; 8] = b"ORNTRAJ1";
const INITIAL_CONDITIONS_MAGIC: &[u8; 8] = b"ORNTICS1";

/// Writes a trajectory, creating the parent directory if needed.
pub fn save_trajectory(path: &Path, trajectory: &Trajectory, format: OutputFormat) -> Result<()> {
    let mut writer = create_writer(path)?;
    match format {
        OutputFormat::Json => serde_json::to_writer(&mut writer, trajectory)
            .with_context(|| format!("Error serializing trajectory to JSON '{}'", path.display()))?,
        OutputFormat::Bincode => bincode::serialize_into(&mut writer, trajectory)
            .with_context(|| format!("Error serializing trajectory to bincode '{}'", path.display()))?,
        OutputFormat::MessagePack => rmp_serde::encode::write(&mut writer, trajectory)
            .with_context(|| format!("Error serializing trajectory to MessagePack '{}'", path.display()))?,
        OutputFormat::Flat => write_flat_trajectory(&mut writer, trajectory)
            .with_context(|| format!("Error writing flat trajectory '{}'", path.display()))?,
    }
    writer.flush()?;
    info!(
        "Trajectory with {} snapshots of {} bodies saved to {}",
        trajectory.len(),
        trajectory.n_bodies(),
        path.display()
    );
    Ok(())
}

/// Reads a trajectory, choosing the decoder from the file extension.
///
/// An absent file is reported as [`SimError::MissingInput`] naming `stage`, the step
/// of the pipeline that produces it.
pub fn load_trajectory(path: &Path, stage: &'static str) -> Result<Trajectory> {
    let format = input_format(path, stage)?;
    let trajectory = match format {
        OutputFormat::Flat => {
            let bytes = fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
            read_flat_trajectory(&bytes)
                .with_context(|| format!("Failed to decode flat trajectory '{}'", path.display()))?
        }
        _ => {
            let reader = BufReader::new(
                File::open(path).with_context(|| format!("Failed to open '{}'", path.display()))?,
            );
            let trajectory: Trajectory = match format {
                OutputFormat::Json => serde_json::from_reader(reader).map_err(anyhow::Error::from),
                OutputFormat::Bincode => bincode::deserialize_from(reader).map_err(anyhow::Error::from),
                _ => rmp_serde::decode::from_read(reader).map_err(anyhow::Error::from),
            }
            .with_context(|| format!("Failed to decode trajectory '{}'", path.display()))?;
            trajectory
        }
    };
    trajectory.validate()?;
    Ok(trajectory)
}

pub fn save_initial_conditions(path: &Path, ic: &InitialConditions, format: OutputFormat) -> Result<()> {
    ic.check_lengths()?;
    let mut writer = create_writer(path)?;
    match format {
        OutputFormat::Json => serde_json::to_writer(&mut writer, ic)?,
        OutputFormat::Bincode => bincode::serialize_into(&mut writer, ic)?,
        OutputFormat::MessagePack => rmp_serde::encode::write(&mut writer, ic)?,
        OutputFormat::Flat => write_flat_initial_conditions(&mut writer, ic)?,
    }
    writer.flush()?;
    info!("Initial conditions for {} bodies saved to {}", ic.len(), path.display());
    Ok(())
}

pub fn load_initial_conditions(path: &Path) -> Result<InitialConditions> {
    let format = input_format(path, "generate")?;
    let ic: InitialConditions = match format {
        OutputFormat::Flat => {
            let bytes = fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
            read_flat_initial_conditions(&bytes)?
        }
        OutputFormat::Json => serde_json::from_reader(BufReader::new(File::open(path)?))?,
        OutputFormat::Bincode => bincode::deserialize_from(BufReader::new(File::open(path)?))?,
        OutputFormat::MessagePack => rmp_serde::decode::from_read(BufReader::new(File::open(path)?))?,
    };
    ic.check_lengths()?;
    Ok(ic)
}

fn input_format(path: &Path, stage: &'static str) -> Result<OutputFormat> {
    if !path.exists() {
        return Err(SimError::MissingInput { path: path.to_path_buf(), stage }.into());
    }
    OutputFormat::from_path(path)
        .ok_or_else(|| anyhow::anyhow!("Unrecognised file extension for '{}'", path.display()))
}

fn create_writer(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
        }
    }
    let file = File::create(path).with_context(|| format!("Error creating file '{}'", path.display()))?;
    Ok(BufWriter::new(file))
}

fn flatten(vectors: &[Vec3]) -> Vec<f64> {
    vectors.iter().flat_map(|v| v.to_array()).collect()
}

fn write_flat_trajectory<W: Write>(writer: &mut W, trajectory: &Trajectory) -> Result<()> {
    writer.write_all(TRAJECTORY_MAGIC)?;
    let header = [trajectory.n_bodies() as u64, trajectory.len() as u64];
    writer.write_all(header.as_bytes())?;
    writer.write_all(trajectory.masses().as_bytes())?;
    for snapshot in trajectory.snapshots() {
        writer.write_all(snapshot.step.as_bytes())?;
        writer.write_all(snapshot.time.as_bytes())?;
        writer.write_all(flatten(&snapshot.positions).as_bytes())?;
    }
    Ok(())
}

fn write_flat_initial_conditions<W: Write>(writer: &mut W, ic: &InitialConditions) -> Result<()> {
    writer.write_all(INITIAL_CONDITIONS_MAGIC)?;
    writer.write_all((ic.len() as u64).as_bytes())?;
    writer.write_all(ic.redshift.as_bytes())?;
    writer.write_all(ic.masses.as_bytes())?;
    writer.write_all(flatten(&ic.positions).as_bytes())?;
    writer.write_all(flatten(&ic.velocities).as_bytes())?;
    Ok(())
}

/// Sequential decoder over a flat file held in memory.
struct FlatReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FlatReader<'a> {
    fn new(bytes: &'a [u8], magic: &[u8; 8]) -> Result<Self> {
        if bytes.len() < magic.len() || &bytes[..magic.len()] != magic {
            anyhow::bail!("not a flat file of the expected kind (bad magic)");
        }
        Ok(FlatReader { bytes, offset: magic.len() })
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| anyhow::anyhow!("flat file truncated at byte {}", self.offset))?;
        let chunk = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(chunk)
    }

    fn read_u64(&mut self) -> Result<u64> {
        let chunk = self.take(8)?;
        u64::read_from_bytes(chunk).map_err(|_| anyhow::anyhow!("misread u64"))
    }

    fn read_f64(&mut self) -> Result<f64> {
        let chunk = self.take(8)?;
        f64::read_from_bytes(chunk).map_err(|_| anyhow::anyhow!("misread f64"))
    }

    fn read_f64s(&mut self, count: usize) -> Result<Vec<f64>> {
        let len = count
            .checked_mul(8)
            .ok_or_else(|| anyhow::anyhow!("array length {} overflows", count))?;
        let chunk = self.take(len)?;
        chunk
            .chunks_exact(8)
            .map(|c| f64::read_from_bytes(c).map_err(|_| anyhow::anyhow!("misread f64")))
            .collect()
    }

    fn read_vec3s(&mut self, count: usize) -> Result<Vec<Vec3>> {
        let values = self.read_f64s(count.checked_mul(3).unwrap_or(usize::MAX))?;
        Ok(values.chunks_exact(3).map(|c| Vec3::new(c[0], c[1], c[2])).collect())
    }

    fn finish(&self) -> Result<()> {
        if self.offset != self.bytes.len() {
            anyhow::bail!("{} trailing bytes in flat file", self.bytes.len() - self.offset);
        }
        Ok(())
    }
}

fn read_flat_trajectory(bytes: &[u8]) -> Result<Trajectory> {
    let mut reader = FlatReader::new(bytes, TRAJECTORY_MAGIC)?;
    let n_bodies = reader.read_u64()? as usize;
    let n_snapshots = reader.read_u64()? as usize;
    let masses = reader.read_f64s(n_bodies)?;
    let mut snapshots = Vec::new();
    for _ in 0..n_snapshots {
        let step = reader.read_u64()?;
        let time = reader.read_f64()?;
        let positions = reader.read_vec3s(n_bodies)?;
        snapshots.push(Snapshot { step, time, positions });
    }
    reader.finish()?;
    Ok(Trajectory::from_parts(masses, snapshots)?)
}

fn read_flat_initial_conditions(bytes: &[u8]) -> Result<InitialConditions> {
    let mut reader = FlatReader::new(bytes, INITIAL_CONDITIONS_MAGIC)?;
    let n_bodies = reader.read_u64()? as usize;
    let redshift = reader.read_f64()?;
    let masses = reader.read_f64s(n_bodies)?;
    let positions = reader.read_vec3s(n_bodies)?;
    let velocities = reader.read_vec3s(n_bodies)?;
    reader.finish()?;
    Ok(InitialConditions { redshift, masses, positions, velocities })
}
