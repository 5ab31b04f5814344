use crate::sim_params::{ReferenceParams, SimParams};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// Configuration for the force law. Units: Msun, pc, km/s.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PhysicsConfig {
    #[serde(default = "default_gravitational_constant")]
    pub gravitational_constant: f64, // pc (km/s)^2 / Msun
    #[serde(default = "default_softening_length")]
    pub softening_length: f64, // pc
}

// Configuration for the fixed-step engine timing
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimingConfig {
    #[serde(default = "default_dt")]
    pub dt: f64,
    #[serde(default = "default_total_steps")]
    pub total_steps: u64,
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

// Configuration for the adaptive reference integrator. Units: Msun, pc, yr.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReferenceConfig {
    #[serde(default = "default_reference_end_time")]
    pub end_time: f64, // yr
    #[serde(default = "default_reference_snapshots")]
    pub snapshots: usize,
    #[serde(default = "default_reference_gravitational_constant")]
    pub gravitational_constant: f64, // pc^3 / (Msun yr^2)
    /// Multiplies working-unit velocities to get reference-unit velocities (km/s -> pc/yr).
    #[serde(default = "default_velocity_to_reference")]
    pub velocity_to_reference: f64,
    #[serde(default = "default_rtol")]
    pub rtol: f64,
    #[serde(default = "default_atol")]
    pub atol: f64,
    #[serde(default = "default_initial_step")]
    pub initial_step: f64,
    #[serde(default = "default_min_step")]
    pub min_step: f64,
}

// Configuration for merger detection on the final snapshot
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_merger_radius")]
    pub merger_radius: f64, // pc
    /// Mergers with more members than this are reported individually.
    #[serde(default = "default_massive_merger_size")]
    pub massive_merger_size: usize,
    /// Monster mass above which a supermassive seed is considered viable (Msun).
    #[serde(default = "default_seed_mass_threshold")]
    pub seed_mass_threshold: f64,
}

// Parameters for the clustered high-redshift initial conditions
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct InitialConditionsConfig {
    #[serde(default = "default_num_bodies")]
    pub num_bodies: usize,
    #[serde(default = "default_box_size_mpc")]
    pub box_size_mpc: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_redshift")]
    pub redshift: f64,
    #[serde(default = "default_mean_mass")]
    pub mean_mass: f64,
    #[serde(default = "default_sigma_mass")]
    pub sigma_mass: f64,
    /// Mass of body 0, placed at rest in the centre of the box.
    #[serde(default = "default_seed_mass")]
    pub seed_mass: f64,
    #[serde(default = "default_nest_sigma_pc")]
    pub nest_sigma_pc: f64,
    #[serde(default = "default_peculiar_sigma_km_s")]
    pub peculiar_sigma_km_s: f64,
    #[serde(default = "default_hubble_constant")]
    pub hubble_constant: f64, // km/s / Mpc
    #[serde(default = "default_omega_m")]
    pub omega_m: f64,
    #[serde(default = "default_omega_lambda")]
    pub omega_lambda: f64,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Bincode,
    MessagePack,
    /// Raw native-endian f64 arrays behind a small header.
    Flat,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Bincode => "bin",
            OutputFormat::MessagePack => "msgpack",
            OutputFormat::Flat => "f64",
        }
    }

    /// Recognises the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(OutputFormat::Json),
            "bin" => Some(OutputFormat::Bincode),
            "msgpack" => Some(OutputFormat::MessagePack),
            "f64" => Some(OutputFormat::Flat),
            _ => None,
        }
    }
}

/// Which engine produced a trajectory; selects the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Fast,
    Reference,
}

impl EngineKind {
    pub fn label(self) -> &'static str {
        match self {
            EngineKind::Fast => "fast",
            EngineKind::Reference => "reference",
        }
    }
}

// Configuration for output settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_base_filename")]
    pub base_filename: String,
    #[serde(default = "default_format")]
    pub format: OutputFormat,
    #[serde(default)]
    pub save_final_positions: bool,
}

impl OutputConfig {
    pub fn initial_conditions_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}_input.{}", self.base_filename, self.format.extension()))
    }

    pub fn trajectory_path(&self, engine: EngineKind) -> PathBuf {
        self.directory.join(format!(
            "{}_trajectory_{}.{}",
            self.base_filename,
            engine.label(),
            self.format.extension()
        ))
    }

    pub fn final_positions_path(&self, engine: EngineKind) -> PathBuf {
        self.directory
            .join(format!("{}_final_positions_{}.csv", self.base_filename, engine.label()))
    }

    pub fn clusters_path(&self) -> PathBuf {
        self.directory.join(format!("{}_clusters.csv", self.base_filename))
    }

    pub fn merger_summary_path(&self) -> PathBuf {
        self.directory.join(format!("{}_mergers.json", self.base_filename))
    }
}

// Main simulation configuration structure, loaded from config.toml.
// Every section may be omitted and falls back to its defaults.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SimulationConfig {
    #[serde(default)]
    pub physics: PhysicsConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub initial_conditions: InitialConditionsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl SimulationConfig {
    /// Loads the simulation configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path_ref.display(), e))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.physics.gravitational_constant.is_finite() && self.physics.gravitational_constant > 0.0) {
            anyhow::bail!("gravitational_constant must be positive.");
        }
        if !(self.physics.softening_length.is_finite() && self.physics.softening_length > 0.0) {
            anyhow::bail!("softening_length must be positive.");
        }
        if !(self.timing.dt.is_finite() && self.timing.dt > 0.0) {
            anyhow::bail!("dt must be positive.");
        }
        if self.timing.total_steps == 0 {
            anyhow::bail!("total_steps must be greater than 0.");
        }
        if self.timing.snapshot_every == 0 {
            anyhow::bail!("snapshot_every must be greater than 0.");
        }
        if !(self.reference.end_time.is_finite() && self.reference.end_time >= 0.0) {
            anyhow::bail!("reference.end_time must be non-negative.");
        }
        if self.reference.snapshots == 0 {
            anyhow::bail!("reference.snapshots must be greater than 0.");
        }
        if !(self.reference.velocity_to_reference.is_finite() && self.reference.velocity_to_reference > 0.0) {
            anyhow::bail!("reference.velocity_to_reference must be positive.");
        }
        if !(self.reference.gravitational_constant.is_finite() && self.reference.gravitational_constant > 0.0) {
            anyhow::bail!("reference.gravitational_constant must be positive.");
        }
        if self.reference.rtol < 0.0 || self.reference.atol < 0.0 || self.reference.rtol + self.reference.atol <= 0.0 {
            anyhow::bail!("reference tolerances must be non-negative and not both zero.");
        }
        if !(self.reference.min_step > 0.0 && self.reference.initial_step >= self.reference.min_step) {
            anyhow::bail!("reference steps must satisfy 0 < min_step <= initial_step.");
        }
        if !(self.analysis.merger_radius.is_finite() && self.analysis.merger_radius >= 0.0) {
            anyhow::bail!("merger_radius must be non-negative.");
        }
        if self.initial_conditions.num_bodies == 0 {
            anyhow::bail!("num_bodies must be greater than 0.");
        }
        if !(self.initial_conditions.box_size_mpc > 0.0) {
            anyhow::bail!("box_size_mpc must be positive.");
        }
        Ok(())
    }

    /// Converts the configuration into the parameters used by the fixed-step engine.
    pub fn get_sim_params(&self) -> SimParams {
        let softening = self.physics.softening_length;
        SimParams {
            g: self.physics.gravitational_constant,
            softening,
            softening_sq: softening * softening,
            dt: self.timing.dt,
            total_steps: self.timing.total_steps,
            snapshot_every: self.timing.snapshot_every,
            progress_every: self.timing.progress_every.max(1),
        }
    }

    /// Converts the configuration into the parameters used by the reference integrator.
    /// Lengths (and therefore the softening) are shared between both unit systems.
    pub fn get_reference_params(&self) -> ReferenceParams {
        let softening = self.physics.softening_length;
        ReferenceParams {
            g: self.reference.gravitational_constant,
            softening,
            softening_sq: softening * softening,
            velocity_to_reference: self.reference.velocity_to_reference,
            end_time: self.reference.end_time,
            snapshots: self.reference.snapshots,
            rtol: self.reference.rtol,
            atol: self.reference.atol,
            initial_step: self.reference.initial_step,
            min_step: self.reference.min_step,
        }
    }
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        PhysicsConfig {
            gravitational_constant: default_gravitational_constant(),
            softening_length: default_softening_length(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            dt: default_dt(),
            total_steps: default_total_steps(),
            snapshot_every: default_snapshot_every(),
            progress_every: default_progress_every(),
        }
    }
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig {
            end_time: default_reference_end_time(),
            snapshots: default_reference_snapshots(),
            gravitational_constant: default_reference_gravitational_constant(),
            velocity_to_reference: default_velocity_to_reference(),
            rtol: default_rtol(),
            atol: default_atol(),
            initial_step: default_initial_step(),
            min_step: default_min_step(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            merger_radius: default_merger_radius(),
            massive_merger_size: default_massive_merger_size(),
            seed_mass_threshold: default_seed_mass_threshold(),
        }
    }
}

impl Default for InitialConditionsConfig {
    fn default() -> Self {
        InitialConditionsConfig {
            num_bodies: default_num_bodies(),
            box_size_mpc: default_box_size_mpc(),
            seed: default_seed(),
            redshift: default_redshift(),
            mean_mass: default_mean_mass(),
            sigma_mass: default_sigma_mass(),
            seed_mass: default_seed_mass(),
            nest_sigma_pc: default_nest_sigma_pc(),
            peculiar_sigma_km_s: default_peculiar_sigma_km_s(),
            hubble_constant: default_hubble_constant(),
            omega_m: default_omega_m(),
            omega_lambda: default_omega_lambda(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            directory: default_directory(),
            base_filename: default_base_filename(),
            format: default_format(),
            save_final_positions: false,
        }
    }
}

fn default_gravitational_constant() -> f64 {
    4.30091e-3
}

fn default_softening_length() -> f64 {
    100.0
}

fn default_dt() -> f64 {
    0.1
}

fn default_total_steps() -> u64 {
    500
}

fn default_snapshot_every() -> u64 {
    5
}

fn default_progress_every() -> u64 {
    50
}

fn default_reference_end_time() -> f64 {
    500e6
}

fn default_reference_snapshots() -> usize {
    100
}

fn default_reference_gravitational_constant() -> f64 {
    4.498502151469554e-15
}

fn default_velocity_to_reference() -> f64 {
    1.022690e-6 // 1 km/s in pc/yr
}

fn default_rtol() -> f64 {
    1e-9
}

fn default_atol() -> f64 {
    1e-6
}

fn default_initial_step() -> f64 {
    1e3
}

fn default_min_step() -> f64 {
    1e-6
}

fn default_merger_radius() -> f64 {
    15000.0
}

fn default_massive_merger_size() -> usize {
    5
}

fn default_seed_mass_threshold() -> f64 {
    1e12
}

fn default_num_bodies() -> usize {
    100
}

fn default_box_size_mpc() -> f64 {
    5.0
}

fn default_seed() -> u64 {
    42
}

fn default_redshift() -> f64 {
    7.0
}

fn default_mean_mass() -> f64 {
    1e10
}

fn default_sigma_mass() -> f64 {
    0.5
}

fn default_seed_mass() -> f64 {
    1e13
}

fn default_nest_sigma_pc() -> f64 {
    200_000.0
}

fn default_peculiar_sigma_km_s() -> f64 {
    100.0
}

fn default_hubble_constant() -> f64 {
    70.0
}

fn default_omega_m() -> f64 {
    0.3
}

fn default_omega_lambda() -> f64 {
    0.7
}

fn default_directory() -> PathBuf {
    PathBuf::from("data/processed")
}

fn default_base_filename() -> String {
    "chimera".to_string()
}

fn default_format() -> OutputFormat {
    OutputFormat::Bincode
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = SimulationConfig::from_toml_str("").unwrap();
        let params = config.get_sim_params();
        assert_eq!(params.g, 4.30091e-3);
        assert_eq!(params.softening_sq, 100.0 * 100.0);
        assert_eq!(params.snapshot_every, 5);
        assert_eq!(config.output.format, OutputFormat::Bincode);
    }

    #[test]
    fn sections_override_defaults() {
        let config = SimulationConfig::from_toml_str(
            r#"
            [physics]
            gravitational_constant = 1.0
            softening_length = 0.1

            [timing]
            dt = 0.01
            total_steps = 1000
            snapshot_every = 10

            [analysis]
            merger_radius = 0.05

            [output]
            format = "messagepack"
            "#,
        )
        .unwrap();
        let params = config.get_sim_params();
        assert_eq!(params.g, 1.0);
        assert!((params.softening_sq - 0.01).abs() < 1e-15);
        assert_eq!(params.total_steps, 1000);
        assert_eq!(config.analysis.merger_radius, 0.05);
        assert_eq!(
            config.output.trajectory_path(EngineKind::Fast),
            PathBuf::from("data/processed/chimera_trajectory_fast.msgpack")
        );
    }

    #[test]
    fn rejects_out_of_domain_values() {
        assert!(SimulationConfig::from_toml_str("[timing]\ndt = 0.0").is_err());
        assert!(SimulationConfig::from_toml_str("[timing]\nsnapshot_every = 0").is_err());
        assert!(SimulationConfig::from_toml_str("[physics]\nsoftening_length = -1.0").is_err());
        assert!(SimulationConfig::from_toml_str("[analysis]\nmerger_radius = -5.0").is_err());
    }

    #[test]
    fn format_is_recognised_from_extension() {
        for format in [OutputFormat::Json, OutputFormat::Bincode, OutputFormat::MessagePack, OutputFormat::Flat] {
            let path = PathBuf::from(format!("x.{}", format.extension()));
            assert_eq!(OutputFormat::from_path(&path), Some(format));
        }
        assert_eq!(OutputFormat::from_path(Path::new("x.npy")), None);
    }
}
