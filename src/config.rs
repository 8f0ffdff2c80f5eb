//! Configuration system using Figment.
//!
//! This module provides strongly-typed configuration loading for the
//! Mesoscope-VR acquisition system. Configuration is loaded from:
//! 1. `mesovr.toml` file (base configuration)
//! 2. Environment variables (prefixed with `MESOVR_`)
//!
//! # Environment Variable Overrides
//!
//! Environment variables with the `MESOVR_` prefix can override configuration
//! values:
//!
//! ```text
//! MESOVR_RUNTIME_MINIMUM_CPU_CORES=16
//! MESOVR_PREPROCESSING_TRANSFER_THREADS=8
//! ```
//!
//! All defaults are named constants validated at construction time. Each
//! session kind has its own explicit configuration struct; runtime behavior
//! is selected by data (state maps, module enable sets), never by
//! subclassing.

use crate::error::{AppResult, VrError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name, resolved against the current directory.
pub const CONFIG_FILE_NAME: &str = "mesovr.toml";

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "MESOVR_";

// Runtime defaults.
const DEFAULT_MINIMUM_CPU_CORES: usize = 12;
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_HEARTBEAT_GRACE: Duration = Duration::from_millis(500);
const DEFAULT_CUE_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_CUE_REQUEST_RETRIES: u32 = 3;
const DEFAULT_STARTUP_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAXIMUM_UNCONSUMED_REWARDS: u32 = 1;
const DEFAULT_REWARD_VOLUME_UL: f64 = 5.0;

// Preprocessing defaults.
const DEFAULT_STACK_BATCH_SIZE: usize = 250;
const DEFAULT_WORKER_THREADS: usize = 8;
const DEFAULT_TRANSFER_THREADS: usize = 10;

// Hardware defaults.
const DEFAULT_BAUD_RATE: u32 = 115_200;
const DEFAULT_LICK_THRESHOLD_ADC: u16 = 200;
const DEFAULT_CM_PER_PULSE: f64 = 0.005;
const DEFAULT_TORQUE_PER_ADC_UNIT: f64 = 0.012;

fn default_serial_port() -> String {
    "/dev/ttyACM0".to_string()
}
fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_valve_calibration() -> Vec<(f64, f64)> {
    vec![(15_000.0, 1.8556), (30_000.0, 3.4844)]
}
fn default_lick_threshold() -> u16 {
    DEFAULT_LICK_THRESHOLD_ADC
}
fn default_cm_per_pulse() -> f64 {
    DEFAULT_CM_PER_PULSE
}
fn default_torque_per_adc_unit() -> f64 {
    DEFAULT_TORQUE_PER_ADC_UNIT
}

/// Top-level acquisition-system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfiguration {
    /// Filesystem layout of the acquisition machines and storage hosts.
    pub paths: SystemPaths,
    /// Runtime state-machine settings.
    #[serde(default)]
    pub runtime: RuntimeSettings,
    /// Preprocessing and transfer settings.
    #[serde(default)]
    pub preprocessing: PreprocessingSettings,
    /// Attached hardware parameters.
    #[serde(default)]
    pub hardware: HardwareSettings,
}

/// Static parameters of the attached acquisition hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSettings {
    /// Serial port of the microcontroller bus.
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    /// Baud rate of the microcontroller bus.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Valve calibration curve as `(open_duration_us, volume_ul)` pairs.
    #[serde(default = "default_valve_calibration")]
    pub valve_calibration: Vec<(f64, f64)>,
    /// Lick-detection ADC threshold.
    #[serde(default = "default_lick_threshold")]
    pub lick_threshold_adc: u16,
    /// Wheel circumference traveled per encoder pulse, in centimeters.
    #[serde(default = "default_cm_per_pulse")]
    pub cm_per_pulse: f64,
    /// Torque conversion factor per ADC unit.
    #[serde(default = "default_torque_per_adc_unit")]
    pub torque_per_adc_unit: f64,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        Self {
            serial_port: default_serial_port(),
            baud_rate: DEFAULT_BAUD_RATE,
            valve_calibration: default_valve_calibration(),
            lick_threshold_adc: DEFAULT_LICK_THRESHOLD_ADC,
            cm_per_pulse: DEFAULT_CM_PER_PULSE,
            torque_per_adc_unit: DEFAULT_TORQUE_PER_ADC_UNIT,
        }
    }
}

impl HardwareSettings {
    /// Builds the validated calibration curve from the configured pairs.
    pub fn calibration(&self) -> AppResult<ValveCalibration> {
        ValveCalibration::new(self.valve_calibration.clone())
    }
}

/// Filesystem roots for every machine participating in acquisition.
///
/// Remote hosts (the imaging PC, the NAS and the compute server) are mounted
/// into the acquisition host's filesystem; mount configuration itself is
/// outside this system's scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPaths {
    /// Root of the acquisition host's session storage
    /// (`root/project/animal/session`).
    pub root_directory: PathBuf,
    /// Mounted root of the imaging-device host's data directory.
    pub mesoscope_directory: PathBuf,
    /// Mounted root of the NAS long-term store.
    pub nas_directory: PathBuf,
    /// Mounted root of the compute-server long-term store.
    pub server_directory: PathBuf,
}

/// Runtime state-machine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Minimum logical core count required to start a runtime.
    #[serde(default = "default_minimum_cpu_cores")]
    pub minimum_cpu_cores: usize,
    /// Maximum expected interval between imaging frame pulses.
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    /// Additional settle time granted after a recovery trigger before the
    /// heartbeat fault escalates to the operator.
    #[serde(with = "humantime_serde", default = "default_heartbeat_grace")]
    pub heartbeat_grace: Duration,
    /// Timeout for a single cue-sequence request to the task renderer.
    #[serde(with = "humantime_serde", default = "default_cue_request_timeout")]
    pub cue_request_timeout: Duration,
    /// Automatic cue-sequence request retries before the operator is asked.
    #[serde(default = "default_cue_request_retries")]
    pub cue_request_retries: u32,
    /// Timeout for blocking confirmation waits during `start()`.
    #[serde(with = "humantime_serde", default = "default_confirmation_timeout")]
    pub startup_confirmation_timeout: Duration,
    /// Ceiling on rewards delivered but not yet licked away before reward
    /// delivery degrades to an audible-only cue. Zero disables the ceiling.
    #[serde(default = "default_maximum_unconsumed_rewards")]
    pub maximum_unconsumed_rewards: u32,
    /// Water volume dispensed per reward, in microliters.
    #[serde(default = "default_reward_volume")]
    pub reward_volume_ul: f64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            minimum_cpu_cores: DEFAULT_MINIMUM_CPU_CORES,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_grace: DEFAULT_HEARTBEAT_GRACE,
            cue_request_timeout: DEFAULT_CUE_REQUEST_TIMEOUT,
            cue_request_retries: DEFAULT_CUE_REQUEST_RETRIES,
            startup_confirmation_timeout: DEFAULT_STARTUP_CONFIRMATION_TIMEOUT,
            maximum_unconsumed_rewards: DEFAULT_MAXIMUM_UNCONSUMED_REWARDS,
            reward_volume_ul: DEFAULT_REWARD_VOLUME_UL,
        }
    }
}

/// Preprocessing, compression and transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingSettings {
    /// Pages decoded per batch while recompressing a single stack.
    #[serde(default = "default_stack_batch_size")]
    pub stack_batch_size: usize,
    /// Worker threads for stack recompression and checksum computation.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Worker threads per transfer destination.
    #[serde(default = "default_transfer_threads")]
    pub transfer_threads: usize,
    /// Re-decode and byte-compare every recompressed frame before the source
    /// stack becomes eligible for deletion. Roughly doubles peak memory.
    #[serde(default = "default_true")]
    pub verify_compression: bool,
    /// Re-hash transferred trees on the destination and compare digests.
    #[serde(default = "default_true")]
    pub verify_transfer: bool,
    /// Push to all long-term destinations concurrently.
    #[serde(default = "default_true")]
    pub parallel_destinations: bool,
}

impl Default for PreprocessingSettings {
    fn default() -> Self {
        Self {
            stack_batch_size: DEFAULT_STACK_BATCH_SIZE,
            worker_threads: DEFAULT_WORKER_THREADS,
            transfer_threads: DEFAULT_TRANSFER_THREADS,
            verify_compression: true,
            verify_transfer: true,
            parallel_destinations: true,
        }
    }
}

fn default_minimum_cpu_cores() -> usize {
    DEFAULT_MINIMUM_CPU_CORES
}
fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}
fn default_heartbeat_grace() -> Duration {
    DEFAULT_HEARTBEAT_GRACE
}
fn default_cue_request_timeout() -> Duration {
    DEFAULT_CUE_REQUEST_TIMEOUT
}
fn default_cue_request_retries() -> u32 {
    DEFAULT_CUE_REQUEST_RETRIES
}
fn default_confirmation_timeout() -> Duration {
    DEFAULT_STARTUP_CONFIRMATION_TIMEOUT
}
fn default_maximum_unconsumed_rewards() -> u32 {
    DEFAULT_MAXIMUM_UNCONSUMED_REWARDS
}
fn default_reward_volume() -> f64 {
    DEFAULT_REWARD_VOLUME_UL
}
fn default_stack_batch_size() -> usize {
    DEFAULT_STACK_BATCH_SIZE
}
fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}
fn default_transfer_threads() -> usize {
    DEFAULT_TRANSFER_THREADS
}
fn default_true() -> bool {
    true
}

impl SystemConfiguration {
    /// Loads configuration from `mesovr.toml` plus `MESOVR_` environment
    /// overrides and validates it.
    pub fn load() -> AppResult<Self> {
        Self::load_from(Path::new(CONFIG_FILE_NAME))
    }

    /// Loads configuration from an explicit file path plus environment
    /// overrides and validates it.
    pub fn load_from(path: &Path) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates semantic constraints that pass parsing but are logically
    /// incorrect.
    pub fn validate(&self) -> AppResult<()> {
        if self.runtime.minimum_cpu_cores == 0 {
            return Err(VrError::Configuration(
                "runtime.minimum_cpu_cores must be at least 1".into(),
            ));
        }
        if self.runtime.heartbeat_interval.is_zero() {
            return Err(VrError::Configuration(
                "runtime.heartbeat_interval must be non-zero".into(),
            ));
        }
        if self.preprocessing.stack_batch_size == 0 {
            return Err(VrError::Configuration(
                "preprocessing.stack_batch_size must be at least 1".into(),
            ));
        }
        if self.preprocessing.worker_threads == 0 || self.preprocessing.transfer_threads == 0 {
            return Err(VrError::Configuration(
                "preprocessing worker/transfer thread counts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Session kinds and per-kind runtime configuration
// =============================================================================

/// The kind of acquisition session a runtime executes.
///
/// One parametrized state-machine type serves all kinds; kind-specific
/// behavior is selected by data keyed on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    LickTraining,
    RunTraining,
    Experiment,
    WindowChecking,
}

impl SessionKind {
    /// Stable name used in session records and persistent descriptor files.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::LickTraining => "lick_training",
            SessionKind::RunTraining => "run_training",
            SessionKind::Experiment => "experiment",
            SessionKind::WindowChecking => "window_checking",
        }
    }

    /// Whether this session kind drives the external task renderer.
    pub fn uses_renderer(&self) -> bool {
        matches!(self, SessionKind::Experiment)
    }

    /// Whether this session kind triggers and monitors the imaging device.
    pub fn uses_imaging(&self) -> bool {
        matches!(self, SessionKind::Experiment | SessionKind::WindowChecking)
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of an experiment's state sequence.
///
/// During an experiment the driver walks an ordered list of these triples,
/// holding each for its wall-clock duration before advancing. The stage code
/// carries no predefined meaning; each project defines its own mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    /// Free-form experiment stage code logged with header 2.
    pub stage_code: u8,
    /// Mesoscope-VR system state to hold (1 = rest, 2 = run).
    pub system_state_code: u8,
    /// Wall-clock time to hold this combination, excluding pauses.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// A known per-cue-combination trial template.
///
/// The renderer reports a flat cue sequence; trial boundaries are recovered
/// by greedy longest-match against these templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialTemplate {
    /// The exact cue codes making up one trial, in track order.
    pub cues: Vec<u8>,
    /// Track length of the trial in centimeters.
    pub length_cm: f64,
}

/// Static description of one experiment session runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfiguration {
    /// Maps each wall-cue code to its track length in centimeters.
    pub cue_map: std::collections::BTreeMap<u8, f64>,
    /// Known trial templates for cue-sequence decomposition.
    pub trial_templates: Vec<TrialTemplate>,
    /// Ordered state sequence consumed strictly start to end.
    pub experiment_states: Vec<ExperimentState>,
}

impl ExperimentConfiguration {
    /// Validates the experiment description.
    pub fn validate(&self) -> AppResult<()> {
        if self.experiment_states.is_empty() {
            return Err(VrError::Configuration(
                "experiment_states must contain at least one entry".into(),
            ));
        }
        for state in &self.experiment_states {
            if !(1..=2).contains(&state.system_state_code) {
                return Err(VrError::Configuration(format!(
                    "experiment state {} references unsupported system state code {}",
                    state.stage_code, state.system_state_code
                )));
            }
        }
        if self.trial_templates.iter().any(|t| t.cues.is_empty()) {
            return Err(VrError::Configuration(
                "trial templates must not be empty cue sequences".into(),
            ));
        }
        Ok(())
    }
}

/// Lick-training session parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LickTrainingConfig {
    /// Minimum delay between two reward deliveries.
    #[serde(with = "humantime_serde")]
    pub minimum_reward_delay: Duration,
    /// Maximum delay between two reward deliveries.
    #[serde(with = "humantime_serde")]
    pub maximum_reward_delay: Duration,
    /// Total session duration.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Hard ceiling on water dispensed during the session, in milliliters.
    pub water_ceiling_ml: f64,
}

impl Default for LickTrainingConfig {
    fn default() -> Self {
        Self {
            minimum_reward_delay: Duration::from_secs(6),
            maximum_reward_delay: Duration::from_secs(18),
            duration: Duration::from_secs(20 * 60),
            water_ceiling_ml: 1.0,
        }
    }
}

/// Run-training session parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTrainingConfig {
    /// Speed the animal must maintain to earn a reward, in cm/s.
    pub initial_speed_threshold_cm_s: f64,
    /// Time the speed must be held above threshold.
    #[serde(with = "humantime_serde")]
    pub initial_duration_threshold: Duration,
    /// Speed adjustment applied per operator modifier step, in cm/s.
    pub speed_step_cm_s: f64,
    /// Duration adjustment applied per operator modifier step.
    #[serde(with = "humantime_serde")]
    pub duration_step: Duration,
    /// Total session duration.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Hard ceiling on water dispensed during the session, in milliliters.
    pub water_ceiling_ml: f64,
}

impl Default for RunTrainingConfig {
    fn default() -> Self {
        Self {
            initial_speed_threshold_cm_s: 4.0,
            initial_duration_threshold: Duration::from_millis(500),
            speed_step_cm_s: 0.05,
            duration_step: Duration::from_millis(50),
            duration: Duration::from_secs(40 * 60),
            water_ceiling_ml: 1.0,
        }
    }
}

// =============================================================================
// Valve calibration
// =============================================================================

/// An ordered valve calibration curve of
/// `(open_duration_us, dispensed_volume_ul)` pairs.
///
/// The curve is immutable per session and persisted in the hardware snapshot
/// for reproducibility. Volume-to-duration inversion uses piecewise-linear
/// interpolation between neighboring calibration points, extrapolating along
/// the boundary segments outside the calibrated range, which preserves
/// monotonicity in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveCalibration {
    pairs: Vec<(f64, f64)>,
}

impl ValveCalibration {
    /// Builds a calibration curve, validating strict monotonicity in both
    /// axes.
    pub fn new(pairs: Vec<(f64, f64)>) -> AppResult<Self> {
        if pairs.len() < 2 {
            return Err(VrError::Configuration(
                "valve calibration requires at least two points".into(),
            ));
        }
        for window in pairs.windows(2) {
            let (d0, v0) = window[0];
            let (d1, v1) = window[1];
            if d1 <= d0 || v1 <= v0 {
                return Err(VrError::Configuration(format!(
                    "valve calibration must be strictly increasing in both axes; \
                     ({d0} us, {v0} ul) is followed by ({d1} us, {v1} ul)"
                )));
            }
        }
        Ok(Self { pairs })
    }

    /// The calibration points, ordered by open duration.
    pub fn pairs(&self) -> &[(f64, f64)] {
        &self.pairs
    }

    /// Inverts the curve: open duration in microseconds needed to dispense
    /// the requested volume in microliters.
    pub fn duration_for_volume(&self, volume_ul: f64) -> f64 {
        // Select the segment containing the volume, or the nearest boundary
        // segment for out-of-range requests.
        let segment = self
            .pairs
            .windows(2)
            .find(|w| volume_ul <= w[1].1)
            .unwrap_or_else(|| &self.pairs[self.pairs.len() - 2..]);
        let (d0, v0) = segment[0];
        let (d1, v1) = segment[1];
        let fraction = (volume_ul - v0) / (v1 - v0);
        d0 + fraction * (d1 - d0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_calibration() -> ValveCalibration {
        ValveCalibration::new(vec![(15_000.0, 1.8556), (30_000.0, 3.4844)])
            .expect("valid calibration")
    }

    #[test]
    fn test_defaults_pass_validation() {
        let config = SystemConfiguration {
            paths: SystemPaths {
                root_directory: PathBuf::from("/data"),
                mesoscope_directory: PathBuf::from("/mnt/meso"),
                nas_directory: PathBuf::from("/mnt/nas"),
                server_directory: PathBuf::from("/mnt/server"),
            },
            runtime: RuntimeSettings::default(),
            preprocessing: PreprocessingSettings::default(),
            hardware: HardwareSettings::default(),
        };
        config.validate().expect("default settings are valid");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = SystemConfiguration {
            paths: SystemPaths {
                root_directory: PathBuf::from("/data"),
                mesoscope_directory: PathBuf::from("/mnt/meso"),
                nas_directory: PathBuf::from("/mnt/nas"),
                server_directory: PathBuf::from("/mnt/server"),
            },
            runtime: RuntimeSettings::default(),
            preprocessing: PreprocessingSettings::default(),
            hardware: HardwareSettings::default(),
        };
        config.preprocessing.stack_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_calibration_interpolates_within_bounds() {
        let calibration = reference_calibration();
        let duration = calibration.duration_for_volume(2.5);
        assert!(duration > 15_000.0 && duration < 30_000.0);
    }

    #[test]
    fn test_calibration_is_monotonic_in_volume() {
        let calibration = reference_calibration();
        let mut previous = f64::NEG_INFINITY;
        for step in 0..40 {
            let volume = 1.0 + step as f64 * 0.1;
            let duration = calibration.duration_for_volume(volume);
            assert!(duration > previous, "duration must grow with volume");
            previous = duration;
        }
    }

    #[test]
    fn test_calibration_rejects_non_monotonic_points() {
        let result = ValveCalibration::new(vec![(15_000.0, 2.0), (30_000.0, 1.5)]);
        assert!(result.is_err());
        let result = ValveCalibration::new(vec![(30_000.0, 1.0), (15_000.0, 2.0)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_session_kind_round_trip() {
        assert_eq!(SessionKind::LickTraining.as_str(), "lick_training");
        assert!(SessionKind::Experiment.uses_renderer());
        assert!(!SessionKind::RunTraining.uses_renderer());
        assert!(SessionKind::WindowChecking.uses_imaging());
    }
}
