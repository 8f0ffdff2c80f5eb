//! Persisted session artifacts.
//!
//! Every artifact is a small, human-readable structured-text file written
//! into the session's `raw_data` subtree (or the persistent cache). The
//! hardware snapshot doubles as the downstream parsing contract: a field
//! recorded as absent means "do not parse this module's log".

use crate::clock::MonotonicClock;
use crate::config::{SessionKind, ValveCalibration};
use crate::error::{AppResult, VrError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Saves a serializable artifact as YAML, creating parent directories.
pub fn save_yaml<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_yaml::to_string(value)?;
    fs::write(path, text)?;
    Ok(())
}

/// Loads a YAML artifact from disk.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> AppResult<T> {
    if !path.exists() {
        return Err(VrError::MissingArtifact(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Session identity and routing record (`session_data.yaml`).
///
/// Written at runtime start and finalized at runtime end; restoring this
/// record from a session path is how the preprocessing-retry entry point
/// rediscovers what it is working on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Project the session belongs to.
    pub project: String,
    /// Animal the session belongs to.
    pub animal: String,
    /// Timestamp-derived session name.
    pub session: String,
    /// Kind of runtime that produced this session.
    pub session_type: SessionKind,
    /// Experimenter running the session.
    pub experimenter: String,
    /// UTC time at which the runtime started.
    pub started_utc: DateTime<Utc>,
    /// Hostname of the acquisition machine.
    pub acquisition_host: String,
    /// Set when the runtime terminated early; incomplete sessions are
    /// excluded from automated downstream processing by convention.
    pub interrupted: bool,
}

impl SessionRecord {
    /// Creates a record for a session starting now on this machine.
    pub fn new(
        project: &str,
        animal: &str,
        session: &str,
        session_type: SessionKind,
        experimenter: &str,
    ) -> Self {
        let acquisition_host = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            project: project.to_string(),
            animal: animal.to_string(),
            session: session.to_string(),
            session_type,
            experimenter: experimenter.to_string(),
            started_utc: Utc::now(),
            acquisition_host,
            interrupted: false,
        }
    }
}

/// Session-type-specific descriptor (`session_descriptor.yaml`).
///
/// Machine-written during the runtime; the `experimenter_notes` field is
/// annotated manually afterwards. Training descriptors are also cached into
/// the persistent directory so the next session of the same animal restores
/// its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Kind of runtime this descriptor describes.
    pub session_type: SessionKind,
    /// Water dispensed through the valve during the runtime, in milliliters.
    pub dispensed_water_ml: f64,
    /// Reward volume configured for the runtime, in microliters.
    pub reward_volume_ul: f64,
    /// Ceiling on rewards delivered but not yet consumed (0 disables).
    pub maximum_unconsumed_rewards: u32,
    /// Final running-speed threshold, cm/s (run training only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_speed_threshold_cm_s: Option<f64>,
    /// Final above-threshold duration requirement, seconds (run training
    /// only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub final_duration_threshold_s: Option<f64>,
    /// Total active runtime excluding pauses, in seconds.
    pub active_runtime_s: f64,
    /// Total time spent paused, in seconds.
    pub paused_s: f64,
    /// Cumulative distance traveled by the animal, in centimeters.
    pub traveled_distance_cm: f64,
    /// Set when the runtime terminated early.
    pub incomplete: bool,
    /// Free-form notes the experimenter fills in after the session.
    pub experimenter_notes: String,
}

impl SessionDescriptor {
    /// Creates an empty descriptor for a runtime that is about to start.
    pub fn new(session_type: SessionKind, reward_volume_ul: f64, unconsumed_cap: u32) -> Self {
        Self {
            session_type,
            dispensed_water_ml: 0.0,
            reward_volume_ul,
            maximum_unconsumed_rewards: unconsumed_cap,
            final_speed_threshold_cm_s: None,
            final_duration_threshold_s: None,
            active_runtime_s: 0.0,
            paused_s: 0.0,
            traveled_distance_cm: 0.0,
            incomplete: false,
            experimenter_notes: String::new(),
        }
    }
}

/// Runtime hardware-parameter snapshot (`hardware_configuration.yaml`).
///
/// All fields are optional. Downstream log parsing reads this file to decide
/// which module logs to parse: a `None` field disables parsing of the
/// corresponding module's log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    /// Wall-cue code to centimeter length map (experiment runtimes).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cue_map: Option<BTreeMap<u8, f64>>,
    /// Wheel circumference traveled per encoder pulse.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cm_per_pulse: Option<f64>,
    /// Valve calibration curve active during the session.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub valve_calibration: Option<ValveCalibration>,
    /// Lick-detection ADC threshold.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lick_threshold: Option<u16>,
    /// Torque conversion factor per ADC unit.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub torque_per_adc_unit: Option<f64>,
    /// Whether the VR screens started the session powered on.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub screens_initially_on: Option<bool>,
    /// Whether the imaging frame TTL line was monitored.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub frame_ttl_monitored: Option<bool>,
}

/// Motor-position snapshot (`motor_positions.yaml`).
///
/// Captured at runtime end and persisted so the next session restores the
/// same headbar and lickport geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorPositions {
    pub headbar_z: i32,
    pub headbar_pitch: i32,
    pub headbar_roll: i32,
    pub lickport_z: i32,
    pub lickport_x: i32,
    pub lickport_y: i32,
}

/// Imaging-device objective-position snapshot (`objective_positions.yaml`).
///
/// Recorded to help the operator manually restore the objective between
/// sessions of the same animal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectivePositions {
    pub x_um: f64,
    pub y_um: f64,
    pub z_um: f64,
    pub roll_deg: f64,
}

/// Integrity-verification status record appended to the acquisition-system
/// metadata log at the end of preprocessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    /// Session the record describes.
    pub session: String,
    /// Hex digest of the session's raw data tree.
    pub checksum: String,
    /// Whether the server-side copy re-hashed to the same digest.
    pub server_verified: bool,
    /// UTC microsecond timestamp at which verification finished.
    pub verified_at_us: i64,
}

impl IntegrityRecord {
    /// Creates a record stamped with the shared runtime clock.
    pub fn new(session: &str, checksum: &str, server_verified: bool, clock: &MonotonicClock) -> Self {
        Self {
            session: session.to_string(),
            checksum: checksum.to_string(),
            server_verified,
            verified_at_us: clock.onset_us() + clock.elapsed_us() as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_record_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("session_data.yaml");
        let record = SessionRecord::new("tyche", "a7", "2024-03-01-09-30-00-000001",
            SessionKind::Experiment, "kat");
        save_yaml(&path, &record).expect("save");
        let loaded: SessionRecord = load_yaml(&path).expect("load");
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_missing_artifact_is_reported_as_such() {
        let dir = TempDir::new().expect("temp dir");
        let result: AppResult<SessionRecord> = load_yaml(&dir.path().join("absent.yaml"));
        assert!(matches!(result, Err(VrError::MissingArtifact(_))));
    }

    #[test]
    fn test_hardware_snapshot_omits_absent_modules() {
        let snapshot = HardwareSnapshot {
            cm_per_pulse: Some(0.005),
            ..HardwareSnapshot::default()
        };
        let text = serde_yaml::to_string(&snapshot).expect("serialize");
        // Absent modules must not appear at all: their absence is the
        // "do not parse this log" flag for downstream processing.
        assert!(text.contains("cm_per_pulse"));
        assert!(!text.contains("lick_threshold"));
        assert!(!text.contains("valve_calibration"));
    }

    #[test]
    fn test_descriptor_defaults_are_not_interrupted() {
        let descriptor = SessionDescriptor::new(SessionKind::LickTraining, 5.0, 1);
        assert!(!descriptor.incomplete);
        assert_eq!(descriptor.dispensed_water_ml, 0.0);
    }
}
