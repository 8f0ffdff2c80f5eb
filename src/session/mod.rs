//! Session identity, directory-tree data model and persisted artifacts.
//!
//! A session is the unit of acquisition, identified by
//! `(project, animal, UTC-microsecond timestamp)`. Its directory tree is
//! materialized on every participating machine at runtime start and has
//! exactly two top-level subtrees: `raw_data` for acquired and
//! non-destructively transformed data, and `processed_data` for derived
//! outputs. The two are never mixed.
//!
//! The module also owns the marker-file constants of the staged-deletion
//! protocol: `ubiquitin.bin` on the imaging host and `telomere.bin` on the
//! compute-storage host. A marker is only ever written after checksum
//! verification succeeds, and deletion scans only remove directories whose
//! remote counterpart marker exists.

pub mod artifacts;

use crate::config::{SessionKind, SystemPaths};
use crate::error::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Imaging-host marker: the session's device-side copy was verified on the
/// acquisition host and is safe to delete locally.
pub const UBIQUITIN_MARKER: &str = "ubiquitin.bin";

/// Compute-storage marker: the session's raw data passed checksum
/// verification on the server and the acquisition-host copy is safe to
/// delete.
pub const TELOMERE_MARKER: &str = "telomere.bin";

/// Empty sentinel written when a session completed without interruption.
pub const COMPLETION_MARKER: &str = "session.bin";

/// Shared staging directory on the imaging host into which the device saves
/// every session's output before preprocessing renames it.
pub const MESOSCOPE_STAGING_DIRECTORY: &str = "mesoscope_data";

/// Reference motion-estimator file persisted per animal on the imaging host.
pub const MOTION_ESTIMATOR_FILE: &str = "MotionEstimator.me";

/// Z-stack companion file expected next to the motion estimator.
pub const ZSTACK_FILE: &str = "zstack.mat";

const SESSION_NAME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S-%6f";

/// Formats a session name from a UTC timestamp.
///
/// Names embed a zero-padded microsecond timestamp, so lexicographic order
/// equals acquisition order; `root/project/animal/session` is unique and
/// never reused.
pub fn session_name_from(timestamp: DateTime<Utc>) -> String {
    timestamp.format(SESSION_NAME_FORMAT).to_string()
}

/// The identity of one acquisition session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Project the animal belongs to.
    pub project: String,
    /// Animal identifier within the project.
    pub animal: String,
    /// Timestamp-derived session name.
    pub name: String,
}

impl Session {
    /// Creates a new session identity stamped with the current UTC time.
    pub fn create(project: &str, animal: &str) -> Self {
        Self {
            project: project.to_string(),
            animal: animal.to_string(),
            name: session_name_from(Utc::now()),
        }
    }

    /// Rebuilds a session identity from an existing session directory path
    /// (`.../project/animal/session`).
    pub fn from_path(session_path: &Path) -> Option<Self> {
        let name = session_path.file_name()?.to_str()?.to_string();
        let animal = session_path.parent()?.file_name()?.to_str()?.to_string();
        let project = session_path
            .parent()?
            .parent()?
            .file_name()?
            .to_str()?
            .to_string();
        Some(Self {
            project,
            animal,
            name,
        })
    }

    /// `project/animal/session` relative path of this session.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.project)
            .join(&self.animal)
            .join(&self.name)
    }
}

/// Acquisition-host filesystem layout of one session.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    /// `root/project/animal/session`.
    pub session_root: PathBuf,
    /// Acquired and non-destructively transformed data.
    pub raw_data: PathBuf,
    /// Derived, not-necessarily-reversible outputs.
    pub processed_data: PathBuf,
    /// Per-event binary runtime log entries, later compacted.
    pub behavior_log: PathBuf,
    /// Behavior camera output.
    pub camera_frames: PathBuf,
    /// Recompressed imaging stacks plus motion-estimator companions.
    pub mesoscope_frames: PathBuf,
    /// Project/animal persistent cache reused across sessions.
    pub persistent_data: PathBuf,
}

impl SessionPaths {
    /// Resolves the session layout against the acquisition-host root.
    pub fn resolve(root: &Path, session: &Session) -> Self {
        let session_root = root.join(session.relative_path());
        let raw_data = session_root.join("raw_data");
        Self {
            behavior_log: raw_data.join("behavior_log"),
            camera_frames: raw_data.join("camera_frames"),
            mesoscope_frames: raw_data.join("mesoscope_frames"),
            processed_data: session_root.join("processed_data"),
            persistent_data: root
                .join(&session.project)
                .join(&session.animal)
                .join("persistent_data"),
            raw_data,
            session_root,
        }
    }

    /// Creates the full directory tree on disk.
    pub fn materialize(&self) -> AppResult<()> {
        for directory in [
            &self.raw_data,
            &self.processed_data,
            &self.behavior_log,
            &self.camera_frames,
            &self.mesoscope_frames,
            &self.persistent_data,
        ] {
            fs::create_dir_all(directory)?;
        }
        Ok(())
    }

    /// Path of the session identity/routing record.
    pub fn session_record(&self) -> PathBuf {
        self.raw_data.join("session_data.yaml")
    }

    /// Path of the session-type-specific descriptor.
    pub fn session_descriptor(&self) -> PathBuf {
        self.raw_data.join("session_descriptor.yaml")
    }

    /// Path of the runtime hardware-parameter snapshot.
    pub fn hardware_snapshot(&self) -> PathBuf {
        self.raw_data.join("hardware_configuration.yaml")
    }

    /// Path of the motor-position snapshot.
    pub fn motor_positions(&self) -> PathBuf {
        self.raw_data.join("motor_positions.yaml")
    }

    /// Path of the imaging-device objective-position snapshot.
    pub fn objective_positions(&self) -> PathBuf {
        self.raw_data.join("objective_positions.yaml")
    }

    /// Path of the frame-invariant acquisition metadata descriptor.
    pub fn frame_invariant_metadata(&self) -> PathBuf {
        self.mesoscope_frames.join("frame_invariant_metadata.yaml")
    }

    /// Path of the companion file in the cell-segmentation tool's schema.
    pub fn ops_file(&self) -> PathBuf {
        self.mesoscope_frames.join("ops.json")
    }

    /// Path of the completion marker.
    pub fn completion_marker(&self) -> PathBuf {
        self.raw_data.join(COMPLETION_MARKER)
    }

    /// Path of the previous session's motor snapshot in the persistent cache.
    pub fn previous_motor_positions(&self) -> PathBuf {
        self.persistent_data.join("motor_positions.yaml")
    }

    /// Path of the previous session's descriptor in the persistent cache.
    pub fn previous_descriptor(&self, kind: SessionKind) -> PathBuf {
        self.persistent_data
            .join(format!("{}_session_descriptor.yaml", kind.as_str()))
    }
}

/// Imaging-host (mesoscope PC) filesystem layout of one session.
#[derive(Debug, Clone)]
pub struct MesoscopeHostPaths {
    /// Shared staging directory the device writes into during acquisition.
    pub staging: PathBuf,
    /// Session-named directory the staging data is renamed to during
    /// preprocessing.
    pub session_directory: PathBuf,
    /// `ubiquitin.bin` inside the session-named directory.
    pub ubiquitin_marker: PathBuf,
    /// Per-animal persistent directory on the imaging host.
    pub persistent_data: PathBuf,
    /// Reference motion estimator persisted from the first session.
    pub reference_motion_estimator: PathBuf,
}

impl MesoscopeHostPaths {
    /// Resolves the imaging-host layout against its mounted root.
    pub fn resolve(mesoscope_root: &Path, session: &Session) -> Self {
        let session_directory = mesoscope_root.join(&session.name);
        let persistent_data = mesoscope_root
            .join(&session.project)
            .join(&session.animal)
            .join("persistent_data");
        Self {
            staging: mesoscope_root.join(MESOSCOPE_STAGING_DIRECTORY),
            ubiquitin_marker: session_directory.join(UBIQUITIN_MARKER),
            reference_motion_estimator: persistent_data.join(MOTION_ESTIMATOR_FILE),
            session_directory,
            persistent_data,
        }
    }
}

/// Long-term storage destinations of one session.
#[derive(Debug, Clone)]
pub struct DestinationPaths {
    /// `raw_data` on the NAS.
    pub nas_raw_data: PathBuf,
    /// `raw_data` on the compute server.
    pub server_raw_data: PathBuf,
    /// `telomere.bin` on the compute server.
    pub telomere_marker: PathBuf,
}

impl DestinationPaths {
    /// Resolves both long-term destinations for a session.
    pub fn resolve(paths: &SystemPaths, session: &Session) -> Self {
        let relative = session.relative_path().join("raw_data");
        let server_raw_data = paths.server_directory.join(&relative);
        Self {
            nas_raw_data: paths.nas_directory.join(&relative),
            telomere_marker: server_raw_data.join(TELOMERE_MARKER),
            server_raw_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_names_sort_by_acquisition_time() {
        let early = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 11, 20, 9, 30, 0).unwrap();
        assert!(session_name_from(early) < session_name_from(late));

        // Microsecond resolution also sorts.
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let a = session_name_from(base + chrono::Duration::microseconds(1));
        let b = session_name_from(base + chrono::Duration::microseconds(2));
        assert!(a < b);
    }

    #[test]
    fn test_session_round_trips_through_path() {
        let session = Session {
            project: "tyche".into(),
            animal: "a7".into(),
            name: "2024-03-01-09-30-00-000001".into(),
        };
        let root = PathBuf::from("/data");
        let path = root.join(session.relative_path());
        assert_eq!(Session::from_path(&path), Some(session));
    }

    #[test]
    fn test_raw_and_processed_subtrees_are_disjoint() {
        let session = Session::create("tyche", "a7");
        let paths = SessionPaths::resolve(Path::new("/data"), &session);
        assert!(paths.raw_data.starts_with(&paths.session_root));
        assert!(paths.processed_data.starts_with(&paths.session_root));
        assert!(!paths.processed_data.starts_with(&paths.raw_data));
        assert!(paths.behavior_log.starts_with(&paths.raw_data));
    }

    #[test]
    fn test_destination_layout_mirrors_session_tree() {
        let session = Session {
            project: "tyche".into(),
            animal: "a7".into(),
            name: "2024-03-01-09-30-00-000001".into(),
        };
        let system = SystemPaths {
            root_directory: PathBuf::from("/data"),
            mesoscope_directory: PathBuf::from("/mnt/meso"),
            nas_directory: PathBuf::from("/mnt/nas"),
            server_directory: PathBuf::from("/mnt/server"),
        };
        let destinations = DestinationPaths::resolve(&system, &session);
        assert_eq!(
            destinations.server_raw_data,
            PathBuf::from("/mnt/server/tyche/a7/2024-03-01-09-30-00-000001/raw_data")
        );
        assert_eq!(
            destinations.telomere_marker,
            destinations.server_raw_data.join(TELOMERE_MARKER)
        );
    }
}
