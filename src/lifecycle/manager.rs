//! The data lifecycle manager.
//!
//! Sequences end-of-session work deterministically and idempotently: a crash
//! at any point is recovered by re-invoking [`preprocess_session`] on the
//! same session path. Every stage detects prior completion from its output
//! artifacts — there is no separate progress log to corrupt.
//!
//! The purge operation is deliberately separate and never runs automatically
//! on success: marking data as deletable (after checksum verification) and
//! actually deleting it are two phases on two machines, which keeps
//! storage-pressure relief strictly safer than the transfer step itself.

use crate::clock::MonotonicClock;
use crate::config::SystemConfiguration;
use crate::error::{AppResult, VrError};
use crate::lifecycle::checksum;
use crate::lifecycle::logs::compact_log_directory;
use crate::lifecycle::stacks::{
    extract_acquisition_metadata, recompress_directory, StackSettings,
};
use crate::lifecycle::transfer::{push_to_destinations, transfer_directory, TransferOptions};
use crate::session::artifacts::{
    load_yaml, save_yaml, IntegrityRecord, SessionDescriptor, SessionRecord,
};
use crate::session::{
    DestinationPaths, MesoscopeHostPaths, Session, SessionPaths, MOTION_ESTIMATOR_FILE,
    UBIQUITIN_MARKER, ZSTACK_FILE,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Machine-readable log of finished sessions at the storage root.
pub const METADATA_LOG_NAME: &str = "metadata_log.jsonl";

/// Everything the pipeline needs to know about one session.
pub struct LifecycleContext {
    pub record: SessionRecord,
    pub session: Session,
    pub paths: SessionPaths,
    pub mesoscope: MesoscopeHostPaths,
    pub destinations: DestinationPaths,
}

impl LifecycleContext {
    /// Restores the context from a session directory by re-reading the
    /// session record — the same entry point works for fresh sessions and
    /// preprocessing retries.
    pub fn from_session_path(
        config: &SystemConfiguration,
        session_path: &Path,
    ) -> AppResult<Self> {
        let session = Session::from_path(session_path).ok_or_else(|| {
            VrError::Configuration(format!(
                "{} is not a project/animal/session directory",
                session_path.display()
            ))
        })?;
        let paths = SessionPaths::resolve(&config.paths.root_directory, &session);
        let record: SessionRecord = load_yaml(&paths.session_record())?;
        Ok(Self {
            mesoscope: MesoscopeHostPaths::resolve(&config.paths.mesoscope_directory, &session),
            destinations: DestinationPaths::resolve(&config.paths, &session),
            record,
            session,
            paths,
        })
    }
}

/// Runs the full end-of-session pipeline for one session.
///
/// Pipeline order: pull device-side raw output into the session tree →
/// compact logs → recompress image stacks → ensure snapshot files → push to
/// both long-term destinations with checksum verification → write marker
/// files → update the external metadata log. Safe to re-run after any
/// failure.
pub fn preprocess_session(config: &SystemConfiguration, session_path: &Path) -> AppResult<()> {
    let context = LifecycleContext::from_session_path(config, session_path)?;
    log::info!(
        "Preprocessing session {} ({})",
        context.session.name,
        context.record.session_type
    );

    if context.record.session_type.uses_imaging() {
        pull_imaging_data(config, &context)?;
    }
    compact_logs(&context)?;
    if context.record.session_type.uses_imaging() {
        compress_stacks(config, &context)?;
    }
    ensure_snapshots(&context)?;
    push_session(config, &context)?;
    finalize_session(config, &context)?;
    log::info!("Preprocessing finished for session {}", context.session.name);
    Ok(())
}

/// Stage 1: aggregate the imaging device's output into the session tree.
///
/// Renames the shared staging directory to the session name on the imaging
/// host, checks the motion-estimator companions, transfers everything into
/// the session's `mesoscope_frames` directory with verification, and only
/// then writes the `ubiquitin.bin` marker on the imaging host.
fn pull_imaging_data(config: &SystemConfiguration, context: &LifecycleContext) -> AppResult<()> {
    let local_estimator = context.paths.mesoscope_frames.join(MOTION_ESTIMATOR_FILE);
    if local_estimator.exists() {
        log::info!("Imaging data already pulled; skipping");
        return Ok(());
    }

    let mesoscope = &context.mesoscope;
    if !mesoscope.session_directory.exists() {
        if mesoscope.staging.exists() && fs::read_dir(&mesoscope.staging)?.next().is_some() {
            // Claim the staged device output for this session and reset the
            // staging directory for the next runtime.
            fs::rename(&mesoscope.staging, &mesoscope.session_directory)?;
            fs::create_dir_all(&mesoscope.staging)?;
        } else {
            return Err(VrError::MissingArtifact(mesoscope.session_directory.clone()));
        }
    }

    for required in [MOTION_ESTIMATOR_FILE, ZSTACK_FILE] {
        let path = mesoscope.session_directory.join(required);
        if !path.exists() {
            return Err(VrError::MissingArtifact(path));
        }
    }

    // The first session of an animal persists the reference motion
    // estimator used to image the same cell population later.
    if !mesoscope.reference_motion_estimator.exists() {
        fs::create_dir_all(&mesoscope.persistent_data)?;
        fs::copy(
            mesoscope.session_directory.join(MOTION_ESTIMATOR_FILE),
            &mesoscope.reference_motion_estimator,
        )?;
    }

    let options = TransferOptions {
        num_threads: config.preprocessing.transfer_threads,
        verify_integrity: config.preprocessing.verify_transfer,
    };
    transfer_directory(
        &mesoscope.session_directory,
        &context.paths.mesoscope_frames,
        &options,
    )?;

    // The per-pull digest is recomputed over the whole session tree during
    // the push stage; drop the interim record.
    let _ = fs::remove_file(
        context
            .paths
            .mesoscope_frames
            .join(checksum::CHECKSUM_FILE_NAME),
    );

    if options.verify_integrity {
        // Verified copy on the acquisition host: the imaging-host copy is
        // now safe to delete, which the marker communicates.
        fs::write(&mesoscope.ubiquitin_marker, b"")?;
    }
    Ok(())
}

/// Stage 2: merge per-event log entries into per-source archives.
fn compact_logs(context: &LifecycleContext) -> AppResult<()> {
    if !context.paths.behavior_log.exists() {
        return Ok(());
    }
    compact_log_directory(&context.paths.behavior_log)?;
    Ok(())
}

/// Stage 3: recompress raw stacks and extract acquisition metadata.
fn compress_stacks(config: &SystemConfiguration, context: &LifecycleContext) -> AppResult<()> {
    let frames_dir = &context.paths.mesoscope_frames;
    if !frames_dir.exists() {
        return Ok(());
    }
    let sources: Vec<PathBuf> = fs::read_dir(frames_dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|extension| extension.to_str()),
                Some("tif") | Some("tiff")
            ) && !path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .starts_with("frames_")
        })
        .collect();
    if sources.is_empty() {
        log::info!("No raw stacks to recompress; skipping");
        return Ok(());
    }

    // Stack-invariant metadata comes from any one stack of the session.
    let invariant_path = context.paths.frame_invariant_metadata();
    if !invariant_path.exists() {
        if let Some(first_stack) = sources.iter().find(|path| {
            crate::lifecycle::stacks::probe_stack(path).is_some()
        }) {
            let metadata = extract_acquisition_metadata(first_stack)?;
            save_yaml(&invariant_path, &metadata)?;
            fs::write(
                context.paths.ops_file(),
                serde_json::to_string_pretty(&metadata.to_ops_json())?,
            )?;
        }
    }

    let settings = StackSettings {
        batch_size: config.preprocessing.stack_batch_size,
        workers: config.preprocessing.worker_threads,
        verify: config.preprocessing.verify_compression,
        remove_sources: true,
    };
    let report = recompress_directory(frames_dir, frames_dir, &settings)?;
    log::info!(
        "Recompressed {} stacks ({} frames), skipped {} non-stack files",
        report.recompressed,
        report.frames,
        report.skipped.len()
    );
    Ok(())
}

/// Stage 4: make sure the end-of-session snapshot artifacts exist.
///
/// A runtime that crashed before `stop()` leaves no descriptor; the session
/// is then recorded as incomplete rather than requiring manual surgery.
fn ensure_snapshots(context: &LifecycleContext) -> AppResult<()> {
    let descriptor_path = context.paths.session_descriptor();
    if !descriptor_path.exists() {
        log::warn!(
            "Session descriptor missing; recording session {} as incomplete",
            context.session.name
        );
        let mut descriptor = SessionDescriptor::new(context.record.session_type, 0.0, 0);
        descriptor.incomplete = true;
        save_yaml(&descriptor_path, &descriptor)?;
    }
    Ok(())
}

/// Stage 5: push `raw_data` to both long-term destinations.
///
/// The server copy is checksum-verified and gates the `telomere.bin` marker;
/// the NAS copy is written through the same engine but is not re-verified
/// afterwards (a documented, deliberately weaker guarantee).
fn push_session(config: &SystemConfiguration, context: &LifecycleContext) -> AppResult<()> {
    let source = &context.paths.raw_data;
    checksum::write_checksum(source, config.preprocessing.worker_threads)?;

    let options = TransferOptions {
        num_threads: config.preprocessing.transfer_threads,
        verify_integrity: config.preprocessing.verify_transfer,
    };
    push_to_destinations(
        source,
        &[
            (context.destinations.nas_raw_data.clone(), false),
            (context.destinations.server_raw_data.clone(), true),
        ],
        &options,
        config.preprocessing.parallel_destinations,
    )?;

    if config.preprocessing.verify_transfer {
        // Server-side verification passed: the acquisition-host copy is now
        // deletable, which the marker communicates to the purge scan.
        fs::write(&context.destinations.telomere_marker, b"")?;
    }
    Ok(())
}

/// Stage 6: completion marker and the external metadata log line.
fn finalize_session(config: &SystemConfiguration, context: &LifecycleContext) -> AppResult<()> {
    let descriptor: SessionDescriptor = load_yaml(&context.paths.session_descriptor())?;
    let completed = !descriptor.incomplete && !context.record.interrupted;
    if completed {
        fs::write(context.paths.completion_marker(), b"")?;
    } else {
        log::warn!(
            "Session {} is incomplete; downstream processing will skip it",
            context.session.name
        );
    }

    let digest = checksum::read_checksum(&context.paths.raw_data)?.unwrap_or_default();
    let clock = MonotonicClock::start();
    let record = IntegrityRecord::new(
        &context.session.name,
        &digest,
        config.preprocessing.verify_transfer,
        &clock,
    );
    let line = serde_json::to_string(&serde_json::json!({
        "project": context.session.project,
        "animal": context.session.animal,
        "session": record.session,
        "session_type": context.record.session_type,
        "dispensed_water_ml": descriptor.dispensed_water_ml,
        "complete": completed,
        "checksum": record.checksum,
        "server_verified": record.server_verified,
        "verified_at_us": record.verified_at_us,
    }))?;
    let log_path = config.paths.root_directory.join(METADATA_LOG_NAME);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Result of one purge scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Imaging-host session directories removed (ubiquitin-marked).
    pub imaging_removed: usize,
    /// Acquisition-host raw_data trees removed (telomere-marked remotely).
    pub acquisition_removed: usize,
}

/// Removes redundant session data across the acquisition machines.
///
/// Explicitly invoked, never automatic on success. A directory is removed
/// only when the marker protocol proves its data is held elsewhere:
/// imaging-host directories need their own `ubiquitin.bin` (written only
/// after the verified pull), acquisition-host `raw_data` trees need
/// `telomere.bin` on the server counterpart. Local state alone never
/// triggers deletion.
pub fn purge_redundant_data(config: &SystemConfiguration) -> AppResult<PurgeReport> {
    let mut report = PurgeReport::default();

    // Imaging host: any directory carrying the ubiquitin marker.
    if config.paths.mesoscope_directory.exists() {
        for entry in fs::read_dir(&config.paths.mesoscope_directory)? {
            let path = entry?.path();
            if path.is_dir() && path.join(UBIQUITIN_MARKER).exists() {
                log::info!("Purging imaging-host copy {}", path.display());
                fs::remove_dir_all(&path)?;
                report.imaging_removed += 1;
            }
        }
    }

    // Acquisition host: every known session whose server counterpart holds
    // the telomere marker.
    for session in known_sessions(&config.paths.root_directory)? {
        let paths = SessionPaths::resolve(&config.paths.root_directory, &session);
        if !paths.raw_data.exists() {
            continue;
        }
        let destinations = DestinationPaths::resolve(&config.paths, &session);
        if destinations.telomere_marker.exists() {
            log::info!(
                "Purging acquisition-host raw data of session {}",
                session.name
            );
            fs::remove_dir_all(&paths.raw_data)?;
            report.acquisition_removed += 1;
        }
    }
    Ok(report)
}

/// Enumerates every `project/animal/session` directory under the root.
fn known_sessions(root: &Path) -> AppResult<Vec<Session>> {
    let mut sessions = Vec::new();
    if !root.exists() {
        return Ok(sessions);
    }
    for project in fs::read_dir(root)? {
        let project = project?.path();
        if !project.is_dir() {
            continue;
        }
        for animal in fs::read_dir(&project)? {
            let animal = animal?.path();
            if !animal.is_dir() {
                continue;
            }
            for session in fs::read_dir(&animal)? {
                let session = session?.path();
                if !session.is_dir()
                    || session.file_name().and_then(|name| name.to_str())
                        == Some("persistent_data")
                {
                    continue;
                }
                if let Some(session) = Session::from_path(&session) {
                    sessions.push(session);
                }
            }
        }
    }
    Ok(sessions)
}
