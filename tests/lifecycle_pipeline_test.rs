//! Full preprocessing pipeline: imaging pull, log compaction, stack
//! recompression, dual-destination push and marker staging, exercised over
//! real files in temporary directories.

use mesovr_daq::config::{
    HardwareSettings, PreprocessingSettings, RuntimeSettings, SessionKind, SystemConfiguration,
    SystemPaths,
};
use mesovr_daq::lifecycle::{self, read_log_archive};
use mesovr_daq::session::artifacts::{save_yaml, SessionDescriptor, SessionRecord};
use mesovr_daq::session::{
    DestinationPaths, MesoscopeHostPaths, Session, SessionPaths, MOTION_ESTIMATOR_FILE,
    ZSTACK_FILE,
};
use std::fs;
use std::fs::File;
use std::path::Path;
use tempfile::TempDir;
use tiff::encoder::{colortype, TiffEncoder};

fn test_config(root: &TempDir) -> SystemConfiguration {
    SystemConfiguration {
        paths: SystemPaths {
            root_directory: root.path().join("data"),
            mesoscope_directory: root.path().join("meso"),
            nas_directory: root.path().join("nas"),
            server_directory: root.path().join("server"),
        },
        runtime: RuntimeSettings::default(),
        preprocessing: PreprocessingSettings {
            stack_batch_size: 2,
            worker_threads: 2,
            transfer_threads: 2,
            verify_compression: true,
            verify_transfer: true,
            parallel_destinations: true,
        },
        hardware: HardwareSettings::default(),
    }
}

fn write_stack(path: &Path, pages: usize) {
    let mut encoder = TiffEncoder::new(File::create(path).expect("create")).expect("encoder");
    for page in 0..pages {
        let data: Vec<u16> = (0..64).map(|pixel| (pixel + page * 7) as u16).collect();
        encoder
            .write_image::<colortype::Gray16>(8, 8, &data)
            .expect("page");
    }
}

/// Seeds an experiment session mid-lifecycle: behavior logs on the
/// acquisition host, device output still sitting in the imaging-host
/// staging directory.
fn seed_experiment_session(config: &SystemConfiguration) -> (Session, SessionPaths) {
    let session = Session {
        project: "tyche".into(),
        animal: "a7".into(),
        name: "2024-03-01-09-30-00-000001".into(),
    };
    let paths = SessionPaths::resolve(&config.paths.root_directory, &session);
    paths.materialize().expect("materialize");

    let record = SessionRecord::new(
        "tyche",
        "a7",
        &session.name,
        SessionKind::Experiment,
        "kat",
    );
    save_yaml(&paths.session_record(), &record).expect("record");
    save_yaml(
        &paths.session_descriptor(),
        &SessionDescriptor::new(SessionKind::Experiment, 5.0, 1),
    )
    .expect("descriptor");

    for sequence in 0..4u64 {
        fs::write(
            paths.behavior_log.join(format!("001_{sequence:07}.bin")),
            vec![1, sequence as u8, 0xEE],
        )
        .expect("log entry");
    }

    let staging = config.paths.mesoscope_directory.join("mesoscope_data");
    fs::create_dir_all(&staging).expect("staging");
    write_stack(&staging.join("session__00001_00001.tif"), 3);
    write_stack(&staging.join("session__00001_00002.tif"), 2);
    fs::write(staging.join(MOTION_ESTIMATOR_FILE), vec![9u8; 256]).expect("estimator");
    fs::write(staging.join(ZSTACK_FILE), vec![8u8; 128]).expect("zstack");

    (session, paths)
}

#[test]
fn test_full_pipeline_stages_and_markers() {
    let root = TempDir::new().expect("temp root");
    let config = test_config(&root);
    let (session, paths) = seed_experiment_session(&config);

    lifecycle::preprocess_session(&config, &paths.session_root).expect("preprocess");

    // Stage 1: device output was claimed, pulled and marked deletable.
    let mesoscope = MesoscopeHostPaths::resolve(&config.paths.mesoscope_directory, &session);
    assert!(mesoscope.session_directory.exists());
    assert!(mesoscope.ubiquitin_marker.exists());
    assert!(mesoscope.reference_motion_estimator.exists());
    assert!(paths.mesoscope_frames.join(MOTION_ESTIMATOR_FILE).exists());

    // Stage 2: logs compacted into one archive per source.
    let archive = paths.behavior_log.join("001_log.lz4");
    assert!(archive.exists());
    assert_eq!(read_log_archive(&archive).expect("archive").len(), 4);

    // Stage 3: stacks recompressed into frame-range-named outputs, sources
    // gone, metadata descriptors written.
    assert!(paths.mesoscope_frames.join("frames_000001_000003.tif").exists());
    assert!(paths.mesoscope_frames.join("frames_000004_000005.tif").exists());
    assert!(!paths
        .mesoscope_frames
        .join("session__00001_00001.tif")
        .exists());
    assert!(paths.frame_invariant_metadata().exists());
    assert!(paths.ops_file().exists());

    // Stage 5: both destinations hold the data; only the server carries the
    // telomere marker.
    let destinations = DestinationPaths::resolve(&config.paths, &session);
    assert!(destinations
        .server_raw_data
        .join("behavior_log/001_log.lz4")
        .exists());
    assert!(destinations
        .nas_raw_data
        .join("behavior_log/001_log.lz4")
        .exists());
    assert!(destinations.telomere_marker.exists());
    assert!(!destinations.nas_raw_data.join("telomere.bin").exists());

    // Stage 6: completion marker and metadata log line.
    assert!(paths.completion_marker().exists());
    let metadata_log = config
        .paths
        .root_directory
        .join(lifecycle::manager::METADATA_LOG_NAME);
    let log_text = fs::read_to_string(metadata_log).expect("metadata log");
    assert!(log_text.contains(&session.name));
}

#[test]
fn test_pipeline_resumes_after_partial_completion() {
    let root = TempDir::new().expect("temp root");
    let config = test_config(&root);
    let (_session, paths) = seed_experiment_session(&config);

    lifecycle::preprocess_session(&config, &paths.session_root).expect("first run");
    let digest_before = lifecycle::read_checksum(&paths.raw_data)
        .expect("read")
        .expect("present");

    // Re-running the identical entry point must be a clean no-op.
    lifecycle::preprocess_session(&config, &paths.session_root).expect("second run");
    let digest_after = lifecycle::read_checksum(&paths.raw_data)
        .expect("read")
        .expect("present");
    assert_eq!(digest_before, digest_after);
}

#[test]
fn test_interrupted_session_gets_no_completion_marker() {
    let root = TempDir::new().expect("temp root");
    let config = test_config(&root);
    let (_session, paths) = seed_experiment_session(&config);

    // The runtime crashed after writing an interrupted descriptor.
    let mut descriptor = SessionDescriptor::new(SessionKind::Experiment, 5.0, 1);
    descriptor.incomplete = true;
    save_yaml(&paths.session_descriptor(), &descriptor).expect("descriptor");

    lifecycle::preprocess_session(&config, &paths.session_root).expect("preprocess");
    assert!(
        !paths.completion_marker().exists(),
        "incomplete sessions are excluded from downstream processing"
    );
    // The data still made it to long-term storage: incompleteness excludes
    // a session from automation, it never drops collected data.
    let destinations = DestinationPaths::resolve(
        &config.paths,
        &Session {
            project: "tyche".into(),
            animal: "a7".into(),
            name: "2024-03-01-09-30-00-000001".into(),
        },
    );
    assert!(destinations.server_raw_data.exists());
}
