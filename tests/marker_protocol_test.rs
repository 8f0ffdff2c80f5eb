//! Marker-protocol safety: a directory is deleted in exactly one of the
//! four (local-ready, remote-marker-present) combinations.

use mesovr_daq::config::{
    HardwareSettings, PreprocessingSettings, RuntimeSettings, SystemConfiguration, SystemPaths,
};
use mesovr_daq::lifecycle::purge_redundant_data;
use mesovr_daq::session::artifacts::{save_yaml, SessionRecord};
use mesovr_daq::session::{
    DestinationPaths, Session, SessionPaths, TELOMERE_MARKER, UBIQUITIN_MARKER,
};
use std::fs;
use tempfile::TempDir;

fn test_config(root: &TempDir) -> SystemConfiguration {
    SystemConfiguration {
        paths: SystemPaths {
            root_directory: root.path().join("data"),
            mesoscope_directory: root.path().join("meso"),
            nas_directory: root.path().join("nas"),
            server_directory: root.path().join("server"),
        },
        runtime: RuntimeSettings::default(),
        preprocessing: PreprocessingSettings::default(),
        hardware: HardwareSettings::default(),
    }
}

fn seed_acquisition_session(config: &SystemConfiguration, name: &str) -> SessionPaths {
    let session = Session {
        project: "tyche".into(),
        animal: "a7".into(),
        name: name.into(),
    };
    let paths = SessionPaths::resolve(&config.paths.root_directory, &session);
    paths.materialize().expect("materialize");
    let record = SessionRecord::new(
        "tyche",
        "a7",
        name,
        mesovr_daq::config::SessionKind::LickTraining,
        "kat",
    );
    save_yaml(&paths.session_record(), &record).expect("record");
    paths
}

#[test]
fn test_deletion_happens_in_exactly_one_of_four_combinations() {
    // Combination matrix over (local raw_data present, remote telomere
    // present). Only (present, present) may delete.
    for (local_ready, remote_marker) in
        [(false, false), (false, true), (true, false), (true, true)]
    {
        let root = TempDir::new().expect("temp root");
        let config = test_config(&root);
        let session_name = "2024-05-05-10-00-00-000001";
        let paths = seed_acquisition_session(&config, session_name);
        if !local_ready {
            fs::remove_dir_all(&paths.raw_data).expect("drop raw data");
        }
        if remote_marker {
            let destinations = DestinationPaths::resolve(
                &config.paths,
                &Session {
                    project: "tyche".into(),
                    animal: "a7".into(),
                    name: session_name.into(),
                },
            );
            fs::create_dir_all(&destinations.server_raw_data).expect("server tree");
            fs::write(&destinations.telomere_marker, b"").expect("marker");
        }

        let report = purge_redundant_data(&config).expect("purge");
        let expected_deletions = usize::from(local_ready && remote_marker);
        assert_eq!(
            report.acquisition_removed, expected_deletions,
            "local_ready={local_ready} remote_marker={remote_marker}"
        );
        assert_eq!(
            paths.raw_data.exists(),
            local_ready && !remote_marker,
            "raw_data survival for local_ready={local_ready} remote_marker={remote_marker}"
        );
    }
}

#[test]
fn test_local_state_alone_never_triggers_deletion() {
    let root = TempDir::new().expect("temp root");
    let config = test_config(&root);
    let paths = seed_acquisition_session(&config, "2024-05-05-10-00-00-000002");

    // A telomere marker in the LOCAL tree (wrong machine) must not count.
    fs::write(paths.raw_data.join(TELOMERE_MARKER), b"").expect("local marker");
    let report = purge_redundant_data(&config).expect("purge");
    assert_eq!(report.acquisition_removed, 0);
    assert!(paths.raw_data.exists());
}

#[test]
fn test_imaging_host_deletion_requires_its_marker() {
    let root = TempDir::new().expect("temp root");
    let config = test_config(&root);
    for (name, marked) in [("session-x", false), ("session-y", true)] {
        let directory = config.paths.mesoscope_directory.join(name);
        fs::create_dir_all(&directory).expect("dir");
        fs::write(directory.join("frames.tif"), b"payload").expect("payload");
        if marked {
            fs::write(directory.join(UBIQUITIN_MARKER), b"").expect("marker");
        }
    }

    let report = purge_redundant_data(&config).expect("purge");
    assert_eq!(report.imaging_removed, 1);
    assert!(config.paths.mesoscope_directory.join("session-x").exists());
    assert!(!config.paths.mesoscope_directory.join("session-y").exists());
}
