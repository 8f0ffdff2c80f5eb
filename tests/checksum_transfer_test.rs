//! Checksum and transfer engine properties over realistic trees: empty
//! files, deep nesting and megabyte-scale payloads.

use mesovr_daq::lifecycle::{
    hash_directory, push_to_destinations, read_checksum, transfer_directory, TransferOptions,
};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn build_realistic_tree(root: &Path) {
    fs::create_dir_all(root.join("behavior_log")).expect("dirs");
    fs::create_dir_all(root.join("mesoscope_frames/a/b/c/d")).expect("deep dirs");
    fs::write(root.join("session_data.yaml"), "project: tyche\n").expect("yaml");
    fs::write(root.join("behavior_log/001_log.lz4"), vec![3u8; 1024]).expect("log");
    fs::write(root.join("mesoscope_frames/empty.bin"), b"").expect("empty");
    // A few megabytes of patterned payload.
    let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|byte| (byte % 251) as u8).collect();
    fs::write(root.join("mesoscope_frames/frames_000001_000500.tif"), payload).expect("frames");
    fs::write(root.join("mesoscope_frames/a/b/c/d/leaf.bin"), vec![5u8; 17]).expect("leaf");
}

#[test]
fn test_hash_is_stable_across_worker_counts() {
    let dir = TempDir::new().expect("temp dir");
    build_realistic_tree(dir.path());
    let single = hash_directory(dir.path(), 1).expect("single worker");
    let many = hash_directory(dir.path(), 8).expect("many workers");
    assert_eq!(single, many);
}

#[test]
fn test_directory_rename_changes_nothing_but_content_rename_does() {
    let dir = TempDir::new().expect("temp dir");
    build_realistic_tree(dir.path());
    let before = hash_directory(dir.path(), 4).expect("before");

    // Moving the whole tree to a new parent keeps all relative paths, so
    // the digest is unchanged.
    let moved = TempDir::new().expect("new parent");
    let new_root = moved.path().join("renamed-session");
    fs::rename(dir.path(), &new_root).expect("move tree");
    fs::create_dir_all(dir.path()).expect("recreate for TempDir drop");
    let after_move = hash_directory(&new_root, 4).expect("after move");
    assert_eq!(before, after_move);

    // Renaming a file inside the tree changes a relative path and must
    // change the digest.
    fs::rename(
        new_root.join("mesoscope_frames/a/b/c/d/leaf.bin"),
        new_root.join("mesoscope_frames/a/b/c/d/leaf2.bin"),
    )
    .expect("rename leaf");
    let after_rename = hash_directory(&new_root, 4).expect("after rename");
    assert_ne!(before, after_rename);
}

#[test]
fn test_transfer_round_trip_digest_matches() {
    let source = TempDir::new().expect("source");
    let destination = TempDir::new().expect("destination");
    build_realistic_tree(source.path());

    let options = TransferOptions {
        num_threads: 4,
        verify_integrity: true,
    };
    transfer_directory(source.path(), destination.path(), &options).expect("transfer");

    let original = read_checksum(source.path()).expect("read").expect("present");
    let copied = hash_directory(destination.path(), 4).expect("hash copy");
    assert_eq!(original, copied);
}

#[test]
fn test_dual_destination_push_with_selective_verification() {
    let source = TempDir::new().expect("source");
    let nas = TempDir::new().expect("nas");
    let server = TempDir::new().expect("server");
    build_realistic_tree(source.path());

    let options = TransferOptions {
        num_threads: 4,
        verify_integrity: true,
    };
    push_to_destinations(
        source.path(),
        &[
            (nas.path().to_path_buf(), false),
            (server.path().to_path_buf(), true),
        ],
        &options,
        true,
    )
    .expect("push");

    let original = read_checksum(source.path()).expect("read").expect("present");
    for destination in [nas.path(), server.path()] {
        let copied = hash_directory(destination, 4).expect("hash");
        assert_eq!(original, copied, "destination {destination:?}");
    }
}

#[test]
fn test_corrupted_destination_fails_verification() {
    let source = TempDir::new().expect("source");
    let destination = TempDir::new().expect("destination");
    build_realistic_tree(source.path());

    let options = TransferOptions {
        num_threads: 2,
        verify_integrity: true,
    };
    transfer_directory(source.path(), destination.path(), &options).expect("transfer");

    // Corrupt one byte on the destination, then verify against the source
    // digest: this must be a hard checksum failure.
    let victim = destination.path().join("behavior_log/001_log.lz4");
    let mut bytes = fs::read(&victim).expect("read victim");
    bytes[100] ^= 0xFF;
    fs::write(&victim, bytes).expect("corrupt");

    let expected = read_checksum(source.path()).expect("read").expect("present");
    let result = mesovr_daq::lifecycle::verify_directory(destination.path(), &expected, 2);
    assert!(result.is_err());
}
