//! Streaming 128-bit directory checksums.
//!
//! The integrity record of a session tree is a 128-bit content digest over
//! every file's relative path and bytes. Per-file digests are computed in
//! parallel, then folded in sorted relative-path order, so the result is
//! deterministic regardless of traversal order or worker scheduling. The
//! digest is persisted alongside the data (`checksum.txt`) and travels with
//! it to every destination.

use crate::error::{AppResult, VrError};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// File the hex digest is persisted to, at the tree root.
pub const CHECKSUM_FILE_NAME: &str = "checksum.txt";

/// Bytes of digest output (128 bits).
const DIGEST_BYTES: usize = 16;
/// Streaming read chunk.
const CHUNK_BYTES: usize = 1024 * 1024;

/// Names excluded from hashing: the integrity record itself and the
/// sentinel/marker files, none of which are session data.
const EXCLUDED_NAMES: [&str; 4] = [
    CHECKSUM_FILE_NAME,
    crate::session::UBIQUITIN_MARKER,
    crate::session::TELOMERE_MARKER,
    crate::session::COMPLETION_MARKER,
];

fn is_excluded(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| EXCLUDED_NAMES.contains(&name))
        .unwrap_or(false)
}

/// Lists every hashable file under `directory`, sorted by relative path.
fn collect_files(directory: &Path) -> AppResult<Vec<PathBuf>> {
    fn walk(directory: &Path, files: &mut Vec<PathBuf>) -> AppResult<()> {
        for entry in fs::read_dir(directory)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, files)?;
            } else if !is_excluded(&path) {
                files.push(path);
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    walk(directory, &mut files)?;
    files.sort();
    Ok(files)
}

/// Hashes one file: its relative path bytes, then its contents, streamed in
/// bounded chunks.
fn hash_file(base: &Path, path: &Path) -> AppResult<[u8; DIGEST_BYTES]> {
    let mut hasher = blake3::Hasher::new();
    let relative = path.strip_prefix(base).unwrap_or(path);
    hasher.update(relative.to_string_lossy().as_bytes());

    let mut file = File::open(path)?;
    let mut chunk = vec![0u8; CHUNK_BYTES];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }

    let mut digest = [0u8; DIGEST_BYTES];
    hasher.finalize_xof().fill(&mut digest);
    Ok(digest)
}

/// Computes the 128-bit digest of a directory tree as lowercase hex.
///
/// Per-file hashing fans out over `workers` threads; the final fold runs in
/// sorted relative-path order, so renames of the *traversal* (not content)
/// cannot change the digest, and hashing the same tree twice is idempotent.
pub fn hash_directory(directory: &Path, workers: usize) -> AppResult<String> {
    let files = collect_files(directory)?;
    let digests: Vec<Mutex<Option<AppResult<[u8; DIGEST_BYTES]>>>> =
        (0..files.len()).map(|_| Mutex::new(None)).collect();
    let next_index = AtomicUsize::new(0);
    let workers = workers.clamp(1, files.len().max(1));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = next_index.fetch_add(1, Ordering::Relaxed);
                if index >= files.len() {
                    break;
                }
                let result = hash_file(directory, &files[index]);
                if let Ok(mut slot) = digests[index].lock() {
                    *slot = Some(result);
                }
            });
        }
    });

    let mut folder = blake3::Hasher::new();
    for (path, slot) in files.iter().zip(digests) {
        let digest = slot
            .into_inner()
            .map_err(|_| VrError::Hardware("checksum worker poisoned its result slot".into()))?
            .unwrap_or_else(|| {
                Err(VrError::MissingArtifact(path.clone()))
            })?;
        let relative = path.strip_prefix(directory).unwrap_or(path);
        folder.update(relative.to_string_lossy().as_bytes());
        folder.update(&digest);
    }
    let mut combined = [0u8; DIGEST_BYTES];
    folder.finalize_xof().fill(&mut combined);
    Ok(hex(&combined))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Computes the digest and persists it as `checksum.txt` at the tree root.
pub fn write_checksum(directory: &Path, workers: usize) -> AppResult<String> {
    let digest = hash_directory(directory, workers)?;
    fs::write(directory.join(CHECKSUM_FILE_NAME), &digest)?;
    Ok(digest)
}

/// Reads a previously persisted digest, if present.
pub fn read_checksum(directory: &Path) -> AppResult<Option<String>> {
    let path = directory.join(CHECKSUM_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(fs::read_to_string(path)?.trim().to_string()))
}

/// Re-hashes a destination tree and compares it to the expected digest.
/// A mismatch is a hard failure, never silently retried.
pub fn verify_directory(directory: &Path, expected: &str, workers: usize) -> AppResult<()> {
    let actual = hash_directory(directory, workers)?;
    if actual != expected {
        return Err(VrError::ChecksumMismatch {
            destination: directory.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("nested/deeper")).expect("dirs");
        fs::write(root.join("a.bin"), vec![1u8; 4096]).expect("a");
        fs::write(root.join("empty.bin"), b"").expect("empty");
        fs::write(root.join("nested/b.bin"), b"payload").expect("b");
        fs::write(root.join("nested/deeper/c.bin"), vec![7u8; 100]).expect("c");
    }

    #[test]
    fn test_hashing_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        build_tree(dir.path());
        let first = hash_directory(dir.path(), 4).expect("first");
        let second = hash_directory(dir.path(), 1).expect("second");
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn test_digest_depends_on_relative_paths() {
        let dir_a = TempDir::new().expect("temp dir");
        let dir_b = TempDir::new().expect("temp dir");
        fs::write(dir_a.path().join("x.bin"), b"data").expect("x");
        fs::write(dir_b.path().join("y.bin"), b"data").expect("y");
        let a = hash_directory(dir_a.path(), 2).expect("a");
        let b = hash_directory(dir_b.path(), 2).expect("b");
        assert_ne!(a, b, "same bytes under a different name must differ");
    }

    #[test]
    fn test_digest_ignores_markers_and_checksum_file() {
        let dir = TempDir::new().expect("temp dir");
        build_tree(dir.path());
        let before = hash_directory(dir.path(), 2).expect("before");
        fs::write(dir.path().join(CHECKSUM_FILE_NAME), "deadbeef").expect("checksum");
        fs::write(dir.path().join(crate::session::TELOMERE_MARKER), b"").expect("marker");
        let after = hash_directory(dir.path(), 2).expect("after");
        assert_eq!(before, after);
    }

    #[test]
    fn test_content_change_changes_digest() {
        let dir = TempDir::new().expect("temp dir");
        build_tree(dir.path());
        let before = hash_directory(dir.path(), 2).expect("before");
        fs::write(dir.path().join("a.bin"), vec![2u8; 4096]).expect("rewrite");
        let after = hash_directory(dir.path(), 2).expect("after");
        assert_ne!(before, after);
    }

    #[test]
    fn test_verify_reports_mismatch_as_hard_error() {
        let dir = TempDir::new().expect("temp dir");
        build_tree(dir.path());
        let digest = hash_directory(dir.path(), 2).expect("digest");
        verify_directory(dir.path(), &digest, 2).expect("matching digest verifies");
        let result = verify_directory(dir.path(), "00000000000000000000000000000000", 2);
        assert!(matches!(result, Err(VrError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        build_tree(dir.path());
        let written = write_checksum(dir.path(), 2).expect("write");
        let read = read_checksum(dir.path()).expect("read").expect("present");
        assert_eq!(written, read);
    }
}
