//! Resumable, checksum-verified directory transfer.
//!
//! Moves a directory tree to one or more destinations while proving
//! byte-exact integrity. Files are copied by a worker-thread pool in bounded
//! chunks; a repeated invocation with the same source and destination skips
//! content that already arrived intact instead of re-copying blindly. With
//! verification enabled, the destination is re-hashed after the copy and
//! compared against the source digest — a mismatch is a hard failure.

use crate::error::{AppResult, VrError};
use crate::lifecycle::checksum::{self, CHECKSUM_FILE_NAME};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const COPY_CHUNK_BYTES: usize = 1024 * 1024;

/// Transfer tuning knobs.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Worker threads copying files concurrently.
    pub num_threads: usize,
    /// Re-hash the destination after the copy and compare digests.
    pub verify_integrity: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            num_threads: 10,
            verify_integrity: true,
        }
    }
}

fn collect_relative_files(source: &Path) -> AppResult<Vec<PathBuf>> {
    fn walk(base: &Path, directory: &Path, files: &mut Vec<PathBuf>) -> AppResult<()> {
        for entry in fs::read_dir(directory)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(base, &path, files)?;
            } else if let Ok(relative) = path.strip_prefix(base) {
                files.push(relative.to_path_buf());
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    walk(source, source, &mut files)?;
    files.sort();
    Ok(files)
}

/// A destination file is up to date when its size matches and its bytes
/// hash identically to the source file's.
fn is_up_to_date(source: &Path, destination: &Path) -> bool {
    let (Ok(source_meta), Ok(destination_meta)) =
        (fs::metadata(source), fs::metadata(destination))
    else {
        return false;
    };
    if source_meta.len() != destination_meta.len() {
        return false;
    }
    match (hash_contents(source), hash_contents(destination)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn hash_contents(path: &Path) -> AppResult<blake3::Hash> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(path)?;
    let mut chunk = vec![0u8; COPY_CHUNK_BYTES];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(hasher.finalize())
}

fn copy_file(source: &Path, destination: &Path) -> AppResult<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut reader = File::open(source)?;
    let mut writer = File::create(destination)?;
    let mut chunk = vec![0u8; COPY_CHUNK_BYTES];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        writer.write_all(&chunk[..read])?;
    }
    writer.flush()?;
    Ok(())
}

/// Transfers `source` into `destination` (the destination directory itself
/// receives the source's contents).
///
/// Ensures the source digest exists first, fans the per-file copies out over
/// the worker pool, and optionally verifies the destination against the
/// source digest. The tree is treated as exclusively owned for the duration
/// of the transfer.
pub fn transfer_directory(
    source: &Path,
    destination: &Path,
    options: &TransferOptions,
) -> AppResult<()> {
    if !source.is_dir() {
        return Err(VrError::MissingArtifact(source.to_path_buf()));
    }
    fs::create_dir_all(destination)?;

    // The digest travels with the data: compute and persist it up front if
    // this tree was never hashed.
    let source_digest = match checksum::read_checksum(source)? {
        Some(digest) => digest,
        None => checksum::write_checksum(source, options.num_threads)?,
    };

    let files = collect_relative_files(source)?;
    let failures: Mutex<Vec<VrError>> = Mutex::new(Vec::new());
    let next_index = AtomicUsize::new(0);
    let workers = options.num_threads.clamp(1, files.len().max(1));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = next_index.fetch_add(1, Ordering::Relaxed);
                if index >= files.len() {
                    break;
                }
                let relative = &files[index];
                let from = source.join(relative);
                let to = destination.join(relative);
                if is_up_to_date(&from, &to) {
                    continue;
                }
                if let Err(error) = copy_file(&from, &to) {
                    if let Ok(mut sink) = failures.lock() {
                        sink.push(error);
                    }
                }
            });
        }
    });

    let mut failures = failures
        .into_inner()
        .map_err(|_| VrError::Hardware("transfer worker poisoned the failure list".into()))?;
    if let Some(error) = failures.pop() {
        return Err(error);
    }

    if options.verify_integrity {
        checksum::verify_directory(destination, &source_digest, options.num_threads)?;
        log::info!(
            "Transfer verified: {} -> {} ({source_digest})",
            source.display(),
            destination.display()
        );
    }
    Ok(())
}

/// Pushes one source tree to several destinations, optionally in parallel.
///
/// `verify` carries one flag per destination so individual destinations can
/// opt out of the post-transfer re-hash.
pub fn push_to_destinations(
    source: &Path,
    destinations: &[(PathBuf, bool)],
    options: &TransferOptions,
    parallel: bool,
) -> AppResult<()> {
    if parallel {
        let results: Mutex<Vec<AppResult<()>>> = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for (destination, verify) in destinations {
                let results = &results;
                let per_destination = TransferOptions {
                    verify_integrity: options.verify_integrity && *verify,
                    ..options.clone()
                };
                scope.spawn(move || {
                    let outcome = transfer_directory(source, destination, &per_destination);
                    if let Ok(mut sink) = results.lock() {
                        sink.push(outcome);
                    }
                });
            }
        });
        let outcomes = results
            .into_inner()
            .map_err(|_| VrError::Hardware("push worker poisoned the result list".into()))?;
        for outcome in outcomes {
            outcome?;
        }
        Ok(())
    } else {
        for (destination, verify) in destinations {
            let per_destination = TransferOptions {
                verify_integrity: options.verify_integrity && *verify,
                ..options.clone()
            };
            transfer_directory(source, destination, &per_destination)?;
        }
        Ok(())
    }
}
