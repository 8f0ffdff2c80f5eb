//! Behavior-log compaction.
//!
//! A runtime writes one small `.bin` file per logged event
//! (`<source>_<sequence>.bin`). Compaction merges every source's entries
//! into a single LZ4-compressed archive (`<source>_log.lz4`) holding
//! length-prefixed named records:
//!
//! ```text
//! [name_len u16 LE][name bytes][payload_len u32 LE][payload bytes] ...
//! ```
//!
//! Finding compressed archives *and* uncompressed entries in the same
//! directory means a previous compaction was interrupted between archive
//! write and source deletion in an unobservable way — that directory is
//! ambiguous and compacting it is a fatal inconsistency, never silently
//! resolved.

use crate::error::{AppResult, VrError};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Suffix of compacted archives.
pub const ARCHIVE_SUFFIX: &str = "_log.lz4";

/// Splits `<source>_<sequence>.bin` into its source id and sequence.
fn parse_entry_name(path: &Path) -> Option<(u8, u64)> {
    let stem = path.file_stem()?.to_str()?;
    let (source, sequence) = stem.split_once('_')?;
    Some((source.parse().ok()?, sequence.parse().ok()?))
}

/// Compacts every log source in `directory`.
///
/// Idempotent: a directory holding only archives is already compacted and
/// comes back unchanged. Returns the archives present after the pass.
pub fn compact_log_directory(directory: &Path) -> AppResult<Vec<PathBuf>> {
    let mut entries: BTreeMap<u8, Vec<(u64, PathBuf)>> = BTreeMap::new();
    let mut archives: Vec<PathBuf> = Vec::new();

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        if name.ends_with(ARCHIVE_SUFFIX) {
            archives.push(path);
        } else if path.extension().and_then(|extension| extension.to_str()) == Some("bin") {
            match parse_entry_name(&path) {
                Some((source, sequence)) => {
                    entries.entry(source).or_default().push((sequence, path));
                }
                None => {
                    log::warn!("Ignoring unrecognized log entry name: {name}");
                }
            }
        }
    }

    if !archives.is_empty() && !entries.is_empty() {
        return Err(VrError::MixedLogDirectory(directory.to_path_buf()));
    }
    if entries.is_empty() {
        return Ok(archives);
    }

    for (source, mut source_entries) in entries {
        source_entries.sort_by_key(|(sequence, _)| *sequence);
        let archive_path = directory.join(format!("{source:03}{ARCHIVE_SUFFIX}"));
        write_archive(&archive_path, &source_entries)?;

        // Sources are deleted only after their archive is fully written.
        for (_, path) in &source_entries {
            fs::remove_file(path)?;
        }
        log::info!(
            "Compacted {} entries of source {source} into {}",
            source_entries.len(),
            archive_path.display()
        );
        archives.push(archive_path);
    }
    archives.sort();
    Ok(archives)
}

fn write_archive(archive_path: &Path, entries: &[(u64, PathBuf)]) -> AppResult<()> {
    let mut encoder = FrameEncoder::new(File::create(archive_path)?);
    for (_, path) in entries {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let payload = fs::read(path)?;
        encoder.write_all(&(name.len() as u16).to_le_bytes())?;
        encoder.write_all(name.as_bytes())?;
        encoder.write_all(&(payload.len() as u32).to_le_bytes())?;
        encoder.write_all(&payload)?;
    }
    let file = encoder.finish().map_err(|error| {
        VrError::Hardware(format!("lz4 archive finalize failed: {error}"))
    })?;
    file.sync_all()?;
    Ok(())
}

/// Reads every named record back out of an archive.
pub fn read_log_archive(archive_path: &Path) -> AppResult<Vec<(String, Vec<u8>)>> {
    let mut decoder = FrameDecoder::new(File::open(archive_path)?);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if offset + 2 > bytes.len() {
            return Err(VrError::Hardware(format!(
                "truncated record header in {}",
                archive_path.display()
            )));
        }
        let truncated = || {
            VrError::Hardware(format!(
                "truncated record in {}",
                archive_path.display()
            ))
        };
        let name_len = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;
        offset += 2;
        if offset + name_len + 4 > bytes.len() {
            return Err(truncated());
        }
        let name = String::from_utf8_lossy(&bytes[offset..offset + name_len]).to_string();
        offset += name_len;
        let payload_len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        offset += 4;
        if offset + payload_len > bytes.len() {
            return Err(truncated());
        }
        let payload = bytes[offset..offset + payload_len].to_vec();
        offset += payload_len;
        records.push((name, payload));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_entries(directory: &Path, source: u8, count: u64) {
        for sequence in 0..count {
            let path = directory.join(format!("{source:03}_{sequence:07}.bin"));
            fs::write(path, vec![source, sequence as u8, 0xAB]).expect("entry");
        }
    }

    #[test]
    fn test_compaction_round_trips_records_in_order() {
        let dir = TempDir::new().expect("temp dir");
        write_entries(dir.path(), 1, 5);
        write_entries(dir.path(), 101, 3);

        let archives = compact_log_directory(dir.path()).expect("compact");
        assert_eq!(archives.len(), 2);

        // Source entries are gone, only archives remain.
        let remaining: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(remaining.len(), 2);

        let records = read_log_archive(&dir.path().join(format!("001{ARCHIVE_SUFFIX}")))
            .expect("read archive");
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].0, "001_0000000.bin");
        assert_eq!(records[4].0, "001_0000004.bin");
        assert_eq!(records[2].1, vec![1, 2, 0xAB]);
    }

    #[test]
    fn test_compaction_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        write_entries(dir.path(), 1, 2);
        let first = compact_log_directory(dir.path()).expect("first pass");
        let second = compact_log_directory(dir.path()).expect("second pass");
        assert_eq!(first, second);
    }

    #[test]
    fn test_mixed_directory_is_fatal() {
        let dir = TempDir::new().expect("temp dir");
        write_entries(dir.path(), 1, 2);
        compact_log_directory(dir.path()).expect("compact");
        // A stray uncompressed entry appears next to the archive.
        write_entries(dir.path(), 2, 1);
        let result = compact_log_directory(dir.path());
        assert!(matches!(result, Err(VrError::MixedLogDirectory(_))));
    }
}
