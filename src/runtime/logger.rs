//! Binary runtime event logger.
//!
//! Every runtime event becomes one small binary record written into the
//! session's `behavior_log` directory by a dedicated writer thread, keeping
//! file I/O off the control loop. Records share the wire layout
//!
//! ```text
//! [source_id: u8][elapsed_us: u64 LE][payload...]
//! ```
//!
//! and each source's first record is its onset record: elapsed 0 with the
//! clock's UTC onset (microseconds since epoch, i64 LE) as payload. Later
//! processing uses the onset to convert elapsed offsets into absolute
//! timestamps, then compaction merges the per-event files into per-source
//! archives.

use crate::clock::MonotonicClock;
use crate::error::AppResult;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::JoinHandle;

/// Source id used by the runtime state machine itself.
pub const STATE_MACHINE_SOURCE_ID: u8 = 1;

// Payload header codes written by the state machine.
/// System state code change.
pub const HEADER_SYSTEM_STATE: u8 = 1;
/// Runtime stage code change.
pub const HEADER_RUNTIME_STAGE: u8 = 2;
/// Lick-guidance flag change.
pub const HEADER_GUIDANCE: u8 = 3;
/// Renderer termination distance snapshot.
pub const HEADER_RENDERER_TERMINATED: u8 = 4;

/// One log record queued to the writer thread.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub source_id: u8,
    pub elapsed_us: u64,
    pub payload: Vec<u8>,
}

enum WriterMessage {
    Record(LogRecord),
    Shutdown,
}

/// Handle to the background log writer.
pub struct EventLogger {
    tx: mpsc::Sender<WriterMessage>,
    writer: Option<JoinHandle<AppResult<()>>>,
    clock: MonotonicClock,
}

impl EventLogger {
    /// Spawns the writer thread over the given log directory.
    pub fn start(directory: PathBuf, clock: MonotonicClock) -> AppResult<Self> {
        fs::create_dir_all(&directory)?;
        let (tx, rx) = mpsc::channel::<WriterMessage>();
        let onset_us = clock.onset_us();
        let writer = std::thread::Builder::new()
            .name("event-logger".to_string())
            .spawn(move || write_loop(directory, onset_us, rx))?;
        Ok(Self {
            tx,
            writer: Some(writer),
            clock,
        })
    }

    /// Queues one payload stamped with the shared monotonic clock.
    pub fn log(&self, source_id: u8, payload: Vec<u8>) {
        let record = LogRecord {
            source_id,
            elapsed_us: self.clock.elapsed_us(),
            payload,
        };
        if self.tx.send(WriterMessage::Record(record)).is_err() {
            log::error!("Event logger thread is gone; dropping log record");
        }
    }

    /// Flushes pending records and joins the writer thread. Idempotent.
    pub fn shutdown(&mut self) -> AppResult<()> {
        if let Some(writer) = self.writer.take() {
            let _ = self.tx.send(WriterMessage::Shutdown);
            match writer.join() {
                Ok(result) => result?,
                Err(_) => log::error!("Event logger thread panicked during shutdown"),
            }
        }
        Ok(())
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            log::error!("Event logger shutdown failed: {error}");
        }
    }
}

fn write_loop(
    directory: PathBuf,
    onset_us: i64,
    rx: mpsc::Receiver<WriterMessage>,
) -> AppResult<()> {
    let mut sequence_numbers: HashMap<u8, u64> = HashMap::new();
    while let Ok(message) = rx.recv() {
        match message {
            WriterMessage::Record(record) => {
                let sequence = sequence_numbers.entry(record.source_id).or_insert(0);
                if *sequence == 0 {
                    // First record of a source: write its onset record.
                    write_record(
                        &directory,
                        record.source_id,
                        0,
                        &LogRecord {
                            source_id: record.source_id,
                            elapsed_us: 0,
                            payload: onset_us.to_le_bytes().to_vec(),
                        },
                    )?;
                    *sequence = 1;
                }
                write_record(&directory, record.source_id, *sequence, &record)?;
                *sequence += 1;
            }
            WriterMessage::Shutdown => break,
        }
    }
    Ok(())
}

fn write_record(
    directory: &std::path::Path,
    source_id: u8,
    sequence: u64,
    record: &LogRecord,
) -> AppResult<()> {
    let mut bytes = Vec::with_capacity(9 + record.payload.len());
    bytes.push(record.source_id);
    bytes.extend_from_slice(&record.elapsed_us.to_le_bytes());
    bytes.extend_from_slice(&record.payload);
    let path = directory.join(format!("{source_id:03}_{sequence:07}.bin"));
    fs::write(path, bytes)?;
    Ok(())
}

/// Parses one serialized log record back into its parts.
pub fn parse_record(bytes: &[u8]) -> Option<(u8, u64, &[u8])> {
    if bytes.len() < 9 {
        return None;
    }
    let source_id = bytes[0];
    let elapsed_us = u64::from_le_bytes(bytes[1..9].try_into().ok()?);
    Some((source_id, elapsed_us, &bytes[9..]))
}
