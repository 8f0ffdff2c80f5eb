//! Cross-process operator signal array.
//!
//! The keyboard listener and the control GUI run in separate processes and
//! communicate with the runtime through a small file-backed shared-memory
//! array (`memmap2`) instead of OS-level IPC primitives. The array is a
//! fixed layout of tagged little-endian `i32` fields:
//!
//! | index | field    | semantics                         |
//! |-------|----------|-----------------------------------|
//! | 0     | exit     | edge-triggered, reset on read     |
//! | 1     | reward   | edge-triggered, reset on read     |
//! | 2     | speed    | level (signed modifier steps)     |
//! | 3     | duration | level (signed modifier steps)     |
//! | 4     | pause    | level (0 = running, 1 = paused)   |
//!
//! Each field has exactly one writer (the UI process) and one reader (the
//! runtime); edge fields are acknowledged by the reader writing zero back.

use crate::error::AppResult;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;

const FIELD_COUNT: usize = 5;
const FIELD_BYTES: usize = 4;
const ARRAY_BYTES: u64 = (FIELD_COUNT * FIELD_BYTES) as u64;

const FIELD_EXIT: usize = 0;
const FIELD_REWARD: usize = 1;
const FIELD_SPEED: usize = 2;
const FIELD_DURATION: usize = 3;
const FIELD_PAUSE: usize = 4;

/// Shared operator signal array mapped from a file.
pub struct OperatorSignals {
    map: MmapMut,
}

impl OperatorSignals {
    /// Creates (or truncates) the backing file and maps it zeroed.
    pub fn create(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(ARRAY_BYTES)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }

    /// Maps an existing signal array created by another process.
    pub fn open(path: &Path) -> AppResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }

    fn read_field(&self, index: usize) -> i32 {
        let offset = index * FIELD_BYTES;
        let bytes: [u8; 4] = self.map[offset..offset + FIELD_BYTES]
            .try_into()
            .unwrap_or([0; 4]);
        i32::from_le_bytes(bytes)
    }

    fn write_field(&mut self, index: usize, value: i32) {
        let offset = index * FIELD_BYTES;
        self.map[offset..offset + FIELD_BYTES].copy_from_slice(&value.to_le_bytes());
    }

    // --- Reader side (runtime) ---------------------------------------------

    /// True once the operator requested a graceful abort. Resets on read.
    pub fn take_exit_signal(&mut self) -> bool {
        let raised = self.read_field(FIELD_EXIT) != 0;
        if raised {
            self.write_field(FIELD_EXIT, 0);
        }
        raised
    }

    /// True once the operator requested a manual reward. Resets on read.
    pub fn take_reward_signal(&mut self) -> bool {
        let raised = self.read_field(FIELD_REWARD) != 0;
        if raised {
            self.write_field(FIELD_REWARD, 0);
        }
        raised
    }

    /// Current signed running-speed threshold modifier.
    pub fn speed_modifier(&self) -> i32 {
        self.read_field(FIELD_SPEED)
    }

    /// Current signed epoch-duration threshold modifier.
    pub fn duration_modifier(&self) -> i32 {
        self.read_field(FIELD_DURATION)
    }

    /// Whether the operator holds the runtime paused.
    pub fn pause_requested(&self) -> bool {
        self.read_field(FIELD_PAUSE) != 0
    }

    // --- Writer side (keyboard listener / GUI) -----------------------------

    pub fn request_exit(&mut self) {
        self.write_field(FIELD_EXIT, 1);
    }

    pub fn request_reward(&mut self) {
        self.write_field(FIELD_REWARD, 1);
    }

    pub fn adjust_speed(&mut self, steps: i32) {
        let value = self.read_field(FIELD_SPEED) + steps;
        self.write_field(FIELD_SPEED, value);
    }

    pub fn adjust_duration(&mut self, steps: i32) {
        let value = self.read_field(FIELD_DURATION) + steps;
        self.write_field(FIELD_DURATION, value);
    }

    pub fn set_pause(&mut self, paused: bool) {
        self.write_field(FIELD_PAUSE, paused as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_edge_fields_reset_on_read() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("signals.bin");
        let mut writer = OperatorSignals::create(&path).expect("create");
        let mut reader = OperatorSignals::open(&path).expect("open");

        writer.request_exit();
        writer.request_reward();
        assert!(reader.take_exit_signal());
        assert!(reader.take_reward_signal());
        // Second read observes the acknowledged state.
        assert!(!reader.take_exit_signal());
        assert!(!reader.take_reward_signal());
    }

    #[test]
    fn test_level_fields_persist_across_reads() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("signals.bin");
        let mut writer = OperatorSignals::create(&path).expect("create");
        let reader = OperatorSignals::open(&path).expect("open");

        writer.adjust_speed(3);
        writer.adjust_speed(-1);
        writer.adjust_duration(-2);
        writer.set_pause(true);
        assert_eq!(reader.speed_modifier(), 2);
        assert_eq!(reader.duration_modifier(), -2);
        assert!(reader.pause_requested());
        assert!(reader.pause_requested());

        writer.set_pause(false);
        assert!(!reader.pause_requested());
    }
}
