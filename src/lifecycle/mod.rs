//! Data lifecycle: compression, integrity, transfer and staged deletion.
//!
//! At runtime end the state machine hands the raw session tree to this
//! subsystem, which compresses it, pushes it to two long-term stores with
//! checksum verification, and stages deletion through the two-phase marker
//! protocol.

pub mod checksum;
pub mod logs;
pub mod manager;
pub mod stacks;
pub mod transfer;

pub use checksum::{hash_directory, read_checksum, verify_directory, write_checksum};
pub use logs::{compact_log_directory, read_log_archive};
pub use manager::{preprocess_session, purge_redundant_data, LifecycleContext, PurgeReport};
pub use stacks::{probe_stack, recompress_directory, StackReport, StackSettings};
pub use transfer::{push_to_destinations, transfer_directory, TransferOptions};
