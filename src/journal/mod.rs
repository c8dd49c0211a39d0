//! Durable run state: the hash-chained chronolog and the checkpoint store.

pub mod checkpoint;
pub mod chronolog;

pub use checkpoint::{
    CheckpointRecord, CheckpointStatus, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use chronolog::{verify_chain, Chronolog, ChronologEntry, ChronologEvent, GENESIS_HASH};
