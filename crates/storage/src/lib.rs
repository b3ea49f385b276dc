//! Checkpoint persistence for harvester runs.
//!
//! This crate provides a trait-based storage interface for the list of
//! finished checkpoint ids, with a JSON file and an in-memory backend.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_storage;
pub mod memory;

pub use trait_::{CheckpointStorage, StorageError, Result};
pub use json_storage::JsonCheckpointFile;
pub use memory::MemoryCheckpointStorage;
