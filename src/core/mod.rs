//! Core domain models for sift runs.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: plans, tasks, the execution DAG and content-addressed
//! artifacts.

pub mod artifact;
pub mod dag;
pub mod plan;
pub mod task;

pub use artifact::{content_hash, ArtifactStore, FileArtifactStore, MemoryArtifactStore};
pub use dag::TaskDAG;
pub use plan::{Plan, TaskConfig, TaskSpec};
pub use task::{Task, TaskId, TaskStatus, TaskType};
