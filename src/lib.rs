//! arkflow — a persistent archival workflow engine.
//!
//! Workflows are forests of [`records::StepRecord`] and
//! [`records::TaskRecord`] rows. The planner walks a tree into a
//! CHAIN/GROUP [`engine::Plan`], a dispatcher runs it (inline or through
//! worker pools), and every attempt is persisted so progress, status and
//! causal history survive restarts. Undo and retry are first-class: they
//! create mirror records instead of mutating terminal state.

pub mod api;
pub mod cli;
pub mod engine;
pub mod records;
pub mod tasks;

pub use engine::{EngineConfig, LifecycleMode, TaskStatus, WorkflowEngine};
pub use records::{Node, RecordStore, StepRecord, TaskRecord};
pub use tasks::{TaskHandler, TaskRegistry};
