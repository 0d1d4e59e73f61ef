//! Core domain types for the camshaft workflow engine.
//!
//! This crate provides the strongly-typed identifiers shared by every other
//! camshaft crate. Each crate defines its own domain-specific error types
//! in its own error modules.

pub mod id;

pub use id::{JobRunId, ParseIdError, RunId, StepRunId, WorkerId};
