//! Shared store for the camshaft workflow engine.
//!
//! Workers and coordinators share no memory; every piece of cross-process
//! coordination (run documents, ready queues, locks, leases, event streams)
//! goes through the [`StoreBackend`] seam defined here. Two implementations
//! are provided:
//!
//! - [`MemoryStore`]: in-process, used by tests and single-process embedding
//! - [`RedisStore`]: the production backend over a Redis connection manager

pub mod backend;
pub mod envelope;
pub mod keys;
pub mod memory;
pub mod redis;

pub use backend::{ScoredMember, StoreBackend, StoreError, StreamEntry};
pub use envelope::{CURRENT_VERSION, Envelope, EnvelopeError, RawEnvelope};
pub use memory::MemoryStore;
pub use redis::RedisStore;
