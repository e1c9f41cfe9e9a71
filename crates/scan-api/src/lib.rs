//! Backend data model and client abstraction consumed by the scan orchestrator.
//!
//! The orchestrator never talks to a concrete transport. Every backend call goes
//! through [`BackendClient`], which is implemented here by [`MemoryBackend`]
//! (used by tests and by the local dry-run binary).
//!
//! List calls accept OData-style filter strings. The [`filter`] module renders
//! them from a typed builder and parses/evaluates them for the memory backend.

pub mod client;
pub mod error;
pub mod filter;
pub mod memory;
pub mod models;

pub use client::{BackendClient, ListParams, ListResponse};
pub use error::{ApiError, Result};
pub use memory::{MemoryBackend, Snapshot};
