//! # Service Collaborators
//!
//! Interfaces to services consumed by packet handlers.

pub mod identity;

pub use identity::{IdentityService, MemoryDirectory};
