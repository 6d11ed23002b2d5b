//! Shared types and wire format for cipd packages.
//!
//! Everything in this crate is pure data: the manifest embedded in every
//! package, the instance identifier, and the PEM-framed signature blocks
//! appended after the archive payload. Building, reading and deploying live
//! in `cipd-core`.

pub mod instance;
pub mod manifest;
pub mod pem_block;
pub mod signature;

// Re-exports
pub use instance::{InstanceId, InvalidInstanceId};
pub use manifest::*;
pub use signature::*;
