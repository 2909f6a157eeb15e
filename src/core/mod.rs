//! Core types for the mesh
//!
//! - `MeshError` / `MeshResult` - Error types
//! - `time` - Age and cutoff arithmetic

pub mod error;
pub mod time;

pub use error::{MeshError, MeshResult};
