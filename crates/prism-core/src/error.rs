//! Error types for host-side scene data.

use thiserror::Error;

/// Geometry validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    /// Geometry has no triangles.
    #[error("geometry has no primitives")]
    NoPrimitives,

    /// Index count is not a multiple of three.
    #[error("index count {0} is not a multiple of 3")]
    IncompleteTriangle(usize),

    /// An index points past the end of the vertex list.
    #[error("index {index} at position {position} is out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        index: u32,
        position: usize,
        vertex_count: usize,
    },

    /// More vertices or primitives than a 32-bit count can describe.
    #[error("geometry too large: {0}")]
    TooLarge(String),
}

/// Result type alias using [`GeometryError`].
pub type Result<T> = std::result::Result<T, GeometryError>;
