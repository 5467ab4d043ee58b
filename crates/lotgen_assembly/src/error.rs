//! Error types for mesh assembly.

use lotgen_core::PrototypeId;
use thiserror::Error;

/// Result type for assembly operations.
pub type AssemblyResult<T> = Result<T, AssemblyError>;

/// Errors raised while turning a result into host objects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    /// The host factory refused to create an object.
    #[error("factory could not create {what}: {reason}")]
    Factory {
        /// Kind of object.
        what: &'static str,
        /// Host-provided reason.
        reason: String,
    },

    /// A face or override points past the material table.
    #[error("material {material} out of range, table has {available}")]
    MissingMaterial {
        /// Requested index.
        material: u32,
        /// Table size.
        available: usize,
    },

    /// A face corner points past the vertex buffer.
    #[error("vertex index {index} out of range for {vertices} vertices")]
    IndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Vertex count.
        vertices: usize,
    },

    /// An instance names a prototype the result does not contain.
    #[error("unknown prototype {0}")]
    UnknownPrototype(PrototypeId),

    /// An instance transform collapses an axis.
    #[error("instance transform is singular")]
    SingularTransform,
}
