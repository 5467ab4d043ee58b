//! # Generation Error Types
//!
//! All errors that can surface from a generation request.
//!
//! Validation errors (`InvalidShape`, `AttributeTypeMismatch`) are raised
//! before anything is queued. Everything else travels through the same
//! future as a successful result.

use std::time::Duration;

use thiserror::Error;

use crate::attributes::AttributeType;

/// Why an initial shape was rejected.
///
/// Ring index `0` is the outer ring, holes follow in insertion order.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    /// A coordinate is NaN or infinite.
    #[error("ring {ring} point {point} has a non-finite coordinate")]
    NonFinite {
        /// Offending ring.
        ring: usize,
        /// Index of the point in the ring as given.
        point: usize,
    },

    /// A ring has fewer than three distinct points.
    #[error("ring {ring} has {points} distinct points, at least 3 required")]
    TooFewPoints {
        /// Offending ring.
        ring: usize,
        /// Number of distinct points found.
        points: usize,
    },

    /// A ring encloses (almost) no area.
    #[error("ring {ring} is degenerate (zero area)")]
    Degenerate {
        /// Offending ring.
        ring: usize,
    },

    /// Two non-adjacent edges of a ring cross or touch.
    #[error("ring {ring} self-intersects between edges {first_edge} and {second_edge}")]
    SelfIntersecting {
        /// Offending ring.
        ring: usize,
        /// Index of the first edge (edge `i` runs from point `i` to `i + 1`).
        first_edge: usize,
        /// Index of the second edge.
        second_edge: usize,
    },

    /// A point lies too far from the plane of the outer ring.
    #[error("ring {ring} is not coplanar with the outer ring (deviation {deviation})")]
    NonPlanar {
        /// Offending ring.
        ring: usize,
        /// Largest distance from the reference plane.
        deviation: f64,
    },

    /// A hole is not strictly inside the outer ring.
    #[error("hole ring {ring} is not inside the outer ring")]
    HoleOutside {
        /// Offending ring (1 for the first hole).
        ring: usize,
    },
}

/// Errors that can occur anywhere in the generation pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// Bad input geometry. Caller's fault, never retried.
    #[error("invalid initial shape: {0}")]
    InvalidShape(#[from] ShapeError),

    /// The rule package is missing or failed to load.
    #[error("rule package '{package}' failed to load: {reason}")]
    RuleLoad {
        /// Package identifier.
        package: String,
        /// Loader diagnostic.
        reason: String,
    },

    /// The procedural engine reported an internal failure.
    #[error("procedural engine failure: {diagnostic}")]
    Engine {
        /// Raw diagnostic text from the engine.
        diagnostic: String,
    },

    /// The request deadline passed before a result was delivered.
    ///
    /// The native call may still complete and populate the cache.
    #[error("generation timed out after {after:?}")]
    Timeout {
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// Scheduler backpressure. Retry with backoff.
    #[error("generation queue is saturated, try again")]
    Overloaded,

    /// An override disagrees with the type of the package default.
    #[error("attribute '{name}' expects {expected} but got {found}")]
    AttributeTypeMismatch {
        /// Attribute name.
        name: String,
        /// Type declared by the package default.
        expected: AttributeType,
        /// Type of the rejected override.
        found: AttributeType,
    },

    /// The caller cancelled its handle before a result was delivered.
    #[error("generation cancelled")]
    Cancelled,

    /// The scheduler shut down before the request ran.
    #[error("generation scheduler is shut down")]
    Shutdown,
}

impl GenerationError {
    /// Returns true for errors detected before dispatch.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidShape(_) | Self::AttributeTypeMismatch { .. })
    }

    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Engine { .. } | Self::Timeout { .. } | Self::Overloaded)
    }
}

/// Result type for generation operations.
pub type LotgenResult<T> = Result<T, GenerationError>;
