//! # LOTGEN Core
//!
//! Data model of the procedural generation pipeline.
//!
//! ## Design Principles
//!
//! 1. **Typed attributes** - Every rule attribute is a tagged value, overrides are type-checked
//! 2. **Immutable requests** - Shapes are deep-copied into requests, never shared
//! 3. **Stable fingerprints** - The same input hashes to the same key in every process
//! 4. **Write-once results** - Results are built once and shared behind `Arc`
//!
//! ## Example
//!
//! ```rust,ignore
//! use lotgen_core::{AttributeMap, AttributeValue, GenerationOptions, GenerationRequest, InitialShape, Ring};
//!
//! let mut attributes = AttributeMap::from_defaults([("height", AttributeValue::Float(10.0))]);
//! attributes.set_override("height", 5.0)?;
//!
//! let lot = Ring::new([[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [5.0, 10.0, 0.0]]);
//! let shape = InitialShape::new(lot, "simple_extrude", "Default$Lot").with_attributes(attributes);
//! shape.validate()?;
//!
//! let request = GenerationRequest::new(&shape, 42, GenerationOptions::default());
//! println!("cache key {}", request.fingerprint());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod attributes;
pub mod error;
pub mod material;
pub mod request;
pub mod result;
pub mod shape;

pub use attributes::{
    display_name, refers_to, style_of, AttributeDeclaration, AttributeMap, AttributeType, AttributeValue, RuleInfo,
};
pub use error::{GenerationError, LotgenResult, ShapeError};
pub use material::{BlendMode, MaterialAttributes};
pub use request::{Fingerprint, GenerationOptions, GenerationRequest, OutputMode, ReportVerbosity};
pub use result::{
    reports, Diagnostic, DiagnosticSource, Face, GenerationResult, InstancePlacement, MeshBuffers, Prototype,
    PrototypeId, ReportEntry, ReportValue, Severity, IDENTITY_TRANSFORM,
};
pub use shape::{outside_windings, InitialShape, PackageId, Point3, Ring, PLANARITY_TOLERANCE};
