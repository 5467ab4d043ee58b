//! # LOTGEN Assembly
//!
//! Builds host meshes from generation results.
//!
//! ## Architecture
//!
//! ```text
//!   Arc<GenerationResult>
//!        │
//!        ▼
//!   MeshAssembler::assemble
//!        ├── materials ──────────> MeshFactory::create_material      (cached by value)
//!        ├── faces ── fan ──> MeshData ──> create_static_mesh         (one section per material)
//!        └── instances ── group by (prototype, overrides)
//!                 ├── prototype mesh ──> create_static_mesh           (cached by URI)
//!                 └── decompose ──> create_instanced_component
//! ```
//!
//! ## Design Principles
//!
//! 1. **Host owns the objects** - The assembler only keeps cloned handles
//! 2. **Convert once** - Axis, units and V flip are applied while packing vertices
//! 3. **Share prototypes** - Same URI, same mesh, across results and assemblers

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod assembler;
pub mod error;
pub mod factory;
pub mod transform;

pub use assembler::{build_mesh_data, AssembledModel, AssemblyStats, MeshAssembler, PrototypeCache};
pub use error::{AssemblyError, AssemblyResult};
pub use factory::{MeshData, MeshFactory, MeshSection, MeshVertex};
pub use transform::{decompose, AssemblyConfig, AxisConvention, Decomposed};
