//! The host side of assembly.
//!
//! A host implements [`MeshFactory`] once for its renderer or engine. The
//! assembler hands it triangulated, converted data and keeps whatever
//! handles it returns.

use bytemuck::{Pod, Zeroable};
use lotgen_core::MaterialAttributes;

use crate::error::AssemblyResult;
use crate::transform::Decomposed;

// =============================================================================
// VERTEX FORMAT
// =============================================================================

/// Interleaved vertex, ready for upload.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    /// Position in host space.
    pub position: [f32; 3],
    /// Unit normal in host space.
    pub normal: [f32; 3],
    /// First UV set.
    pub uv: [f32; 2],
}

impl MeshVertex {
    /// Raw bytes of a vertex slice.
    #[must_use]
    pub fn as_bytes(vertices: &[Self]) -> &[u8] {
        bytemuck::cast_slice(vertices)
    }
}

// =============================================================================
// MESH DATA
// =============================================================================

/// Triangles of one material.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshSection {
    /// Index into the result's material table.
    pub material: u32,
    /// First index in [`MeshData::indices`].
    pub first_index: u32,
    /// Number of indices, a multiple of 3.
    pub index_count: u32,
}

impl MeshSection {
    /// Triangles in this section.
    #[must_use]
    pub const fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// A triangulated mesh with one section per material.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    /// Debug name.
    pub name: String,
    /// Vertex buffer.
    pub vertices: Vec<MeshVertex>,
    /// Triangle list, grouped by section.
    pub indices: Vec<u32>,
    /// Sections in material order.
    pub sections: Vec<MeshSection>,
}

impl MeshData {
    /// Total triangles.
    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Indices of one section. Empty if the section points past the
    /// index buffer.
    #[must_use]
    pub fn section_indices(&self, section: &MeshSection) -> &[u32] {
        let start = section.first_index as usize;
        let end = start.saturating_add(section.index_count as usize);
        self.indices.get(start..end).unwrap_or(&[])
    }
}

// =============================================================================
// FACTORY
// =============================================================================

/// Constructors the host provides.
pub trait MeshFactory {
    /// Host material handle.
    type Material: Clone;
    /// Host mesh handle.
    type Mesh: Clone;
    /// Host instanced component handle.
    type Component;

    /// Creates a material. Called once per distinct material.
    ///
    /// # Errors
    ///
    /// `Factory` if the host cannot create it.
    fn create_material(&mut self, material: &MaterialAttributes) -> AssemblyResult<Self::Material>;

    /// Creates a static mesh. `materials[i]` belongs to `mesh.sections[i]`.
    ///
    /// # Errors
    ///
    /// `Factory` if the host cannot create it.
    fn create_static_mesh(&mut self, mesh: &MeshData, materials: &[Self::Material]) -> AssemblyResult<Self::Mesh>;

    /// Creates one instanced component placing `mesh` at every transform.
    ///
    /// `overrides[i]` replaces the material of section `i`; sections past
    /// the end keep their own material.
    ///
    /// # Errors
    ///
    /// `Factory` if the host cannot create it.
    fn create_instanced_component(
        &mut self,
        mesh: &Self::Mesh,
        overrides: &[Self::Material],
        transforms: &[Decomposed],
    ) -> AssemblyResult<Self::Component>;
}
