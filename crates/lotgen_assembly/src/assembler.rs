//! Turns a [`GenerationResult`] into host objects.
//!
//! The main mesh becomes one static mesh with a section per material.
//! Instances become one instanced component per prototype and override
//! set, sharing prototype meshes by URI.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lotgen_core::{GenerationResult, MaterialAttributes, MeshBuffers, PrototypeId};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{AssemblyError, AssemblyResult};
use crate::factory::{MeshData, MeshFactory, MeshSection, MeshVertex};
use crate::transform::{decompose, AssemblyConfig, Decomposed};

// =============================================================================
// PROTOTYPE CACHE
// =============================================================================

/// Prototype meshes by URI, shared between assemblers.
///
/// Prototypes without a URI are never cached.
pub struct PrototypeCache<M> {
    meshes: Mutex<HashMap<String, M>>,
}

impl<M> Default for PrototypeCache<M> {
    fn default() -> Self {
        Self {
            meshes: Mutex::new(HashMap::new()),
        }
    }
}

impl<M: Clone> PrototypeCache<M> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mesh stored under `uri`.
    #[must_use]
    pub fn get(&self, uri: &str) -> Option<M> {
        self.meshes.lock().get(uri).cloned()
    }

    /// Stores `mesh` unless another mesh got there first, and returns
    /// whichever is cached.
    pub fn insert_or_get(&self, uri: &str, mesh: M) -> M {
        self.meshes.lock().entry(uri.to_owned()).or_insert(mesh).clone()
    }

    /// Number of cached meshes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.meshes.lock().len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meshes.lock().is_empty()
    }

    /// Drops every cached mesh.
    pub fn clear(&self) {
        self.meshes.lock().clear();
    }
}

// =============================================================================
// OUTPUT
// =============================================================================

/// Counters for one [`MeshAssembler::assemble`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    /// Triangles in the static mesh.
    pub triangles: usize,
    /// Sections in the static mesh.
    pub sections: usize,
    /// Materials the factory created.
    pub materials_created: usize,
    /// Materials served from the assembler's cache.
    pub materials_reused: usize,
    /// Prototype meshes the factory created.
    pub prototype_meshes_created: usize,
    /// Prototype meshes served from the prototype cache.
    pub prototype_meshes_reused: usize,
    /// Instanced components created.
    pub components: usize,
    /// Instances across all components.
    pub instances: usize,
}

/// Host objects built from one result.
pub struct AssembledModel<F: MeshFactory> {
    /// Static mesh, absent when the result has no faces.
    pub mesh: Option<F::Mesh>,
    /// Host material for every entry of the result's material table.
    pub materials: Vec<F::Material>,
    /// One component per prototype and override set.
    pub components: Vec<F::Component>,
    /// Counters.
    pub stats: AssemblyStats,
}

// =============================================================================
// ASSEMBLER
// =============================================================================

/// Drives a [`MeshFactory`] from generation results.
pub struct MeshAssembler<F: MeshFactory> {
    factory: F,
    config: AssemblyConfig,
    prototypes: Arc<PrototypeCache<F::Mesh>>,
    materials: HashMap<MaterialAttributes, F::Material>,
}

impl<F: MeshFactory> MeshAssembler<F> {
    /// Creates an assembler with its own prototype cache.
    pub fn new(factory: F, config: AssemblyConfig) -> Self {
        Self::with_prototype_cache(factory, config, Arc::new(PrototypeCache::default()))
    }

    /// Creates an assembler sharing `prototypes` with others.
    pub fn with_prototype_cache(factory: F, config: AssemblyConfig, prototypes: Arc<PrototypeCache<F::Mesh>>) -> Self {
        Self {
            factory,
            config,
            prototypes,
            materials: HashMap::new(),
        }
    }

    /// The factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// The factory, mutably.
    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }

    /// Consumes the assembler.
    pub fn into_factory(self) -> F {
        self.factory
    }

    /// Coordinate conversion in use.
    pub const fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// The prototype cache.
    pub fn prototype_cache(&self) -> &Arc<PrototypeCache<F::Mesh>> {
        &self.prototypes
    }

    /// Forgets cached materials and prototype meshes.
    pub fn clear_caches(&mut self) {
        self.materials.clear();
        self.prototypes.clear();
    }

    /// Builds host objects for `result`.
    ///
    /// # Errors
    ///
    /// - `MissingMaterial` / `IndexOutOfRange` for inconsistent buffers
    /// - `UnknownPrototype` for an instance without a prototype
    /// - `SingularTransform` for a collapsed instance transform
    /// - `Factory` for anything the host rejects
    pub fn assemble(&mut self, result: &GenerationResult) -> AssemblyResult<AssembledModel<F>> {
        let mut stats = AssemblyStats::default();

        let mut materials = Vec::with_capacity(result.materials().len());
        for material in result.materials() {
            materials.push(self.material(material, &mut stats)?);
        }

        let mesh = if result.mesh().faces.is_empty() {
            None
        } else {
            let data = build_mesh_data("model", result.mesh(), materials.len(), &self.config)?;
            stats.triangles = data.triangle_count();
            stats.sections = data.sections.len();
            let section_materials = section_materials(&data, &materials);
            Some(self.factory.create_static_mesh(&data, &section_materials)?)
        };

        let components = self.assemble_instances(result, &materials, &mut stats)?;

        debug!(
            triangles = stats.triangles,
            sections = stats.sections,
            components = stats.components,
            instances = stats.instances,
            "assembled generation result"
        );

        Ok(AssembledModel {
            mesh,
            materials,
            components,
            stats,
        })
    }

    fn material(&mut self, material: &MaterialAttributes, stats: &mut AssemblyStats) -> AssemblyResult<F::Material> {
        if let Some(existing) = self.materials.get(material) {
            stats.materials_reused += 1;
            return Ok(existing.clone());
        }
        let created = self.factory.create_material(material)?;
        self.materials.insert(material.clone(), created.clone());
        stats.materials_created += 1;
        Ok(created)
    }

    fn assemble_instances(
        &mut self,
        result: &GenerationResult,
        materials: &[F::Material],
        stats: &mut AssemblyStats,
    ) -> AssemblyResult<Vec<F::Component>> {
        // (prototype, overrides) -> transforms, in first-appearance order
        let mut groups: Vec<((PrototypeId, &[u32]), Vec<Decomposed>)> = Vec::new();
        let mut group_index: HashMap<(PrototypeId, &[u32]), usize> = HashMap::new();

        for instance in result.instances() {
            let key = (instance.prototype, instance.material_overrides.as_slice());
            let transform = self.config.transform(decompose(&instance.transform)?);
            match group_index.get(&key) {
                Some(&i) => groups[i].1.push(transform),
                None => {
                    group_index.insert(key, groups.len());
                    groups.push((key, vec![transform]));
                }
            }
        }

        let mut components = Vec::with_capacity(groups.len());
        for ((id, overrides), transforms) in groups {
            let prototype = result.prototypes().get(&id).ok_or(AssemblyError::UnknownPrototype(id))?;
            if prototype.mesh.faces.is_empty() {
                debug!(prototype = %id, uri = %prototype.uri, "skipping instances of empty prototype");
                continue;
            }

            let cached = if prototype.uri.is_empty() {
                None
            } else {
                self.prototypes.get(&prototype.uri)
            };
            let mesh = match cached {
                Some(mesh) => {
                    stats.prototype_meshes_reused += 1;
                    mesh
                }
                None => {
                    let data = build_mesh_data(&prototype.name, &prototype.mesh, materials.len(), &self.config)?;
                    let mesh = self.factory.create_static_mesh(&data, &section_materials(&data, materials))?;
                    stats.prototype_meshes_created += 1;
                    if prototype.uri.is_empty() {
                        mesh
                    } else {
                        self.prototypes.insert_or_get(&prototype.uri, mesh)
                    }
                }
            };

            let override_materials = overrides
                .iter()
                .map(|&index| {
                    materials.get(index as usize).cloned().ok_or(AssemblyError::MissingMaterial {
                        material: index,
                        available: materials.len(),
                    })
                })
                .collect::<AssemblyResult<Vec<_>>>()?;

            stats.instances += transforms.len();
            components.push(self.factory.create_instanced_component(&mesh, &override_materials, &transforms)?);
        }
        stats.components = components.len();
        Ok(components)
    }
}

fn section_materials<M: Clone>(data: &MeshData, materials: &[M]) -> Vec<M> {
    // Sections were validated against the same table.
    data.sections
        .iter()
        .filter_map(|s| materials.get(s.material as usize).cloned())
        .collect()
}

/// Converts and triangulates `buffers`, one section per material in
/// ascending material order.
///
/// # Errors
///
/// `MissingMaterial` or `IndexOutOfRange` when the buffers are inconsistent.
pub fn build_mesh_data(
    name: &str,
    buffers: &MeshBuffers,
    material_count: usize,
    config: &AssemblyConfig,
) -> AssemblyResult<MeshData> {
    let vertex_count = buffers.positions.len();
    let uvs = buffers.uv_sets.first();
    let vertices = buffers
        .positions
        .iter()
        .enumerate()
        .map(|(i, &p)| MeshVertex {
            position: config.position(p),
            normal: config.normal(buffers.normals.get(i).copied().unwrap_or_default()),
            uv: config.uv(uvs.and_then(|set| set.get(i)).copied().unwrap_or_default()),
        })
        .collect();

    let mut by_material: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for face in &buffers.faces {
        if face.material as usize >= material_count {
            return Err(AssemblyError::MissingMaterial {
                material: face.material,
                available: material_count,
            });
        }
        let corners = buffers.face_indices(face);
        if let Some(&bad) = corners.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(AssemblyError::IndexOutOfRange {
                index: bad,
                vertices: vertex_count,
            });
        }
        if corners.len() < 3 {
            continue;
        }
        let triangles = by_material.entry(face.material).or_default();
        for pair in corners[1..].windows(2) {
            triangles.extend_from_slice(&[corners[0], pair[0], pair[1]]);
        }
    }

    let mut indices = Vec::new();
    let mut sections = Vec::with_capacity(by_material.len());
    for (material, triangles) in by_material {
        sections.push(MeshSection {
            material,
            first_index: indices.len() as u32,
            index_count: triangles.len() as u32,
        });
        indices.extend(triangles);
    }

    Ok(MeshData {
        name: name.to_owned(),
        vertices,
        indices,
        sections,
    })
}
