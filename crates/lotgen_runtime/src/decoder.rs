//! # Callback Decoder
//!
//! Accumulates the engine's callback stream into one [`GenerationResult`].
//!
//! A decoder lives for exactly one generate call and is owned by the worker
//! running it. Nothing here is shared or reentrant.
//!
//! ## Geometry
//!
//! - Faces with fewer than 3 corners are skipped (they still count for
//!   face-range addressing)
//! - Corners sharing the same position/normal/UV indices become one vertex
//! - At most [`MAX_UV_SETS`] UV sets are kept
//! - Faces without a material get the default material
//!
//! ## Protocol Violations
//!
//! A material for a face range that was never emitted, or indices pointing
//! outside their arrays, fail the whole call with `GenerationError::Engine`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lotgen_core::{
    AttributeValue, Diagnostic, DiagnosticSource, Face, GenerationError, GenerationOptions, GenerationResult,
    InstancePlacement, LotgenResult, MaterialAttributes, MeshBuffers, OutputMode, Prototype, PrototypeId,
    ReportEntry, ReportValue, ReportVerbosity, Severity,
};

use crate::engine::{GenerationCallbacks, InstanceEmission, MeshEmission};
use crate::log::{EngineLog, LogLevel};

/// Maximum UV sets per mesh.
pub const MAX_UV_SETS: usize = 8;

const UNASSIGNED: u32 = u32::MAX;
const NO_INDEX: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Main,
    Prototype(PrototypeId),
}

#[derive(Clone, Copy, Debug)]
struct FaceRef {
    target: Target,
    face: usize,
}

#[derive(Default)]
struct MeshBuilder {
    positions: Vec<[f64; 3]>,
    normals: Vec<[f64; 3]>,
    uv_sets: Vec<Vec<[f64; 2]>>,
    indices: Vec<u32>,
    faces: Vec<Face>,
}

impl MeshBuilder {
    fn push_vertex(&mut self, position: [f64; 3], normal: [f64; 3], uvs: &[[f64; 2]]) -> u32 {
        let index = self.positions.len();
        while self.uv_sets.len() < uvs.len() {
            self.uv_sets.push(vec![[0.0, 0.0]; index]);
        }
        self.positions.push(position);
        self.normals.push(normal);
        for (set, uv) in self.uv_sets.iter_mut().enumerate() {
            uv.push(uvs.get(set).copied().unwrap_or([0.0, 0.0]));
        }
        index as u32
    }

    fn has_unassigned(&self) -> bool {
        self.faces.iter().any(|f| f.material == UNASSIGNED)
    }

    fn finish(mut self, default_material: u32) -> MeshBuffers {
        for face in &mut self.faces {
            if face.material == UNASSIGNED {
                face.material = default_material;
            }
        }
        MeshBuffers {
            positions: self.positions,
            normals: self.normals,
            uv_sets: self.uv_sets,
            indices: self.indices,
            faces: self.faces,
        }
    }
}

struct PrototypeBuilder {
    name: String,
    uri: String,
    mesh: MeshBuilder,
}

/// Decoder statistics for one call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Faces dropped for having fewer than 3 corners.
    pub skipped_faces: usize,
    /// Instances dropped for referencing an unknown prototype.
    pub dropped_instances: usize,
    /// UV sets dropped beyond the limit.
    pub dropped_uv_sets: usize,
    /// Prototype emissions folded into an earlier prototype with the same URI.
    pub reused_prototypes: usize,
}

/// Builder turning engine callbacks into a [`GenerationResult`].
pub struct CallbackDecoder {
    options: GenerationOptions,
    log: Option<Arc<EngineLog>>,
    main: MeshBuilder,
    prototypes: BTreeMap<PrototypeId, PrototypeBuilder>,
    prototype_by_uri: HashMap<String, PrototypeId>,
    prototype_alias: HashMap<PrototypeId, PrototypeId>,
    nodes: HashMap<u64, Vec<Option<FaceRef>>>,
    materials: Vec<MaterialAttributes>,
    material_index: HashMap<MaterialAttributes, u32>,
    instances: Vec<InstancePlacement>,
    reports: Vec<ReportEntry>,
    evaluated: Vec<(String, AttributeValue)>,
    generate_errors: Vec<String>,
    violation: Option<String>,
    stats: DecodeStats,
}

impl CallbackDecoder {
    /// Decoder for one call with the given options.
    #[must_use]
    pub fn new(options: GenerationOptions) -> Self {
        Self {
            options,
            log: None,
            main: MeshBuilder::default(),
            prototypes: BTreeMap::new(),
            prototype_by_uri: HashMap::new(),
            prototype_alias: HashMap::new(),
            nodes: HashMap::new(),
            materials: Vec::new(),
            material_index: HashMap::new(),
            instances: Vec::new(),
            reports: Vec::new(),
            evaluated: Vec::new(),
            generate_errors: Vec::new(),
            violation: None,
            stats: DecodeStats::default(),
        }
    }

    /// Routes engine log lines into `log`.
    #[must_use]
    pub fn with_log(mut self, log: Arc<EngineLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// `generate_error` messages seen so far.
    #[must_use]
    pub fn generate_errors(&self) -> &[String] {
        &self.generate_errors
    }

    /// Counters for this call.
    #[must_use]
    pub const fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Finishes decoding.
    ///
    /// # Errors
    ///
    /// `Engine` if the engine violated the emission protocol.
    pub fn finish(mut self) -> LotgenResult<GenerationResult> {
        if let Some(diagnostic) = self.violation.take() {
            return Err(GenerationError::Engine { diagnostic });
        }

        let needs_default =
            self.main.has_unassigned() || self.prototypes.values().any(|p| p.mesh.has_unassigned());
        let default_material = if needs_default {
            self.intern_material(MaterialAttributes {
                name: "default".into(),
                ..MaterialAttributes::default()
            })
        } else {
            UNASSIGNED
        };

        let prototypes = std::mem::take(&mut self.prototypes)
            .into_iter()
            .map(|(id, p)| {
                (
                    id,
                    Prototype {
                        name: p.name,
                        uri: p.uri,
                        mesh: p.mesh.finish(default_material),
                    },
                )
            })
            .collect();

        if self.stats != DecodeStats::default() {
            tracing::debug!(
                skipped_faces = self.stats.skipped_faces,
                dropped_instances = self.stats.dropped_instances,
                dropped_uv_sets = self.stats.dropped_uv_sets,
                reused_prototypes = self.stats.reused_prototypes,
                "decoded with adjustments"
            );
        }

        Ok(GenerationResult::new(
            std::mem::take(&mut self.main).finish(default_material),
            self.materials,
            prototypes,
            self.instances,
            self.reports,
            self.evaluated,
        ))
    }

    fn geometry_enabled(&self) -> bool {
        self.options.output == OutputMode::Geometry
    }

    fn keeps(&self, level: ReportVerbosity) -> bool {
        self.options.report_verbosity >= level
    }

    fn violate(&mut self, message: String) {
        tracing::warn!(reason = %message, "engine protocol violation");
        if self.violation.is_none() {
            self.violation = Some(message);
        }
    }

    fn intern_material(&mut self, material: MaterialAttributes) -> u32 {
        if let Some(&index) = self.material_index.get(&material) {
            return index;
        }
        let index = self.materials.len() as u32;
        self.material_index.insert(material.clone(), index);
        self.materials.push(material);
        index
    }

    fn builder(&mut self, target: Target) -> Option<&mut MeshBuilder> {
        match target {
            Target::Main => Some(&mut self.main),
            Target::Prototype(id) => self.prototypes.get_mut(&id).map(|p| &mut p.mesh),
        }
    }

    fn check_mesh(mesh: &MeshEmission) -> Result<(), String> {
        let corners: usize = mesh.face_counts.iter().map(|&c| c as usize).sum();
        if mesh.vertex_indices.len() != corners {
            return Err(format!(
                "node {} lists {} corners but {} vertex indices",
                mesh.node,
                corners,
                mesh.vertex_indices.len()
            ));
        }
        if !mesh.normal_indices.is_empty() && mesh.normal_indices.len() != corners {
            return Err(format!("node {} has {} normal indices for {corners} corners", mesh.node, mesh.normal_indices.len()));
        }
        let vertex_count = mesh.vertices.len() / 3;
        if let Some(&bad) = mesh.vertex_indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(format!("node {} references vertex {bad} of {vertex_count}", mesh.node));
        }
        let normal_count = mesh.normals.len() / 3;
        if let Some(&bad) = mesh.normal_indices.iter().find(|&&i| i as usize >= normal_count) {
            return Err(format!("node {} references normal {bad} of {normal_count}", mesh.node));
        }
        for (set, uv) in mesh.uv_sets.iter().enumerate().take(MAX_UV_SETS) {
            if !uv.indices.is_empty() && uv.indices.len() != corners {
                return Err(format!("node {} uv set {set} has {} indices for {corners} corners", mesh.node, uv.indices.len()));
            }
            let uv_count = uv.coords.len() / 2;
            if let Some(&bad) = uv.indices.iter().find(|&&i| i as usize >= uv_count) {
                return Err(format!("node {} uv set {set} references coordinate {bad} of {uv_count}", mesh.node));
            }
        }
        Ok(())
    }

    fn resolve_target(&mut self, mesh: &MeshEmission) -> Option<Target> {
        let Some(id) = mesh.prototype else {
            return Some(Target::Main);
        };
        if let Some(uri) = &mesh.uri {
            if let Some(&existing) = self.prototype_by_uri.get(uri) {
                if existing != id {
                    self.prototype_alias.insert(id, existing);
                    self.stats.reused_prototypes += 1;
                    return None;
                }
            } else {
                self.prototype_by_uri.insert(uri.clone(), id);
            }
        }
        self.prototypes.entry(id).or_insert_with(|| PrototypeBuilder {
            name: mesh.name.clone(),
            uri: mesh.uri.clone().unwrap_or_default(),
            mesh: MeshBuilder::default(),
        });
        Some(Target::Prototype(id))
    }
}

fn flat_normal(mesh: &MeshEmission, corners: &[u32]) -> [f64; 3] {
    let point = |i: u32| {
        let i = i as usize * 3;
        [mesh.vertices[i], mesh.vertices[i + 1], mesh.vertices[i + 2]]
    };
    let mut n = [0.0_f64; 3];
    for (k, &a) in corners.iter().enumerate() {
        let (a, b) = (point(a), point(corners[(k + 1) % corners.len()]));
        n[0] += (a[1] - b[1]) * (a[2] + b[2]);
        n[1] += (a[2] - b[2]) * (a[0] + b[0]);
        n[2] += (a[0] - b[0]) * (a[1] + b[1]);
    }
    let length = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    if length > 0.0 {
        [n[0] / length, n[1] / length, n[2] / length]
    } else {
        n
    }
}

impl GenerationCallbacks for CallbackDecoder {
    fn add_mesh(&mut self, mesh: MeshEmission) {
        if !self.geometry_enabled() {
            return;
        }
        if let Err(message) = Self::check_mesh(&mesh) {
            self.violate(message);
            return;
        }
        if mesh.uv_sets.len() > MAX_UV_SETS {
            tracing::warn!(node = mesh.node, sets = mesh.uv_sets.len(), "dropping uv sets beyond {MAX_UV_SETS}");
            self.stats.dropped_uv_sets += mesh.uv_sets.len() - MAX_UV_SETS;
        }
        let uv_sets = &mesh.uv_sets[..mesh.uv_sets.len().min(MAX_UV_SETS)];

        let target = self.resolve_target(&mesh);
        let mut refs = Vec::with_capacity(mesh.face_counts.len());
        let mut corner_map: HashMap<Vec<u32>, u32> = HashMap::new();
        let mut skipped = 0;
        let mut offset = 0usize;

        for (face_index, &count) in mesh.face_counts.iter().enumerate() {
            let count = count as usize;
            let corners = offset..offset + count;
            offset += count;

            let Some(target) = target else {
                refs.push(None);
                continue;
            };
            if count < 3 {
                skipped += 1;
                refs.push(None);
                continue;
            }

            let flat = mesh
                .normal_indices
                .is_empty()
                .then(|| flat_normal(&mesh, &mesh.vertex_indices[corners.clone()]));
            let Some(builder) = self.builder(target) else {
                refs.push(None);
                continue;
            };

            let first_index = builder.indices.len() as u32;
            for corner in corners {
                let vi = mesh.vertex_indices[corner];
                let mut key = Vec::with_capacity(3 + uv_sets.len());
                key.push(vi);
                match flat {
                    Some(_) => {
                        key.push(NO_INDEX);
                        key.push(face_index as u32);
                    }
                    None => {
                        key.push(mesh.normal_indices[corner]);
                        key.push(NO_INDEX);
                    }
                }
                key.extend(uv_sets.iter().map(|s| s.indices.get(corner).copied().unwrap_or(NO_INDEX)));

                let vertex = *corner_map.entry(key).or_insert_with(|| {
                    let p = vi as usize * 3;
                    let position = [mesh.vertices[p], mesh.vertices[p + 1], mesh.vertices[p + 2]];
                    let normal = flat.unwrap_or_else(|| {
                        let n = mesh.normal_indices[corner] as usize * 3;
                        [mesh.normals[n], mesh.normals[n + 1], mesh.normals[n + 2]]
                    });
                    let uvs: Vec<[f64; 2]> = uv_sets
                        .iter()
                        .map(|s| match s.indices.get(corner) {
                            Some(&i) => [s.coords[i as usize * 2], s.coords[i as usize * 2 + 1]],
                            None => [0.0, 0.0],
                        })
                        .collect();
                    builder.push_vertex(position, normal, &uvs)
                });
                builder.indices.push(vertex);
            }
            refs.push(Some(FaceRef {
                target,
                face: builder.faces.len(),
            }));
            builder.faces.push(Face {
                first_index,
                vertex_count: count as u32,
                material: UNASSIGNED,
            });
        }

        self.stats.skipped_faces += skipped;
        self.nodes.entry(mesh.node).or_default().extend(refs);
    }

    fn assign_material(&mut self, node: u64, first_face: u32, face_count: u32, material: &[(String, AttributeValue)]) {
        if !self.geometry_enabled() {
            return;
        }
        let emitted = match self.nodes.get(&node) {
            Some(faces) => faces.len(),
            None => {
                self.violate(format!("material for node {node} before any of its geometry"));
                return;
            }
        };
        let start = first_face as usize;
        let end = start + face_count as usize;
        if end > emitted {
            self.violate(format!(
                "material for faces {start}..{end} of node {node}, only {emitted} faces emitted"
            ));
            return;
        }

        let index = self.intern_material(MaterialAttributes::from_raw(material.iter().map(|(k, v)| (k.as_str(), v))));
        let refs: Vec<FaceRef> = self.nodes[&node][start..end].iter().flatten().copied().collect();
        for face_ref in refs {
            if let Some(builder) = self.builder(face_ref.target) {
                builder.faces[face_ref.face].material = index;
            }
        }
    }

    fn add_instance(&mut self, instance: InstanceEmission) {
        if !self.geometry_enabled() {
            return;
        }
        let prototype = self
            .prototype_alias
            .get(&instance.prototype)
            .copied()
            .unwrap_or(instance.prototype);
        if !self.prototypes.contains_key(&prototype) {
            tracing::warn!(%prototype, "instance of unknown prototype dropped");
            self.stats.dropped_instances += 1;
            return;
        }
        let material_overrides = instance
            .material_overrides
            .iter()
            .map(|raw| self.intern_material(MaterialAttributes::from_raw(raw.iter().map(|(k, v)| (k.as_str(), v)))))
            .collect();
        self.instances.push(InstancePlacement {
            prototype,
            transform: instance.transform,
            material_overrides,
        });
    }

    fn report_bool(&mut self, _node: u64, key: &str, value: bool) {
        if self.keeps(ReportVerbosity::Values) {
            self.reports.push(ReportEntry::Value {
                key: key.to_owned(),
                value: ReportValue::Bool(value),
            });
        }
    }

    fn report_float(&mut self, _node: u64, key: &str, value: f64) {
        if self.keeps(ReportVerbosity::Values) {
            self.reports.push(ReportEntry::Value {
                key: key.to_owned(),
                value: ReportValue::Float(value),
            });
        }
    }

    fn report_string(&mut self, _node: u64, key: &str, value: &str) {
        if self.keeps(ReportVerbosity::Values) {
            self.reports.push(ReportEntry::Value {
                key: key.to_owned(),
                value: ReportValue::String(value.to_owned()),
            });
        }
    }

    fn print(&mut self, _node: u64, text: &str) {
        if self.keeps(ReportVerbosity::All) {
            self.reports.push(ReportEntry::Print { text: text.to_owned() });
        }
    }

    fn cga_error(&mut self, node: u64, severity: Severity, method_id: i32, pc: i32, message: &str) {
        tracing::debug!(node, ?severity, method_id, pc, text = message, "rule diagnostic");
        if self.keeps(ReportVerbosity::Diagnostics) {
            self.reports.push(ReportEntry::Diagnostic(Diagnostic {
                severity,
                source: DiagnosticSource::Rule,
                message: message.to_owned(),
                shape_id: Some(node),
                method_id: Some(method_id),
                pc: Some(pc),
                uri: None,
            }));
        }
    }

    fn asset_error(&mut self, node: u64, severity: Severity, key: &str, uri: &str, message: &str) {
        tracing::debug!(node, ?severity, key, uri, text = message, "asset diagnostic");
        if self.keeps(ReportVerbosity::Diagnostics) {
            self.reports.push(ReportEntry::Diagnostic(Diagnostic {
                severity,
                source: DiagnosticSource::Asset,
                message: format!("{key}: {message}"),
                shape_id: Some(node),
                method_id: None,
                pc: None,
                uri: Some(uri.to_owned()),
            }));
        }
    }

    fn generate_error(&mut self, node: u64, message: &str) {
        self.generate_errors.push(message.to_owned());
        if self.keeps(ReportVerbosity::Diagnostics) {
            self.reports.push(ReportEntry::Diagnostic(Diagnostic {
                severity: Severity::Error,
                source: DiagnosticSource::Generate,
                message: message.to_owned(),
                shape_id: Some(node),
                method_id: None,
                pc: None,
                uri: None,
            }));
        }
    }

    fn evaluated_attribute(&mut self, _node: u64, key: &str, value: AttributeValue) {
        self.evaluated.push((key.to_owned(), value));
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        match &self.log {
            Some(log) => log.record(level, message),
            None => tracing::debug!(%level, line = message, "engine log"),
        }
    }
}
