//! # Generation Results
//!
//! Engine-agnostic output of one generation: a polygon mesh, a material
//! table, instanced prototypes and reports.
//!
//! A result is write-once. It is built by the decoder, wrapped in an `Arc`
//! and shared read-only between the cache and every waiter.

use std::collections::BTreeMap;
use std::fmt;

use crate::attributes::AttributeValue;
use crate::material::MaterialAttributes;

/// Column-major identity matrix.
pub const IDENTITY_TRANSFORM: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// One polygon face.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Face {
    /// Offset of the first corner in [`MeshBuffers::indices`].
    pub first_index: u32,
    /// Number of corners (at least 3).
    pub vertex_count: u32,
    /// Index into the material table.
    pub material: u32,
}

/// Indexed polygon mesh with shared vertices.
///
/// `positions`, `normals` and every UV set have one entry per vertex.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshBuffers {
    /// Vertex positions.
    pub positions: Vec<[f64; 3]>,
    /// Vertex normals.
    pub normals: Vec<[f64; 3]>,
    /// Up to eight UV sets.
    pub uv_sets: Vec<Vec<[f64; 2]>>,
    /// Corner → vertex indices, grouped by face.
    pub indices: Vec<u32>,
    /// Faces in emission order.
    pub faces: Vec<Face>,
}

impl MeshBuffers {
    /// No faces.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Number of shared vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Triangles after fan triangulation.
    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.faces.iter().map(|f| (f.vertex_count as usize).saturating_sub(2)).sum()
    }

    /// Vertex indices of one face.
    #[must_use]
    pub fn face_indices(&self, face: &Face) -> &[u32] {
        let start = face.first_index as usize;
        let end = start + face.vertex_count as usize;
        self.indices.get(start..end).unwrap_or(&[])
    }

    /// Axis-aligned bounds, `None` when there are no vertices.
    #[must_use]
    pub fn bounds(&self) -> Option<([f64; 3], [f64; 3])> {
        let first = *self.positions.first()?;
        Some(self.positions.iter().fold((first, first), |(mut lo, mut hi), p| {
            for axis in 0..3 {
                lo[axis] = lo[axis].min(p[axis]);
                hi[axis] = hi[axis].max(p[axis]);
            }
            (lo, hi)
        }))
    }

    /// Approximate size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.positions.len() * 24
            + self.normals.len() * 24
            + self.uv_sets.iter().map(|s| s.len() * 16).sum::<usize>()
            + self.indices.len() * 4
            + self.faces.len() * std::mem::size_of::<Face>()
    }
}

/// Engine-assigned id of a reusable sub-mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrototypeId(pub u32);

impl fmt::Display for PrototypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prototype#{}", self.0)
    }
}

/// Repeated geometry referenced by instances.
#[derive(Clone, Debug, PartialEq)]
pub struct Prototype {
    /// Node name.
    pub name: String,
    /// Asset URI. Same URI means same mesh.
    pub uri: String,
    /// Geometry. Faces index the result's material table.
    pub mesh: MeshBuffers,
}

/// One placement of a prototype.
#[derive(Clone, Debug, PartialEq)]
pub struct InstancePlacement {
    /// Which prototype.
    pub prototype: PrototypeId,
    /// Column-major 4x4 transform.
    pub transform: [f64; 16],
    /// Material table indices replacing the prototype's, one per section.
    pub material_overrides: Vec<u32>,
}

/// Value of a `report()` call.
#[derive(Clone, Debug, PartialEq)]
pub enum ReportValue {
    /// Boolean report.
    Bool(bool),
    /// Numeric report.
    Float(f64),
    /// String report.
    String(String),
}

/// Diagnostic severity, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational.
    Info,
    /// Warning.
    Warning,
    /// Error. Generation still succeeds.
    Error,
    /// Fatal error in one shape.
    Fatal,
}

/// Which engine channel raised a diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiagnosticSource {
    /// Rule evaluation (`cgaError`).
    Rule,
    /// Missing or unreadable asset.
    Asset,
    /// Generic generate failure reported per shape.
    Generate,
}

/// A warning or error raised while evaluating rules.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    /// Severity.
    pub severity: Severity,
    /// Channel.
    pub source: DiagnosticSource,
    /// Message text.
    pub message: String,
    /// Shape that raised it.
    pub shape_id: Option<u64>,
    /// Rule method id, if known.
    pub method_id: Option<i32>,
    /// Program counter inside the method, if known.
    pub pc: Option<i32>,
    /// Asset key or URI for asset errors.
    pub uri: Option<String>,
}

/// One report emitted during generation.
#[derive(Clone, Debug, PartialEq)]
pub enum ReportEntry {
    /// `report(key, value)`.
    Value {
        /// Report key, e.g. `floor_count`.
        key: String,
        /// Reported value.
        value: ReportValue,
    },
    /// `print(text)`.
    Print {
        /// Printed text.
        text: String,
    },
    /// Error or warning.
    Diagnostic(Diagnostic),
}

impl ReportEntry {
    fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + match self {
                Self::Value { key, value } => {
                    key.len() + if let ReportValue::String(s) = value { s.len() } else { 0 }
                }
                Self::Print { text } => text.len(),
                Self::Diagnostic(d) => d.message.len() + d.uri.as_ref().map_or(0, String::len),
            }
    }
}

/// Output of one generation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationResult {
    mesh: MeshBuffers,
    materials: Vec<MaterialAttributes>,
    prototypes: BTreeMap<PrototypeId, Prototype>,
    instances: Vec<InstancePlacement>,
    reports: Vec<ReportEntry>,
    evaluated_attributes: Vec<(String, AttributeValue)>,
    byte_size: usize,
}

impl GenerationResult {
    /// Assembles a result. Only the decoder and engine test doubles build these.
    #[must_use]
    pub fn new(
        mesh: MeshBuffers,
        materials: Vec<MaterialAttributes>,
        prototypes: BTreeMap<PrototypeId, Prototype>,
        instances: Vec<InstancePlacement>,
        reports: Vec<ReportEntry>,
        evaluated_attributes: Vec<(String, AttributeValue)>,
    ) -> Self {
        let byte_size = std::mem::size_of::<Self>()
            + mesh.byte_size()
            + materials.iter().map(MaterialAttributes::byte_size).sum::<usize>()
            + prototypes
                .values()
                .map(|p| p.name.len() + p.uri.len() + p.mesh.byte_size())
                .sum::<usize>()
            + instances.iter().map(|i| 128 + i.material_overrides.len() * 4).sum::<usize>()
            + reports.iter().map(ReportEntry::byte_size).sum::<usize>()
            + evaluated_attributes
                .iter()
                .map(|(k, v)| k.len() + v.byte_size())
                .sum::<usize>();
        Self {
            mesh,
            materials,
            prototypes,
            instances,
            reports,
            evaluated_attributes,
            byte_size,
        }
    }

    /// Main mesh.
    #[must_use]
    pub fn mesh(&self) -> &MeshBuffers {
        &self.mesh
    }

    /// De-duplicated material table.
    #[must_use]
    pub fn materials(&self) -> &[MaterialAttributes] {
        &self.materials
    }

    /// Prototypes by id.
    #[must_use]
    pub fn prototypes(&self) -> &BTreeMap<PrototypeId, Prototype> {
        &self.prototypes
    }

    /// Instance placements in emission order, duplicates preserved.
    #[must_use]
    pub fn instances(&self) -> &[InstancePlacement] {
        &self.instances
    }

    /// Report entries in emission order.
    #[must_use]
    pub fn reports(&self) -> &[ReportEntry] {
        &self.reports
    }

    /// Last value reported under `key`.
    #[must_use]
    pub fn report(&self, key: &str) -> Option<&ReportValue> {
        self.reports.iter().rev().find_map(|r| match r {
            ReportEntry::Value { key: k, value } if k == key => Some(value),
            _ => None,
        })
    }

    /// Diagnostics at or above `severity`.
    pub fn diagnostics(&self, severity: Severity) -> impl Iterator<Item = &Diagnostic> {
        self.reports.iter().filter_map(move |r| match r {
            ReportEntry::Diagnostic(d) if d.severity >= severity => Some(d),
            _ => None,
        })
    }

    /// Succeeded, but the engine reported errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics(Severity::Error).next().is_some()
    }

    /// Attribute values as evaluated by the rule, in emission order.
    #[must_use]
    pub fn evaluated_attributes(&self) -> &[(String, AttributeValue)] {
        &self.evaluated_attributes
    }

    /// Approximate memory footprint, used for cache capacity.
    #[must_use]
    pub const fn byte_size(&self) -> usize {
        self.byte_size
    }
}

/// Report entries of a result in emission order.
#[must_use]
pub fn reports(result: &GenerationResult) -> &[ReportEntry] {
    result.reports()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> MeshBuffers {
        MeshBuffers {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 2.0], [0.0, 1.0, 2.0]],
            normals: vec![[0.0, 0.0, 1.0]; 4],
            uv_sets: vec![],
            indices: vec![0, 1, 2, 3],
            faces: vec![Face { first_index: 0, vertex_count: 4, material: 0 }],
        }
    }

    #[test]
    fn test_mesh_queries() {
        let mesh = quad();
        assert_eq!(mesh.triangle_count(), 2);
        assert_eq!(mesh.face_indices(&mesh.faces[0]), &[0, 1, 2, 3]);
        assert_eq!(mesh.bounds(), Some(([0.0, 0.0, 0.0], [1.0, 1.0, 2.0])));
        assert_eq!(MeshBuffers::default().bounds(), None);
    }

    #[test]
    fn test_short_faces_count_no_triangles() {
        let mut mesh = quad();
        mesh.faces.push(Face { first_index: 2, vertex_count: 2, material: 0 });
        mesh.faces.push(Face { first_index: 9, vertex_count: 3, material: 0 });
        assert_eq!(mesh.triangle_count(), 3);
        assert_eq!(mesh.face_indices(&mesh.faces[1]), &[2, 3]);
        assert!(mesh.face_indices(&mesh.faces[2]).is_empty());
    }

    #[test]
    fn test_reports_keep_order() {
        let result = GenerationResult::new(
            quad(),
            vec![MaterialAttributes::default()],
            BTreeMap::new(),
            vec![],
            vec![
                ReportEntry::Value { key: "floors".into(), value: ReportValue::Float(2.0) },
                ReportEntry::Print { text: "hello".into() },
                ReportEntry::Value { key: "floors".into(), value: ReportValue::Float(3.0) },
            ],
            vec![],
        );
        assert_eq!(reports(&result).len(), 3);
        assert_eq!(result.report("floors"), Some(&ReportValue::Float(3.0)));
        assert!(!result.has_errors());
        assert!(result.byte_size() > result.mesh().byte_size());
    }

    #[test]
    fn test_diagnostic_filter() {
        let diag = |severity| {
            ReportEntry::Diagnostic(Diagnostic {
                severity,
                source: DiagnosticSource::Rule,
                message: "x".into(),
                shape_id: Some(0),
                method_id: None,
                pc: None,
                uri: None,
            })
        };
        let result = GenerationResult::new(
            MeshBuffers::default(),
            vec![],
            BTreeMap::new(),
            vec![],
            vec![diag(Severity::Warning), diag(Severity::Error)],
            vec![],
        );
        assert_eq!(result.diagnostics(Severity::Warning).count(), 2);
        assert!(result.has_errors());
    }
}
