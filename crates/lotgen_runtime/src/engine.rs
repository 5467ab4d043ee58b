//! # Procedural Engine Boundary
//!
//! Traits the external shape-grammar engine is driven through, and the
//! callback protocol it emits results with.
//!
//! ## Session Model
//!
//! ```text
//!   ProceduralEngine (shared, Send + Sync)
//!        │ open_session() x N
//!        ▼
//!   EngineSession (one per worker, never shared)
//!        │ generate(input, &mut sink)
//!        ▼
//!   GenerationCallbacks (single call, single owner)
//! ```
//!
//! Per node the engine emits geometry first, then materials for face ranges
//! of that geometry, then instances, then reports. Nodes may interleave.

use std::sync::Arc;

use lotgen_core::{
    AttributeValue, GenerationRequest, InitialShape, LotgenResult, OutputMode, PrototypeId, Severity,
};

use crate::log::LogLevel;
use crate::package::PackageHandle;

/// Raw material attributes as emitted by the engine.
pub type RawMaterial = Vec<(String, AttributeValue)>;

/// One UV set of an emitted mesh.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UvSet {
    /// Flat `u, v` pairs.
    pub coords: Vec<f64>,
    /// One coordinate index per corner, or empty when the set is unused.
    pub indices: Vec<u32>,
}

/// Geometry of one node.
///
/// Indices are local to this emission. Corners are listed face by face.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshEmission {
    /// Node id, used to address face ranges later.
    pub node: u64,
    /// Node name.
    pub name: String,
    /// Set when this geometry is a reusable prototype for instancing.
    pub prototype: Option<PrototypeId>,
    /// Asset URI of the geometry, if it came from an asset.
    pub uri: Option<String>,
    /// Flat `x, y, z` positions.
    pub vertices: Vec<f64>,
    /// Flat `x, y, z` normals.
    pub normals: Vec<f64>,
    /// Corners per face.
    pub face_counts: Vec<u32>,
    /// Position index per corner.
    pub vertex_indices: Vec<u32>,
    /// Normal index per corner, or empty for flat shading.
    pub normal_indices: Vec<u32>,
    /// UV sets, in set order.
    pub uv_sets: Vec<UvSet>,
}

/// One placement of a prototype.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceEmission {
    /// Prototype emitted earlier in the same call.
    pub prototype: PrototypeId,
    /// Column-major 4x4 transform.
    pub transform: [f64; 16],
    /// Per-section material replacements.
    pub material_overrides: Vec<RawMaterial>,
}

/// The engine's emission protocol.
///
/// Implemented by the decoder. Engines call these during one
/// [`EngineSession::generate`] call, on the calling thread.
pub trait GenerationCallbacks {
    /// Geometry of a node.
    fn add_mesh(&mut self, mesh: MeshEmission);

    /// Material of `face_count` faces of `node`, starting at `first_face`.
    fn assign_material(&mut self, node: u64, first_face: u32, face_count: u32, material: &[(String, AttributeValue)]);

    /// A prototype placement.
    fn add_instance(&mut self, instance: InstanceEmission);

    /// `report(key, bool)`.
    fn report_bool(&mut self, node: u64, key: &str, value: bool);

    /// `report(key, float)`.
    fn report_float(&mut self, node: u64, key: &str, value: f64);

    /// `report(key, string)`.
    fn report_string(&mut self, node: u64, key: &str, value: &str);

    /// `print(text)`.
    fn print(&mut self, node: u64, text: &str);

    /// Rule evaluation error or warning.
    fn cga_error(&mut self, node: u64, severity: Severity, method_id: i32, pc: i32, message: &str);

    /// Asset could not be resolved or read.
    fn asset_error(&mut self, node: u64, severity: Severity, key: &str, uri: &str, message: &str);

    /// Per-shape generate failure. The call may still produce geometry.
    fn generate_error(&mut self, node: u64, message: &str);

    /// Final value of a rule attribute.
    fn evaluated_attribute(&mut self, node: u64, key: &str, value: AttributeValue);

    /// Engine log line.
    fn log(&mut self, level: LogLevel, message: &str);

    /// Evaluated boolean attribute.
    fn attr_bool(&mut self, node: u64, key: &str, value: bool) {
        self.evaluated_attribute(node, key, AttributeValue::Bool(value));
    }

    /// Evaluated float attribute.
    fn attr_float(&mut self, node: u64, key: &str, value: f64) {
        self.evaluated_attribute(node, key, AttributeValue::Float(value));
    }

    /// Evaluated string attribute.
    fn attr_string(&mut self, node: u64, key: &str, value: &str) {
        self.evaluated_attribute(node, key, AttributeValue::String(value.to_owned()));
    }

    /// Evaluated boolean array attribute.
    fn attr_bool_array(&mut self, node: u64, key: &str, values: &[bool]) {
        self.evaluated_attribute(node, key, AttributeValue::BoolArray(values.to_vec()));
    }

    /// Evaluated float array attribute.
    fn attr_float_array(&mut self, node: u64, key: &str, values: &[f64]) {
        self.evaluated_attribute(node, key, AttributeValue::FloatArray(values.to_vec()));
    }

    /// Evaluated string array attribute.
    fn attr_string_array(&mut self, node: u64, key: &str, values: &[String]) {
        self.evaluated_attribute(node, key, AttributeValue::StringArray(values.to_vec()));
    }
}

/// Shape flattened into native call arrays.
///
/// Face 0 is the outer ring; every following face is a hole of face 0.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncodedShape {
    /// Flat `x, y, z` coordinates.
    pub coords: Vec<f64>,
    /// Vertex index per corner.
    pub indices: Vec<u32>,
    /// Corners per face.
    pub face_counts: Vec<u32>,
    /// Faces that are holes of face 0.
    pub hole_faces: Vec<u32>,
}

impl EncodedShape {
    /// Flattens every ring, dropping repeated closing points.
    #[must_use]
    pub fn encode(shape: &InitialShape) -> Self {
        let mut encoded = Self::default();
        for (face, ring) in shape.rings().enumerate() {
            let points = ring.distinct_points();
            let base = (encoded.coords.len() / 3) as u32;
            for (i, p) in points.iter().enumerate() {
                encoded.coords.extend_from_slice(&p.to_array());
                encoded.indices.push(base + i as u32);
            }
            encoded.face_counts.push(points.len() as u32);
            if face > 0 {
                encoded.hole_faces.push(face as u32);
            }
        }
        encoded
    }

    /// Number of vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.coords.len() / 3
    }

    /// Corner positions of one face.
    pub fn face_points(&self, face: usize) -> impl Iterator<Item = [f64; 3]> + '_ {
        let start: usize = self.face_counts[..face.min(self.face_counts.len())]
            .iter()
            .map(|&c| c as usize)
            .sum();
        let count = self.face_counts.get(face).copied().unwrap_or(0) as usize;
        self.indices[start..start + count].iter().map(move |&i| {
            let i = i as usize * 3;
            [self.coords[i], self.coords[i + 1], self.coords[i + 2]]
        })
    }
}

/// Everything a session needs for one generate call.
#[derive(Clone, Debug)]
pub struct EngineInput {
    /// Loaded rule package.
    pub package: Arc<PackageHandle>,
    /// Flattened shape.
    pub shape: EncodedShape,
    /// Start rule.
    pub start_rule: String,
    /// Random seed.
    pub seed: u64,
    /// Level-of-detail bias.
    pub lod_bias: i32,
    /// Caller overrides only. The engine evaluates the rest itself.
    pub overrides: Vec<(String, AttributeValue)>,
    /// Geometry or attributes only.
    pub output: OutputMode,
}

impl EngineInput {
    /// Builds the call arguments for `request`.
    #[must_use]
    pub fn new(request: &GenerationRequest, package: Arc<PackageHandle>) -> Self {
        let shape = request.shape();
        Self {
            package,
            shape: EncodedShape::encode(shape),
            start_rule: shape.start_rule.clone(),
            seed: request.seed(),
            lod_bias: request.options().lod_bias,
            overrides: shape
                .attributes
                .overrides()
                .map(|(k, v)| (k.to_owned(), v.clone()))
                .collect(),
            output: request.options().output,
        }
    }

    /// Effective value of an attribute: override, then package value.
    ///
    /// Matches qualified names and display names, in either direction.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.overrides
            .iter()
            .find(|(k, _)| lotgen_core::refers_to(name, k) || lotgen_core::refers_to(k, name))
            .map(|(_, v)| v)
            .or_else(|| self.package.evaluated_value(name))
    }
}

/// One engine session. Not shareable; used by one worker at a time.
pub trait EngineSession: Send {
    /// Runs the rule package on the shape and emits into `sink`.
    ///
    /// # Errors
    ///
    /// `Engine` with the native diagnostic when the call fails as a whole.
    fn generate(&mut self, input: &EngineInput, sink: &mut dyn GenerationCallbacks) -> LotgenResult<()>;
}

/// The external engine.
pub trait ProceduralEngine: Send + Sync {
    /// Opens a new session.
    ///
    /// # Errors
    ///
    /// `Engine` if the engine cannot allocate another session.
    fn open_session(&self) -> LotgenResult<Box<dyn EngineSession>>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "procedural-engine"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotgen_core::Ring;

    #[test]
    fn test_encode_with_hole() {
        let outer = Ring::new([[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [10.0, 10.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 0.0]]);
        let hole = Ring::new([[2.0, 2.0, 0.0], [3.0, 2.0, 0.0], [3.0, 3.0, 0.0]]);
        let shape = InitialShape::new(outer, "lot", "Default$Lot").with_hole(hole);

        let encoded = EncodedShape::encode(&shape);
        assert_eq!(encoded.face_counts, vec![4, 3]);
        assert_eq!(encoded.hole_faces, vec![1]);
        assert_eq!(encoded.vertex_count(), 7);
        assert_eq!(encoded.indices, (0..7).collect::<Vec<u32>>());

        let hole_points: Vec<_> = encoded.face_points(1).collect();
        assert_eq!(hole_points[0], [2.0, 2.0, 0.0]);
    }
}
