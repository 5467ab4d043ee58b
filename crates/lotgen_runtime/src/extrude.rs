//! # Extrusion Engine
//!
//! Built-in [`ProceduralEngine`] that extrudes the footprint along its
//! normal. Used for previews and tests where no real rule engine is around.
//!
//! ## Rule Attributes
//!
//! | Attribute      | Type  | Effect                                    |
//! |----------------|-------|-------------------------------------------|
//! | `height`       | float | Extrusion height (negative → 0, warning)  |
//! | `window_count` | float | Window instances along the first edge     |
//!
//! ## Output
//!
//! Node 0 holds one wall quad per ring edge, then the roof. Holes get walls
//! but are not cut out of the roof. The facade color is drawn from a
//! ChaCha8 stream seeded with the request seed, so the same seed always
//! gives the same color.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use lotgen_core::{AttributeValue, GenerationError, LotgenResult, OutputMode, PrototypeId, Severity};

use crate::engine::{
    EngineInput, EngineSession, GenerationCallbacks, InstanceEmission, MeshEmission, ProceduralEngine, UvSet,
};
use crate::log::LogLevel;

/// Height used when the package declares none.
pub const DEFAULT_HEIGHT: f64 = 10.0;

/// Storey height for `floor_count`.
pub const FLOOR_HEIGHT: f64 = 3.0;

/// URI of the window prototype.
pub const WINDOW_URI: &str = "builtin:window";

const BUILDING_NODE: u64 = 0;
const WINDOW_NODE: u64 = 1;
const WINDOW_PROTOTYPE: PrototypeId = PrototypeId(0);

/// Deterministic footprint extruder.
#[derive(Clone, Copy, Debug)]
pub struct ExtrudeEngine {
    floor_height: f64,
}

impl Default for ExtrudeEngine {
    fn default() -> Self {
        Self {
            floor_height: FLOOR_HEIGHT,
        }
    }
}

impl ExtrudeEngine {
    /// Engine with the default storey height.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with a custom storey height.
    #[must_use]
    pub const fn with_floor_height(floor_height: f64) -> Self {
        Self { floor_height }
    }
}

impl ProceduralEngine for ExtrudeEngine {
    fn open_session(&self) -> LotgenResult<Box<dyn EngineSession>> {
        Ok(Box::new(ExtrudeSession {
            floor_height: self.floor_height,
        }))
    }

    fn name(&self) -> &str {
        "extrude"
    }
}

struct ExtrudeSession {
    floor_height: f64,
}

type Vec3 = [f64; 3];

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn newell(points: &[Vec3]) -> Vec3 {
    let mut n = [0.0; 3];
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        n[0] += (a[1] - b[1]) * (a[2] + b[2]);
        n[1] += (a[2] - b[2]) * (a[0] + b[0]);
        n[2] += (a[0] - b[0]) * (a[1] + b[1]);
    }
    n
}

fn length(v: Vec3) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Corner-indexed mesh under construction.
#[derive(Default)]
struct Corners {
    vertices: Vec<f64>,
    uvs: Vec<f64>,
    face_counts: Vec<u32>,
    indices: Vec<u32>,
}

impl Corners {
    fn face(&mut self, corners: &[(Vec3, [f64; 2])]) {
        for (position, uv) in corners {
            let index = (self.vertices.len() / 3) as u32;
            self.vertices.extend_from_slice(position);
            self.uvs.extend_from_slice(uv);
            self.indices.push(index);
        }
        self.face_counts.push(corners.len() as u32);
    }

    fn into_emission(self, node: u64, name: &str) -> MeshEmission {
        MeshEmission {
            node,
            name: name.to_owned(),
            prototype: None,
            uri: None,
            vertices: self.vertices,
            normals: Vec::new(),
            face_counts: self.face_counts,
            vertex_indices: self.indices.clone(),
            normal_indices: Vec::new(),
            uv_sets: vec![UvSet {
                coords: self.uvs,
                indices: self.indices,
            }],
        }
    }
}

impl ExtrudeSession {
    fn float_attribute(input: &EngineInput, name: &str) -> Option<f64> {
        input.attribute(name).and_then(AttributeValue::as_float)
    }

    fn emit_attributes(input: &EngineInput, height: f64, sink: &mut dyn GenerationCallbacks) {
        for declaration in input.package.rule_info.visible() {
            let name = lotgen_core::display_name(&declaration.name);
            if name == "height" {
                sink.attr_float(BUILDING_NODE, &declaration.name, height);
            } else if let Some(value) = input.attribute(&declaration.name) {
                sink.evaluated_attribute(BUILDING_NODE, &declaration.name, value.clone());
            }
        }
    }

    fn emit_windows(outer: &[Vec3], normal: Vec3, height: f64, count: u32, sink: &mut dyn GenerationCallbacks) {
        let (a, b) = (outer[0], outer[1 % outer.len()]);
        let edge = sub(b, a);
        let edge_length = length(edge);
        if edge_length <= 0.0 {
            return;
        }
        let along = [edge[0] / edge_length, edge[1] / edge_length, edge[2] / edge_length];

        let mut window = Corners::default();
        window.face(&[
            ([0.0, 0.0, 0.0], [0.0, 0.0]),
            (along, [1.0, 0.0]),
            ([along[0] + normal[0], along[1] + normal[1], along[2] + normal[2]], [1.0, 1.0]),
            (normal, [0.0, 1.0]),
        ]);
        let mut emission = window.into_emission(WINDOW_NODE, "window");
        emission.prototype = Some(WINDOW_PROTOTYPE);
        emission.uri = Some(WINDOW_URI.to_owned());
        sink.add_mesh(emission);
        sink.assign_material(
            WINDOW_NODE,
            0,
            1,
            &[
                ("name".to_owned(), AttributeValue::from("glass")),
                ("diffuseColor".to_owned(), AttributeValue::FloatArray(vec![0.6, 0.7, 0.8])),
                ("opacity".to_owned(), AttributeValue::Float(0.4)),
            ],
        );

        let sill = height * 0.5;
        for k in 0..count {
            let t = (f64::from(k) + 0.5) / f64::from(count) * edge_length;
            let mut transform = lotgen_core::IDENTITY_TRANSFORM;
            transform[12] = a[0] + along[0] * t + normal[0] * sill;
            transform[13] = a[1] + along[1] * t + normal[1] * sill;
            transform[14] = a[2] + along[2] * t + normal[2] * sill;
            sink.add_instance(InstanceEmission {
                prototype: WINDOW_PROTOTYPE,
                transform,
                material_overrides: Vec::new(),
            });
        }
    }
}

impl EngineSession for ExtrudeSession {
    fn generate(&mut self, input: &EngineInput, sink: &mut dyn GenerationCallbacks) -> LotgenResult<()> {
        sink.log(LogLevel::Debug, &format!("extruding with start rule {}", input.start_rule));

        let outer: Vec<Vec3> = input.shape.face_points(0).collect();
        let raw_normal = newell(&outer);
        let normal_length = length(raw_normal);
        if outer.len() < 3 || normal_length <= 0.0 {
            return Err(GenerationError::Engine {
                diagnostic: "footprint has no area".into(),
            });
        }
        let normal = [
            raw_normal[0] / normal_length,
            raw_normal[1] / normal_length,
            raw_normal[2] / normal_length,
        ];

        let mut height = Self::float_attribute(input, "height").unwrap_or(DEFAULT_HEIGHT);
        if height < 0.0 {
            sink.cga_error(BUILDING_NODE, Severity::Warning, 0, 0, "negative height clamped to 0");
            height = 0.0;
        }

        Self::emit_attributes(input, height, sink);
        if input.output == OutputMode::AttributesOnly {
            return Ok(());
        }

        let lift = [normal[0] * height, normal[1] * height, normal[2] * height];
        let top = |p: Vec3| [p[0] + lift[0], p[1] + lift[1], p[2] + lift[2]];

        let mut building = Corners::default();
        let mut hole_area = 0.0;
        for face in 0..input.shape.face_counts.len() {
            let ring: Vec<Vec3> = input.shape.face_points(face).collect();
            if face > 0 {
                hole_area += length(newell(&ring)) * 0.5;
            }
            let mut u = 0.0;
            for (i, &a) in ring.iter().enumerate() {
                let b = ring[(i + 1) % ring.len()];
                let run = length(sub(b, a));
                building.face(&[
                    (a, [u, 0.0]),
                    (b, [u + run, 0.0]),
                    (top(b), [u + run, height]),
                    (top(a), [u, height]),
                ]);
                u += run;
            }
        }
        let walls = building.face_counts.len() as u32;
        let roof: Vec<(Vec3, [f64; 2])> = outer.iter().map(|&p| (top(p), [p[0], p[1]])).collect();
        building.face(&roof);
        sink.add_mesh(building.into_emission(BUILDING_NODE, "building"));

        let mut rng = ChaCha8Rng::seed_from_u64(input.seed);
        let facade = [rng.gen_range(0.35..0.95), rng.gen_range(0.35..0.95), rng.gen_range(0.35..0.95)];
        sink.assign_material(
            BUILDING_NODE,
            0,
            walls + 1,
            &[
                ("name".to_owned(), AttributeValue::from("facade")),
                ("diffuseColor".to_owned(), AttributeValue::FloatArray(facade.to_vec())),
                ("roughness".to_owned(), AttributeValue::Float(0.8)),
            ],
        );

        let window_count = Self::float_attribute(input, "window_count").map_or(0, |c| c.max(0.0) as u32);
        if window_count > 0 && height > 0.0 {
            Self::emit_windows(&outer, normal, height, window_count, sink);
        }

        let footprint = normal_length * 0.5 - hole_area;
        sink.report_float(BUILDING_NODE, "height", height);
        sink.report_float(BUILDING_NODE, "footprint_area", footprint);
        sink.report_float(BUILDING_NODE, "floor_count", (height / self.floor_height).floor());
        sink.print(BUILDING_NODE, &format!("extruded {walls} walls to {height}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::CallbackDecoder;
    use crate::package::{PackageRegistry, RulePackageProvider, StaticPackageProvider};
    use lotgen_core::{GenerationOptions, GenerationRequest, InitialShape, ReportValue, Ring};
    use std::sync::Arc;

    fn run(shape: &InitialShape, seed: u64, options: GenerationOptions) -> lotgen_core::GenerationResult {
        let provider = StaticPackageProvider::new().with_package(
            "simple_extrude",
            "Default$Lot",
            [
                ("Default$height".to_owned(), AttributeValue::Float(5.0)),
                ("Default$window_count".to_owned(), AttributeValue::Float(0.0)),
            ],
        );
        let registry = PackageRegistry::new(provider);
        let package = registry.load(&shape.package).unwrap();
        let request = GenerationRequest::new(shape, seed, options);
        let input = EngineInput::new(&request, package);

        let mut decoder = CallbackDecoder::new(options);
        ExtrudeEngine::new()
            .open_session()
            .unwrap()
            .generate(&input, &mut decoder)
            .unwrap();
        decoder.finish().unwrap()
    }

    fn square() -> InitialShape {
        InitialShape::new(
            Ring::new([[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [10.0, 10.0, 0.0], [0.0, 10.0, 0.0]]),
            "simple_extrude",
            "Default$Lot",
        )
    }

    #[test]
    fn test_square_extrusion() {
        let result = run(&square(), 42, GenerationOptions::default());
        // Four walls and the roof.
        assert_eq!(result.mesh().faces.len(), 5);
        assert_eq!(result.materials().len(), 1);
        let (min, max) = result.mesh().bounds().unwrap();
        assert_eq!(min[2], 0.0);
        assert_eq!(max[2], 5.0);
        assert_eq!(result.report("floor_count"), Some(&ReportValue::Float(1.0)));
        assert_eq!(result.report("footprint_area"), Some(&ReportValue::Float(100.0)));
    }

    #[test]
    fn test_seed_drives_color() {
        let a = run(&square(), 1, GenerationOptions::default());
        let b = run(&square(), 1, GenerationOptions::default());
        let c = run(&square(), 2, GenerationOptions::default());
        assert_eq!(a.materials()[0].diffuse_color(), b.materials()[0].diffuse_color());
        assert_ne!(a.materials()[0].diffuse_color(), c.materials()[0].diffuse_color());
    }

    #[test]
    fn test_negative_height_warns() {
        let mut shape = square();
        shape.attributes.set_override("Default$height", -3.0).unwrap();
        let options = GenerationOptions {
            report_verbosity: lotgen_core::ReportVerbosity::Diagnostics,
            ..GenerationOptions::default()
        };
        let result = run(&shape, 1, options);
        assert_eq!(result.diagnostics(Severity::Warning).count(), 1);
        assert_eq!(result.report("height"), Some(&ReportValue::Float(0.0)));
    }

    #[test]
    fn test_windows_are_instances() {
        let mut shape = square();
        shape.attributes.set_override("Default$window_count", 4.0).unwrap();
        let result = run(&shape, 1, GenerationOptions::default());
        assert_eq!(result.instances().len(), 4);
        assert_eq!(result.prototypes()[&WINDOW_PROTOTYPE].uri, WINDOW_URI);
        assert_eq!(result.materials().len(), 2);
    }

    #[test]
    fn test_attributes_only() {
        let mut shape = square();
        shape.attributes.set_override("Default$height", 12.0).unwrap();
        let result = run(&shape, 1, GenerationOptions::attributes_only());
        assert!(result.mesh().is_empty());
        let evaluated: Vec<_> = result.evaluated_attributes().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(evaluated, vec!["Default$height", "Default$window_count"]);
        assert_eq!(result.evaluated_attributes()[0].1, AttributeValue::Float(12.0));
    }

    #[test]
    fn test_provider_defaults_match_declarations() {
        let provider = StaticPackageProvider::new().with_package(
            "simple_extrude",
            "Default$Lot",
            [("Default$height".to_owned(), AttributeValue::Float(5.0))],
        );
        let handle = provider.load_package(&"simple_extrude".into()).unwrap();
        let defaults = provider.default_attributes(&handle, "Default$Lot").unwrap();
        assert_eq!(defaults.get_float("Default$height"), Some(5.0));
        assert!(Arc::new(handle).evaluated_value("height").is_some());
    }
}
