//! Assembly against a recording factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use lotgen_assembly::{
    AssemblyConfig, AssemblyError, AssemblyResult, Decomposed, MeshAssembler, MeshData, MeshFactory, PrototypeCache,
};
use lotgen_core::{
    AttributeValue, Face, GenerationOptions, GenerationResult, InitialShape, InstancePlacement, MaterialAttributes,
    MeshBuffers, Prototype, PrototypeId, Ring, IDENTITY_TRANSFORM,
};
use lotgen_runtime::{ExtrudeEngine, GenerationScheduler, PackageRegistry, ProcEngineClient, RuntimeConfig, StaticPackageProvider};

// =============================================================================
// TEST DOUBLES
// =============================================================================

struct Component {
    mesh: usize,
    overrides: Vec<String>,
    transforms: Vec<Decomposed>,
}

/// Materials are their names, meshes are indices into `meshes`.
#[derive(Default)]
struct RecordingFactory {
    materials: Vec<String>,
    meshes: Vec<(MeshData, Vec<String>)>,
    components: Vec<Component>,
    refuse: Option<&'static str>,
}

impl MeshFactory for RecordingFactory {
    type Material = String;
    type Mesh = usize;
    type Component = usize;

    fn create_material(&mut self, material: &MaterialAttributes) -> AssemblyResult<String> {
        if self.refuse == Some("material") {
            return Err(AssemblyError::Factory {
                what: "material",
                reason: "out of slots".into(),
            });
        }
        self.materials.push(material.name.clone());
        Ok(material.name.clone())
    }

    fn create_static_mesh(&mut self, mesh: &MeshData, materials: &[String]) -> AssemblyResult<usize> {
        assert_eq!(mesh.sections.len(), materials.len());
        self.meshes.push((mesh.clone(), materials.to_vec()));
        Ok(self.meshes.len() - 1)
    }

    fn create_instanced_component(
        &mut self,
        mesh: &usize,
        overrides: &[String],
        transforms: &[Decomposed],
    ) -> AssemblyResult<usize> {
        self.components.push(Component {
            mesh: *mesh,
            overrides: overrides.to_vec(),
            transforms: transforms.to_vec(),
        });
        Ok(self.components.len() - 1)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn generate(window_count: f64) -> Arc<GenerationResult> {
    let provider = StaticPackageProvider::new().with_package(
        "tower",
        "Default$Lot",
        [
            ("Default$height".to_owned(), AttributeValue::Float(5.0)),
            ("Default$window_count".to_owned(), AttributeValue::Float(window_count)),
        ],
    );
    let client =
        ProcEngineClient::new(Arc::new(ExtrudeEngine::new()), Arc::new(PackageRegistry::new(provider)), 1).unwrap();
    let scheduler = GenerationScheduler::new(Arc::new(client), &RuntimeConfig::default()).unwrap();
    let shape = InitialShape::new(
        Ring::new([[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [0.0, 10.0, 0.0]]),
        "tower",
        "Default$Lot",
    );
    scheduler.generate_blocking(&shape, 42, GenerationOptions::default()).unwrap()
}

fn unit_quad(material: u32) -> MeshBuffers {
    MeshBuffers {
        positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
        normals: vec![[0.0, 0.0, 1.0]; 4],
        uv_sets: Vec::new(),
        indices: vec![0, 1, 2, 3],
        faces: vec![Face {
            first_index: 0,
            vertex_count: 4,
            material,
        }],
    }
}

fn placed(prototype: u32, x: f64, overrides: Vec<u32>) -> InstancePlacement {
    let mut transform = IDENTITY_TRANSFORM;
    transform[12] = x;
    InstancePlacement {
        prototype: PrototypeId(prototype),
        transform,
        material_overrides: overrides,
    }
}

fn instanced_result(instances: Vec<InstancePlacement>) -> GenerationResult {
    let mut prototypes = BTreeMap::new();
    prototypes.insert(
        PrototypeId(0),
        Prototype {
            name: "door".into(),
            uri: "assets/door.obj".into(),
            mesh: unit_quad(0),
        },
    );
    GenerationResult::new(
        MeshBuffers::default(),
        vec![
            MaterialAttributes::with_diffuse("wood", [0.5, 0.3, 0.1]),
            MaterialAttributes::with_diffuse("steel", [0.7, 0.7, 0.7]),
        ],
        prototypes,
        instances,
        Vec::new(),
        Vec::new(),
    )
}

// =============================================================================
// TESTS
// =============================================================================

#[test]
fn test_extruded_building_assembles() {
    let result = generate(3.0);
    let mut assembler = MeshAssembler::new(RecordingFactory::default(), AssemblyConfig::unreal());
    let model = assembler.assemble(&result).unwrap();

    assert_eq!(model.mesh, Some(0));
    assert_eq!(model.materials, vec!["facade".to_owned(), "glass".to_owned()]);
    // Three wall quads and the triangle roof.
    assert_eq!(model.stats.triangles, 7);
    assert_eq!(model.stats.sections, 1);
    assert_eq!(model.stats.components, 1);
    assert_eq!(model.stats.instances, 3);

    let factory = assembler.factory();
    let (building, section_materials) = &factory.meshes[0];
    assert_eq!(section_materials, &vec!["facade".to_owned()]);
    // Engine z becomes host y, metres become centimetres.
    let top = building.vertices.iter().map(|v| v.position[1]).fold(f32::MIN, f32::max);
    assert_eq!(top, 500.0);

    let (window, window_materials) = &factory.meshes[1];
    assert_eq!(window.triangle_count(), 2);
    assert_eq!(window_materials, &vec!["glass".to_owned()]);

    let component = &factory.components[0];
    assert_eq!(component.mesh, 1);
    assert!(component.overrides.is_empty());
    assert_eq!(component.transforms.len(), 3);
    // Sill at half height, converted like any position.
    assert!(component.transforms.iter().all(|t| (t.translation[1] - 250.0).abs() < 1e-9));
}

#[test]
fn test_second_result_reuses_materials_and_prototypes() {
    let result = generate(2.0);
    let mut assembler = MeshAssembler::new(RecordingFactory::default(), AssemblyConfig::default());
    assembler.assemble(&result).unwrap();
    let again = assembler.assemble(&result).unwrap();

    assert_eq!(again.stats.materials_created, 0);
    assert_eq!(again.stats.materials_reused, 2);
    assert_eq!(again.stats.prototype_meshes_reused, 1);
    assert_eq!(again.stats.prototype_meshes_created, 0);
    // Building twice, window once.
    assert_eq!(assembler.factory().meshes.len(), 3);
    assert_eq!(assembler.factory().materials.len(), 2);

    assembler.clear_caches();
    let fresh = assembler.assemble(&result).unwrap();
    assert_eq!(fresh.stats.materials_created, 2);
    assert_eq!(fresh.stats.prototype_meshes_created, 1);
}

#[test]
fn test_prototype_cache_shared_between_assemblers() {
    let cache = Arc::new(PrototypeCache::new());
    let result = instanced_result(vec![placed(0, 0.0, Vec::new())]);

    let mut first = MeshAssembler::with_prototype_cache(
        RecordingFactory::default(),
        AssemblyConfig::default(),
        Arc::clone(&cache),
    );
    first.assemble(&result).unwrap();
    assert_eq!(cache.get("assets/door.obj"), Some(0));

    let mut second =
        MeshAssembler::with_prototype_cache(RecordingFactory::default(), AssemblyConfig::default(), cache);
    let model = second.assemble(&result).unwrap();
    assert_eq!(model.stats.prototype_meshes_reused, 1);
    assert!(second.factory().meshes.is_empty());
}

#[test]
fn test_instances_grouped_by_prototype_and_overrides() {
    let result = instanced_result(vec![
        placed(0, 0.0, Vec::new()),
        placed(0, 1.0, vec![1]),
        placed(0, 2.0, Vec::new()),
        placed(0, 3.0, vec![1]),
        placed(0, 4.0, vec![0]),
    ]);
    let mut assembler = MeshAssembler::new(RecordingFactory::default(), AssemblyConfig::default());
    let model = assembler.assemble(&result).unwrap();

    assert_eq!(model.mesh, None);
    assert_eq!(model.components, vec![0, 1, 2]);

    let components = &assembler.factory().components;
    let xs = |c: &Component| c.transforms.iter().map(|t| t.translation[0]).collect::<Vec<_>>();
    assert_eq!(xs(&components[0]), vec![0.0, 2.0]);
    assert_eq!(xs(&components[1]), vec![1.0, 3.0]);
    assert_eq!(components[1].overrides, vec!["steel".to_owned()]);
    assert_eq!(components[2].overrides, vec!["wood".to_owned()]);
    // One prototype mesh behind all three.
    assert!(components.iter().all(|c| c.mesh == 0));
    assert_eq!(model.stats.prototype_meshes_created, 1);
    assert_eq!(model.stats.prototype_meshes_reused, 2);
}

#[test]
fn test_unknown_prototype() {
    let result = instanced_result(vec![placed(9, 0.0, Vec::new())]);
    let mut assembler = MeshAssembler::new(RecordingFactory::default(), AssemblyConfig::default());
    let err = assembler.assemble(&result).err().unwrap();
    assert_eq!(err, AssemblyError::UnknownPrototype(PrototypeId(9)));
}

#[test]
fn test_override_out_of_range() {
    let result = instanced_result(vec![placed(0, 0.0, vec![5])]);
    let mut assembler = MeshAssembler::new(RecordingFactory::default(), AssemblyConfig::default());
    let err = assembler.assemble(&result).err().unwrap();
    assert_eq!(err, AssemblyError::MissingMaterial { material: 5, available: 2 });
}

#[test]
fn test_singular_instance_transform() {
    let mut instance = placed(0, 0.0, Vec::new());
    instance.transform[0] = 0.0;
    let result = instanced_result(vec![instance]);
    let mut assembler = MeshAssembler::new(RecordingFactory::default(), AssemblyConfig::default());
    let err = assembler.assemble(&result).err().unwrap();
    assert_eq!(err, AssemblyError::SingularTransform);
}

#[test]
fn test_factory_errors_propagate() {
    let factory = RecordingFactory {
        refuse: Some("material"),
        ..RecordingFactory::default()
    };
    let mut assembler = MeshAssembler::new(factory, AssemblyConfig::default());
    let err = assembler.assemble(&generate(0.0)).err().unwrap();
    assert!(matches!(err, AssemblyError::Factory { what: "material", .. }));
}

#[test]
fn test_empty_result_builds_nothing() {
    let result = GenerationResult::new(
        MeshBuffers::default(),
        Vec::new(),
        BTreeMap::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
    );
    let mut assembler = MeshAssembler::new(RecordingFactory::default(), AssemblyConfig::default());
    let model = assembler.assemble(&result).unwrap();
    assert!(model.mesh.is_none());
    assert!(model.components.is_empty());
    assert!(assembler.factory().meshes.is_empty());
}
