//! # Rule Packages
//!
//! Loading rule packages and extracting their attribute defaults.
//!
//! A [`RulePackageProvider`] knows how to turn a [`PackageId`] into a
//! [`PackageHandle`]. The [`PackageRegistry`] sits in front of it and makes
//! sure each package is loaded once, even when many workers ask for it at
//! the same time.
//!
//! Two providers ship with the crate:
//!
//! - [`StaticPackageProvider`] - packages registered in memory
//! - [`ManifestPackageProvider`] - one TOML manifest per package on disk

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lotgen_core::{
    AttributeDeclaration, AttributeMap, AttributeType, AttributeValue, GenerationError, LotgenResult,
    PackageId, RuleInfo,
};
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;

/// A loaded rule package.
#[derive(Clone, Debug, PartialEq)]
pub struct PackageHandle {
    /// Identifier it was loaded under.
    pub id: PackageId,
    /// Where it came from (path or `memory:`).
    pub location: String,
    /// Compiled rule metadata.
    pub rule_info: RuleInfo,
    /// Attribute values as evaluated from the rule file, by qualified name.
    pub evaluated: Vec<(String, AttributeValue)>,
}

impl PackageHandle {
    /// Evaluated value of an attribute, matched by qualified or display name.
    #[must_use]
    pub fn evaluated_value(&self, name: &str) -> Option<&AttributeValue> {
        self.evaluated
            .iter()
            .find(|(k, _)| lotgen_core::refers_to(name, k))
            .map(|(_, v)| v)
    }
}

/// Source of rule packages.
pub trait RulePackageProvider: Send + Sync {
    /// Loads a package.
    ///
    /// # Errors
    ///
    /// `RuleLoad` if the package is missing or corrupt.
    fn load_package(&self, id: &PackageId) -> LotgenResult<PackageHandle>;

    /// Default attribute map for a start rule of a loaded package.
    ///
    /// # Errors
    ///
    /// `RuleLoad` if the start rule does not exist.
    fn default_attributes(&self, package: &PackageHandle, start_rule: &str) -> LotgenResult<AttributeMap> {
        if package.rule_info.start_rule != start_rule {
            return Err(GenerationError::RuleLoad {
                package: package.id.to_string(),
                reason: format!("unknown start rule '{start_rule}'"),
            });
        }
        Ok(package.rule_info.visible_defaults(&package.evaluated))
    }
}

/// In-flight load shared by everyone who asked for the same package.
struct LoadSignal {
    outcome: Mutex<Option<LotgenResult<Arc<PackageHandle>>>>,
    condvar: Condvar,
}

impl LoadSignal {
    fn wait(&self) -> LotgenResult<Arc<PackageHandle>> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.condvar.wait(&mut outcome);
        }
    }
}

enum LoadState {
    Loading(Arc<LoadSignal>),
    Ready(Arc<PackageHandle>),
}

/// Caching, single-flight front of a [`RulePackageProvider`].
pub struct PackageRegistry {
    provider: Box<dyn RulePackageProvider>,
    packages: Mutex<HashMap<PackageId, LoadState>>,
    defaults: Mutex<HashMap<(PackageId, String), AttributeMap>>,
    loads: AtomicU64,
}

impl PackageRegistry {
    /// Wraps a provider.
    pub fn new(provider: impl RulePackageProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            packages: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            loads: AtomicU64::new(0),
        }
    }

    /// Returns the loaded package, loading it on first use.
    ///
    /// Concurrent callers for the same package share one load. Failed
    /// loads are not remembered; the next call tries again.
    ///
    /// # Errors
    ///
    /// `RuleLoad` from the provider.
    pub fn load(&self, id: &PackageId) -> LotgenResult<Arc<PackageHandle>> {
        let signal = {
            let mut packages = self.packages.lock();
            let in_flight = match packages.get(id) {
                Some(LoadState::Ready(handle)) => return Ok(Arc::clone(handle)),
                Some(LoadState::Loading(signal)) => Some(Arc::clone(signal)),
                None => None,
            };
            if let Some(signal) = in_flight {
                drop(packages);
                return signal.wait();
            }
            let signal = Arc::new(LoadSignal {
                outcome: Mutex::new(None),
                condvar: Condvar::new(),
            });
            packages.insert(id.clone(), LoadState::Loading(Arc::clone(&signal)));
            signal
        };

        self.loads.fetch_add(1, Ordering::Relaxed);
        let result = self.provider.load_package(id).map(Arc::new);
        match &result {
            Ok(handle) => tracing::info!(
                package = %id,
                location = %handle.location,
                attributes = handle.rule_info.declarations.len(),
                "rule package loaded"
            ),
            Err(e) => tracing::warn!(package = %id, error = %e, "rule package failed to load"),
        }

        {
            let mut packages = self.packages.lock();
            let still_ours = matches!(packages.get(id), Some(LoadState::Loading(s)) if Arc::ptr_eq(s, &signal));
            if still_ours {
                match &result {
                    Ok(handle) => {
                        packages.insert(id.clone(), LoadState::Ready(Arc::clone(handle)));
                    }
                    Err(_) => {
                        packages.remove(id);
                    }
                }
            }
        }
        *signal.outcome.lock() = Some(result.clone());
        signal.condvar.notify_all();
        result
    }

    /// Default attributes of a package's start rule, cached per package.
    ///
    /// # Errors
    ///
    /// `RuleLoad` from the provider.
    pub fn default_attributes(&self, package: &PackageHandle, start_rule: &str) -> LotgenResult<AttributeMap> {
        let key = (package.id.clone(), start_rule.to_owned());
        if let Some(defaults) = self.defaults.lock().get(&key) {
            return Ok(defaults.clone());
        }
        let defaults = self.provider.default_attributes(package, start_rule)?;
        self.defaults.lock().insert(key, defaults.clone());
        Ok(defaults)
    }

    /// Cached defaults, without loading anything.
    pub fn peek_defaults(&self, id: &PackageId, start_rule: &str) -> Option<AttributeMap> {
        self.defaults.lock().get(&(id.clone(), start_rule.to_owned())).cloned()
    }

    /// Forgets a package so the next use reloads it.
    pub fn evict(&self, id: &PackageId) {
        self.packages.lock().remove(id);
        self.defaults.lock().retain(|(package, _), _| package != id);
        tracing::debug!(package = %id, "rule package evicted");
    }

    /// Number of provider loads so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PackageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageRegistry")
            .field("packages", &self.packages.lock().len())
            .field("loads", &self.load_count())
            .finish()
    }
}

/// Packages registered in memory.
#[derive(Clone, Debug, Default)]
pub struct StaticPackageProvider {
    packages: HashMap<PackageId, PackageHandle>,
}

impl StaticPackageProvider {
    /// Empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a package whose start rule declares `defaults` as visible
    /// attributes.
    #[must_use]
    pub fn with_package(
        mut self,
        id: impl Into<PackageId>,
        start_rule: impl Into<String>,
        defaults: impl IntoIterator<Item = (String, AttributeValue)>,
    ) -> Self {
        let id = id.into();
        let evaluated: Vec<(String, AttributeValue)> = defaults.into_iter().collect();
        let declarations = evaluated
            .iter()
            .map(|(name, value)| AttributeDeclaration::new(name.clone(), value.value_type()))
            .collect();
        let handle = PackageHandle {
            location: format!("memory:{id}"),
            rule_info: RuleInfo {
                rule_file: format!("bin/{id}.cgb"),
                start_rule: start_rule.into(),
                declarations,
            },
            evaluated,
            id: id.clone(),
        };
        self.packages.insert(id, handle);
        self
    }

    /// Registers a fully specified handle.
    #[must_use]
    pub fn with_handle(mut self, handle: PackageHandle) -> Self {
        self.packages.insert(handle.id.clone(), handle);
        self
    }
}

impl RulePackageProvider for StaticPackageProvider {
    fn load_package(&self, id: &PackageId) -> LotgenResult<PackageHandle> {
        self.packages.get(id).cloned().ok_or_else(|| GenerationError::RuleLoad {
            package: id.to_string(),
            reason: "package not registered".into(),
        })
    }
}

/// On-disk package manifest.
///
/// ```toml
/// rule_file = "bin/simple_extrude.cgb"
/// start_rule = "Default$Lot"
///
/// [[attributes]]
/// name = "height"
/// type = "float"
/// default = 10.0
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageManifest {
    /// Rule file inside the package.
    pub rule_file: String,
    /// Start rule.
    pub start_rule: String,
    /// Declared attributes.
    #[serde(default)]
    pub attributes: Vec<ManifestAttribute>,
}

/// One `[[attributes]]` table.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestAttribute {
    /// Qualified name.
    pub name: String,
    /// `bool`, `float`, `string` or an array form like `float[]`.
    #[serde(rename = "type")]
    pub value_type: String,
    /// Default value.
    pub default: toml::Value,
    /// Parameter count.
    #[serde(default)]
    pub parameters: usize,
    /// Hidden from callers.
    #[serde(default)]
    pub hidden: bool,
}

impl PackageManifest {
    /// Parses a manifest.
    ///
    /// # Errors
    ///
    /// `RuleLoad` on syntax errors or defaults that do not match their type.
    pub fn parse(id: &PackageId, text: &str) -> LotgenResult<Self> {
        let manifest: Self = toml::from_str(text).map_err(|e| load_error(id, format!("invalid manifest: {e}")))?;
        for attribute in &manifest.attributes {
            attribute.decode(id)?;
        }
        Ok(manifest)
    }

    fn into_handle(self, id: &PackageId, location: String) -> LotgenResult<PackageHandle> {
        let mut declarations = Vec::with_capacity(self.attributes.len());
        let mut evaluated = Vec::with_capacity(self.attributes.len());
        for attribute in &self.attributes {
            let (value_type, value) = attribute.decode(id)?;
            declarations.push(AttributeDeclaration {
                name: attribute.name.clone(),
                value_type,
                parameter_count: attribute.parameters,
                hidden: attribute.hidden,
            });
            evaluated.push((attribute.name.clone(), value));
        }
        Ok(PackageHandle {
            id: id.clone(),
            location,
            rule_info: RuleInfo {
                rule_file: self.rule_file,
                start_rule: self.start_rule,
                declarations,
            },
            evaluated,
        })
    }
}

impl ManifestAttribute {
    fn decode(&self, id: &PackageId) -> LotgenResult<(AttributeType, AttributeValue)> {
        let mismatch = || load_error(id, format!("attribute '{}' default does not match type '{}'", self.name, self.value_type));
        let value_type = parse_type(&self.value_type)
            .ok_or_else(|| load_error(id, format!("attribute '{}' has unknown type '{}'", self.name, self.value_type)))?;

        let value = match (value_type, &self.default) {
            (AttributeType::Bool, toml::Value::Boolean(b)) => AttributeValue::Bool(*b),
            (AttributeType::Float, v) => AttributeValue::Float(as_f64(v).ok_or_else(mismatch)?),
            (AttributeType::String, toml::Value::String(s)) => AttributeValue::String(s.clone()),
            (AttributeType::BoolArray, toml::Value::Array(items)) => AttributeValue::BoolArray(
                items.iter().map(toml::Value::as_bool).collect::<Option<_>>().ok_or_else(mismatch)?,
            ),
            (AttributeType::FloatArray, toml::Value::Array(items)) => {
                AttributeValue::FloatArray(items.iter().map(as_f64).collect::<Option<_>>().ok_or_else(mismatch)?)
            }
            (AttributeType::StringArray, toml::Value::Array(items)) => AttributeValue::StringArray(
                items
                    .iter()
                    .map(|v| v.as_str().map(str::to_owned))
                    .collect::<Option<_>>()
                    .ok_or_else(mismatch)?,
            ),
            _ => return Err(mismatch()),
        };
        Ok((value_type, value))
    }
}

fn parse_type(name: &str) -> Option<AttributeType> {
    Some(match name {
        "bool" => AttributeType::Bool,
        "float" => AttributeType::Float,
        "string" => AttributeType::String,
        "bool[]" => AttributeType::BoolArray,
        "float[]" => AttributeType::FloatArray,
        "string[]" => AttributeType::StringArray,
        _ => return None,
    })
}

fn as_f64(value: &toml::Value) -> Option<f64> {
    match value {
        toml::Value::Float(f) => Some(*f),
        toml::Value::Integer(i) => Some(*i as f64),
        _ => None,
    }
}

fn load_error(id: &PackageId, reason: String) -> GenerationError {
    GenerationError::RuleLoad {
        package: id.to_string(),
        reason,
    }
}

/// Packages described by `<root>/<id>.toml` manifests.
#[derive(Clone, Debug)]
pub struct ManifestPackageProvider {
    root: PathBuf,
}

impl ManifestPackageProvider {
    /// Provider reading manifests from `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Path of the manifest for `id`.
    #[must_use]
    pub fn manifest_path(&self, id: &PackageId) -> PathBuf {
        self.root.join(format!("{}.toml", id.as_str()))
    }
}

impl RulePackageProvider for ManifestPackageProvider {
    fn load_package(&self, id: &PackageId) -> LotgenResult<PackageHandle> {
        if id.as_str().contains(['/', '\\']) || id.as_str().starts_with('.') {
            return Err(load_error(id, "package id must be a plain name".into()));
        }
        let path = self.manifest_path(id);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| load_error(id, format!("cannot read {}: {e}", path.display())))?;
        PackageManifest::parse(id, &text)?.into_handle(id, path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct SlowProvider {
        calls: Arc<AtomicUsize>,
    }

    impl RulePackageProvider for SlowProvider {
        fn load_package(&self, id: &PackageId) -> LotgenResult<PackageHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            StaticPackageProvider::new()
                .with_package(id.clone(), "Default$Lot", [("height".to_owned(), AttributeValue::Float(3.0))])
                .load_package(id)
        }
    }

    #[test]
    fn test_concurrent_loads_share_one_provider_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(PackageRegistry::new(SlowProvider { calls: Arc::clone(&calls) }));
        let id = PackageId::new("slow");

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                thread::spawn(move || registry.load(&id).unwrap())
            })
            .collect();
        let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

        registry.evict(&id);
        registry.load(&id).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_package_is_rule_load() {
        let registry = PackageRegistry::new(StaticPackageProvider::new());
        let err = registry.load(&PackageId::new("nope")).unwrap_err();
        assert!(matches!(err, GenerationError::RuleLoad { .. }));
    }

    #[test]
    fn test_defaults_and_start_rule() {
        let registry = PackageRegistry::new(StaticPackageProvider::new().with_package(
            "lot",
            "Default$Lot",
            [("height".to_owned(), AttributeValue::Float(10.0))],
        ));
        let id = PackageId::new("lot");
        let handle = registry.load(&id).unwrap();
        assert!(registry.peek_defaults(&id, "Default$Lot").is_none());

        let defaults = registry.default_attributes(&handle, "Default$Lot").unwrap();
        assert_eq!(defaults.get_float("height"), Some(10.0));
        assert!(registry.peek_defaults(&id, "Default$Lot").is_some());

        assert!(registry.default_attributes(&handle, "Default$Other").is_err());
    }

    #[test]
    fn test_manifest_parsing() {
        let id = PackageId::new("tower");
        let text = r#"
            rule_file = "bin/tower.cgb"
            start_rule = "Default$Lot"

            [[attributes]]
            name = "Default$height"
            type = "float"
            default = 12

            [[attributes]]
            name = "Default$roof_colors"
            type = "string[]"
            default = ["red", "grey"]

            [[attributes]]
            name = "Default$seed_offset"
            type = "float"
            default = 1.0
            hidden = true
        "#;
        let handle = PackageManifest::parse(&id, text)
            .unwrap()
            .into_handle(&id, "tower.toml".into())
            .unwrap();
        assert_eq!(handle.evaluated_value("height"), Some(&AttributeValue::Float(12.0)));

        let defaults = StaticPackageProvider::new().default_attributes(&handle, "Default$Lot").unwrap();
        assert_eq!(defaults.len(), 2);
        assert!(defaults.get("Default$seed_offset").is_none());
    }

    #[test]
    fn test_manifest_type_mismatch() {
        let id = PackageId::new("bad");
        let text = r#"
            rule_file = "bin/bad.cgb"
            start_rule = "Default$Lot"

            [[attributes]]
            name = "height"
            type = "float"
            default = "tall"
        "#;
        assert!(matches!(
            PackageManifest::parse(&id, text),
            Err(GenerationError::RuleLoad { .. })
        ));
    }

    #[test]
    fn test_manifest_provider_reads_disk() {
        let dir = std::env::temp_dir().join(format!(
            "lotgen_manifest_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("box.toml"),
            "rule_file = \"bin/box.cgb\"\nstart_rule = \"Default$Lot\"\n",
        )
        .unwrap();

        let provider = ManifestPackageProvider::new(&dir);
        let handle = provider.load_package(&PackageId::new("box")).unwrap();
        assert_eq!(handle.rule_info.rule_file, "bin/box.cgb");
        assert!(provider.load_package(&PackageId::new("missing")).is_err());
        assert!(provider.load_package(&PackageId::new("../box")).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
