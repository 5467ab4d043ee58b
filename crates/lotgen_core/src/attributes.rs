//! # Rule Attributes
//!
//! Typed key/value store for the user-tunable attributes of a rule package.
//!
//! ## Default / Override Semantics
//!
//! ```text
//!   package defaults ──┐
//!                      ├──> effective value (override wins)
//!   caller overrides ──┘
//! ```
//!
//! The type of an attribute is fixed by its default. An override of a
//! different type is rejected with `AttributeTypeMismatch` at the moment it
//! is set, so a mismatched map can never reach a worker.
//!
//! Only overrides are handed to the procedural engine; it evaluates the
//! remaining attributes from the rule file itself.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

use crate::error::{GenerationError, LotgenResult};

/// Name of the only attribute style we expose.
pub const DEFAULT_STYLE: &str = "Default";

/// The tag of an [`AttributeValue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AttributeType {
    /// Single boolean.
    Bool = 0,
    /// Single float (CGA has no separate integer type).
    Float = 1,
    /// Single string.
    String = 2,
    /// Array of booleans.
    BoolArray = 3,
    /// Array of floats.
    FloatArray = 4,
    /// Array of strings.
    StringArray = 5,
}

impl AttributeType {
    /// Returns true for the array variants.
    #[inline]
    #[must_use]
    pub const fn is_array(self) -> bool {
        matches!(self, Self::BoolArray | Self::FloatArray | Self::StringArray)
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Float => "float",
            Self::String => "string",
            Self::BoolArray => "bool[]",
            Self::FloatArray => "float[]",
            Self::StringArray => "string[]",
        };
        f.write_str(name)
    }
}

/// A tagged attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    /// Boolean value.
    Bool(bool),
    /// Float value.
    Float(f64),
    /// String value.
    String(String),
    /// Boolean array.
    BoolArray(Vec<bool>),
    /// Float array.
    FloatArray(Vec<f64>),
    /// String array.
    StringArray(Vec<String>),
}

impl AttributeValue {
    /// Returns the type tag of this value.
    #[must_use]
    pub const fn value_type(&self) -> AttributeType {
        match self {
            Self::Bool(_) => AttributeType::Bool,
            Self::Float(_) => AttributeType::Float,
            Self::String(_) => AttributeType::String,
            Self::BoolArray(_) => AttributeType::BoolArray,
            Self::FloatArray(_) => AttributeType::FloatArray,
            Self::StringArray(_) => AttributeType::StringArray,
        }
    }

    /// Returns the boolean payload, if this is a `Bool`.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the float payload, if this is a `Float`.
    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload, if this is a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the float array payload, if this is a `FloatArray`.
    #[must_use]
    pub fn as_float_array(&self) -> Option<&[f64]> {
        match self {
            Self::FloatArray(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the string array payload, if this is a `StringArray`.
    #[must_use]
    pub fn as_string_array(&self) -> Option<&[String]> {
        match self {
            Self::StringArray(v) => Some(v),
            _ => None,
        }
    }

    /// Approximate heap + inline size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        let heap = match self {
            Self::Bool(_) | Self::Float(_) => 0,
            Self::String(s) => s.len(),
            Self::BoolArray(v) => v.len(),
            Self::FloatArray(v) => v.len() * 8,
            Self::StringArray(v) => v.iter().map(|s| s.len() + std::mem::size_of::<String>()).sum(),
        };
        std::mem::size_of::<Self>() + heap
    }

    /// Feeds a stable representation of this value into `state`.
    ///
    /// Floats are hashed by bit pattern so `0.0` and `-0.0` differ.
    pub fn fingerprint_into<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.value_type() as u8);
        match self {
            Self::Bool(v) => state.write_u8(u8::from(*v)),
            Self::Float(v) => state.write_u64(v.to_bits()),
            Self::String(v) => write_str(state, v),
            Self::BoolArray(v) => {
                state.write_usize(v.len());
                for b in v {
                    state.write_u8(u8::from(*b));
                }
            }
            Self::FloatArray(v) => {
                state.write_usize(v.len());
                for f in v {
                    state.write_u64(f.to_bits());
                }
            }
            Self::StringArray(v) => {
                state.write_usize(v.len());
                for s in v {
                    write_str(state, s);
                }
            }
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<f64>> for AttributeValue {
    fn from(v: Vec<f64>) -> Self {
        Self::FloatArray(v)
    }
}

/// Length-prefixed string write so `["ab", "c"]` and `["a", "bc"]` differ.
pub(crate) fn write_str<H: Hasher>(state: &mut H, s: &str) {
    state.write_usize(s.len());
    state.write(s.as_bytes());
}

/// Package defaults plus caller overrides, ordered by attribute name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeMap {
    /// Values declared by the rule package.
    defaults: BTreeMap<String, AttributeValue>,
    /// Values set by the caller.
    overrides: BTreeMap<String, AttributeValue>,
}

impl AttributeMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a map holding only package defaults.
    #[must_use]
    pub fn from_defaults<K, I>(defaults: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, AttributeValue)>,
    {
        Self {
            defaults: defaults.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            overrides: BTreeMap::new(),
        }
    }

    /// Number of distinct attribute names (defaults and overrides).
    #[must_use]
    pub fn len(&self) -> usize {
        self.defaults.len()
            + self
                .overrides
                .keys()
                .filter(|k| !self.defaults.contains_key(*k))
                .count()
    }

    /// Returns true if there are neither defaults nor overrides.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defaults.is_empty() && self.overrides.is_empty()
    }

    /// Effective value: the override if present, else the default.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.overrides.get(name).or_else(|| self.defaults.get(name))
    }

    /// Effective float value, if the attribute exists and is a float.
    #[must_use]
    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(AttributeValue::as_float)
    }

    /// The package default, ignoring overrides.
    #[must_use]
    pub fn default_value(&self, name: &str) -> Option<&AttributeValue> {
        self.defaults.get(name)
    }

    /// The type an override for `name` must have, if known.
    ///
    /// An unqualified name (`height`) resolves to the default it refers to
    /// (`Default$height`), the same way the engine resolves it.
    #[must_use]
    pub fn type_of(&self, name: &str) -> Option<AttributeType> {
        self.default_for(name)
            .or_else(|| self.overrides.get(name))
            .map(AttributeValue::value_type)
    }

    fn default_for(&self, name: &str) -> Option<&AttributeValue> {
        self.defaults.get(name).or_else(|| {
            self.defaults
                .iter()
                .find(|(declared, _)| refers_to(name, declared))
                .map(|(_, v)| v)
        })
    }

    /// Returns true if the caller has overridden `name`.
    #[must_use]
    pub fn is_user_set(&self, name: &str) -> bool {
        self.overrides.contains_key(name)
    }

    /// Overrides an attribute, returning the previous override.
    ///
    /// # Errors
    ///
    /// `AttributeTypeMismatch` if `value` has a different type than the
    /// default (or an earlier override) for `name`. The map is unchanged.
    pub fn set_override(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> LotgenResult<Option<AttributeValue>> {
        let name = name.into();
        let value = value.into();
        if let Some(expected) = self.type_of(&name) {
            let found = value.value_type();
            if expected != found {
                return Err(GenerationError::AttributeTypeMismatch { name, expected, found });
            }
        }
        Ok(self.overrides.insert(name, value))
    }

    /// Removes an override so the default applies again.
    pub fn clear_override(&mut self, name: &str) -> Option<AttributeValue> {
        self.overrides.remove(name)
    }

    /// Removes all overrides.
    pub fn clear_overrides(&mut self) {
        self.overrides.clear();
    }

    /// Applies every override of `other` on top of this map.
    ///
    /// All-or-nothing: if any override has the wrong type, nothing is applied.
    ///
    /// # Errors
    ///
    /// The first `AttributeTypeMismatch` found, in name order.
    pub fn merge_overrides(&mut self, other: &Self) -> LotgenResult<()> {
        for (name, value) in &other.overrides {
            self.check_override(name, value)?;
        }
        for (name, value) in &other.overrides {
            self.overrides.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    /// Caller overrides in name order.
    pub fn overrides(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.overrides.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Package defaults in name order.
    pub fn defaults(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.defaults.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Effective values of every attribute, in name order.
    #[must_use]
    pub fn effective(&self) -> Vec<(&str, &AttributeValue)> {
        let mut merged: BTreeMap<&str, &AttributeValue> =
            self.defaults.iter().map(|(k, v)| (k.as_str(), v)).collect();
        for (k, v) in &self.overrides {
            merged.insert(k.as_str(), v);
        }
        merged.into_iter().collect()
    }

    /// Verifies every override against the defaults of a (possibly newer)
    /// package version.
    ///
    /// # Errors
    ///
    /// The first `AttributeTypeMismatch` found, in name order.
    pub fn check_against(&self, defaults: &Self) -> LotgenResult<()> {
        for (name, value) in &self.overrides {
            defaults.check_override(name, value)?;
        }
        Ok(())
    }

    /// Swaps in new package defaults, keeping the overrides that still fit.
    ///
    /// Returns the names of overrides that were dropped because the new
    /// package declares them with a different type.
    pub fn rebase(&mut self, new_defaults: BTreeMap<String, AttributeValue>) -> Vec<String> {
        self.defaults = new_defaults;
        let mut dropped = Vec::new();
        let mut overrides = std::mem::take(&mut self.overrides);
        overrides.retain(|name, value| {
            let keep = self
                .default_for(name)
                .map_or(true, |d| d.value_type() == value.value_type());
            if !keep {
                dropped.push(name.clone());
            }
            keep
        });
        self.overrides = overrides;
        dropped
    }

    /// Feeds defaults and overrides into `state` in a stable order.
    pub fn fingerprint_into<H: Hasher>(&self, state: &mut H) {
        for (tag, map) in [(0u8, &self.defaults), (1u8, &self.overrides)] {
            state.write_u8(tag);
            state.write_usize(map.len());
            for (name, value) in map {
                write_str(state, name);
                value.fingerprint_into(state);
            }
        }
    }

    /// Approximate size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.defaults
            .iter()
            .chain(&self.overrides)
            .map(|(k, v)| k.len() + v.byte_size())
            .sum()
    }

    fn check_override(&self, name: &str, value: &AttributeValue) -> LotgenResult<()> {
        match self.type_of(name) {
            Some(expected) if expected != value.value_type() => {
                Err(GenerationError::AttributeTypeMismatch {
                    name: name.to_owned(),
                    expected,
                    found: value.value_type(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Declaration of one attribute in a compiled rule file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeDeclaration {
    /// Fully qualified name, e.g. `Default$lot.height`.
    pub name: String,
    /// Declared type.
    pub value_type: AttributeType,
    /// Number of parameters. Only parameterless attributes are tunable.
    pub parameter_count: usize,
    /// `@Hidden` annotation present.
    pub hidden: bool,
}

impl AttributeDeclaration {
    /// Declares a visible, parameterless attribute.
    #[must_use]
    pub fn new(name: impl Into<String>, value_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            value_type,
            parameter_count: 0,
            hidden: false,
        }
    }

    /// Returns true if the attribute is exposed to callers.
    #[must_use]
    pub fn is_tunable(&self) -> bool {
        self.parameter_count == 0 && !self.hidden && style_of(&self.name) == DEFAULT_STYLE
    }
}

/// Metadata about a compiled rule file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleInfo {
    /// Rule file entry inside the package.
    pub rule_file: String,
    /// Start rule, e.g. `Default$Lot`.
    pub start_rule: String,
    /// Declared attributes in declaration order.
    pub declarations: Vec<AttributeDeclaration>,
}

impl RuleInfo {
    /// Tunable declarations, first occurrence of each name only.
    pub fn visible(&self) -> impl Iterator<Item = &AttributeDeclaration> {
        let mut seen = std::collections::BTreeSet::new();
        self.declarations
            .iter()
            .filter(move |d| d.is_tunable() && seen.insert(d.name.as_str()))
    }

    /// Builds the caller-facing default map from engine-evaluated values.
    ///
    /// Values whose type disagrees with the declaration are skipped.
    #[must_use]
    pub fn visible_defaults(&self, evaluated: &[(String, AttributeValue)]) -> AttributeMap {
        let by_name: BTreeMap<&str, &AttributeValue> =
            evaluated.iter().map(|(k, v)| (k.as_str(), v)).collect();
        AttributeMap::from_defaults(self.visible().filter_map(|decl| {
            by_name
                .get(decl.name.as_str())
                .filter(|v| v.value_type() == decl.value_type)
                .map(|v| (decl.name.clone(), (*v).clone()))
        }))
    }
}

/// The style part of a qualified name (`Style$name`), `Default` if absent.
#[must_use]
pub fn style_of(name: &str) -> &str {
    name.split_once('$').map_or(DEFAULT_STYLE, |(style, _)| style)
}

/// True if `reference` names the attribute declared as `declared`.
///
/// Qualified references must match exactly. An unqualified reference
/// matches by display name: `height` refers to `Default$lot.height`.
#[must_use]
pub fn refers_to(reference: &str, declared: &str) -> bool {
    reference == declared || (display_name(reference) == reference && display_name(declared) == reference)
}

/// Strips style and import prefixes: `Default$lot.height` → `height`.
#[must_use]
pub fn display_name(name: &str) -> &str {
    let unstyled = name.split_once('$').map_or(name, |(_, rest)| rest);
    unstyled.rsplit_once('.').map_or(unstyled, |(_, rest)| rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lot_defaults() -> AttributeMap {
        AttributeMap::from_defaults([
            ("height", AttributeValue::Float(10.0)),
            ("roof", AttributeValue::from("flat")),
            ("windows", AttributeValue::Bool(true)),
        ])
    }

    #[test]
    fn test_override_wins_over_default() {
        let mut attrs = lot_defaults();
        assert_eq!(attrs.get_float("height"), Some(10.0));

        attrs.set_override("height", 5.0).unwrap();
        assert_eq!(attrs.get_float("height"), Some(5.0));
        assert_eq!(attrs.default_value("height"), Some(&AttributeValue::Float(10.0)));
        assert!(attrs.is_user_set("height"));

        attrs.clear_override("height");
        assert_eq!(attrs.get_float("height"), Some(10.0));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut attrs = lot_defaults();
        let err = attrs.set_override("height", "tall").unwrap_err();
        assert_eq!(
            err,
            GenerationError::AttributeTypeMismatch {
                name: "height".into(),
                expected: AttributeType::Float,
                found: AttributeType::String,
            }
        );
        assert!(!attrs.is_user_set("height"));
    }

    #[test]
    fn test_unknown_attribute_fixes_type() {
        let mut attrs = lot_defaults();
        attrs.set_override("floors", 3.0).unwrap();
        assert!(attrs.set_override("floors", true).is_err());
        assert_eq!(attrs.len(), 4);
    }

    #[test]
    fn test_merge_is_all_or_nothing() {
        let mut attrs = lot_defaults();
        let mut other = AttributeMap::new();
        other.set_override("height", 7.0).unwrap();
        other.set_override("windows", 1.0).unwrap();

        assert!(attrs.merge_overrides(&other).is_err());
        assert!(!attrs.is_user_set("height"));
    }

    #[test]
    fn test_effective_is_name_ordered() {
        let mut attrs = lot_defaults();
        attrs.set_override("awning", true).unwrap();
        let names: Vec<&str> = attrs.effective().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["awning", "height", "roof", "windows"]);
    }

    #[test]
    fn test_rebase_drops_retyped_overrides() {
        let mut attrs = lot_defaults();
        attrs.set_override("height", 4.0).unwrap();
        attrs.set_override("roof", "gable").unwrap();

        let mut new_defaults = BTreeMap::new();
        new_defaults.insert("height".to_owned(), AttributeValue::Float(12.0));
        new_defaults.insert("roof".to_owned(), AttributeValue::Float(1.0));

        let dropped = attrs.rebase(new_defaults);
        assert_eq!(dropped, vec!["roof".to_owned()]);
        assert_eq!(attrs.get_float("height"), Some(4.0));
        assert_eq!(attrs.get_float("roof"), Some(1.0));
    }

    #[test]
    fn test_check_against_newer_defaults() {
        let mut attrs = AttributeMap::new();
        attrs.set_override("height", "tall").unwrap();
        assert!(attrs.check_against(&lot_defaults()).is_err());
    }

    #[test]
    fn test_short_name_checked_against_qualified_default() {
        let defaults = AttributeMap::from_defaults([
            ("Default$height", AttributeValue::Float(5.0)),
            ("Default$facade.color", AttributeValue::from("#ffffff")),
        ]);

        let mut attrs = AttributeMap::new();
        attrs.set_override("height", "tall").unwrap();
        assert_eq!(
            attrs.check_against(&defaults),
            Err(GenerationError::AttributeTypeMismatch {
                name: "height".into(),
                expected: AttributeType::Float,
                found: AttributeType::String,
            })
        );

        let mut seeded = defaults.clone();
        assert!(seeded.set_override("color", 1.0).is_err());
        seeded.set_override("color", "#000000").unwrap();
        // Qualified names never match a different qualified name.
        seeded.set_override("Night$height", "tall").unwrap();
    }

    #[test]
    fn test_refers_to() {
        assert!(refers_to("height", "Default$height"));
        assert!(refers_to("height", "Default$lot.height"));
        assert!(refers_to("Default$height", "Default$height"));
        assert!(!refers_to("Default$height", "Default$lot.height"));
        assert!(!refers_to("Default$height", "height"));
        assert!(!refers_to("width", "Default$height"));
    }

    #[test]
    fn test_names_and_styles() {
        assert_eq!(style_of("Default$height"), "Default");
        assert_eq!(style_of("Night$height"), "Night");
        assert_eq!(style_of("height"), "Default");
        assert_eq!(display_name("Default$lot.height"), "height");
        assert_eq!(display_name("height"), "height");
    }

    #[test]
    fn test_visible_defaults_filter() {
        let mut hidden = AttributeDeclaration::new("Default$secret", AttributeType::Float);
        hidden.hidden = true;
        let mut param = AttributeDeclaration::new("Default$f", AttributeType::Float);
        param.parameter_count = 1;
        let info = RuleInfo {
            rule_file: "bin/lot.cgb".into(),
            start_rule: "Default$Lot".into(),
            declarations: vec![
                AttributeDeclaration::new("Default$height", AttributeType::Float),
                AttributeDeclaration::new("Night$height", AttributeType::Float),
                AttributeDeclaration::new("Default$roof", AttributeType::String),
                hidden,
                param,
            ],
        };
        let evaluated = vec![
            ("Default$height".to_owned(), AttributeValue::Float(9.0)),
            ("Night$height".to_owned(), AttributeValue::Float(1.0)),
            ("Default$roof".to_owned(), AttributeValue::Float(2.0)),
            ("Default$secret".to_owned(), AttributeValue::Float(3.0)),
        ];
        let defaults = info.visible_defaults(&evaluated);
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults.get_float("Default$height"), Some(9.0));
    }
}
