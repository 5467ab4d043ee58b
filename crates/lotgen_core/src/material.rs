//! Shading attributes of one generated material.
//!
//! The engine emits materials as loose attribute maps. Only the keys below
//! are understood; everything else is ignored.
//!
//! | Key | Kind |
//! |-----|------|
//! | `diffuseMap`, `opacityMap`, `emissiveMap`, `metallicMap`, `roughnessMap`, `normalMap` | texture URI |
//! | `diffuseColor`, `emissiveColor` | RGB color |
//! | `metallic`, `opacity`, `roughness` | scalar |
//! | `shader` | string |
//! | `opacityMap.mode` | blend mode |
//!
//! Two materials that differ only in `name` are the same material.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::attributes::{write_str, AttributeValue};

/// Opacity below this forces translucent blending.
pub const OPACITY_THRESHOLD: f64 = 0.98;

const TEXTURE_KEYS: [&str; 6] = [
    "diffuseMap",
    "opacityMap",
    "emissiveMap",
    "metallicMap",
    "roughnessMap",
    "normalMap",
];
const COLOR_KEYS: [&str; 2] = ["diffuseColor", "emissiveColor"];
const SCALAR_KEYS: [&str; 3] = ["metallic", "opacity", "roughness"];
const STRING_KEYS: [&str; 1] = ["shader"];

/// How the opacity channel is interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Opacity ignored.
    #[default]
    Opaque,
    /// Alpha test.
    Masked,
    /// Alpha blend.
    Translucent,
}

impl BlendMode {
    /// Parses an `opacityMap.mode` value. Unknown modes are opaque.
    #[must_use]
    pub fn from_mode(mode: &str) -> Self {
        match mode {
            "mask" => Self::Masked,
            "blend" => Self::Translucent,
            _ => Self::Opaque,
        }
    }
}

/// Material table entry.
#[derive(Clone, Debug, Default)]
pub struct MaterialAttributes {
    /// Display name. Not part of equality.
    pub name: String,
    /// Texture slot → URI.
    pub textures: BTreeMap<String, String>,
    /// Color slot → linear RGB.
    pub colors: BTreeMap<String, [f64; 3]>,
    /// Scalar slot → value.
    pub scalars: BTreeMap<String, f64>,
    /// String slot → value.
    pub strings: BTreeMap<String, String>,
    /// Declared blend mode.
    pub blend_mode: BlendMode,
}

impl MaterialAttributes {
    /// Builds a material from raw engine attributes.
    #[must_use]
    pub fn from_raw<'a, I>(raw: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a AttributeValue)>,
    {
        let mut material = Self::default();
        for (key, value) in raw {
            if TEXTURE_KEYS.contains(&key) {
                material.textures.insert(key.to_owned(), first_texture(value));
            } else if COLOR_KEYS.contains(&key) {
                material.colors.insert(key.to_owned(), color(value));
            } else if SCALAR_KEYS.contains(&key) {
                if let Some(v) = scalar(value) {
                    material.scalars.insert(key.to_owned(), v);
                }
            } else if STRING_KEYS.contains(&key) {
                if let Some(s) = value.as_str() {
                    material.strings.insert(key.to_owned(), s.to_owned());
                }
            } else if key == "opacityMap.mode" {
                material.blend_mode = value.as_str().map_or(BlendMode::Opaque, BlendMode::from_mode);
            } else if key == "name" {
                material.name = value.as_str().unwrap_or_default().to_owned();
            }
        }
        material
    }

    /// Single-color material, e.g. for built-in engines.
    #[must_use]
    pub fn with_diffuse(name: impl Into<String>, rgb: [f64; 3]) -> Self {
        let mut material = Self {
            name: name.into(),
            ..Self::default()
        };
        material.colors.insert("diffuseColor".to_owned(), rgb);
        material
    }

    /// Texture URI of a slot, if set and non-empty.
    #[must_use]
    pub fn texture(&self, slot: &str) -> Option<&str> {
        self.textures.get(slot).map(String::as_str).filter(|s| !s.is_empty())
    }

    /// Diffuse color, black if unset.
    #[must_use]
    pub fn diffuse_color(&self) -> [f64; 3] {
        self.colors.get("diffuseColor").copied().unwrap_or_default()
    }

    /// Opacity scalar, 1.0 if unset.
    #[must_use]
    pub fn opacity(&self) -> f64 {
        self.scalars.get("opacity").copied().unwrap_or(1.0)
    }

    /// Blend mode a renderer should actually use.
    ///
    /// Low opacity wins over the declared mode. A `blend` declaration without
    /// an opacity map has nothing to blend and falls back to opaque.
    #[must_use]
    pub fn effective_blend_mode(&self) -> BlendMode {
        if self.opacity() < OPACITY_THRESHOLD {
            return BlendMode::Translucent;
        }
        match self.blend_mode {
            BlendMode::Masked => BlendMode::Masked,
            BlendMode::Translucent if self.texture("opacityMap").is_some() => BlendMode::Translucent,
            _ => BlendMode::Opaque,
        }
    }

    /// Approximate size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        let strings = |m: &BTreeMap<String, String>| m.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>();
        std::mem::size_of::<Self>()
            + self.name.len()
            + strings(&self.textures)
            + strings(&self.strings)
            + self.colors.keys().map(|k| k.len() + 24).sum::<usize>()
            + self.scalars.keys().map(|k| k.len() + 8).sum::<usize>()
    }
}

impl PartialEq for MaterialAttributes {
    fn eq(&self, other: &Self) -> bool {
        let bits3 = |c: &[f64; 3]| c.map(f64::to_bits);
        self.textures == other.textures
            && self.strings == other.strings
            && self.blend_mode == other.blend_mode
            && self.colors.len() == other.colors.len()
            && self
                .colors
                .iter()
                .zip(&other.colors)
                .all(|((ka, a), (kb, b))| ka == kb && bits3(a) == bits3(b))
            && self.scalars.len() == other.scalars.len()
            && self
                .scalars
                .iter()
                .zip(&other.scalars)
                .all(|((ka, a), (kb, b))| ka == kb && a.to_bits() == b.to_bits())
    }
}

// Floats compare by bit pattern, so equality is total.
impl Eq for MaterialAttributes {}

impl Hash for MaterialAttributes {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (k, v) in self.textures.iter().chain(&self.strings) {
            write_str(state, k);
            write_str(state, v);
        }
        for (k, c) in &self.colors {
            write_str(state, k);
            for channel in c {
                state.write_u64(channel.to_bits());
            }
        }
        for (k, v) in &self.scalars {
            write_str(state, k);
            state.write_u64(v.to_bits());
        }
        self.blend_mode.hash(state);
    }
}

fn first_texture(value: &AttributeValue) -> String {
    match value {
        AttributeValue::String(s) => s.clone(),
        AttributeValue::StringArray(uris) => uris.iter().find(|u| !u.is_empty()).cloned().unwrap_or_default(),
        _ => String::new(),
    }
}

fn color(value: &AttributeValue) -> [f64; 3] {
    match value.as_float_array() {
        Some(&[r, g, b, ..]) => [r, g, b],
        _ => [0.0; 3],
    }
}

fn scalar(value: &AttributeValue) -> Option<f64> {
    match value {
        AttributeValue::Float(v) => Some(*v),
        AttributeValue::FloatArray(v) => v.first().copied(),
        _ => None,
    }
}
