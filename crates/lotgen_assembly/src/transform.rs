//! Coordinate conversion and instance transform decomposition.
//!
//! Results are right-handed, y-up and in metres. Hosts pick an
//! [`AssemblyConfig`]; [`AssemblyConfig::unreal`] converts to left-handed,
//! z-up centimetres.

use crate::error::{AssemblyError, AssemblyResult};

/// Columns shorter than this are treated as collapsed.
const MIN_AXIS_SCALE: f64 = 1e-8;

/// Target axis convention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AxisConvention {
    /// Keep the engine's axes.
    #[default]
    Identity,
    /// Right-handed y-up to left-handed z-up (swap y and z).
    YUpToZUp,
}

impl AxisConvention {
    /// Converts a direction or position.
    #[must_use]
    pub const fn vector(self, v: [f64; 3]) -> [f64; 3] {
        match self {
            Self::Identity => v,
            Self::YUpToZUp => [v[0], v[2], v[1]],
        }
    }

    /// Converts a rotation quaternion `[x, y, z, w]`.
    ///
    /// Swapping two axes mirrors the space, which reverses rotation sense.
    #[must_use]
    pub fn rotation(self, q: [f64; 4]) -> [f64; 4] {
        match self {
            Self::Identity => q,
            Self::YUpToZUp => [-q[0], -q[2], -q[1], q[3]],
        }
    }
}

/// How result coordinates map to host coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AssemblyConfig {
    /// Host units per metre.
    pub unit_scale: f64,
    /// Axis convention.
    pub axis: AxisConvention,
    /// Negate V of every UV.
    pub flip_v: bool,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            unit_scale: 1.0,
            axis: AxisConvention::Identity,
            flip_v: false,
        }
    }
}

impl AssemblyConfig {
    /// Metres y-up to centimetres z-up, V flipped.
    #[must_use]
    pub const fn unreal() -> Self {
        Self {
            unit_scale: 100.0,
            axis: AxisConvention::YUpToZUp,
            flip_v: true,
        }
    }

    /// Converts a position.
    #[must_use]
    pub fn position(&self, p: [f64; 3]) -> [f32; 3] {
        let v = self.axis.vector(p);
        [
            (v[0] * self.unit_scale) as f32,
            (v[1] * self.unit_scale) as f32,
            (v[2] * self.unit_scale) as f32,
        ]
    }

    /// Converts a normal.
    #[must_use]
    pub fn normal(&self, n: [f64; 3]) -> [f32; 3] {
        let v = self.axis.vector(n);
        [v[0] as f32, v[1] as f32, v[2] as f32]
    }

    /// Converts a UV.
    #[must_use]
    pub fn uv(&self, uv: [f64; 2]) -> [f32; 2] {
        let v = if self.flip_v { -uv[1] } else { uv[1] };
        [uv[0] as f32, v as f32]
    }

    /// Converts a decomposed transform into host space.
    #[must_use]
    pub fn transform(&self, t: Decomposed) -> Decomposed {
        let translation = self.axis.vector(t.translation);
        Decomposed {
            translation: [
                translation[0] * self.unit_scale,
                translation[1] * self.unit_scale,
                translation[2] * self.unit_scale,
            ],
            rotation: self.axis.rotation(t.rotation),
            scale: self.axis.vector(t.scale),
        }
    }
}

/// Translation, rotation and scale of an affine transform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decomposed {
    /// Translation.
    pub translation: [f64; 3],
    /// Unit quaternion `[x, y, z, w]`.
    pub rotation: [f64; 4],
    /// Per-axis scale. All negative for mirroring transforms.
    pub scale: [f64; 3],
}

impl Default for Decomposed {
    fn default() -> Self {
        Self {
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0; 3],
        }
    }
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

/// Splits a column-major 4x4 affine matrix.
///
/// A negative determinant (mirroring) is folded into the scale: the
/// rotation part is negated to stay proper and every scale turns negative.
///
/// # Errors
///
/// `SingularTransform` if any axis is collapsed.
pub fn decompose(m: &[f64; 16]) -> AssemblyResult<Decomposed> {
    let columns = [[m[0], m[1], m[2]], [m[4], m[5], m[6]], [m[8], m[9], m[10]]];
    let lengths = columns.map(|c| dot(c, c).sqrt());
    if lengths.iter().any(|&l| l < MIN_AXIS_SCALE) {
        return Err(AssemblyError::SingularTransform);
    }

    let sign = if dot(columns[0], cross(columns[1], columns[2])) < 0.0 { -1.0 } else { 1.0 };
    let r = [0, 1, 2].map(|i| columns[i].map(|v| v / lengths[i] * sign));

    Ok(Decomposed {
        translation: [m[12], m[13], m[14]],
        rotation: quaternion(&r),
        scale: lengths.map(|l| l * sign),
    })
}

/// Quaternion of a rotation given as columns.
fn quaternion(r: &[[f64; 3]; 3]) -> [f64; 4] {
    // m[row][col] = r[col][row]
    let m = |row: usize, col: usize| r[col][row];
    let trace = m(0, 0) + m(1, 1) + m(2, 2);

    let q = if trace > 0.0 {
        let s = (trace + 1.0).sqrt() * 2.0;
        [(m(2, 1) - m(1, 2)) / s, (m(0, 2) - m(2, 0)) / s, (m(1, 0) - m(0, 1)) / s, 0.25 * s]
    } else if m(0, 0) > m(1, 1) && m(0, 0) > m(2, 2) {
        let s = (1.0 + m(0, 0) - m(1, 1) - m(2, 2)).sqrt() * 2.0;
        [0.25 * s, (m(0, 1) + m(1, 0)) / s, (m(0, 2) + m(2, 0)) / s, (m(2, 1) - m(1, 2)) / s]
    } else if m(1, 1) > m(2, 2) {
        let s = (1.0 + m(1, 1) - m(0, 0) - m(2, 2)).sqrt() * 2.0;
        [(m(0, 1) + m(1, 0)) / s, 0.25 * s, (m(1, 2) + m(2, 1)) / s, (m(0, 2) - m(2, 0)) / s]
    } else {
        let s = (1.0 + m(2, 2) - m(0, 0) - m(1, 1)).sqrt() * 2.0;
        [(m(0, 2) + m(2, 0)) / s, (m(1, 2) + m(2, 1)) / s, 0.25 * s, (m(1, 0) - m(0, 1)) / s]
    };

    let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    q.map(|c| c / norm)
}
