//! # Initial Shapes
//!
//! The footprint polygon a rule package is applied to: one outer ring,
//! optional holes, the package reference and the attribute snapshot.
//!
//! Validation runs before anything reaches the procedural engine. The engine
//! has undefined behavior for degenerate input, so every ring is checked for
//! point count, area, self-intersection and coplanarity up front.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::Hasher;

use crate::attributes::{write_str, AttributeMap};
use crate::error::{GenerationError, LotgenResult, ShapeError};

/// Largest allowed distance of any ring point from the outer ring's plane.
pub const PLANARITY_TOLERANCE: f64 = 1e-3;

/// Rings with a smaller area are degenerate.
pub const MIN_RING_AREA: f64 = 1e-4;

/// Points closer than this are the same point.
pub const POINT_EPSILON: f64 = 1e-9;

/// 3D point in the engine's coordinate frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point3 {
    /// X component
    pub x: f64,
    /// Y component
    pub y: f64,
    /// Z component
    pub z: f64,
}

impl Point3 {
    /// Creates a new point
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Origin
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    /// Converts to array
    #[must_use]
    pub const fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// Creates from array
    #[must_use]
    pub const fn from_array(arr: [f64; 3]) -> Self {
        Self::new(arr[0], arr[1], arr[2])
    }

    /// Dot product
    #[must_use]
    pub fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Cross product
    #[must_use]
    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    /// Length
    #[must_use]
    pub fn length(self) -> f64 {
        self.dot(self).sqrt()
    }

    /// True if no coordinate is NaN or infinite
    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Distance to another point
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        (self - other).length()
    }
}

impl std::ops::Add for Point3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::Sub for Point3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Mul<f64> for Point3 {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl From<[f64; 3]> for Point3 {
    fn from(arr: [f64; 3]) -> Self {
        Self::from_array(arr)
    }
}

/// Identifier of a rule package, e.g. `simple_extrude` or a `.rpk` path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId(String);

impl PackageId {
    /// Creates a package identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PackageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An ordered, implicitly closed sequence of points.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ring(pub Vec<Point3>);

impl Ring {
    /// Creates a ring from anything that converts to points.
    #[must_use]
    pub fn new<P: Into<Point3>>(points: impl IntoIterator<Item = P>) -> Self {
        Self(points.into_iter().map(Into::into).collect())
    }

    /// Raw points as given.
    #[must_use]
    pub fn points(&self) -> &[Point3] {
        &self.0
    }

    /// Points with consecutive duplicates and a repeated closing point removed.
    #[must_use]
    pub fn distinct_points(&self) -> Vec<Point3> {
        let mut out: Vec<Point3> = Vec::with_capacity(self.0.len());
        for &p in &self.0 {
            if out.last().map_or(true, |&last| last.distance(p) > POINT_EPSILON) {
                out.push(p);
            }
        }
        while out.len() > 1 && out[0].distance(out[out.len() - 1]) <= POINT_EPSILON {
            out.pop();
        }
        out
    }

    /// Area-weighted normal (Newell's method). Length is twice the area.
    #[must_use]
    pub fn newell_normal(&self) -> Point3 {
        newell(&self.distinct_points())
    }

    /// Enclosed area.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.newell_normal().length() * 0.5
    }
}

/// A footprint plus everything needed to run a rule package on it.
#[derive(Clone, Debug, PartialEq)]
pub struct InitialShape {
    /// Outer boundary.
    pub outer: Ring,
    /// Hole rings, in insertion order.
    pub holes: Vec<Ring>,
    /// Rule package to apply.
    pub package: PackageId,
    /// Start rule, e.g. `Default$Lot`.
    pub start_rule: String,
    /// Defaults plus caller overrides.
    pub attributes: AttributeMap,
}

impl InitialShape {
    /// Creates a shape without holes or attributes.
    #[must_use]
    pub fn new(outer: Ring, package: impl Into<PackageId>, start_rule: impl Into<String>) -> Self {
        Self {
            outer,
            holes: Vec::new(),
            package: package.into(),
            start_rule: start_rule.into(),
            attributes: AttributeMap::new(),
        }
    }

    /// Adds a hole ring.
    #[must_use]
    pub fn with_hole(mut self, hole: Ring) -> Self {
        self.holes.push(hole);
        self
    }

    /// Replaces the attribute map.
    #[must_use]
    pub fn with_attributes(mut self, attributes: AttributeMap) -> Self {
        self.attributes = attributes;
        self
    }

    /// All rings, outer first.
    pub fn rings(&self) -> impl Iterator<Item = &Ring> {
        std::iter::once(&self.outer).chain(&self.holes)
    }

    /// Checks every ring for finite coordinates, point count, area,
    /// self-intersection and coplanarity with the outer ring, then checks
    /// that every hole lies strictly inside the outer ring.
    ///
    /// # Errors
    ///
    /// `GenerationError::InvalidShape` describing the first failing ring.
    pub fn validate(&self) -> LotgenResult<()> {
        for (index, ring) in self.rings().enumerate() {
            if let Some(point) = ring.0.iter().position(|p| !p.is_finite()) {
                return Err(GenerationError::InvalidShape(ShapeError::NonFinite { ring: index, point }));
            }
        }

        let mut plane: Option<(Point3, Point3)> = None;

        for (index, ring) in self.rings().enumerate() {
            let points = ring.distinct_points();
            check_ring(index, &points)?;

            let normal = newell(&points);
            let unit = normal * (1.0 / normal.length());
            let (origin, plane_normal) = *plane.get_or_insert((points[0], unit));

            let deviation = points
                .iter()
                .map(|&p| (p - origin).dot(plane_normal).abs())
                .fold(0.0_f64, f64::max);
            if deviation > PLANARITY_TOLERANCE {
                return Err(GenerationError::InvalidShape(ShapeError::NonPlanar {
                    ring: index,
                    deviation,
                }));
            }
        }

        if !self.holes.is_empty() {
            let outer = self.outer.distinct_points();
            let project = projector(newell(&outer));
            let outer: Vec<(f64, f64)> = outer.into_iter().map(&project).collect();
            for (offset, hole) in self.holes.iter().enumerate() {
                let hole: Vec<(f64, f64)> = hole.distinct_points().into_iter().map(&project).collect();
                if !ring_inside(&hole, &outer) {
                    return Err(GenerationError::InvalidShape(ShapeError::HoleOutside { ring: offset + 1 }));
                }
            }
        }
        Ok(())
    }

    /// Feeds package, start rule, geometry and attributes into `state`.
    pub fn fingerprint_into<H: Hasher>(&self, state: &mut H) {
        write_str(state, self.package.as_str());
        write_str(state, &self.start_rule);
        state.write_usize(self.holes.len() + 1);
        for ring in self.rings() {
            state.write_usize(ring.0.len());
            for p in &ring.0 {
                state.write_u64(p.x.to_bits());
                state.write_u64(p.y.to_bits());
                state.write_u64(p.z.to_bits());
            }
        }
        self.attributes.fingerprint_into(state);
    }

    /// Approximate size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        let points: usize = self.rings().map(|r| r.0.len()).sum();
        points * std::mem::size_of::<Point3>()
            + self.package.as_str().len()
            + self.start_rule.len()
            + self.attributes.byte_size()
    }
}

fn newell(points: &[Point3]) -> Point3 {
    let mut n = Point3::ZERO;
    for (i, &a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        n.x += (a.y - b.y) * (a.z + b.z);
        n.y += (a.z - b.z) * (a.x + b.x);
        n.z += (a.x - b.x) * (a.y + b.y);
    }
    n
}

fn check_ring(ring: usize, points: &[Point3]) -> Result<(), ShapeError> {
    if points.len() < 3 {
        return Err(ShapeError::TooFewPoints {
            ring,
            points: points.len(),
        });
    }

    let normal = newell(points);
    let project = projector(normal);
    let flat: Vec<(f64, f64)> = points.iter().map(|&p| project(p)).collect();

    let n = flat.len();
    for i in 0..n {
        let (a1, a2) = (flat[i], flat[(i + 1) % n]);
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            if adjacent {
                continue;
            }
            let (b1, b2) = (flat[j], flat[(j + 1) % n]);
            if segments_intersect(a1, a2, b1, b2) {
                return Err(ShapeError::SelfIntersecting {
                    ring,
                    first_edge: i,
                    second_edge: j,
                });
            }
        }
    }

    // After the crossing test: a symmetric bow-tie also has zero net area.
    if normal.length() * 0.5 < MIN_RING_AREA {
        return Err(ShapeError::Degenerate { ring });
    }
    Ok(())
}

/// Projection onto the axis plane most perpendicular to `normal`.
fn projector(normal: Point3) -> impl Fn(Point3) -> (f64, f64) {
    let (ax, ay, az) = (normal.x.abs(), normal.y.abs(), normal.z.abs());
    move |p: Point3| {
        if az >= ax && az >= ay {
            (p.x, p.y)
        } else if ay >= ax {
            (p.z, p.x)
        } else {
            (p.y, p.z)
        }
    }
}

/// Even-odd point-in-polygon test.
fn point_inside(p: (f64, f64), polygon: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (a, b) = (polygon[i], polygon[j]);
        if (a.1 > p.1) != (b.1 > p.1) && p.0 < (b.0 - a.0) * (p.1 - a.1) / (b.1 - a.1) + a.0 {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// True if `inner` lies strictly inside `outer`: no touching or crossing
/// edges and every point inside.
fn ring_inside(inner: &[(f64, f64)], outer: &[(f64, f64)]) -> bool {
    let edges = |ring: &[(f64, f64)]| {
        let n = ring.len();
        (0..n).map(move |i| (ring[i], ring[(i + 1) % n])).collect::<Vec<_>>()
    };
    let outer_edges = edges(outer);
    let crosses = edges(inner)
        .iter()
        .any(|&(a1, a2)| outer_edges.iter().any(|&(b1, b2)| segments_intersect(a1, a2, b1, b2)));
    !crosses && inner.iter().all(|&p| point_inside(p, outer))
}

fn orient(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> bool {
    p.0 >= a.0.min(b.0) - POINT_EPSILON
        && p.0 <= a.0.max(b.0) + POINT_EPSILON
        && p.1 >= a.1.min(b.1) - POINT_EPSILON
        && p.1 <= a.1.max(b.1) + POINT_EPSILON
}

/// Closed-segment intersection test, touching counts.
fn segments_intersect(p1: (f64, f64), p2: (f64, f64), q1: (f64, f64), q2: (f64, f64)) -> bool {
    let d1 = orient(q1, q2, p1);
    let d2 = orient(q1, q2, p2);
    let d3 = orient(p1, p2, q1);
    let d4 = orient(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1.abs() <= POINT_EPSILON && on_segment(q1, q2, p1))
        || (d2.abs() <= POINT_EPSILON && on_segment(q1, q2, p2))
        || (d3.abs() <= POINT_EPSILON && on_segment(p1, p2, q1))
        || (d4.abs() <= POINT_EPSILON && on_segment(p1, p2, q2))
}

/// Extracts the boundary rings of a triangle mesh.
///
/// An edge is on the boundary when exactly one triangle uses it (in either
/// direction). Boundary edges are chained head to tail into closed rings.
/// Open chains left over from non-manifold input are discarded.
#[must_use]
pub fn outside_windings(vertices: &[Point3], triangle_indices: &[u32]) -> Vec<Ring> {
    let mut uses: BTreeMap<(u32, u32), usize> = BTreeMap::new();
    let mut directed: Vec<(u32, u32)> = Vec::new();

    for tri in triangle_indices.chunks_exact(3) {
        for k in 0..3 {
            let (a, b) = (tri[k], tri[(k + 1) % 3]);
            *uses.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            directed.push((a, b));
        }
    }

    let mut next: BTreeMap<u32, u32> = BTreeMap::new();
    for &(a, b) in &directed {
        if uses.get(&(a.min(b), a.max(b))) == Some(&1) {
            next.insert(a, b);
        }
    }

    let mut visited = BTreeSet::new();
    let mut rings = Vec::new();
    let starts: Vec<u32> = next.keys().copied().collect();
    for start in starts {
        if visited.contains(&start) {
            continue;
        }
        let mut chain = Vec::new();
        let mut current = start;
        let closed = loop {
            if !visited.insert(current) {
                break current == start;
            }
            chain.push(current);
            match next.get(&current) {
                Some(&following) => current = following,
                None => break false,
            }
        };
        if closed && chain.len() >= 3 {
            let points = chain
                .iter()
                .filter_map(|&i| vertices.get(i as usize).copied())
                .collect::<Vec<_>>();
            if points.len() == chain.len() {
                rings.push(Ring(points));
            }
        }
    }
    rings
}
