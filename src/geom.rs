//! Planes, windings and boxes used by the shadow clipper
//!
//! The baker classifies and splits polygons against planes constantly, so
//! these types favor plain data and tight loops over generality.
//!
//! # Numeric policy
//! - Point-vs-plane classification uses a fixed distance epsilon.
//! - Polygons whose normal is near-parallel to the light direction are
//!   rejected before they can produce ill-conditioned planes.
//! - Winding vertex counts are capped; a split that would exceed the cap
//!   drops the extra vertex instead of asserting.
//!
//! Author: Moroya Sakamoto

use glam::Vec3;

/// Distance under which a point counts as lying on a plane.
pub const ON_PLANE_EPSILON: f32 = 1.0e-5;

/// Dot-product threshold under which a polygon is considered parallel to
/// the light direction and skipped as an occluder.
pub const PARALLEL_EPSILON: f32 = 0.01;

/// Maximum vertex count of a winding.
pub const MAX_WINDING_POINTS: usize = 32;

/// Which side of a plane a point lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneSide {
    /// Positive half-space.
    Front,
    /// Negative half-space.
    Back,
    /// Within [`ON_PLANE_EPSILON`] of the plane.
    On,
}

/// Classification of a whole winding against a plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolySide {
    /// Every vertex is in front (or on).
    Front,
    /// Every vertex is behind (or on).
    Back,
    /// Every vertex is on the plane.
    On,
    /// Vertices on both sides.
    Split,
}

/// An infinite plane in `normal · p + d = 0` form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    /// Unit normal.
    pub normal: Vec3,
    /// Signed offset from the origin.
    pub d: f32,
}

impl Plane {
    /// Plane with the given normal passing through `point`.
    pub fn new(normal: Vec3, point: Vec3) -> Self {
        Plane {
            normal,
            d: -normal.dot(point),
        }
    }

    /// Plane from raw components.
    pub fn from_components(normal: Vec3, d: f32) -> Self {
        Plane { normal, d }
    }

    /// Plane through three points, or `None` when they are collinear.
    pub fn from_points(a: Vec3, b: Vec3, c: Vec3) -> Option<Self> {
        let cross = (b - a).cross(c - a);
        let len = cross.length();
        if len < ON_PLANE_EPSILON {
            return None;
        }
        let normal = cross / len;
        Some(Plane::new(normal, a))
    }

    /// Signed distance from `p` to the plane.
    #[inline(always)]
    pub fn distance(&self, p: Vec3) -> f32 {
        self.normal.dot(p) + self.d
    }

    /// Classify a point.
    #[inline(always)]
    pub fn side(&self, p: Vec3) -> PlaneSide {
        let d = self.distance(p);
        if d > ON_PLANE_EPSILON {
            PlaneSide::Front
        } else if d < -ON_PLANE_EPSILON {
            PlaneSide::Back
        } else {
            PlaneSide::On
        }
    }

    /// The same plane facing the other way.
    pub fn flipped(&self) -> Plane {
        Plane {
            normal: -self.normal,
            d: -self.d,
        }
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Aabb {
    /// Box from explicit corners.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Aabb { min, max }
    }

    /// Smallest box containing every point, or `None` for an empty slice.
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        let first = *points.first()?;
        let mut aabb = Aabb {
            min: first,
            max: first,
        };
        for &p in &points[1..] {
            aabb.extend(p);
        }
        Some(aabb)
    }

    /// Grow to contain `p`.
    pub fn extend(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Grow to contain another box.
    pub fn union(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Geometric center.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// True when the boxes intersect (touching counts).
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// The eight corner points.
    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(b.x, b.y, b.z),
            Vec3::new(a.x, b.y, b.z),
        ]
    }

    /// Signed distance range `(min, max)` of the box against a plane.
    pub fn plane_range(&self, plane: &Plane) -> (f32, f32) {
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for corner in self.corners() {
            let d = plane.distance(corner);
            lo = lo.min(d);
            hi = hi.max(d);
        }
        (lo, hi)
    }
}

/// An ordered ring of coplanar points, capped at [`MAX_WINDING_POINTS`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Winding {
    points: Vec<Vec3>,
}

impl Winding {
    /// Empty winding.
    pub fn new() -> Self {
        Winding { points: Vec::new() }
    }

    /// Winding from a point slice; points beyond the cap are dropped.
    pub fn from_points(points: &[Vec3]) -> Self {
        let mut winding = Winding::new();
        for &p in points {
            winding.push(p);
        }
        winding
    }

    /// Vertex ring.
    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    /// Number of vertices.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when the winding has no vertices.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Append a vertex, silently dropping it past the cap.
    pub fn push(&mut self, p: Vec3) {
        if self.points.len() < MAX_WINDING_POINTS {
            self.points.push(p);
        }
    }

    /// Fewer than three vertices cannot bound an area.
    pub fn is_degenerate(&self) -> bool {
        self.points.len() < 3
    }

    /// Planar area by the cross-product fan around the first vertex.
    pub fn area(&self) -> f32 {
        if self.is_degenerate() {
            return 0.0;
        }
        let p0 = self.points[0];
        let mut sum = Vec3::ZERO;
        for i in 1..self.points.len() - 1 {
            sum += (self.points[i] - p0).cross(self.points[i + 1] - p0);
        }
        sum.length() * 0.5
    }

    /// Vertex average, `Vec3::ZERO` when empty.
    pub fn centroid(&self) -> Vec3 {
        if self.points.is_empty() {
            return Vec3::ZERO;
        }
        self.points.iter().copied().sum::<Vec3>() / self.points.len() as f32
    }

    /// Classify the whole winding against a plane.
    pub fn side(&self, plane: &Plane) -> PolySide {
        let mut front = false;
        let mut back = false;
        for &p in &self.points {
            match plane.side(p) {
                PlaneSide::Front => front = true,
                PlaneSide::Back => back = true,
                PlaneSide::On => {}
            }
        }
        match (front, back) {
            (true, true) => PolySide::Split,
            (true, false) => PolySide::Front,
            (false, true) => PolySide::Back,
            (false, false) => PolySide::On,
        }
    }

    /// Split against a plane into `(front, back)` fragments.
    ///
    /// A winding entirely on one side (or on the plane) comes back whole on
    /// that side; on-plane windings are returned as the front fragment.
    pub fn split(&self, plane: &Plane) -> (Option<Winding>, Option<Winding>) {
        match self.side(plane) {
            PolySide::Front | PolySide::On => return (Some(self.clone()), None),
            PolySide::Back => return (None, Some(self.clone())),
            PolySide::Split => {}
        }

        let mut front = Winding::new();
        let mut back = Winding::new();
        let n = self.points.len();
        for i in 0..n {
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            let da = plane.distance(a);
            let db = plane.distance(b);

            if da >= -ON_PLANE_EPSILON {
                front.push(a);
            }
            if da <= ON_PLANE_EPSILON {
                back.push(a);
            }
            // Edge crossing strictly from one side to the other.
            if (da > ON_PLANE_EPSILON && db < -ON_PLANE_EPSILON)
                || (da < -ON_PLANE_EPSILON && db > ON_PLANE_EPSILON)
            {
                let t = da / (da - db);
                let hit = a + (b - a) * t;
                front.push(hit);
                back.push(hit);
            }
        }

        let front = (!front.is_degenerate()).then_some(front);
        let back = (!back.is_degenerate()).then_some(back);
        (front, back)
    }
}
