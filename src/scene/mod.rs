//! Scene inputs and lightmap storage for the baker
//!
//! The baker consumes a read-only view of the scene: directional lights,
//! convex-sector interiors with per-surface lexel grids, and a heightfield
//! terrain block. Its only outputs are the lightmap images stored here.
//!
//! Geometry fingerprints are CRC32 digests over the defining content of an
//! object (vertices, transform, lexel layout). They gate bake-cache reuse:
//! a cached chunk is only trusted when its recorded CRC equals the freshly
//! computed one.
//!
//! Author: Moroya Sakamoto

use crate::geom::{Aabb, Plane, Winding};
use glam::Vec3;

/// Kind of a scene light.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    /// Infinite directional light. The only kind that participates in baking.
    Vector,
    /// Point light (ignored by the baker).
    Point,
    /// Spot light (ignored by the baker).
    Spot,
}

/// A scene light. Read-only input to the bake.
#[derive(Debug, Clone)]
pub struct Light {
    /// Light kind.
    pub kind: LightKind,
    /// Unit direction the light travels (from the light into the scene).
    pub direction: Vec3,
    /// Direct color, 0..1 per channel.
    pub color: Vec3,
    /// Constant ambient term, 0..1 per channel.
    pub ambient: Vec3,
}

impl Light {
    /// Directional light; the direction is normalized here.
    pub fn directional(direction: Vec3, color: Vec3, ambient: Vec3) -> Self {
        Light {
            kind: LightKind::Vector,
            direction: direction.normalize_or_zero(),
            color,
            ambient,
        }
    }

    /// True for lights the baker processes.
    pub fn is_vector(&self) -> bool {
        self.kind == LightKind::Vector
    }
}

/// An RGB8 lightmap image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lightmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Lightmap {
    /// Zeroed (black) lightmap.
    pub fn new(width: u32, height: u32) -> Self {
        Lightmap {
            width,
            height,
            data: vec![0; (width * height * 3) as usize],
        }
    }

    /// Width in texels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in texels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGB8 bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Reset every texel to black.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    #[inline(always)]
    fn offset(&self, x: u32, y: u32) -> usize {
        ((y * self.width + x) * 3) as usize
    }

    /// One texel as RGB bytes.
    pub fn texel(&self, x: u32, y: u32) -> [u8; 3] {
        let o = self.offset(x, y);
        [self.data[o], self.data[o + 1], self.data[o + 2]]
    }

    /// Overwrite one texel from a 0..1 color.
    pub fn set_color(&mut self, x: u32, y: u32, color: Vec3) {
        let o = self.offset(x, y);
        let c = color.clamp(Vec3::ZERO, Vec3::ONE) * 255.0;
        self.data[o] = c.x as u8;
        self.data[o + 1] = c.y as u8;
        self.data[o + 2] = c.z as u8;
    }

    /// Saturating-add a 0..1 color into one texel.
    pub fn add_color(&mut self, x: u32, y: u32, color: Vec3) {
        let o = self.offset(x, y);
        let c = color.clamp(Vec3::ZERO, Vec3::ONE) * 255.0;
        self.data[o] = self.data[o].saturating_add(c.x as u8);
        self.data[o + 1] = self.data[o + 1].saturating_add(c.y as u8);
        self.data[o + 2] = self.data[o + 2].saturating_add(c.z as u8);
    }
}

/// Placement of a surface's lexel grid inside its lightmap page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightmapRect {
    /// Left texel.
    pub x: u32,
    /// Top texel.
    pub y: u32,
    /// Width in lexels.
    pub width: u32,
    /// Height in lexels.
    pub height: u32,
}

/// One lightable interior surface.
///
/// The lexel grid is described in world space: lexel `(s, t)` covers the
/// quad at `origin + s*s_vec + t*t_vec`.
#[derive(Debug, Clone)]
pub struct Surface {
    /// Boundary polygon in object space.
    pub winding: Winding,
    /// Supporting plane in object space.
    pub plane: Plane,
    /// Lightmap page this surface rasterizes into.
    pub lightmap_index: u32,
    /// Alarm-state lightmap page, when the surface has one.
    pub alarm_lightmap_index: Option<u32>,
    /// World offset of lexel (0, 0) in object space.
    pub lm_origin: Vec3,
    /// Object-space step per lexel along s.
    pub s_vec: Vec3,
    /// Object-space step per lexel along t.
    pub t_vec: Vec3,
    /// Region of the lightmap page owned by this surface.
    pub rect: LightmapRect,
}

/// One geometric detail level of an interior shape.
#[derive(Debug, Clone, Default)]
pub struct DetailLevel {
    /// Lightable surfaces.
    pub surfaces: Vec<Surface>,
    /// Dimensions of each lightmap page, indexed by `lightmap_index`.
    pub lightmap_sizes: Vec<(u32, u32)>,
}

impl DetailLevel {
    /// Fresh zeroed lightmap pages sized for this level.
    pub fn empty_lightmaps(&self) -> Vec<Lightmap> {
        self.lightmap_sizes
            .iter()
            .map(|&(w, h)| Lightmap::new(w, h))
            .collect()
    }
}

/// Shared interior geometry: one or more detail levels, finest first.
#[derive(Debug, Clone, Default)]
pub struct InteriorShape {
    /// Detail levels; the last is the coarse shadow detail.
    pub details: Vec<DetailLevel>,
}

impl InteriorShape {
    /// Index of the level used when this shape occludes other objects.
    pub fn shadow_detail(&self) -> usize {
        self.details.len().saturating_sub(1)
    }
}

/// A placed interior: shape plus transform plus lightmap storage.
#[derive(Debug, Clone)]
pub struct InteriorInstance {
    /// Geometry.
    pub shape: InteriorShape,
    /// World translation.
    pub translation: Vec3,
    /// Uniform world scale.
    pub scale: f32,
    /// Unlit base lightmaps, `[detail][lightmap_index]`.
    pub base_lightmaps: Vec<Vec<Lightmap>>,
    /// Baked lightmaps, same shape as the base set.
    pub lightmaps: Vec<Vec<Lightmap>>,
}

impl InteriorInstance {
    /// Instance with zeroed base and output lightmaps.
    pub fn new(shape: InteriorShape, translation: Vec3, scale: f32) -> Self {
        let base: Vec<Vec<Lightmap>> =
            shape.details.iter().map(|d| d.empty_lightmaps()).collect();
        InteriorInstance {
            shape,
            translation,
            scale,
            lightmaps: base.clone(),
            base_lightmaps: base,
        }
    }

    /// Object-space point to world space.
    #[inline(always)]
    pub fn to_world(&self, p: Vec3) -> Vec3 {
        p * self.scale + self.translation
    }

    /// Object-space direction vector to world space (no translation).
    #[inline(always)]
    pub fn vec_to_world(&self, v: Vec3) -> Vec3 {
        v * self.scale
    }

    /// Object-space plane transformed to world space.
    pub fn plane_to_world(&self, plane: &Plane) -> Plane {
        // Uniform scale + translation preserves the normal.
        Plane::from_components(plane.normal, plane.d * self.scale
            - plane.normal.dot(self.translation))
    }

    /// World bounding box over every detail level's vertices.
    pub fn world_box(&self) -> Option<Aabb> {
        let mut aabb: Option<Aabb> = None;
        for detail in &self.shape.details {
            for surface in &detail.surfaces {
                for &p in surface.winding.points() {
                    let w = self.to_world(p);
                    match aabb.as_mut() {
                        Some(b) => b.extend(w),
                        None => aabb = Some(Aabb::new(w, w)),
                    }
                }
            }
        }
        aabb
    }

    /// Content fingerprint over geometry, transform and lexel layout.
    pub fn geometry_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hash_f32s(&mut hasher, &[self.translation.x, self.translation.y,
            self.translation.z, self.scale]);
        for detail in &self.shape.details {
            hasher.update(&(detail.surfaces.len() as u32).to_le_bytes());
            for surface in &detail.surfaces {
                for &p in surface.winding.points() {
                    hash_f32s(&mut hasher, &[p.x, p.y, p.z]);
                }
                let n = surface.plane.normal;
                hash_f32s(&mut hasher, &[n.x, n.y, n.z, surface.plane.d]);
                hash_f32s(
                    &mut hasher,
                    &[
                        surface.lm_origin.x,
                        surface.lm_origin.y,
                        surface.lm_origin.z,
                        surface.s_vec.x,
                        surface.s_vec.y,
                        surface.s_vec.z,
                        surface.t_vec.x,
                        surface.t_vec.y,
                        surface.t_vec.z,
                    ],
                );
                hasher.update(&surface.lightmap_index.to_le_bytes());
                let alarm = surface.alarm_lightmap_index.map_or(u32::MAX, |i| i);
                hasher.update(&alarm.to_le_bytes());
                hasher.update(&surface.rect.x.to_le_bytes());
                hasher.update(&surface.rect.y.to_le_bytes());
                hasher.update(&surface.rect.width.to_le_bytes());
                hasher.update(&surface.rect.height.to_le_bytes());
            }
            hasher.update(&(detail.lightmap_sizes.len() as u32).to_le_bytes());
            for &(w, h) in &detail.lightmap_sizes {
                hasher.update(&w.to_le_bytes());
                hasher.update(&h.to_le_bytes());
            }
        }
        hasher.finalize()
    }
}

/// A square heightfield terrain block.
#[derive(Debug, Clone)]
pub struct TerrainBlock {
    /// Cells per side; the lightmap has the same resolution.
    pub size: u32,
    /// World units per cell.
    pub square_size: f32,
    /// World position of cell (0, 0).
    pub origin: Vec3,
    heights: Vec<f32>,
    empty: Vec<bool>,
    /// Baked terrain lightmap.
    pub lightmap: Lightmap,
}

impl TerrainBlock {
    /// Flat terrain at the origin's height.
    pub fn new(size: u32, square_size: f32, origin: Vec3) -> Self {
        TerrainBlock {
            size,
            square_size,
            origin,
            heights: vec![0.0; (size * size) as usize],
            empty: vec![false; (size * size) as usize],
            lightmap: Lightmap::new(size, size),
        }
    }

    #[inline(always)]
    fn index(&self, x: u32, y: u32) -> usize {
        let x = x.min(self.size - 1);
        let y = y.min(self.size - 1);
        (y * self.size + x) as usize
    }

    /// Height of one cell (clamped at the borders).
    pub fn height(&self, x: u32, y: u32) -> f32 {
        self.heights[self.index(x, y)]
    }

    /// Set one cell's height.
    pub fn set_height(&mut self, x: u32, y: u32, h: f32) {
        let i = self.index(x, y);
        self.heights[i] = h;
    }

    /// True when the cell holds no visible geometry.
    pub fn is_empty(&self, x: u32, y: u32) -> bool {
        self.empty[self.index(x, y)]
    }

    /// Mark a cell as holding no visible geometry.
    pub fn set_empty(&mut self, x: u32, y: u32, empty: bool) {
        let i = self.index(x, y);
        self.empty[i] = empty;
    }

    /// World position of a cell corner.
    pub fn world_pos(&self, x: u32, y: u32) -> Vec3 {
        self.origin
            + Vec3::new(
                x as f32 * self.square_size,
                y as f32 * self.square_size,
                self.height(x, y),
            )
    }

    /// Surface normal at a cell by central differences.
    pub fn normal(&self, x: u32, y: u32) -> Vec3 {
        let xl = self.height(x.saturating_sub(1), y);
        let xr = self.height(x + 1, y);
        let yl = self.height(x, y.saturating_sub(1));
        let yr = self.height(x, y + 1);
        Vec3::new(xl - xr, yl - yr, 2.0 * self.square_size).normalize_or_zero()
    }

    /// World bounding box of the whole block.
    pub fn world_box(&self) -> Aabb {
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for &h in &self.heights {
            lo = lo.min(h);
            hi = hi.max(h);
        }
        let extent = self.size as f32 * self.square_size;
        Aabb::new(
            self.origin + Vec3::new(0.0, 0.0, lo),
            self.origin + Vec3::new(extent, extent, hi),
        )
    }

    /// Content fingerprint over heights, layout and emptiness.
    pub fn geometry_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.size.to_le_bytes());
        hash_f32s(&mut hasher, &[self.square_size, self.origin.x,
            self.origin.y, self.origin.z]);
        for &h in &self.heights {
            hasher.update(&h.to_le_bytes());
        }
        for &e in &self.empty {
            hasher.update(&[e as u8]);
        }
        hasher.finalize()
    }
}

/// One bakeable scene object.
#[derive(Debug, Clone)]
pub enum SceneObject {
    /// Convex-sector interior instance.
    Interior(InteriorInstance),
    /// Heightfield terrain block.
    Terrain(TerrainBlock),
}

/// A complete bakeable scene.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    /// Mission name; its stem keys the bake-cache filename.
    pub name: String,
    /// Scene lights.
    pub lights: Vec<Light>,
    /// Objects in gather order. The bake-cache chunk list aligns 1:1
    /// with this ordering.
    pub objects: Vec<SceneObject>,
}

impl Scene {
    /// Empty scene with a mission name.
    pub fn new(name: impl Into<String>) -> Self {
        Scene {
            name: name.into(),
            lights: Vec::new(),
            objects: Vec::new(),
        }
    }

    /// Add a light.
    pub fn add_light(&mut self, light: Light) {
        self.lights.push(light);
    }

    /// Add an object, returning its stable index.
    pub fn add_object(&mut self, object: SceneObject) -> usize {
        self.objects.push(object);
        self.objects.len() - 1
    }

    /// Mission fingerprint over the mission name.
    pub fn mission_crc(&self) -> u32 {
        crc32fast::hash(self.name.as_bytes())
    }
}

fn hash_f32s(hasher: &mut crc32fast::Hasher, values: &[f32]) {
    for v in values {
        hasher.update(&v.to_le_bytes());
    }
}
