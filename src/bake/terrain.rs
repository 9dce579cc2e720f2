//! Terrain proxy: bakes the heightfield lightmap
//!
//! # Algorithm
//! Three passes per light:
//!
//! 1. **Interior shadow marking** — a quadtree descent over the
//!    heightfield tests each square's world box against the convex plane
//!    sets of nearby interiors' box shadow volumes. Squares fully inside
//!    a volume are marked wholesale, ambiguous squares split in four, and
//!    marked cells later pay for a real shadow-tree area query. Everything
//!    else skips the expensive test entirely.
//! 2. **Terrain self-shadowing** — a scanline walk aligned with the
//!    light's dominant horizontal axis propagates a shadow-height run per
//!    lateral cell: `next = max(height, run·(1-frac) + lateral·frac +
//!    z_step)`. A cell under the incoming run is shadowed by terrain
//!    behind it. Lights with no horizontal component skip this walk.
//! 3. **Blur** — a 3x3 weighted kernel (1 2 1 / 2 4 2 / 1 2 1) smooths
//!    the color buffer; border cells keep their unblurred value.
//!
//! Author: Moroya Sakamoto

use super::interior::InteriorProxy;
use crate::geom::{Aabb, Plane, Winding};
use crate::persist::PersistChunk;
use crate::scene::{Light, Lightmap, Scene, SceneObject, TerrainBlock};
use crate::shadow::ShadowVolumeBsp;
use glam::Vec3;
use log::{debug, warn};

/// Bake adapter for one [`TerrainBlock`].
#[derive(Debug)]
pub struct TerrainProxy {
    object: usize,
    alive: bool,
    chunk_crc: u32,
    size: u32,
    shadow_mask: Vec<bool>,
    /// Baked output at heightfield resolution.
    pub lightmap: Lightmap,
}

impl TerrainProxy {
    /// Wrap the terrain at `object`.
    pub fn new(object: usize, terrain: &TerrainBlock) -> Option<Self> {
        if terrain.size == 0 {
            warn!("terrain {object} has zero size, dropped from bake");
            return None;
        }
        Some(TerrainProxy {
            object,
            alive: true,
            chunk_crc: terrain.geometry_crc(),
            size: terrain.size,
            shadow_mask: vec![false; (terrain.size * terrain.size) as usize],
            lightmap: Lightmap::new(terrain.size, terrain.size),
        })
    }

    /// Scene object index this proxy wraps.
    pub fn object_index(&self) -> usize {
        self.object
    }

    /// False once the underlying object went missing mid-bake.
    pub fn alive(&self) -> bool {
        self.alive
    }

    /// Geometry fingerprint computed at gather time.
    pub fn chunk_crc(&self) -> u32 {
        self.chunk_crc
    }

    fn terrain<'a>(&self, scene: &'a Scene) -> Option<&'a TerrainBlock> {
        match scene.objects.get(self.object) {
            Some(SceneObject::Terrain(terrain)) => Some(terrain),
            _ => None,
        }
    }

    /// Terrain participates in every directional light pass.
    pub fn pre_light(&mut self, scene: &Scene, light: &Light) -> bool {
        if !light.is_vector() {
            return false;
        }
        if self.terrain(scene).is_none() {
            self.degrade();
            return false;
        }
        true
    }

    /// Full lighting pass for one light.
    pub fn light_pass(&mut self, scene: &Scene, others: &[&InteriorProxy], light: &Light) {
        let Some(terrain) = self.terrain(scene) else {
            self.degrade();
            return;
        };

        self.shadow_mask.fill(false);
        for other in others {
            for planes in other.terrain_plane_sets() {
                mark_volume_squares(terrain, planes, &mut self.shadow_mask);
            }
        }
        let marked = self.shadow_mask.iter().filter(|m| **m).count();

        let mut bsp = ShadowVolumeBsp::new();
        for other in others {
            if !other.terrain_plane_sets().is_empty() {
                other.insert_shadow_surfaces(scene, &mut bsp, light);
            }
        }
        debug!(
            "terrain {}: {marked} marked cells, {} shadow nodes",
            self.object,
            bsp.node_count()
        );

        let self_mask = self_shadow_mask(terrain, light.direction);
        let size = self.size;
        let mut accum = vec![Vec3::ZERO; (size * size) as usize];
        for y in 0..size {
            for x in 0..size {
                let i = (y * size + x) as usize;
                if terrain.is_empty(x, y) {
                    accum[i] = light.ambient;
                    continue;
                }
                let normal = terrain.normal(x, y);
                let mut direct = light.color * normal.dot(-light.direction).max(0.0);
                if self_mask[i] {
                    direct = Vec3::ZERO;
                } else if self.shadow_mask[i] {
                    direct *= self.cell_attenuation(terrain, &bsp, x, y, normal);
                }
                accum[i] = direct + light.ambient;
            }
        }

        self.blur_into_lightmap(&accum);
    }

    /// Lit fraction of one marked cell against the working shadow tree.
    fn cell_attenuation(
        &self,
        terrain: &TerrainBlock,
        bsp: &ShadowVolumeBsp,
        x: u32,
        y: u32,
        normal: Vec3,
    ) -> f32 {
        let p00 = terrain.world_pos(x, y);
        let winding = Winding::from_points(&[
            p00,
            terrain.world_pos(x + 1, y),
            terrain.world_pos(x + 1, y + 1),
            terrain.world_pos(x, y + 1),
        ]);
        let area = winding.area();
        if area <= 0.0 {
            return 0.0;
        }
        let plane = Plane::new(normal, p00);
        (bsp.get_lit_surface_area(&winding, &plane, None) / area).clamp(0.0, 1.0)
    }

    fn blur_into_lightmap(&mut self, accum: &[Vec3]) {
        const KERNEL: [[f32; 3]; 3] = [[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]];
        let size = self.size;
        for y in 0..size {
            for x in 0..size {
                let i = (y * size + x) as usize;
                let color = if x == 0 || y == 0 || x == size - 1 || y == size - 1 {
                    accum[i]
                } else {
                    let mut sum = Vec3::ZERO;
                    for (ky, row) in KERNEL.iter().enumerate() {
                        for (kx, weight) in row.iter().enumerate() {
                            let sx = x + kx as u32 - 1;
                            let sy = y + ky as u32 - 1;
                            sum += accum[(sy * size + sx) as usize] * *weight;
                        }
                    }
                    sum / 16.0
                };
                self.lightmap.set_color(x, y, color);
            }
        }
    }

    /// Drop the per-light working state.
    pub fn post_light(&mut self) {
        self.shadow_mask.fill(false);
    }

    fn degrade(&mut self) {
        if self.alive {
            warn!("terrain {} disappeared mid-bake, degraded to no-op", self.object);
            self.alive = false;
        }
    }

    /// Persist chunk holding the full-resolution lightmap.
    pub fn make_chunk(&self) -> PersistChunk {
        PersistChunk::Terrain {
            crc: self.chunk_crc,
            width: self.lightmap.width(),
            height: self.lightmap.height(),
            data: self.lightmap.data().to_vec(),
        }
    }

    /// Check a cached chunk against this proxy without applying it.
    pub fn is_valid_chunk(&self, chunk: &PersistChunk) -> bool {
        match chunk {
            PersistChunk::Terrain {
                crc, width, height, ..
            } => *crc == self.chunk_crc && *width == self.size && *height == self.size,
            _ => false,
        }
    }

    /// Rebuild the baked lightmap from a cached chunk.
    pub fn apply_chunk(&mut self, chunk: &PersistChunk) -> bool {
        if !self.is_valid_chunk(chunk) {
            return false;
        }
        let PersistChunk::Terrain { data, .. } = chunk else {
            return false;
        };
        if data.len() != self.lightmap.data().len() {
            warn!("cached terrain lightmap has mismatched size");
            return false;
        }
        self.lightmap.data_mut().copy_from_slice(data);
        true
    }

    /// Move the baked lightmap onto the scene terrain.
    pub fn apply_to_scene(&self, scene: &mut Scene) {
        if let Some(SceneObject::Terrain(terrain)) = scene.objects.get_mut(self.object) {
            terrain.lightmap = self.lightmap.clone();
        }
    }
}

/// Mark every heightfield cell overlapping the convex volume described by
/// the inward-facing `planes`, splitting ambiguous squares in four.
pub(crate) fn mark_volume_squares(terrain: &TerrainBlock, planes: &[Plane], mask: &mut [bool]) {
    if planes.is_empty() {
        return;
    }
    let mut stack = vec![(0u32, 0u32, terrain.size)];
    while let Some((x0, y0, span)) = stack.pop() {
        let aabb = square_box(terrain, x0, y0, span);
        let mut inside_all = true;
        let mut outside = false;
        for plane in planes {
            let (lo, hi) = aabb.plane_range(plane);
            if hi < 0.0 {
                outside = true;
                break;
            }
            if lo <= 0.0 {
                inside_all = false;
            }
        }
        if outside {
            continue;
        }
        if inside_all || span == 1 {
            for y in y0..(y0 + span).min(terrain.size) {
                for x in x0..(x0 + span).min(terrain.size) {
                    mask[(y * terrain.size + x) as usize] = true;
                }
            }
            continue;
        }
        let half = span / 2;
        let rest = span - half;
        stack.push((x0, y0, half));
        stack.push((x0 + half, y0, rest));
        stack.push((x0, y0 + half, rest));
        stack.push((x0 + half, y0 + half, rest));
    }
}

/// World box of a square region of cells.
fn square_box(terrain: &TerrainBlock, x0: u32, y0: u32, span: u32) -> Aabb {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for y in y0..=(y0 + span).min(terrain.size - 1) {
        for x in x0..=(x0 + span).min(terrain.size - 1) {
            let h = terrain.height(x, y);
            lo = lo.min(h);
            hi = hi.max(h);
        }
    }
    let sq = terrain.square_size;
    Aabb::new(
        terrain.origin + Vec3::new(x0 as f32 * sq, y0 as f32 * sq, lo),
        terrain.origin
            + Vec3::new((x0 + span) as f32 * sq, (y0 + span) as f32 * sq, hi),
    )
}

/// Cells shadowed by terrain behind them along the light direction.
///
/// Lights with no horizontal component cannot rake across the
/// heightfield, so they produce no self-shadowing at all.
fn self_shadow_mask(terrain: &TerrainBlock, dir: Vec3) -> Vec<bool> {
    let size = terrain.size as usize;
    let mut mask = vec![false; size * size];
    let (ax, ay) = (dir.x.abs(), dir.y.abs());
    if ax < 1.0e-6 && ay < 1.0e-6 {
        return mask;
    }

    let x_major = ax >= ay;
    let (major, minor) = if x_major { (dir.x, dir.y) } else { (dir.y, dir.x) };
    let frac = minor.abs() / major.abs();
    let z_step = terrain.square_size * dir.z / major.abs();
    let lat: i32 = if minor > 0.0 {
        1
    } else if minor < 0.0 {
        -1
    } else {
        0
    };

    let cell = |m: usize, n: usize| -> (u32, u32) {
        if x_major {
            (m as u32, n as u32)
        } else {
            (n as u32, m as u32)
        }
    };

    let order: Vec<usize> = if major > 0.0 {
        (0..size).collect()
    } else {
        (0..size).rev().collect()
    };

    let mut run = vec![f32::NEG_INFINITY; size];
    for &m in &order {
        let mut next = vec![f32::NEG_INFINITY; size];
        for n in 0..size {
            let main = run[n];
            let n_lat = n as i32 - lat;
            let side = if (0..size as i32).contains(&n_lat) {
                run[n_lat as usize]
            } else {
                f32::NEG_INFINITY
            };
            // Blend the two upstream runs; a missing one falls back to the other.
            let incoming = match (main.is_finite(), side.is_finite()) {
                (false, false) => f32::NEG_INFINITY,
                (true, false) => main + z_step,
                (false, true) => side + z_step,
                (true, true) => main * (1.0 - frac) + side * frac + z_step,
            };

            let (x, y) = cell(m, n);
            let h = terrain.height(x, y);
            if incoming > h + 0.01 {
                mask[(y as usize) * size + x as usize] = true;
            }
            next[n] = h.max(incoming);
        }
        run = next;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_terrain(size: u32) -> TerrainBlock {
        TerrainBlock::new(size, 1.0, Vec3::ZERO)
    }

    #[test]
    fn test_flat_terrain_fully_lit() {
        let mut scene = Scene::new("terrain.mis");
        let light = Light::directional(Vec3::new(0.0, 0.0, -1.0), Vec3::ONE, Vec3::ZERO);
        scene.add_light(light.clone());
        let index = scene.add_object(SceneObject::Terrain(flat_terrain(8)));

        let mut proxy = match &scene.objects[index] {
            SceneObject::Terrain(t) => TerrainProxy::new(index, t).unwrap(),
            _ => unreachable!(),
        };
        assert!(proxy.pre_light(&scene, &light));
        proxy.light_pass(&scene, &[], &light);

        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(proxy.lightmap.texel(x, y), [255, 255, 255]);
            }
        }
    }

    #[test]
    fn test_straight_down_light_never_self_shadows() {
        let mut terrain = flat_terrain(8);
        for y in 0..8 {
            terrain.set_height(0, y, 10.0);
        }
        let mask = self_shadow_mask(&terrain, Vec3::new(0.0, 0.0, -1.0));
        assert!(mask.iter().all(|m| !m));
    }

    #[test]
    fn test_ridge_casts_self_shadow() {
        let mut terrain = flat_terrain(8);
        for y in 0..8 {
            terrain.set_height(0, y, 10.0);
        }
        // Light raking along +x, descending half a unit per cell.
        let dir = Vec3::new(1.0, 0.0, -0.5).normalize();
        let mask = self_shadow_mask(&terrain, dir);

        assert!(!mask[4 * 8]); // the ridge itself
        for x in 1..8 {
            assert!(mask[4 * 8 + x], "cell ({x}, 4) should be shadowed");
        }
    }

    #[test]
    fn test_self_shadow_ends_where_run_descends_below_ground() {
        let mut terrain = flat_terrain(16);
        for y in 0..16 {
            terrain.set_height(0, y, 3.0);
        }
        let dir = Vec3::new(1.0, 0.0, -0.5).normalize();
        let mask = self_shadow_mask(&terrain, dir);

        // Run drops 0.5/cell from height 3: cells 1..=5 shadowed, cell 8 lit.
        assert!(mask[8 * 16 + 1]);
        assert!(mask[8 * 16 + 5]);
        assert!(!mask[8 * 16 + 8]);
    }

    #[test]
    fn test_mark_volume_squares_inside_volume() {
        let terrain = flat_terrain(8);
        // Inward-facing slab over cells [2, 4) x [2, 4).
        let planes = vec![
            Plane::new(Vec3::X, Vec3::new(2.0, 0.0, 0.0)),
            Plane::new(-Vec3::X, Vec3::new(4.0, 0.0, 0.0)),
            Plane::new(Vec3::Y, Vec3::new(0.0, 2.0, 0.0)),
            Plane::new(-Vec3::Y, Vec3::new(0.0, 4.0, 0.0)),
        ];
        let mut mask = vec![false; 64];
        mark_volume_squares(&terrain, &planes, &mut mask);

        assert!(mask[2 * 8 + 2]);
        assert!(mask[3 * 8 + 3]);
        assert!(!mask[6 * 8 + 6]);
        assert!(!mask[0]);
    }

    #[test]
    fn test_blur_preserves_constant_field() {
        let mut proxy = TerrainProxy::new(0, &flat_terrain(8)).unwrap();
        let accum = vec![Vec3::splat(0.5); 64];
        proxy.blur_into_lightmap(&accum);
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(proxy.lightmap.texel(x, y), [127, 127, 127]);
            }
        }
    }

    #[test]
    fn test_chunk_round_trip() {
        let terrain = flat_terrain(4);
        let mut proxy = TerrainProxy::new(0, &terrain).unwrap();
        proxy.lightmap.set_color(1, 2, Vec3::new(0.5, 0.25, 1.0));

        let chunk = proxy.make_chunk();
        assert!(proxy.is_valid_chunk(&chunk));

        let mut fresh = TerrainProxy::new(0, &terrain).unwrap();
        assert!(fresh.apply_chunk(&chunk));
        assert_eq!(fresh.lightmap, proxy.lightmap);
    }

    #[test]
    fn test_tampered_chunk_rejected() {
        let terrain = flat_terrain(4);
        let proxy = TerrainProxy::new(0, &terrain).unwrap();
        let mut chunk = proxy.make_chunk();
        if let PersistChunk::Terrain { crc, .. } = &mut chunk {
            *crc ^= 1;
        }
        assert!(!proxy.is_valid_chunk(&chunk));
    }
}
