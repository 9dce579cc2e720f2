//! Interior proxy: bakes lightmaps for one placed interior
//!
//! # Algorithm
//! Per light, the proxy first builds a coarse occluder out of its world
//! bounding box: every box face turned toward the light becomes a shadow
//! volume in a private box tree, which other proxies probe to answer "can
//! this object shadow me at all". The same pass records one inward-facing
//! convex plane set per lit face for the terrain proxy's quadtree scan.
//!
//! The real lighting pass then builds a working shadow tree from the
//! coarse shadow-detail surfaces of every other interior that passes the
//! box test, plus the terrain squares sitting between the light and this
//! interior (selected by clipping the heightfield against complementary
//! box volumes extruded toward the light), and walks its own detail
//! levels: lightmaps are cleared, the
//! level's light-facing surfaces are inserted as occluders of themselves,
//! and every lexel is rasterized with
//! `lit_area / lexel_area * color * max(0, n · -dir) + ambient`.
//! Back-facing surfaces receive the ambient term alone. The self-surface
//! insertion is rolled back between detail levels so each level shadows
//! itself against the same external occluder set.
//!
//! Author: Moroya Sakamoto

use super::terrain::mark_volume_squares;
use crate::geom::{Aabb, Plane, Winding, PARALLEL_EPSILON};
use crate::persist::{delta_decode, delta_encode, DeltaLightmap, DetailLightmaps, PersistChunk};
use crate::scene::{InteriorInstance, Light, Lightmap, Scene, SceneObject, Surface};
use crate::shadow::{ShadowVolumeBsp, SurfaceInfo, SvPoly};
use glam::Vec3;
use log::{debug, warn};

/// Bake adapter for one [`InteriorInstance`].
#[derive(Debug)]
pub struct InteriorProxy {
    object: usize,
    alive: bool,
    chunk_crc: u32,
    // Per-light coarse occluder state.
    world_box: Option<Aabb>,
    box_bsp: ShadowVolumeBsp,
    lit_box_polys: Vec<SvPoly>,
    terrain_plane_sets: Vec<Vec<Plane>>,
    terrain_clip_sets: Vec<Vec<Plane>>,
    /// Baked output, `[detail][lightmap_index]`.
    pub lightmaps: Vec<Vec<Lightmap>>,
}

impl InteriorProxy {
    /// Wrap the interior at `object`, or `None` when the shape carries no
    /// detail levels and cannot participate.
    pub fn new(object: usize, instance: &InteriorInstance) -> Option<Self> {
        if instance.shape.details.is_empty() {
            warn!("interior {object} has no detail levels, dropped from bake");
            return None;
        }
        let lightmaps = instance
            .shape
            .details
            .iter()
            .map(|d| d.empty_lightmaps())
            .collect();
        Some(InteriorProxy {
            object,
            alive: true,
            chunk_crc: instance.geometry_crc(),
            world_box: None,
            box_bsp: ShadowVolumeBsp::new(),
            lit_box_polys: Vec::new(),
            terrain_plane_sets: Vec::new(),
            terrain_clip_sets: Vec::new(),
            lightmaps,
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

    /// Convex inward-facing plane sets of the lit box-face volumes, for
    /// terrain shadow scans.
    pub fn terrain_plane_sets(&self) -> &[Vec<Plane>] {
        &self.terrain_plane_sets
    }

    fn instance<'a>(&self, scene: &'a Scene) -> Option<&'a InteriorInstance> {
        match scene.objects.get(self.object) {
            Some(SceneObject::Interior(instance)) => Some(instance),
            _ => None,
        }
    }

    /// Build the coarse box occluder for this light. Returns false when
    /// the proxy sits this light out.
    pub fn pre_light(&mut self, scene: &Scene, light: &Light) -> bool {
        if !light.is_vector() {
            return false;
        }
        let Some(instance) = self.instance(scene) else {
            self.degrade();
            return false;
        };
        let Some(world_box) = instance.world_box() else {
            return false;
        };

        self.world_box = Some(world_box);
        self.box_bsp = ShadowVolumeBsp::new();
        self.lit_box_polys.clear();
        self.terrain_plane_sets.clear();
        self.terrain_clip_sets.clear();

        for (winding, plane) in box_faces(&world_box) {
            if plane.normal.dot(light.direction) > -PARALLEL_EPSILON {
                continue;
            }
            let Some(volume) =
                self.box_bsp
                    .build_poly_volume(&winding, &plane, light.direction, None)
            else {
                continue;
            };
            // Complementary volume extruded toward the light. Terrain
            // squares inside it sit between the light and this interior.
            if let Some(clip) = self.box_bsp.build_poly_volume(
                &winding,
                &plane.flipped(),
                -light.direction,
                None,
            ) {
                self.terrain_clip_sets
                    .push(self.box_bsp.volume_planes(clip));
            }
            let poly = SvPoly {
                winding,
                plane,
                volume: Some(volume),
                surface: None,
            };
            self.box_bsp.insert_poly(&poly);
            self.terrain_plane_sets
                .push(self.box_bsp.volume_planes(volume));
            self.lit_box_polys.push(poly);
        }
        true
    }

    /// Box-level test: can `other` shadow any part of this interior?
    pub fn is_shadowed_by(&self, other: &InteriorProxy) -> bool {
        let (Some(own_box), Some(other_box)) = (self.world_box, other.world_box) else {
            return false;
        };
        if own_box.overlaps(&other_box) {
            return true;
        }
        self.lit_box_polys
            .iter()
            .any(|poly| other.box_bsp.test_poly(poly))
    }

    /// Insert this interior's shadow-detail surfaces into a working tree
    /// as pure occluders.
    pub fn insert_shadow_surfaces(
        &self,
        scene: &Scene,
        bsp: &mut ShadowVolumeBsp,
        light: &Light,
    ) {
        let Some(instance) = self.instance(scene) else {
            return;
        };
        let detail = instance.shape.shadow_detail();
        for surface in &instance.shape.details[detail].surfaces {
            let winding = world_winding(instance, surface);
            let plane = instance.plane_to_world(&surface.plane);
            let Some(volume) = bsp.build_poly_volume(&winding, &plane, light.direction, None)
            else {
                continue;
            };
            bsp.insert_poly(&SvPoly {
                winding,
                plane,
                volume: Some(volume),
                surface: None,
            });
        }
    }

    /// Full lighting pass for one light.
    pub fn light_pass(&mut self, scene: &Scene, others: &[&InteriorProxy], light: &Light) {
        let Some(instance) = self.instance(scene) else {
            self.degrade();
            return;
        };

        let mut bsp = ShadowVolumeBsp::new();
        let mut occluders = 0;
        for other in others {
            if self.is_shadowed_by(other) {
                other.insert_shadow_surfaces(scene, &mut bsp, light);
                occluders += 1;
            }
        }
        self.insert_terrain_occluders(scene, &mut bsp, light);
        debug!(
            "interior {}: {} external occluders, {} shadow nodes",
            self.object,
            occluders,
            bsp.node_count()
        );

        for (detail_index, detail) in instance.shape.details.iter().enumerate() {
            for lightmap in &mut self.lightmaps[detail_index] {
                lightmap.clear();
            }

            bsp.begin_interior();
            let mut infos: Vec<Option<u32>> = Vec::with_capacity(detail.surfaces.len());
            for (surface_index, surface) in detail.surfaces.iter().enumerate() {
                let plane = instance.plane_to_world(&surface.plane);
                if plane.normal.dot(light.direction) > -PARALLEL_EPSILON {
                    // Turned away from the light: ambient only, no volume.
                    self.fill_ambient(detail_index, surface, light.ambient);
                    infos.push(None);
                    continue;
                }
                let winding = world_winding(instance, surface);
                let info = bsp.add_surface(SurfaceInfo {
                    surface_index: surface_index as u32,
                    plane,
                });
                let volume = bsp.build_poly_volume(&winding, &plane, light.direction, Some(info));
                if volume.is_some() {
                    bsp.insert_poly(&SvPoly {
                        winding,
                        plane,
                        volume,
                        surface: Some(info),
                    });
                }
                infos.push(Some(info));
            }

            for (surface, info) in detail.surfaces.iter().zip(&infos) {
                let Some(info) = *info else { continue };
                self.rasterize(instance, detail_index, surface, &bsp, info, light);
            }
            bsp.remove_last_interior();
        }
    }

    fn fill_ambient(&mut self, detail: usize, surface: &Surface, ambient: Vec3) {
        let pages = &mut self.lightmaps[detail];
        let rect = surface.rect;
        for t in 0..rect.height {
            for s in 0..rect.width {
                pages[surface.lightmap_index as usize].add_color(rect.x + s, rect.y + t, ambient);
                if let Some(alarm) = surface.alarm_lightmap_index {
                    pages[alarm as usize].add_color(rect.x + s, rect.y + t, ambient);
                }
            }
        }
    }

    fn rasterize(
        &mut self,
        instance: &InteriorInstance,
        detail: usize,
        surface: &Surface,
        bsp: &ShadowVolumeBsp,
        info: u32,
        light: &Light,
    ) {
        let plane = instance.plane_to_world(&surface.plane);
        let n_dot = (-plane.normal.dot(light.direction)).max(0.0);
        let rect = surface.rect;

        for t in 0..rect.height {
            for s in 0..rect.width {
                let base = surface.lm_origin
                    + surface.s_vec * s as f32
                    + surface.t_vec * t as f32;
                let lexel = Winding::from_points(&[
                    instance.to_world(base),
                    instance.to_world(base + surface.s_vec),
                    instance.to_world(base + surface.s_vec + surface.t_vec),
                    instance.to_world(base + surface.t_vec),
                ]);
                let lexel_area = lexel.area();
                let atten = if lexel_area > 0.0 {
                    let lit = bsp.get_lit_surface_area(&lexel, &plane, Some(info));
                    (lit / lexel_area).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let color = light.color * n_dot * atten + light.ambient;
                let pages = &mut self.lightmaps[detail];
                pages[surface.lightmap_index as usize].add_color(rect.x + s, rect.y + t, color);
                if let Some(alarm) = surface.alarm_lightmap_index {
                    pages[alarm as usize].add_color(rect.x + s, rect.y + t, color);
                }
            }
        }
    }

    /// Insert the terrain squares sitting between the light and this
    /// interior as occluders. Candidate squares come from clipping the
    /// heightfield against the toward-light box volumes; each survivor
    /// contributes its two triangles.
    fn insert_terrain_occluders(&self, scene: &Scene, bsp: &mut ShadowVolumeBsp, light: &Light) {
        if self.terrain_clip_sets.is_empty() {
            return;
        }
        for object in &scene.objects {
            let SceneObject::Terrain(terrain) = object else {
                continue;
            };
            let mut mask = vec![false; (terrain.size * terrain.size) as usize];
            for planes in &self.terrain_clip_sets {
                mark_volume_squares(terrain, planes, &mut mask);
            }
            for y in 0..terrain.size {
                for x in 0..terrain.size {
                    if !mask[(y * terrain.size + x) as usize] || terrain.is_empty(x, y) {
                        continue;
                    }
                    let p00 = terrain.world_pos(x, y);
                    let p10 = terrain.world_pos(x + 1, y);
                    let p11 = terrain.world_pos(x + 1, y + 1);
                    let p01 = terrain.world_pos(x, y + 1);
                    for tri in [[p00, p10, p11], [p00, p11, p01]] {
                        let Some(plane) = Plane::from_points(tri[0], tri[1], tri[2]) else {
                            continue;
                        };
                        let winding = Winding::from_points(&tri);
                        let Some(volume) =
                            bsp.build_poly_volume(&winding, &plane, light.direction, None)
                        else {
                            continue;
                        };
                        bsp.insert_poly(&SvPoly {
                            winding,
                            plane,
                            volume: Some(volume),
                            surface: None,
                        });
                    }
                }
            }
        }
    }

    /// Drop the per-light working state.
    pub fn post_light(&mut self) {
        self.world_box = None;
        self.box_bsp = ShadowVolumeBsp::new();
        self.lit_box_polys.clear();
        self.terrain_plane_sets.clear();
        self.terrain_clip_sets.clear();
    }

    fn degrade(&mut self) {
        if self.alive {
            warn!("interior {} disappeared mid-bake, degraded to no-op", self.object);
            self.alive = false;
        }
    }

    /// Delta-encoded persist chunk against the instance's base lightmaps.
    pub fn make_chunk(&self, scene: &Scene) -> PersistChunk {
        let mut details = Vec::with_capacity(self.lightmaps.len());
        let base = self.instance(scene).map(|i| &i.base_lightmaps);
        for (detail_index, pages) in self.lightmaps.iter().enumerate() {
            let mut lightmaps = Vec::with_capacity(pages.len());
            for (page_index, page) in pages.iter().enumerate() {
                let delta = match base.and_then(|b| b.get(detail_index)?.get(page_index)) {
                    Some(base_page) => delta_encode(base_page, page),
                    None => page.data().to_vec(),
                };
                lightmaps.push(DeltaLightmap {
                    index: page_index as u32,
                    width: page.width(),
                    height: page.height(),
                    delta,
                });
            }
            details.push(DetailLightmaps { lightmaps });
        }
        PersistChunk::Interior {
            crc: self.chunk_crc,
            details,
        }
    }

    /// Check a cached chunk against this proxy without applying it.
    pub fn is_valid_chunk(&self, chunk: &PersistChunk) -> bool {
        match chunk {
            PersistChunk::Interior { crc, details } => {
                *crc == self.chunk_crc && details.len() == self.lightmaps.len()
            }
            _ => false,
        }
    }

    /// Rebuild the baked lightmaps from a cached chunk.
    ///
    /// Returns false (leaving the proxy untouched) when the chunk does not
    /// match this proxy.
    pub fn apply_chunk(&mut self, scene: &Scene, chunk: &PersistChunk) -> bool {
        if !self.is_valid_chunk(chunk) {
            return false;
        }
        let PersistChunk::Interior { details, .. } = chunk else {
            return false;
        };
        let Some(instance) = self.instance(scene) else {
            return false;
        };
        for (detail_index, detail) in details.iter().enumerate() {
            for lm in &detail.lightmaps {
                let base = instance
                    .base_lightmaps
                    .get(detail_index)
                    .and_then(|pages| pages.get(lm.index as usize));
                let Some(base) = base else {
                    warn!("cached lightmap index {} out of range", lm.index);
                    return false;
                };
                if base.width() != lm.width || base.height() != lm.height {
                    warn!("cached lightmap {} has mismatched dimensions", lm.index);
                    return false;
                }
                self.lightmaps[detail_index][lm.index as usize] = delta_decode(base, &lm.delta);
            }
        }
        true
    }

    /// Move the baked lightmaps onto the scene instance.
    pub fn apply_to_scene(&self, scene: &mut Scene) {
        if let Some(SceneObject::Interior(instance)) = scene.objects.get_mut(self.object) {
            instance.lightmaps = self.lightmaps.clone();
        }
    }
}

fn world_winding(instance: &InteriorInstance, surface: &Surface) -> Winding {
    Winding::from_points(
        &surface
            .winding
            .points()
            .iter()
            .map(|&p| instance.to_world(p))
            .collect::<Vec<_>>(),
    )
}

/// The six faces of a box as (ring, outward plane) pairs.
fn box_faces(aabb: &Aabb) -> Vec<(Winding, Plane)> {
    let (a, b) = (aabb.min, aabb.max);
    let face = |points: [Vec3; 4], normal: Vec3| {
        (
            Winding::from_points(&points),
            Plane::new(normal, points[0]),
        )
    };
    vec![
        face(
            [
                Vec3::new(a.x, a.y, a.z),
                Vec3::new(a.x, b.y, a.z),
                Vec3::new(a.x, b.y, b.z),
                Vec3::new(a.x, a.y, b.z),
            ],
            -Vec3::X,
        ),
        face(
            [
                Vec3::new(b.x, a.y, a.z),
                Vec3::new(b.x, b.y, a.z),
                Vec3::new(b.x, b.y, b.z),
                Vec3::new(b.x, a.y, b.z),
            ],
            Vec3::X,
        ),
        face(
            [
                Vec3::new(a.x, a.y, a.z),
                Vec3::new(b.x, a.y, a.z),
                Vec3::new(b.x, a.y, b.z),
                Vec3::new(a.x, a.y, b.z),
            ],
            -Vec3::Y,
        ),
        face(
            [
                Vec3::new(a.x, b.y, a.z),
                Vec3::new(b.x, b.y, a.z),
                Vec3::new(b.x, b.y, b.z),
                Vec3::new(a.x, b.y, b.z),
            ],
            Vec3::Y,
        ),
        face(
            [
                Vec3::new(a.x, a.y, a.z),
                Vec3::new(b.x, a.y, a.z),
                Vec3::new(b.x, b.y, a.z),
                Vec3::new(a.x, b.y, a.z),
            ],
            -Vec3::Z,
        ),
        face(
            [
                Vec3::new(a.x, a.y, b.z),
                Vec3::new(b.x, a.y, b.z),
                Vec3::new(b.x, b.y, b.z),
                Vec3::new(a.x, b.y, b.z),
            ],
            Vec3::Z,
        ),
    ]
}
