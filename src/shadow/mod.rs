//! Shadow-volume BSP engine
//!
//! Builds a binary-space-partition tree whose interior region is the union
//! of the shadows a set of occluder polygons cast for one light direction,
//! and answers "how much of this patch is lit" queries by clipping the
//! patch down the tree and integrating the area of the fragments that
//! reach lit leaves.
//!
//! # Algorithm
//! - `build_poly_volume` extrudes an occluder polygon's edges along the
//!   light direction and closes the volume with the flipped polygon plane.
//!   Volume planes face inward, so the volume interior is the front side
//!   of every plane in the chain.
//! - `insert_poly` clips the occluder polygon down the aggregate tree;
//!   every fragment that reaches a lit leaf replaces that leaf with the
//!   volume's plane chain. Fragments reaching shadowed leaves are dropped,
//!   which yields the union of all inserted volumes.
//! - `get_lit_surface_area` clips a query patch the same way and sums the
//!   area of fragments landing in lit leaves. A fragment landing in the
//!   volume cast by the query's own surface counts as lit, so a surface
//!   never darkens itself.
//!
//! Node and plane storage is a flat index arena; `remove_last_interior`
//! rolls the arena back to a recorded watermark and heals any child link
//! left dangling, which lets the baker re-use one tree across the detail
//! levels of a single interior.
//!
//! Author: Moroya Sakamoto

use crate::geom::{Plane, PolySide, Winding, PARALLEL_EPSILON};
use glam::Vec3;
use log::debug;

/// A leaf or interior link in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Child {
    /// Interior node index.
    Node(u32),
    /// Lit leaf.
    Lit,
    /// Shadowed leaf, tagged with the volume that produced it.
    Shadowed(u32),
}

#[derive(Debug, Clone, Copy)]
struct SvNode {
    plane: u32,
    front: Child,
    back: Child,
}

#[derive(Debug, Clone)]
struct Volume {
    /// Inward-facing plane chain: edge planes then the flipped cap.
    planes: Vec<u32>,
    /// Surface the volume was cast by, when it came from a real surface.
    surface: Option<u32>,
}

/// Back-reference from a shadow volume to the lightable surface that cast
/// it. Registered once per inserted self-surface so area queries can
/// exclude a surface's own shadow.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceInfo {
    /// Caller-side surface ordinal.
    pub surface_index: u32,
    /// Supporting plane in world space.
    pub plane: Plane,
}

/// An occluder polygon plus the shadow volume it generated.
///
/// Cloning one is cheap enough to test the same shadow shape against
/// several other proxies without mutation races.
#[derive(Debug, Clone)]
pub struct SvPoly {
    /// Boundary winding in world space.
    pub winding: Winding,
    /// Supporting plane in world space.
    pub plane: Plane,
    /// Volume handle from [`ShadowVolumeBsp::build_poly_volume`].
    pub volume: Option<u32>,
    /// Surface-info handle when the polygon is a real lightable surface.
    pub surface: Option<u32>,
}

/// Rollback point for [`ShadowVolumeBsp::remove_last_interior`].
#[derive(Debug, Clone, Copy)]
struct Watermark {
    nodes: usize,
    planes: usize,
    volumes: usize,
    surfaces: usize,
}

/// Aggregate shadow-volume tree for one light pass.
#[derive(Debug, Default)]
pub struct ShadowVolumeBsp {
    nodes: Vec<SvNode>,
    planes: Vec<Plane>,
    volumes: Vec<Volume>,
    surfaces: Vec<SurfaceInfo>,
    root: Option<Child>,
    interior_mark: Option<Watermark>,
}

impl ShadowVolumeBsp {
    /// Empty tree; everything is lit.
    pub fn new() -> Self {
        ShadowVolumeBsp::default()
    }

    /// Number of interior nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of inserted shadow volumes.
    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    /// Register the surface a following volume will be cast by.
    pub fn add_surface(&mut self, info: SurfaceInfo) -> u32 {
        self.surfaces.push(info);
        (self.surfaces.len() - 1) as u32
    }

    /// Build the shadow volume of one occluder polygon.
    ///
    /// Returns `None` for degenerate polygons and for polygons that do not
    /// face the light (their volume would add no shadow). The caller
    /// stores the handle on its [`SvPoly`] before inserting.
    pub fn build_poly_volume(
        &mut self,
        winding: &Winding,
        plane: &Plane,
        light_dir: Vec3,
        surface: Option<u32>,
    ) -> Option<u32> {
        if winding.is_degenerate() {
            return None;
        }
        if plane.normal.dot(light_dir) > -PARALLEL_EPSILON {
            return None;
        }

        // Any point pushed from the polygon along the light is inside the
        // volume; used to orient the edge planes inward.
        let inside = winding.centroid() + light_dir;

        let mut plane_indices = Vec::with_capacity(winding.len() + 1);
        let points = winding.points();
        let n = points.len();
        for i in 0..n {
            let a = points[i];
            let b = points[(i + 1) % n];
            let Some(mut edge_plane) = Plane::from_points(a, b, a + light_dir) else {
                // Edge parallel to the light contributes no side plane.
                continue;
            };
            if edge_plane.distance(inside) < 0.0 {
                edge_plane = edge_plane.flipped();
            }
            plane_indices.push(self.push_plane(edge_plane));
        }
        if plane_indices.is_empty() {
            return None;
        }
        plane_indices.push(self.push_plane(plane.flipped()));

        self.volumes.push(Volume {
            planes: plane_indices,
            surface,
        });
        Some((self.volumes.len() - 1) as u32)
    }

    /// The inward-facing plane chain of one volume, for callers that test
    /// boxes against the volume directly (terrain quadtree scans).
    pub fn volume_planes(&self, volume: u32) -> Vec<Plane> {
        self.volumes[volume as usize]
            .planes
            .iter()
            .map(|&i| self.planes[i as usize])
            .collect()
    }

    fn push_plane(&mut self, plane: Plane) -> u32 {
        self.planes.push(plane);
        (self.planes.len() - 1) as u32
    }

    /// Merge an occluder polygon's volume into the aggregate tree.
    ///
    /// Polygons without a built volume are skipped.
    pub fn insert_poly(&mut self, poly: &SvPoly) {
        let Some(volume) = poly.volume else {
            return;
        };
        let root = self.root.unwrap_or(Child::Lit);
        let new_root = self.insert_rec(root, poly.winding.clone(), poly.plane, volume);
        self.root = Some(new_root);
    }

    fn insert_rec(
        &mut self,
        child: Child,
        winding: Winding,
        poly_plane: Plane,
        volume: u32,
    ) -> Child {
        match child {
            // Fragment is already inside some volume; the union is unchanged.
            Child::Shadowed(_) => child,
            Child::Lit => self.attach_volume(volume),
            Child::Node(index) => {
                let node = self.nodes[index as usize];
                let split_plane = self.planes[node.plane as usize];
                match winding.side(&split_plane) {
                    PolySide::Front => {
                        let front = self.insert_rec(node.front, winding, poly_plane, volume);
                        self.nodes[index as usize].front = front;
                    }
                    PolySide::Back => {
                        let back = self.insert_rec(node.back, winding, poly_plane, volume);
                        self.nodes[index as usize].back = back;
                    }
                    PolySide::On => {
                        // Coplanar fragment follows the side its normal agrees with.
                        if poly_plane.normal.dot(split_plane.normal) >= 0.0 {
                            let front = self.insert_rec(node.front, winding, poly_plane, volume);
                            self.nodes[index as usize].front = front;
                        } else {
                            let back = self.insert_rec(node.back, winding, poly_plane, volume);
                            self.nodes[index as usize].back = back;
                        }
                    }
                    PolySide::Split => {
                        let (front, back) = winding.split(&split_plane);
                        if let Some(front) = front {
                            let f = self.insert_rec(node.front, front, poly_plane, volume);
                            self.nodes[index as usize].front = f;
                        }
                        if let Some(back) = back {
                            let b = self.insert_rec(node.back, back, poly_plane, volume);
                            self.nodes[index as usize].back = b;
                        }
                    }
                }
                child
            }
        }
    }

    /// Replace a lit leaf with the plane chain of `volume`.
    fn attach_volume(&mut self, volume: u32) -> Child {
        let chain = self.volumes[volume as usize].planes.clone();
        let mut child = Child::Shadowed(volume);
        for &plane in chain.iter().rev() {
            let index = self.nodes.len() as u32;
            self.nodes.push(SvNode {
                plane,
                front: child,
                back: Child::Lit,
            });
            child = Child::Node(index);
        }
        child
    }

    /// True when any part of the polygon reaches a shadowed leaf.
    pub fn test_poly(&self, poly: &SvPoly) -> bool {
        match self.root {
            Some(root) => self.test_rec(root, poly.winding.clone(), &poly.plane),
            None => false,
        }
    }

    fn test_rec(&self, child: Child, winding: Winding, poly_plane: &Plane) -> bool {
        match child {
            Child::Shadowed(_) => true,
            Child::Lit => false,
            Child::Node(index) => {
                let node = self.nodes[index as usize];
                let split_plane = self.planes[node.plane as usize];
                match winding.side(&split_plane) {
                    PolySide::Front => self.test_rec(node.front, winding, poly_plane),
                    PolySide::Back => self.test_rec(node.back, winding, poly_plane),
                    PolySide::On => {
                        if poly_plane.normal.dot(split_plane.normal) >= 0.0 {
                            self.test_rec(node.front, winding, poly_plane)
                        } else {
                            self.test_rec(node.back, winding, poly_plane)
                        }
                    }
                    PolySide::Split => {
                        let (front, back) = winding.split(&split_plane);
                        front.is_some_and(|w| self.test_rec(node.front, w, poly_plane))
                            || back.is_some_and(|w| self.test_rec(node.back, w, poly_plane))
                    }
                }
            }
        }
    }

    /// Area of the part of `winding` not shadowed by any volume other than
    /// the one cast by `excluded_surface`.
    ///
    /// Callers divide by the unclipped area to get a 0..1 attenuation.
    pub fn get_lit_surface_area(
        &self,
        winding: &Winding,
        plane: &Plane,
        excluded_surface: Option<u32>,
    ) -> f32 {
        if winding.is_degenerate() {
            return 0.0;
        }
        match self.root {
            Some(root) => self.lit_area_rec(root, winding.clone(), plane, excluded_surface),
            None => winding.area(),
        }
    }

    fn lit_area_rec(
        &self,
        child: Child,
        winding: Winding,
        poly_plane: &Plane,
        excluded: Option<u32>,
    ) -> f32 {
        match child {
            Child::Lit => winding.area(),
            Child::Shadowed(volume) => {
                let owner = self.volumes[volume as usize].surface;
                if excluded.is_some() && owner == excluded {
                    winding.area()
                } else {
                    0.0
                }
            }
            Child::Node(index) => {
                let node = self.nodes[index as usize];
                let split_plane = self.planes[node.plane as usize];
                match winding.side(&split_plane) {
                    PolySide::Front => self.lit_area_rec(node.front, winding, poly_plane, excluded),
                    PolySide::Back => self.lit_area_rec(node.back, winding, poly_plane, excluded),
                    PolySide::On => {
                        if poly_plane.normal.dot(split_plane.normal) >= 0.0 {
                            self.lit_area_rec(node.front, winding, poly_plane, excluded)
                        } else {
                            self.lit_area_rec(node.back, winding, poly_plane, excluded)
                        }
                    }
                    PolySide::Split => {
                        let (front, back) = winding.split(&split_plane);
                        let mut area = 0.0;
                        if let Some(front) = front {
                            area += self.lit_area_rec(node.front, front, poly_plane, excluded);
                        }
                        if let Some(back) = back {
                            area += self.lit_area_rec(node.back, back, poly_plane, excluded);
                        }
                        area
                    }
                }
            }
        }
    }

    /// Record the rollback point before inserting one interior's own
    /// surfaces for a detail level.
    pub fn begin_interior(&mut self) {
        self.interior_mark = Some(Watermark {
            nodes: self.nodes.len(),
            planes: self.planes.len(),
            volumes: self.volumes.len(),
            surfaces: self.surfaces.len(),
        });
    }

    /// Pop everything inserted since [`begin_interior`](Self::begin_interior).
    ///
    /// Child links into the truncated region heal back to lit leaves.
    pub fn remove_last_interior(&mut self) {
        let Some(mark) = self.interior_mark.take() else {
            return;
        };
        self.nodes.truncate(mark.nodes);
        self.planes.truncate(mark.planes);
        self.volumes.truncate(mark.volumes);
        self.surfaces.truncate(mark.surfaces);

        let heal = |child: &mut Child| {
            let dangling = match *child {
                Child::Node(i) => i as usize >= mark.nodes,
                Child::Shadowed(v) => v as usize >= mark.volumes,
                Child::Lit => false,
            };
            if dangling {
                *child = Child::Lit;
            }
        };
        for node in &mut self.nodes {
            heal(&mut node.front);
            heal(&mut node.back);
        }
        if let Some(root) = self.root.as_mut() {
            heal(root);
            if mark.nodes == 0 && *root == Child::Lit {
                self.root = None;
            }
        }
        debug!(
            "shadow tree rolled back: {} nodes, {} volumes",
            self.nodes.len(),
            self.volumes.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIGHT_DOWN: Vec3 = Vec3::new(0.0, 0.0, -1.0);

    fn quad_at(z: f32, x0: f32, x1: f32) -> (Winding, Plane) {
        let winding = Winding::from_points(&[
            Vec3::new(x0, 0.0, z),
            Vec3::new(x1, 0.0, z),
            Vec3::new(x1, 1.0, z),
            Vec3::new(x0, 1.0, z),
        ]);
        let plane = Plane::new(Vec3::Z, Vec3::new(0.0, 0.0, z));
        (winding, plane)
    }

    fn insert_occluder(bsp: &mut ShadowVolumeBsp, z: f32, x0: f32, x1: f32) -> u32 {
        let (winding, plane) = quad_at(z, x0, x1);
        let volume = bsp
            .build_poly_volume(&winding, &plane, LIGHT_DOWN, None)
            .unwrap();
        bsp.insert_poly(&SvPoly {
            winding,
            plane,
            volume: Some(volume),
            surface: None,
        });
        volume
    }

    #[test]
    fn test_area_conservation_on_empty_tree() {
        let bsp = ShadowVolumeBsp::new();
        let (patch, plane) = quad_at(0.0, 0.0, 1.0);
        let area = bsp.get_lit_surface_area(&patch, &plane, None);
        assert!((area - patch.area()).abs() < 1e-5);
    }

    #[test]
    fn test_full_occlusion() {
        let mut bsp = ShadowVolumeBsp::new();
        insert_occluder(&mut bsp, 1.0, 0.0, 1.0);
        let (patch, plane) = quad_at(0.0, 0.0, 1.0);
        assert!(bsp.get_lit_surface_area(&patch, &plane, None).abs() < 1e-5);
    }

    #[test]
    fn test_partial_occlusion_area() {
        let mut bsp = ShadowVolumeBsp::new();
        insert_occluder(&mut bsp, 1.0, 0.0, 0.5);
        let (patch, plane) = quad_at(0.0, 0.0, 1.0);
        let area = bsp.get_lit_surface_area(&patch, &plane, None);
        assert!((area - 0.5).abs() < 1e-4, "lit area was {area}");
    }

    #[test]
    fn test_union_of_two_occluders() {
        let mut bsp = ShadowVolumeBsp::new();
        insert_occluder(&mut bsp, 1.0, 0.0, 0.5);
        insert_occluder(&mut bsp, 2.0, 0.25, 1.0);
        let (patch, plane) = quad_at(0.0, 0.0, 1.0);
        let area = bsp.get_lit_surface_area(&patch, &plane, None);
        assert!(area.abs() < 1e-4, "lit area was {area}");
    }

    #[test]
    fn test_overlapping_occluders_do_not_double_shadow() {
        let mut bsp = ShadowVolumeBsp::new();
        insert_occluder(&mut bsp, 1.0, 0.0, 0.5);
        insert_occluder(&mut bsp, 2.0, 0.0, 0.5);
        let (patch, plane) = quad_at(0.0, 0.0, 1.0);
        let area = bsp.get_lit_surface_area(&patch, &plane, None);
        assert!((area - 0.5).abs() < 1e-4, "lit area was {area}");
    }

    #[test]
    fn test_self_shadow_exclusion() {
        let mut bsp = ShadowVolumeBsp::new();
        let (winding, plane) = quad_at(1.0, 0.0, 1.0);
        let surface = bsp.add_surface(SurfaceInfo {
            surface_index: 0,
            plane,
        });
        let volume = bsp
            .build_poly_volume(&winding, &plane, LIGHT_DOWN, Some(surface))
            .unwrap();
        bsp.insert_poly(&SvPoly {
            winding: winding.clone(),
            plane,
            volume: Some(volume),
            surface: Some(surface),
        });

        // A patch inside the surface's own volume stays fully lit when the
        // surface is excluded, and excluding never returns less area than
        // including.
        let (patch, patch_plane) = quad_at(0.5, 0.25, 0.75);
        let excluded = bsp.get_lit_surface_area(&patch, &patch_plane, Some(surface));
        let included = bsp.get_lit_surface_area(&patch, &patch_plane, None);
        assert!((excluded - patch.area()).abs() < 1e-5);
        assert!(excluded >= included);
    }

    #[test]
    fn test_degenerate_polygon_skipped() {
        let mut bsp = ShadowVolumeBsp::new();
        let winding = Winding::from_points(&[Vec3::ZERO, Vec3::X]);
        let plane = Plane::new(Vec3::Z, Vec3::ZERO);
        assert!(bsp
            .build_poly_volume(&winding, &plane, LIGHT_DOWN, None)
            .is_none());
    }

    #[test]
    fn test_back_facing_polygon_skipped() {
        let mut bsp = ShadowVolumeBsp::new();
        let (winding, plane) = quad_at(1.0, 0.0, 1.0);
        // Light traveling up: the +Z face is turned away.
        assert!(bsp
            .build_poly_volume(&winding, &plane, Vec3::Z, None)
            .is_none());
    }

    #[test]
    fn test_test_poly_classification() {
        let mut bsp = ShadowVolumeBsp::new();
        insert_occluder(&mut bsp, 1.0, 0.0, 1.0);
        let (inside, plane) = quad_at(0.0, 0.25, 0.75);
        let (outside, _) = quad_at(0.0, 2.0, 3.0);
        assert!(bsp.test_poly(&SvPoly {
            winding: inside,
            plane,
            volume: None,
            surface: None,
        }));
        assert!(!bsp.test_poly(&SvPoly {
            winding: outside,
            plane,
            volume: None,
            surface: None,
        }));
    }

    #[test]
    fn test_remove_last_interior_restores_area() {
        let mut bsp = ShadowVolumeBsp::new();
        insert_occluder(&mut bsp, 2.0, 0.0, 0.25);
        let nodes_before = bsp.node_count();

        bsp.begin_interior();
        insert_occluder(&mut bsp, 1.0, 0.0, 1.0);
        let (patch, plane) = quad_at(0.0, 0.0, 1.0);
        assert!(bsp.get_lit_surface_area(&patch, &plane, None).abs() < 1e-4);

        bsp.remove_last_interior();
        assert_eq!(bsp.node_count(), nodes_before);
        let area = bsp.get_lit_surface_area(&patch, &plane, None);
        assert!((area - 0.75).abs() < 1e-4, "lit area was {area}");
    }

    #[test]
    fn test_remove_last_interior_on_fresh_tree() {
        let mut bsp = ShadowVolumeBsp::new();
        bsp.begin_interior();
        insert_occluder(&mut bsp, 1.0, 0.0, 1.0);
        bsp.remove_last_interior();
        let (patch, plane) = quad_at(0.0, 0.0, 1.0);
        let area = bsp.get_lit_surface_area(&patch, &plane, None);
        assert!((area - 1.0).abs() < 1e-5);
    }
}
