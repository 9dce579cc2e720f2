//! Common test helpers for ALICE-Bake integration tests
//!
//! Author: Moroya Sakamoto

#![allow(dead_code)]

use alice_bake::prelude::*;

// ============================================================================
// Standard test scenes
// ============================================================================

/// Sun pointing straight down, full white, no ambient.
pub fn down_light() -> Light {
    Light::directional(Vec3::new(0.0, 0.0, -1.0), Vec3::ONE, Vec3::ZERO)
}

/// A single 4x4-lexel unit quad facing +Z at height `z`.
pub fn quad_patch(z: f32) -> InteriorInstance {
    let winding = Winding::from_points(&[
        Vec3::new(0.0, 0.0, z),
        Vec3::new(1.0, 0.0, z),
        Vec3::new(1.0, 1.0, z),
        Vec3::new(0.0, 1.0, z),
    ]);
    let plane = Plane::new(Vec3::Z, Vec3::new(0.0, 0.0, z));
    let surface = Surface {
        winding,
        plane,
        lightmap_index: 0,
        alarm_lightmap_index: None,
        lm_origin: Vec3::new(0.0, 0.0, z),
        s_vec: Vec3::new(0.25, 0.0, 0.0),
        t_vec: Vec3::new(0.0, 0.25, 0.0),
        rect: LightmapRect {
            x: 0,
            y: 0,
            width: 4,
            height: 4,
        },
    };
    let shape = InteriorShape {
        details: vec![DetailLevel {
            surfaces: vec![surface],
            lightmap_sizes: vec![(4, 4)],
        }],
    };
    InteriorInstance::new(shape, Vec3::ZERO, 1.0)
}

/// Axis-aligned unit-cube occluder centered over the patch.
pub fn cube_occluder(center: Vec3, half: f32) -> InteriorInstance {
    let min = center - Vec3::splat(half);
    let max = center + Vec3::splat(half);
    let faces = [
        // (ring, outward normal)
        (
            [
                Vec3::new(min.x, min.y, max.z),
                Vec3::new(max.x, min.y, max.z),
                Vec3::new(max.x, max.y, max.z),
                Vec3::new(min.x, max.y, max.z),
            ],
            Vec3::Z,
        ),
        (
            [
                Vec3::new(min.x, min.y, min.z),
                Vec3::new(max.x, min.y, min.z),
                Vec3::new(max.x, max.y, min.z),
                Vec3::new(min.x, max.y, min.z),
            ],
            -Vec3::Z,
        ),
        (
            [
                Vec3::new(min.x, min.y, min.z),
                Vec3::new(min.x, max.y, min.z),
                Vec3::new(min.x, max.y, max.z),
                Vec3::new(min.x, min.y, max.z),
            ],
            -Vec3::X,
        ),
        (
            [
                Vec3::new(max.x, min.y, min.z),
                Vec3::new(max.x, max.y, min.z),
                Vec3::new(max.x, max.y, max.z),
                Vec3::new(max.x, min.y, max.z),
            ],
            Vec3::X,
        ),
        (
            [
                Vec3::new(min.x, min.y, min.z),
                Vec3::new(max.x, min.y, min.z),
                Vec3::new(max.x, min.y, max.z),
                Vec3::new(min.x, min.y, max.z),
            ],
            -Vec3::Y,
        ),
        (
            [
                Vec3::new(min.x, max.y, min.z),
                Vec3::new(max.x, max.y, min.z),
                Vec3::new(max.x, max.y, max.z),
                Vec3::new(min.x, max.y, max.z),
            ],
            Vec3::Y,
        ),
    ];
    let surfaces = faces
        .into_iter()
        .map(|(ring, normal)| Surface {
            winding: Winding::from_points(&ring),
            plane: Plane::new(normal, ring[0]),
            lightmap_index: 0,
            alarm_lightmap_index: None,
            lm_origin: ring[0],
            s_vec: Vec3::ZERO,
            t_vec: Vec3::ZERO,
            rect: LightmapRect {
                x: 0,
                y: 0,
                width: 0,
                height: 0,
            },
        })
        .collect();
    let shape = InteriorShape {
        details: vec![DetailLevel {
            surfaces,
            lightmap_sizes: vec![(1, 1)],
        }],
    };
    InteriorInstance::new(shape, Vec3::ZERO, 1.0)
}

/// Scene with one sun, the 4x4 patch, and optionally a cube fully above it.
pub fn patch_scene(name: &str, with_cube: bool) -> Scene {
    let mut scene = Scene::new(name);
    scene.add_light(down_light());
    scene.add_object(SceneObject::Interior(quad_patch(0.0)));
    if with_cube {
        scene.add_object(SceneObject::Interior(cube_occluder(
            Vec3::new(0.5, 0.5, 2.0),
            1.0,
        )));
    }
    scene
}

// ============================================================================
// Bake driving
// ============================================================================

/// Fresh cache directory under the system temp dir.
pub fn cache_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("alice_bake_it_{name}"));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Step a session until it reaches a terminal state.
pub fn run_to_completion(session: &mut BakeSession) -> BakeStatus {
    let mut steps = 0;
    loop {
        let status = session.step().unwrap();
        if status != BakeStatus::InProgress {
            return status;
        }
        steps += 1;
        assert!(steps < 10_000, "bake did not converge");
    }
}

/// The patch's baked lightmap out of a finished scene.
pub fn patch_lightmap(scene: &Scene) -> &Lightmap {
    match &scene.objects[0] {
        SceneObject::Interior(i) => &i.lightmaps[0][0],
        _ => panic!("object 0 is not the patch"),
    }
}
