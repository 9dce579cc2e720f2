//! # ALICE-Bake
//!
//! **A.L.I.C.E. - Ambient Lightmap Incremental Compilation Engine**
//!
//! An offline static-lighting baker for hybrid scenes of convex-sector
//! interiors and heightfield terrain. Shadowing is computed with
//! shadow-volume BSP trees, the bake advances one unit of work per host
//! tick so it never stalls a running simulation, and finished results are
//! persisted to a validated, size-bounded cache keyed by content CRCs so
//! unchanged scenes never relight.
//!
//! ## Features
//!
//! - **Shadow-volume BSP**: polygon-clipping lit-area queries with
//!   self-shadow exclusion
//! - **Proxies**: interior lexel rasterization, terrain quadtree shadow
//!   scans and scanline self-shadowing
//! - **Scheduler**: cancellable, resumable, progress-reporting bake steps
//! - **Bake cache**: versioned CRC-validated chunk files, delta-encoded
//!   interior lightmaps, quota eviction
//!
//! ## Example
//!
//! ```rust
//! use alice_bake::prelude::*;
//! use glam::Vec3;
//!
//! // A mission with one sun and a small terrain block.
//! let mut scene = Scene::new("demo.mis");
//! scene.add_light(Light::directional(
//!     Vec3::new(0.3, 0.4, -1.0),
//!     Vec3::ONE,
//!     Vec3::splat(0.1),
//! ));
//! scene.add_object(SceneObject::Terrain(TerrainBlock::new(8, 1.0, Vec3::ZERO)));
//!
//! let cache_dir = std::env::temp_dir().join("alice_bake_demo");
//! std::fs::create_dir_all(&cache_dir).unwrap();
//!
//! let config = BakeConfig::new(CacheConfig::new(cache_dir));
//! let mut session = BakeSession::light_scene(scene, config).unwrap();
//! while session.step().unwrap() == BakeStatus::InProgress {}
//! let scene = session.into_scene();
//! ```
//!
//! ## Author
//!
//! Moroya Sakamoto

#![warn(missing_docs)]

pub mod bake;
pub mod cache;
pub mod geom;
pub mod persist;
pub mod scene;
pub mod shadow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude - commonly used types and functions
pub mod prelude {
    pub use crate::bake::{
        calc_mission_crc, BakeConfig, BakeError, BakeFlags, BakeSession, BakeStatus,
    };
    pub use crate::cache::{CacheConfig, EvictionPolicy};
    pub use crate::geom::{Aabb, Plane, Winding};
    pub use crate::persist::{PersistChunk, PersistInfo, FILE_VERSION};
    pub use crate::scene::{
        DetailLevel, InteriorInstance, InteriorShape, Light, Lightmap, LightmapRect, Scene,
        SceneObject, Surface, TerrainBlock,
    };
    pub use crate::shadow::{ShadowVolumeBsp, SurfaceInfo, SvPoly};
    pub use glam::Vec3;
}

// Re-exports for convenience
pub use bake::{BakeConfig, BakeSession, BakeStatus};
pub use scene::Scene;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_basic_workflow() {
        let mut scene = Scene::new("workflow.mis");
        scene.add_light(Light::directional(
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::ONE,
            Vec3::splat(0.1),
        ));
        scene.add_object(SceneObject::Terrain(TerrainBlock::new(4, 1.0, Vec3::ZERO)));

        let cache_dir = std::env::temp_dir().join("alice_bake_workflow");
        std::fs::create_dir_all(&cache_dir).unwrap();

        let config = BakeConfig::new(CacheConfig::new(&cache_dir));
        let mut session = BakeSession::light_scene(scene, config).unwrap();
        let mut steps = 0;
        while session.step().unwrap() == BakeStatus::InProgress {
            steps += 1;
            assert!(steps < 1000, "bake did not converge");
        }
        assert!(session.progress() >= 1.0);

        let scene = session.into_scene();
        match &scene.objects[0] {
            SceneObject::Terrain(t) => {
                assert!(t.lightmap.texel(2, 2)[0] > 200);
            }
            _ => unreachable!(),
        }
        std::fs::remove_dir_all(&cache_dir).ok();
    }
}
