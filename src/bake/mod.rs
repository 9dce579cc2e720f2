//! Bake orchestrator
//!
//! A [`BakeSession`] owns the whole bake as one cancellable unit of work.
//! The host constructs it with [`BakeSession::light_scene`], then calls
//! [`step`](BakeSession::step) once per tick; every step advances exactly
//! one (light, object) pair or one light boundary, so the bake never
//! blocks the host for more than a single unit of work and can be
//! cancelled between any two steps.
//!
//! On completion the session computes an order-independent scene
//! fingerprint (sorted CRC32 over every object fingerprint plus the
//! mission fingerprint), persists every proxy's result through the bake
//! cache, and always runs the cache eviction sweep, successful or not.
//! A fresh session first tries to load the matching cache file and skips
//! the bake entirely when every chunk validates.
//!
//! Only one session should exist at a time: the session exclusively owns
//! the scene's lightmap storage for the duration of the bake.
//!
//! Author: Moroya Sakamoto

pub mod interior;
pub mod terrain;

use crate::cache::{self, CacheConfig, CacheError};
use crate::persist::{PersistChunk, PersistError, PersistInfo, FILE_EXTENSION, FILE_VERSION};
use crate::scene::{Light, Scene, SceneObject};
use bitflags::bitflags;
use interior::InteriorProxy;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use terrain::TerrainProxy;
use thiserror::Error;

bitflags! {
    /// Bake trigger flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BakeFlags: u32 {
        /// Ignore any cached result and skip the writable-target check.
        const FORCE_ALWAYS = 1 << 0;
        /// Ignore any cached result but still require a writable target.
        const FORCE_WRITABLE = 1 << 1;
        /// Fail instead of baking when no valid cache exists.
        const LOAD_ONLY = 1 << 2;
    }
}

/// Bake configuration.
#[derive(Debug, Clone)]
pub struct BakeConfig {
    /// Cache directory, quota and eviction policy.
    pub cache: CacheConfig,
    /// Trigger flags.
    pub flags: BakeFlags,
}

impl BakeConfig {
    /// Configuration with no flags set.
    pub fn new(cache: CacheConfig) -> Self {
        BakeConfig {
            cache,
            flags: BakeFlags::empty(),
        }
    }
}

/// Orchestrator-level failures. Geometry problems never surface here;
/// they degrade to unlit/unshadowed results instead.
#[derive(Error, Debug)]
pub enum BakeError {
    /// The scene has no directional lights to bake.
    #[error("scene has no directional lights")]
    NoLights,

    /// No object survived gathering.
    #[error("scene has no bakeable objects")]
    NoObjects,

    /// The target cache file exists but cannot be written.
    #[error("bake target {0} is not writable")]
    TargetNotWritable(PathBuf),

    /// `LOAD_ONLY` was set and no valid cache exists.
    #[error("no valid bake cache for load-only request")]
    NoCache,

    /// Cache sweep failure.
    #[error("cache sweep failed: {0}")]
    Cache(#[from] CacheError),
}

/// Observable session state after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakeStatus {
    /// More steps remain.
    InProgress,
    /// The bake finished and results were applied to the scene.
    Completed {
        /// True when the results came from the cache instead of a bake.
        from_cache: bool,
    },
    /// The bake was cancelled; the scene keeps its previous lightmaps.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    PreLight { light: usize },
    LightObject { light: usize, object: usize },
    PostLight { light: usize },
    Save,
}

#[derive(Debug)]
enum Proxy {
    Interior(InteriorProxy),
    Terrain(TerrainProxy),
}

impl Proxy {
    fn alive(&self) -> bool {
        match self {
            Proxy::Interior(p) => p.alive(),
            Proxy::Terrain(p) => p.alive(),
        }
    }

    fn chunk_crc(&self) -> u32 {
        match self {
            Proxy::Interior(p) => p.chunk_crc(),
            Proxy::Terrain(p) => p.chunk_crc(),
        }
    }

    fn pre_light(&mut self, scene: &Scene, light: &Light) -> bool {
        match self {
            Proxy::Interior(p) => p.pre_light(scene, light),
            Proxy::Terrain(p) => p.pre_light(scene, light),
        }
    }

    fn post_light(&mut self) {
        match self {
            Proxy::Interior(p) => p.post_light(),
            Proxy::Terrain(p) => p.post_light(),
        }
    }

    fn make_chunk(&self, scene: &Scene) -> PersistChunk {
        match self {
            Proxy::Interior(p) => p.make_chunk(scene),
            Proxy::Terrain(p) => p.make_chunk(),
        }
    }

    fn is_valid_chunk(&self, chunk: &PersistChunk) -> bool {
        match self {
            Proxy::Interior(p) => p.is_valid_chunk(chunk),
            Proxy::Terrain(p) => p.is_valid_chunk(chunk),
        }
    }

    fn apply_chunk(&mut self, scene: &Scene, chunk: &PersistChunk) -> bool {
        match self {
            Proxy::Interior(p) => p.apply_chunk(scene, chunk),
            Proxy::Terrain(p) => p.apply_chunk(chunk),
        }
    }

    fn apply_to_scene(&self, scene: &mut Scene) {
        match self {
            Proxy::Interior(p) => p.apply_to_scene(scene),
            Proxy::Terrain(p) => p.apply_to_scene(scene),
        }
    }
}

/// One in-flight bake over an owned scene.
#[derive(Debug)]
pub struct BakeSession {
    scene: Scene,
    config: BakeConfig,
    lights: Vec<Light>,
    proxies: Vec<Proxy>,
    participating: Vec<bool>,
    phase: Phase,
    finished: Option<BakeStatus>,
    cancel: Arc<AtomicBool>,
    started: Instant,
    mission_crc: u32,
    file_path: PathBuf,
}

impl BakeSession {
    /// Start a bake over `scene`.
    ///
    /// Only one session may exist at a time; the session owns the scene's
    /// lightmap storage until [`into_scene`](Self::into_scene). Fails fast
    /// when the scene has no directional lights, when the target cache
    /// file is not writable (unless `FORCE_ALWAYS`), or when `LOAD_ONLY`
    /// is set and no valid cache exists. A valid cache otherwise
    /// short-circuits the whole bake: the session is created already
    /// completed with the cached results applied.
    pub fn light_scene(scene: Scene, config: BakeConfig) -> Result<BakeSession, BakeError> {
        let lights: Vec<Light> = scene.lights.iter().filter(|l| l.is_vector()).cloned().collect();
        if lights.is_empty() {
            return Err(BakeError::NoLights);
        }

        let mut proxies = Vec::new();
        for (index, object) in scene.objects.iter().enumerate() {
            let proxy = match object {
                SceneObject::Interior(instance) => {
                    InteriorProxy::new(index, instance).map(Proxy::Interior)
                }
                SceneObject::Terrain(terrain) => {
                    TerrainProxy::new(index, terrain).map(Proxy::Terrain)
                }
            };
            match proxy {
                Some(proxy) => proxies.push(proxy),
                None => warn!("object {index} failed validation, dropped from bake"),
            }
        }
        if proxies.is_empty() {
            return Err(BakeError::NoObjects);
        }

        let mission_chunk_crc = scene.mission_crc() ^ FILE_VERSION;
        let mut crcs: Vec<u32> = proxies.iter().map(|p| p.chunk_crc()).collect();
        crcs.push(mission_chunk_crc);
        let mission_crc = calc_mission_crc(&crcs);

        let stem = Path::new(&scene.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("mission")
            .to_owned();
        let file_path = config
            .cache
            .directory
            .join(format!("{stem}_{mission_crc:x}.{FILE_EXTENSION}"));

        if !config.flags.contains(BakeFlags::FORCE_ALWAYS) {
            if let Ok(meta) = file_path.metadata() {
                if meta.permissions().readonly() {
                    return Err(BakeError::TargetNotWritable(file_path));
                }
            }
        }

        let participating = vec![false; proxies.len()];
        let mut session = BakeSession {
            scene,
            config,
            lights,
            proxies,
            participating,
            phase: Phase::PreLight { light: 0 },
            finished: None,
            cancel: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            mission_crc,
            file_path,
        };

        let skip_cache = session
            .config
            .flags
            .intersects(BakeFlags::FORCE_ALWAYS | BakeFlags::FORCE_WRITABLE);
        if !skip_cache && session.try_load_cache(mission_chunk_crc) {
            session.apply_results();
            session.run_sweep();
            info!(
                "mission lit from cache file {}",
                session.file_path.display()
            );
            session.finished = Some(BakeStatus::Completed { from_cache: true });
        } else if session.config.flags.contains(BakeFlags::LOAD_ONLY) {
            return Err(BakeError::NoCache);
        }
        Ok(session)
    }

    /// Aggregate scene fingerprint the cache file is named after.
    pub fn mission_crc(&self) -> u32 {
        self.mission_crc
    }

    /// Path of the cache file this bake reads and writes.
    pub fn cache_file(&self) -> &Path {
        &self.file_path
    }

    /// Shared cancellation flag; set it from anywhere to stop the bake at
    /// the next step boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Request cancellation at the next step boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// True once the session reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Monotonic 0..1 bake fraction for host-side UI.
    pub fn progress(&self) -> f32 {
        if self.finished.is_some() {
            return 1.0;
        }
        let lights = self.lights.len() as f32;
        let objects = self.proxies.len() as f32;
        match self.phase {
            Phase::PreLight { light } => light as f32 / lights,
            Phase::LightObject { light, object } => {
                (light as f32 + (object + 1) as f32 / objects) / lights
            }
            Phase::PostLight { light } => (light + 1) as f32 / lights,
            Phase::Save => 1.0,
        }
    }

    /// Advance the bake by one unit of work.
    ///
    /// A cancellation check precedes the step; cancelling still runs the
    /// cache eviction sweep so on-disk state stays consistent.
    pub fn step(&mut self) -> Result<BakeStatus, BakeError> {
        if let Some(status) = self.finished {
            return Ok(status);
        }
        if self.cancel.load(Ordering::Relaxed) {
            info!("bake cancelled, running cache sweep");
            self.run_sweep();
            self.finished = Some(BakeStatus::Cancelled);
            return Ok(BakeStatus::Cancelled);
        }

        match self.phase {
            Phase::PreLight { light } => {
                info!("lighting pass {}/{}", light + 1, self.lights.len());
                let light_ref = self.lights[light].clone();
                for (index, proxy) in self.proxies.iter_mut().enumerate() {
                    self.participating[index] = proxy.pre_light(&self.scene, &light_ref);
                }
                self.phase = Phase::LightObject { light, object: 0 };
            }
            Phase::LightObject { light, object } => {
                if self.participating[object] && self.proxies[object].alive() {
                    self.light_one(light, object);
                }
                let next = object + 1;
                self.phase = if next == self.proxies.len() {
                    Phase::PostLight { light }
                } else {
                    Phase::LightObject {
                        light,
                        object: next,
                    }
                };
            }
            Phase::PostLight { light } => {
                for proxy in &mut self.proxies {
                    proxy.post_light();
                }
                let next = light + 1;
                self.phase = if next == self.lights.len() {
                    Phase::Save
                } else {
                    Phase::PreLight { light: next }
                };
            }
            Phase::Save => {
                self.save_results();
                self.apply_results();
                self.run_sweep();
                info!(
                    "mission lighting complete in {:.2} s",
                    self.started.elapsed().as_secs_f32()
                );
                self.finished = Some(BakeStatus::Completed { from_cache: false });
                return Ok(BakeStatus::Completed { from_cache: false });
            }
        }
        Ok(BakeStatus::InProgress)
    }

    /// Take the scene back, with baked lightmaps applied on success.
    pub fn into_scene(self) -> Scene {
        self.scene
    }

    fn light_one(&mut self, light: usize, object: usize) {
        let light = self.lights[light].clone();
        let (before, rest) = self.proxies.split_at_mut(object);
        let Some((current, after)) = rest.split_first_mut() else {
            return;
        };
        let others: Vec<&InteriorProxy> = before
            .iter()
            .chain(after.iter())
            .filter_map(|proxy| match proxy {
                Proxy::Interior(p) if p.alive() => Some(p),
                _ => None,
            })
            .collect();
        match current {
            Proxy::Interior(p) => p.light_pass(&self.scene, &others, &light),
            Proxy::Terrain(p) => p.light_pass(&self.scene, &others, &light),
        }
    }

    /// Load and validate the cache file; true when every chunk checked out
    /// and was applied.
    fn try_load_cache(&mut self, mission_chunk_crc: u32) -> bool {
        let info = match PersistInfo::read(&self.file_path) {
            Ok(info) => info,
            Err(PersistError::Io(_)) => return false,
            Err(e) => {
                warn!("ignoring unreadable cache file: {e}");
                return false;
            }
        };

        if info.chunks.len() != self.proxies.len() + 1 {
            warn!("cache file chunk count does not match the scene");
            return false;
        }
        match info.chunks.first() {
            Some(PersistChunk::Mission { crc }) if *crc == mission_chunk_crc => {}
            _ => {
                warn!("cache file mission fingerprint does not match");
                return false;
            }
        }
        // Validate every chunk before applying any of them.
        for (proxy, chunk) in self.proxies.iter().zip(&info.chunks[1..]) {
            if !proxy.is_valid_chunk(chunk) {
                warn!("cache chunk fingerprint mismatch, relighting");
                return false;
            }
        }
        for (proxy, chunk) in self.proxies.iter_mut().zip(&info.chunks[1..]) {
            if !proxy.apply_chunk(&self.scene, chunk) {
                warn!("cache chunk failed to apply, relighting");
                return false;
            }
        }
        true
    }

    fn save_results(&self) {
        let mut chunks = Vec::with_capacity(self.proxies.len() + 1);
        chunks.push(PersistChunk::Mission {
            crc: self.scene.mission_crc() ^ FILE_VERSION,
        });
        for proxy in &self.proxies {
            chunks.push(proxy.make_chunk(&self.scene));
        }
        let info = PersistInfo { chunks };
        if let Err(e) = info.write(&self.file_path) {
            // The in-memory results are still good; only persistence failed.
            error!(
                "unable to persist bake results to {}: {e}",
                self.file_path.display()
            );
        }
    }

    fn apply_results(&mut self) {
        let proxies = std::mem::take(&mut self.proxies);
        for proxy in &proxies {
            proxy.apply_to_scene(&mut self.scene);
        }
        self.proxies = proxies;
    }

    fn run_sweep(&self) {
        if let Err(e) = cache::sweep(&self.config.cache, Some(&self.file_path)) {
            warn!("cache sweep failed: {e}");
        }
    }
}

/// Order-independent fingerprint over a set of chunk CRCs.
pub fn calc_mission_crc(crcs: &[u32]) -> u32 {
    let mut sorted = crcs.to_vec();
    sorted.sort_unstable();
    let mut hasher = crc32fast::Hasher::new();
    for crc in sorted {
        hasher.update(&crc.to_le_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mission_crc_order_independent() {
        let a = calc_mission_crc(&[1, 2, 3]);
        let b = calc_mission_crc(&[3, 1, 2]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_mission_crc_sensitive_to_content() {
        assert_ne!(calc_mission_crc(&[1, 2, 3]), calc_mission_crc(&[1, 2, 4]));
    }

    #[test]
    fn test_no_lights_fails_fast() {
        let mut scene = Scene::new("empty.mis");
        scene.add_object(SceneObject::Terrain(crate::scene::TerrainBlock::new(
            4,
            1.0,
            glam::Vec3::ZERO,
        )));
        let config = BakeConfig::new(CacheConfig::new(std::env::temp_dir()));
        assert!(matches!(
            BakeSession::light_scene(scene, config),
            Err(BakeError::NoLights)
        ));
    }

    #[test]
    fn test_no_objects_fails_fast() {
        let mut scene = Scene::new("empty.mis");
        scene.add_light(Light::directional(
            glam::Vec3::new(0.0, 0.0, -1.0),
            glam::Vec3::ONE,
            glam::Vec3::ZERO,
        ));
        let config = BakeConfig::new(CacheConfig::new(std::env::temp_dir()));
        assert!(matches!(
            BakeSession::light_scene(scene, config),
            Err(BakeError::NoObjects)
        ));
    }
}
