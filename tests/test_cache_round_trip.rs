//! Bake-cache round trips through full sessions
//!
//! Author: Moroya Sakamoto

mod common;

use alice_bake::prelude::*;
use common::*;

#[test]
fn test_second_bake_loads_from_cache() {
    let dir = cache_dir("round_trip");

    let mut first = BakeSession::light_scene(
        patch_scene("round.mis", true),
        BakeConfig::new(CacheConfig::new(&dir)),
    )
    .unwrap();
    assert_eq!(
        run_to_completion(&mut first),
        BakeStatus::Completed { from_cache: false }
    );
    assert!(first.cache_file().exists());
    let first_scene = first.into_scene();

    let mut second = BakeSession::light_scene(
        patch_scene("round.mis", true),
        BakeConfig::new(CacheConfig::new(&dir)),
    )
    .unwrap();
    assert!(second.is_finished());
    assert_eq!(
        second.step().unwrap(),
        BakeStatus::Completed { from_cache: true }
    );
    let second_scene = second.into_scene();

    assert_eq!(
        patch_lightmap(&first_scene).data(),
        patch_lightmap(&second_scene).data()
    );
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_tampered_chunk_crc_forces_rebake() {
    let dir = cache_dir("tamper");

    let mut session = BakeSession::light_scene(
        patch_scene("tamper.mis", false),
        BakeConfig::new(CacheConfig::new(&dir)),
    )
    .unwrap();
    run_to_completion(&mut session);
    let path = session.cache_file().to_path_buf();

    // Flip a bit in the first chunk's recorded CRC (version, chunk count
    // and chunk type precede it).
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[12] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let mut second = BakeSession::light_scene(
        patch_scene("tamper.mis", false),
        BakeConfig::new(CacheConfig::new(&dir)),
    )
    .unwrap();
    assert!(!second.is_finished());
    assert_eq!(
        run_to_completion(&mut second),
        BakeStatus::Completed { from_cache: false }
    );
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_force_always_ignores_cache() {
    let dir = cache_dir("force");

    let mut first = BakeSession::light_scene(
        patch_scene("force.mis", false),
        BakeConfig::new(CacheConfig::new(&dir)),
    )
    .unwrap();
    run_to_completion(&mut first);

    let config = BakeConfig {
        cache: CacheConfig::new(&dir),
        flags: BakeFlags::FORCE_ALWAYS,
    };
    let mut second =
        BakeSession::light_scene(patch_scene("force.mis", false), config).unwrap();
    assert!(!second.is_finished());
    assert_eq!(
        run_to_completion(&mut second),
        BakeStatus::Completed { from_cache: false }
    );
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_load_only_succeeds_with_valid_cache() {
    let dir = cache_dir("load_only_hit");

    let mut first = BakeSession::light_scene(
        patch_scene("hit.mis", true),
        BakeConfig::new(CacheConfig::new(&dir)),
    )
    .unwrap();
    run_to_completion(&mut first);

    let config = BakeConfig {
        cache: CacheConfig::new(&dir),
        flags: BakeFlags::LOAD_ONLY,
    };
    let mut second = BakeSession::light_scene(patch_scene("hit.mis", true), config).unwrap();
    assert_eq!(
        second.step().unwrap(),
        BakeStatus::Completed { from_cache: true }
    );
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_changed_scene_misses_cache() {
    let dir = cache_dir("changed");

    let mut first = BakeSession::light_scene(
        patch_scene("changed.mis", false),
        BakeConfig::new(CacheConfig::new(&dir)),
    )
    .unwrap();
    run_to_completion(&mut first);

    // Adding the cube changes the fingerprint set, so the cache file from
    // the first bake cannot satisfy the second.
    let mut second = BakeSession::light_scene(
        patch_scene("changed.mis", true),
        BakeConfig::new(CacheConfig::new(&dir)),
    )
    .unwrap();
    assert!(!second.is_finished());
    assert_eq!(
        run_to_completion(&mut second),
        BakeStatus::Completed { from_cache: false }
    );
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_quota_eviction_spares_active_bake_file() {
    let dir = cache_dir("quota");

    let first_config = BakeConfig::new(CacheConfig {
        directory: dir.clone(),
        quota_kb: 0,
        policy: EvictionPolicy::default(),
    });
    let mut first =
        BakeSession::light_scene(patch_scene("quota_a.mis", false), first_config).unwrap();
    run_to_completion(&mut first);
    let first_file = first.cache_file().to_path_buf();
    // The only file is the active bake's own, exempt from eviction.
    assert!(first_file.exists());

    let second_config = BakeConfig::new(CacheConfig {
        directory: dir.clone(),
        quota_kb: 0,
        policy: EvictionPolicy::default(),
    });
    let mut second =
        BakeSession::light_scene(patch_scene("quota_b.mis", false), second_config).unwrap();
    run_to_completion(&mut second);

    // The second bake's sweep evicts the first file but spares its own.
    assert!(!first_file.exists());
    assert!(second.cache_file().exists());
    std::fs::remove_dir_all(&dir).ok();
}
