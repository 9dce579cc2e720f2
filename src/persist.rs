//! Bake-cache chunk format
//!
//! Layout (all integers little-endian):
//!   - Version: u32 (currently 0x10)
//!   - Chunk count: u32
//!   - Per chunk:
//!     - Type: u32 (0 = Mission, 1 = Interior, 2 = Terrain)
//!     - CRC: u32
//!     - Type-specific payload
//!
//! The mission chunk comes first and carries no payload; its CRC field is
//! the mission fingerprint XOR'd with the file version. Interior payloads
//! hold one delta-encoded lightmap set per detail level, then a
//! length-prefixed reserved block that readers must skip by its declared
//! size even though it is currently written empty. Terrain payloads hold
//! one full-resolution lightmap image.
//!
//! Chunk CRCs are not validated here; the bake orchestrator compares them
//! against freshly computed object fingerprints, which is what decides
//! whether a cached result may be trusted at all. Counts and dimensions
//! read from disk are bounds-checked, so a corrupt file fails the parse
//! instead of driving huge allocations.
//!
//! Author: Moroya Sakamoto

use crate::scene::Lightmap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// Current bake-cache format version.
pub const FILE_VERSION: u32 = 0x10;

/// Bake-cache file extension.
pub const FILE_EXTENSION: &str = "ml";

const CHUNK_MISSION: u32 = 0;
const CHUNK_INTERIOR: u32 = 1;
const CHUNK_TERRAIN: u32 = 2;

// Ceilings on on-disk counts and dimensions. A corrupt file must fail the
// parse with `InvalidFormat` instead of driving huge allocations.
const MAX_CHUNK_COUNT: u32 = 1 << 16;
const MAX_DETAIL_LEVELS: u32 = 64;
const MAX_LIGHTMAPS_PER_DETAIL: u32 = 1 << 16;
const MAX_LIGHTMAP_DIM: u32 = 1 << 14;

/// Bake-cache read/write errors.
#[derive(Error, Debug)]
pub enum PersistError {
    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Structurally invalid file.
    #[error("Invalid cache file: {0}")]
    InvalidFormat(String),

    /// Leading version tag does not match [`FILE_VERSION`].
    #[error("Unsupported cache version: {0:#x}")]
    UnsupportedVersion(u32),
}

/// One delta-encoded lightmap page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaLightmap {
    /// Lightmap page index within the detail level.
    pub index: u32,
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Instance-minus-base bytes, wrapping per channel.
    pub delta: Vec<u8>,
}

/// Lightmap pages of one interior detail level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailLightmaps {
    /// Delta-encoded pages.
    pub lightmaps: Vec<DeltaLightmap>,
}

/// One persisted unit of the bake result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistChunk {
    /// Mission header chunk; the CRC is `mission_crc ^ FILE_VERSION`.
    Mission {
        /// Fingerprint field.
        crc: u32,
    },
    /// Interior bake result.
    Interior {
        /// Geometry fingerprint of the interior at bake time.
        crc: u32,
        /// One lightmap set per detail level.
        details: Vec<DetailLightmaps>,
    },
    /// Terrain bake result.
    Terrain {
        /// Geometry fingerprint of the terrain at bake time.
        crc: u32,
        /// Lightmap width in texels.
        width: u32,
        /// Lightmap height in texels.
        height: u32,
        /// Raw RGB8 image.
        data: Vec<u8>,
    },
}

impl PersistChunk {
    /// The chunk's recorded fingerprint.
    pub fn crc(&self) -> u32 {
        match self {
            PersistChunk::Mission { crc } => *crc,
            PersistChunk::Interior { crc, .. } => *crc,
            PersistChunk::Terrain { crc, .. } => *crc,
        }
    }
}

/// An ordered chunk sequence: one mission chunk, then one chunk per
/// object in gather order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistInfo {
    /// Chunks in file order.
    pub chunks: Vec<PersistChunk>,
}

impl PersistInfo {
    /// Write the chunk sequence to `path`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        write_u32(&mut writer, FILE_VERSION)?;
        write_u32(&mut writer, self.chunks.len() as u32)?;
        for chunk in &self.chunks {
            match chunk {
                PersistChunk::Mission { crc } => {
                    write_u32(&mut writer, CHUNK_MISSION)?;
                    write_u32(&mut writer, *crc)?;
                }
                PersistChunk::Interior { crc, details } => {
                    write_u32(&mut writer, CHUNK_INTERIOR)?;
                    write_u32(&mut writer, *crc)?;
                    write_u32(&mut writer, details.len() as u32)?;
                    for detail in details {
                        write_u32(&mut writer, detail.lightmaps.len() as u32)?;
                        for lm in &detail.lightmaps {
                            write_u32(&mut writer, lm.index)?;
                            write_u32(&mut writer, lm.width)?;
                            write_u32(&mut writer, lm.height)?;
                            writer.write_all(&lm.delta)?;
                        }
                    }
                    // Reserved vertex-lighting block, written empty.
                    write_u32(&mut writer, 0)?;
                }
                PersistChunk::Terrain {
                    crc,
                    width,
                    height,
                    data,
                } => {
                    write_u32(&mut writer, CHUNK_TERRAIN)?;
                    write_u32(&mut writer, *crc)?;
                    write_u32(&mut writer, *width)?;
                    write_u32(&mut writer, *height)?;
                    writer.write_all(data)?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a chunk sequence from `path`, validating the version first.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let version = read_u32(&mut reader)?;
        if version != FILE_VERSION {
            return Err(PersistError::UnsupportedVersion(version));
        }

        let count = check_count(read_u32(&mut reader)?, MAX_CHUNK_COUNT, "chunk")?;
        let mut chunks = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = read_u32(&mut reader)?;
            let crc = read_u32(&mut reader)?;
            let chunk = match kind {
                CHUNK_MISSION => PersistChunk::Mission { crc },
                CHUNK_INTERIOR => {
                    let detail_count =
                        check_count(read_u32(&mut reader)?, MAX_DETAIL_LEVELS, "detail level")?;
                    let mut details = Vec::with_capacity(detail_count);
                    for _ in 0..detail_count {
                        let lm_count = check_count(
                            read_u32(&mut reader)?,
                            MAX_LIGHTMAPS_PER_DETAIL,
                            "lightmap",
                        )?;
                        let mut lightmaps = Vec::with_capacity(lm_count);
                        for _ in 0..lm_count {
                            let index = read_u32(&mut reader)?;
                            let width = read_u32(&mut reader)?;
                            let height = read_u32(&mut reader)?;
                            let mut delta = vec![0u8; lightmap_bytes(width, height)?];
                            reader.read_exact(&mut delta)?;
                            lightmaps.push(DeltaLightmap {
                                index,
                                width,
                                height,
                                delta,
                            });
                        }
                        details.push(DetailLightmaps { lightmaps });
                    }
                    // Reserved block: skip by its declared length whatever
                    // it holds.
                    let reserved = read_u32(&mut reader)?;
                    reader.seek(SeekFrom::Current(reserved as i64))?;
                    PersistChunk::Interior { crc, details }
                }
                CHUNK_TERRAIN => {
                    let width = read_u32(&mut reader)?;
                    let height = read_u32(&mut reader)?;
                    let mut data = vec![0u8; lightmap_bytes(width, height)?];
                    reader.read_exact(&mut data)?;
                    PersistChunk::Terrain {
                        crc,
                        width,
                        height,
                        data,
                    }
                }
                other => {
                    return Err(PersistError::InvalidFormat(format!(
                        "unknown chunk type {other}"
                    )))
                }
            };
            chunks.push(chunk);
        }
        Ok(PersistInfo { chunks })
    }
}

/// Read only the leading version tag of a cache file.
pub fn read_version(path: impl AsRef<Path>) -> Result<u32, PersistError> {
    let mut file = File::open(path)?;
    read_u32(&mut file)
}

/// Delta-encode an instance lightmap against its unlit base.
///
/// Wrapping per-channel subtraction; [`delta_decode`] inverts it exactly.
pub fn delta_encode(base: &Lightmap, instance: &Lightmap) -> Vec<u8> {
    base.data()
        .iter()
        .zip(instance.data())
        .map(|(b, i)| i.wrapping_sub(*b))
        .collect()
}

/// Rebuild an instance lightmap from its base plus a stored delta.
pub fn delta_decode(base: &Lightmap, delta: &[u8]) -> Lightmap {
    let mut out = Lightmap::new(base.width(), base.height());
    for ((o, b), d) in out.data_mut().iter_mut().zip(base.data()).zip(delta) {
        *o = b.wrapping_add(*d);
    }
    out
}

fn check_count(value: u32, max: u32, what: &str) -> Result<usize, PersistError> {
    if value > max {
        return Err(PersistError::InvalidFormat(format!(
            "{what} count {value} exceeds limit {max}"
        )));
    }
    Ok(value as usize)
}

fn lightmap_bytes(width: u32, height: u32) -> Result<usize, PersistError> {
    if width > MAX_LIGHTMAP_DIM || height > MAX_LIGHTMAP_DIM {
        return Err(PersistError::InvalidFormat(format!(
            "lightmap dimensions {width}x{height} exceed limit {MAX_LIGHTMAP_DIM}"
        )));
    }
    Ok(width as usize * height as usize * 3)
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<(), PersistError> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, PersistError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use std::fs;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("alice_bake_persist_{name}"));
        path
    }

    fn sample_info() -> PersistInfo {
        PersistInfo {
            chunks: vec![
                PersistChunk::Mission {
                    crc: 0xdead_beef ^ FILE_VERSION,
                },
                PersistChunk::Interior {
                    crc: 0x1234_5678,
                    details: vec![DetailLightmaps {
                        lightmaps: vec![DeltaLightmap {
                            index: 0,
                            width: 2,
                            height: 2,
                            delta: vec![7; 12],
                        }],
                    }],
                },
                PersistChunk::Terrain {
                    crc: 0x9abc_def0,
                    width: 2,
                    height: 1,
                    data: vec![1, 2, 3, 4, 5, 6],
                },
            ],
        }
    }

    #[test]
    fn test_round_trip_preserves_chunks() {
        let info = sample_info();
        let path = temp_path("round_trip.ml");

        info.write(&path).unwrap();
        let loaded = PersistInfo::read(&path).unwrap();

        assert_eq!(loaded, info);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let info = sample_info();
        let path = temp_path("bad_version.ml");
        info.write(&path).unwrap();

        let mut data = fs::read(&path).unwrap();
        data[0] = 0x42;
        fs::write(&path, &data).unwrap();

        let result = PersistInfo::read(&path);
        assert!(matches!(result, Err(PersistError::UnsupportedVersion(_))));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_unknown_chunk_type_rejected() {
        let path = temp_path("bad_chunk.ml");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FILE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let result = PersistInfo::read(&path);
        assert!(matches!(result, Err(PersistError::InvalidFormat(_))));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reserved_block_skipped_by_length() {
        // Hand-build an interior chunk whose reserved block is non-empty,
        // followed by a terrain chunk that must still parse.
        let path = temp_path("reserved.ml");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FILE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());

        bytes.extend_from_slice(&CHUNK_INTERIOR.to_le_bytes());
        bytes.extend_from_slice(&0x11u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // no detail levels
        bytes.extend_from_slice(&5u32.to_le_bytes()); // reserved length
        bytes.extend_from_slice(&[0xAA; 5]);

        bytes.extend_from_slice(&CHUNK_TERRAIN.to_le_bytes());
        bytes.extend_from_slice(&0x22u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&[9, 9, 9]);
        fs::write(&path, &bytes).unwrap();

        let info = PersistInfo::read(&path).unwrap();
        assert_eq!(info.chunks.len(), 2);
        assert!(matches!(
            info.chunks[1],
            PersistChunk::Terrain { crc: 0x22, .. }
        ));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_oversized_lightmap_dimensions_rejected() {
        let path = temp_path("huge_terrain.ml");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FILE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&CHUNK_TERRAIN.to_le_bytes());
        bytes.extend_from_slice(&0x33u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let result = PersistInfo::read(&path);
        assert!(matches!(result, Err(PersistError::InvalidFormat(_))));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_oversized_chunk_count_rejected() {
        let path = temp_path("huge_count.ml");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FILE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let result = PersistInfo::read(&path);
        assert!(matches!(result, Err(PersistError::InvalidFormat(_))));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_truncated_file_is_io_error() {
        let path = temp_path("truncated.ml");
        fs::write(&path, FILE_VERSION.to_le_bytes()).unwrap();
        let result = PersistInfo::read(&path);
        assert!(matches!(result, Err(PersistError::Io(_))));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_delta_round_trip_lossless() {
        let mut base = Lightmap::new(4, 4);
        let mut instance = Lightmap::new(4, 4);
        for y in 0..4 {
            for x in 0..4 {
                base.set_color(x, y, Vec3::new(0.9, 0.1, 0.5));
                instance.set_color(x, y, Vec3::new(0.2, 0.8, 0.5));
            }
        }
        let delta = delta_encode(&base, &instance);
        let decoded = delta_decode(&base, &delta);
        assert_eq!(decoded, instance);
    }

    #[test]
    fn test_read_version() {
        let info = sample_info();
        let path = temp_path("version_probe.ml");
        info.write(&path).unwrap();
        assert_eq!(read_version(&path).unwrap(), FILE_VERSION);
        fs::remove_file(&path).ok();
    }
}
