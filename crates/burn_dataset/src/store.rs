//! Feature shards and manifests under `binary/`.
//!
//! A shard is a little-endian file: a 64-byte header followed by
//! `total_frames * n_mels` f32 log-mel values.
//!
//! | bytes  | field                 |
//! |--------|-----------------------|
//! | 0..4   | magic `FAS1`          |
//! | 4..8   | shard version (1)     |
//! | 8..12  | dtype (0 = f32)       |
//! | 12..16 | n_mels                |
//! | 16..24 | total frames          |
//! | 24..32 | data offset in bytes  |

use crate::types::{BurnDatasetError, DatasetResult, ShardStoreMode};
use data_contracts::BinaryManifest;
use memmap2::MmapOptions;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SHARD_MAGIC: &[u8; 4] = b"FAS1";
pub const SHARD_VERSION: u32 = 1;
pub const SHARD_HEADER_LEN: usize = 64;

pub fn manifest_path(binary_dir: &Path, prefix: &str) -> PathBuf {
    binary_dir.join(format!("{prefix}.json"))
}

pub fn load_manifest(path: &Path) -> DatasetResult<BinaryManifest> {
    let raw = fs::read(path).map_err(|e| BurnDatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_slice(&raw).map_err(|e| BurnDatasetError::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn save_manifest(path: &Path, manifest: &BinaryManifest) -> DatasetResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    if !parent.exists() {
        fs::create_dir_all(parent).map_err(|e| BurnDatasetError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let data =
        serde_json::to_vec_pretty(manifest).map_err(|e| BurnDatasetError::Other(e.to_string()))?;
    fs::write(path, data).map_err(|e| BurnDatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

enum ShardBacking {
    Owned(Vec<f32>),
    Mmap {
        mmap: Arc<memmap2::Mmap>,
        data_offset: usize,
    },
}

pub struct FeatureShard {
    path: PathBuf,
    n_mels: usize,
    total_frames: usize,
    backing: ShardBacking,
}

impl std::fmt::Debug for FeatureShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureShard")
            .field("path", &self.path)
            .field("n_mels", &self.n_mels)
            .field("total_frames", &self.total_frames)
            .finish()
    }
}

fn read_u32_le(data: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&data[..4]);
    u32::from_le_bytes(arr)
}

fn read_u64_le(data: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&data[..8]);
    u64::from_le_bytes(arr)
}

struct ShardHeader {
    n_mels: usize,
    total_frames: usize,
    data_offset: usize,
}

fn parse_header(path: &Path, data: &[u8]) -> DatasetResult<ShardHeader> {
    let bad = |msg: String| BurnDatasetError::Shard {
        path: path.to_path_buf(),
        msg,
    };
    if data.len() < SHARD_HEADER_LEN {
        return Err(bad("file smaller than header".into()));
    }
    if &data[0..4] != SHARD_MAGIC {
        return Err(bad("bad magic".into()));
    }
    let version = read_u32_le(&data[4..8]);
    if version != SHARD_VERSION {
        return Err(bad(format!(
            "shard version mismatch {version} vs {SHARD_VERSION}"
        )));
    }
    let dtype = read_u32_le(&data[8..12]);
    if dtype != 0 {
        return Err(bad(format!("unsupported dtype {dtype}")));
    }
    let n_mels = read_u32_le(&data[12..16]) as usize;
    let total_frames = read_u64_le(&data[16..24]) as usize;
    let data_offset = read_u64_le(&data[24..32]) as usize;
    if n_mels == 0 {
        return Err(bad("n_mels is zero".into()));
    }
    let data_bytes = total_frames
        .checked_mul(n_mels)
        .and_then(|v| v.checked_mul(std::mem::size_of::<f32>()))
        .ok_or_else(|| bad("overflow computing data size".into()))?;
    if data_offset < SHARD_HEADER_LEN || data_offset + data_bytes > data.len() {
        return Err(bad("truncated".into()));
    }
    Ok(ShardHeader {
        n_mels,
        total_frames,
        data_offset,
    })
}

impl FeatureShard {
    pub fn open(path: &Path, mode: ShardStoreMode) -> DatasetResult<Self> {
        match mode {
            ShardStoreMode::InMemory => Self::open_owned(path),
            ShardStoreMode::Mmap => Self::open_mmap(path),
        }
    }

    fn open_owned(path: &Path) -> DatasetResult<Self> {
        let data = fs::read(path).map_err(|e| BurnDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let header = parse_header(path, &data)?;
        let end = header.data_offset + header.total_frames * header.n_mels * 4;
        let values = data[header.data_offset..end]
            .chunks_exact(4)
            .map(|chunk| {
                let mut arr = [0u8; 4];
                arr.copy_from_slice(chunk);
                f32::from_le_bytes(arr)
            })
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            n_mels: header.n_mels,
            total_frames: header.total_frames,
            backing: ShardBacking::Owned(values),
        })
    }

    fn open_mmap(path: &Path) -> DatasetResult<Self> {
        let file = File::open(path).map_err(|e| BurnDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        // The shard is treated as read-only for the lifetime of the map.
        let mmap = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|e| BurnDatasetError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })?
        };
        let header = parse_header(path, &mmap[..])?;
        Ok(Self {
            path: path.to_path_buf(),
            n_mels: header.n_mels,
            total_frames: header.total_frames,
            backing: ShardBacking::Mmap {
                mmap: Arc::new(mmap),
                data_offset: header.data_offset,
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Append `frames` rows starting at frame `offset` to `out`.
    pub fn copy_frames(&self, offset: usize, frames: usize, out: &mut Vec<f32>) -> DatasetResult<()> {
        let end = offset
            .checked_add(frames)
            .ok_or_else(|| BurnDatasetError::Other("frame offset overflow".into()))?;
        if end > self.total_frames {
            return Err(BurnDatasetError::Shard {
                path: self.path.clone(),
                msg: format!(
                    "frames {offset}..{end} out of range ({} frames)",
                    self.total_frames
                ),
            });
        }
        let start_elem = offset * self.n_mels;
        let elems = frames * self.n_mels;
        out.reserve(elems);
        match &self.backing {
            ShardBacking::Owned(values) => {
                out.extend_from_slice(&values[start_elem..start_elem + elems]);
            }
            ShardBacking::Mmap { mmap, data_offset } => {
                let start = data_offset + start_elem * 4;
                for chunk in mmap[start..start + elems * 4].chunks_exact(4) {
                    let mut arr = [0u8; 4];
                    arr.copy_from_slice(chunk);
                    out.push(f32::from_le_bytes(arr));
                }
            }
        }
        Ok(())
    }
}

/// Streaming writer for feature shards; used by binarizers and tests.
pub struct ShardWriter {
    path: PathBuf,
    file: BufWriter<File>,
    n_mels: usize,
    total_frames: u64,
}

impl ShardWriter {
    pub fn create(path: &Path, n_mels: usize) -> DatasetResult<Self> {
        let io_err = |e| BurnDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        if n_mels == 0 {
            return Err(BurnDatasetError::Other("n_mels must be positive".into()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = BufWriter::new(File::create(path).map_err(io_err)?);
        file.write_all(&[0u8; SHARD_HEADER_LEN]).map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            n_mels,
            total_frames: 0,
        })
    }

    /// Append row-major `[frames, n_mels]` features; returns their frame offset.
    pub fn append(&mut self, melspec: &[f32]) -> DatasetResult<u64> {
        if melspec.len() % self.n_mels != 0 {
            return Err(BurnDatasetError::Other(format!(
                "feature length {} is not a multiple of n_mels {}",
                melspec.len(),
                self.n_mels
            )));
        }
        let offset = self.total_frames;
        for v in melspec {
            self.file
                .write_all(&v.to_le_bytes())
                .map_err(|e| BurnDatasetError::Io {
                    path: self.path.clone(),
                    source: e,
                })?;
        }
        self.total_frames += (melspec.len() / self.n_mels) as u64;
        Ok(offset)
    }

    pub fn finish(mut self) -> DatasetResult<u64> {
        let mut header = [0u8; SHARD_HEADER_LEN];
        header[0..4].copy_from_slice(SHARD_MAGIC);
        header[4..8].copy_from_slice(&SHARD_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&0u32.to_le_bytes());
        header[12..16].copy_from_slice(&(self.n_mels as u32).to_le_bytes());
        header[16..24].copy_from_slice(&self.total_frames.to_le_bytes());
        header[24..32].copy_from_slice(&(SHARD_HEADER_LEN as u64).to_le_bytes());
        let path = self.path.clone();
        let io_err = |e| BurnDatasetError::Io {
            path: path.clone(),
            source: e,
        };
        self.file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        self.file.write_all(&header).map_err(io_err)?;
        self.file.flush().map_err(io_err)?;
        Ok(self.total_frames)
    }
}
