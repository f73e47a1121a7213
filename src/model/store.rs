//! Tensor store over an opened container.
//!
//! On unix hosts the file is memory-mapped and packed ternary weights are
//! borrowed straight from the mapping. Elsewhere (or with `use_mmap = false`)
//! tensors are read through a buffered file handle.

use crate::errors::{BitNetError, Result};
use crate::model::dequant::{decode_tensor, i2s_packed_len, GgmlType};
use crate::model::gguf::{GgufFile, TensorInfo};
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Raw tensor bytes, either owned or borrowed from a shared mapping.
#[derive(Clone)]
pub enum PackedBytes {
    Owned(Vec<u8>),
    Mapped { map: Arc<Mmap>, range: Range<usize> },
}

impl Deref for PackedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PackedBytes::Owned(v) => v,
            PackedBytes::Mapped { map, range } => &map[range.clone()],
        }
    }
}

impl std::fmt::Debug for PackedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            PackedBytes::Owned(_) => "owned",
            PackedBytes::Mapped { .. } => "mapped",
        };
        write!(f, "PackedBytes({kind}, {} bytes)", self.len())
    }
}

/// Packed I2_S weights plus the scale stored after them.
#[derive(Debug, Clone)]
pub struct I2sPacked {
    pub packed: PackedBytes,
    pub scale: f32,
    pub count: usize,
}

enum Backing {
    Mapped(Arc<Mmap>),
    Reader(Mutex<BufReader<File>>),
    Memory(Arc<Vec<u8>>),
}

/// An opened model container.
pub struct ModelFile {
    path: PathBuf,
    gguf: GgufFile,
    backing: Backing,
}

impl ModelFile {
    /// Opens `path`, parsing the header, metadata and tensor directory.
    pub fn open(path: impl AsRef<Path>, use_mmap: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;

        #[cfg(unix)]
        {
            if use_mmap {
                // SAFETY: the mapping is read-only and the file is not modified
                // while the model is loaded.
                let map = unsafe { Mmap::map(&file)? };
                let gguf = GgufFile::from_bytes(&map)?;
                return Ok(Self {
                    path,
                    gguf,
                    backing: Backing::Mapped(Arc::new(map)),
                });
            }
        }
        #[cfg(not(unix))]
        let _ = use_mmap;

        let mut reader = BufReader::new(file);
        let gguf = GgufFile::read(&mut reader)?;
        Ok(Self {
            path,
            gguf,
            backing: Backing::Reader(Mutex::new(reader)),
        })
    }

    /// Wraps an in-memory container image.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let gguf = GgufFile::from_bytes(&bytes)?;
        Ok(Self {
            path: PathBuf::new(),
            gguf,
            backing: Backing::Memory(Arc::new(bytes)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn gguf(&self) -> &GgufFile {
        &self.gguf
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    pub fn tensor_info(&self, name: &str) -> Result<&TensorInfo> {
        self.gguf
            .tensor(name)
            .ok_or_else(|| BitNetError::MissingTensor(name.to_string()))
    }

    /// Encoded bytes of `name` (for I2_S, packed codes plus the trailing scale).
    pub fn tensor_bytes(&self, name: &str) -> Result<(GgmlType, usize, PackedBytes)> {
        let info = self.tensor_info(name)?;
        let ty = info.ggml_type().ok_or_else(|| BitNetError::UnsupportedType {
            type_code: info.type_code,
            context: name.to_string(),
        })?;
        let count = info.element_count()?;
        let len = ty.encoded_len(name, count)?;
        let start = self
            .gguf
            .data_offset
            .checked_add(info.offset)
            .ok_or_else(|| BitNetError::SizeOverflow {
                name: name.to_string(),
            })?;
        let bytes = self.read_range(name, start, len)?;
        Ok((ty, count as usize, bytes))
    }

    fn read_range(&self, name: &str, start: u64, len: usize) -> Result<PackedBytes> {
        let truncated = || BitNetError::Truncated {
            context: format!("tensor {name} data"),
        };
        match &self.backing {
            Backing::Mapped(map) => {
                let range = slice_range(start, len, map.len()).ok_or_else(truncated)?;
                Ok(PackedBytes::Mapped {
                    map: Arc::clone(map),
                    range,
                })
            }
            Backing::Memory(buf) => {
                let range = slice_range(start, len, buf.len()).ok_or_else(truncated)?;
                Ok(PackedBytes::Owned(buf[range].to_vec()))
            }
            Backing::Reader(reader) => {
                let mut reader = reader.lock();
                reader.seek(SeekFrom::Start(start))?;
                let mut out = vec![0u8; len];
                reader
                    .read_exact(&mut out)
                    .map_err(|e| BitNetError::from_read(e, format!("tensor {name} data")))?;
                Ok(PackedBytes::Owned(out))
            }
        }
    }

    /// Any supported tensor type decoded to f32.
    pub fn read_tensor_f32(&self, name: &str) -> Result<Vec<f32>> {
        let (ty, count, bytes) = self.tensor_bytes(name)?;
        debug!(tensor = name, ty = ty.name(), count, "decoding tensor");
        decode_tensor(ty, &bytes, count, name)
    }

    /// F16 tensor as raw half bits, without decoding.
    pub fn read_tensor_f16_raw(&self, name: &str) -> Result<Vec<u16>> {
        let (ty, _, bytes) = self.tensor_bytes(name)?;
        if ty != GgmlType::F16 {
            return Err(BitNetError::UnsupportedType {
                type_code: ty as u32,
                context: format!("{name}: expected f16"),
            });
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    /// I2_S tensor in packed form.
    pub fn read_tensor_i2s_packed(&self, name: &str) -> Result<I2sPacked> {
        let (ty, count, bytes) = self.tensor_bytes(name)?;
        if ty != GgmlType::I2S {
            return Err(BitNetError::UnsupportedType {
                type_code: ty as u32,
                context: format!("{name}: expected i2_s"),
            });
        }
        let packed_len = i2s_packed_len(count);
        let s = &bytes[packed_len..packed_len + 4];
        let scale = f32::from_le_bytes([s[0], s[1], s[2], s[3]]);
        let packed = match bytes {
            PackedBytes::Mapped { map, range } => PackedBytes::Mapped {
                map,
                range: range.start..range.start + packed_len,
            },
            PackedBytes::Owned(mut v) => {
                v.truncate(packed_len);
                PackedBytes::Owned(v)
            }
        };
        Ok(I2sPacked {
            packed,
            scale,
            count,
        })
    }
}

fn slice_range(start: u64, len: usize, total: usize) -> Option<Range<usize>> {
    let start = usize::try_from(start).ok()?;
    let end = start.checked_add(len)?;
    (end <= total).then_some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::writer::GgufWriter;
    use std::io::Write;

    fn sample() -> Vec<u8> {
        let mut w = GgufWriter::new();
        w.add_tensor_f32("a", &[2, 2], &[1.5, -2.0, 0.25, 3.75])
            .add_tensor_f16("h", &[2], &[1.0, -0.5])
            .add_tensor_i2s("t", &[128], &[1i8; 128], 0.75);
        w.to_bytes().unwrap()
    }

    #[test]
    fn reads_every_view_from_memory() {
        let store = ModelFile::from_bytes(sample()).unwrap();
        assert_eq!(store.read_tensor_f32("a").unwrap(), vec![1.5, -2.0, 0.25, 3.75]);
        assert_eq!(store.read_tensor_f16_raw("h").unwrap(), vec![0x3c00, 0xb800]);
        let t = store.read_tensor_i2s_packed("t").unwrap();
        assert_eq!(t.packed.len(), 32);
        assert_eq!(t.scale, 0.75);
        assert!(store.read_tensor_f32("t").unwrap().iter().all(|&v| v == 0.75));
    }

    #[test]
    fn mapped_and_buffered_agree() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&sample()).unwrap();
        tmp.flush().unwrap();
        let mapped = ModelFile::open(tmp.path(), true).unwrap();
        let buffered = ModelFile::open(tmp.path(), false).unwrap();
        assert!(!buffered.is_mapped());
        for name in ["a", "h", "t"] {
            assert_eq!(
                mapped.read_tensor_f32(name).unwrap(),
                buffered.read_tensor_f32(name).unwrap()
            );
        }
    }

    #[test]
    fn missing_and_wrong_type() {
        let store = ModelFile::from_bytes(sample()).unwrap();
        assert!(matches!(
            store.read_tensor_f32("nope"),
            Err(BitNetError::MissingTensor(_))
        ));
        assert!(matches!(
            store.read_tensor_i2s_packed("a"),
            Err(BitNetError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn truncated_data_region() {
        let mut bytes = sample();
        bytes.truncate(bytes.len() - 8);
        let store = ModelFile::from_bytes(bytes).unwrap();
        assert!(matches!(
            store.read_tensor_i2s_packed("t"),
            Err(BitNetError::Truncated { .. })
        ));
    }
}
