//! GGUF container reader.
//!
//! Follows the llama.cpp GGUF layout: header, metadata KV, tensor infos, aligned tensor data.
//! Array values are skipped unless their key is one of the tokenizer tables.

use crate::errors::{BitNetError, Result};
use crate::model::dequant::GgmlType;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Read, Write};

/// GGUF magic bytes.
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";
/// Data-region alignment when `general.alignment` is absent.
pub const DEFAULT_ALIGNMENT: u64 = 32;
/// Longest accepted string (keys, values, tensor names).
pub const MAX_STRING_LEN: u64 = 1 << 31;

/// Arrays under these keys are materialized; all others are skipped.
pub const CAPTURED_ARRAYS: [&str; 4] = [
    "tokenizer.ggml.tokens",
    "tokenizer.ggml.merges",
    "tokenizer.ggml.scores",
    "tokenizer.ggml.token_type",
];

/// Value types in metadata
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgufValueType {
    UInt8 = 0,
    Int8 = 1,
    UInt16 = 2,
    Int16 = 3,
    UInt32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    UInt64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl GgufValueType {
    pub fn from_u32(v: u32) -> Option<Self> {
        use GgufValueType::*;
        Some(match v {
            0 => UInt8,
            1 => Int8,
            2 => UInt16,
            3 => Int16,
            4 => UInt32,
            5 => Int32,
            6 => Float32,
            7 => Bool,
            8 => String,
            9 => Array,
            10 => UInt64,
            11 => Int64,
            12 => Float64,
            _ => return None,
        })
    }

    /// Encoded size for fixed-width scalars; `None` for strings and arrays.
    pub fn scalar_size(self) -> Option<u64> {
        use GgufValueType::*;
        match self {
            UInt8 | Int8 | Bool => Some(1),
            UInt16 | Int16 => Some(2),
            UInt32 | Int32 | Float32 => Some(4),
            UInt64 | Int64 | Float64 => Some(8),
            String | Array => None,
        }
    }
}

/// A decoded metadata value. Only the tokenizer arrays survive as arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    UInt8(u8),
    Int8(i8),
    UInt16(u16),
    Int16(i16),
    UInt32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    UInt64(u64),
    Int64(i64),
    Float64(f64),
    StringArray(Vec<String>),
    Float32Array(Vec<f32>),
    Int32Array(Vec<i32>),
}

impl GgufValue {
    /// Non-negative integer view that fits in u32.
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            GgufValue::UInt8(x) => Some(x as u32),
            GgufValue::UInt16(x) => Some(x as u32),
            GgufValue::UInt32(x) => Some(x),
            GgufValue::UInt64(x) => u32::try_from(x).ok(),
            GgufValue::Int32(x) => u32::try_from(x).ok(),
            GgufValue::Int64(x) => u32::try_from(x).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            GgufValue::UInt32(x) => Some(x as u64),
            GgufValue::UInt64(x) => Some(x),
            GgufValue::Int32(x) => u64::try_from(x).ok(),
            GgufValue::Int64(x) => u64::try_from(x).ok(),
            _ => self.as_u32().map(u64::from),
        }
    }

    /// Any numeric scalar widened or narrowed to f32.
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            GgufValue::Float32(x) => Some(x),
            GgufValue::Float64(x) => Some(x as f32),
            GgufValue::UInt32(x) => Some(x as f32),
            GgufValue::UInt64(x) => Some(x as f32),
            GgufValue::Int32(x) => Some(x as f32),
            GgufValue::Int64(x) => Some(x as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            GgufValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_string_array(&self) -> Option<&[String]> {
        match self {
            GgufValue::StringArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32_array(&self) -> Option<&[f32]> {
        match self {
            GgufValue::Float32Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32_array(&self) -> Option<&[i32]> {
        match self {
            GgufValue::Int32Array(v) => Some(v),
            _ => None,
        }
    }
}

/// Header: magic, version, tensor_count, metadata_kv_count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
}

impl GgufHeader {
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)
            .map_err(|e| BitNetError::from_read(e, "magic"))?;
        if magic != GGUF_MAGIC {
            return Err(BitNetError::InvalidMagic { found: magic });
        }
        Ok(Self {
            version: r
                .read_u32::<LittleEndian>()
                .map_err(|e| BitNetError::from_read(e, "version"))?,
            tensor_count: r
                .read_u64::<LittleEndian>()
                .map_err(|e| BitNetError::from_read(e, "tensor count"))?,
            kv_count: r
                .read_u64::<LittleEndian>()
                .map_err(|e| BitNetError::from_read(e, "kv count"))?,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&GGUF_MAGIC)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_u64::<LittleEndian>(self.tensor_count)?;
        w.write_u64::<LittleEndian>(self.kv_count)?;
        Ok(())
    }
}

/// Decode only the fixed-size header.
pub fn read_header<R: Read>(r: &mut R) -> Result<GgufHeader> {
    GgufHeader::read(r)
}

/// Tensor directory entry; `offset` is relative to the data region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub type_code: u32,
    pub offset: u64,
}

impl TensorInfo {
    /// Product of dimensions. Zero dims and overflow are rejected.
    pub fn element_count(&self) -> Result<u64> {
        let overflow = || BitNetError::SizeOverflow {
            name: self.name.clone(),
        };
        let mut count: u64 = 1;
        for &d in &self.dims {
            if d == 0 {
                return Err(overflow());
            }
            count = count.checked_mul(d).ok_or_else(overflow)?;
        }
        Ok(count)
    }

    pub fn ggml_type(&self) -> Option<GgmlType> {
        GgmlType::from_u32(self.type_code)
    }
}

/// Smallest multiple of `alignment` at or after `pos`.
pub fn align_up(pos: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return pos;
    }
    pos.div_ceil(alignment) * alignment
}

/// Parsed container: header, metadata, directory and data-region placement.
#[derive(Debug, Clone)]
pub struct GgufFile {
    pub header: GgufHeader,
    pub metadata: HashMap<String, GgufValue>,
    pub tensors: Vec<TensorInfo>,
    index: HashMap<String, usize>,
    pub alignment: u64,
    /// Absolute byte offset of the data region.
    pub data_offset: u64,
}

impl GgufFile {
    /// Parse header, metadata and tensor directory from a byte stream.
    pub fn read<R: Read>(r: R) -> Result<Self> {
        let mut r = CountingReader::new(r);
        let header = GgufHeader::read(&mut r)?;
        let metadata = read_metadata(&mut r, header.kv_count)?;

        let alignment = metadata
            .get("general.alignment")
            .and_then(|v| match *v {
                GgufValue::UInt32(x) => Some(x as u64),
                GgufValue::UInt64(x) => Some(x),
                GgufValue::Int32(x) => u64::try_from(x).ok(),
                GgufValue::Int64(x) => u64::try_from(x).ok(),
                _ => None,
            })
            .filter(|&a| a > 0)
            .unwrap_or(DEFAULT_ALIGNMENT);

        let tensors = read_tensor_infos(&mut r, header.tensor_count)?;
        let data_offset = align_up(r.position(), alignment);
        let index = tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        Ok(Self {
            header,
            metadata,
            tensors,
            index,
            alignment,
            data_offset,
        })
    }

    /// Parse from an in-memory image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read(bytes)
    }

    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.get(key)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.index.get(name).map(|&i| &self.tensors[i])
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// First key present as a string.
    pub fn first_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k).and_then(GgufValue::as_str))
    }

    /// First key present as an integer that fits in u32.
    pub fn first_u32(&self, keys: &[&str]) -> Option<u32> {
        keys.iter().find_map(|k| self.get(k).and_then(GgufValue::as_u32))
    }

    /// First key present as any numeric scalar.
    pub fn first_f32(&self, keys: &[&str]) -> Option<f32> {
        keys.iter().find_map(|k| self.get(k).and_then(GgufValue::as_f32))
    }

    pub fn architecture(&self) -> &str {
        self.first_str(&["general.architecture"]).unwrap_or("")
    }
}

/// Tracks the absolute stream position so the data region can be aligned
/// without requiring `Seek`.
struct CountingReader<R> {
    inner: R,
    pos: u64,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, pos: 0 }
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn skip(&mut self, n: u64, context: &str) -> Result<()> {
        let copied = io::copy(&mut self.by_ref().take(n), &mut io::sink())
            .map_err(|e| BitNetError::from_read(e, context))?;
        if copied != n {
            return Err(BitNetError::Truncated {
                context: context.to_string(),
            });
        }
        Ok(())
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

fn read_len<R: Read>(r: &mut R, context: &str) -> Result<u64> {
    let len = r
        .read_u64::<LittleEndian>()
        .map_err(|e| BitNetError::from_read(e, context))?;
    if len > MAX_STRING_LEN {
        return Err(BitNetError::InvalidFormat(format!(
            "{context}: string length {len} exceeds limit"
        )));
    }
    Ok(len)
}

fn read_string<R: Read>(r: &mut R, context: &str) -> Result<String> {
    let len = read_len(r, context)?;
    // Grow with the bytes actually present rather than the declared length.
    let mut buf = Vec::new();
    r.by_ref()
        .take(len)
        .read_to_end(&mut buf)
        .map_err(|e| BitNetError::from_read(e, context))?;
    if (buf.len() as u64) < len {
        return Err(BitNetError::Truncated {
            context: context.to_string(),
        });
    }
    Ok(match String::from_utf8(buf) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

fn read_metadata<R: Read>(
    r: &mut CountingReader<R>,
    kv_count: u64,
) -> Result<HashMap<String, GgufValue>> {
    let mut meta = HashMap::new();
    for _ in 0..kv_count {
        let key = read_string(r, "metadata key")?;
        let raw_type = r
            .read_u32::<LittleEndian>()
            .map_err(|e| BitNetError::from_read(e, "metadata value type"))?;
        let value_type =
            GgufValueType::from_u32(raw_type).ok_or(BitNetError::UnsupportedValueType(raw_type))?;
        if value_type == GgufValueType::Array {
            let (count, value) = read_array(r, &key)?;
            meta.insert(format!("{key}.count"), GgufValue::UInt64(count));
            if let Some(v) = value {
                meta.insert(key, v);
            }
        } else {
            let value = read_scalar(r, value_type, &key)?;
            meta.insert(key, value);
        }
    }
    Ok(meta)
}

fn read_scalar<R: Read>(r: &mut R, ty: GgufValueType, key: &str) -> Result<GgufValue> {
    use GgufValueType as T;
    let e = |err: io::Error| BitNetError::from_read(err, format!("value of {key}"));
    Ok(match ty {
        T::UInt8 => GgufValue::UInt8(r.read_u8().map_err(e)?),
        T::Int8 => GgufValue::Int8(r.read_i8().map_err(e)?),
        T::UInt16 => GgufValue::UInt16(r.read_u16::<LittleEndian>().map_err(e)?),
        T::Int16 => GgufValue::Int16(r.read_i16::<LittleEndian>().map_err(e)?),
        T::UInt32 => GgufValue::UInt32(r.read_u32::<LittleEndian>().map_err(e)?),
        T::Int32 => GgufValue::Int32(r.read_i32::<LittleEndian>().map_err(e)?),
        T::Float32 => GgufValue::Float32(r.read_f32::<LittleEndian>().map_err(e)?),
        T::Bool => GgufValue::Bool(r.read_u8().map_err(e)? != 0),
        T::String => GgufValue::String(read_string(r, key)?),
        T::UInt64 => GgufValue::UInt64(r.read_u64::<LittleEndian>().map_err(e)?),
        T::Int64 => GgufValue::Int64(r.read_i64::<LittleEndian>().map_err(e)?),
        T::Float64 => GgufValue::Float64(r.read_f64::<LittleEndian>().map_err(e)?),
        T::Array => {
            return Err(BitNetError::InvalidFormat(format!(
                "{key}: nested arrays are not supported"
            )))
        }
    })
}

/// Reads an array body. Returns the element count and, for captured keys with
/// the expected element type, the materialized value.
fn read_array<R: Read>(
    r: &mut CountingReader<R>,
    key: &str,
) -> Result<(u64, Option<GgufValue>)> {
    let raw_elem = r
        .read_u32::<LittleEndian>()
        .map_err(|e| BitNetError::from_read(e, format!("array type of {key}")))?;
    let elem =
        GgufValueType::from_u32(raw_elem).ok_or(BitNetError::UnsupportedValueType(raw_elem))?;
    let count = r
        .read_u64::<LittleEndian>()
        .map_err(|e| BitNetError::from_read(e, format!("array length of {key}")))?;

    let captured = CAPTURED_ARRAYS.contains(&key);
    match elem {
        GgufValueType::String if captured => {
            let mut out = Vec::with_capacity(count.min(1 << 20) as usize);
            for _ in 0..count {
                out.push(read_string(r, key)?);
            }
            Ok((count, Some(GgufValue::StringArray(out))))
        }
        GgufValueType::Float32 if captured => {
            let mut out = Vec::with_capacity(count.min(1 << 20) as usize);
            for _ in 0..count {
                out.push(
                    r.read_f32::<LittleEndian>()
                        .map_err(|e| BitNetError::from_read(e, key))?,
                );
            }
            Ok((count, Some(GgufValue::Float32Array(out))))
        }
        GgufValueType::Int32 if captured => {
            let mut out = Vec::with_capacity(count.min(1 << 20) as usize);
            for _ in 0..count {
                out.push(
                    r.read_i32::<LittleEndian>()
                        .map_err(|e| BitNetError::from_read(e, key))?,
                );
            }
            Ok((count, Some(GgufValue::Int32Array(out))))
        }
        GgufValueType::String => {
            // variable width: walk every element
            for _ in 0..count {
                let len = read_len(r, key)?;
                r.skip(len, key)?;
            }
            Ok((count, None))
        }
        GgufValueType::Array => Err(BitNetError::InvalidFormat(format!(
            "{key}: nested arrays are not supported"
        ))),
        scalar => {
            let size = scalar.scalar_size().unwrap_or(0);
            let bytes = count
                .checked_mul(size)
                .ok_or_else(|| BitNetError::InvalidFormat(format!("{key}: array too large")))?;
            r.skip(bytes, key)?;
            Ok((count, None))
        }
    }
}

fn read_tensor_infos<R: Read>(r: &mut CountingReader<R>, tensor_count: u64) -> Result<Vec<TensorInfo>> {
    let mut infos = Vec::with_capacity(tensor_count.min(1 << 16) as usize);
    for _ in 0..tensor_count {
        let name = read_string(r, "tensor name")?;
        let e = |err: io::Error| BitNetError::from_read(err, format!("tensor info {name}"));
        let n_dims = r.read_u32::<LittleEndian>().map_err(e)?;
        if n_dims > 8 {
            return Err(BitNetError::InvalidFormat(format!(
                "tensor {name}: {n_dims} dimensions"
            )));
        }
        let mut dims = vec![0u64; n_dims as usize];
        for d in &mut dims {
            *d = r.read_u64::<LittleEndian>().map_err(e)?;
        }
        let type_code = r.read_u32::<LittleEndian>().map_err(e)?;
        let offset = r.read_u64::<LittleEndian>().map_err(e)?;
        infos.push(TensorInfo {
            name,
            dims,
            type_code,
            offset,
        });
    }
    Ok(infos)
}
