//! GGUF writer used for fixtures, demo models and tooling.
//!
//! Emits the same layout the reader accepts: header, metadata KV, tensor
//! infos, zero padding to the alignment, then each tensor at an aligned offset.

use crate::errors::{BitNetError, Result};
use crate::model::dequant::GgmlType;
use crate::model::gguf::{align_up, GgufHeader, GgufValueType, DEFAULT_ALIGNMENT};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub const GGUF_VERSION: u32 = 3;

/// Metadata value to be written.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterValue {
    UInt8(u8),
    UInt32(u32),
    Int32(i32),
    UInt64(u64),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    String(String),
    StringArray(Vec<String>),
    Float32Array(Vec<f32>),
    Int32Array(Vec<i32>),
    UInt32Array(Vec<u32>),
}

struct PendingTensor {
    name: String,
    dims: Vec<u64>,
    type_code: u32,
    data: Vec<u8>,
}

/// In-memory GGUF builder.
pub struct GgufWriter {
    kv: Vec<(String, WriterValue)>,
    tensors: Vec<PendingTensor>,
    alignment: u64,
}

impl Default for GgufWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl GgufWriter {
    pub fn new() -> Self {
        Self {
            kv: Vec::new(),
            tensors: Vec::new(),
            alignment: DEFAULT_ALIGNMENT,
        }
    }

    /// Appends a metadata entry. `general.alignment` also changes the layout.
    pub fn add_kv(&mut self, key: impl Into<String>, value: WriterValue) -> &mut Self {
        let key = key.into();
        if key == "general.alignment" {
            if let WriterValue::UInt32(a) = value {
                if a > 0 {
                    self.alignment = a as u64;
                }
            }
        }
        self.kv.push((key, value));
        self
    }

    /// Appends a tensor with pre-encoded bytes.
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        dims: &[u64],
        type_code: u32,
        data: Vec<u8>,
    ) -> &mut Self {
        self.tensors.push(PendingTensor {
            name: name.into(),
            dims: dims.to_vec(),
            type_code,
            data,
        });
        self
    }

    pub fn add_tensor_f32(&mut self, name: impl Into<String>, dims: &[u64], values: &[f32]) -> &mut Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_tensor(name, dims, GgmlType::F32 as u32, data)
    }

    pub fn add_tensor_f16(&mut self, name: impl Into<String>, dims: &[u64], values: &[f32]) -> &mut Self {
        let data = values
            .iter()
            .flat_map(|&v| half::f16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        self.add_tensor(name, dims, GgmlType::F16 as u32, data)
    }

    /// Appends an I2_S tensor from ternary values in {-1, 0, 1} and a scale.
    pub fn add_tensor_i2s(
        &mut self,
        name: impl Into<String>,
        dims: &[u64],
        ternary: &[i8],
        scale: f32,
    ) -> &mut Self {
        let data = crate::quantization::absmax::pack_i2s(ternary, scale);
        self.add_tensor(name, dims, GgmlType::I2S as u32, data)
    }

    /// Serializes the whole container.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);
        self.write(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut w = PositionWriter { inner: w, pos: 0 };
        GgufHeader {
            version: GGUF_VERSION,
            tensor_count: self.tensors.len() as u64,
            kv_count: self.kv.len() as u64,
        }
        .write(&mut w)?;

        for (key, value) in &self.kv {
            write_string(&mut w, key)?;
            write_value(&mut w, value)?;
        }

        let mut offset = 0u64;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            offset = align_up(offset, self.alignment);
            offsets.push(offset);
            write_string(&mut w, &t.name)?;
            w.write_u32::<LittleEndian>(t.dims.len() as u32)?;
            for &d in &t.dims {
                w.write_u64::<LittleEndian>(d)?;
            }
            w.write_u32::<LittleEndian>(t.type_code)?;
            w.write_u64::<LittleEndian>(offset)?;
            offset += t.data.len() as u64;
        }

        pad_to(&mut w, self.alignment)?;
        let data_start = w.pos;
        for (t, &off) in self.tensors.iter().zip(&offsets) {
            let target = data_start + off;
            if w.pos > target {
                return Err(BitNetError::InvalidFormat(format!(
                    "tensor {} overlaps its predecessor",
                    t.name
                )));
            }
            let gap = (target - w.pos) as usize;
            w.write_all(&vec![0u8; gap])?;
            w.write_all(&t.data)?;
        }
        Ok(())
    }
}

struct PositionWriter<'a, W> {
    inner: &'a mut W,
    pos: u64,
}

impl<W: Write> Write for PositionWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn pad_to<W: Write>(w: &mut PositionWriter<'_, W>, alignment: u64) -> io::Result<()> {
    let padding = (align_up(w.pos, alignment) - w.pos) as usize;
    w.write_all(&vec![0u8; padding])
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_u64::<LittleEndian>(s.len() as u64)?;
    w.write_all(s.as_bytes())
}

fn write_array_header<W: Write>(w: &mut W, elem: GgufValueType, len: usize) -> io::Result<()> {
    w.write_u32::<LittleEndian>(GgufValueType::Array as u32)?;
    w.write_u32::<LittleEndian>(elem as u32)?;
    w.write_u64::<LittleEndian>(len as u64)
}

fn write_value<W: Write>(w: &mut W, value: &WriterValue) -> io::Result<()> {
    use GgufValueType as T;
    match value {
        WriterValue::UInt8(v) => {
            w.write_u32::<LittleEndian>(T::UInt8 as u32)?;
            w.write_u8(*v)
        }
        WriterValue::UInt32(v) => {
            w.write_u32::<LittleEndian>(T::UInt32 as u32)?;
            w.write_u32::<LittleEndian>(*v)
        }
        WriterValue::Int32(v) => {
            w.write_u32::<LittleEndian>(T::Int32 as u32)?;
            w.write_i32::<LittleEndian>(*v)
        }
        WriterValue::UInt64(v) => {
            w.write_u32::<LittleEndian>(T::UInt64 as u32)?;
            w.write_u64::<LittleEndian>(*v)
        }
        WriterValue::Int64(v) => {
            w.write_u32::<LittleEndian>(T::Int64 as u32)?;
            w.write_i64::<LittleEndian>(*v)
        }
        WriterValue::Float32(v) => {
            w.write_u32::<LittleEndian>(T::Float32 as u32)?;
            w.write_f32::<LittleEndian>(*v)
        }
        WriterValue::Float64(v) => {
            w.write_u32::<LittleEndian>(T::Float64 as u32)?;
            w.write_f64::<LittleEndian>(*v)
        }
        WriterValue::Bool(v) => {
            w.write_u32::<LittleEndian>(T::Bool as u32)?;
            w.write_u8(*v as u8)
        }
        WriterValue::String(s) => {
            w.write_u32::<LittleEndian>(T::String as u32)?;
            write_string(w, s)
        }
        WriterValue::StringArray(items) => {
            write_array_header(w, T::String, items.len())?;
            items.iter().try_for_each(|s| write_string(w, s))
        }
        WriterValue::Float32Array(items) => {
            write_array_header(w, T::Float32, items.len())?;
            items.iter().try_for_each(|&v| w.write_f32::<LittleEndian>(v))
        }
        WriterValue::Int32Array(items) => {
            write_array_header(w, T::Int32, items.len())?;
            items.iter().try_for_each(|&v| w.write_i32::<LittleEndian>(v))
        }
        WriterValue::UInt32Array(items) => {
            write_array_header(w, T::UInt32, items.len())?;
            items.iter().try_for_each(|&v| w.write_u32::<LittleEndian>(v))
        }
    }
}
