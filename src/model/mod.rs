//! GGUF container, tensor decoders and the transformer weight graph.

pub mod bitnet;
pub mod config;
pub mod demo;
pub mod dequant;
pub mod gguf;
pub mod store;
pub mod writer;

pub use bitnet::{BitNetModel, Layer, LinearWeight, ModelMode, WeightData};
pub use config::{FfnActivation, ModelConfig, RopeConfig, RopeScaling};
pub use demo::{demo_model_bytes, demo_model_writer, DemoModelSpec};
pub use dequant::{decode_tensor, f16_to_f32, GgmlType};
pub use gguf::{align_up, read_header, GgufFile, GgufHeader, GgufValue, TensorInfo};
pub use store::{I2sPacked, ModelFile, PackedBytes};
pub use writer::{GgufWriter, WriterValue};
