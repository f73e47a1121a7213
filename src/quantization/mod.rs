//! Weight packing and activation quantization.

pub mod absmax;
pub mod activation;

pub use absmax::{absmax_quantize_i2s, compute_quantization_error, pack_i2s};
pub use activation::{quantize_row, quantize_row_i8s, ActRow};
