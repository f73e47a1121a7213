//! # bitnet-runtime
//!
//! Inference core for BitNet-style ternary decoder-only transformers stored in
//! GGUF containers.
//!
//! ## Layout
//!
//! - **model**: GGUF reader and writer, tensor decoders, model graph wiring
//! - **kernels**: dense, F16 and I2_S ternary matvecs, RMSNorm, activations, softmax
//! - **tokenizer**: SentencePiece, GPT-2 byte-level BPE and a greedy trie fallback
//! - **inference**: forward pass with KV cache, RoPE and grouped-query attention
//! - **session**: `load_model` and `Session::generate`
//!
//! ```no_run
//! use bitnet_runtime::{load_model, GenerateRequest};
//!
//! let session = load_model("model.gguf")?;
//! let out = session.generate(&GenerateRequest::new("Hello", 16))?;
//! println!("{}", out.text);
//! # Ok::<(), bitnet_runtime::BitNetError>(())
//! ```

pub mod config;
pub mod errors;
pub mod inference;
pub mod kernels;
pub mod model;
pub mod quantization;
pub mod session;
pub mod tokenizer;
pub mod utils;

pub use config::{Code3Mode, KernelConfig, RuntimeConfig, TokenizerConfig};
pub use errors::{BitNetError, Result};
pub use inference::{CancelHandle, InferenceEngine, TextGenerator, TopKEntry, TopKStep};
pub use kernels::KernelContext;
pub use model::{BitNetModel, GgufFile, GgufWriter, ModelConfig, ModelFile};
pub use session::{load_model, load_model_with_config, GenerateRequest, GenerateResult, ModelInfo, Session};
pub use tokenizer::Tokenizer;
