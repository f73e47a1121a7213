//! Forward pass, KV cache and greedy generation.

pub mod attention;
pub mod cache;
pub mod engine;
pub mod generator;
pub mod rope;

pub use attention::causal_attention;
pub use cache::{KvCache, LayerCache};
pub use engine::{seed_token, ForwardState, InferenceEngine};
pub use generator::{
    CancelHandle, GenerationOutput, GenerationParams, TextGenerator, TopKEntry, TopKStep,
};
pub use rope::Rope;
