//! Tokenizer built from the vocabulary embedded in the model container.
//!
//! Three encoders are selected by `tokenizer.ggml.model`: SentencePiece-style
//! merges for `llama`, byte-level BPE for `gpt2` (when merges are present) and a
//! greedy longest-prefix trie otherwise.

pub mod bpe;
pub mod cache;
pub mod pretokenize;
pub mod spm;
pub mod trie;

pub use cache::LruCache;
pub use pretokenize::PreTokenizer;
pub use trie::Trie;

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::TokenizerConfig;
use crate::errors::{BitNetError, Result};
use crate::model::gguf::{GgufFile, GgufValue};
use bpe::MergeRanks;

const SPM_SPACE: &str = "▁";

/// Pieces, their ids and scores, plus the `<0xNN>` byte fallback table.
#[derive(Debug)]
pub struct Vocab {
    pub pieces: Vec<String>,
    pub ids: HashMap<String, i32>,
    pub scores: Vec<f32>,
    /// Id of `<0xNN>` for each byte, `unk` when the piece is absent.
    pub byte_tokens: [i32; 256],
    pub unk: i32,
}

impl Vocab {
    /// Scores of the wrong length are replaced by zeros.
    pub fn new(pieces: Vec<String>, scores: Option<&[f32]>, unk: i32) -> Self {
        let scores = match scores {
            Some(s) if s.len() == pieces.len() => s.to_vec(),
            _ => vec![0.0; pieces.len()],
        };
        let mut ids = HashMap::with_capacity(pieces.len());
        let mut byte_tokens = [unk; 256];
        for (i, piece) in pieces.iter().enumerate() {
            let id = i as i32;
            ids.insert(piece.clone(), id);
            if let Some(b) = parse_byte_piece(piece) {
                byte_tokens[b as usize] = id;
            }
        }
        Self {
            pieces,
            ids,
            scores,
            byte_tokens,
            unk,
        }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn piece(&self, id: i32) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.pieces.get(i))
            .map(String::as_str)
    }

    pub fn score(&self, id: i32) -> f32 {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.scores.get(i))
            .copied()
            .unwrap_or(0.0)
    }
}

/// `<0xNN>` → byte.
fn parse_byte_piece(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Which encoder `tokenize` dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    SentencePiece,
    BytePairEncoding,
    Greedy,
}

/// How `decode` turns pieces back into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeStyle {
    ByteLevel,
    SentencePiece,
    Concat,
}

pub struct Tokenizer {
    vocab: Vocab,
    trie: Trie,
    model: String,
    kind: TokenizerKind,
    decode_style: DecodeStyle,
    pre: PreTokenizer,
    merges: MergeRanks,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    add_bos: bool,
    bos_id: i32,
    eos_id: Option<i32>,
    bpe_cache: Mutex<LruCache<String, Vec<i32>>>,
    spm_cache: Mutex<LruCache<String, Vec<i32>>>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("model", &self.model)
            .field("kind", &self.kind)
            .field("vocab_size", &self.vocab.len())
            .field("merges", &self.merges.len())
            .field("add_bos", &self.add_bos)
            .finish()
    }
}

fn kv_i32(gguf: &GgufFile, key: &str) -> Option<i32> {
    gguf.get(key)
        .and_then(GgufValue::as_u32)
        .and_then(|v| i32::try_from(v).ok())
}

impl Tokenizer {
    /// Build from `tokenizer.ggml.*` metadata.
    pub fn from_metadata(gguf: &GgufFile, config: &TokenizerConfig) -> Result<Self> {
        let pieces = gguf
            .get("tokenizer.ggml.tokens")
            .ok_or_else(|| BitNetError::Tokenizer("missing tokenizer.ggml.tokens".into()))?
            .as_string_array()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                BitNetError::Tokenizer("tokenizer.ggml.tokens has invalid format".into())
            })?
            .to_vec();
        let scores = gguf
            .get("tokenizer.ggml.scores")
            .and_then(GgufValue::as_f32_array);
        let unk = kv_i32(gguf, "tokenizer.ggml.unknown_token_id").unwrap_or(0);
        let vocab = Vocab::new(pieces, scores, unk);

        let mut model = gguf
            .first_str(&["tokenizer.ggml.model"])
            .unwrap_or("")
            .to_string();
        let mut add_bos = gguf
            .get("tokenizer.ggml.add_bos_token")
            .and_then(GgufValue::as_bool)
            .unwrap_or(model == "llama");
        let merges = gguf
            .get("tokenizer.ggml.merges")
            .and_then(GgufValue::as_string_array)
            .map(MergeRanks::from_merges)
            .unwrap_or_default();
        if model.is_empty() && !merges.is_empty() {
            model = "gpt2".to_string();
            add_bos = false;
        }

        let kind = match model.as_str() {
            "llama" => TokenizerKind::SentencePiece,
            "gpt2" if !merges.is_empty() => TokenizerKind::BytePairEncoding,
            _ => TokenizerKind::Greedy,
        };
        let has_spm_prefix = vocab.pieces.iter().any(|p| p.starts_with(SPM_SPACE));
        let decode_style = if !merges.is_empty() || model == "gpt2" {
            DecodeStyle::ByteLevel
        } else if model == "llama" || has_spm_prefix {
            DecodeStyle::SentencePiece
        } else {
            DecodeStyle::Concat
        };

        let mut trie = Trie::new();
        for (i, p) in vocab.pieces.iter().enumerate() {
            trie.insert(p, i as i32);
        }

        let cache_size = |key: &str, fallback: usize| {
            gguf.get(key)
                .and_then(GgufValue::as_u32)
                .map_or(fallback, |v| v as usize)
        };
        let bpe_cache_size = cache_size("bitnet.tokenizer.bpe_cache_size", config.bpe_cache_size);
        let spm_cache_size = cache_size("bitnet.tokenizer.spm_cache_size", config.spm_cache_size);

        let pre = PreTokenizer::from_pre(gguf.first_str(&["tokenizer.ggml.pre"]).unwrap_or(""));
        let byte_encoder = bpe::byte_encoder();
        let byte_decoder = bpe::byte_decoder(&byte_encoder);

        debug!(
            model = %model,
            ?kind,
            ?pre,
            vocab = vocab.len(),
            merges = merges.len(),
            add_bos,
            "tokenizer selected"
        );

        Ok(Self {
            trie,
            model,
            kind,
            decode_style,
            pre,
            merges,
            byte_encoder,
            byte_decoder,
            add_bos,
            bos_id: kv_i32(gguf, "tokenizer.ggml.bos_token_id").unwrap_or(0),
            eos_id: kv_i32(gguf, "tokenizer.ggml.eos_token_id"),
            bpe_cache: Mutex::new(LruCache::new(bpe_cache_size)),
            spm_cache: Mutex::new(LruCache::new(spm_cache_size)),
            vocab,
        })
    }

    pub fn kind(&self) -> TokenizerKind {
        self.kind
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn bos_id(&self) -> i32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> Option<i32> {
        self.eos_id
    }

    pub fn adds_bos(&self) -> bool {
        self.add_bos
    }

    /// Encode `text`, with the BOS id first when enabled.
    pub fn tokenize(&self, text: &str) -> Vec<i32> {
        let mut out = Vec::with_capacity(text.len() + 1);
        if self.add_bos {
            out.push(self.bos_id);
        }
        match self.kind {
            TokenizerKind::SentencePiece => out.extend(self.tokenize_spm(text)),
            TokenizerKind::BytePairEncoding => out.extend(self.tokenize_bpe(text)),
            TokenizerKind::Greedy => {
                if text.starts_with(' ') {
                    out.extend(self.tokenize_greedy(text));
                } else {
                    out.extend(self.tokenize_greedy(&format!(" {text}")));
                }
            }
        }
        out
    }

    fn tokenize_spm(&self, text: &str) -> Vec<i32> {
        let normalized = spm::normalize(text);
        if let Some(hit) = self.spm_cache.lock().get(normalized.as_str()) {
            return hit;
        }
        let ids = spm::encode(&normalized, &self.vocab);
        self.spm_cache.lock().insert(normalized, ids.clone());
        ids
    }

    fn tokenize_bpe(&self, text: &str) -> Vec<i32> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut chunks = self.pre.split(text);
        if chunks.is_empty() {
            chunks.push(text);
        }
        let mut out = Vec::with_capacity(text.len());
        for chunk in chunks {
            if let Some(hit) = self.bpe_cache.lock().get(chunk) {
                out.extend(hit);
                continue;
            }
            let word = bpe::byte_map(&self.byte_encoder, chunk);
            let ids = bpe::encode_word(&word, &self.merges, &self.vocab.ids, self.vocab.unk);
            out.extend_from_slice(&ids);
            self.bpe_cache.lock().insert(chunk.to_string(), ids);
        }
        out
    }

    fn tokenize_greedy(&self, text: &str) -> Vec<i32> {
        let bytes = text.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            match self.trie.longest_match(bytes, i) {
                Some((len, id)) => {
                    out.push(id);
                    i += len;
                }
                None => {
                    out.push(self.vocab.byte_tokens[bytes[i] as usize]);
                    i += 1;
                }
            }
        }
        out
    }

    /// Concatenate the text of `ids`; out-of-range ids are skipped.
    pub fn decode(&self, ids: &[i32]) -> String {
        let pieces = ids.iter().filter_map(|&id| self.vocab.piece(id));
        match self.decode_style {
            DecodeStyle::ByteLevel => {
                let mut out = Vec::new();
                let mut buf = [0u8; 4];
                for piece in pieces {
                    for c in piece.chars() {
                        match self.byte_decoder.get(&c) {
                            Some(&b) => out.push(b),
                            None => out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes()),
                        }
                    }
                }
                String::from_utf8_lossy(&out).into_owned()
            }
            DecodeStyle::SentencePiece => {
                let mut out = Vec::new();
                for piece in pieces {
                    if let Some(b) = parse_byte_piece(piece) {
                        out.push(b);
                    } else if piece.contains(SPM_SPACE) {
                        out.extend_from_slice(piece.replace(SPM_SPACE, " ").as_bytes());
                    } else {
                        out.extend_from_slice(piece.as_bytes());
                    }
                }
                String::from_utf8_lossy(&out).into_owned()
            }
            DecodeStyle::Concat => pieces.collect(),
        }
    }

    /// Hit rate of the BPE chunk cache.
    pub fn bpe_cache_hit_rate(&self) -> f64 {
        self.bpe_cache.lock().hit_rate()
    }
}
