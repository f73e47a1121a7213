//! Regex pre-tokenization for byte-level BPE.

use std::sync::OnceLock;

use fancy_regex::Regex;
use tracing::warn;

const GPT2_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

const LLAMA3_PATTERN: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

/// Which split pattern to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreTokenizer {
    Gpt2,
    Llama3,
}

impl PreTokenizer {
    /// `tokenizer.ggml.pre` values `llama3`, `dbrx` and `smaug` (any case)
    /// select the Llama-3 pattern.
    pub fn from_pre(pre: &str) -> Self {
        match pre.to_ascii_lowercase().as_str() {
            "llama3" | "llama-bpe" | "dbrx" | "smaug" | "smaug-bpe" => PreTokenizer::Llama3,
            _ => PreTokenizer::Gpt2,
        }
    }

    fn regex(self) -> Option<&'static Regex> {
        static GPT2: OnceLock<Option<Regex>> = OnceLock::new();
        static LLAMA3: OnceLock<Option<Regex>> = OnceLock::new();
        let (cell, pattern) = match self {
            PreTokenizer::Gpt2 => (&GPT2, GPT2_PATTERN),
            PreTokenizer::Llama3 => (&LLAMA3, LLAMA3_PATTERN),
        };
        cell.get_or_init(|| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(?self, error = %e, "pre-tokenizer pattern failed to compile");
                None
            }
        })
        .as_ref()
    }

    /// Split `text` into the chunks BPE merges run over. Matches always
    /// cover the input; if matching fails the unmatched tail becomes one chunk.
    pub fn split<'a>(self, text: &'a str) -> Vec<&'a str> {
        let Some(re) = self.regex() else {
            return if text.is_empty() { Vec::new() } else { vec![text] };
        };
        let mut out = Vec::new();
        let mut end = 0;
        for m in re.find_iter(text) {
            match m {
                Ok(m) => {
                    out.push(m.as_str());
                    end = m.end();
                }
                Err(e) => {
                    warn!(error = %e, "pre-tokenizer match failed");
                    break;
                }
            }
        }
        if end < text.len() {
            out.push(&text[end..]);
        }
        out
    }
}
