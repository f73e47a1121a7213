//! Byte-level BPE: printable byte mapping and rank-ordered merges.

use std::collections::HashMap;

use tracing::warn;

/// GPT-2 byte-to-rune table: printable Latin-1 bytes map to themselves, the
/// rest map to `U+0100 + n` in byte order.
pub fn byte_encoder() -> [char; 256] {
    let keeps = |b: u32| (0x21..=0x7e).contains(&b) || (0xa1..=0xac).contains(&b) || b >= 0xae;
    let mut table = ['\0'; 256];
    let mut shifted = 0u32;
    for b in 0u32..256 {
        let cp = if keeps(b) {
            b
        } else {
            shifted += 1;
            255 + shifted
        };
        table[b as usize] = char::from_u32(cp).unwrap_or('\u{fffd}');
    }
    table
}

/// Inverse of [`byte_encoder`].
pub fn byte_decoder(encoder: &[char; 256]) -> HashMap<char, u8> {
    encoder
        .iter()
        .enumerate()
        .map(|(b, &c)| (c, b as u8))
        .collect()
}

/// Merge ranks keyed by `(left, right)`; lower rank merges first.
#[derive(Debug, Default)]
pub struct MergeRanks {
    ranks: HashMap<String, HashMap<String, usize>>,
    len: usize,
}

impl MergeRanks {
    /// Parse `"left right"` entries; the rank is the entry index. Entries
    /// without a separating space are skipped.
    pub fn from_merges(merges: &[String]) -> Self {
        let mut out = Self::default();
        let mut skipped = 0usize;
        for (rank, m) in merges.iter().enumerate() {
            let Some((a, b)) = m.split_once(' ') else {
                skipped += 1;
                continue;
            };
            out.ranks
                .entry(a.to_string())
                .or_default()
                .entry(b.to_string())
                .or_insert(rank);
            out.len += 1;
        }
        if skipped > 0 {
            warn!(skipped, "ignoring malformed BPE merge entries");
        }
        out
    }

    pub fn rank(&self, left: &str, right: &str) -> Option<usize> {
        self.ranks.get(left)?.get(right).copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Map raw bytes to their printable runes.
pub fn byte_map(encoder: &[char; 256], chunk: &str) -> String {
    chunk.bytes().map(|b| encoder[b as usize]).collect()
}

/// Merge one byte-mapped word and map the surviving symbols to ids.
///
/// Symbols missing from the vocabulary fall back to per-rune lookups, then to
/// `unk`.
pub fn encode_word(
    word: &str,
    ranks: &MergeRanks,
    vocab: &HashMap<String, i32>,
    unk: i32,
) -> Vec<i32> {
    let mut syms: Vec<String> = word.chars().map(String::from).collect();
    if syms.is_empty() {
        return Vec::new();
    }
    let rank_at = |syms: &[String], i: usize| ranks.rank(&syms[i], &syms[i + 1]);
    let mut pair_ranks: Vec<Option<usize>> = (0..syms.len() - 1).map(|i| rank_at(&syms, i)).collect();

    loop {
        let best = pair_ranks
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.map(|r| (r, i)))
            .min();
        let Some((_, i)) = best else { break };

        let right = syms.remove(i + 1);
        syms[i].push_str(&right);
        pair_ranks.remove(i);
        if i > 0 {
            pair_ranks[i - 1] = rank_at(&syms, i - 1);
        }
        if i < pair_ranks.len() {
            pair_ranks[i] = rank_at(&syms, i);
        }
    }

    let mut out = Vec::with_capacity(syms.len());
    for s in &syms {
        if let Some(&id) = vocab.get(s.as_str()) {
            out.push(id);
            continue;
        }
        let mut buf = [0u8; 4];
        for c in s.chars() {
            out.push(vocab.get(&*c.encode_utf8(&mut buf)).copied().unwrap_or(unk));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(pieces: &[&str]) -> HashMap<String, i32> {
        pieces
            .iter()
            .enumerate()
            .map(|(i, p)| (p.to_string(), i as i32))
            .collect()
    }

    #[test]
    fn byte_table_is_a_bijection() {
        let enc = byte_encoder();
        assert_eq!(enc[b'a' as usize], 'a');
        assert_eq!(enc[b' ' as usize], 'Ġ');
        assert_eq!(enc[b'\n' as usize], 'Ċ');
        assert_eq!(enc[0xad], '\u{143}');
        let dec = byte_decoder(&enc);
        assert_eq!(dec.len(), 256);
        for b in 0..=255u8 {
            assert_eq!(dec[&enc[b as usize]], b);
        }
    }

    #[test]
    fn lowest_rank_merges_first() {
        let merges: Vec<String> = ["l o", "lo w", "e r", "low er", "bad"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let ranks = MergeRanks::from_merges(&merges);
        assert_eq!(ranks.len(), 4);
        assert_eq!(ranks.rank("lo", "w"), Some(1));
        assert_eq!(ranks.rank("w", "lo"), None);

        let v = vocab(&["<unk>", "lower", "low", "l", "o", "w", "e", "r"]);
        assert_eq!(encode_word("lower", &ranks, &v, 0), vec![1]);
        assert_eq!(encode_word("lowr", &ranks, &v, 0), vec![2, 7]);
        // 'x' and 'y' are not in the vocabulary.
        assert_eq!(encode_word("xy", &ranks, &v, 0), vec![0, 0]);
        assert!(encode_word("", &ranks, &v, 0).is_empty());
    }

    #[test]
    fn unknown_merged_symbol_falls_back_to_runes() {
        let merges = vec!["a b".to_string()];
        let ranks = MergeRanks::from_merges(&merges);
        let v = vocab(&["<unk>", "a", "b"]);
        assert_eq!(encode_word("ab", &ranks, &v, 0), vec![1, 2]);
    }

    #[test]
    fn byte_map_spaces() {
        let enc = byte_encoder();
        assert_eq!(byte_map(&enc, " hi"), "Ġhi");
        assert_eq!(byte_map(&enc, "é"), "Ã©");
    }
}
