//! SentencePiece-style segmentation: score-ordered bigram merges over UTF-8
//! symbols, then resegmentation with byte fallback.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use super::Vocab;

/// Byte span of the normalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Span {
    start: usize,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
struct Symbol {
    span: Span,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Bigram {
    left: usize,
    right: usize,
    score: f32,
    size: usize,
}

impl PartialEq for Bigram {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Bigram {}

impl PartialOrd for Bigram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bigram {
    /// Max-heap order: higher score first, then the left-most pair.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.left.cmp(&self.left))
    }
}

/// `▁` prefix plus every space replaced by `▁`.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 3);
    out.push('▁');
    out.push_str(&text.replace(' ', "▁"));
    out
}

struct Segmenter<'a> {
    text: &'a str,
    vocab: &'a Vocab,
    symbols: Vec<Symbol>,
    queue: BinaryHeap<Bigram>,
    /// Piece → the two spans it was last built from.
    rev_merge: HashMap<&'a str, (Span, Span)>,
}

impl<'a> Segmenter<'a> {
    fn piece(&self, span: Span) -> &'a str {
        &self.text[span.start..span.start + span.len]
    }

    fn try_add_bigram(&mut self, left: Option<usize>, right: Option<usize>) {
        let (Some(left), Some(right)) = (left, right) else {
            return;
        };
        let (l, r) = (self.symbols[left].span, self.symbols[right].span);
        if l.len == 0 || r.len == 0 {
            return;
        }
        let joined = Span {
            start: l.start,
            len: r.start + r.len - l.start,
        };
        let piece = self.piece(joined);
        let Some(&id) = self.vocab.ids.get(piece) else {
            return;
        };
        let score = self.vocab.score(id);
        self.queue.push(Bigram {
            left,
            right,
            score,
            size: joined.len,
        });
        self.rev_merge.insert(piece, (l, r));
    }

    fn merge_all(&mut self) {
        for i in 1..self.symbols.len() {
            self.try_add_bigram(Some(i - 1), Some(i));
        }
        while let Some(bg) = self.queue.pop() {
            let (l, r) = (self.symbols[bg.left], self.symbols[bg.right]);
            if l.span.len == 0 || r.span.len == 0 || l.span.len + r.span.len != bg.size {
                continue;
            }
            self.symbols[bg.left].span.len += r.span.len;
            self.symbols[bg.right].span.len = 0;
            self.symbols[bg.left].next = r.next;
            if let Some(n) = r.next {
                self.symbols[n].prev = Some(bg.left);
            }
            self.try_add_bigram(l.prev, Some(bg.left));
            self.try_add_bigram(Some(bg.left), r.next);
        }
    }

    fn resegment(&self, root: Span, out: &mut Vec<i32>) {
        let mut stack = vec![root];
        let mut visited: HashSet<Span> = HashSet::new();
        while let Some(span) = stack.pop() {
            if span.len == 0 {
                continue;
            }
            let piece = self.piece(span);
            if let Some(&id) = self.vocab.ids.get(piece) {
                out.push(id);
                continue;
            }
            if let Some(&(l, r)) = self.rev_merge.get(piece) {
                if visited.insert(span) {
                    // Right first so the left half is emitted first.
                    stack.push(r);
                    stack.push(l);
                    continue;
                }
            }
            out.extend(piece.bytes().map(|b| self.vocab.byte_tokens[b as usize]));
        }
    }
}

/// Segment already-normalized text.
pub fn encode(text: &str, vocab: &Vocab) -> Vec<i32> {
    let mut symbols: Vec<Symbol> = text
        .char_indices()
        .map(|(start, c)| Symbol {
            span: Span {
                start,
                len: c.len_utf8(),
            },
            prev: None,
            next: None,
        })
        .collect();
    let n = symbols.len();
    for (i, s) in symbols.iter_mut().enumerate() {
        s.prev = i.checked_sub(1);
        s.next = (i + 1 < n).then_some(i + 1);
    }

    let mut seg = Segmenter {
        text,
        vocab,
        symbols,
        queue: BinaryHeap::new(),
        rev_merge: HashMap::new(),
    };
    seg.merge_all();

    let mut out = Vec::with_capacity(n);
    let mut cur = if n > 0 { Some(0) } else { None };
    while let Some(i) = cur {
        let sym = seg.symbols[i];
        seg.resegment(sym.span, &mut out);
        cur = sym.next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(pieces: &[(&str, f32)]) -> Vocab {
        let tokens: Vec<String> = pieces.iter().map(|(p, _)| p.to_string()).collect();
        let scores: Vec<f32> = pieces.iter().map(|(_, s)| *s).collect();
        Vocab::new(tokens, Some(&scores), 0)
    }

    #[test]
    fn normalize_marks_word_starts() {
        assert_eq!(normalize("a b"), "▁a▁b");
        assert_eq!(normalize(""), "▁");
    }

    #[test]
    fn highest_score_merges_win() {
        let v = vocab(&[
            ("<unk>", 0.0),
            ("▁", -1.0),
            ("h", -1.0),
            ("i", -1.0),
            ("▁h", -2.0),
            ("hi", -0.5),
            ("▁hi", -0.1),
        ]);
        // "hi" outranks "▁h", then "▁" + "hi" forms "▁hi".
        assert_eq!(encode(&normalize("hi"), &v), vec![6]);

        let v = vocab(&[
            ("<unk>", 0.0),
            ("▁", -1.0),
            ("h", -1.0),
            ("i", -1.0),
            ("▁h", -0.2),
            ("hi", -0.5),
        ]);
        assert_eq!(encode(&normalize("hi"), &v), vec![4, 3]);
    }

    #[test]
    fn equal_scores_merge_left_first() {
        let v = vocab(&[("<unk>", 0.0), ("a", 0.0), ("aa", 1.0)]);
        assert_eq!(encode("aaa", &v), vec![2, 1]);
    }

    #[test]
    fn unknown_chars_use_byte_tokens() {
        let v = vocab(&[("<unk>", 0.0), ("▁", 0.0), ("<0xC3>", 0.0), ("<0xA9>", 0.0)]);
        assert_eq!(encode(&normalize("é"), &v), vec![1, 2, 3]);
        // No byte piece for 'z': falls back to unk.
        assert_eq!(encode("z", &v), vec![0]);
    }

    #[test]
    fn empty_text() {
        let v = vocab(&[("<unk>", 0.0)]);
        assert!(encode("", &v).is_empty());
    }
}
