//! Byte-indexed prefix trie over vocabulary pieces.

use std::collections::HashMap;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<u8, usize>,
    id: Option<i32>,
}

/// Arena-backed trie; node 0 is the root.
#[derive(Debug)]
pub struct Trie {
    nodes: Vec<Node>,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }

    /// Later inserts of the same piece overwrite the id.
    pub fn insert(&mut self, piece: &str, id: i32) {
        let mut cur = 0;
        for &b in piece.as_bytes() {
            cur = match self.nodes[cur].children.get(&b) {
                Some(&next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[cur].children.insert(b, next);
                    next
                }
            };
        }
        self.nodes[cur].id = Some(id);
    }

    /// Longest piece that prefixes `text[start..]`, as `(byte_len, id)`.
    pub fn longest_match(&self, text: &[u8], start: usize) -> Option<(usize, i32)> {
        let mut cur = 0;
        let mut best = None;
        for (i, b) in text.iter().enumerate().skip(start) {
            match self.nodes[cur].children.get(b) {
                Some(&next) => cur = next,
                None => break,
            }
            if let Some(id) = self.nodes[cur].id {
                best = Some((i - start + 1, id));
            }
        }
        best
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut t = Trie::new();
        t.insert("a", 1);
        t.insert("ab", 2);
        t.insert("abcd", 3);
        let text = b"abcx";
        assert_eq!(t.longest_match(text, 0), Some((2, 2)));
        assert_eq!(t.longest_match(text, 1), None);
        assert_eq!(t.longest_match(b"abcd!", 0), Some((4, 3)));
        assert_eq!(t.longest_match(b"", 0), None);
    }

    #[test]
    fn multibyte_pieces() {
        let mut t = Trie::new();
        t.insert("▁", 5);
        t.insert("▁é", 6);
        let s = "▁é".as_bytes();
        assert_eq!(t.longest_match(s, 0), Some((s.len(), 6)));
        assert_eq!(t.node_count(), 6);
    }
}
