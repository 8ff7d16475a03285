//! Deterministic splitting of OCR text into bounded chunks.
//!
//! The text is cut into paragraph pieces (each piece keeps its trailing
//! blank-line separator, so the pieces concatenate back to the input).
//! Pieces are packed greedily into chunk bodies. A single piece larger than
//! the body budget is cut at the last newline, then the last whitespace, then
//! at a character boundary. Sizes are counted in chars.

use std::sync::OnceLock;

use regex::Regex;

use super::CorrectionError;

fn paragraph_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:\r?\n[ \t]*){2,}").expect("valid paragraph regex"))
}

/// One unit of work for the correction collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    /// Tail of the previous chunk's body, repeated for context.
    pub overlap: String,
    /// This chunk's own slice of the original text.
    pub body: String,
}

impl Chunk {
    /// Text sent to the collaborator.
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.overlap.len() + self.body.len());
        text.push_str(&self.overlap);
        text.push_str(&self.body);
        text
    }

    pub fn char_len(&self) -> usize {
        self.overlap.chars().count() + self.body.chars().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    max_chunk_chars: usize,
    overlap_chars: usize,
}

impl Chunker {
    pub fn new(max_chunk_chars: usize, overlap_chars: usize) -> Result<Self, CorrectionError> {
        if max_chunk_chars == 0 {
            return Err(CorrectionError::InvalidConfig(
                "max_chunk_chars must be positive".to_string(),
            ));
        }
        if overlap_chars >= max_chunk_chars {
            return Err(CorrectionError::InvalidConfig(format!(
                "overlap_chars ({}) must be smaller than max_chunk_chars ({})",
                overlap_chars, max_chunk_chars
            )));
        }
        Ok(Self {
            max_chunk_chars,
            overlap_chars,
        })
    }

    pub fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    fn body_budget(&self) -> usize {
        self.max_chunk_chars - self.overlap_chars
    }

    pub fn split(&self, text: &str) -> Vec<Chunk> {
        let budget = self.body_budget();
        let mut bodies: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_chars = 0;

        for piece in paragraphs(text)
            .into_iter()
            .flat_map(|p| split_oversized(p, budget))
        {
            let piece_chars = piece.chars().count();
            if current_chars + piece_chars > budget && !current.is_empty() {
                bodies.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            current.push_str(piece);
            current_chars += piece_chars;
        }
        if !current.is_empty() {
            bodies.push(current);
        }

        let mut chunks = Vec::with_capacity(bodies.len());
        let mut previous: Option<&str> = None;
        for (index, body) in bodies.iter().enumerate() {
            let overlap = previous
                .map(|prev| char_tail(prev, self.overlap_chars).to_string())
                .unwrap_or_default();
            chunks.push(Chunk {
                index,
                overlap,
                body: body.clone(),
            });
            previous = Some(body);
        }
        chunks
    }
}

/// Paragraph pieces, each ending after its separator run.
fn paragraphs(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for m in paragraph_break().find_iter(text) {
        pieces.push(&text[start..m.end()]);
        start = m.end();
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Cut a piece into slices of at most `budget` chars.
fn split_oversized(piece: &str, budget: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = piece;
    loop {
        let limit = match rest.char_indices().nth(budget) {
            Some((byte, _)) => byte,
            None => break,
        };
        let window = &rest[..limit];
        let cut = window
            .rfind('\n')
            .map(|i| i + 1)
            .or_else(|| {
                window
                    .char_indices()
                    .rev()
                    .find(|(_, c)| c.is_whitespace())
                    .map(|(i, c)| i + c.len_utf8())
            })
            .unwrap_or(limit);
        out.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// The last `n` chars of `s`.
fn char_tail(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((byte, _)) => &s[byte..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bodies(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.body.as_str()).collect()
    }

    #[test]
    fn test_paragraph_pieces_concatenate_to_input() {
        let text = "One.\n\nTwo\nlines.\n \n\nThree";
        let pieces = paragraphs(text);
        assert_eq!(pieces, vec!["One.\n\n", "Two\nlines.\n \n\n", "Three"]);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_packs_paragraphs_without_splitting() {
        let text = "aaaa\n\nbbbb\n\ncccc\n\n";
        let chunks = Chunker::new(12, 0).unwrap().split(text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].body, "aaaa\n\nbbbb\n\n");
        assert_eq!(chunks[1].body, "cccc\n\n");
        assert_eq!(bodies(&chunks), text);
    }

    #[test]
    fn test_long_paragraph_splits_on_whitespace_then_chars() {
        let chunker = Chunker::new(10, 0).unwrap();
        let chunks = chunker.split("alpha beta gamma delta");
        assert_eq!(chunks[0].body, "alpha ");
        assert_eq!(bodies(&chunks), "alpha beta gamma delta");
        assert!(chunks.iter().all(|c| c.char_len() <= 10));

        let solid = "x".repeat(25);
        let chunks = chunker.split(&solid);
        assert_eq!(chunks.len(), 3);
        assert_eq!(bodies(&chunks), solid);
    }

    #[test]
    fn test_prefers_newline_inside_paragraph() {
        let chunks = Chunker::new(12, 0).unwrap().split("line one\nline two here");
        assert_eq!(chunks[0].body, "line one\n");
    }

    #[test]
    fn test_overlap_repeats_previous_tail_within_bound() {
        let text = "first paragraph\n\nsecond one\n\nthird";
        let chunker = Chunker::new(24, 4).unwrap();
        let chunks = chunker.split(text);
        assert!(chunks.len() > 1);
        assert!(chunks[0].overlap.is_empty());
        for pair in chunks.windows(2) {
            assert!(pair[0].body.ends_with(&pair[1].overlap));
            assert_eq!(pair[1].overlap.chars().count(), 4);
        }
        assert!(chunks.iter().all(|c| c.char_len() <= 24));
        assert_eq!(bodies(&chunks), text);
    }

    #[test]
    fn test_split_is_deterministic_and_multibyte_safe() {
        let text = "Zürich — Genève\n\n日本語のテキスト。".repeat(20);
        let chunker = Chunker::new(17, 3).unwrap();
        let a = chunker.split(&text);
        assert_eq!(a, chunker.split(&text));
        assert_eq!(bodies(&a), text);
        assert!(a.iter().all(|c| c.char_len() <= 17));
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(Chunker::new(0, 0).is_err());
        assert!(Chunker::new(10, 10).is_err());
        assert!(Chunker::new(10, 0).unwrap().split("").is_empty());
    }
}
