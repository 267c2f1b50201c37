//! Document chunking.
//!
//! Splits a document's content into an ordered list of overlapping chunks.
//! All offsets are char offsets into the original content, so chunk
//! boundaries never split a UTF-8 code point and `Document::char_count` is
//! the natural upper bound.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{Chunk, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ChunkingStrategy {
    #[default]
    FixedSize,
    Sentence,
    Paragraph,
}

/// Split a document into chunks using the given strategy.
///
/// Returns an empty vector for empty content. `size` is the chunk size for
/// `FixedSize` and the target size for `Sentence`/`Paragraph`; `overlap` is
/// the number of chars shared between consecutive chunks (exact for
/// `FixedSize`, approximate for the others).
pub fn chunk_document(
    document: &Document,
    strategy: ChunkingStrategy,
    size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    let map = CharMap::new(&document.content);
    let raw = match strategy {
        ChunkingStrategy::FixedSize => chunk_fixed_size(&map, size, overlap),
        ChunkingStrategy::Sentence => chunk_sentences(&map, size, overlap),
        ChunkingStrategy::Paragraph => chunk_paragraphs(&map, size, overlap),
    };

    raw.into_iter()
        .enumerate()
        .map(|(i, r)| Chunk::new(document, i, r.content, r.start, r.end))
        .collect()
}

struct RawChunk {
    content: String,
    start: usize,
    end: usize,
}

/// Char-indexed view of a string: maps char offsets to byte offsets so
/// char-aligned slicing stays O(1).
struct CharMap<'a> {
    text: &'a str,
    chars: Vec<char>,
    byte_offsets: Vec<usize>,
}

impl<'a> CharMap<'a> {
    fn new(text: &'a str) -> Self {
        let mut byte_offsets: Vec<usize> = Vec::with_capacity(text.len() + 1);
        let mut chars: Vec<char> = Vec::with_capacity(text.len());
        for (byte, ch) in text.char_indices() {
            byte_offsets.push(byte);
            chars.push(ch);
        }
        byte_offsets.push(text.len());
        Self {
            text,
            chars,
            byte_offsets,
        }
    }

    fn char_len(&self) -> usize {
        self.chars.len()
    }

    fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.text[self.byte_offsets[start]..self.byte_offsets[end]]
    }

    /// Char index of a byte offset that lies on a char boundary.
    fn char_at_byte(&self, byte: usize) -> usize {
        self.byte_offsets.partition_point(|&b| b < byte)
    }
}

/// Char span into the original content, already trimmed of surrounding
/// whitespace.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn len(self) -> usize {
        self.end - self.start
    }
}

fn join_spans(map: &CharMap<'_>, spans: &[Span], separator: &str) -> RawChunk {
    let content = spans
        .iter()
        .map(|s| map.slice(s.start, s.end))
        .collect::<Vec<_>>()
        .join(separator);
    RawChunk {
        content,
        start: spans.first().map(|s| s.start).unwrap_or(0),
        end: spans.last().map(|s| s.end).unwrap_or(0),
    }
}

// ---------------------------------------------------------------------------
// FixedSize
// ---------------------------------------------------------------------------

/// Fixed-size spans over `0..n`. The trailing chunk is discarded when it is
/// shorter than `size / 4`, but only for overlapping chunking: with zero
/// overlap every char appears in exactly one chunk and dropping the tail
/// would lose content.
fn fixed_size_spans(n: usize, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    if n == 0 {
        return Vec::new();
    }
    let size = size.max(1);
    let step = size.saturating_sub(overlap).max(1);

    let mut spans = Vec::new();
    let mut i = 0;
    while i < n {
        spans.push((i, (i + size).min(n)));
        i += step;
    }

    if overlap > 0 && spans.len() > 1 {
        if let Some(&(start, end)) = spans.last() {
            if end - start < size / 4 {
                spans.pop();
            }
        }
    }

    spans
}

fn chunk_fixed_size(map: &CharMap<'_>, size: usize, overlap: usize) -> Vec<RawChunk> {
    fixed_size_spans(map.char_len(), size, overlap)
        .into_iter()
        .map(|(start, end)| RawChunk {
            content: map.slice(start, end).to_string(),
            start,
            end,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Sentence
// ---------------------------------------------------------------------------

/// Sentence boundaries: a `.`, `!` or `?` followed by whitespace (or end of
/// input). The `regex` crate has no lookbehind, so this is a direct scan.
fn split_sentences(map: &CharMap<'_>) -> Vec<Span> {
    let chars = &map.chars;
    let n = chars.len();
    let mut sentences = Vec::new();

    let mut start = 0;
    while start < n && chars[start].is_whitespace() {
        start += 1;
    }

    let mut i = start;
    while i < n {
        let is_terminator = matches!(chars[i], '.' | '!' | '?')
            && (i + 1 == n || chars[i + 1].is_whitespace());
        if is_terminator {
            sentences.push(Span { start, end: i + 1 });
            let mut next = i + 1;
            while next < n && chars[next].is_whitespace() {
                next += 1;
            }
            start = next;
            i = next;
        } else {
            i += 1;
        }
    }

    if start < n {
        let mut end = n;
        while end > start && chars[end - 1].is_whitespace() {
            end -= 1;
        }
        if end > start {
            sentences.push(Span { start, end });
        }
    }

    sentences
}

fn chunk_sentences(map: &CharMap<'_>, target: usize, overlap: usize) -> Vec<RawChunk> {
    let sentences = split_sentences(map);
    if sentences.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut current: Vec<Span> = Vec::new();
    let mut current_len = 0usize;

    for sentence in sentences {
        let projected = if current.is_empty() {
            sentence.len()
        } else {
            current_len + 1 + sentence.len()
        };

        if !current.is_empty() && projected > target {
            out.push(join_spans(map, &current, " "));
            let (seed, seed_len) = overlap_seed(&current, overlap, 1);
            current = seed;
            current_len = seed_len;
        }

        current_len = if current.is_empty() {
            sentence.len()
        } else {
            current_len + 1 + sentence.len()
        };
        current.push(sentence);
    }

    if !current.is_empty() {
        out.push(join_spans(map, &current, " "));
    }

    out
}

/// Suffix of `items` summing to approximately `overlap` chars, used to seed
/// the next chunk. `separator_len` is the joined separator width in chars.
fn overlap_seed(items: &[Span], overlap: usize, separator_len: usize) -> (Vec<Span>, usize) {
    if overlap == 0 {
        return (Vec::new(), 0);
    }
    let mut seed: Vec<Span> = Vec::new();
    let mut seed_len = 0usize;
    for item in items.iter().rev() {
        if seed_len >= overlap {
            break;
        }
        seed_len += item.len() + separator_len;
        seed.push(*item);
    }
    seed.reverse();
    let joined_len = seed_len.saturating_sub(separator_len);
    (seed, joined_len)
}

// ---------------------------------------------------------------------------
// Paragraph
// ---------------------------------------------------------------------------

fn paragraph_delimiter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("paragraph delimiter regex"))
}

fn trim_span(map: &CharMap<'_>, mut start: usize, mut end: usize) -> Option<Span> {
    while start < end && map.chars[start].is_whitespace() {
        start += 1;
    }
    while end > start && map.chars[end - 1].is_whitespace() {
        end -= 1;
    }
    (start < end).then_some(Span { start, end })
}

fn split_paragraphs(map: &CharMap<'_>) -> Vec<Span> {
    let mut paragraphs = Vec::new();
    let mut cursor = 0usize;
    for m in paragraph_delimiter().find_iter(map.text) {
        let start = map.char_at_byte(cursor);
        let end = map.char_at_byte(m.start());
        if let Some(span) = trim_span(map, start, end) {
            paragraphs.push(span);
        }
        // Advance by the actual delimiter span, whatever whitespace it held.
        cursor = m.end();
    }
    let start = map.char_at_byte(cursor);
    if let Some(span) = trim_span(map, start, map.char_len()) {
        paragraphs.push(span);
    }
    paragraphs
}

fn chunk_paragraphs(map: &CharMap<'_>, target: usize, overlap: usize) -> Vec<RawChunk> {
    let paragraphs = split_paragraphs(map);
    if paragraphs.is_empty() {
        return Vec::new();
    }

    let target = target.max(1);
    let mut out = Vec::new();
    let mut current: Vec<Span> = Vec::new();
    let mut current_len = 0usize;

    for paragraph in paragraphs {
        // A single paragraph far beyond the target gets flushed and split by
        // fixed-size chunking, keeping overall chunk ordering.
        if paragraph.len() > 2 * target {
            if !current.is_empty() {
                out.push(join_spans(map, &current, "\n\n"));
                current.clear();
                current_len = 0;
            }
            for (start, end) in fixed_size_spans(paragraph.len(), target, overlap) {
                let start = paragraph.start + start;
                let end = paragraph.start + end;
                out.push(RawChunk {
                    content: map.slice(start, end).to_string(),
                    start,
                    end,
                });
            }
            continue;
        }

        let projected = if current.is_empty() {
            paragraph.len()
        } else {
            current_len + 2 + paragraph.len()
        };

        if !current.is_empty() && projected > target {
            out.push(join_spans(map, &current, "\n\n"));
            let (seed, seed_len) = overlap_seed(&current, overlap, 2);
            current = seed;
            current_len = seed_len;
        }

        current_len = if current.is_empty() {
            paragraph.len()
        } else {
            current_len + 2 + paragraph.len()
        };
        current.push(paragraph);
    }

    if !current.is_empty() {
        out.push(join_spans(map, &current, "\n\n"));
    }

    out
}
