//! Overlapping text chunker.
//!
//! Splits a material's text into chunks of a target character size, each
//! carrying `overlap_chars` of trailing context from its predecessor.
//! Boundaries are snapped to the nearest preceding whitespace so words are
//! never split. Chunk ids are `{item_id}-chunk-{n}` with dense indices
//! starting at 0.

use crate::models::Chunk;

/// Split `text` into overlapping chunks. Returns an empty vec for
/// whitespace-only input.
pub fn chunk_text(item_id: &str, text: &str, chunk_chars: usize, overlap_chars: usize) -> Vec<Chunk> {
    let text = text.trim();
    if text.is_empty() || chunk_chars == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let mut end = floor_char_boundary(text, (start + chunk_chars).min(text.len()));

        // Snap to the nearest preceding whitespace unless this is the tail.
        if end < text.len() {
            if let Some(pos) = text[start..end].rfind(char::is_whitespace) {
                if pos > 0 {
                    end = start + pos;
                }
            }
        }

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(make_chunk(item_id, chunks.len() as i64, piece));
        }

        if end >= text.len() {
            break;
        }

        // Back off by the overlap, then advance to the next word start so
        // the carried context begins on a whole word.
        let mut next = if end > start + overlap_chars {
            floor_char_boundary(text, end - overlap_chars)
        } else {
            end
        };
        if next < end {
            if let Some((i, ws)) = text[next..end]
                .char_indices()
                .find(|(_, c)| c.is_whitespace())
            {
                let candidate = next + i + ws.len_utf8();
                if candidate < end {
                    next = candidate;
                }
            }
        }
        if next <= start {
            next = end;
        }
        start = skip_whitespace(text, next);
    }

    chunks
}

fn make_chunk(item_id: &str, index: i64, text: &str) -> Chunk {
    Chunk {
        id: format!("{}-chunk-{}", item_id, index),
        item_id: item_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn skip_whitespace(s: &str, index: usize) -> usize {
    let mut i = floor_char_boundary(s, index);
    while let Some(c) = s[i..].chars().next() {
        if !c.is_whitespace() {
            break;
        }
        i += c.len_utf8();
    }
    i
}
