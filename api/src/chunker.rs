/// Separator classes tried in order when looking for a break point.
/// A hard cut at the window boundary is the fallback when none match.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Splits document text into overlapping chunks before embedding.
///
/// Each chunk holds at most `chunk_size` characters. Breaks prefer the
/// highest-priority separator found in the unshared part of the window
/// (paragraph, then line, then sentence, then word) and fall back to cutting
/// mid-word. Consecutive chunks share `chunk_overlap` characters so sentences
/// straddling a break stay retrievable. Nothing is trimmed: concatenating the
/// chunks minus their overlaps reproduces the input.
#[derive(Clone)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut carried = 0;
        loop {
            let window_end = advance_chars(text, start, self.chunk_size);
            let end = if window_end >= text.len() {
                text.len()
            } else {
                // Break search starts past the prefix shared with the
                // previous chunk; a separator in there already ended it.
                let fresh = advance_chars(text, start, carried);
                best_break(&text[fresh..window_end])
                    .map(|brk| fresh + brk)
                    .unwrap_or(window_end)
            };

            chunks.push(text[start..end].to_string());
            if end >= text.len() {
                break;
            }

            // Capping the carry below the chunk length keeps the next start
            // ahead of the current one, so every iteration makes progress.
            let chunk_chars = text[start..end].chars().count();
            carried = self.chunk_overlap.min(chunk_chars.saturating_sub(1));
            start = retreat_chars(text, end, carried);
        }
        chunks
    }
}

/// Byte offset of the last usable break inside the window, searching each
/// separator class in priority order. The break lands after the separator so
/// it stays attached to the preceding chunk.
fn best_break(window: &str) -> Option<usize> {
    SEPARATORS
        .iter()
        .find_map(|sep| window.rfind(sep).map(|at| at + sep.len()))
}

/// Byte offset `count` characters forward of `from`, capped at the end.
fn advance_chars(text: &str, from: usize, count: usize) -> usize {
    text[from..]
        .char_indices()
        .nth(count)
        .map(|(idx, _)| from + idx)
        .unwrap_or(text.len())
}

/// Byte offset `count` characters back from `from`, stopping at zero.
fn retreat_chars(text: &str, from: usize, count: usize) -> usize {
    let mut idx = from;
    for _ in 0..count {
        if idx == 0 {
            return 0;
        }
        idx -= 1;
        while !text.is_char_boundary(idx) {
            idx -= 1;
        }
    }
    idx
}
