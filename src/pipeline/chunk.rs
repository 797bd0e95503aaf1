//! Fixed-size character windows over a large text.
//!
//! Windows are counted in `char`s, not bytes, so a window never ends in the
//! middle of a UTF-8 sequence. There is no sentence or paragraph awareness:
//! a window may cut a word in half.

/// Split `text` into contiguous, non-overlapping windows of at most
/// `chunk_size` characters, in original order.
///
/// Returns `ceil(chars / chunk_size)` windows; concatenating them gives back
/// `text` exactly. Empty input yields no windows. A `chunk_size` of zero is
/// treated as one.
pub fn split_chunks(text: &str, chunk_size: usize) -> Vec<&str> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in text.char_indices() {
        if count == chunk_size {
            chunks.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}

/// `true` when a window has nothing worth sending to the model.
pub fn is_blank(chunk: &str) -> bool {
    chunk.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceil_div(n: usize, c: usize) -> usize {
        n.div_ceil(c)
    }

    #[test]
    fn window_count_and_reconstruction() {
        let text: String = ('a'..='z').cycle().take(1000).collect();
        for size in [1, 3, 7, 100, 999, 1000, 1001, 5000] {
            let chunks = split_chunks(&text, size);
            assert_eq!(chunks.len(), ceil_div(1000, size), "size {size}");
            assert_eq!(chunks.concat(), text, "size {size}");
            assert!(chunks.iter().all(|c| c.chars().count() <= size));
        }
    }

    #[test]
    fn empty_text_has_no_windows() {
        assert!(split_chunks("", 10).is_empty());
    }

    #[test]
    fn multibyte_chars_are_never_split() {
        let text = "äöü€😀".repeat(7);
        let chunks = split_chunks(&text, 4);
        assert_eq!(chunks.len(), ceil_div(35, 4));
        assert_eq!(chunks.concat(), text);
        assert_eq!(chunks[0].chars().count(), 4);
    }

    #[test]
    fn zero_chunk_size_behaves_like_one() {
        assert_eq!(split_chunks("abc", 0), vec!["a", "b", "c"]);
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank("  \n\t "));
        assert!(!is_blank(" x "));
    }
}
