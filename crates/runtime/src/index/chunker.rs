//! Character-window chunking for long code payloads.

/// Split `text` into overlapping windows. Chunks beyond `max_chunks` are
/// dropped.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize, max_chunks: usize) -> Vec<String> {
    assert!(overlap < chunk_size, "overlap must be smaller than chunk size");
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        return vec![text.to_string()];
    }
    let step = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() && chunks.len() < max_chunks {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}
