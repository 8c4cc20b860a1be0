/// Ordered transcript of everything a producer emitted
///
/// Append-only. Offsets are counted in characters (Unicode scalar values) of
/// the concatenated transcript.
#[derive(Debug, Default, Clone)]
pub struct ChunkBuffer {
    chunks: Vec<String>,
    char_count: usize,
}

impl ChunkBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: String) {
        self.char_count += chunk.chars().count();
        self.chunks.push(chunk);
    }

    /// Number of chunks
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub const fn char_count(&self) -> usize {
        self.char_count
    }

    #[must_use]
    pub fn concatenate(&self) -> String {
        self.chunks.concat()
    }

    /// Transcript with the first `skip` characters removed
    #[must_use]
    pub fn tail(&self, skip: usize) -> String {
        if skip >= self.char_count {
            return String::new();
        }

        let mut remaining = skip;
        let mut out = String::new();
        for chunk in &self.chunks {
            if remaining == 0 {
                out.push_str(chunk);
                continue;
            }
            let chars = chunk.chars().count();
            if remaining >= chars {
                remaining -= chars;
                continue;
            }
            let start = chunk
                .char_indices()
                .nth(remaining)
                .map_or(chunk.len(), |(index, _)| index);
            out.push_str(&chunk[start..]);
            remaining = 0;
        }
        out
    }
}
