use serde::{Deserialize, Serialize};

/// Half-open token range `[start, end)` within a document's tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenSpan {
    pub start: usize,
    pub end: usize,
}

impl TokenSpan {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Number of tokens shared with `next`, zero when the spans are disjoint.
    #[must_use]
    pub fn overlap_with(&self, next: &TokenSpan) -> usize {
        self.end.saturating_sub(next.start.max(self.start)).min(next.len())
    }
}

/// A token-bounded window of one document.
///
/// `chunk_index` is assigned by the chunker before the chunk enters a batch
/// queue and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of the source document in the request's input list.
    pub input_index: usize,
    /// Position of this chunk within its document.
    pub chunk_index: usize,
    /// Token range covered by this chunk.
    pub span: TokenSpan,
    /// Token ids for `span`.
    pub token_ids: Vec<u32>,
}

impl Chunk {
    /// Routing key used to reassemble results.
    #[must_use]
    pub const fn key(&self) -> (usize, usize) {
        (self.input_index, self.chunk_index)
    }

    #[must_use]
    pub fn token_count(&self) -> usize {
        self.token_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_overlap() {
        let a = TokenSpan::new(0, 10);
        let b = TokenSpan::new(8, 18);
        let c = TokenSpan::new(10, 20);
        assert_eq!(a.overlap_with(&b), 2);
        assert_eq!(a.overlap_with(&c), 0);
        assert_eq!(b.len(), 10);
        assert!(TokenSpan::new(3, 3).is_empty());
    }
}
