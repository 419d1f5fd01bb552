use serde::{Deserialize, Serialize};

/// One neighbour returned by a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
}

impl SearchHit {
    /// Cosine distance, `1 - similarity`.
    #[must_use]
    pub fn distance(&self) -> f32 {
        1.0 - self.score
    }
}
