use crate::error::{Result, VectorStoreError};
use async_trait::async_trait;
use std::env;
use unicode_segmentation::UnicodeSegmentation;

/// Dimension used when neither the caller nor `SIFT_EMBEDDING_DIM` picks one.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;

const MAX_EMBEDDING_DIMENSION: usize = 4096;

/// Contract for the external embedding collaborator.
///
/// Implementations must be deterministic for identical input and always return
/// vectors of [`Embedder::dimension`] length.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn model_id(&self) -> &str;

    async fn embed_batch(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_batch(vec![text]).await?;
        embeddings
            .pop()
            .ok_or_else(|| VectorStoreError::EmbeddingError("Empty embedding result".to_string()))
    }
}

/// Reads `SIFT_EMBEDDING_DIM`, falling back to the default for blank or invalid values.
#[must_use]
pub fn embedding_dimension_from_env() -> usize {
    parse_dimension(env::var("SIFT_EMBEDDING_DIM").ok().as_deref())
}

fn parse_dimension(raw: Option<&str>) -> usize {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_EMBEDDING_DIMENSION)
        .min(MAX_EMBEDDING_DIMENSION)
}

/// Deterministic feature-hashing embedder over filename/text tokens.
///
/// Words and their character trigrams are hashed into signed buckets, so names
/// sharing vocabulary land close together. Used offline and in tests; real
/// deployments plug a model-backed [`Embedder`] in its place.
#[derive(Clone, Debug)]
pub struct HashEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            model_id: format!("hash-{}", dimension.max(1)),
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::new(embedding_dimension_from_env())
    }

    #[must_use]
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        hash_embed(text, self.dimension)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed_batch(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .into_iter()
            .map(|text| hash_embed(text, self.dimension))
            .collect())
    }
}

/// Splits filenames and free text into lowercase word tokens.
///
/// Separators (`_`, `-`, `.`) and camelCase boundaries both split words.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut spaced = String::with_capacity(text.len() + 8);
    let mut prev: Option<char> = None;
    for ch in text.chars() {
        if matches!(ch, '_' | '-' | '.' | '/' | '\\' | '+') {
            spaced.push(' ');
        } else {
            if let Some(p) = prev {
                let camel = p.is_lowercase() && ch.is_uppercase();
                let digit_edge = p.is_ascii_digit() != ch.is_ascii_digit()
                    && p.is_alphanumeric()
                    && ch.is_alphanumeric();
                if camel || digit_edge {
                    spaced.push(' ');
                }
            }
            spaced.push(ch);
        }
        prev = Some(ch);
    }
    spaced
        .unicode_words()
        .map(str::to_lowercase)
        .filter(|w| !w.is_empty())
        .collect()
}

fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dimension];
    for token in tokenize(text) {
        let weight = if token.chars().all(|c| c.is_ascii_digit()) {
            0.25
        } else {
            1.0
        };
        add_feature(&mut vec, token.as_bytes(), weight);

        let padded: Vec<char> = format!("#{token}#").chars().collect();
        if padded.len() > 4 {
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                add_feature(&mut vec, gram.as_bytes(), weight * 0.5);
            }
        }
    }
    normalize(&mut vec);
    vec
}

fn add_feature(vec: &mut [f32], bytes: &[u8], weight: f32) {
    let mut state = fnv1a_64(bytes);
    let bits = splitmix64(&mut state);
    #[allow(clippy::cast_possible_truncation)]
    let bucket = (bits % vec.len() as u64) as usize;
    let sign = if (bits >> 63) == 0 { 1.0 } else { -1.0 };
    vec[bucket] += sign * weight;
}

/// Scales `vec` to unit length in place and returns its original norm.
///
/// The zero vector is left untouched.
pub fn normalize(vec: &mut [f32]) -> f32 {
    let norm = l2_norm(vec);
    if norm == 0.0 {
        return 0.0;
    }
    for value in vec {
        *value /= norm;
    }
    norm
}

#[must_use]
pub fn normalized(mut vec: Vec<f32>) -> Vec<f32> {
    normalize(&mut vec);
    vec
}

#[must_use]
pub fn l2_norm(vec: &[f32]) -> f32 {
    vec.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// True when `vec` has unit length within `tolerance`.
#[must_use]
pub fn is_unit(vec: &[f32], tolerance: f32) -> bool {
    (l2_norm(vec) - 1.0).abs() <= tolerance
}

pub fn ensure_dimension(vec: &[f32], expected: usize) -> Result<()> {
    if vec.len() != expected {
        return Err(VectorStoreError::InvalidDimension {
            expected,
            actual: vec.len(),
        });
    }
    Ok(())
}

/// Cosine similarity with a dimension check. A zero vector scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    ensure_dimension(b, a.len())?;
    Ok(cosine_of(a, b))
}

/// Cosine similarity for slices already known to share a dimension.
#[must_use]
pub fn cosine_of(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    Ok(1.0 - cosine_similarity(a, b)?)
}

pub(crate) fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

pub(crate) const fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn tokenize_splits_separators_and_camel_case() {
        assert_eq!(
            tokenize("TaxReturn_2023-final.pdf"),
            vec!["tax", "return", "2023", "final", "pdf"]
        );
        assert_eq!(tokenize("   "), Vec::<String>::new());
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_unit_length() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("quarterly_report.xlsx").await.unwrap();
        let b = embedder.embed("quarterly_report.xlsx").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(is_unit(&a, 1e-3));
    }

    #[tokio::test]
    async fn shared_vocabulary_is_closer_than_unrelated_names() {
        let embedder = HashEmbedder::new(256);
        let base = embedder.embed("invoice_march.pdf").await.unwrap();
        let near = embedder.embed("invoice_april.pdf").await.unwrap();
        let far = embedder.embed("holiday_beach.jpg").await.unwrap();
        let near_sim = cosine_similarity(&base, &near).unwrap();
        let far_sim = cosine_similarity(&base, &far).unwrap();
        assert!(near_sim > far_sim, "near={near_sim} far={far_sim}");
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashEmbedder::new(16);
        let v = embedder.embed_sync("");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn cosine_of_zero_vector_is_zero_not_nan() {
        let zero = vec![0.0, 0.0, 0.0];
        let one = vec![1.0, 0.0, 0.0];
        let sim = cosine_similarity(&zero, &one).unwrap();
        assert_eq!(sim, 0.0);
        assert_eq!(cosine_distance(&zero, &one).unwrap(), 1.0);
    }

    #[test]
    fn cosine_rejects_dimension_mismatch() {
        let err = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            VectorStoreError::InvalidDimension {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn parse_dimension_defaults_and_clamps() {
        assert_eq!(parse_dimension(None), DEFAULT_EMBEDDING_DIMENSION);
        assert_eq!(parse_dimension(Some("  ")), DEFAULT_EMBEDDING_DIMENSION);
        assert_eq!(parse_dimension(Some("0")), DEFAULT_EMBEDDING_DIMENSION);
        assert_eq!(parse_dimension(Some("abc")), DEFAULT_EMBEDDING_DIMENSION);
        assert_eq!(parse_dimension(Some(" 512 ")), 512);
        assert_eq!(parse_dimension(Some("100000")), MAX_EMBEDDING_DIMENSION);
    }

    proptest! {
        #[test]
        fn normalize_yields_unit_or_zero(values in proptest::collection::vec(-100.0f32..100.0, 1..64)) {
            let mut v = values.clone();
            let norm = normalize(&mut v);
            if norm == 0.0 {
                prop_assert!(v.iter().all(|x| *x == 0.0));
            } else {
                prop_assert!(is_unit(&v, 1e-3));
            }
        }
    }
}
