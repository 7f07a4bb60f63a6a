use std::collections::BTreeMap;

/// Produces dense vectors for memory items and query text.
///
/// Implementations must be deterministic: the same text always maps to the
/// same vector, otherwise routing stops being a pure function of its inputs.
pub trait Embedder: Send + Sync {
    /// Embed a text.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Length of every vector this embedder returns.
    fn dimensions(&self) -> usize;
}

/// Default vector width for [`HashingEmbedder`]
pub const DEFAULT_EMBEDDING_DIMS: usize = 256;

/// Feature-hashing embedder.
///
/// Terms are hashed into fixed buckets with FNV-1a, weighted by term frequency
/// and a length-based IDF approximation, then L2 normalized. Needs no model and
/// works offline.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMS)
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(term: &str, dims: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % dims as u64) as usize
    }
}

/// Lowercase alphanumeric terms of at least two characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.chars().count() >= 2)
        .map(|s| s.to_lowercase())
        .collect()
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimensions];
        let terms = tokenize(text);
        if terms.is_empty() {
            return vec;
        }

        // BTreeMap keeps the accumulation order stable across runs.
        let mut tf: BTreeMap<&str, f32> = BTreeMap::new();
        for term in &terms {
            *tf.entry(term.as_str()).or_default() += 1.0;
        }

        let total = terms.len() as f32;
        for (term, count) in tf {
            let idf = 1.0 + (term.len() as f32).ln();
            vec[Self::bucket(term, self.dimensions)] += (count / total) * idf;
        }

        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Cosine similarity in `[-1, 1]`; 0.0 for empty, zero or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= f64::EPSILON || nb <= f64::EPSILON {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0)
}
