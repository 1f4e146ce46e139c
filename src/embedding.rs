use async_trait::async_trait;
use futures::future::try_join_all;

/// Trait for text embedding implementations.
///
/// Implementations must be deterministic for identical input and return a
/// non-degenerate vector of `dimension()` floats for non-empty text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Embed several texts concurrently, failing if any single call fails.
pub async fn embed_all(
    provider: &dyn EmbeddingProvider,
    texts: &[&str],
) -> anyhow::Result<Vec<Vec<f32>>> {
    try_join_all(texts.iter().map(|text| provider.embed(text))).await
}

const WORD_WEIGHT: f32 = 1.0;
const NGRAM_WEIGHT: f32 = 1.0;

/// Feature-hashing embedder that needs no model files.
///
/// Each lowercased word plus every character bigram and trigram of the
/// space-padded text is hashed (FNV-1a) into one signed bucket; the result is
/// L2-normalized. Overlapping vocabulary and spelling yield high cosine
/// similarity, which is enough for local recall and reproducible tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Synchronous core of `embed`.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let normalized = normalize(text);

        for word in normalized.split_whitespace() {
            self.add_feature(&mut vector, &format!("w:{word}"), WORD_WEIGHT);
        }

        let padded: Vec<char> = format!(" {normalized} ").chars().collect();
        for n in [2usize, 3] {
            for window in padded.windows(n) {
                let gram: String = window.iter().collect();
                self.add_feature(&mut vector, &format!("c{n}:{gram}"), NGRAM_WEIGHT);
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let index = (hash % self.dimension as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Lowercase, map every non-alphanumeric char to a space, collapse runs.
fn normalize(text: &str) -> String {
    let mapped: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
