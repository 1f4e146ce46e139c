pub mod search;
pub mod similarity;
pub mod snapshot;
pub mod store;
pub mod tier;
pub mod types;

pub use search::{DEFAULT_SIMILARITY_THRESHOLD, SemanticSearch};
pub use similarity::cosine_similarity;
pub use snapshot::{BlobStore, FileBlobStore, InMemoryBlobStore};
pub use store::MemoryStore;
pub use tier::{Tier, TierConfig, TierPolicy};
pub use types::{
    EmbeddingKind, MemoryStatistics, SemanticSearchResult, StoredMessage, TextEmbedding,
    UserContext,
};
