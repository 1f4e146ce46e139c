//! Local conversational memory: persisted message history with embeddings,
//! semantic recall across conversations, tier-based retention, and bounded
//! context assembly for inference.

pub mod config;
pub mod context;
pub mod conversations;
pub mod embedding;
pub mod error;
pub mod fs_util;
pub mod memory;
pub mod types;

pub use error::{MemoryError, Result};
