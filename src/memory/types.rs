//! Persistent and ephemeral records owned by the memory store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Message, Role};

/// A message persisted in long-term memory, linked to exactly one
/// message-kind embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub message: Message,
    pub conversation_id: String,
    pub embedding_id: String,
}

/// What an embedding was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbeddingKind {
    Message {
        message_id: String,
        conversation_id: String,
        role: Role,
        timestamp: DateTime<Utc>,
    },
    /// Profile fact. Never subject to message retention or capacity eviction.
    UserFact { user_name: String },
}

impl EmbeddingKind {
    pub fn is_message(&self) -> bool {
        matches!(self, EmbeddingKind::Message { .. })
    }

    pub fn is_user_fact(&self) -> bool {
        matches!(self, EmbeddingKind::UserFact { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEmbedding {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub kind: EmbeddingKind,
}

impl TextEmbedding {
    pub fn new(text: impl Into<String>, vector: Vec<f32>, kind: EmbeddingKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            vector,
            created_at: Utc::now(),
            kind,
        }
    }
}

/// Profile of the single local user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default)]
    pub facts: Vec<String>,
}

impl UserContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_fact(mut self, fact: impl Into<String>) -> Self {
        self.facts.push(fact.into());
        self
    }
}

/// One ranked hit from a semantic search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticSearchResult {
    pub embedding_id: String,
    pub text: String,
    pub similarity: f32,
    pub kind: EmbeddingKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStatistics {
    pub total_messages: usize,
    pub total_embeddings: usize,
    pub user_fact_count: usize,
    pub approximate_size_bytes: usize,
    pub last_updated: DateTime<Utc>,
}
