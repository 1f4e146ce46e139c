use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use super::snapshot::{self, BlobStore, Decoded, SNAPSHOT_KEY, SNAPSHOT_VERSION, SnapshotRef};
use super::tier::{Tier, TierConfig};
use super::types::{EmbeddingKind, MemoryStatistics, StoredMessage, TextEmbedding, UserContext};
use crate::embedding::{EmbeddingProvider, embed_all};
use crate::error::{MemoryError, Result};
use crate::types::{Conversation, Message};

/// In-memory collections guarded by the store's lock.
pub(crate) struct MemoryState {
    pub(crate) messages: Vec<StoredMessage>,
    pub(crate) embeddings: HashMap<String, TextEmbedding>,
    pub(crate) tier: TierConfig,
    pub(crate) user_context: Option<UserContext>,
    pub(crate) last_updated: DateTime<Utc>,
}

impl MemoryState {
    fn empty(tier: Tier) -> Self {
        Self {
            messages: Vec::new(),
            embeddings: HashMap::new(),
            tier: TierConfig::new(tier),
            user_context: None,
            last_updated: Utc::now(),
        }
    }

    fn contains_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|stored| stored.id == message_id)
    }

    fn insert_message(&mut self, message: &Message, conversation_id: &str, vector: Vec<f32>) {
        let embedding = TextEmbedding::new(
            message.content.clone(),
            vector,
            EmbeddingKind::Message {
                message_id: message.id.clone(),
                conversation_id: conversation_id.to_string(),
                role: message.role,
                timestamp: message.timestamp,
            },
        );
        self.messages.push(StoredMessage {
            id: message.id.clone(),
            message: message.clone(),
            conversation_id: conversation_id.to_string(),
            embedding_id: embedding.id.clone(),
        });
        self.embeddings.insert(embedding.id.clone(), embedding);
    }

    /// Remove every stored message matching `predicate` together with its
    /// embedding. Returns how many messages were removed.
    fn remove_messages_where(&mut self, predicate: impl Fn(&StoredMessage) -> bool) -> usize {
        let mut removed = 0;
        let embeddings = &mut self.embeddings;
        self.messages.retain(|stored| {
            if predicate(stored) {
                embeddings.remove(&stored.embedding_id);
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Evict the oldest messages until the tier's capacity holds.
    fn enforce_capacity(&mut self) -> usize {
        let max = self.tier.tier.max_history_messages();
        if self.messages.len() <= max {
            return 0;
        }

        let excess = self.messages.len() - max;
        self.messages.sort_by_key(|stored| stored.message.timestamp);
        for stored in self.messages.drain(..excess) {
            self.embeddings.remove(&stored.embedding_id);
        }
        info!(evicted = excess, tier = %self.tier.tier, max, "evicted messages over capacity");
        excess
    }

    /// Retention pass followed by capacity enforcement. Returns the total
    /// number of messages removed.
    fn cleanup(&mut self, older_than_days: Option<u32>) -> usize {
        let now = Utc::now();
        let cutoff = self.tier.retention_cutoff(now, older_than_days);
        let expired = self.remove_messages_where(|stored| stored.message.timestamp < cutoff);
        let evicted = self.enforce_capacity();
        self.tier.last_cleanup_at = Some(now);
        self.last_updated = now;
        info!(%cutoff, expired, evicted, "retention cleanup finished");
        expired + evicted
    }

    fn user_fact_count(&self) -> usize {
        self.embeddings
            .values()
            .filter(|e| e.kind.is_user_fact())
            .count()
    }
}

/// Long-term conversational memory: stored messages, their embeddings,
/// the user profile and tier state.
///
/// Mutations run one at a time in arrival order, each holding the write
/// lock until its snapshot write finishes; readers never observe a
/// half-applied mutation.
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    embedder: Arc<dyn EmbeddingProvider>,
    blobs: Arc<dyn BlobStore>,
    default_tier: Tier,
}

impl MemoryStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, blobs: Arc<dyn BlobStore>) -> Self {
        Self::with_default_tier(embedder, blobs, Tier::default())
    }

    /// Tier applied when no tier config has been persisted yet.
    pub fn with_default_tier(
        embedder: Arc<dyn EmbeddingProvider>,
        blobs: Arc<dyn BlobStore>,
        default_tier: Tier,
    ) -> Self {
        Self {
            state: RwLock::new(MemoryState::empty(default_tier)),
            embedder,
            blobs,
            default_tier,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub(crate) async fn read_state(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().await
    }

    /// Load persisted state. A missing snapshot means an empty store on the
    /// default tier; a snapshot of another format version is copied to
    /// [`snapshot::preserved_key`] and the store starts empty. Runs retention
    /// cleanup if it is due and always leaves the store within tier capacity.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let mut loaded = MemoryState::empty(self.default_tier);

        if let Some(bytes) = self.blobs.read(SNAPSHOT_KEY).await? {
            match snapshot::decode(&bytes)? {
                Decoded::Current(mut snapshot) => {
                    let report = snapshot.reconcile();
                    if report.orphaned_embeddings > 0 || report.messages_without_embedding > 0 {
                        warn!(
                            orphaned_embeddings = report.orphaned_embeddings,
                            messages_without_embedding = report.messages_without_embedding,
                            "dropped inconsistent records from snapshot"
                        );
                    }
                    loaded.messages = snapshot.messages;
                    loaded.embeddings = snapshot.embeddings;
                    loaded.user_context = snapshot.user_context;
                    loaded.last_updated = snapshot.saved_at;
                    if let Some(tier) = snapshot.tier {
                        loaded.tier = tier;
                    }
                }
                Decoded::Unsupported { version } => {
                    let key = snapshot::preserved_key(version);
                    self.blobs.write(&key, &bytes).await?;
                    warn!(
                        version,
                        preserved_as = %key,
                        "unsupported snapshot kept aside, starting empty"
                    );
                }
            }
        }

        info!(
            messages = loaded.messages.len(),
            embeddings = loaded.embeddings.len(),
            tier = %loaded.tier.tier,
            "memory store initialized"
        );
        *state = loaded;

        let needs_write = if state.tier.is_cleanup_due(Utc::now()) {
            state.cleanup(None);
            true
        } else if state.enforce_capacity() > 0 {
            state.last_updated = Utc::now();
            true
        } else {
            false
        };
        if needs_write {
            self.persist(&state).await?;
        }
        Ok(())
    }

    /// Embed and store one message, then enforce tier capacity and persist.
    /// A message whose id is already stored is not stored again.
    pub async fn store_message(&self, message: &Message, conversation_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.contains_message(&message.id) {
            debug!(message_id = %message.id, "message already stored");
            if state.enforce_capacity() > 0 {
                state.last_updated = Utc::now();
                return self.persist(&state).await;
            }
            return Ok(());
        }

        let vector = self.embed(&message.content).await?;
        state.insert_message(message, conversation_id, vector);
        state.enforce_capacity();
        state.last_updated = Utc::now();
        self.persist(&state).await
    }

    /// Store every message of `conversation` that is not stored yet.
    /// Idempotent. All new messages are embedded before any is inserted, so
    /// a provider failure leaves the store unchanged. Returns how many
    /// messages were added.
    pub async fn store_conversation(&self, conversation: &Conversation) -> Result<usize> {
        let mut state = self.state.write().await;

        let mut seen = HashSet::new();
        let pending: Vec<&Message> = conversation
            .messages
            .iter()
            .filter(|m| !state.contains_message(&m.id) && seen.insert(m.id.as_str()))
            .collect();
        if pending.is_empty() {
            if state.enforce_capacity() > 0 {
                state.last_updated = Utc::now();
                self.persist(&state).await?;
            }
            return Ok(0);
        }

        let texts: Vec<&str> = pending.iter().map(|m| m.content.as_str()).collect();
        let vectors = embed_all(self.embedder.as_ref(), &texts)
            .await
            .map_err(|e| MemoryError::EmbeddingGenerationFailed(e.to_string()))?;
        for vector in &vectors {
            self.check_dimension(vector)?;
        }

        for (message, vector) in pending.iter().zip(vectors) {
            state.insert_message(message, &conversation.id, vector);
        }
        state.enforce_capacity();
        state.last_updated = Utc::now();
        debug!(conversation_id = %conversation.id, added = pending.len(), "stored conversation");
        self.persist(&state).await?;
        Ok(pending.len())
    }

    /// Messages of one conversation, oldest first.
    pub async fn conversation_history(&self, conversation_id: &str) -> Vec<Message> {
        let state = self.state.read().await;
        let mut history: Vec<Message> = state
            .messages
            .iter()
            .filter(|stored| stored.conversation_id == conversation_id)
            .map(|stored| stored.message.clone())
            .collect();
        history.sort_by_key(|m| m.timestamp);
        history
    }

    /// Every stored message across all conversations, oldest first.
    pub async fn all_history(&self) -> Vec<Message> {
        let state = self.state.read().await;
        let mut history: Vec<Message> = state.messages.iter().map(|s| s.message.clone()).collect();
        history.sort_by_key(|m| m.timestamp);
        history
    }

    /// The `limit` newest messages across all conversations, newest first.
    pub async fn recent_history(&self, limit: usize) -> Vec<Message> {
        let state = self.state.read().await;
        let mut history: Vec<Message> = state.messages.iter().map(|s| s.message.clone()).collect();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        history.truncate(limit);
        history
    }

    pub async fn all_conversation_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        let ids: BTreeSet<&str> = state
            .messages
            .iter()
            .map(|stored| stored.conversation_id.as_str())
            .collect();
        ids.into_iter().map(String::from).collect()
    }

    /// Resolve embedding ids to their messages, preserving input order.
    /// Ids that do not belong to a stored message are skipped.
    pub async fn messages_for_embeddings(&self, embedding_ids: &[String]) -> Vec<Message> {
        let state = self.state.read().await;
        let by_embedding: HashMap<&str, &Message> = state
            .messages
            .iter()
            .map(|stored| (stored.embedding_id.as_str(), &stored.message))
            .collect();
        embedding_ids
            .iter()
            .filter_map(|id| by_embedding.get(id.as_str()).map(|m| (*m).clone()))
            .collect()
    }

    pub async fn statistics(&self) -> MemoryStatistics {
        let state = self.state.read().await;
        let message_bytes: usize = state.messages.iter().map(|s| s.message.content.len()).sum();
        let embedding_bytes: usize = state
            .embeddings
            .values()
            .map(|e| e.text.len() + e.vector.len() * std::mem::size_of::<f32>())
            .sum();
        let fact_bytes: usize = state
            .user_context
            .as_ref()
            .map(|ctx| ctx.facts.iter().map(String::len).sum())
            .unwrap_or(0);

        MemoryStatistics {
            total_messages: state.messages.len(),
            total_embeddings: state.embeddings.len(),
            user_fact_count: state.user_fact_count(),
            approximate_size_bytes: message_bytes + embedding_bytes + fact_bytes,
            last_updated: state.last_updated,
        }
    }

    /// Remove messages older than `older_than_days` (or the tier's retention
    /// period) with their embeddings, then evict down to tier capacity.
    /// User facts are never removed. Returns how many messages were removed.
    pub async fn cleanup(&self, older_than_days: Option<u32>) -> Result<usize> {
        let mut state = self.state.write().await;
        let removed = state.cleanup(older_than_days);
        self.persist(&state).await?;
        Ok(removed)
    }

    /// Whether the tier's cleanup interval has elapsed.
    pub async fn is_cleanup_due(&self) -> bool {
        self.state.read().await.tier.is_cleanup_due(Utc::now())
    }

    /// Empty messages, embeddings and the user profile. The tier is kept.
    pub async fn clear_all(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.messages.clear();
        state.embeddings.clear();
        state.user_context = None;
        state.last_updated = Utc::now();
        info!("cleared all memory");
        self.persist(&state).await
    }

    pub async fn current_tier(&self) -> Tier {
        self.state.read().await.tier.tier
    }

    pub async fn tier_config(&self) -> TierConfig {
        self.state.read().await.tier.clone()
    }

    /// Switch tier. Never evicts: a lower capacity takes effect at the next
    /// store or cleanup.
    pub async fn update_tier(&self, tier: Tier) -> Result<()> {
        let mut state = self.state.write().await;
        let previous = state.tier.tier;
        state.tier.tier = tier;
        state.tier.tier_started_at = Utc::now();
        state.last_updated = Utc::now();
        info!(from = %previous, to = %tier, "tier updated");
        self.persist(&state).await
    }

    /// Replace the user profile and re-embed its facts.
    pub async fn store_user_context(&self, context: UserContext) -> Result<()> {
        let mut state = self.state.write().await;

        let texts: Vec<&str> = context.facts.iter().map(String::as_str).collect();
        let vectors = embed_all(self.embedder.as_ref(), &texts)
            .await
            .map_err(|e| MemoryError::EmbeddingGenerationFailed(e.to_string()))?;
        for vector in &vectors {
            self.check_dimension(vector)?;
        }

        state.embeddings.retain(|_, e| !e.kind.is_user_fact());
        for (fact, vector) in context.facts.iter().zip(vectors) {
            let embedding = TextEmbedding::new(
                fact.clone(),
                vector,
                EmbeddingKind::UserFact {
                    user_name: context.name.clone(),
                },
            );
            state.embeddings.insert(embedding.id.clone(), embedding);
        }
        info!(user = %context.name, facts = context.facts.len(), "stored user context");
        state.user_context = Some(context);
        state.enforce_capacity();
        state.last_updated = Utc::now();
        self.persist(&state).await
    }

    /// Append a fact to the resident user profile.
    pub async fn add_user_fact(&self, fact: impl Into<String>) -> Result<()> {
        let fact = fact.into();
        let mut state = self.state.write().await;
        let user_name = match &state.user_context {
            Some(ctx) => ctx.name.clone(),
            None => return Err(MemoryError::UserContextNotInitialized),
        };

        let vector = self.embed(&fact).await?;
        let embedding = TextEmbedding::new(fact.clone(), vector, EmbeddingKind::UserFact { user_name });
        state.embeddings.insert(embedding.id.clone(), embedding);
        if let Some(ctx) = state.user_context.as_mut() {
            ctx.facts.push(fact);
        }
        state.enforce_capacity();
        state.last_updated = Utc::now();
        self.persist(&state).await
    }

    pub async fn user_context(&self) -> Option<UserContext> {
        self.state.read().await.user_context.clone()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self
            .embedder
            .embed(text)
            .await
            .map_err(|e| MemoryError::EmbeddingGenerationFailed(e.to_string()))?;
        self.check_dimension(&vector)?;
        Ok(vector)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        let expected = self.embedder.dimension();
        if vector.len() != expected {
            return Err(MemoryError::EmbeddingGenerationFailed(format!(
                "expected {expected} dimensions, got {}",
                vector.len()
            )));
        }
        Ok(())
    }

    /// Write the full snapshot. A failure is returned to the caller; the
    /// in-memory mutation that preceded it stays applied.
    async fn persist(&self, state: &MemoryState) -> Result<()> {
        let bytes = snapshot::encode(&SnapshotRef {
            version: SNAPSHOT_VERSION,
            saved_at: state.last_updated,
            messages: &state.messages,
            embeddings: &state.embeddings,
            tier: &state.tier,
            user_context: state.user_context.as_ref(),
        })?;

        match self.blobs.write(SNAPSHOT_KEY, &bytes).await {
            Ok(()) => {
                debug!(bytes = bytes.len(), "persisted memory snapshot");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to persist memory snapshot");
                Err(e)
            }
        }
    }
}
