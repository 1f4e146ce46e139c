use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use memoria::MemoryError;
use memoria::embedding::{EmbeddingProvider, HashEmbedder};
use memoria::memory::snapshot::SNAPSHOT_KEY;
use memoria::memory::{
    BlobStore, FileBlobStore, InMemoryBlobStore, MemoryStore, SemanticSearch, Tier, UserContext,
};
use memoria::types::{Conversation, Message, Role};

struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("model offline")
    }

    fn dimension(&self) -> usize {
        384
    }
}

/// Embeds fine until the given text shows up.
struct FailsOn(&'static str);

#[async_trait]
impl EmbeddingProvider for FailsOn {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if text == self.0 {
            anyhow::bail!("cannot embed {text}");
        }
        HashEmbedder::default().embed(text).await
    }

    fn dimension(&self) -> usize {
        384
    }
}

async fn open_store(blobs: Arc<InMemoryBlobStore>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(Arc::new(HashEmbedder::default()), blobs));
    store.initialize().await.expect("initialize");
    store
}

async fn new_store() -> (Arc<MemoryStore>, Arc<InMemoryBlobStore>) {
    let blobs = Arc::new(InMemoryBlobStore::new());
    (open_store(blobs.clone()).await, blobs)
}

fn base_time() -> DateTime<Utc> {
    Utc::now() - Duration::hours(1)
}

fn msg(role: Role, text: &str, at: DateTime<Utc>) -> Message {
    Message::new(role, text).at(at)
}

fn tmp_dir() -> std::path::PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("memoria-memory-test-{nanos}"))
}

// =============================================================
// Storage and capacity
// =============================================================

#[tokio::test]
async fn capacity_evicts_oldest_messages_on_free_tier() {
    let (store, _) = new_store().await;
    assert_eq!(store.current_tier().await, Tier::Free);
    let base = base_time();

    for i in 0..55 {
        let message = msg(Role::User, &format!("msg-{i}"), base + Duration::seconds(i));
        store
            .store_message(&message, &format!("conv-{}", i % 3))
            .await
            .expect("store");

        let stats = store.statistics().await;
        assert_eq!(stats.total_messages, stats.total_embeddings);
        assert!(stats.total_messages <= Tier::Free.max_history_messages());
    }

    let contents: Vec<String> = store
        .all_history()
        .await
        .into_iter()
        .map(|m| m.content)
        .collect();
    let expected: Vec<String> = (5..55).map(|i| format!("msg-{i}")).collect();
    assert_eq!(contents, expected);

    let stats = store.statistics().await;
    assert_eq!(stats.total_messages, 50);
    assert_eq!(stats.total_embeddings, 50);
    assert_eq!(stats.user_fact_count, 0);
}

#[tokio::test]
async fn conversation_history_is_chronological() {
    let (store, _) = new_store().await;
    let base = base_time();

    let late = msg(Role::Assistant, "late", base + Duration::seconds(30));
    let early = msg(Role::User, "early", base);
    let middle = msg(Role::User, "middle", base + Duration::seconds(10));
    let other = msg(Role::User, "elsewhere", base + Duration::seconds(5));

    store.store_message(&late, "a").await.unwrap();
    store.store_message(&early, "a").await.unwrap();
    store.store_message(&other, "b").await.unwrap();
    store.store_message(&middle, "a").await.unwrap();

    let history = store.conversation_history("a").await;
    let texts: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(texts, vec!["early", "middle", "late"]);
    assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(store.conversation_history("missing").await.is_empty());
}

#[tokio::test]
async fn recent_history_is_newest_first_and_limited() {
    let (store, _) = new_store().await;
    let base = base_time();
    for i in 0..6 {
        let message = msg(Role::User, &format!("m{i}"), base + Duration::seconds(i));
        store.store_message(&message, "c").await.unwrap();
    }

    let recent = store.recent_history(3).await;
    let texts: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(texts, vec!["m5", "m4", "m3"]);
    assert!(recent.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
}

#[tokio::test]
async fn conversation_ids_are_unique_and_sorted() {
    let (store, _) = new_store().await;
    let base = base_time();
    for (i, id) in ["zeta", "alpha", "zeta", "mid"].iter().enumerate() {
        let message = msg(Role::User, "hi", base + Duration::seconds(i as i64));
        store.store_message(&message, id).await.unwrap();
    }
    assert_eq!(store.all_conversation_ids().await, vec!["alpha", "mid", "zeta"]);
}

#[tokio::test]
async fn store_conversation_is_idempotent() {
    let (store, _) = new_store().await;
    let base = base_time();
    let mut conversation = Conversation::new("chat-1");
    conversation.push(msg(Role::User, "How do I bake bread?", base));
    conversation.push(msg(
        Role::Assistant,
        "Start with flour, water, salt and yeast.",
        base + Duration::seconds(1),
    ));

    assert_eq!(store.store_conversation(&conversation).await.unwrap(), 2);
    let first = store.conversation_history("chat-1").await;

    assert_eq!(store.store_conversation(&conversation).await.unwrap(), 0);
    let second = store.conversation_history("chat-1").await;
    assert_eq!(first, second);
    assert_eq!(store.statistics().await.total_embeddings, 2);

    // Storing a single already-stored message is a no-op as well.
    store
        .store_message(&conversation.messages[0], "chat-1")
        .await
        .unwrap();
    assert_eq!(store.statistics().await.total_messages, 2);
}

#[tokio::test]
async fn embedding_failure_leaves_store_unchanged() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let store = MemoryStore::new(Arc::new(FailingEmbedder), blobs.clone());

    let err = store
        .store_message(&Message::user("hello"), "c")
        .await
        .expect_err("provider failure must surface");
    assert!(matches!(err, MemoryError::EmbeddingGenerationFailed(_)));
    assert_eq!(store.statistics().await.total_messages, 0);
    assert!(!blobs.contains(SNAPSHOT_KEY));
}

#[tokio::test]
async fn failed_batch_embedding_stores_nothing() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let store = MemoryStore::new(Arc::new(FailsOn("poison")), blobs);
    let mut conversation = Conversation::new("c");
    conversation.push(Message::user("fine"));
    conversation.push(Message::assistant("poison"));

    let err = store.store_conversation(&conversation).await.unwrap_err();
    assert!(matches!(err, MemoryError::EmbeddingGenerationFailed(_)));
    assert!(store.conversation_history("c").await.is_empty());
}

#[tokio::test]
async fn concurrent_stores_keep_messages_and_embeddings_paired() {
    let (store, _) = new_store().await;
    let base = base_time();

    let mut handles = Vec::new();
    for i in 0..30 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let message = msg(Role::User, &format!("parallel {i}"), base + Duration::seconds(i));
            store.store_message(&message, "shared").await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("store");
    }

    let stats = store.statistics().await;
    assert_eq!(stats.total_messages, 30);
    assert_eq!(stats.total_embeddings, 30);
}

// =============================================================
// Tiers and cleanup
// =============================================================

/// Store 60 messages on the pro tier, then drop to free without evicting.
async fn over_capacity_after_downgrade(store: &MemoryStore) -> Vec<Message> {
    store.update_tier(Tier::Pro).await.unwrap();
    let base = base_time();
    let mut messages = Vec::new();
    for i in 0..60 {
        let message = msg(Role::User, &format!("m{i}"), base + Duration::seconds(i));
        store.store_message(&message, "c").await.unwrap();
        messages.push(message);
    }
    store.update_tier(Tier::Free).await.unwrap();
    assert_eq!(store.current_tier().await, Tier::Free);
    assert_eq!(store.statistics().await.total_messages, 60);
    messages
}

async fn assert_newest_fifty(store: &MemoryStore) {
    let history = store.conversation_history("c").await;
    assert_eq!(history.len(), 50);
    assert_eq!(history[0].content, "m10");
    assert_eq!(history[49].content, "m59");
    let stats = store.statistics().await;
    assert_eq!(stats.total_messages, stats.total_embeddings - stats.user_fact_count);
}

#[tokio::test]
async fn downgrade_is_enforced_at_next_store() {
    let (store, _) = new_store().await;
    over_capacity_after_downgrade(&store).await;

    let message = msg(Role::User, "m60", base_time() + Duration::seconds(60));
    store.store_message(&message, "c").await.unwrap();
    let history = store.conversation_history("c").await;
    assert_eq!(history.len(), 50);
    assert_eq!(history[0].content, "m11");
    assert_eq!(history[49].content, "m60");
}

#[tokio::test]
async fn downgrade_is_enforced_when_restoring_a_stored_message() {
    let (store, _) = new_store().await;
    let messages = over_capacity_after_downgrade(&store).await;

    store.store_message(&messages[59], "c").await.unwrap();
    assert_newest_fifty(&store).await;

    let mut conversation = Conversation::new("c");
    conversation.push(messages[59].clone());
    assert_eq!(store.store_conversation(&conversation).await.unwrap(), 0);
    assert_newest_fifty(&store).await;
}

#[tokio::test]
async fn downgrade_is_enforced_by_cleanup() {
    let (store, _) = new_store().await;
    over_capacity_after_downgrade(&store).await;

    // Nothing is past retention; all ten come from capacity.
    assert_eq!(store.cleanup(None).await.unwrap(), 10);
    assert_newest_fifty(&store).await;
}

#[tokio::test]
async fn downgrade_is_enforced_by_profile_changes() {
    let (store, _) = new_store().await;
    store
        .store_user_context(UserContext::new("Ada"))
        .await
        .unwrap();
    over_capacity_after_downgrade(&store).await;

    store.add_user_fact("likes jazz").await.unwrap();
    assert_newest_fifty(&store).await;
    assert_eq!(store.statistics().await.user_fact_count, 1);
}

#[tokio::test]
async fn downgrade_is_enforced_by_replacing_the_profile() {
    let (store, _) = new_store().await;
    over_capacity_after_downgrade(&store).await;

    store
        .store_user_context(UserContext::new("Ada").with_fact("likes jazz"))
        .await
        .unwrap();
    assert_newest_fifty(&store).await;
}

#[tokio::test]
async fn reopening_an_over_capacity_snapshot_evicts() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let store = open_store(blobs.clone()).await;
    over_capacity_after_downgrade(&store).await;
    drop(store);

    let reopened = open_store(blobs.clone()).await;
    assert!(!reopened.is_cleanup_due().await);
    assert_newest_fifty(&reopened).await;
    drop(reopened);

    // The eviction was persisted.
    let again = open_store(blobs).await;
    assert_eq!(again.statistics().await.total_messages, 50);
}

#[tokio::test]
async fn cleanup_removes_expired_messages_but_keeps_user_facts() {
    let (store, _) = new_store().await;
    let now = Utc::now();
    store
        .store_message(&msg(Role::User, "ancient", now - Duration::days(10)), "c")
        .await
        .unwrap();
    store
        .store_message(&msg(Role::User, "fresh", now - Duration::minutes(5)), "c")
        .await
        .unwrap();
    store
        .store_user_context(UserContext::new("Ada").with_fact("Prefers tea over coffee"))
        .await
        .unwrap();

    let removed = store.cleanup(None).await.unwrap();
    assert_eq!(removed, 1);

    let history = store.conversation_history("c").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "fresh");

    let stats = store.statistics().await;
    assert_eq!(stats.user_fact_count, 1);
    assert_eq!(stats.total_embeddings, 2);
    assert!(store.tier_config().await.last_cleanup_at.is_some());
    assert!(!store.is_cleanup_due().await);
}

#[tokio::test]
async fn cleanup_with_explicit_days() {
    let (store, _) = new_store().await;
    let now = Utc::now();
    store
        .store_message(&msg(Role::User, "two days old", now - Duration::days(2)), "c")
        .await
        .unwrap();
    store
        .store_message(&msg(Role::User, "new", now), "c")
        .await
        .unwrap();

    assert_eq!(store.cleanup(Some(1)).await.unwrap(), 1);
    assert_eq!(store.conversation_history("c").await.len(), 1);
}

#[tokio::test]
async fn initialize_runs_due_cleanup() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    {
        let store = MemoryStore::new(Arc::new(HashEmbedder::default()), blobs.clone());
        let old = msg(Role::User, "stale", Utc::now() - Duration::days(30));
        store.store_message(&old, "c").await.unwrap();
        // Never initialized, so no cleanup has run yet.
        assert!(store.is_cleanup_due().await);
    }

    let store = open_store(blobs).await;
    assert!(store.conversation_history("c").await.is_empty());
    assert!(!store.is_cleanup_due().await);
}

// =============================================================
// User profile
// =============================================================

#[tokio::test]
async fn add_fact_requires_user_context() {
    let (store, _) = new_store().await;
    let err = store.add_user_fact("likes jazz").await.unwrap_err();
    assert!(matches!(err, MemoryError::UserContextNotInitialized));

    store
        .store_user_context(UserContext::new("Ada").with_role("Engineer"))
        .await
        .unwrap();
    store.add_user_fact("likes jazz").await.unwrap();

    let profile = store.user_context().await.expect("profile");
    assert_eq!(profile.facts, vec!["likes jazz"]);
    assert_eq!(store.statistics().await.user_fact_count, 1);
}

#[tokio::test]
async fn replacing_user_context_replaces_fact_embeddings() {
    let (store, _) = new_store().await;
    store
        .store_user_context(UserContext::new("Ada").with_fact("a").with_fact("b"))
        .await
        .unwrap();
    assert_eq!(store.statistics().await.user_fact_count, 2);

    store
        .store_user_context(UserContext::new("Ada").with_fact("c"))
        .await
        .unwrap();
    assert_eq!(store.statistics().await.user_fact_count, 1);
}

// =============================================================
// Semantic search
// =============================================================

#[tokio::test]
async fn semantic_search_ranks_related_text_first() {
    let (store, _) = new_store().await;
    let base = base_time();
    store
        .store_message(&msg(Role::User, "The cat sat on the mat", base), "pets")
        .await
        .unwrap();
    store
        .store_message(
            &msg(Role::User, "Quarterly revenue increased", base + Duration::seconds(1)),
            "finance",
        )
        .await
        .unwrap();

    let search = SemanticSearch::new(store.clone());
    let results = search
        .search("Where did the cat sit?", 10, Some(0.5))
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].text, "The cat sat on the mat");
    if let Some(pos) = results
        .iter()
        .position(|r| r.text == "Quarterly revenue increased")
    {
        assert!(pos > 0);
        assert!(results[pos].similarity < results[0].similarity);
    }
    assert!(results.iter().all(|r| r.similarity >= 0.5));

    let strict = search
        .search("Where did the cat sit?", 10, Some(0.99))
        .await
        .unwrap();
    assert!(strict.is_empty());
}

#[tokio::test]
async fn semantic_search_on_empty_index_is_empty() {
    let (store, _) = new_store().await;
    let search = SemanticSearch::new(store);
    assert!(search.search("anything", 5, None).await.unwrap().is_empty());
    assert_eq!(search.default_threshold(), 0.7);
}

#[tokio::test]
async fn semantic_search_respects_limit_and_breaks_ties_newest_first() {
    let (store, _) = new_store().await;
    let base = base_time();
    for i in 0..4 {
        let message = msg(Role::User, "identical text", base + Duration::seconds(i));
        store.store_message(&message, &format!("c{i}")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let search = SemanticSearch::new(store.clone());
    let results = search.search("identical text", 3, None).await.unwrap();
    assert_eq!(results.len(), 3);
    let conversations: Vec<String> = results
        .iter()
        .map(|r| match &r.kind {
            memoria::memory::EmbeddingKind::Message {
                conversation_id, ..
            } => conversation_id.clone(),
            other => panic!("unexpected kind {other:?}"),
        })
        .collect();
    assert_eq!(conversations, vec!["c3", "c2", "c1"]);
}

#[tokio::test]
async fn search_embedding_failure_propagates() {
    let store = Arc::new(MemoryStore::new(
        Arc::new(FailingEmbedder),
        Arc::new(InMemoryBlobStore::new()),
    ));
    let err = SemanticSearch::new(store)
        .search("q", 5, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::EmbeddingGenerationFailed(_)));
}

#[tokio::test]
async fn relevant_context_skips_user_facts() {
    let (store, _) = new_store().await;
    let text = "I love hiking in the mountains";
    store
        .store_message(&msg(Role::User, text, base_time()), "outdoors")
        .await
        .unwrap();
    store
        .store_user_context(UserContext::new("Ada").with_fact(text))
        .await
        .unwrap();

    let search = SemanticSearch::new(store.clone());
    let hits = search.search(text, 5, Some(0.99)).await.unwrap();
    assert_eq!(hits.len(), 2);

    let messages = search.relevant_context(text, 5).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, text);
}

// =============================================================
// Persistence
// =============================================================

#[tokio::test]
async fn restart_restores_ids_and_statistics() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let store = open_store(blobs.clone()).await;
    let base = base_time();
    for i in 0..5 {
        let message = msg(Role::User, &format!("note {i}"), base + Duration::seconds(i));
        store
            .store_message(&message, &format!("conv-{}", i % 2))
            .await
            .unwrap();
    }
    store
        .store_user_context(UserContext::new("Ada").with_fact("lives in Lisbon"))
        .await
        .unwrap();
    store.update_tier(Tier::Pro).await.unwrap();

    let ids = store.all_conversation_ids().await;
    let stats = store.statistics().await;
    drop(store);

    let reopened = open_store(blobs).await;
    assert_eq!(reopened.all_conversation_ids().await, ids);
    assert_eq!(reopened.statistics().await, stats);
    assert_eq!(reopened.current_tier().await, Tier::Pro);
    assert_eq!(
        reopened.user_context().await.map(|u| u.facts),
        Some(vec!["lives in Lisbon".to_string()])
    );
}

#[tokio::test]
async fn clear_all_is_persisted() {
    let blobs = Arc::new(InMemoryBlobStore::new());
    let store = open_store(blobs.clone()).await;
    store
        .store_message(&Message::user("remember me"), "c")
        .await
        .unwrap();
    store
        .store_user_context(UserContext::new("Ada").with_fact("x"))
        .await
        .unwrap();
    store.clear_all().await.unwrap();

    let reopened = open_store(blobs).await;
    let stats = reopened.statistics().await;
    assert_eq!(stats.total_messages, 0);
    assert_eq!(stats.total_embeddings, 0);
    assert!(reopened.user_context().await.is_none());
}

#[tokio::test]
async fn file_backed_store_survives_restart() {
    let dir = tmp_dir();
    {
        let store = MemoryStore::new(
            Arc::new(HashEmbedder::default()),
            Arc::new(FileBlobStore::new(&dir)),
        );
        store.initialize().await.unwrap();
        store
            .store_message(&Message::user("persist me"), "disk")
            .await
            .unwrap();
    }

    let blobs = Arc::new(FileBlobStore::new(&dir));
    assert!(blobs.read(SNAPSHOT_KEY).await.unwrap().is_some());
    let store = MemoryStore::new(Arc::new(HashEmbedder::default()), blobs);
    store.initialize().await.unwrap();
    let history = store.conversation_history("disk").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "persist me");

    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn unsupported_snapshot_is_kept_aside() {
    #[derive(serde::Serialize)]
    struct FutureSnapshot {
        version: u32,
        records: Vec<String>,
    }
    let future = rmp_serde::to_vec_named(&FutureSnapshot {
        version: 2,
        records: vec!["written by a newer release".into()],
    })
    .unwrap();

    let blobs = Arc::new(InMemoryBlobStore::new());
    blobs.write(SNAPSHOT_KEY, &future).await.unwrap();

    let store = open_store(blobs.clone()).await;
    assert_eq!(store.statistics().await.total_messages, 0);
    assert_eq!(
        blobs.read("memory.snapshot.v2").await.unwrap().as_deref(),
        Some(&future[..])
    );
    // The fresh snapshot replaced the unsupported one under the main key.
    assert_ne!(
        blobs.read(SNAPSHOT_KEY).await.unwrap().as_deref(),
        Some(&future[..])
    );
}

#[tokio::test]
async fn missing_snapshot_starts_empty_on_default_tier() {
    let store = Arc::new(MemoryStore::with_default_tier(
        Arc::new(HashEmbedder::default()),
        Arc::new(FileBlobStore::new(tmp_dir())),
        Tier::Pro,
    ));
    store.initialize().await.expect("missing snapshot is not an error");
    assert_eq!(store.current_tier().await, Tier::Pro);
    assert_eq!(store.statistics().await.total_messages, 0);
}
