pub mod window;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::Result;
use crate::memory::{MemoryStore, SemanticSearch, UserContext};
use crate::types::Message;

pub use window::{ContextWindowSelector, score_message, select_context_window};

/// Facts from the user profile included in the system prompt.
const MAX_PROMPT_FACTS: usize = 5;

const IDENTITY_LINE: &str =
    "You are a private, on-device assistant with long-term memory of past conversations.";

const GUIDELINES: &str = "\
Guidelines:
- Use remembered context when it is relevant, and say so when you rely on it.
- Do not invent memories. If you are unsure whether something was discussed, ask.
- Keep answers concise and direct.
- Treat everything the user shares as private.";

/// Everything assembled for one inference call. Not persisted.
///
/// `recent_messages` and `relevant_history` are independent: a message that
/// is both recent and relevant appears in both.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationContext {
    /// Newest messages of the active conversation, oldest first.
    pub recent_messages: Vec<Message>,
    /// Cross-conversation matches, most similar first.
    pub relevant_history: Vec<Message>,
    pub user_context: Option<UserContext>,
    pub built_at: DateTime<Utc>,
}

impl ConversationContext {
    /// Render the bundle as prompt text: relevant history blocks separated by
    /// `---`, then the recent conversation as `role: content` lines.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if !self.relevant_history.is_empty() {
            out.push_str("Relevant history:\n");
            let blocks: Vec<String> = self
                .relevant_history
                .iter()
                .map(|m| {
                    format!(
                        "# {} ({})\n{}\n",
                        m.role,
                        m.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                        m.content
                    )
                })
                .collect();
            out.push_str(&blocks.join("\n---\n"));
            out.push('\n');
        }

        if !self.recent_messages.is_empty() {
            out.push_str("Recent conversation:\n");
            for m in &self.recent_messages {
                let _ = writeln!(out, "{}: {}", m.role, m.content);
            }
        }

        out
    }

    /// Provider-facing messages: one system message carrying the prompt and
    /// relevant history, followed by the recent turns.
    pub fn to_provider_messages(&self, system_prompt: &str) -> Vec<serde_json::Value> {
        let mut system = system_prompt.to_string();
        if !self.relevant_history.is_empty() {
            let relevant = ConversationContext {
                recent_messages: Vec::new(),
                relevant_history: self.relevant_history.clone(),
                user_context: None,
                built_at: self.built_at,
            };
            system.push_str("\n\n");
            system.push_str(relevant.render().trim_end());
        }

        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": system,
        })];
        messages.extend(self.recent_messages.iter().map(Message::as_provider_message));
        messages
    }
}

/// Combines per-conversation history, cross-conversation relevance and the
/// user profile into a context bundle.
pub struct ContextAssembler {
    store: Arc<MemoryStore>,
    search: SemanticSearch,
    recent_limit: usize,
    relevant_limit: usize,
}

impl ContextAssembler {
    /// Defaults: 10 recent messages and 5 relevant messages.
    pub fn new(store: Arc<MemoryStore>, search: SemanticSearch) -> Self {
        Self::with_limits(store, search, 10, 5)
    }

    pub fn with_limits(
        store: Arc<MemoryStore>,
        search: SemanticSearch,
        recent_limit: usize,
        relevant_limit: usize,
    ) -> Self {
        Self {
            store,
            search,
            recent_limit,
            relevant_limit,
        }
    }

    /// Assemble context for answering `user_message` in `conversation_id`.
    pub async fn build_context(
        &self,
        user_message: &str,
        conversation_id: &str,
        include_user_context: bool,
    ) -> Result<ConversationContext> {
        let history = self.store.conversation_history(conversation_id).await;
        let start = history.len().saturating_sub(self.recent_limit);
        let recent_messages = history[start..].to_vec();

        let relevant_history = self
            .search
            .relevant_context(user_message, self.relevant_limit)
            .await?;

        let user_context = if include_user_context {
            self.store.user_context().await
        } else {
            None
        };

        Ok(ConversationContext {
            recent_messages,
            relevant_history,
            user_context,
            built_at: Utc::now(),
        })
    }

    /// System prompt for the current user profile.
    pub async fn generate_system_prompt(&self, include_memory: bool) -> String {
        let user = if include_memory {
            self.store.user_context().await
        } else {
            None
        };
        render_system_prompt(user.as_ref())
    }
}

/// Deterministic system prompt: identity line, optional user profile with
/// at most five facts, then fixed guidelines.
pub fn render_system_prompt(user: Option<&UserContext>) -> String {
    let mut prompt = String::from(IDENTITY_LINE);
    prompt.push_str("\n\n");

    if let Some(user) = user {
        prompt.push_str("About the user:\n");
        let _ = writeln!(prompt, "- Name: {}", user.name);
        if let Some(role) = &user.role {
            let _ = writeln!(prompt, "- Role: {role}");
        }
        if let Some(company) = &user.company {
            let _ = writeln!(prompt, "- Company: {company}");
        }
        if !user.facts.is_empty() {
            prompt.push_str("Known facts:\n");
            for fact in user.facts.iter().take(MAX_PROMPT_FACTS) {
                let _ = writeln!(prompt, "- {fact}");
            }
        }
        prompt.push('\n');
    }

    prompt.push_str(GUIDELINES);
    prompt
}
