use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{Conversation, Message, Role};

/// Terms that mark a message as technical. Matched against whole words.
const TECHNICAL_TERMS: &[&str] = &[
    "algorithm",
    "api",
    "async",
    "bug",
    "code",
    "compile",
    "config",
    "database",
    "deploy",
    "embedding",
    "error",
    "function",
    "install",
    "memory",
    "model",
    "python",
    "query",
    "rust",
    "server",
    "thread",
    "vector",
];

/// Phrases that suggest an assistant message explains something.
const EXPLANATION_CUES: &[&str] = &[
    "because",
    "this means",
    "for example",
    "in other words",
    "here's how",
    "step",
    "first,",
    "the reason",
    "to do this",
    "which means",
];

/// Bounds the messages of one active conversation that are sent to
/// inference each turn. An exchange is one user message plus one reply.
///
/// Within the bound, the newest half of the window is always kept verbatim;
/// the other half is filled with the highest-scoring older messages. The
/// result is always in chronological order.
#[derive(Debug, Clone, Copy)]
pub struct ContextWindowSelector {
    max_exchanges: usize,
}

impl Default for ContextWindowSelector {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ContextWindowSelector {
    pub fn new(max_exchanges: usize) -> Self {
        Self {
            max_exchanges: max_exchanges.max(1),
        }
    }

    pub fn max_exchanges(&self) -> usize {
        self.max_exchanges
    }

    /// Messages sent to inference per turn.
    pub fn max_messages(&self) -> usize {
        self.max_exchanges * 2
    }

    /// Messages a stored conversation may hold before it is trimmed.
    pub fn persisted_ceiling(&self) -> usize {
        self.max_exchanges * 4
    }

    /// Select the context window for this turn.
    pub fn select(&self, messages: &[Message]) -> Vec<Message> {
        self.select_at(messages, Utc::now())
    }

    pub fn select_at(&self, messages: &[Message], now: DateTime<Utc>) -> Vec<Message> {
        select_bounded(messages, self.max_messages(), now)
    }

    /// Rewrite a conversation that grew past the persisted ceiling down to
    /// its surviving messages. Returns how many messages were dropped.
    pub fn trim_conversation(&self, conversation: &mut Conversation) -> usize {
        self.trim_conversation_at(conversation, Utc::now())
    }

    pub fn trim_conversation_at(&self, conversation: &mut Conversation, now: DateTime<Utc>) -> usize {
        let ceiling = self.persisted_ceiling();
        if conversation.messages.len() <= ceiling {
            return 0;
        }

        let kept = select_bounded(&conversation.messages, ceiling, now);
        let dropped = conversation.messages.len() - kept.len();
        conversation.messages = kept;
        debug!(conversation_id = %conversation.id, dropped, ceiling, "trimmed conversation");
        dropped
    }
}

/// Convenience wrapper using the default window of 10 exchanges.
pub fn select_context_window(messages: &[Message]) -> Vec<Message> {
    ContextWindowSelector::default().select(messages)
}

/// Heuristic importance of a message. Higher is more worth keeping.
pub fn score_message(message: &Message, now: DateTime<Utc>) -> f64 {
    let content = message.content.as_str();
    let lower = content.to_lowercase();

    let mut score = 1.0;
    score += (content.chars().count() as f64 / 100.0).min(3.0);

    if content.contains('?') {
        score += 2.0;
    }

    score += 0.5 * technical_term_count(&lower) as f64;

    if message.role == Role::Assistant && EXPLANATION_CUES.iter().any(|cue| lower.contains(cue)) {
        score += 1.5;
    }

    let hours_since = ((now - message.timestamp).num_seconds() as f64 / 3600.0).max(0.0);
    score += (2.0 - hours_since).max(0.0);

    score
}

fn technical_term_count(lower: &str) -> usize {
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    TECHNICAL_TERMS
        .iter()
        .filter(|term| words.contains(*term))
        .count()
}

fn select_bounded(messages: &[Message], max_messages: usize, now: DateTime<Utc>) -> Vec<Message> {
    if messages.len() <= max_messages {
        return messages.to_vec();
    }

    let keep_recent = max_messages / 2;
    let pick_older = max_messages - keep_recent;
    let (older, recent) = messages.split_at(messages.len() - keep_recent);

    let mut scored: Vec<(usize, f64)> = older
        .iter()
        .enumerate()
        .map(|(i, m)| (i, score_message(m, now)))
        .collect();
    // Ties keep chronological order.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut picked: Vec<usize> = scored.into_iter().take(pick_older).map(|(i, _)| i).collect();
    picked.sort_unstable();

    let mut selected: Vec<Message> = picked
        .into_iter()
        .map(|i| older[i].clone())
        .chain(recent.iter().cloned())
        .collect();
    selected.sort_by_key(|m| m.timestamp);
    selected
}
