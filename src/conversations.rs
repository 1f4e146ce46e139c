use std::collections::HashMap;

use crate::context::ContextWindowSelector;
use crate::types::{Conversation, Message};

/// In-process holder of active conversations.
///
/// Appending keeps each conversation under the selector's persisted
/// ceiling; `context_window` returns the bounded slice for one inference call.
pub struct ConversationStore {
    conversations: HashMap<String, Conversation>,
    selector: ContextWindowSelector,
}

impl ConversationStore {
    pub fn new(selector: ContextWindowSelector) -> Self {
        Self {
            conversations: HashMap::new(),
            selector,
        }
    }

    pub fn selector(&self) -> &ContextWindowSelector {
        &self.selector
    }

    pub fn get_or_create(&mut self, id: &str) -> &mut Conversation {
        self.conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation::new(id))
    }

    /// Append to an existing conversation, trimming it if it outgrew the
    /// ceiling. Returns the number of messages dropped, or `None` if the
    /// conversation does not exist.
    pub fn append_message(&mut self, id: &str, message: Message) -> Option<usize> {
        let conversation = self.conversations.get_mut(id)?;
        conversation.push(message);
        Some(self.selector.trim_conversation(conversation))
    }

    /// Messages to send to inference for this turn.
    pub fn context_window(&self, id: &str) -> Vec<Message> {
        self.conversations
            .get(id)
            .map(|c| self.selector.select(&c.messages))
            .unwrap_or_default()
    }

    /// Insert or replace a whole conversation (e.g. loaded from disk).
    pub fn insert(&mut self, mut conversation: Conversation) -> usize {
        let dropped = self.selector.trim_conversation(&mut conversation);
        self.conversations.insert(conversation.id.clone(), conversation);
        dropped
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Conversation> {
        self.conversations.remove(id)
    }

    pub fn count(&self) -> usize {
        self.conversations.len()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(ContextWindowSelector::default())
    }
}
