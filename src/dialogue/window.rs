//! Conversation window tracking
//!
//! The dialogue engine keeps every conversation item it has seen. To bound
//! the context it replays on each turn, only the most recent items are kept
//! and older ones are deleted upstream.

use std::collections::VecDeque;

/// Default number of conversation items kept upstream
pub const DEFAULT_MAX_ITEMS: usize = 2;

/// FIFO window over conversation item ids acknowledged by the engine
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    items: VecDeque<String>,
    max_items: usize,
}

impl ConversationWindow {
    /// Create a window keeping at most `max_items` items
    ///
    /// A maximum below one is raised to one so the newest item always stays.
    #[must_use]
    pub fn new(max_items: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_items: max_items.max(1),
        }
    }

    /// Record a newly created item, returning the ids evicted to make room
    ///
    /// Evicted ids are returned oldest first. The item just tracked is never
    /// among them. Re-announcing an already tracked id is a no-op.
    pub fn track(&mut self, item_id: impl Into<String>) -> Vec<String> {
        let item_id = item_id.into();
        if self.items.contains(&item_id) {
            return Vec::new();
        }
        self.items.push_back(item_id);

        let mut evicted = Vec::new();
        while self.items.len() > self.max_items {
            if let Some(oldest) = self.items.pop_front() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    /// Tracked ids, oldest first
    pub fn items(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }

    /// Number of tracked items
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Forget every tracked item
    ///
    /// Used after a reconnect, when the new upstream conversation starts
    /// empty.
    pub fn reset(&mut self) {
        self.items.clear();
    }
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS)
    }
}
