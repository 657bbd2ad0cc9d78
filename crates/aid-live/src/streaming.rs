use aid_core::timeline::ItemType;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_STREAM_KEY: &str = "default";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Thought,
    FinalAnswer,
}

impl StreamType {
    pub fn item_type(&self) -> ItemType {
        match self {
            StreamType::Thought => ItemType::Thought,
            StreamType::FinalAnswer => ItemType::FinalAnswer,
        }
    }
}

/// One chunk of model output. `chunk_text` carries the full text so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub stream_key: String,
    pub stream_type: StreamType,
    pub chunk_text: String,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingItem {
    pub item_type: ItemType,
    pub content: String,
    pub waiting_for_persistence: bool,
}

/// Live streaming items in first-chunk arrival order, at most one per key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingItems {
    entries: Vec<(String, StreamingItem)>,
}

impl StreamingItems {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&StreamingItem> {
        self.entries
            .iter()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, item)| item)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StreamingItem)> {
        self.entries
            .iter()
            .map(|(key, item)| (key.as_str(), item))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut StreamingItem> {
        self.entries
            .iter_mut()
            .find(|(entry_key, _)| entry_key == key)
            .map(|(_, item)| item)
    }

    pub(crate) fn insert_new(&mut self, key: String, item: StreamingItem) {
        debug_assert!(self.get(&key).is_none());
        self.entries.push((key, item));
    }

    pub(crate) fn retain_keys<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.entries.retain(|(key, _)| keep(key));
    }
}

/// Per-stream-key partial text accumulated from chunk events.
///
/// Completion only flags an item; it stays until reconciliation finds its
/// persisted counterpart, however long persistence takes.
#[derive(Debug, Clone, Default)]
pub struct StreamingBuffer {
    items: Arc<StreamingItems>,
}

impl StreamingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a chunk. Returns `true` when the visible state changed.
    pub fn on_chunk(&mut self, chunk: StreamChunk) -> bool {
        let item_type = chunk.stream_type.item_type();
        if let Some(existing) = self.items.get(&chunk.stream_key) {
            let unchanged = existing.item_type == item_type
                && existing.content == chunk.chunk_text
                && (existing.waiting_for_persistence || !chunk.is_complete);
            if unchanged {
                // replayed or duplicate delivery
                return false;
            }
            let items = Arc::make_mut(&mut self.items);
            if let Some(existing) = items.get_mut(&chunk.stream_key) {
                existing.item_type = item_type;
                existing.content = chunk.chunk_text;
                existing.waiting_for_persistence = chunk.is_complete;
            }
            return true;
        }

        debug!(
            event = "stream_started",
            stream_key = %chunk.stream_key,
            stream_type = item_type.as_str()
        );
        Arc::make_mut(&mut self.items).insert_new(
            chunk.stream_key,
            StreamingItem {
                item_type,
                content: chunk.chunk_text,
                waiting_for_persistence: chunk.is_complete,
            },
        );
        true
    }

    pub fn all_active(&self) -> Arc<StreamingItems> {
        Arc::clone(&self.items)
    }

    pub(crate) fn replace(&mut self, items: Arc<StreamingItems>) {
        self.items = items;
    }

    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            self.items = Arc::new(StreamingItems::default());
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
