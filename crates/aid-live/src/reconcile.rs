use crate::streaming::StreamingItems;
use aid_core::timeline::{ItemType, PersistedItem};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Characters of content folded into a claim key.
pub const CLAIM_CONTENT_PREFIX_CHARS: usize = 50;

/// Identity of a persisted item for claiming purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimKey {
    pub timestamp_us: i64,
    pub item_type: ItemType,
    pub content_prefix: String,
}

impl ClaimKey {
    pub fn for_item(item: &PersistedItem) -> Self {
        Self {
            timestamp_us: item.timestamp_us,
            item_type: item.item_type,
            content_prefix: item.content.chars().take(CLAIM_CONTENT_PREFIX_CHARS).collect(),
        }
    }
}

/// Persisted items already matched to a streaming item. Lives as long as
/// one session view; never shrinks while that view is open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimedSet {
    keys: HashSet<ClaimKey>,
}

impl ClaimedSet {
    pub fn contains(&self, key: &ClaimKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn insert(&mut self, key: ClaimKey) -> bool {
        self.keys.insert(key)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub streaming: Arc<StreamingItems>,
    pub claimed: Arc<ClaimedSet>,
    pub removed_keys: BTreeSet<String>,
    pub newly_claimed: Vec<ClaimKey>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.removed_keys.is_empty()
    }

    fn unchanged(streaming: &Arc<StreamingItems>, claimed: &Arc<ClaimedSet>) -> Self {
        Self {
            streaming: Arc::clone(streaming),
            claimed: Arc::clone(claimed),
            removed_keys: BTreeSet::new(),
            newly_claimed: Vec::new(),
        }
    }
}

/// Drops streaming items whose content has landed in the persisted list.
///
/// Streaming items are visited in first-chunk order; each one takes the
/// oldest unclaimed persisted item of the same type and trimmed content
/// among the newest `window` persisted items. When nothing matches, the
/// returned `Arc`s are the ones passed in.
pub fn reconcile(
    persisted: &[PersistedItem],
    streaming: &Arc<StreamingItems>,
    claimed: &Arc<ClaimedSet>,
    window: usize,
) -> ReconcileOutcome {
    if streaming.is_empty() || persisted.is_empty() || window == 0 {
        return ReconcileOutcome::unchanged(streaming, claimed);
    }

    let recent = &persisted[persisted.len().saturating_sub(window)..];
    let mut removed_keys = BTreeSet::new();
    let mut newly_claimed: Vec<ClaimKey> = Vec::new();

    for (stream_key, item) in streaming.iter() {
        let content = item.content.trim();
        let matched = recent.iter().find_map(|candidate| {
            if candidate.item_type != item.item_type || candidate.content.trim() != content {
                return None;
            }
            let key = ClaimKey::for_item(candidate);
            if claimed.contains(&key) || newly_claimed.contains(&key) {
                return None;
            }
            Some(key)
        });
        if let Some(key) = matched {
            debug!(
                event = "stream_reconciled",
                stream_key,
                item_type = key.item_type.as_str(),
                timestamp_us = key.timestamp_us
            );
            removed_keys.insert(stream_key.to_string());
            newly_claimed.push(key);
        }
    }

    if removed_keys.is_empty() {
        return ReconcileOutcome::unchanged(streaming, claimed);
    }

    let mut next_streaming = StreamingItems::clone(streaming);
    next_streaming.retain_keys(|key| !removed_keys.contains(key));
    let mut next_claimed = ClaimedSet::clone(claimed);
    for key in &newly_claimed {
        next_claimed.insert(key.clone());
    }

    ReconcileOutcome {
        streaming: Arc::new(next_streaming),
        claimed: Arc::new(next_claimed),
        removed_keys,
        newly_claimed,
    }
}
