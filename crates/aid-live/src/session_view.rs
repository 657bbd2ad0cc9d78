use crate::reconcile::{reconcile, ClaimedSet, ReconcileOutcome};
use crate::router::{DomainEvent, SessionLifecycleKind};
use crate::streaming::{StreamChunk, StreamingBuffer, StreamingItems};
use crate::transport::ConnectionChange;
use aid_core::timeline::{extract_items, PersistedItem};
use aid_core::SessionRecord;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    NotNeeded,
    Needed,
}

impl RefreshDecision {
    pub fn is_needed(&self) -> bool {
        matches!(self, RefreshDecision::Needed)
    }
}

/// What a consumer renders: authoritative items first, then the transient
/// streaming items still waiting for their persisted counterpart.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub persisted: Arc<Vec<PersistedItem>>,
    pub streaming: Arc<StreamingItems>,
}

/// Live state for the one session being viewed.
///
/// Owns the streaming buffer, the claimed set and the current persisted
/// items. The claimed set survives refreshes of the same session and is
/// dropped when the view moves to another session.
#[derive(Debug)]
pub struct SessionView {
    session_id: String,
    dedup_window: usize,
    buffer: StreamingBuffer,
    claimed: Arc<ClaimedSet>,
    persisted: Arc<Vec<PersistedItem>>,
    snapshot: Option<Arc<SessionRecord>>,
    // stream key -> trimmed content of the last item reconciled away under it
    retired: HashMap<String, String>,
    revision: u64,
}

impl SessionView {
    pub fn new(session_id: impl Into<String>, dedup_window: usize) -> Self {
        Self {
            session_id: session_id.into(),
            dedup_window,
            buffer: StreamingBuffer::new(),
            claimed: Arc::new(ClaimedSet::default()),
            persisted: Arc::new(Vec::new()),
            snapshot: None,
            retired: HashMap::new(),
            revision: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn snapshot(&self) -> Option<&Arc<SessionRecord>> {
        self.snapshot.as_ref()
    }

    pub fn claimed(&self) -> &Arc<ClaimedSet> {
        &self.claimed
    }

    pub fn streaming(&self) -> Arc<StreamingItems> {
        self.buffer.all_active()
    }

    pub fn timeline(&self) -> Timeline {
        Timeline {
            persisted: Arc::clone(&self.persisted),
            streaming: self.buffer.all_active(),
        }
    }

    /// Points the view at another session, dropping all live state.
    /// Returns `false` when `session_id` is already the viewed one.
    pub fn switch_session(&mut self, session_id: &str) -> bool {
        if self.session_id == session_id {
            return false;
        }
        info!(
            event = "session_view_switch",
            from = %self.session_id,
            to = session_id,
            dropped_streams = self.buffer.len(),
            dropped_claims = self.claimed.len()
        );
        self.session_id = session_id.to_string();
        self.buffer.clear();
        self.claimed = Arc::new(ClaimedSet::default());
        self.persisted = Arc::new(Vec::new());
        self.snapshot = None;
        self.retired.clear();
        self.revision += 1;
        true
    }

    /// Installs a fresh snapshot and reconciles streaming items against it.
    /// Returns `true` when anything visible changed.
    pub fn apply_snapshot(&mut self, record: Arc<SessionRecord>) -> bool {
        let mut changed = self.switch_session(&record.session_id);

        if let Some(current) = &self.snapshot {
            if Arc::ptr_eq(current, &record) {
                return changed;
            }
        }
        let persisted = extract_items(&record);
        if persisted != *self.persisted {
            self.persisted = Arc::new(persisted);
            changed = true;
        }
        let status_changed = self
            .snapshot
            .as_ref()
            .map(|current| current.status != record.status)
            .unwrap_or(true);
        self.snapshot = Some(record);

        let outcome = self.reconcile();
        changed |= !outcome.is_noop() || status_changed;
        if changed {
            self.revision += 1;
        }
        changed
    }

    /// Runs reconciliation against the current persisted items and commits
    /// any removals.
    pub fn reconcile(&mut self) -> ReconcileOutcome {
        let streaming = self.buffer.all_active();
        let outcome = reconcile(&self.persisted, &streaming, &self.claimed, self.dedup_window);
        if outcome.is_noop() {
            return outcome;
        }
        for key in &outcome.removed_keys {
            if let Some(item) = streaming.get(key) {
                self.retired
                    .insert(key.clone(), item.content.trim().to_string());
            }
        }
        debug!(
            event = "session_view_reconciled",
            session_id = %self.session_id,
            removed = outcome.removed_keys.len(),
            claimed_total = outcome.claimed.len()
        );
        self.buffer.replace(Arc::clone(&outcome.streaming));
        self.claimed = Arc::clone(&outcome.claimed);
        outcome
    }

    /// Applies a routed event addressed to this view.
    pub fn on_event(&mut self, event: &DomainEvent) -> RefreshDecision {
        if event.session_id() != Some(self.session_id.as_str()) {
            return RefreshDecision::NotNeeded;
        }
        match event {
            DomainEvent::StreamChunk { chunk, .. } => {
                if self.on_chunk(chunk.clone()) {
                    // the persisted row may already be in hand
                    if chunk.is_complete {
                        self.reconcile();
                    }
                    self.revision += 1;
                }
                RefreshDecision::NotNeeded
            }
            DomainEvent::SessionLifecycle { kind, .. } => match kind {
                SessionLifecycleKind::Created => RefreshDecision::NotNeeded,
                SessionLifecycleKind::Started
                | SessionLifecycleKind::Completed
                | SessionLifecycleKind::Failed => RefreshDecision::Needed,
            },
            DomainEvent::StageLifecycle { .. } => RefreshDecision::Needed,
            DomainEvent::Interaction { .. } => RefreshDecision::NotNeeded,
        }
    }

    /// A reconnect may have skipped events the server cannot replay.
    pub fn on_connection(&mut self, change: &ConnectionChange) -> RefreshDecision {
        if change.is_reconnect() {
            RefreshDecision::Needed
        } else {
            RefreshDecision::NotNeeded
        }
    }

    fn on_chunk(&mut self, chunk: StreamChunk) -> bool {
        if let Some(content) = self.retired.get(&chunk.stream_key) {
            if content == chunk.chunk_text.trim() {
                debug!(
                    event = "stream_chunk_replayed",
                    session_id = %self.session_id,
                    stream_key = %chunk.stream_key
                );
                return false;
            }
            self.retired.remove(&chunk.stream_key);
        }
        self.buffer.on_chunk(chunk)
    }
}
