use crate::router::DomainEvent;
use crate::session_view::RefreshDecision;
use crate::transport::ConnectionChange;
use aid_core::SessionSummary;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Aggregate view over all active sessions, fed by the `sessions` channel.
#[derive(Debug, Default)]
pub struct DashboardView {
    sessions: Arc<Vec<SessionSummary>>,
    known_active: HashSet<String>,
    revision: u64,
}

impl DashboardView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> Arc<Vec<SessionSummary>> {
        Arc::clone(&self.sessions)
    }

    /// Active sessions as last known, including ones only seen through
    /// interaction events since the last refresh.
    pub fn active_count(&self) -> usize {
        self.known_active.len()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn apply_sessions(&mut self, sessions: Vec<SessionSummary>) -> bool {
        let known_active: HashSet<String> = sessions
            .iter()
            .filter(|summary| summary.status.is_active())
            .map(|summary| summary.session_id.clone())
            .collect();
        if sessions == *self.sessions && known_active == self.known_active {
            return false;
        }
        self.sessions = Arc::new(sessions);
        self.known_active = known_active;
        self.revision += 1;
        true
    }

    pub fn on_event(&mut self, event: &DomainEvent) -> RefreshDecision {
        match event {
            DomainEvent::SessionLifecycle { .. } => RefreshDecision::Needed,
            DomainEvent::Interaction { session_id, .. }
            | DomainEvent::StageLifecycle { session_id, .. } => {
                if self.known_active.insert(session_id.clone()) {
                    debug!(
                        event = "dashboard_active_count_changed",
                        session_id = %session_id,
                        active = self.known_active.len()
                    );
                    RefreshDecision::Needed
                } else {
                    RefreshDecision::NotNeeded
                }
            }
            DomainEvent::StreamChunk { .. } => RefreshDecision::NotNeeded,
        }
    }

    pub fn on_connection(&mut self, change: &ConnectionChange) -> RefreshDecision {
        if change.is_reconnect() {
            RefreshDecision::Needed
        } else {
            RefreshDecision::NotNeeded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{InteractionKind, SessionLifecycleKind};
    use aid_core::SessionStatus;

    fn summary(id: &str, status: SessionStatus) -> SessionSummary {
        SessionSummary {
            session_id: id.to_string(),
            status,
            alert_type: None,
            started_at_us: None,
        }
    }

    fn interaction(session_id: &str) -> DomainEvent {
        DomainEvent::Interaction {
            session_id: session_id.to_string(),
            kind: InteractionKind::ToolCall,
            stage_execution_id: None,
        }
    }

    #[test]
    fn interactions_refresh_only_when_active_count_changes() {
        let mut dashboard = DashboardView::new();
        dashboard.apply_sessions(vec![summary("s1", SessionStatus::InProgress)]);
        assert_eq!(dashboard.active_count(), 1);

        assert_eq!(dashboard.on_event(&interaction("s1")), RefreshDecision::NotNeeded);
        assert_eq!(dashboard.on_event(&interaction("s2")), RefreshDecision::Needed);
        assert_eq!(dashboard.active_count(), 2);
        // already counted until the next refresh says otherwise
        assert_eq!(dashboard.on_event(&interaction("s2")), RefreshDecision::NotNeeded);
    }

    #[test]
    fn lifecycle_events_always_refresh() {
        let mut dashboard = DashboardView::new();
        let event = DomainEvent::SessionLifecycle {
            session_id: "s1".to_string(),
            kind: SessionLifecycleKind::Created,
            status: None,
            error_message: None,
        };
        assert!(dashboard.on_event(&event).is_needed());
    }

    #[test]
    fn identical_refresh_is_not_a_change() {
        let mut dashboard = DashboardView::new();
        let sessions = vec![
            summary("s1", SessionStatus::InProgress),
            summary("s2", SessionStatus::Completed),
        ];
        assert!(dashboard.apply_sessions(sessions.clone()));
        assert_eq!(dashboard.active_count(), 1);
        let revision = dashboard.revision();
        assert!(!dashboard.apply_sessions(sessions));
        assert_eq!(dashboard.revision(), revision);
    }
}
