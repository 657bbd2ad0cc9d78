use aid_core::timeline::PersistedItem;
use aid_core::{us_to_datetime, SessionStatus, SessionSummary};
use aid_live::{StreamingItem, Timeline};

const PREVIEW_CHARS: usize = 160;

pub fn format_timestamp(timestamp_us: i64) -> String {
    us_to_datetime(timestamp_us)
        .map(|value| value.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

fn preview(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(PREVIEW_CHARS).collect();
    cut.push('…');
    cut
}

fn persisted_line(item: &PersistedItem) -> String {
    format!(
        "{} {:<12} {}",
        format_timestamp(item.timestamp_us),
        item.item_type.as_str(),
        preview(&item.content)
    )
}

fn streaming_line(key: &str, item: &StreamingItem) -> String {
    let marker = if item.waiting_for_persistence {
        "saving"
    } else {
        "live"
    };
    format!(
        "{:>12} {:<12} {} [stream:{}]",
        marker,
        item.item_type.as_str(),
        preview(&item.content),
        key
    )
}

/// Persisted items, oldest first, followed by transient streaming items.
/// Only the newest `tail` persisted items are shown when set.
pub fn render_timeline(
    session_id: &str,
    status: Option<SessionStatus>,
    revision: u64,
    timeline: &Timeline,
    tail: Option<usize>,
) -> Vec<String> {
    let status = status.map(|status| status.as_str()).unwrap_or("loading");
    let mut lines = vec![format!(
        "== session {session_id} [{status}] rev {revision}: {} persisted, {} streaming",
        timeline.persisted.len(),
        timeline.streaming.len()
    )];
    let skip = tail
        .map(|tail| timeline.persisted.len().saturating_sub(tail))
        .unwrap_or(0);
    if skip > 0 {
        lines.push(format!("   ... {skip} earlier items"));
    }
    lines.extend(timeline.persisted.iter().skip(skip).map(persisted_line));
    lines.extend(
        timeline
            .streaming
            .iter()
            .map(|(key, item)| streaming_line(key, item)),
    );
    lines
}

pub fn render_dashboard(revision: u64, sessions: &[SessionSummary]) -> Vec<String> {
    let active = sessions
        .iter()
        .filter(|summary| summary.status.is_active())
        .count();
    let mut lines = vec![format!("== dashboard rev {revision}: {active} active")];
    for summary in sessions {
        let started = summary
            .started_at_us
            .map(format_timestamp)
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "{:<36} {:<12} {:<12} {}",
            summary.session_id,
            summary.status.as_str(),
            started,
            summary.alert_type.as_deref().unwrap_or("-")
        ));
    }
    lines
}

pub fn render_connection(connected: bool, disabled: bool) -> String {
    match (connected, disabled) {
        (_, true) => "!! live updates disabled; type `retry` to reconnect".to_string(),
        (true, false) => "-- live updates connected".to_string(),
        (false, false) => "-- live updates reconnecting".to_string(),
    }
}
