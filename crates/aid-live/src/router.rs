use crate::streaming::{StreamChunk, StreamType, DEFAULT_STREAM_KEY};
use crate::transport::ConnectionChange;
use aid_core::event_wire::{Channel, WireEvent};
use aid_core::{deserialize_id, deserialize_optional_id, SessionStatus};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    SessionLifecycle,
    StageLifecycle,
    Interaction,
    StreamChunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionLifecycleKind {
    Created,
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageLifecycleKind {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    Llm,
    ToolCall,
    ListTools,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    SessionLifecycle {
        session_id: String,
        kind: SessionLifecycleKind,
        status: Option<SessionStatus>,
        error_message: Option<String>,
    },
    StageLifecycle {
        session_id: String,
        kind: StageLifecycleKind,
        stage_execution_id: Option<String>,
        stage_name: Option<String>,
    },
    Interaction {
        session_id: String,
        kind: InteractionKind,
        stage_execution_id: Option<String>,
    },
    StreamChunk {
        session_id: Option<String>,
        chunk: StreamChunk,
    },
}

impl DomainEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            DomainEvent::SessionLifecycle { .. } => EventCategory::SessionLifecycle,
            DomainEvent::StageLifecycle { .. } => EventCategory::StageLifecycle,
            DomainEvent::Interaction { .. } => EventCategory::Interaction,
            DomainEvent::StreamChunk { .. } => EventCategory::StreamChunk,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            DomainEvent::SessionLifecycle { session_id, .. }
            | DomainEvent::StageLifecycle { session_id, .. }
            | DomainEvent::Interaction { session_id, .. } => Some(session_id.as_str()),
            DomainEvent::StreamChunk { session_id, .. } => session_id.as_deref(),
        }
    }
}

/// A domain event together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    pub channel: Channel,
    pub event_id: Option<String>,
    pub event: DomainEvent,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    #[serde(deserialize_with = "deserialize_id")]
    session_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StagePayload {
    #[serde(deserialize_with = "deserialize_id")]
    session_id: String,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    stage_execution_id: Option<String>,
    #[serde(default)]
    stage_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InteractionPayload {
    #[serde(deserialize_with = "deserialize_id")]
    session_id: String,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    stage_execution_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunkPayload {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    session_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    stage_execution_id: Option<String>,
    stream_type: StreamType,
    #[serde(default)]
    chunk: String,
    #[serde(default)]
    is_complete: bool,
}

/// Maps a wire event onto a domain event.
///
/// `Ok(None)` means the event type is not one this client knows about.
pub fn parse_event(raw: &WireEvent) -> Result<Option<DomainEvent>, String> {
    let event = match raw.event_type.as_str() {
        "session.created" => session_event(&raw.data, SessionLifecycleKind::Created)?,
        "session.started" => session_event(&raw.data, SessionLifecycleKind::Started)?,
        "session.completed" => session_event(&raw.data, SessionLifecycleKind::Completed)?,
        "session.failed" => session_event(&raw.data, SessionLifecycleKind::Failed)?,
        "stage.started" => stage_event(&raw.data, StageLifecycleKind::Started)?,
        "stage.completed" => stage_event(&raw.data, StageLifecycleKind::Completed)?,
        "stage.failed" => stage_event(&raw.data, StageLifecycleKind::Failed)?,
        "llm.interaction" => interaction_event(&raw.data, InteractionKind::Llm)?,
        "mcp.tool_call" => interaction_event(&raw.data, InteractionKind::ToolCall)?,
        "mcp.list_tools" => interaction_event(&raw.data, InteractionKind::ListTools)?,
        "llm.stream.chunk" => {
            let payload: StreamChunkPayload = decode(&raw.data)?;
            let stream_key = payload
                .stage_execution_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string());
            DomainEvent::StreamChunk {
                session_id: payload.session_id,
                chunk: StreamChunk {
                    stream_key,
                    stream_type: payload.stream_type,
                    chunk_text: payload.chunk,
                    is_complete: payload.is_complete,
                },
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn session_event(data: &Value, kind: SessionLifecycleKind) -> Result<DomainEvent, String> {
    let payload: SessionPayload = decode(data)?;
    Ok(DomainEvent::SessionLifecycle {
        session_id: payload.session_id,
        kind,
        status: payload
            .status
            .as_deref()
            .and_then(|status| status.parse().ok()),
        error_message: payload.error_message,
    })
}

fn stage_event(data: &Value, kind: StageLifecycleKind) -> Result<DomainEvent, String> {
    let payload: StagePayload = decode(data)?;
    Ok(DomainEvent::StageLifecycle {
        session_id: payload.session_id,
        kind,
        stage_execution_id: payload.stage_execution_id,
        stage_name: payload.stage_name,
    })
}

fn interaction_event(data: &Value, kind: InteractionKind) -> Result<DomainEvent, String> {
    let payload: InteractionPayload = decode(data)?;
    Ok(DomainEvent::Interaction {
        session_id: payload.session_id,
        kind,
        stage_execution_id: payload.stage_execution_id,
    })
}

fn decode<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, String> {
    T::deserialize(data).map_err(|err| err.to_string())
}

pub trait EventListener: Send {
    fn on_event(&mut self, event: &RoutedEvent);
}

impl<F> EventListener for F
where
    F: FnMut(&RoutedEvent) + Send,
{
    fn on_event(&mut self, event: &RoutedEvent) {
        self(event)
    }
}

pub trait ConnectionListener: Send {
    fn on_connection_change(&mut self, change: &ConnectionChange);
}

impl<F> ConnectionListener for F
where
    F: FnMut(&ConnectionChange) + Send,
{
    fn on_connection_change(&mut self, change: &ConnectionChange) {
        self(change)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerScope {
    Category(EventCategory),
    Session(String),
    Channel(Channel),
    Connection,
}

/// Returned at registration; pass back to remove the listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[must_use = "dropping the handle leaves the listener registered with no way to remove it"]
pub struct ListenerHandle {
    id: u64,
    scope: ListenerScope,
}

impl ListenerHandle {
    pub fn scope(&self) -> &ListenerScope {
        &self.scope
    }
}

type ListenerSlot = Vec<(u64, Box<dyn EventListener>)>;
type ConnectionSlot = Vec<(u64, Box<dyn ConnectionListener>)>;

/// Demultiplexes wire events into typed domain events and delivers each one,
/// synchronously and in arrival order, to its category listeners, then its
/// session listeners, then the listeners of the channel it arrived on.
#[derive(Default)]
pub struct EventRouter {
    next_id: u64,
    by_category: HashMap<EventCategory, ListenerSlot>,
    by_session: HashMap<String, ListenerSlot>,
    by_channel: HashMap<Channel, ListenerSlot>,
    connection: ConnectionSlot,
    dropped: u64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_category<L>(&mut self, category: EventCategory, listener: L) -> ListenerHandle
    where
        L: EventListener + 'static,
    {
        let id = self.next_listener_id();
        self.by_category
            .entry(category)
            .or_default()
            .push((id, Box::new(listener) as Box<dyn EventListener>));
        ListenerHandle {
            id,
            scope: ListenerScope::Category(category),
        }
    }

    pub fn on_session<L>(&mut self, session_id: &str, listener: L) -> ListenerHandle
    where
        L: EventListener + 'static,
    {
        let id = self.next_listener_id();
        self.by_session
            .entry(session_id.to_string())
            .or_default()
            .push((id, Box::new(listener) as Box<dyn EventListener>));
        ListenerHandle {
            id,
            scope: ListenerScope::Session(session_id.to_string()),
        }
    }

    pub fn on_channel<L>(&mut self, channel: &Channel, listener: L) -> ListenerHandle
    where
        L: EventListener + 'static,
    {
        let id = self.next_listener_id();
        self.by_channel
            .entry(channel.clone())
            .or_default()
            .push((id, Box::new(listener) as Box<dyn EventListener>));
        ListenerHandle {
            id,
            scope: ListenerScope::Channel(channel.clone()),
        }
    }

    pub fn on_connection<L>(&mut self, listener: L) -> ListenerHandle
    where
        L: ConnectionListener + 'static,
    {
        let id = self.next_listener_id();
        self.connection
            .push((id, Box::new(listener) as Box<dyn ConnectionListener>));
        ListenerHandle {
            id,
            scope: ListenerScope::Connection,
        }
    }

    /// Removes a listener. Returns `false` if it was already gone.
    pub fn remove(&mut self, handle: ListenerHandle) -> bool {
        match handle.scope {
            ListenerScope::Category(category) => {
                remove_from(self.by_category.get_mut(&category), handle.id)
            }
            ListenerScope::Session(session_id) => {
                remove_from(self.by_session.get_mut(&session_id), handle.id)
            }
            ListenerScope::Channel(channel) => {
                remove_from(self.by_channel.get_mut(&channel), handle.id)
            }
            ListenerScope::Connection => remove_from(Some(&mut self.connection), handle.id),
        }
    }

    pub fn has_channel_listeners(&self, channel: &Channel) -> bool {
        self.by_channel
            .get(channel)
            .map(|slot| !slot.is_empty())
            .unwrap_or(false)
    }

    /// Count of events dropped as unrecognized or malformed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn route(&mut self, channel: &Channel, raw: WireEvent) -> Option<RoutedEvent> {
        let mut event = match parse_event(&raw) {
            Ok(Some(event)) => event,
            Ok(None) => {
                self.dropped += 1;
                debug!(
                    event = "router_unrecognized_event",
                    channel = %channel,
                    event_type = %raw.event_type
                );
                return None;
            }
            Err(err) => {
                self.dropped += 1;
                warn!(
                    event = "router_malformed_event",
                    channel = %channel,
                    event_type = %raw.event_type,
                    error = %err
                );
                return None;
            }
        };

        if let DomainEvent::StreamChunk { session_id, .. } = &mut event {
            if session_id.is_none() {
                *session_id = channel.session_id().map(ToString::to_string);
            }
        }

        let routed = RoutedEvent {
            channel: channel.clone(),
            event_id: raw.id,
            event,
        };
        self.deliver(&routed);
        Some(routed)
    }

    pub fn deliver(&mut self, routed: &RoutedEvent) {
        if let Some(slot) = self.by_category.get_mut(&routed.event.category()) {
            for (_, listener) in slot.iter_mut() {
                listener.on_event(routed);
            }
        }
        if let Some(session_id) = routed.event.session_id() {
            if let Some(slot) = self.by_session.get_mut(session_id) {
                for (_, listener) in slot.iter_mut() {
                    listener.on_event(routed);
                }
            }
        }
        if let Some(slot) = self.by_channel.get_mut(&routed.channel) {
            for (_, listener) in slot.iter_mut() {
                listener.on_event(routed);
            }
        }
    }

    pub fn notify_connection(&mut self, change: &ConnectionChange) {
        for (_, listener) in self.connection.iter_mut() {
            listener.on_connection_change(change);
        }
    }

    fn next_listener_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn remove_from<T>(slot: Option<&mut Vec<(u64, T)>>, id: u64) -> bool {
    let Some(slot) = slot else {
        return false;
    };
    let before = slot.len();
    slot.retain(|(entry_id, _)| *entry_id != id);
    slot.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&RoutedEvent) + Send) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = move |event: &RoutedEvent| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(format!("{:?}", event.event.category()));
            }
        };
        (seen, listener)
    }

    fn wire(event_type: &str, data: Value) -> WireEvent {
        WireEvent::new(event_type, data)
    }

    #[test]
    fn stream_chunk_without_execution_uses_default_key() {
        let event = parse_event(&wire(
            "llm.stream.chunk",
            serde_json::json!({"session_id": "s1", "stream_type": "final_answer", "chunk": "Done", "is_complete": true}),
        ))
        .expect("parse")
        .expect("known");

        match event {
            DomainEvent::StreamChunk { session_id, chunk } => {
                assert_eq!(session_id.as_deref(), Some("s1"));
                assert_eq!(chunk.stream_key, DEFAULT_STREAM_KEY);
                assert_eq!(chunk.stream_type, StreamType::FinalAnswer);
                assert!(chunk.is_complete);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn numeric_ids_are_accepted_on_every_payload() {
        let chunk = parse_event(&wire(
            "llm.stream.chunk",
            serde_json::json!({"session_id": 17, "stage_execution_id": 42, "stream_type": "thought", "chunk": "Checking"}),
        ))
        .expect("parse")
        .expect("known");
        match chunk {
            DomainEvent::StreamChunk { session_id, chunk } => {
                assert_eq!(session_id.as_deref(), Some("17"));
                assert_eq!(chunk.stream_key, "42");
                assert_eq!(chunk.chunk_text, "Checking");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let stage = parse_event(&wire(
            "stage.started",
            serde_json::json!({"session_id": 17, "stage_execution_id": 42}),
        ))
        .expect("parse")
        .expect("known");
        assert!(matches!(
            stage,
            DomainEvent::StageLifecycle { ref session_id, stage_execution_id: Some(ref id), .. }
                if session_id == "17" && id == "42"
        ));

        let interaction = parse_event(&wire(
            "mcp.tool_call",
            serde_json::json!({"session_id": "s1", "stage_execution_id": null}),
        ))
        .expect("parse")
        .expect("known");
        assert!(matches!(
            interaction,
            DomainEvent::Interaction { stage_execution_id: None, .. }
        ));
    }

    #[test]
    fn session_events_parse_status_leniently() {
        let event = parse_event(&wire(
            "session.failed",
            serde_json::json!({"session_id": 17, "status": "FAILED", "error_message": "boom"}),
        ))
        .expect("parse")
        .expect("known");
        assert_eq!(
            event,
            DomainEvent::SessionLifecycle {
                session_id: "17".to_string(),
                kind: SessionLifecycleKind::Failed,
                status: Some(SessionStatus::Failed),
                error_message: Some("boom".to_string()),
            }
        );
    }

    #[test]
    fn unrecognized_and_malformed_events_are_dropped() {
        let mut router = EventRouter::new();
        let (seen, listener) = collector();
        let _handle = router.on_category(EventCategory::SessionLifecycle, listener);

        assert!(router
            .route(&Channel::Sessions, wire("session.archived", serde_json::json!({})))
            .is_none());
        assert!(router
            .route(&Channel::Sessions, wire("session.started", serde_json::json!({"nope": 1})))
            .is_none());
        assert_eq!(router.dropped(), 2);
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[test]
    fn delivers_to_category_session_and_channel_listeners_in_order() {
        let mut router = EventRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&order);
        let _a = router.on_category(EventCategory::StreamChunk, move |_: &RoutedEvent| {
            sink.lock().expect("lock").push("category");
        });
        let sink = Arc::clone(&order);
        let _b = router.on_session("s1", move |_: &RoutedEvent| {
            sink.lock().expect("lock").push("session");
        });
        let sink = Arc::clone(&order);
        let _c = router.on_channel(&Channel::session("s1"), move |_: &RoutedEvent| {
            sink.lock().expect("lock").push("channel");
        });
        let sink = Arc::clone(&order);
        let _d = router.on_session("s2", move |_: &RoutedEvent| {
            sink.lock().expect("lock").push("other-session");
        });

        let routed = router.route(
            &Channel::session("s1"),
            wire(
                "llm.stream.chunk",
                serde_json::json!({"session_id": "s1", "stage_execution_id": "e1", "stream_type": "thought", "chunk": "hi"}),
            ),
        );
        assert!(routed.is_some());
        assert_eq!(
            *order.lock().expect("lock"),
            vec!["category", "session", "channel"]
        );
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let mut router = EventRouter::new();
        let (seen, listener) = collector();
        let handle = router.on_session("s1", listener);
        let event = wire("stage.started", serde_json::json!({"session_id": "s1", "stage_name": "triage"}));

        router.route(&Channel::Sessions, event.clone());
        assert!(router.remove(handle.clone()));
        assert!(!router.remove(handle));
        router.route(&Channel::Sessions, event);

        assert_eq!(seen.lock().expect("lock").len(), 1);
    }
}
