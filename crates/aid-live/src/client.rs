use crate::config::LiveConfig;
use crate::error::TransportError;
use crate::http::HttpConnector;
use crate::router::{
    ConnectionListener, EventCategory, EventListener, EventRouter, ListenerHandle, ListenerScope,
    RoutedEvent,
};
use crate::transport::{ConnectionChange, ConnectionState, Connector, EventTransport, TransportEvent};
use aid_core::event_wire::Channel;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// What [`LiveClient::next_event`] hands back after routing.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Routed(RoutedEvent),
    Connection(ConnectionChange),
}

/// Event service: owns the transport and the router, and is driven by a
/// single consumer calling [`LiveClient::next_event`].
pub struct LiveClient {
    transport: EventTransport,
    events: mpsc::Receiver<TransportEvent>,
    router: EventRouter,
    states: HashMap<Channel, ConnectionState>,
    pinned: HashSet<Channel>,
}

impl LiveClient {
    pub fn new(config: &LiveConfig, connector: Arc<dyn Connector>) -> Self {
        let (transport, events) = EventTransport::new(
            connector,
            config.reconnect.clone(),
            config.max_frame_bytes,
            config.event_queue_capacity,
        );
        Self {
            transport,
            events,
            router: EventRouter::new(),
            states: HashMap::new(),
            pinned: HashSet::new(),
        }
    }

    pub fn with_http(config: &LiveConfig) -> Result<Self, TransportError> {
        let connector = HttpConnector::new(&config.api_base_url, config.request_timeout)?;
        Ok(Self::new(config, Arc::new(connector)))
    }

    pub fn start(&mut self) {
        self.transport.start();
    }

    pub fn stop(&mut self) {
        self.transport.stop();
        for state in self.states.values_mut() {
            *state = ConnectionState::Disconnected;
        }
    }

    /// Keeps `channel` open independent of listeners; events arrive through
    /// [`LiveClient::next_event`].
    pub fn open(&mut self, channel: &Channel) {
        self.pinned.insert(channel.clone());
        self.transport.connect(channel);
    }

    pub fn close(&mut self, channel: &Channel) {
        self.pinned.remove(channel);
        if !self.router.has_channel_listeners(channel) {
            self.drop_channel(channel);
        }
    }

    /// Registers a listener for one channel, connecting it on demand.
    pub fn subscribe<L>(&mut self, channel: &Channel, listener: L) -> ListenerHandle
    where
        L: EventListener + 'static,
    {
        let handle = self.router.on_channel(channel, listener);
        self.transport.connect(channel);
        handle
    }

    /// Removes a listener; a channel left with no listeners is closed unless
    /// it was opened explicitly.
    pub fn unsubscribe(&mut self, handle: ListenerHandle) -> bool {
        let channel = match handle.scope() {
            ListenerScope::Channel(channel) => Some(channel.clone()),
            _ => None,
        };
        let removed = self.router.remove(handle);
        if let Some(channel) = channel {
            if removed && !self.router.has_channel_listeners(&channel) && !self.pinned.contains(&channel) {
                self.drop_channel(&channel);
            }
        }
        removed
    }

    pub fn on_category<L>(&mut self, category: EventCategory, listener: L) -> ListenerHandle
    where
        L: EventListener + 'static,
    {
        self.router.on_category(category, listener)
    }

    pub fn on_session<L>(&mut self, session_id: &str, listener: L) -> ListenerHandle
    where
        L: EventListener + 'static,
    {
        self.router.on_session(session_id, listener)
    }

    pub fn on_connection<L>(&mut self, listener: L) -> ListenerHandle
    where
        L: ConnectionListener + 'static,
    {
        self.router.on_connection(listener)
    }

    /// Waits for the next transport event, delivers it to listeners and
    /// returns it. Unknown or malformed frames are skipped. `None` once the
    /// transport has shut down for good.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            match self.events.recv().await? {
                TransportEvent::Frame { channel, event } => {
                    if !self.transport.has_channel(&channel) {
                        debug!(event = "client_frame_after_close", channel = %channel);
                        continue;
                    }
                    if let Some(routed) = self.router.route(&channel, event) {
                        return Some(ClientEvent::Routed(routed));
                    }
                }
                TransportEvent::Connection(change) => {
                    if !self.transport.has_channel(&change.channel) {
                        continue;
                    }
                    self.states.insert(change.channel.clone(), change.state);
                    self.router.notify_connection(&change);
                    return Some(ClientEvent::Connection(change));
                }
            }
        }
    }

    pub fn retry(&mut self) {
        self.transport.retry();
    }

    /// `true` while at least one channel holds a live connection.
    pub fn is_connected(&self) -> bool {
        self.states
            .values()
            .any(|state| matches!(state, ConnectionState::Connected { .. }))
    }

    /// `true` when any channel gave up reconnecting and awaits [`LiveClient::retry`].
    pub fn is_disabled(&self) -> bool {
        self.transport
            .channels()
            .any(|channel| self.transport.is_disabled(channel))
    }

    pub fn connection_state(&self, channel: &Channel) -> ConnectionState {
        self.states
            .get(channel)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn transport(&self) -> &EventTransport {
        &self.transport
    }

    fn drop_channel(&mut self, channel: &Channel) {
        self.transport.disconnect(channel);
        self.states.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::router::DomainEvent;
    use crate::transport::{ByteStream, ConnectRequest};
    use aid_core::event_wire::{encode_event, WireEvent};
    use futures_util::future::BoxFuture;
    use futures_util::StreamExt;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves the same frames on every connection, then keeps the stream open.
    struct StaticConnector {
        frames: Vec<WireEvent>,
    }

    impl Connector for StaticConnector {
        fn connect(&self, _request: ConnectRequest) -> BoxFuture<'static, Result<ByteStream, TransportError>> {
            let chunks: Vec<Result<Vec<u8>, TransportError>> = self
                .frames
                .iter()
                .map(|frame| Ok(encode_event(frame).into_bytes()))
                .collect();
            Box::pin(async move {
                let stream: ByteStream = futures_util::stream::iter(chunks)
                    .chain(futures_util::stream::pending())
                    .boxed();
                Ok(stream)
            })
        }
    }

    fn config() -> LiveConfig {
        LiveConfig {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                max_attempts: 1,
            },
            ..LiveConfig::default()
        }
    }

    #[tokio::test]
    async fn subscribe_connects_and_routes_in_order() {
        let frames = vec![
            WireEvent::new("session.started", serde_json::json!({"session_id": "s1"})).with_id("1"),
            WireEvent::new("something.new", serde_json::json!({"session_id": "s1"})).with_id("2"),
            WireEvent::new(
                "llm.stream.chunk",
                serde_json::json!({"stream_type": "thought", "chunk": "Investigating", "stage_execution_id": "e1"}),
            )
            .with_id("3"),
        ];
        let mut client = LiveClient::new(&config(), Arc::new(StaticConnector { frames }));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let channel = Channel::session("s1");
        let _handle = client.subscribe(&channel, move |event: &RoutedEvent| {
            sink.lock().expect("lock").push(event.event.category());
        });
        let connections = Arc::new(Mutex::new(Vec::new()));
        let connection_sink = Arc::clone(&connections);
        let _conn = client.on_connection(move |change: &ConnectionChange| {
            connection_sink.lock().expect("lock").push(change.connected());
        });
        client.start();

        match client.next_event().await {
            Some(ClientEvent::Connection(change)) => assert!(change.connected()),
            other => panic!("expected connection change, got {other:?}"),
        }
        assert!(client.is_connected());
        match client.next_event().await {
            Some(ClientEvent::Routed(routed)) => assert_eq!(routed.event_id.as_deref(), Some("1")),
            other => panic!("unexpected {other:?}"),
        }
        match client.next_event().await {
            Some(ClientEvent::Routed(RoutedEvent {
                event: DomainEvent::StreamChunk { session_id, chunk },
                ..
            })) => {
                assert_eq!(session_id.as_deref(), Some("s1"));
                assert_eq!(chunk.stream_key, "e1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![EventCategory::SessionLifecycle, EventCategory::StreamChunk]
        );
        assert_eq!(*connections.lock().expect("lock"), vec![true]);
        assert_eq!(client.router().dropped(), 1);
    }

    #[tokio::test]
    async fn last_unsubscribe_closes_the_channel() {
        let mut client = LiveClient::new(&config(), Arc::new(StaticConnector { frames: Vec::new() }));
        let channel = Channel::session("s1");
        let first = client.subscribe(&channel, |_: &RoutedEvent| {});
        let second = client.subscribe(&channel, |_: &RoutedEvent| {});
        assert!(client.transport().has_channel(&channel));

        assert!(client.unsubscribe(first));
        assert!(client.transport().has_channel(&channel));
        assert!(client.unsubscribe(second));
        assert!(!client.transport().has_channel(&channel));
    }

    #[tokio::test]
    async fn opened_channel_survives_unsubscribe() {
        let mut client = LiveClient::new(&config(), Arc::new(StaticConnector { frames: Vec::new() }));
        client.open(&Channel::Sessions);
        let handle = client.subscribe(&Channel::Sessions, |_: &RoutedEvent| {});
        assert!(client.unsubscribe(handle));
        assert!(client.transport().has_channel(&Channel::Sessions));
        client.close(&Channel::Sessions);
        assert!(!client.transport().has_channel(&Channel::Sessions));
        assert_eq!(client.connection_state(&Channel::Sessions), ConnectionState::Disconnected);
    }
}
