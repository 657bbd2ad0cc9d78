use crate::config::ReconnectPolicy;
use crate::error::TransportError;
use aid_core::event_wire::{Channel, DecodeReport, SseFrameDecoder, WireEvent};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub channel: Channel,
    /// Last event id seen on this channel; the server replays from there.
    pub last_event_id: Option<String>,
}

/// Opens the raw byte stream behind one channel.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<ByteStream, TransportError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected { reconnected: bool },
    Disconnected,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChange {
    pub channel: Channel,
    pub state: ConnectionState,
}

impl ConnectionChange {
    pub fn connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    pub fn is_reconnect(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { reconnected: true })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connection(ConnectionChange),
    Frame { channel: Channel, event: WireEvent },
}

#[derive(Debug, Default)]
struct ChannelShared {
    last_event_id: Mutex<Option<String>>,
    ever_connected: AtomicBool,
    connected: AtomicBool,
    disabled: AtomicBool,
}

impl ChannelShared {
    fn last_event_id(&self) -> Option<String> {
        self.last_event_id
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(None)
    }

    fn set_last_event_id(&self, id: &str) {
        if let Ok(mut guard) = self.last_event_id.lock() {
            *guard = Some(id.to_string());
        }
    }
}

struct ChannelSlot {
    shared: Arc<ChannelShared>,
    task: Option<JoinHandle<()>>,
}

/// One persistent server-push connection per channel, each driven by its own
/// task. All tasks feed a single queue so the consumer sees events in arrival
/// order per channel.
pub struct EventTransport {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    max_frame_bytes: usize,
    tx: mpsc::Sender<TransportEvent>,
    channels: HashMap<Channel, ChannelSlot>,
    running: bool,
}

impl EventTransport {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        max_frame_bytes: usize,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let transport = Self {
            connector,
            policy,
            max_frame_bytes,
            tx,
            channels: HashMap::new(),
            running: false,
        };
        (transport, rx)
    }

    /// Starts connecting every channel requested so far. Must run inside a
    /// tokio runtime.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        let pending: Vec<Channel> = self
            .channels
            .iter()
            .filter(|(_, slot)| slot.task.is_none())
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in pending {
            self.spawn_channel(&channel);
        }
        info!(event = "transport_start", channels = self.channels.len());
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        for slot in self.channels.values_mut() {
            if let Some(task) = slot.task.take() {
                task.abort();
            }
            slot.shared.connected.store(false, Ordering::SeqCst);
        }
        info!(event = "transport_stop", channels = self.channels.len());
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Opens `channel` on demand. Already-known channels are left alone.
    pub fn connect(&mut self, channel: &Channel) {
        if self.channels.contains_key(channel) {
            return;
        }
        self.channels.insert(
            channel.clone(),
            ChannelSlot {
                shared: Arc::new(ChannelShared::default()),
                task: None,
            },
        );
        if self.running {
            self.spawn_channel(channel);
        }
    }

    pub fn disconnect(&mut self, channel: &Channel) -> bool {
        let Some(mut slot) = self.channels.remove(channel) else {
            return false;
        };
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        info!(event = "channel_closed", channel = %channel);
        true
    }

    /// Manual retry: re-enables disabled channels and reconnects every known
    /// channel with a fresh backoff sequence. Replay markers are kept.
    pub fn retry(&mut self) {
        let channels: Vec<Channel> = self.channels.keys().cloned().collect();
        info!(event = "transport_manual_retry", channels = channels.len());
        self.running = true;
        for channel in channels {
            if let Some(slot) = self.channels.get_mut(&channel) {
                if let Some(task) = slot.task.take() {
                    task.abort();
                }
                slot.shared.connected.store(false, Ordering::SeqCst);
                slot.shared.disabled.store(false, Ordering::SeqCst);
            }
            self.spawn_channel(&channel);
        }
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.keys()
    }

    pub fn is_connected(&self, channel: &Channel) -> bool {
        self.channels
            .get(channel)
            .map(|slot| slot.shared.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn is_disabled(&self, channel: &Channel) -> bool {
        self.channels
            .get(channel)
            .map(|slot| slot.shared.disabled.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn last_event_id(&self, channel: &Channel) -> Option<String> {
        self.channels
            .get(channel)
            .and_then(|slot| slot.shared.last_event_id())
    }

    fn spawn_channel(&mut self, channel: &Channel) {
        let Some(slot) = self.channels.get_mut(channel) else {
            return;
        };
        let task = tokio::spawn(channel_loop(
            channel.clone(),
            Arc::clone(&self.connector),
            self.policy.clone(),
            self.max_frame_bytes,
            self.tx.clone(),
            Arc::clone(&slot.shared),
        ));
        slot.task = Some(task);
    }
}

impl Drop for EventTransport {
    fn drop(&mut self) {
        for slot in self.channels.values_mut() {
            if let Some(task) = slot.task.take() {
                task.abort();
            }
        }
    }
}

async fn channel_loop(
    channel: Channel,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    max_frame_bytes: usize,
    tx: mpsc::Sender<TransportEvent>,
    shared: Arc<ChannelShared>,
) {
    let mut attempts: u32 = 0;

    loop {
        let request = ConnectRequest {
            channel: channel.clone(),
            last_event_id: shared.last_event_id(),
        };
        match connector.connect(request).await {
            Ok(mut stream) => {
                let connected_at = Instant::now();
                let mut delivered = false;
                let reconnected = shared.ever_connected.swap(true, Ordering::SeqCst);
                shared.connected.store(true, Ordering::SeqCst);
                info!(event = "channel_connected", channel = %channel, reconnected);
                let change = ConnectionChange {
                    channel: channel.clone(),
                    state: ConnectionState::Connected { reconnected },
                };
                if tx.send(TransportEvent::Connection(change)).await.is_err() {
                    return;
                }

                let mut decoder = SseFrameDecoder::new(max_frame_bytes);
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            let report = decoder.push_chunk(&bytes);
                            delivered |= !report.frames.is_empty();
                            if !forward_report(&channel, report, &tx, &shared).await {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(event = "channel_read_error", channel = %channel, error = %err);
                            break;
                        }
                    }
                }
                let tail = decoder.finish();
                delivered |= !tail.frames.is_empty();
                if !forward_report(&channel, tail, &tx, &shared).await {
                    return;
                }
                shared.connected.store(false, Ordering::SeqCst);

                // a connection that drops before delivering anything counts
                // as a failed attempt
                let healthy = delivered || connected_at.elapsed() >= policy.max_delay;
                if healthy {
                    attempts = 0;
                }
                info!(event = "channel_disconnected", channel = %channel, healthy);
                let change = ConnectionChange {
                    channel: channel.clone(),
                    state: ConnectionState::Disconnected,
                };
                if tx.send(TransportEvent::Connection(change)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(event = "channel_connect_error", channel = %channel, attempt = attempts, error = %err);
            }
        }

        if policy.is_exhausted(attempts) {
            shared.disabled.store(true, Ordering::SeqCst);
            warn!(event = "channel_disabled", channel = %channel, attempts);
            let change = ConnectionChange {
                channel: channel.clone(),
                state: ConnectionState::Disabled,
            };
            let _ = tx.send(TransportEvent::Connection(change)).await;
            return;
        }

        let delay = policy.delay_for_attempt(attempts);
        attempts += 1;
        debug!(
            event = "channel_backoff",
            channel = %channel,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64
        );
        tokio::time::sleep(delay).await;
    }
}

async fn forward_report(
    channel: &Channel,
    report: DecodeReport,
    tx: &mpsc::Sender<TransportEvent>,
    shared: &ChannelShared,
) -> bool {
    for err in report.errors {
        warn!(event = "channel_decode_error", channel = %channel, error = %err);
    }
    for event in report.frames {
        if let Some(id) = event.id.as_deref() {
            shared.set_last_event_id(id);
        }
        let frame = TransportEvent::Frame {
            channel: channel.clone(),
            event,
        };
        if tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}
