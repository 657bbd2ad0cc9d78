use crate::client::{ClientEvent, LiveClient};
use crate::config::LiveConfig;
use crate::dashboard::DashboardView;
use crate::error::FetchError;
use crate::refresh::RefreshDebouncer;
use crate::session_view::{SessionView, Timeline};
use crate::snapshot_cache::{Snapshot, SnapshotCache};
use aid_core::event_wire::Channel;
use aid_core::{SessionStatus, SessionSummary};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_QUEUE_CAPACITY: usize = 16;
const UPDATE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowTarget {
    Session(String),
    Dashboard,
}

impl FollowTarget {
    pub fn channel(&self) -> Channel {
        match self {
            FollowTarget::Session(session_id) => Channel::session(session_id.clone()),
            FollowTarget::Dashboard => Channel::Sessions,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ViewUpdate {
    Timeline {
        session_id: String,
        status: Option<SessionStatus>,
        revision: u64,
        timeline: Timeline,
    },
    Dashboard {
        revision: u64,
        sessions: Arc<Vec<SessionSummary>>,
    },
    Connection {
        connected: bool,
        disabled: bool,
    },
    FetchFailed {
        session_id: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowCommand {
    Refresh,
    Retry,
    Switch(String),
    Shutdown,
}

/// Sends commands to a running [`SessionFollower`].
#[derive(Debug, Clone)]
pub struct FollowerHandle {
    commands: mpsc::Sender<FollowCommand>,
}

impl FollowerHandle {
    pub async fn send(&self, command: FollowCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub async fn refresh(&self) -> bool {
        self.send(FollowCommand::Refresh).await
    }

    pub async fn retry(&self) -> bool {
        self.send(FollowCommand::Retry).await
    }

    pub async fn switch(&self, session_id: impl Into<String>) -> bool {
        self.send(FollowCommand::Switch(session_id.into())).await
    }

    pub async fn shutdown(&self) -> bool {
        self.send(FollowCommand::Shutdown).await
    }
}

enum FetchResult {
    Session {
        session_id: String,
        result: Result<Snapshot, FetchError>,
    },
    Dashboard(Result<Vec<SessionSummary>, FetchError>),
}

enum Mode {
    Session(SessionView),
    Dashboard(DashboardView),
}

/// Drives one view from live events: routes them into the view, schedules
/// debounced snapshot refreshes, applies fetched snapshots and reports each
/// visible change as a [`ViewUpdate`].
pub struct SessionFollower {
    client: LiveClient,
    cache: Arc<SnapshotCache>,
    mode: Mode,
    debouncer: RefreshDebouncer,
    commands: mpsc::Receiver<FollowCommand>,
    updates: mpsc::Sender<ViewUpdate>,
    fetch_tx: mpsc::Sender<FetchResult>,
    fetch_rx: mpsc::Receiver<FetchResult>,
    last_connection: Option<(bool, bool)>,
}

impl SessionFollower {
    pub fn new(
        mut client: LiveClient,
        cache: Arc<SnapshotCache>,
        target: FollowTarget,
        config: &LiveConfig,
    ) -> (Self, FollowerHandle, mpsc::Receiver<ViewUpdate>) {
        client.open(&target.channel());
        let mode = match target {
            FollowTarget::Session(session_id) => {
                Mode::Session(SessionView::new(session_id, config.dedup_window))
            }
            FollowTarget::Dashboard => Mode::Dashboard(DashboardView::new()),
        };
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (updates, update_rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);
        let (fetch_tx, fetch_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let follower = Self {
            client,
            cache,
            mode,
            debouncer: RefreshDebouncer::new(config.refresh_debounce),
            commands,
            updates,
            fetch_tx,
            fetch_rx,
            last_connection: None,
        };
        (follower, FollowerHandle { commands: command_tx }, update_rx)
    }

    /// Runs until shut down, or until the update receiver is dropped.
    pub async fn run(mut self) {
        self.client.start();
        self.spawn_fetch(false);
        info!(event = "follower_start");

        loop {
            let deadline = self.debouncer.deadline();
            let keep_going = tokio::select! {
                event = self.client.next_event() => match event {
                    Some(event) => self.on_client_event(event).await,
                    None => false,
                },
                Some(fetched) = self.fetch_rx.recv() => self.on_fetch(fetched).await,
                command = self.commands.recv() => match command {
                    Some(FollowCommand::Shutdown) | None => false,
                    Some(command) => self.on_command(command).await,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let coalesced = self.debouncer.coalesced();
                    if self.debouncer.due(Instant::now()) {
                        debug!(event = "refresh_due", coalesced);
                        self.spawn_fetch(true);
                    }
                    true
                }
            };
            if !keep_going {
                break;
            }
        }

        self.client.stop();
        info!(event = "follower_stop");
    }

    async fn on_client_event(&mut self, event: ClientEvent) -> bool {
        match event {
            ClientEvent::Routed(routed) => {
                let (decision, update) = match &mut self.mode {
                    Mode::Session(view) => {
                        let before = view.revision();
                        let decision = view.on_event(&routed.event);
                        let update = (view.revision() != before).then(|| timeline_update(view));
                        (decision, update)
                    }
                    Mode::Dashboard(dashboard) => (dashboard.on_event(&routed.event), None),
                };
                if decision.is_needed() {
                    self.schedule_refresh();
                }
                match update {
                    Some(update) => self.emit(update).await,
                    None => true,
                }
            }
            ClientEvent::Connection(change) => {
                let decision = match &mut self.mode {
                    Mode::Session(view) => {
                        let decision = view.on_connection(&change);
                        // events missed while down are not all replayed
                        if decision.is_needed() {
                            self.cache.invalidate(view.session_id());
                        }
                        decision
                    }
                    Mode::Dashboard(dashboard) => dashboard.on_connection(&change),
                };
                if decision.is_needed() {
                    info!(event = "follower_reconnect_refresh", channel = %change.channel);
                    self.schedule_refresh();
                }
                let state = (self.client.is_connected(), self.client.is_disabled());
                if self.last_connection == Some(state) {
                    return true;
                }
                self.last_connection = Some(state);
                self.emit(ViewUpdate::Connection {
                    connected: state.0,
                    disabled: state.1,
                })
                .await
            }
        }
    }

    async fn on_fetch(&mut self, fetched: FetchResult) -> bool {
        let update = match fetched {
            FetchResult::Session { session_id, result } => {
                let Mode::Session(view) = &mut self.mode else {
                    return true;
                };
                match result {
                    Ok(snapshot) => {
                        if !snapshot.is_current() || view.session_id() != session_id {
                            debug!(event = "follower_snapshot_ignored", session_id = %session_id);
                            return true;
                        }
                        if !view.apply_snapshot(snapshot.record) {
                            return true;
                        }
                        timeline_update(view)
                    }
                    Err(err) => ViewUpdate::FetchFailed {
                        session_id: Some(session_id),
                        message: err.to_string(),
                    },
                }
            }
            FetchResult::Dashboard(result) => {
                let Mode::Dashboard(dashboard) = &mut self.mode else {
                    return true;
                };
                match result {
                    Ok(sessions) => {
                        if !dashboard.apply_sessions(sessions) {
                            return true;
                        }
                        ViewUpdate::Dashboard {
                            revision: dashboard.revision(),
                            sessions: dashboard.sessions(),
                        }
                    }
                    Err(err) => ViewUpdate::FetchFailed {
                        session_id: None,
                        message: err.to_string(),
                    },
                }
            }
        };
        self.emit(update).await
    }

    async fn on_command(&mut self, command: FollowCommand) -> bool {
        match command {
            FollowCommand::Refresh => {
                self.debouncer.cancel();
                self.spawn_fetch(true);
                true
            }
            FollowCommand::Retry => {
                self.client.retry();
                true
            }
            FollowCommand::Switch(session_id) => {
                let Mode::Session(view) = &mut self.mode else {
                    warn!(event = "follower_switch_ignored", session_id = %session_id);
                    return true;
                };
                let previous = Channel::session(view.session_id());
                if !view.switch_session(&session_id) {
                    return true;
                }
                let update = timeline_update(view);
                self.client.close(&previous);
                self.client.open(&Channel::session(session_id));
                self.debouncer.cancel();
                self.spawn_fetch(false);
                self.emit(update).await
            }
            FollowCommand::Shutdown => false,
        }
    }

    fn schedule_refresh(&mut self) {
        if self.debouncer.request(Instant::now()) {
            debug!(event = "refresh_scheduled");
        }
    }

    fn spawn_fetch(&self, force_refresh: bool) {
        let tx = self.fetch_tx.clone();
        match &self.mode {
            Mode::Session(view) => {
                let cache = Arc::clone(&self.cache);
                let session_id = view.session_id().to_string();
                tokio::spawn(async move {
                    let result = cache.load(&session_id, force_refresh).await;
                    let _ = tx.send(FetchResult::Session { session_id, result }).await;
                });
            }
            Mode::Dashboard(_) => {
                let fetch = self.cache.fetcher().fetch_active_sessions();
                tokio::spawn(async move {
                    let _ = tx.send(FetchResult::Dashboard(fetch.await)).await;
                });
            }
        }
    }

    async fn emit(&mut self, update: ViewUpdate) -> bool {
        self.updates.send(update).await.is_ok()
    }
}

fn timeline_update(view: &SessionView) -> ViewUpdate {
    ViewUpdate::Timeline {
        session_id: view.session_id().to_string(),
        status: view.snapshot().map(|record| record.status),
        revision: view.revision(),
        timeline: view.timeline(),
    }
}
