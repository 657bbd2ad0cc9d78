//! Live session client: keeps a session view in sync with the server by
//! combining pushed events, transient streaming text and periodic snapshot
//! refreshes.

pub mod client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod follow;
pub mod http;
pub mod reconcile;
pub mod refresh;
pub mod router;
pub mod session_view;
pub mod snapshot_cache;
pub mod streaming;
pub mod transport;

pub use client::{ClientEvent, LiveClient};
pub use config::{LiveConfig, ReconnectPolicy};
pub use dashboard::DashboardView;
pub use error::{FetchError, TransportError};
pub use follow::{FollowCommand, FollowTarget, FollowerHandle, SessionFollower, ViewUpdate};
pub use http::{HttpConnector, HttpSessionFetcher};
pub use reconcile::{reconcile, ClaimKey, ClaimedSet, ReconcileOutcome};
pub use refresh::RefreshDebouncer;
pub use router::{DomainEvent, EventCategory, EventRouter, ListenerHandle, RoutedEvent};
pub use session_view::{RefreshDecision, SessionView, Timeline};
pub use snapshot_cache::{SessionFetcher, Snapshot, SnapshotCache, SnapshotSource};
pub use streaming::{StreamChunk, StreamType, StreamingBuffer, StreamingItem, StreamingItems};
pub use transport::{
    ByteStream, ConnectRequest, ConnectionChange, ConnectionState, Connector, EventTransport,
    TransportEvent,
};
