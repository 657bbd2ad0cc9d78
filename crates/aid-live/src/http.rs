use crate::error::{FetchError, TransportError};
use crate::snapshot_cache::SessionFetcher;
use crate::transport::{ByteStream, ConnectRequest, Connector};
use aid_core::event_wire::Channel;
use aid_core::{SessionRecord, SessionSummary};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Streams `GET {base}/api/v1/events/{channel}` as server-sent events.
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConnector {
    /// Event streams are long-lived, so only connection setup is bounded.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Self {
            client,
            base_url: trim_base(base_url),
        })
    }

    pub fn channel_url(&self, channel: &Channel) -> String {
        format!("{}/api/v1/events/{}", self.base_url, channel)
    }
}

impl Connector for HttpConnector {
    fn connect(&self, request: ConnectRequest) -> BoxFuture<'static, Result<ByteStream, TransportError>> {
        let url = self.channel_url(&request.channel);
        let client = self.client.clone();
        Box::pin(async move {
            let mut builder = client
                .get(&url)
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache");
            if let Some(id) = request.last_event_id.as_deref() {
                builder = builder.header(LAST_EVENT_ID_HEADER, id);
            }
            let response = builder
                .send()
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Rejected(status.as_u16()));
            }
            let stream: ByteStream = response
                .bytes_stream()
                .map(|chunk| {
                    chunk
                        .map(|bytes| bytes.to_vec())
                        .map_err(|err| TransportError::Read(err.to_string()))
                })
                .boxed();
            Ok(stream)
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ActiveSessionsBody {
    List(Vec<SessionSummary>),
    Wrapped { active_sessions: Vec<SessionSummary> },
}

/// JSON client for the history API.
#[derive(Clone)]
pub struct HttpSessionFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessionFetcher {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(Self {
            client,
            base_url: trim_base(base_url),
        })
    }

    pub fn session_url(&self, session_id: &str) -> String {
        format!("{}/api/v1/history/sessions/{}", self.base_url, session_id)
    }

    pub fn active_sessions_url(&self) -> String {
        format!("{}/api/v1/history/active-sessions", self.base_url)
    }
}

async fn get_json<T>(client: reqwest::Client, url: String, not_found: Option<String>) -> Result<T, FetchError>
where
    T: serde::de::DeserializeOwned,
{
    let response = client
        .get(&url)
        .header(ACCEPT, "application/json")
        .send()
        .await
        .map_err(|err| FetchError::Network(err.to_string()))?;
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        if let Some(id) = not_found {
            return Err(FetchError::NotFound(id));
        }
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FetchError::Status {
            status: status.as_u16(),
            message: body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect(),
        });
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| FetchError::Network(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode(err.to_string()))
}

impl SessionFetcher for HttpSessionFetcher {
    fn fetch_session(&self, session_id: &str) -> BoxFuture<'static, Result<SessionRecord, FetchError>> {
        let url = self.session_url(session_id);
        let client = self.client.clone();
        let id = session_id.to_string();
        Box::pin(get_json(client, url, Some(id)))
    }

    fn fetch_active_sessions(&self) -> BoxFuture<'static, Result<Vec<SessionSummary>, FetchError>> {
        let url = self.active_sessions_url();
        let client = self.client.clone();
        Box::pin(async move {
            let body: ActiveSessionsBody = get_json(client, url, None).await?;
            Ok(match body {
                ActiveSessionsBody::List(sessions) => sessions,
                ActiveSessionsBody::Wrapped { active_sessions } => active_sessions,
            })
        })
    }
}
