use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod event_wire;
pub mod timeline;

/// Authoritative session record as returned by the history API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub session_id: String,
    #[serde(default)]
    pub alert_type: Option<String>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub started_at_us: Option<i64>,
    #[serde(default)]
    pub completed_at_us: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub final_analysis: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageExecution>,
}

impl SessionRecord {
    pub fn stage(&self, execution_id: &str) -> Option<&StageExecution> {
        self.stages
            .iter()
            .find(|stage| stage.execution_id == execution_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageExecution {
    #[serde(deserialize_with = "deserialize_id")]
    pub execution_id: String,
    #[serde(default)]
    pub stage_id: Option<String>,
    pub stage_name: String,
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default)]
    pub started_at_us: Option<i64>,
    #[serde(default)]
    pub completed_at_us: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interaction {
    Llm(LlmInteraction),
    Mcp(McpInteraction),
}

impl Interaction {
    pub fn timestamp_us(&self) -> i64 {
        match self {
            Interaction::Llm(llm) => llm.timestamp_us,
            Interaction::Mcp(mcp) => mcp.timestamp_us,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmInteraction {
    pub timestamp_us: i64,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub response_text: Option<String>,
    #[serde(default = "default_success")]
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpInteraction {
    pub timestamp_us: i64,
    pub communication_type: McpCommunication,
    pub server_name: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default = "default_success")]
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum McpCommunication {
    ToolCall,
    ToolList,
}

/// Entry in the dashboard's active-session list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    #[serde(deserialize_with = "deserialize_id")]
    pub session_id: String,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub alert_type: Option<String>,
    #[serde(default)]
    pub started_at_us: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "in_progress" | "inprogress" | "running" => Ok(SessionStatus::InProgress),
            "completed" | "done" => Ok(SessionStatus::Completed),
            "failed" | "error" => Ok(SessionStatus::Failed),
            "cancelled" | "canceled" => Ok(SessionStatus::Cancelled),
            other => Err(format!("Unknown session status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Failed,
    Partial,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Active => "active",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn us_to_datetime(value: i64) -> Option<DateTime<Utc>> {
    let secs = value.div_euclid(1_000_000);
    let nanos = (value.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

fn default_success() -> bool {
    true
}

/// Deserialize an ID that can be either a string or a number into a String
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Like [`deserialize_id`], with `null` mapping to `None`. Pair with
/// `#[serde(default)]` so a missing field is `None` too.
pub fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(serde::de::Error::custom("expected string, number or null for id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_record_parses_with_numeric_ids_and_defaults() {
        let record: SessionRecord = serde_json::from_str(
            r#"{
                "session_id": 42,
                "status": "in_progress",
                "stages": [{
                    "execution_id": "exec-1",
                    "stage_name": "data-collection",
                    "status": "active",
                    "interactions": [
                        {"type": "llm", "timestamp_us": 10, "response_text": "Thought: look"},
                        {"type": "mcp", "timestamp_us": 20, "communication_type": "tool_call",
                         "server_name": "kubernetes", "tool_name": "pods_list"}
                    ]
                }]
            }"#,
        )
        .expect("parse session");

        assert_eq!(record.session_id, "42");
        assert_eq!(record.status, SessionStatus::InProgress);
        let stage = record.stage("exec-1").expect("stage");
        assert_eq!(stage.interactions.len(), 2);
        assert_eq!(stage.interactions[1].timestamp_us(), 20);
        match &stage.interactions[0] {
            Interaction::Llm(llm) => assert!(llm.success),
            other => panic!("unexpected interaction: {other:?}"),
        }
    }

    #[test]
    fn status_parsing_is_lenient() {
        assert_eq!(
            "In-Progress".parse::<SessionStatus>(),
            Ok(SessionStatus::InProgress)
        );
        assert_eq!("canceled".parse::<SessionStatus>(), Ok(SessionStatus::Cancelled));
        assert!("exploded".parse::<SessionStatus>().is_err());
        assert!(SessionStatus::Pending.is_active());
        assert!(SessionStatus::Failed.is_terminal());
    }

    #[test]
    fn micros_convert_to_datetime() {
        let at = us_to_datetime(1_707_335_222_000_000).expect("datetime");
        assert_eq!(at.timestamp(), 1_707_335_222);
    }

    #[derive(Debug, Deserialize)]
    struct Ids {
        #[serde(default, deserialize_with = "deserialize_optional_id")]
        stage_execution_id: Option<String>,
    }

    #[test]
    fn optional_ids_accept_numbers_null_and_absence() {
        let parse = |raw: &str| serde_json::from_str::<Ids>(raw).map(|ids| ids.stage_execution_id);
        assert_eq!(parse(r#"{"stage_execution_id": 42}"#).expect("number"), Some("42".to_string()));
        assert_eq!(parse(r#"{"stage_execution_id": "exec-1"}"#).expect("string"), Some("exec-1".to_string()));
        assert_eq!(parse(r#"{"stage_execution_id": null}"#).expect("null"), None);
        assert_eq!(parse("{}").expect("missing"), None);
        assert!(parse(r#"{"stage_execution_id": [1]}"#).is_err());
    }
}
