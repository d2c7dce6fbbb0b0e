//! Purpose: Define a stable, structured schema for CLI notices (state transitions).
//! Exports: `Notice`, `notice_json`, `state_notice`, `notice_time_now`.
//! Role: Shared contract helper for `cqrpc watch` output and CLI diagnostics.
//! Invariants: JSON schema is stable once published; fields are additive-only.
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};

use crate::core::state::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub target: String,
    pub message: String,
    pub details: Map<String, Value>,
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("cmd".to_string(), json!(notice.cmd));
    inner.insert("target".to_string(), json!(notice.target));
    inner.insert("message".to_string(), json!(notice.message));
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}

/// Notice for one observed connection-state transition.
pub fn state_notice(cmd: &str, target: &str, state: ConnectionState, seq: u64) -> Notice {
    let mut details = Map::new();
    details.insert("state".to_string(), json!(state.as_str()));
    details.insert("seq".to_string(), json!(seq));
    Notice {
        kind: "state".to_string(),
        time: notice_time_now().unwrap_or_default(),
        cmd: cmd.to_string(),
        target: target.to_string(),
        message: format!("connection state is {state}"),
        details,
    }
}

/// Current time as RFC 3339, or `None` if the clock is before the epoch.
pub fn notice_time_now() -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}
