//! Purpose: Engine tunables shared by `AsyncClient` and `AsyncServer`.
//! Exports: `EngineConfig`.
//! Role: Plain serde model; JSON is the only accepted external form.
//! Invariants: Every field has a default, so `{}` is a valid configuration.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

const DEFAULT_STATE_WATCH_INTERVAL_MS: u64 = 1000;
const DEFAULT_PUMP_THREAD_NAME: &str = "cqrpc-pump";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Deadline for one connectivity watch; an expired watch is re-armed.
    pub state_watch_interval_ms: u64,
    pub pump_thread_name: String,
}

impl EngineConfig {
    pub fn from_json_str(input: &str) -> Result<Self, Error> {
        let config: EngineConfig = serde_json::from_str(input).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid engine config")
                .with_source(err)
        })?;
        if config.state_watch_interval_ms == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("state_watch_interval_ms must be greater than zero"));
        }
        Ok(config)
    }

    pub fn state_watch_interval(&self) -> Duration {
        Duration::from_millis(self.state_watch_interval_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_watch_interval_ms: DEFAULT_STATE_WATCH_INTERVAL_MS,
            pump_thread_name: DEFAULT_PUMP_THREAD_NAME.to_string(),
        }
    }
}
