//! Control channel protocol between a worker and the supervisor.
//!
//! Messages are JSON-serialized and newline-delimited, written by the
//! worker on its stdout:
//!
//! ```text
//! {"command":"listening","workerId":3}
//! {"command":"request-replacement","workerId":3,"reason":"Request count limit of 100 reached!"}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RotaError;

/// Environment variable carrying a worker's id into the worker process.
pub const WORKER_ID_ENV: &str = "ROTA_WORKER_ID";

/// Identity of a worker, unique for the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Read the worker id from the environment.
    ///
    /// Returns `Ok(None)` in the supervisor process, where the variable is
    /// unset.
    pub fn from_env() -> Result<Option<Self>, RotaError> {
        match std::env::var(WORKER_ID_ENV) {
            Ok(raw) => raw.parse().map(Some),
            Err(_) => Ok(None),
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = RotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse()
            .map(Self)
            .map_err(|_| RotaError::InvalidWorkerId(s.to_string()))
    }
}

/// Message from a worker to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ControlMessage {
    /// The worker's service is accepting connections.
    #[serde(rename = "listening")]
    Listening {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
    },

    /// The worker asks to be replaced by a fresh process.
    #[serde(rename = "request-replacement")]
    RequestReplacement {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
        #[serde(default)]
        reason: String,
    },
}

impl ControlMessage {
    pub fn listening(worker_id: WorkerId) -> Self {
        Self::Listening { worker_id }
    }

    pub fn request_replacement(worker_id: WorkerId, reason: impl Into<String>) -> Self {
        Self::RequestReplacement {
            worker_id,
            reason: reason.into(),
        }
    }

    /// The worker this message claims to come from.
    pub fn worker_id(&self) -> WorkerId {
        match self {
            Self::Listening { worker_id } | Self::RequestReplacement { worker_id, .. } => {
                *worker_id
            }
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("ControlMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    ///
    /// Fails for anything that is not a well-formed message: missing
    /// `command`, unknown command, or missing `workerId`.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
