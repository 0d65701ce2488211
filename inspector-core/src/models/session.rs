use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Lookup attributes: name -> one or more identifying values.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// Per-session options, JSON encoded at rest.
pub type Options = HashMap<String, serde_json::Value>;

/// Reserved attribute holding the MAC addresses of a node's ports.
pub const MACS_ATTRIBUTE: &str = "mac";

/// Attribute holding the management controller address.
pub const BMC_ADDRESS_ATTRIBUTE: &str = "bmc_address";

/// Error recorded for sessions force-finished by the sweep.
pub const TIMEOUT_ERROR: &str = "Introspection timeout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Distinct for every `create` of the same id; never reused.
    pub generation: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Session {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Raw `sessions` row. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub generation: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            generation: row.generation,
            started_at: row.started_at.and_then(from_millis).unwrap_or_default(),
            finished_at: row.finished_at.and_then(from_millis),
            error: row.error,
        }
    }
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}
