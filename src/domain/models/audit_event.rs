//! AuditEvent — append-only decision record (`spec.md` §3, §4.2).
//!
//! Not consulted by the control path; exists purely for post-hoc analysis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    User(String),
    Job(String),
}

impl Actor {
    #[must_use]
    pub fn as_str(&self) -> String {
        match self {
            Self::System => "system".to_string(),
            Self::User(name) => format!("user:{name}"),
            Self::Job(name) => format!("job:{name}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub actor: Actor,
    pub event_kind: String,
    pub subject_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

impl AuditEvent {
    #[must_use]
    pub fn new(
        actor: Actor,
        event_kind: impl Into<String>,
        subject_id: Option<Uuid>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self { id: Uuid::new_v4(), ts: now, actor, event_kind: event_kind.into(), subject_id, payload }
    }
}
