//! Metrics sandbox push-protocol wire contracts.
//!
//! One websocket text frame carries exactly one JSON object of the shape
//! `{"action": "...", "message": "...", "data": {...}}`. Observers send
//! [`ClientMessage`] frames; the service answers with [`StatusEvent`] frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outbound event tags pushed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// The label assigned to a freshly started create pipeline.
    AppLabel,
    Status,
    Progress,
    /// Public link of the sandbox, with a pre-filled query window.
    Link,
    /// One line of init-step output.
    Log,
    /// Quota snapshot; the message is the JSON encoding of [`QuotaSnapshot`].
    Rquota,
    Done,
    /// Recoverable, user-actionable failure carrying captured container output.
    Error,
    /// Pipeline aborted for an infrastructure reason.
    Failure,
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppLabel => "app-label",
            Self::Status => "status",
            Self::Progress => "progress",
            Self::Link => "link",
            Self::Log => "log",
            Self::Rquota => "rquota",
            Self::Done => "done",
            Self::Error => "error",
            Self::Failure => "failure",
        }
    }

    /// Whether the event ends a pipeline instance as seen by the observer.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Failure)
    }
}

/// The wire unit pushed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub action: Action,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,
}

impl StatusEvent {
    #[must_use]
    pub fn new(action: Action, message: impl Into<String>) -> Self {
        Self {
            action,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches one key/value pair to the event payload.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn quota(snapshot: QuotaSnapshot) -> Self {
        Self::new(Action::Rquota, snapshot.to_message())
            .with_data("used", snapshot.used.to_string())
            .with_data("hard", snapshot.hard.to_string())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Inbound command tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    Connect,
    /// Message carries the run reference URL.
    New,
    /// Message carries the app label to tear down.
    Delete,
}

impl ClientAction {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "connect" => Some(Self::Connect),
            "new" => Some(Self::New),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Raw inbound frame. The action stays a string so unknown tags can be logged
/// and skipped instead of failing the read loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub action: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,
}

impl ClientMessage {
    #[must_use]
    pub fn new(action: &str, message: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn client_action(&self) -> Option<ClientAction> {
        ClientAction::parse(self.action.as_str())
    }
}

/// Point-in-time mirror of the cluster pod-count quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub used: i64,
    pub hard: i64,
}

impl QuotaSnapshot {
    #[must_use]
    pub fn new(used: i64, hard: i64) -> Self {
        Self { used, hard }
    }

    #[must_use]
    pub fn to_message(&self) -> String {
        format!("{{\"used\":{},\"hard\":{}}}", self.used, self.hard)
    }
}
