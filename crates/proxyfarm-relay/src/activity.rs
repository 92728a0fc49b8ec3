//! Structured relay events for observers

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Bound,
    BindFailed,
    Stopped,
    ConnectionClosed,
    UpstreamFailed,
}

/// Bytes relayed by one connection pair. `up` is client to upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ByteCounters {
    pub up: u64,
    pub down: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayActivity {
    pub entry_port: u16,
    pub kind: ActivityKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname_guess: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<ByteCounters>,
}

impl RelayActivity {
    pub fn new(entry_port: u16, kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            entry_port,
            kind,
            timestamp: Utc::now(),
            message: message.into(),
            hostname_guess: None,
            bytes: None,
        }
    }

    pub fn closed(
        entry_port: u16,
        message: impl Into<String>,
        hostname_guess: Option<String>,
        bytes: ByteCounters,
    ) -> Self {
        Self {
            hostname_guess,
            bytes: Some(bytes),
            ..Self::new(entry_port, ActivityKind::ConnectionClosed, message)
        }
    }
}
