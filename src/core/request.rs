//! Top-level requests submitted by a transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Create a new unique request identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Who submitted a request and where the answer should go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterContext {
    pub user: Option<String>,
    pub channel: Option<String>,
}

impl RequesterContext {
    pub fn new(user: Option<&str>, channel: Option<&str>) -> Self {
        Self {
            user: user.map(str::to_string),
            channel: channel.map(str::to_string),
        }
    }
}

/// Overall status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Some tasks are still running or waiting.
    Active,
    /// Every task succeeded.
    Succeeded,
    /// At least one task succeeded and at least one failed.
    Partial,
    /// No task succeeded.
    Failed,
    /// Cancelled by its originator.
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Active)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::Active => "active",
            RequestStatus::Succeeded => "succeeded",
            RequestStatus::Partial => "partial",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A request as submitted by the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// The raw user input.
    pub input: String,
    pub requester: RequesterContext,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new(input: &str, requester: RequesterContext) -> Self {
        Self {
            id: RequestId::new(),
            input: input.to_string(),
            requester,
            status: RequestStatus::Active,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record the final status once aggregated.
    pub fn finish(&mut self, status: RequestStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}
