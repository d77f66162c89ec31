use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Owning tenant of assistants, phone numbers and calls.
pub type OwnerId = i64;

/// Platform-reported progress of a call.  `Ended` and `Failed` are terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallStatus {
    Queued,
    Ringing,
    InProgress,
    Forwarding,
    Ended,
    Failed,
    Other(String),
}

impl CallStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => Self::Queued,
            "ringing" => Self::Ringing,
            "in-progress" => Self::InProgress,
            "forwarding" => Self::Forwarding,
            "ended" => Self::Ended,
            "failed" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Ringing => "ringing",
            Self::InProgress => "in-progress",
            Self::Forwarding => "forwarding",
            Self::Ended => "ended",
            Self::Failed => "failed",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Position along queued -> ringing -> in-progress.  Statuses the platform may add later
    /// rank lowest so they never pull a call backwards.
    pub fn progress_rank(&self) -> u8 {
        match self {
            Self::Other(_) => 0,
            Self::Queued => 1,
            Self::Ringing => 2,
            Self::InProgress | Self::Forwarding => 3,
            Self::Ended | Self::Failed => 4,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CallStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CallStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Answered,
    AnsweredBrief,
    Voicemail,
    NoAnswer,
    Busy,
    Declined,
    Failed,
    InProgress,
    Ringing,
    Unknown,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::AnsweredBrief => "answered-brief",
            Self::Voicemail => "voicemail",
            Self::NoAnswer => "no-answer",
            Self::Busy => "busy",
            Self::Declined => "declined",
            Self::Failed => "failed",
            Self::InProgress => "in-progress",
            Self::Ringing => "ringing",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let status = match raw {
            "answered" => Self::Answered,
            "answered-brief" => Self::AnsweredBrief,
            "voicemail" => Self::Voicemail,
            "no-answer" => Self::NoAnswer,
            "busy" => Self::Busy,
            "declined" => Self::Declined,
            "failed" => Self::Failed,
            "in-progress" => Self::InProgress,
            "ringing" => Self::Ringing,
            "unknown" => Self::Unknown,
            _ => return None,
        };
        Some(status)
    }
}

/// Business-meaningful classification of a call plus its human-readable explanation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub description: String,
}

impl Outcome {
    pub fn new(status: OutcomeStatus, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Assistant,
    User,
    System,
    Tool,
    Other(String),
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "assistant" | "bot" | "ai" => Self::Assistant,
            "user" | "customer" => Self::User,
            "system" => Self::System,
            "tool" | "tool_calls" | "tool_call_result" => Self::Tool,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::System => "system",
            Self::Tool => "tool",
            Self::Other(raw) => raw,
        }
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// One spoken turn in the canonical transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assistant {
    pub id: Uuid,
    pub owner: OwnerId,
    pub external_id: String,
    pub campaign: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub id: Uuid,
    pub owner: OwnerId,
    pub external_id: String,
    pub number: String,
    pub campaign: Option<i64>,
}

/// One outbound interview call.  Mutated only through `call_state::merge`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub external_id: String,
    pub owner: OwnerId,
    pub assistant: Uuid,
    pub phone_number: Uuid,
    pub campaign: Option<i64>,
    pub customer_number: String,
    pub status: CallStatus,
    /// Informational side-state; does not replace `status` for duration or outcome.
    pub transferred: bool,
    pub transfer_destination: Option<Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub duration_seconds: Option<i64>,
    pub transcript: Vec<TranscriptEntry>,
    pub transcript_text: Option<String>,
    pub recording_url: Option<String>,
    /// Local path of the downloaded recording artifact.
    pub recording_file: Option<String>,
    pub outcome_status: Option<OutcomeStatus>,
    pub outcome_description: Option<String>,
    pub end_reason: Option<String>,
    pub cost: Option<Decimal>,
    pub cost_breakdown: Option<Value>,
    pub raw_call_data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl CallRecord {
    /// Fresh record for a call the platform just accepted.
    pub fn placed(
        external_id: String,
        assistant: &Assistant,
        phone_number: &PhoneNumber,
        customer_number: String,
        status: CallStatus,
        raw_call_data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id,
            owner: assistant.owner,
            assistant: assistant.id,
            phone_number: phone_number.id,
            campaign: assistant.campaign.or(phone_number.campaign),
            customer_number,
            status,
            transferred: false,
            transfer_destination: None,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            transcript: Vec::new(),
            transcript_text: None,
            recording_url: None,
            recording_file: None,
            outcome_status: None,
            outcome_description: None,
            end_reason: None,
            cost: None,
            cost_breakdown: None,
            raw_call_data,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledStatus {
    Pending,
    Scheduled,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let status = match raw {
            "pending" => Self::Pending,
            "scheduled" => Self::Scheduled,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        };
        Some(status)
    }

    /// Dispatch and cancellation are only allowed before any side effect was attempted.
    pub fn is_awaiting_dispatch(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }
}

impl fmt::Display for ScheduledStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCall {
    pub id: Uuid,
    pub owner: OwnerId,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_time: OffsetDateTime,
    pub timezone: String,
    pub customer_number: String,
    pub assistant: Uuid,
    pub phone_number: Uuid,
    pub campaign: Option<i64>,
    pub status: ScheduledStatus,
    pub execution_attempts: i32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    /// Set exactly once, when dispatch succeeds.
    pub actual_call: Option<Uuid>,
}
