//! Turns webhook pushes and poll responses into one canonical [`CallEvent`].
//!
//! Extraction is defensive: optional fields that are missing or of the wrong shape are simply
//! absent.  Only a missing envelope, event type or call id (for kinds that need a call lookup)
//! is an error.

use crate::db_types::{CallStatus, Role, TranscriptEntry};
use crate::error::CoreError;
use crate::utils::{decimal_from_value, parse_timestamp};

use rust_decimal::Decimal;
use serde_json::Value;
use std::fmt;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Webhook pushed by the platform.
    Push,
    /// Response to our own `GET /call/{id}`.
    Poll,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Push => f.write_str("push"),
            Self::Poll => f.write_str("poll"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    StatusUpdate,
    EndOfCallReport,
    Transcript,
    ConversationUpdate,
    Hang,
    SpeechUpdate,
    ModelOutput,
    TransferUpdate,
    UserInterrupted,
    LanguageChangeDetected,
    AssistantRequest,
    ToolCalls,
    TransferDestinationRequest,
    KnowledgeBaseRequest,
    /// Full call object returned by a poll.
    CallSnapshot,
    Other(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "status-update" => Self::StatusUpdate,
            "end-of-call-report" => Self::EndOfCallReport,
            "transcript" => Self::Transcript,
            "conversation-update" => Self::ConversationUpdate,
            "hang" => Self::Hang,
            "speech-update" => Self::SpeechUpdate,
            "model-output" => Self::ModelOutput,
            "transfer-update" => Self::TransferUpdate,
            "user-interrupted" => Self::UserInterrupted,
            "language-change-detected" => Self::LanguageChangeDetected,
            "assistant-request" => Self::AssistantRequest,
            "tool-calls" => Self::ToolCalls,
            "transfer-destination-request" => Self::TransferDestinationRequest,
            "knowledge-base-request" => Self::KnowledgeBaseRequest,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::StatusUpdate => "status-update",
            Self::EndOfCallReport => "end-of-call-report",
            Self::Transcript => "transcript",
            Self::ConversationUpdate => "conversation-update",
            Self::Hang => "hang",
            Self::SpeechUpdate => "speech-update",
            Self::ModelOutput => "model-output",
            Self::TransferUpdate => "transfer-update",
            Self::UserInterrupted => "user-interrupted",
            Self::LanguageChangeDetected => "language-change-detected",
            Self::AssistantRequest => "assistant-request",
            Self::ToolCalls => "tool-calls",
            Self::TransferDestinationRequest => "transfer-destination-request",
            Self::KnowledgeBaseRequest => "knowledge-base-request",
            Self::CallSnapshot => "call-snapshot",
            Self::Other(raw) => raw,
        }
    }

    /// Kinds sent before a call exists; they never touch a call record.
    pub fn is_pre_call(&self) -> bool {
        matches!(
            self,
            Self::AssistantRequest
                | Self::ToolCalls
                | Self::TransferDestinationRequest
                | Self::KnowledgeBaseRequest
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TranscriptUpdate {
    /// The whole conversation so far, as the platform currently sees it.
    Snapshot(Vec<TranscriptEntry>),
    /// One final utterance.
    Fragment(TranscriptEntry),
}

/// Normalized view of one inbound notification.  Transient; never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct CallEvent {
    pub origin: Origin,
    pub kind: EventKind,
    pub source_call_id: Option<String>,
    pub claimed_assistant_id: Option<String>,
    pub claimed_phone_number_id: Option<String>,
    pub status: Option<CallStatus>,
    pub ended_reason: Option<String>,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub transcript: Option<TranscriptUpdate>,
    pub recording_url: Option<String>,
    pub cost: Option<Decimal>,
    pub cost_breakdown: Option<Value>,
    pub transfer_destination: Option<Value>,
    /// Call object as last seen from the platform.
    pub raw_payload: Value,
    /// Full push message (or poll body); pre-call responses are built from it.
    pub message: Value,
}

impl CallEvent {
    fn empty(origin: Origin, kind: EventKind, message: Value) -> Self {
        Self {
            origin,
            kind,
            source_call_id: None,
            claimed_assistant_id: None,
            claimed_phone_number_id: None,
            status: None,
            ended_reason: None,
            started_at: None,
            ended_at: None,
            transcript: None,
            recording_url: None,
            cost: None,
            cost_breakdown: None,
            transfer_destination: None,
            raw_payload: Value::Null,
            message,
        }
    }

    /// Every event that reaches the state machine names its call.
    pub fn call_id(&self) -> Result<&str, CoreError> {
        self.source_call_id
            .as_deref()
            .ok_or_else(|| CoreError::MalformedEvent("missing call id".to_string()))
    }
}

/// Decimal places kept for call cost; matches the `calls.cost` column.
pub const COST_SCALE: u32 = 6;

fn cost_from_value(value: &Value) -> Option<Decimal> {
    decimal_from_value(value).map(|cost| cost.round_dp(COST_SCALE))
}

pub fn normalize(body: &Value, origin: Origin) -> Result<CallEvent, CoreError> {
    match origin {
        Origin::Push => normalize_push(body),
        Origin::Poll => normalize_poll(body),
    }
}

fn normalize_push(body: &Value) -> Result<CallEvent, CoreError> {
    let message = body
        .get("message")
        .filter(|m| m.is_object())
        .ok_or_else(|| CoreError::MalformedEvent("missing message".to_string()))?;
    let kind = text(message, "type")
        .map(|raw| EventKind::parse(&raw))
        .ok_or_else(|| CoreError::MalformedEvent("missing message type".to_string()))?;
    let mut event = CallEvent::empty(Origin::Push, kind.clone(), message.clone());
    if kind.is_pre_call() {
        return Ok(event);
    }

    let call = message.get("call").filter(|c| c.is_object());
    let call_or_null = call.unwrap_or(&Value::Null);
    event.source_call_id = text(call_or_null, "id");
    if event.source_call_id.is_none() {
        return Err(CoreError::MalformedEvent("missing call id".to_string()));
    }
    event.claimed_assistant_id = text(call_or_null, "assistantId");
    event.claimed_phone_number_id = text(call_or_null, "phoneNumberId");
    event.raw_payload = call.cloned().unwrap_or_else(|| message.clone());

    match kind {
        EventKind::StatusUpdate => {
            event.status = text(message, "status")
                .or_else(|| text(call_or_null, "status"))
                .map(|raw| CallStatus::parse(&raw));
            event.ended_reason =
                text(message, "endedReason").or_else(|| text(call_or_null, "endedReason"));
            event.started_at = timestamp(call_or_null, "startedAt");
            event.ended_at = timestamp(call_or_null, "endedAt");
        }
        EventKind::EndOfCallReport => {
            let reported = text(call_or_null, "status").map(|raw| CallStatus::parse(&raw));
            event.status = Some(match reported {
                Some(status) if status.is_terminal() => status,
                _ => CallStatus::Ended,
            });
            event.ended_reason =
                text(message, "endedReason").or_else(|| text(call_or_null, "endedReason"));
            event.started_at =
                timestamp(message, "startedAt").or_else(|| timestamp(call_or_null, "startedAt"));
            event.ended_at =
                timestamp(message, "endedAt").or_else(|| timestamp(call_or_null, "endedAt"));
            event.cost = message
                .get("cost")
                .or_else(|| call_or_null.get("cost"))
                .and_then(cost_from_value);
            event.cost_breakdown = object(message, "costBreakdown")
                .or_else(|| object(call_or_null, "costBreakdown"));
            let artifact = message.get("artifact").unwrap_or(&Value::Null);
            event.transcript = artifact
                .get("messages")
                .and_then(transcript_from_value)
                .or_else(|| artifact.get("transcript").and_then(transcript_from_value))
                .or_else(|| message.get("transcript").and_then(transcript_from_value));
            event.recording_url = text(message, "recordingUrl")
                .or_else(|| recording_url(artifact))
                .or_else(|| recording_url(call_or_null));
        }
        EventKind::Transcript => {
            let is_final = text(message, "transcriptType").as_deref() == Some("final");
            if let (true, Some(spoken)) = (is_final, text(message, "transcript")) {
                event.transcript = Some(TranscriptUpdate::Fragment(TranscriptEntry {
                    role: Role::parse(&text(message, "role").unwrap_or_default()),
                    message: spoken,
                    timestamp: stamp(message),
                }));
            }
        }
        EventKind::ConversationUpdate => {
            event.transcript = message.get("messages").and_then(transcript_from_value);
        }
        EventKind::TransferUpdate => {
            let destination = message.get("destination").filter(|d| !d.is_null());
            event.transfer_destination =
                Some(destination.cloned().unwrap_or_else(|| Value::Object(Default::default())));
        }
        _ => {}
    }

    Ok(event)
}

fn normalize_poll(body: &Value) -> Result<CallEvent, CoreError> {
    if !body.is_object() {
        return Err(CoreError::MalformedEvent(
            "poll response is not an object".to_string(),
        ));
    }
    let mut event = CallEvent::empty(Origin::Poll, EventKind::CallSnapshot, body.clone());
    event.source_call_id = text(body, "id");
    if event.source_call_id.is_none() {
        return Err(CoreError::MalformedEvent("missing call id".to_string()));
    }
    event.claimed_assistant_id = text(body, "assistantId");
    event.claimed_phone_number_id = text(body, "phoneNumberId");
    event.status = text(body, "status").map(|raw| CallStatus::parse(&raw));
    event.ended_reason = text(body, "endedReason");
    event.started_at = timestamp(body, "startedAt");
    event.ended_at = timestamp(body, "endedAt");
    event.cost = body.get("cost").and_then(cost_from_value);
    event.cost_breakdown = object(body, "costBreakdown");
    let artifact = body.get("artifact").unwrap_or(&Value::Null);
    event.transcript = body
        .get("transcript")
        .and_then(transcript_from_value)
        .or_else(|| body.get("messages").and_then(transcript_from_value))
        .or_else(|| artifact.get("messages").and_then(transcript_from_value))
        .or_else(|| artifact.get("transcript").and_then(transcript_from_value));
    event.recording_url = recording_url(body).or_else(|| recording_url(artifact));
    event.raw_payload = body.clone();
    Ok(event)
}

fn text(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn timestamp(value: &Value, key: &str) -> Option<OffsetDateTime> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

fn object(value: &Value, key: &str) -> Option<Value> {
    value.get(key).filter(|v| v.is_object()).cloned()
}

/// Entry timestamps are either strings or epoch numbers; kept verbatim as text.
fn stamp(value: &Value) -> Option<String> {
    ["timestamp", "time"]
        .iter()
        .find_map(|key| match value.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
}

/// Look for a recording URL directly on `value` or in its `recording` sub-objects.
fn recording_url(value: &Value) -> Option<String> {
    if let Some(url) = text(value, "recordingUrl") {
        return Some(url);
    }
    let recording = value.get("recording")?;
    if let Some(url) = recording.as_str().filter(|s| !s.is_empty()) {
        return Some(url.to_string());
    }
    let recording = recording.as_object()?;
    ["mono", "stereo"]
        .iter()
        .filter_map(|key| recording.get(*key))
        .chain(recording.values())
        .find_map(|variant| text(variant, "recordingUrl"))
}

/// A transcript is a list of role/message objects or a flattened string.
pub fn transcript_from_value(value: &Value) -> Option<TranscriptUpdate> {
    let entries = match value {
        Value::Array(items) => items.iter().filter_map(entry_from_value).collect(),
        Value::String(flat) => parse_flat_transcript(flat),
        _ => return None,
    };
    Some(TranscriptUpdate::Snapshot(entries))
}

fn entry_from_value(item: &Value) -> Option<TranscriptEntry> {
    let role = Role::parse(item.get("role").and_then(Value::as_str).unwrap_or("unknown"));
    // system prompts are configuration, not speech
    if role == Role::System {
        return None;
    }
    let message = item
        .get("message")
        .or_else(|| item.get("content"))
        .and_then(Value::as_str)?;
    Some(TranscriptEntry {
        role,
        message: message.trim().to_string(),
        timestamp: stamp(item),
    })
}

/// Split `Role: text` lines into entries.  Lines without a role prefix continue the
/// previous entry.  A leading `[timestamp]` is kept as the entry's timestamp.
pub fn parse_flat_transcript(flat: &str) -> Vec<TranscriptEntry> {
    let mut entries: Vec<TranscriptEntry> = Vec::new();
    for line in flat.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (timestamp, rest) = match line.strip_prefix('[').and_then(|l| l.split_once(']')) {
            Some((stamp, rest)) => (Some(stamp.trim().to_string()), rest.trim_start()),
            None => (None, line),
        };
        let prefixed = rest.split_once(':').filter(|(prefix, _)| {
            let prefix = prefix.trim();
            !prefix.is_empty()
                && prefix.len() <= 20
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_alphabetic() || c == '_' || c == ' ')
        });
        match (prefixed, entries.last_mut()) {
            (Some((prefix, spoken)), _) => entries.push(TranscriptEntry {
                role: Role::parse(prefix),
                message: spoken.trim().to_string(),
                timestamp,
            }),
            (None, Some(last)) => {
                if !last.message.is_empty() {
                    last.message.push('\n');
                }
                last.message.push_str(rest);
            }
            (None, None) => entries.push(TranscriptEntry {
                role: Role::Other("unknown".to_string()),
                message: rest.to_string(),
                timestamp,
            }),
        }
    }
    entries.retain(|entry| entry.role != Role::System);
    entries
}
