//! Per-call state machine: how one validated event is folded into the stored record.
//!
//! `queued -> ringing -> in-progress -> ended`, with `failed` reachable from any state before
//! `ended`.  `ended` and `failed` are sticky: later events still enrich the record but never
//! change its status.  Callers must serialize merges per external call id.

use crate::db_types::{CallRecord, TranscriptEntry};
use crate::event::{CallEvent, TranscriptUpdate};
use crate::outcome::Classifier;

use time::OffsetDateTime;
use tracing::{debug, warn};

/// Side effects the caller has to carry out once the per-call lock is released.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub status_changed: bool,
    pub transcript_changed: bool,
    /// A recording URL stored for the first time, with no artifact downloaded yet.
    pub recording_to_fetch: Option<String>,
}

pub fn merge(record: &mut CallRecord, event: &CallEvent, classifier: &Classifier) -> MergeReport {
    let mut report = MergeReport::default();

    if let Some(status) = &event.status {
        if record.status.is_terminal() {
            if status.is_terminal() && *status != record.status {
                warn!(
                    call_id = %record.external_id,
                    stored = %record.status,
                    reported = %status,
                    "conflicting terminal status ignored"
                );
            } else if *status != record.status {
                debug!(call_id = %record.external_id, reported = %status, "call already terminal");
            }
        } else if status.is_terminal() || status.progress_rank() >= record.status.progress_rank() {
            report.status_changed = *status != record.status;
            record.status = status.clone();
        } else {
            debug!(
                call_id = %record.external_id,
                stored = %record.status,
                reported = %status,
                "stale progress status ignored"
            );
        }
    }

    set_once(&record.external_id, "startedAt", &mut record.started_at, event.started_at);
    set_once(&record.external_id, "endedAt", &mut record.ended_at, event.ended_at);

    if let Some(update) = &event.transcript {
        report.transcript_changed = apply_transcript(&mut record.transcript, update);
        record.transcript_text = render_transcript(&record.transcript);
    }

    if let Some(url) = &event.recording_url {
        match &record.recording_url {
            None => {
                record.recording_url = Some(url.clone());
                if record.recording_file.is_none() {
                    report.recording_to_fetch = Some(url.clone());
                }
            }
            Some(stored) if stored != url => {
                debug!(call_id = %record.external_id, "recording url already stored, keeping first");
            }
            Some(_) => {}
        }
    }

    if let Some(reason) = &event.ended_reason {
        record.end_reason = Some(reason.clone());
    }
    if event.cost.is_some() {
        record.cost = event.cost;
    }
    if let Some(breakdown) = &event.cost_breakdown {
        record.cost_breakdown = Some(breakdown.clone());
    }
    if let Some(destination) = &event.transfer_destination {
        record.transferred = true;
        record.transfer_destination = Some(destination.clone());
    }
    if !event.raw_payload.is_null() {
        record.raw_call_data = event.raw_payload.clone();
    }

    record.duration_seconds = derive_duration(record);

    let outcome = classifier.classify(record);
    record.outcome_status = Some(outcome.status);
    record.outcome_description = Some(outcome.description);

    report
}

/// First write wins; a different later value is logged and dropped.
fn set_once(
    call_id: &str,
    field: &str,
    slot: &mut Option<OffsetDateTime>,
    incoming: Option<OffsetDateTime>,
) {
    match (*slot, incoming) {
        (None, Some(value)) => *slot = Some(value),
        (Some(stored), Some(value)) if stored != value => {
            warn!(
                call_id = %call_id,
                field = field,
                stored = %stored,
                reported = %value,
                "ignoring conflicting timestamp"
            );
        }
        _ => {}
    }
}

fn derive_duration(record: &CallRecord) -> Option<i64> {
    let (started, ended) = (record.started_at?, record.ended_at?);
    let seconds = (ended - started).whole_seconds();
    if seconds < 0 {
        warn!(call_id = %record.external_id, "call ended before it started");
        return None;
    }
    Some(seconds)
}

/// Returns whether the canonical transcript changed.
pub fn apply_transcript(transcript: &mut Vec<TranscriptEntry>, update: &TranscriptUpdate) -> bool {
    match update {
        TranscriptUpdate::Snapshot(entries) => {
            // the platform's snapshots are cumulative; a shorter one is stale
            if entries.len() < transcript.len() || entries == transcript {
                return false;
            }
            *transcript = entries.clone();
            true
        }
        TranscriptUpdate::Fragment(entry) => {
            if entry.message.trim().is_empty() {
                return false;
            }
            // untimed fragments carry no position, so any equal untimed entry is a redelivery
            let duplicate = transcript.contains(entry);
            if duplicate {
                return false;
            }
            transcript.push(entry.clone());
            true
        }
    }
}

/// Flattened `role: message` view, always re-derived from the canonical sequence.
pub fn render_transcript(transcript: &[TranscriptEntry]) -> Option<String> {
    if transcript.is_empty() {
        return None;
    }
    Some(
        transcript
            .iter()
            .map(|entry| format!("{}: {}", entry.role.as_str(), entry.message))
            .collect::<Vec<String>>()
            .join("\n"),
    )
}
