//! The call lifecycle engine: every inbound push, every poll and every placement goes through
//! here.
//!
//! Per external call id the engine holds one lock for the whole
//! load / validate / merge / classify / save sequence.  Network I/O (polling the platform,
//! placing calls, fetching recordings) always happens outside that lock.

use crate::call_state::merge;
use crate::db_types::{Assistant, CallRecord, CallStatus, OwnerId, PhoneNumber};
use crate::error::{CoreError, PlacementError, StoreError};
use crate::event::{normalize, CallEvent, EventKind, Origin};
use crate::locks::{call_key, KeyedLocks};
use crate::outcome::Classifier;
use crate::ownership::validate_ownership;
use crate::recording::{RecordingJob, RecordingSink};
use crate::signature::SignatureVerifier;
use crate::store::Store;
use crate::utils::save_webhook_event;
use crate::vapi_client::PlatformClient;
use crate::vapi_types::{precall, Customer, PlaceCallRequest};

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// What a push produced.
#[derive(Debug)]
pub enum IngestOutcome {
    /// A pre-call request; the value is the response body the platform expects.
    PreCall(Value),
    Merged(CallRecord),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub refreshed: usize,
    pub failed: usize,
}

pub struct CallEngine {
    pub(crate) store: Arc<dyn Store>,
    platform: Arc<dyn PlatformClient>,
    pub(crate) locks: KeyedLocks,
    verifier: SignatureVerifier,
    classifier: Classifier,
    recordings: Arc<dyn RecordingSink>,
    webhook_log_dir: Option<PathBuf>,
}

impl CallEngine {
    pub fn new(
        store: Arc<dyn Store>,
        platform: Arc<dyn PlatformClient>,
        verifier: SignatureVerifier,
        classifier: Classifier,
        recordings: Arc<dyn RecordingSink>,
    ) -> Self {
        Self {
            store,
            platform,
            locks: KeyedLocks::new(),
            verifier,
            classifier,
            recordings,
            webhook_log_dir: None,
        }
    }

    /// Keep an audit copy of every authenticated webhook body under `dir`.
    pub fn with_webhook_log(mut self, dir: Option<PathBuf>) -> Self {
        self.webhook_log_dir = dir;
        self
    }

    /// Entry point for raw webhook bodies.
    pub async fn ingest_push(
        &self,
        body: &[u8],
        presented_secret: Option<&str>,
    ) -> Result<IngestOutcome, CoreError> {
        if self.verifier.is_enabled() {
            self.verifier.verify(presented_secret)?;
        } else {
            warn!("webhook secret not configured, accepting unauthenticated push");
        }

        let body: Value = match serde_json::from_slice(body) {
            Ok(body) => body,
            Err(e) => {
                warn!(origin = %Origin::Push, error = %e, "rejecting webhook body that is not json");
                return Err(CoreError::MalformedEvent(format!("invalid json: {e}")));
            }
        };
        let event_type = body
            .pointer("/message/type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        if let Some(dir) = &self.webhook_log_dir {
            let call_id = body.pointer("/message/call/id").and_then(Value::as_str);
            save_webhook_event(dir, event_type, call_id, &body).await;
        }

        let event = normalize(&body, Origin::Push).map_err(|e| {
            warn!(origin = %Origin::Push, kind = event_type, error = %e, "rejecting malformed event");
            e
        })?;
        if event.kind.is_pre_call() {
            info!(kind = %event.kind, "answering pre-call request");
            return Ok(IngestOutcome::PreCall(pre_call_response(&event)));
        }
        self.ingest(event).await.map(IngestOutcome::Merged)
    }

    /// Validate and merge one normalized event into its call record.
    pub async fn ingest(&self, event: CallEvent) -> Result<CallRecord, CoreError> {
        let call_id = match event.call_id() {
            Ok(id) => id.to_string(),
            Err(e) => {
                warn!(kind = %event.kind, origin = %event.origin, error = %e, "rejecting malformed event");
                return Err(e);
            }
        };
        debug!(call_id = %call_id, kind = %event.kind, origin = %event.origin, "ingesting event");
        if let EventKind::Other(kind) = &event.kind {
            info!(call_id = %call_id, kind = %kind, "unrecognized event kind, refreshing raw data only");
        }

        let guard = self.locks.lock(call_key(&call_id)).await;
        let Some(ctx) = self.store.call_context(&call_id).await? else {
            warn!(call_id = %call_id, kind = %event.kind, origin = %event.origin, "event for unknown call");
            return Err(CoreError::RecordNotFound(call_id));
        };
        validate_ownership(&ctx, &event)?;

        let mut record = ctx.record;
        let before = record.clone();
        let report = merge(&mut record, &event, &self.classifier);
        if record != before {
            self.store.save_call(&record).await?;
        }
        if report.status_changed || before.outcome_status != record.outcome_status {
            info!(
                call_id = %call_id,
                status = %record.status,
                outcome = record.outcome_status.map(|o| o.as_str()).unwrap_or("none"),
                rule = self.classifier.deciding_rule(&record).unwrap_or("fallback"),
                "call updated"
            );
        }
        drop(guard);

        if let Some(url) = report.recording_to_fetch {
            self.recordings.enqueue(RecordingJob {
                call_id: record.id,
                external_call_id: call_id,
                url,
            });
        }
        Ok(record)
    }

    /// Poll the platform for the call's current state and merge it.
    pub async fn refresh(&self, external_call_id: &str) -> Result<CallRecord, CoreError> {
        let record = self
            .store
            .get_call(external_call_id)
            .await?
            .ok_or_else(|| CoreError::RecordNotFound(external_call_id.to_string()))?;
        let api_key = self
            .store
            .api_key(record.owner)
            .await?
            .ok_or(CoreError::MissingCredential(record.owner))?;

        let body = self.platform.get_call(&api_key, external_call_id).await?;
        let event = normalize(&body, Origin::Poll)?;
        let polled_id = event.call_id()?;
        if polled_id != external_call_id {
            warn!(
                call_id = %external_call_id,
                polled = %polled_id,
                origin = %event.origin,
                "poll returned a different call"
            );
            return Err(CoreError::MalformedEvent(
                "poll returned a different call".to_string(),
            ));
        }
        self.ingest(event).await
    }

    /// Poll every open call created within `window` of `now`.
    pub async fn refresh_open_calls(
        &self,
        now: OffsetDateTime,
        window: std::time::Duration,
    ) -> Result<SweepReport, StoreError> {
        let since = now - window;
        let open = self.store.calls_to_refresh(since).await?;
        let mut report = SweepReport {
            checked: open.len(),
            ..Default::default()
        };
        for call_id in open {
            match self.refresh(&call_id).await {
                Ok(_) => report.refreshed += 1,
                Err(e) => {
                    warn!(call_id = %call_id, error = %e, "refresh failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Attach a downloaded recording.  Returns `false` if one was already attached.
    pub async fn attach_recording(&self, job: &RecordingJob, path: &Path) -> Result<bool, CoreError> {
        let _guard = self.locks.lock(call_key(&job.external_call_id)).await;
        let mut record = self
            .store
            .get_call(&job.external_call_id)
            .await?
            .ok_or_else(|| CoreError::RecordNotFound(job.external_call_id.clone()))?;
        if record.recording_file.is_some() {
            debug!(call_id = %job.external_call_id, "recording already attached");
            return Ok(false);
        }
        record.recording_file = Some(path.display().to_string());
        self.store.save_call(&record).await?;
        Ok(true)
    }

    /// Place a call for `owner` using their assistant and phone number.
    pub async fn place_call(
        &self,
        owner: OwnerId,
        assistant_external_id: &str,
        phone_number_external_id: &str,
        customer_number: &str,
    ) -> Result<CallRecord, PlacementError> {
        let assistant = self
            .store
            .assistant_by_external(owner, assistant_external_id)
            .await?
            .ok_or_else(|| PlacementError::UnknownAssistant(assistant_external_id.to_string()))?;
        let phone_number = self
            .store
            .phone_number_by_external(owner, phone_number_external_id)
            .await?
            .ok_or_else(|| {
                PlacementError::UnknownPhoneNumber(phone_number_external_id.to_string())
            })?;
        self.place_with(&assistant, &phone_number, customer_number, None)
            .await
    }

    /// Place a call and record it.  Callers have already checked that both references belong
    /// to the same owner.
    pub(crate) async fn place_with(
        &self,
        assistant: &Assistant,
        phone_number: &PhoneNumber,
        customer_number: &str,
        campaign: Option<i64>,
    ) -> Result<CallRecord, PlacementError> {
        let owner = assistant.owner;
        let api_key = self
            .store
            .api_key(owner)
            .await?
            .ok_or(PlacementError::MissingCredential(owner))?;
        let request = PlaceCallRequest {
            assistant_id: assistant.external_id.clone(),
            phone_number_id: phone_number.external_id.clone(),
            customer: Customer {
                number: customer_number.to_string(),
            },
        };
        let placed = self.platform.place_call(&api_key, &request).await?;

        let status = placed
            .initial_status
            .as_deref()
            .map(CallStatus::parse)
            .unwrap_or(CallStatus::Queued);
        let mut record = CallRecord::placed(
            placed.external_call_id,
            assistant,
            phone_number,
            customer_number.to_string(),
            status,
            placed.raw,
        );
        if campaign.is_some() {
            record.campaign = campaign;
        }
        let outcome = self.classifier.classify(&record);
        record.outcome_status = Some(outcome.status);
        record.outcome_description = Some(outcome.description);
        self.store.insert_call(&record).await?;
        info!(
            call_id = %record.external_id,
            owner = owner,
            status = %record.status,
            "call placed"
        );
        Ok(record)
    }
}

fn pre_call_response(event: &CallEvent) -> Value {
    match event.kind {
        EventKind::ToolCalls => precall::tool_calls(&event.message),
        EventKind::TransferDestinationRequest => precall::transfer_destination_request(),
        EventKind::KnowledgeBaseRequest => precall::knowledge_base_request(),
        _ => precall::assistant_request(),
    }
}
