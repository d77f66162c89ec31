//! Shared fixtures for unit tests.

use crate::db_types::{
    Assistant, CallRecord, CallStatus, OwnerId, PhoneNumber, ScheduledCall, ScheduledStatus,
};
use crate::engine::CallEngine;
use crate::error::PlatformError;
use crate::outcome::Classifier;
use crate::ownership::CallContext;
use crate::recording::RecordingJob;
use crate::signature::SignatureVerifier;
use crate::store::{MemoryStore, Store};
use crate::vapi_client::PlatformClient;
use crate::vapi_types::{PlaceCallRequest, PlacedCall};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use tracing::instrument::WithSubscriber;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const OWNER: OwnerId = 7;
pub const API_KEY: &str = "tenant-key";
pub const ASSISTANT_ID: Uuid = Uuid::from_u128(0xa551);
pub const PHONE_NUMBER_ID: Uuid = Uuid::from_u128(0x9401);

pub fn assistant() -> Assistant {
    Assistant {
        id: ASSISTANT_ID,
        owner: OWNER,
        external_id: "asst-1".to_string(),
        campaign: Some(3),
    }
}

pub fn phone_number() -> PhoneNumber {
    PhoneNumber {
        id: PHONE_NUMBER_ID,
        owner: OWNER,
        external_id: "pn-1".to_string(),
        number: "+15550100".to_string(),
        campaign: None,
    }
}

/// A freshly placed, queued call owned by [`OWNER`].
pub fn call_record(external_id: &str) -> CallRecord {
    CallRecord::placed(
        external_id.to_string(),
        &assistant(),
        &phone_number(),
        "+15550199".to_string(),
        CallStatus::Queued,
        json!({ "id": external_id, "status": "queued" }),
    )
}

pub fn call_context(external_id: &str) -> CallContext {
    CallContext {
        record: call_record(external_id),
        assistant: assistant(),
        phone_number: phone_number(),
    }
}

pub fn scheduled_call(at: OffsetDateTime) -> ScheduledCall {
    ScheduledCall {
        id: Uuid::new_v4(),
        owner: OWNER,
        scheduled_time: at,
        timezone: "America/New_York".to_string(),
        customer_number: "+15550199".to_string(),
        assistant: ASSISTANT_ID,
        phone_number: PHONE_NUMBER_ID,
        campaign: Some(3),
        status: ScheduledStatus::Scheduled,
        execution_attempts: 0,
        last_attempt_at: None,
        error_message: None,
        actual_call: None,
    }
}

/// Memory store holding the fixture assistant, phone number, tenant key and one queued call.
pub async fn seeded_store(external_id: &str) -> (MemoryStore, CallRecord) {
    let store = MemoryStore::new();
    store.add_assistant(assistant()).await;
    store.add_phone_number(phone_number()).await;
    store.set_api_key(OWNER, API_KEY).await;
    let record = call_record(external_id);
    store
        .insert_call(&record)
        .await
        .expect("fresh store accepts the fixture call");
    (store, record)
}

/// In-process stand-in for the voice platform.
#[derive(Default)]
pub struct FakePlatform {
    calls: Mutex<HashMap<String, Value>>,
    placed: Mutex<Vec<PlaceCallRequest>>,
    reject_placement: Mutex<Option<String>>,
}

impl FakePlatform {
    /// Serve `call` from `GET /call/{call.id}`.
    pub fn set_call(&self, call: Value) {
        let id = call["id"].as_str().unwrap_or_default().to_string();
        self.calls.lock().unwrap().insert(id, call);
    }

    pub fn reject_placement(&self, message: &str) {
        *self.reject_placement.lock().unwrap() = Some(message.to_string());
    }

    pub fn placed(&self) -> Vec<PlaceCallRequest> {
        self.placed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn place_call(
        &self,
        _api_key: &str,
        request: &PlaceCallRequest,
    ) -> Result<PlacedCall, PlatformError> {
        if let Some(message) = self.reject_placement.lock().unwrap().clone() {
            return Err(PlatformError::Status {
                status: 400,
                message,
            });
        }
        let mut placed = self.placed.lock().unwrap();
        placed.push(request.clone());
        let raw = json!({ "id": format!("placed-{}", placed.len()), "status": "queued" });
        Ok(PlacedCall::from_response(raw).unwrap())
    }

    async fn get_call(&self, _api_key: &str, call_id: &str) -> Result<Value, PlatformError> {
        self.calls
            .lock()
            .unwrap()
            .get(call_id)
            .cloned()
            .ok_or(PlatformError::Status {
                status: 404,
                message: "Not Found".to_string(),
            })
    }
}

/// Engine over `store` and `platform`; recording jobs land in the returned receiver.
pub fn engine(
    store: MemoryStore,
    platform: Arc<FakePlatform>,
    secret: Option<&str>,
) -> (CallEngine, mpsc::UnboundedReceiver<RecordingJob>) {
    let (jobs, rx) = mpsc::unbounded_channel();
    let engine = CallEngine::new(
        Arc::new(store),
        platform,
        SignatureVerifier::new(secret.map(str::to_string)),
        Classifier::default(),
        Arc::new(jobs),
    );
    (engine, rx)
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `fut` with a subscriber that records its log lines.
pub async fn capture_logs<F: Future>(fut: F) -> (F::Output, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || writer.clone())
        .finish();
    let output = fut.with_subscriber(subscriber).await;
    let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (output, logs)
}
