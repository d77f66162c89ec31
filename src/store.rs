//! Persistence seam.  The engine only talks to `dyn Store`; `MemoryStore` backs development and
//! tests, `PgStore` backs deployments.

use crate::db_types::{Assistant, CallRecord, OwnerId, PhoneNumber, ScheduledCall};
use crate::error::StoreError;
use crate::ownership::CallContext;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    /// The call with its assistant and phone number, or `None` if the call is unknown.
    async fn call_context(&self, external_id: &str) -> Result<Option<CallContext>, StoreError>;

    async fn get_call(&self, external_id: &str) -> Result<Option<CallRecord>, StoreError>;

    /// Fails with `Conflict` if the external id is already recorded.
    async fn insert_call(&self, record: &CallRecord) -> Result<(), StoreError>;

    async fn save_call(&self, record: &CallRecord) -> Result<(), StoreError>;

    /// External ids of non-terminal calls created at or after `since`.
    async fn calls_to_refresh(&self, since: OffsetDateTime) -> Result<Vec<String>, StoreError>;

    async fn assistant(&self, id: Uuid) -> Result<Option<Assistant>, StoreError>;

    async fn assistant_by_external(
        &self,
        owner: OwnerId,
        external_id: &str,
    ) -> Result<Option<Assistant>, StoreError>;

    async fn phone_number(&self, id: Uuid) -> Result<Option<PhoneNumber>, StoreError>;

    async fn phone_number_by_external(
        &self,
        owner: OwnerId,
        external_id: &str,
    ) -> Result<Option<PhoneNumber>, StoreError>;

    /// The tenant's platform API key.
    async fn api_key(&self, owner: OwnerId) -> Result<Option<String>, StoreError>;

    async fn scheduled_call(&self, id: Uuid) -> Result<Option<ScheduledCall>, StoreError>;

    async fn insert_scheduled(&self, scheduled: &ScheduledCall) -> Result<(), StoreError>;

    async fn save_scheduled(&self, scheduled: &ScheduledCall) -> Result<(), StoreError>;

    /// Scheduled calls awaiting dispatch whose time is `<= now`, oldest first.
    async fn due_scheduled(
        &self,
        now: OffsetDateTime,
        owner: Option<OwnerId>,
    ) -> Result<Vec<ScheduledCall>, StoreError>;
}

#[derive(Default)]
struct Tables {
    // external call id => record
    calls: HashMap<String, CallRecord>,
    scheduled: HashMap<Uuid, ScheduledCall>,
    assistants: HashMap<Uuid, Assistant>,
    phone_numbers: HashMap<Uuid, PhoneNumber>,
    api_keys: HashMap<OwnerId, String>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_assistant(&self, assistant: Assistant) {
        self.tables
            .write()
            .await
            .assistants
            .insert(assistant.id, assistant);
    }

    pub async fn add_phone_number(&self, phone_number: PhoneNumber) {
        self.tables
            .write()
            .await
            .phone_numbers
            .insert(phone_number.id, phone_number);
    }

    pub async fn set_api_key(&self, owner: OwnerId, api_key: impl Into<String>) {
        self.tables
            .write()
            .await
            .api_keys
            .insert(owner, api_key.into());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn call_context(&self, external_id: &str) -> Result<Option<CallContext>, StoreError> {
        let tables = self.tables.read().await;
        let Some(record) = tables.calls.get(external_id) else {
            return Ok(None);
        };
        let assistant = tables
            .assistants
            .get(&record.assistant)
            .ok_or_else(|| StoreError::Corrupt(format!("call {external_id} has no assistant")))?;
        let phone_number = tables
            .phone_numbers
            .get(&record.phone_number)
            .ok_or_else(|| {
                StoreError::Corrupt(format!("call {external_id} has no phone number"))
            })?;
        Ok(Some(CallContext {
            record: record.clone(),
            assistant: assistant.clone(),
            phone_number: phone_number.clone(),
        }))
    }

    async fn get_call(&self, external_id: &str) -> Result<Option<CallRecord>, StoreError> {
        Ok(self.tables.read().await.calls.get(external_id).cloned())
    }

    async fn insert_call(&self, record: &CallRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.calls.contains_key(&record.external_id) {
            return Err(StoreError::Conflict(format!(
                "call {} already recorded",
                record.external_id
            )));
        }
        tables
            .calls
            .insert(record.external_id.clone(), record.clone());
        Ok(())
    }

    async fn save_call(&self, record: &CallRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.calls.get_mut(&record.external_id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(StoreError::Conflict(format!(
                "call {} was never recorded",
                record.external_id
            ))),
        }
    }

    async fn calls_to_refresh(&self, since: OffsetDateTime) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().await;
        let mut due: Vec<&CallRecord> = tables
            .calls
            .values()
            .filter(|record| !record.status.is_terminal() && record.created_at >= since)
            .collect();
        due.sort_by_key(|record| record.created_at);
        Ok(due.into_iter().map(|r| r.external_id.clone()).collect())
    }

    async fn assistant(&self, id: Uuid) -> Result<Option<Assistant>, StoreError> {
        Ok(self.tables.read().await.assistants.get(&id).cloned())
    }

    async fn assistant_by_external(
        &self,
        owner: OwnerId,
        external_id: &str,
    ) -> Result<Option<Assistant>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .assistants
            .values()
            .find(|a| a.owner == owner && a.external_id == external_id)
            .cloned())
    }

    async fn phone_number(&self, id: Uuid) -> Result<Option<PhoneNumber>, StoreError> {
        Ok(self.tables.read().await.phone_numbers.get(&id).cloned())
    }

    async fn phone_number_by_external(
        &self,
        owner: OwnerId,
        external_id: &str,
    ) -> Result<Option<PhoneNumber>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .phone_numbers
            .values()
            .find(|p| p.owner == owner && p.external_id == external_id)
            .cloned())
    }

    async fn api_key(&self, owner: OwnerId) -> Result<Option<String>, StoreError> {
        Ok(self.tables.read().await.api_keys.get(&owner).cloned())
    }

    async fn scheduled_call(&self, id: Uuid) -> Result<Option<ScheduledCall>, StoreError> {
        Ok(self.tables.read().await.scheduled.get(&id).cloned())
    }

    async fn insert_scheduled(&self, scheduled: &ScheduledCall) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.scheduled.contains_key(&scheduled.id) {
            return Err(StoreError::Conflict(format!(
                "scheduled call {} already exists",
                scheduled.id
            )));
        }
        tables.scheduled.insert(scheduled.id, scheduled.clone());
        Ok(())
    }

    async fn save_scheduled(&self, scheduled: &ScheduledCall) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.scheduled.get_mut(&scheduled.id) {
            Some(stored) => {
                *stored = scheduled.clone();
                Ok(())
            }
            None => Err(StoreError::Conflict(format!(
                "scheduled call {} does not exist",
                scheduled.id
            ))),
        }
    }

    async fn due_scheduled(
        &self,
        now: OffsetDateTime,
        owner: Option<OwnerId>,
    ) -> Result<Vec<ScheduledCall>, StoreError> {
        let tables = self.tables.read().await;
        let mut due: Vec<ScheduledCall> = tables
            .scheduled
            .values()
            .filter(|s| s.status.is_awaiting_dispatch() && s.scheduled_time <= now)
            .filter(|s| owner.map_or(true, |owner| s.owner == owner))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.scheduled_time);
        Ok(due)
    }
}
