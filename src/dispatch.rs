//! Turning due scheduled calls into placed calls.
//!
//! A dispatch first claims the scheduled call (status `in_progress`, attempt counted, persisted)
//! under the scheduled call's lock, then places the call with the lock released, then records
//! the result.  A claimed call is never claimed again, so overlapping batches cannot double-fire.
//! Failures are recorded on the scheduled call and never retried here.

use crate::db_types::{CallRecord, OwnerId, ScheduledCall, ScheduledStatus};
use crate::engine::CallEngine;
use crate::error::{DispatchError, PlacementError, ScheduleError, StoreError};
use crate::locks::scheduled_key;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub total_due: usize,
    pub executed: usize,
    pub failed: usize,
}

impl CallEngine {
    pub async fn dispatch_due(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> Result<CallRecord, DispatchError> {
        let scheduled = self.claim(id, now).await?;
        info!(
            scheduled_call = %id,
            attempt = scheduled.execution_attempts,
            "dispatching scheduled call"
        );

        let placed = self.place_scheduled(&scheduled).await;

        let _guard = self.locks.lock(scheduled_key(&id)).await;
        let mut scheduled = self
            .store
            .scheduled_call(id)
            .await?
            .ok_or(DispatchError::NotFound(id))?;
        match placed {
            Ok(record) => {
                scheduled.status = ScheduledStatus::Completed;
                scheduled.actual_call = Some(record.id);
                scheduled.error_message = None;
                self.store.save_scheduled(&scheduled).await?;
                info!(scheduled_call = %id, call_id = %record.external_id, "scheduled call placed");
                Ok(record)
            }
            Err(e) => {
                scheduled.status = ScheduledStatus::Failed;
                scheduled.error_message = Some(e.to_string());
                self.store.save_scheduled(&scheduled).await?;
                error!(scheduled_call = %id, error = %e, "scheduled call failed");
                Err(e.into())
            }
        }
    }

    /// Move a due scheduled call to `in_progress` and count the attempt.
    async fn claim(&self, id: Uuid, now: OffsetDateTime) -> Result<ScheduledCall, DispatchError> {
        let _guard = self.locks.lock(scheduled_key(&id)).await;
        let mut scheduled = self
            .store
            .scheduled_call(id)
            .await?
            .ok_or(DispatchError::NotFound(id))?;
        if !scheduled.status.is_awaiting_dispatch() {
            return Err(DispatchError::NotDispatchable {
                id,
                status: scheduled.status,
            });
        }
        if scheduled.scheduled_time > now {
            return Err(DispatchError::NotDue(id));
        }
        scheduled.status = ScheduledStatus::InProgress;
        scheduled.execution_attempts += 1;
        scheduled.last_attempt_at = Some(now);
        self.store.save_scheduled(&scheduled).await?;
        Ok(scheduled)
    }

    async fn place_scheduled(&self, scheduled: &ScheduledCall) -> Result<CallRecord, PlacementError> {
        let assistant = self
            .store
            .assistant(scheduled.assistant)
            .await?
            .filter(|a| a.owner == scheduled.owner)
            .ok_or_else(|| PlacementError::UnknownAssistant(scheduled.assistant.to_string()))?;
        let phone_number = self
            .store
            .phone_number(scheduled.phone_number)
            .await?
            .filter(|p| p.owner == scheduled.owner)
            .ok_or_else(|| PlacementError::UnknownPhoneNumber(scheduled.phone_number.to_string()))?;
        self.place_with(
            &assistant,
            &phone_number,
            &scheduled.customer_number,
            scheduled.campaign,
        )
        .await
    }

    /// Dispatch every due scheduled call, oldest first.
    pub async fn run_due(
        &self,
        now: OffsetDateTime,
        owner: Option<OwnerId>,
    ) -> Result<DispatchReport, StoreError> {
        let due = self.store.due_scheduled(now, owner).await?;
        let mut report = DispatchReport {
            total_due: due.len(),
            ..Default::default()
        };
        for scheduled in due {
            match self.dispatch_due(scheduled.id, now).await {
                Ok(_) => report.executed += 1,
                // claimed or cancelled since the batch was listed
                Err(DispatchError::NotDispatchable { .. }) => {
                    debug!(scheduled_call = %scheduled.id, "already handled, skipping");
                }
                Err(DispatchError::Store(e)) => return Err(e),
                Err(_) => report.failed += 1,
            }
        }
        if report.total_due > 0 {
            info!(
                total_due = report.total_due,
                executed = report.executed,
                failed = report.failed,
                "dispatch batch finished"
            );
        }
        Ok(report)
    }

    /// Cancel a scheduled call that has not been dispatched yet.
    pub async fn cancel_scheduled(&self, id: Uuid) -> Result<ScheduledCall, ScheduleError> {
        let _guard = self.locks.lock(scheduled_key(&id)).await;
        let mut scheduled = self
            .store
            .scheduled_call(id)
            .await?
            .ok_or(ScheduleError::NotFound(id))?;
        if !scheduled.status.is_awaiting_dispatch() {
            return Err(ScheduleError::InvalidTransition {
                from: scheduled.status,
                to: ScheduledStatus::Cancelled,
            });
        }
        scheduled.status = ScheduledStatus::Cancelled;
        self.store.save_scheduled(&scheduled).await?;
        info!(scheduled_call = %id, "scheduled call cancelled");
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_types::{Assistant, CallStatus, PhoneNumber};
    use crate::outcome::Classifier;
    use crate::ownership::CallContext;
    use crate::signature::SignatureVerifier;
    use crate::store::{MemoryStore, Store};
    use crate::test_support::{engine, scheduled_call, seeded_store, FakePlatform};
    use async_trait::async_trait;
    use std::sync::Arc;
    use time::Duration;
    use tokio::sync::mpsc;

    /// Lands a `ringing` webhook the moment a placed call is first recorded.
    struct RingingOnInsert(MemoryStore);

    #[async_trait]
    impl Store for RingingOnInsert {
        async fn call_context(&self, external_id: &str) -> Result<Option<CallContext>, StoreError> {
            self.0.call_context(external_id).await
        }
        async fn get_call(&self, external_id: &str) -> Result<Option<CallRecord>, StoreError> {
            self.0.get_call(external_id).await
        }
        async fn insert_call(&self, record: &CallRecord) -> Result<(), StoreError> {
            self.0.insert_call(record).await?;
            let mut ringing = record.clone();
            ringing.status = CallStatus::Ringing;
            self.0.save_call(&ringing).await
        }
        async fn save_call(&self, record: &CallRecord) -> Result<(), StoreError> {
            self.0.save_call(record).await
        }
        async fn calls_to_refresh(&self, since: OffsetDateTime) -> Result<Vec<String>, StoreError> {
            self.0.calls_to_refresh(since).await
        }
        async fn assistant(&self, id: Uuid) -> Result<Option<Assistant>, StoreError> {
            self.0.assistant(id).await
        }
        async fn assistant_by_external(
            &self,
            owner: OwnerId,
            external_id: &str,
        ) -> Result<Option<Assistant>, StoreError> {
            self.0.assistant_by_external(owner, external_id).await
        }
        async fn phone_number(&self, id: Uuid) -> Result<Option<PhoneNumber>, StoreError> {
            self.0.phone_number(id).await
        }
        async fn phone_number_by_external(
            &self,
            owner: OwnerId,
            external_id: &str,
        ) -> Result<Option<PhoneNumber>, StoreError> {
            self.0.phone_number_by_external(owner, external_id).await
        }
        async fn api_key(&self, owner: OwnerId) -> Result<Option<String>, StoreError> {
            self.0.api_key(owner).await
        }
        async fn scheduled_call(&self, id: Uuid) -> Result<Option<ScheduledCall>, StoreError> {
            self.0.scheduled_call(id).await
        }
        async fn insert_scheduled(&self, scheduled: &ScheduledCall) -> Result<(), StoreError> {
            self.0.insert_scheduled(scheduled).await
        }
        async fn save_scheduled(&self, scheduled: &ScheduledCall) -> Result<(), StoreError> {
            self.0.save_scheduled(scheduled).await
        }
        async fn due_scheduled(
            &self,
            now: OffsetDateTime,
            owner: Option<OwnerId>,
        ) -> Result<Vec<ScheduledCall>, StoreError> {
            self.0.due_scheduled(now, owner).await
        }
    }

    async fn setup() -> (CallEngine, MemoryStore, Arc<FakePlatform>) {
        let (store, _) = seeded_store("call-1").await;
        let platform = Arc::new(FakePlatform::default());
        let (engine, _jobs) = engine(store.clone(), platform.clone(), None);
        (engine, store, platform)
    }

    #[tokio::test]
    async fn scenario_d_due_scheduled_call_is_placed_and_linked() {
        let (engine, store, platform) = setup().await;
        let now = OffsetDateTime::now_utc();
        let scheduled = scheduled_call(now - Duration::minutes(5));
        store.insert_scheduled(&scheduled).await.unwrap();

        let record = engine.dispatch_due(scheduled.id, now).await.unwrap();
        assert_eq!(record.status, CallStatus::Queued);

        let stored = store.scheduled_call(scheduled.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduledStatus::Completed);
        assert_eq!(stored.execution_attempts, 1);
        assert_eq!(stored.last_attempt_at, Some(now));
        assert_eq!(stored.actual_call, Some(record.id));
        let call = store.get_call(&record.external_id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Queued);
        assert_eq!(platform.placed()[0].customer.number, "+15550199");
    }

    #[tokio::test]
    async fn scheduled_campaign_is_recorded_at_placement() {
        let (engine, store, _) = setup().await;
        let now = OffsetDateTime::now_utc();
        let mut scheduled = scheduled_call(now - Duration::minutes(5));
        scheduled.campaign = Some(99);
        store.insert_scheduled(&scheduled).await.unwrap();

        let record = engine.dispatch_due(scheduled.id, now).await.unwrap();
        assert_eq!(record.campaign, Some(99));
        let call = store.get_call(&record.external_id).await.unwrap().unwrap();
        assert_eq!(call.campaign, Some(99));
    }

    #[tokio::test]
    async fn dispatch_does_not_overwrite_a_webhook_merged_after_insert() {
        let (memory, _) = seeded_store("call-1").await;
        let (jobs, _rx) = mpsc::unbounded_channel();
        let engine = CallEngine::new(
            Arc::new(RingingOnInsert(memory.clone())),
            Arc::new(FakePlatform::default()),
            SignatureVerifier::new(None),
            Classifier::default(),
            Arc::new(jobs),
        );
        let now = OffsetDateTime::now_utc();
        let mut scheduled = scheduled_call(now - Duration::minutes(5));
        scheduled.campaign = Some(99);
        memory.insert_scheduled(&scheduled).await.unwrap();

        let record = engine.dispatch_due(scheduled.id, now).await.unwrap();
        let call = memory.get_call(&record.external_id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Ringing);
        assert_eq!(call.campaign, Some(99));
        let stored = memory.scheduled_call(scheduled.id).await.unwrap().unwrap();
        assert_eq!(stored.actual_call, Some(call.id));
    }

    #[tokio::test]
    async fn placement_failure_is_recorded_not_retried() {
        let (engine, store, platform) = setup().await;
        platform.reject_placement("Invalid phone number");
        let now = OffsetDateTime::now_utc();
        let scheduled = scheduled_call(now - Duration::minutes(5));
        store.insert_scheduled(&scheduled).await.unwrap();

        let err = engine.dispatch_due(scheduled.id, now).await.unwrap_err();
        assert!(matches!(err, DispatchError::Placement(PlacementError::Platform(_))));
        let stored = store.scheduled_call(scheduled.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduledStatus::Failed);
        assert_eq!(stored.execution_attempts, 1);
        assert!(stored.error_message.unwrap().contains("Invalid phone number"));
        assert!(stored.actual_call.is_none());

        // a failed call is not picked up again
        let report = engine.run_due(now, None).await.unwrap();
        assert_eq!(report.total_due, 0);
    }

    #[tokio::test]
    async fn future_or_finished_calls_are_not_dispatched() {
        let (engine, store, _) = setup().await;
        let now = OffsetDateTime::now_utc();
        let future = scheduled_call(now + Duration::hours(1));
        let mut done = scheduled_call(now - Duration::hours(1));
        done.status = ScheduledStatus::Completed;
        store.insert_scheduled(&future).await.unwrap();
        store.insert_scheduled(&done).await.unwrap();

        assert!(matches!(
            engine.dispatch_due(future.id, now).await,
            Err(DispatchError::NotDue(_))
        ));
        assert!(matches!(
            engine.dispatch_due(done.id, now).await,
            Err(DispatchError::NotDispatchable { .. })
        ));
        assert!(matches!(
            engine.dispatch_due(Uuid::new_v4(), now).await,
            Err(DispatchError::NotFound(_))
        ));
        let untouched = store.scheduled_call(future.id).await.unwrap().unwrap();
        assert_eq!(untouched.execution_attempts, 0);
    }

    #[tokio::test]
    async fn run_due_reports_the_batch() {
        let (engine, store, _) = setup().await;
        let now = OffsetDateTime::now_utc();
        let ok = scheduled_call(now - Duration::minutes(2));
        let mut orphan = scheduled_call(now - Duration::minutes(1));
        orphan.assistant = Uuid::new_v4();
        for s in [&ok, &orphan, &scheduled_call(now + Duration::minutes(1))] {
            store.insert_scheduled(s).await.unwrap();
        }

        let report = engine.run_due(now, None).await.unwrap();
        assert_eq!(
            report,
            DispatchReport {
                total_due: 2,
                executed: 1,
                failed: 1
            }
        );
        let orphan = store.scheduled_call(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, ScheduledStatus::Failed);
    }

    #[tokio::test]
    async fn concurrent_batches_fire_once() {
        let (engine, store, platform) = setup().await;
        let engine = Arc::new(engine);
        let now = OffsetDateTime::now_utc();
        let scheduled = scheduled_call(now - Duration::minutes(1));
        store.insert_scheduled(&scheduled).await.unwrap();

        let (a, b) = tokio::join!(engine.run_due(now, None), engine.run_due(now, None));
        assert_eq!(a.unwrap().executed + b.unwrap().executed, 1);
        assert_eq!(platform.placed().len(), 1);
        let stored = store.scheduled_call(scheduled.id).await.unwrap().unwrap();
        assert_eq!(stored.execution_attempts, 1);
    }

    #[tokio::test]
    async fn only_waiting_calls_can_be_cancelled() {
        let (engine, store, _) = setup().await;
        let now = OffsetDateTime::now_utc();
        let waiting = scheduled_call(now + Duration::hours(1));
        let mut running = scheduled_call(now);
        running.status = ScheduledStatus::InProgress;
        store.insert_scheduled(&waiting).await.unwrap();
        store.insert_scheduled(&running).await.unwrap();

        let cancelled = engine.cancel_scheduled(waiting.id).await.unwrap();
        assert_eq!(cancelled.status, ScheduledStatus::Cancelled);
        assert!(matches!(
            engine.cancel_scheduled(running.id).await,
            Err(ScheduleError::InvalidTransition {
                from: ScheduledStatus::InProgress,
                to: ScheduledStatus::Cancelled
            })
        ));
        assert!(matches!(
            engine.cancel_scheduled(waiting.id).await,
            Err(ScheduleError::InvalidTransition { .. })
        ));
    }
}
