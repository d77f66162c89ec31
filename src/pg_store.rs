use crate::db_types::{
    Assistant, CallRecord, CallStatus, OutcomeStatus, OwnerId, PhoneNumber, ScheduledCall,
    ScheduledStatus, TranscriptEntry,
};
use crate::error::StoreError;
use crate::ownership::CallContext;
use crate::store::Store;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

/// Postgres-backed store.  Queries are checked at runtime so the crate builds without a live
/// database.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to connect to database");
                e
            })?;
        sqlx::migrate!().run(&pool).await?;
        info!("database migrations applied");
        Ok(Self { pool })
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

fn call_from_row(row: &PgRow) -> Result<CallRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let outcome_status: Option<String> = row.try_get("outcome_status")?;
    let outcome_status = outcome_status
        .map(|raw| {
            OutcomeStatus::parse(&raw)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown outcome status {raw:?}")))
        })
        .transpose()?;
    let transcript: Json<Vec<TranscriptEntry>> = row.try_get("transcript")?;
    Ok(CallRecord {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        owner: row.try_get("owner")?,
        assistant: row.try_get("assistant")?,
        phone_number: row.try_get("phone_number")?,
        campaign: row.try_get("campaign")?,
        customer_number: row.try_get("customer_number")?,
        status: CallStatus::parse(&status),
        transferred: row.try_get("transferred")?,
        transfer_destination: row.try_get("transfer_destination")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        transcript: transcript.0,
        transcript_text: row.try_get("transcript_text")?,
        recording_url: row.try_get("recording_url")?,
        recording_file: row.try_get("recording_file")?,
        outcome_status,
        outcome_description: row.try_get("outcome_description")?,
        end_reason: row.try_get("end_reason")?,
        cost: row.try_get("cost")?,
        cost_breakdown: row.try_get("cost_breakdown")?,
        raw_call_data: row.try_get("raw_call_data")?,
        created_at: row.try_get("created_at")?,
    })
}

fn scheduled_from_row(row: &PgRow) -> Result<ScheduledCall, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ScheduledCall {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        scheduled_time: row.try_get("scheduled_time")?,
        timezone: row.try_get("timezone")?,
        customer_number: row.try_get("customer_number")?,
        assistant: row.try_get("assistant")?,
        phone_number: row.try_get("phone_number")?,
        campaign: row.try_get("campaign")?,
        status: ScheduledStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown scheduled status {status:?}")))?,
        execution_attempts: row.try_get("execution_attempts")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        error_message: row.try_get("error_message")?,
        actual_call: row.try_get("actual_call")?,
    })
}

fn assistant_from_row(row: &PgRow) -> Result<Assistant, StoreError> {
    Ok(Assistant {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        external_id: row.try_get("external_id")?,
        campaign: row.try_get("campaign")?,
    })
}

fn phone_number_from_row(row: &PgRow) -> Result<PhoneNumber, StoreError> {
    Ok(PhoneNumber {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        external_id: row.try_get("external_id")?,
        number: row.try_get("number")?,
        campaign: row.try_get("campaign")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn call_context(&self, external_id: &str) -> Result<Option<CallContext>, StoreError> {
        let Some(record) = self.get_call(external_id).await? else {
            return Ok(None);
        };
        let assistant = self
            .assistant(record.assistant)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("call {external_id} has no assistant")))?;
        let phone_number = self.phone_number(record.phone_number).await?.ok_or_else(|| {
            StoreError::Corrupt(format!("call {external_id} has no phone number"))
        })?;
        Ok(Some(CallContext {
            record,
            assistant,
            phone_number,
        }))
    }

    async fn get_call(&self, external_id: &str) -> Result<Option<CallRecord>, StoreError> {
        sqlx::query(
            "
            select *
            from calls
            where external_id = $1
            ",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(call_from_row)
        .transpose()
    }

    async fn insert_call(&self, record: &CallRecord) -> Result<(), StoreError> {
        sqlx::query(
            "
            insert into calls (
              id,
              external_id,
              owner,
              assistant,
              phone_number,
              campaign,
              customer_number,
              status,
              transferred,
              transfer_destination,
              started_at,
              ended_at,
              duration_seconds,
              transcript,
              transcript_text,
              recording_url,
              recording_file,
              outcome_status,
              outcome_description,
              end_reason,
              cost,
              cost_breakdown,
              raw_call_data,
              created_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
              $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
            )
            ",
        )
        .bind(record.id)
        .bind(&record.external_id)
        .bind(record.owner)
        .bind(record.assistant)
        .bind(record.phone_number)
        .bind(record.campaign)
        .bind(&record.customer_number)
        .bind(record.status.as_str())
        .bind(record.transferred)
        .bind(&record.transfer_destination)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.duration_seconds)
        .bind(Json(&record.transcript))
        .bind(&record.transcript_text)
        .bind(&record.recording_url)
        .bind(&record.recording_file)
        .bind(record.outcome_status.as_ref().map(OutcomeStatus::as_str))
        .bind(&record.outcome_description)
        .bind(&record.end_reason)
        .bind(record.cost)
        .bind(&record.cost_breakdown)
        .bind(&record.raw_call_data)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!("call {} already recorded", record.external_id))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn save_call(&self, record: &CallRecord) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "
            update calls set
              status = $2,
              transferred = $3,
              transfer_destination = $4,
              started_at = $5,
              ended_at = $6,
              duration_seconds = $7,
              transcript = $8,
              transcript_text = $9,
              recording_url = $10,
              recording_file = $11,
              outcome_status = $12,
              outcome_description = $13,
              end_reason = $14,
              cost = $15,
              cost_breakdown = $16,
              raw_call_data = $17
            where external_id = $1
            ",
        )
        .bind(&record.external_id)
        .bind(record.status.as_str())
        .bind(record.transferred)
        .bind(&record.transfer_destination)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.duration_seconds)
        .bind(Json(&record.transcript))
        .bind(&record.transcript_text)
        .bind(&record.recording_url)
        .bind(&record.recording_file)
        .bind(record.outcome_status.as_ref().map(OutcomeStatus::as_str))
        .bind(&record.outcome_description)
        .bind(&record.end_reason)
        .bind(record.cost)
        .bind(&record.cost_breakdown)
        .bind(&record.raw_call_data)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "call {} was never recorded",
                record.external_id
            )));
        }
        Ok(())
    }

    async fn calls_to_refresh(&self, since: OffsetDateTime) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "
            select external_id
            from calls
            where status not in ('ended', 'failed')
              and created_at >= $1
            order by created_at
            ",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("external_id").map_err(StoreError::from))
            .collect()
    }

    async fn assistant(&self, id: Uuid) -> Result<Option<Assistant>, StoreError> {
        sqlx::query("select * from assistants where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(assistant_from_row)
            .transpose()
    }

    async fn assistant_by_external(
        &self,
        owner: OwnerId,
        external_id: &str,
    ) -> Result<Option<Assistant>, StoreError> {
        sqlx::query("select * from assistants where owner = $1 and external_id = $2")
            .bind(owner)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(assistant_from_row)
            .transpose()
    }

    async fn phone_number(&self, id: Uuid) -> Result<Option<PhoneNumber>, StoreError> {
        sqlx::query("select * from phone_numbers where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(phone_number_from_row)
            .transpose()
    }

    async fn phone_number_by_external(
        &self,
        owner: OwnerId,
        external_id: &str,
    ) -> Result<Option<PhoneNumber>, StoreError> {
        sqlx::query("select * from phone_numbers where owner = $1 and external_id = $2")
            .bind(owner)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(phone_number_from_row)
            .transpose()
    }

    async fn api_key(&self, owner: OwnerId) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("select vapi_api_key from tenants where owner = $1")
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("vapi_api_key")?)),
            None => Ok(None),
        }
    }

    async fn scheduled_call(&self, id: Uuid) -> Result<Option<ScheduledCall>, StoreError> {
        sqlx::query("select * from scheduled_calls where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(scheduled_from_row)
            .transpose()
    }

    async fn insert_scheduled(&self, scheduled: &ScheduledCall) -> Result<(), StoreError> {
        sqlx::query(
            "
            insert into scheduled_calls (
              id,
              owner,
              scheduled_time,
              timezone,
              customer_number,
              assistant,
              phone_number,
              campaign,
              status,
              execution_attempts,
              last_attempt_at,
              error_message,
              actual_call
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
            )
            ",
        )
        .bind(scheduled.id)
        .bind(scheduled.owner)
        .bind(scheduled.scheduled_time)
        .bind(&scheduled.timezone)
        .bind(&scheduled.customer_number)
        .bind(scheduled.assistant)
        .bind(scheduled.phone_number)
        .bind(scheduled.campaign)
        .bind(scheduled.status.as_str())
        .bind(scheduled.execution_attempts)
        .bind(scheduled.last_attempt_at)
        .bind(&scheduled.error_message)
        .bind(scheduled.actual_call)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!("scheduled call {} already exists", scheduled.id))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn save_scheduled(&self, scheduled: &ScheduledCall) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "
            update scheduled_calls set
              status = $2,
              execution_attempts = $3,
              last_attempt_at = $4,
              error_message = $5,
              actual_call = $6
            where id = $1
            ",
        )
        .bind(scheduled.id)
        .bind(scheduled.status.as_str())
        .bind(scheduled.execution_attempts)
        .bind(scheduled.last_attempt_at)
        .bind(&scheduled.error_message)
        .bind(scheduled.actual_call)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "scheduled call {} does not exist",
                scheduled.id
            )));
        }
        Ok(())
    }

    async fn due_scheduled(
        &self,
        now: OffsetDateTime,
        owner: Option<OwnerId>,
    ) -> Result<Vec<ScheduledCall>, StoreError> {
        let rows = sqlx::query(
            "
            select *
            from scheduled_calls
            where status in ('pending', 'scheduled')
              and scheduled_time <= $1
              and ($2::bigint is null or owner = $2)
            order by scheduled_time
            ",
        )
        .bind(now)
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scheduled_from_row).collect()
    }
}
