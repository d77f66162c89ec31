use crate::db_types::{Assistant, CallRecord, PhoneNumber};
use crate::error::CoreError;
use crate::event::CallEvent;

use tracing::{debug, error};

/// A stored call together with the assistant and phone number it references.
#[derive(Clone, Debug, PartialEq)]
pub struct CallContext {
    pub record: CallRecord,
    pub assistant: Assistant,
    pub phone_number: PhoneNumber,
}

/// Confirm that an event about `ctx.record` really belongs to the record's tenant.
///
/// All four checks always run in this order; the first mismatch rejects the event.
pub fn validate_ownership(ctx: &CallContext, event: &CallEvent) -> Result<(), CoreError> {
    let record = &ctx.record;
    let violation = |reason: String| {
        error!(
            call_id = %record.external_id,
            owner = record.owner,
            claimed_assistant = ?event.claimed_assistant_id,
            stored_assistant = %ctx.assistant.external_id,
            claimed_phone_number = ?event.claimed_phone_number_id,
            stored_phone_number = %ctx.phone_number.external_id,
            reason = %reason,
            "ownership violation, event rejected"
        );
        Err(CoreError::OwnershipViolation {
            call_id: record.external_id.clone(),
            reason,
        })
    };

    if ctx.assistant.id != record.assistant || ctx.phone_number.id != record.phone_number {
        return violation("loaded references do not match the record".to_string());
    }
    if event.claimed_assistant_id.as_deref() != Some(ctx.assistant.external_id.as_str()) {
        return violation("assistant id mismatch".to_string());
    }
    if ctx.assistant.owner != record.owner {
        return violation(format!(
            "assistant owner {} differs from call owner",
            ctx.assistant.owner
        ));
    }
    if let Some(claimed) = &event.claimed_phone_number_id {
        if claimed != &ctx.phone_number.external_id {
            return violation("phone number id mismatch".to_string());
        }
    }
    if ctx.phone_number.owner != record.owner {
        return violation(format!(
            "phone number owner {} differs from call owner",
            ctx.phone_number.owner
        ));
    }

    debug!(call_id = %record.external_id, owner = record.owner, "call ownership validated");
    Ok(())
}
