use rust_decimal::Decimal;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Parse a platform timestamp (`2024-05-01T10:00:00.000Z`).  Unparseable values are absent.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339)
        .map_err(|e| debug!(raw = %raw, error = %e, "ignoring unparseable timestamp"))
        .ok()
}

/// Platform amounts arrive as JSON numbers or numeric strings.
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .ok()
}

/// `yyyymmdd_hhmmss`, used in artifact file names.
pub fn compact_timestamp(at: OffsetDateTime) -> String {
    at.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))
    .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

fn sanitize_for_path(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write a copy of a raw webhook body for auditing.  Never fails the caller.
pub async fn save_webhook_event(
    dir: &Path,
    event_type: &str,
    call_id: Option<&str>,
    body: &Value,
) -> Option<PathBuf> {
    let file_name = format!(
        "{}_{}_{}_{}.json",
        sanitize_for_path(event_type),
        sanitize_for_path(call_id.unwrap_or("no_call_id")),
        compact_timestamp(OffsetDateTime::now_utc()),
        Uuid::new_v4().simple()
    );
    let path = dir.join(file_name);
    let contents = match serde_json::to_vec_pretty(body) {
        Ok(contents) => contents,
        Err(e) => {
            error!(error = %e, "failed to serialize webhook event");
            return None;
        }
    };
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        error!(error = %e, dir = %dir.display(), "failed to create webhook log dir");
        return None;
    }
    match tokio::fs::write(&path, contents).await {
        Ok(()) => {
            info!(path = %path.display(), "webhook event saved");
            Some(path)
        }
        Err(e) => {
            error!(error = %e, path = %path.display(), "failed to save webhook event");
            None
        }
    }
}
