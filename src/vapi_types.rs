use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Header carrying the shared server-URL secret on push events.
pub const SECRET_HEADER: &str = "x-vapi-secret";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub number: String,
}

/// Body of `POST /call`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceCallRequest {
    pub assistant_id: String,
    pub phone_number_id: String,
    pub customer: Customer,
}

/// What the platform tells us about a call it just accepted.
#[derive(Clone, Debug, PartialEq)]
pub struct PlacedCall {
    pub external_call_id: String,
    pub initial_status: Option<String>,
    pub raw: Value,
}

impl PlacedCall {
    pub fn from_response(raw: Value) -> Option<Self> {
        let external_call_id = raw
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())?
            .to_string();
        let initial_status = raw
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            external_call_id,
            initial_status,
            raw,
        })
    }
}

/// Error body returned by the platform on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
pub struct PlatformErrorBody {
    #[serde(default)]
    pub message: Value,
}

impl PlatformErrorBody {
    /// `message` is a string or a list of validation strings.
    pub fn describe(&self) -> Option<String> {
        match &self.message {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Array(items) => {
                let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                (!parts.is_empty()).then(|| parts.join("; "))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub name: String,
    pub tool_call_id: String,
    pub result: String,
}

/// Responses the platform expects to pre-call requests.
pub mod precall {
    use super::*;

    pub fn assistant_request() -> Value {
        json!({
            "error": "Sorry, no assistant is available at this time. Please call back later."
        })
    }

    pub fn transfer_destination_request() -> Value {
        json!({ "error": "No transfer destination available at this time." })
    }

    pub fn knowledge_base_request() -> Value {
        json!({ "documents": [] })
    }

    pub fn tool_calls(message: &Value) -> Value {
        let results: Vec<ToolCallResult> = message
            .get("toolCallList")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .map(|call| {
                        let name = call
                            .get("name")
                            .or_else(|| call.pointer("/function/name"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let tool_call_id = call
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let result = json!({
                            "status": "completed",
                            "message": format!("Tool {name} executed successfully"),
                        })
                        .to_string();
                        ToolCallResult {
                            name,
                            tool_call_id,
                            result,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        json!({ "results": results })
    }
}
