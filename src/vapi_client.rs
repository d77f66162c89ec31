use crate::error::PlatformError;
use crate::vapi_types::{PlaceCallRequest, PlacedCall, PlatformErrorBody};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Outbound calls to the voice platform.  Every request is bounded by the client timeout and
/// is attempted exactly once.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn place_call(
        &self,
        api_key: &str,
        request: &PlaceCallRequest,
    ) -> Result<PlacedCall, PlatformError>;

    /// Current call object, as returned by `GET /call/{id}`.
    async fn get_call(&self, api_key: &str, call_id: &str) -> Result<Value, PlatformError>;
}

#[derive(Clone, Debug)]
pub struct VapiClient {
    http: reqwest::Client,
    base_url: String,
}

impl VapiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PlatformError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("interview-calls"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn json_body(response: reqwest::Response) -> Result<Value, PlatformError> {
        let status = response.status();
        if !status.is_success() {
            let body: PlatformErrorBody = response.json().await.unwrap_or_default();
            let message = body
                .describe()
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            warn!(status = status.as_u16(), message = %message, "platform request failed");
            return Err(PlatformError::Status {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| PlatformError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PlatformClient for VapiClient {
    async fn place_call(
        &self,
        api_key: &str,
        request: &PlaceCallRequest,
    ) -> Result<PlacedCall, PlatformError> {
        debug!(
            assistant_id = %request.assistant_id,
            phone_number_id = %request.phone_number_id,
            "placing call"
        );
        let response = self
            .http
            .post(format!("{}/call", self.base_url))
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;
        let body = Self::json_body(response).await?;
        PlacedCall::from_response(body)
            .ok_or_else(|| PlatformError::Decode("call response has no id".to_string()))
    }

    async fn get_call(&self, api_key: &str, call_id: &str) -> Result<Value, PlatformError> {
        debug!(call_id = %call_id, "fetching call");
        let response = self
            .http
            .get(format!("{}/call/{}", self.base_url, call_id))
            .bearer_auth(api_key)
            .send()
            .await?;
        Self::json_body(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vapi_types::Customer;
    use httpmock::{
        Method::{GET, POST},
        MockServer,
    };
    use serde_json::json;

    fn request() -> PlaceCallRequest {
        PlaceCallRequest {
            assistant_id: "asst-1".into(),
            phone_number_id: "pn-1".into(),
            customer: Customer {
                number: "+15550199".into(),
            },
        }
    }

    fn client(server: &MockServer) -> VapiClient {
        VapiClient::new(&server.base_url(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn place_call_posts_bearer_authenticated_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/call")
                    .header("authorization", "Bearer key-1")
                    .json_body(json!({
                        "assistantId": "asst-1",
                        "phoneNumberId": "pn-1",
                        "customer": { "number": "+15550199" }
                    }));
                then.status(201)
                    .json_body(json!({ "id": "call-9", "status": "queued" }));
            })
            .await;

        let placed = client(&server).place_call("key-1", &request()).await.unwrap();
        mock.assert_async().await;
        assert_eq!(placed.external_call_id, "call-9");
        assert_eq!(placed.initial_status.as_deref(), Some("queued"));
    }

    #[tokio::test]
    async fn non_success_surfaces_platform_message() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/call");
                then.status(400)
                    .json_body(json!({ "message": ["customer.number must be a valid phone number"] }));
            })
            .await;

        let err = client(&server)
            .place_call("key-1", &request())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PlatformError::Status { status: 400, ref message } if message.contains("valid phone number")
        ));
    }

    #[tokio::test]
    async fn response_without_id_is_a_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/call");
                then.status(200).json_body(json!({ "status": "queued" }));
            })
            .await;

        assert!(matches!(
            client(&server).place_call("key-1", &request()).await,
            Err(PlatformError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn get_call_returns_the_call_object() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/call/call-9")
                    .header("authorization", "Bearer key-1");
                then.status(200)
                    .json_body(json!({ "id": "call-9", "status": "ended" }));
            })
            .await;

        let body = client(&server).get_call("key-1", "call-9").await.unwrap();
        mock.assert_async().await;
        assert_eq!(body["status"], "ended");
    }
}
