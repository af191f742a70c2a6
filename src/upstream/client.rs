//! HTTP client for the upstream social-network API
//!
//! Every method is called as `POST {base_url}/method/{name}` with form
//! parameters, the API version in `v` and the user's token as a bearer
//! credential. Several calls can be combined into one `execute` request,
//! whose result is the ordered list of the sub-call results.

use crate::config::UpstreamConfig;
use crate::error::{UpstreamError, RATE_LIMIT_CODE};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One logical API call
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    /// Method name such as `groups.getMembers`
    pub method: String,
    pub params: Map<String, Value>,
}

impl ApiCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Render as an `execute` sub-call, e.g. `API.groups.getMembers({"group_id":42})`
    pub fn to_code(&self) -> String {
        format!(
            "API.{}({})",
            self.method,
            Value::Object(self.params.clone())
        )
    }

    /// Parameters as form fields
    fn form_fields(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect()
    }
}

/// Build the `execute` code returning the results of `calls` in order
pub fn execute_code(calls: &[ApiCall]) -> String {
    let calls: Vec<String> = calls.iter().map(ApiCall::to_code).collect();
    format!("return[{}];", calls.join(","))
}

/// Upstream API bound to one access credential
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Call a single method and return its `response` value
    async fn call(&self, call: &ApiCall) -> Result<Value, UpstreamError>;

    /// Run `calls` in one physical request and return their results in order
    ///
    /// Fails as a whole if any sub-call failed.
    async fn execute(&self, calls: &[ApiCall]) -> Result<Vec<Value>, UpstreamError>;
}

/// Builds an API client for a user's access token
pub trait UpstreamConnector: Send + Sync {
    fn connect(&self, access_token: &str) -> Arc<dyn UpstreamApi>;
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

impl From<ApiErrorBody> for UpstreamError {
    fn from(body: ApiErrorBody) -> Self {
        UpstreamError::from_code(body.error_code, body.error_msg)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    execute_errors: Vec<ApiErrorBody>,
}

/// reqwest-based [`UpstreamApi`]
#[derive(Clone)]
pub struct HttpApiClient {
    client: Client,
    base_url: String,
    api_version: String,
    access_token: String,
}

impl std::fmt::Debug for HttpApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApiClient")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl HttpApiClient {
    /// Create a new client with its own connection pool
    pub fn new(config: &UpstreamConfig, access_token: &str) -> Result<Self, UpstreamError> {
        Ok(Self::with_client(
            build_http_client(config)?,
            config,
            access_token,
        ))
    }

    /// Create a client sharing an existing reqwest Client
    pub fn with_client(client: Client, config: &UpstreamConfig, access_token: &str) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            access_token: access_token.to_string(),
        }
    }

    async fn post(
        &self,
        method: &str,
        mut form: Vec<(String, String)>,
    ) -> Result<Envelope, UpstreamError> {
        let url = format!("{}/method/{}", self.base_url, method);
        form.push(("v".to_string(), self.api_version.clone()));

        debug!(method = method, "Sending upstream request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::NetworkTimeout
                } else {
                    UpstreamError::Network(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs);

                warn!(method = method, retry_after = ?retry_after, "Rate limited by upstream");
                return Err(UpstreamError::RateLimited { retry_after });
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(method = method, status = ?response.status(), "Unauthorized");
                return Err(UpstreamError::Unauthorized);
            }
            status => {
                warn!(method = method, status = status.as_u16(), "Unexpected status");
                return Err(UpstreamError::ServerError(status.as_u16()));
            }
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidData(e.to_string()))?;

        if let Some(error) = envelope.error {
            debug!(
                method = method,
                code = error.error_code,
                message = %error.error_msg,
                "Upstream returned an error"
            );
            return Err(error.into());
        }

        Ok(envelope)
    }
}

#[async_trait]
impl UpstreamApi for HttpApiClient {
    async fn call(&self, call: &ApiCall) -> Result<Value, UpstreamError> {
        let envelope = self.post(&call.method, call.form_fields()).await?;
        envelope
            .response
            .ok_or_else(|| UpstreamError::InvalidData("missing response".to_string()))
    }

    async fn execute(&self, calls: &[ApiCall]) -> Result<Vec<Value>, UpstreamError> {
        let form = vec![("code".to_string(), execute_code(calls))];
        let envelope = self.post("execute", form).await?;

        let response = envelope
            .response
            .ok_or_else(|| UpstreamError::InvalidData("missing response".to_string()))?;

        collect_execute_results(calls.len(), response, envelope.execute_errors)
    }
}

/// Check an `execute` response against the calls that produced it
///
/// A failed sub-call shows up as `false` with its error in `execute_errors`.
/// Rate limiting of any sub-call makes the whole request transient.
fn collect_execute_results(
    expected: usize,
    response: Value,
    execute_errors: Vec<ApiErrorBody>,
) -> Result<Vec<Value>, UpstreamError> {
    let results = match response {
        Value::Array(results) => results,
        other => {
            return Err(UpstreamError::InvalidData(format!(
                "execute returned {} instead of an array",
                json_kind(&other)
            )))
        }
    };

    if results.len() != expected {
        return Err(UpstreamError::InvalidData(format!(
            "execute returned {} results for {} calls",
            results.len(),
            expected
        )));
    }

    if results.iter().any(|r| r == &Value::Bool(false)) {
        if execute_errors.iter().any(|e| e.error_code == RATE_LIMIT_CODE) {
            return Err(UpstreamError::RateLimited { retry_after: None });
        }

        return Err(match execute_errors.into_iter().next() {
            Some(error) => error.into(),
            None => UpstreamError::InvalidData("execute sub-call failed".to_string()),
        });
    }

    Ok(results)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn build_http_client(config: &UpstreamConfig) -> Result<Client, UpstreamError> {
    Client::builder()
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| UpstreamError::Network(format!("Failed to create HTTP client: {}", e)))
}

/// [`UpstreamConnector`] producing [`HttpApiClient`]s over one shared pool
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    config: UpstreamConfig,
}

impl HttpConnector {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        Ok(Self {
            client: build_http_client(&config)?,
            config,
        })
    }
}

impl UpstreamConnector for HttpConnector {
    fn connect(&self, access_token: &str) -> Arc<dyn UpstreamApi> {
        Arc::new(HttpApiClient::with_client(
            self.client.clone(),
            &self.config,
            access_token,
        ))
    }
}
