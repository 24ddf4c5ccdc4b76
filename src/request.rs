use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{FetchError, Result};

const MUTATING_METHODS: [&str; 3] = ["POST", "PUT", "DELETE"];

/// Fetch-style request options.
///
/// Everything except `method` is passed through to the network call
/// untouched; the handler never looks inside `body`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Credentials mode (`omit`, `same-origin`, `include`). Kept for
    /// compatibility with callers; cookies are managed by the HTTP client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

impl RequestConfig {
    /// A GET request with no headers or body.
    pub fn get() -> Self {
        Self::default()
    }

    /// A POST request carrying `body`.
    pub fn post(body: impl Into<String>) -> Self {
        Self::with_method("POST").body(body)
    }

    /// A PUT request carrying `body`.
    pub fn put(body: impl Into<String>) -> Self {
        Self::with_method("PUT").body(body)
    }

    /// A DELETE request with no body.
    pub fn delete() -> Self {
        Self::with_method("DELETE")
    }

    /// A request with an arbitrary method name. Names that are not valid
    /// HTTP tokens fail every attempt as a transport error.
    pub fn with_method(method: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            ..Self::default()
        }
    }

    /// Sets a header, replacing any previous value under the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the request body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `value` as the body and sets a JSON content type.
    pub fn json<T: Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_string(value)
            .map_err(|err| FetchError::InvalidRequest(format!("body is not serializable: {err}")))?;
        Ok(self
            .header("Content-Type", "application/json")
            .body(body))
    }

    /// Upper-cased method name, `GET` when unset.
    pub fn method_name(&self) -> String {
        self.method
            .as_deref()
            .map(str::trim)
            .filter(|method| !method.is_empty())
            .unwrap_or("GET")
            .to_ascii_uppercase()
    }

    /// Whether the method is POST, PUT or DELETE.
    pub fn is_mutating(&self) -> bool {
        MUTATING_METHODS.contains(&self.method_name().as_str())
    }

    pub(crate) fn http_method(&self) -> Result<Method> {
        let name = self.method_name();
        Method::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("invalid method '{name}'")))
    }

    pub(crate) fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|key| key.eq_ignore_ascii_case(name))
    }
}

/// Identity of a request, stable across retries and restarts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates `req_<unix-millis>_<9 random chars>`.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis();
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("req_{millis}_{}", &random[..9]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A network call that has not been confirmed yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    pub id: RequestId,
    pub url: String,
    #[serde(default)]
    pub options: RequestConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueuedRequest {
    pub fn new(url: impl Into<String>, options: RequestConfig) -> Self {
        Self {
            id: RequestId::generate(),
            url: url.into(),
            options,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn is_mutating(&self) -> bool {
        self.options.is_mutating()
    }
}

/// Archived request that exhausted its retry budget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRequestRecord {
    #[serde(flatten)]
    pub request: QueuedRequest,
    pub failed_at: DateTime<Utc>,
}

impl FailedRequestRecord {
    pub fn new(request: QueuedRequest) -> Self {
        Self {
            request,
            failed_at: Utc::now(),
        }
    }
}

/// Diagnostic snapshot of one queued request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntryStatus {
    pub id: RequestId,
    pub url: String,
    pub method: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&QueuedRequest> for QueueEntryStatus {
    fn from(request: &QueuedRequest) -> Self {
        Self {
            id: request.id.clone(),
            url: request.url.clone(),
            method: request.options.method_name(),
            retry_count: request.retry_count,
            created_at: request.created_at,
        }
    }
}

/// Diagnostic snapshot of the whole queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub is_online: bool,
    pub requests: Vec<QueueEntryStatus>,
}
