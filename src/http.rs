//! Rate-limit-aware HTTP client for the REST API.
//!
//! All outbound HTTP calls go through [`HttpClient`] so that auth headers,
//! bucket admission, and outcome classification live in one place. Broken
//! preconditions (401, 429, 5xx, transport failures) are raised as
//! [`BotError`]; every other response comes back as an [`ApiResponse`].

use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BotConfig;
use crate::error::{BotError, BotResult};
use crate::ratelimit::{header_secs, BucketLimiter};
use crate::types::RateLimitInfo;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const USER_AGENT: &str = concat!("hello-gateway/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// `{ success, data?, error?, code? }` returned by every REST call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default = "none", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
}

/// Payload type for endpoints whose body is irrelevant.
pub type NoContent = serde::de::IgnoredAny;

fn none<T>() -> Option<T> {
    None
}

impl<T> ApiResponse<T> {
    pub fn ok(data: Option<T>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            code: None,
        }
    }

    pub fn failure(error: impl Into<String>, code: Option<u32>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            code,
        }
    }

    /// The payload, or a [`BotError::Rejected`] for a failed envelope.
    ///
    /// A successful envelope without data (e.g. 204) is also a rejection
    /// here; use [`ApiResponse::into_unit`] for endpoints with no body.
    pub fn into_data(self) -> BotResult<T> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(BotError::Rejected {
                code: self.code,
                message: "response carried no data".to_string(),
            }),
            (false, _) => Err(BotError::Rejected {
                code: self.code,
                message: self.error.unwrap_or_else(|| "request failed".to_string()),
            }),
        }
    }

    /// `Ok(())` for a successful envelope, regardless of payload.
    pub fn into_unit(self) -> BotResult<()> {
        if self.success {
            Ok(())
        } else {
            Err(BotError::Rejected {
                code: self.code,
                message: self.error.unwrap_or_else(|| "request failed".to_string()),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

// ---------------------------------------------------------------------------
// Parse rate-limit headers
// ---------------------------------------------------------------------------

pub fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitInfo {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    RateLimitInfo {
        limit: get("x-ratelimit-limit").and_then(|s| s.parse::<u32>().ok()),
        remaining: get("x-ratelimit-remaining").and_then(|s| s.parse::<u32>().ok()),
        reset_at: get("x-ratelimit-reset").and_then(|s| s.parse::<f64>().ok()),
        reset_after: get("x-ratelimit-reset-after").and_then(|s| s.parse::<f64>().ok()),
        is_global: get("x-ratelimit-global")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    }
}

// ---------------------------------------------------------------------------
// Outcome classification
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
    code: Option<u32>,
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

impl ErrorBody {
    fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    fn text(&self, body: &[u8], fallback: &str) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .or_else(|| {
                let raw = String::from_utf8_lossy(body);
                let raw = raw.trim();
                (!raw.is_empty()).then(|| raw.chars().take(200).collect())
            })
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// Turn a raw HTTP outcome into a typed result.
///
/// `retry_after` is the parsed `retry-after` header, if any.
pub fn classify<T: DeserializeOwned>(
    route: &str,
    status: u16,
    info: &RateLimitInfo,
    retry_after: Option<f64>,
    body: &[u8],
) -> BotResult<ApiResponse<T>> {
    match status {
        200..=299 => parse_success(body),
        401 => {
            let err = ErrorBody::parse(body);
            Err(BotError::Authentication(err.text(body, "unauthorized")))
        }
        429 => {
            let err = ErrorBody::parse(body);
            let secs = retry_after
                .or(err.retry_after)
                .or(info.reset_after)
                .unwrap_or(1.0);
            Err(BotError::RateLimited {
                route: route.to_string(),
                retry_after: header_secs(secs.min(3600.0)),
                global: info.is_global || err.global,
            })
        }
        500..=u16::MAX => {
            let err = ErrorBody::parse(body);
            Err(BotError::Server {
                status,
                message: err.text(body, "internal server error"),
            })
        }
        _ => {
            let err = ErrorBody::parse(body);
            let message = err.text(body, "request failed");
            Ok(ApiResponse::failure(message, err.code.or(Some(u32::from(status)))))
        }
    }
}

fn parse_success<T: DeserializeOwned>(body: &[u8]) -> BotResult<ApiResponse<T>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ApiResponse::ok(None));
    }
    let value: serde_json::Value = serde_json::from_slice(body)?;

    // Some endpoints already wrap their payload in the envelope.
    let is_envelope = value
        .as_object()
        .map(|obj| {
            obj.get("success").is_some_and(|s| s.is_boolean())
                && (obj.contains_key("data") || obj.contains_key("error"))
        })
        .unwrap_or(false);

    if is_envelope {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(ApiResponse::ok(Some(serde_json::from_value(value)?)))
    }
}

// ---------------------------------------------------------------------------
// HttpClient
// ---------------------------------------------------------------------------

/// A thin, rate-limit-aware HTTP client for the REST API.
///
/// Cheap to clone (internals are behind `Arc`).
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    token: Arc<RwLock<Option<String>>>,
    limiter: Arc<BucketLimiter>,
}

impl HttpClient {
    pub fn new(config: &BotConfig, limiter: Arc<BucketLimiter>) -> BotResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .build()?;

        let token = config
            .token
            .as_deref()
            .map(|t| t.strip_prefix("Bot ").unwrap_or(t).to_string());

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: Arc::new(RwLock::new(token)),
            limiter,
        })
    }

    /// Replace the token used for the `Authorization` header.
    pub fn set_token(&self, token: impl Into<String>) {
        let mut slot = self.token.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some(token.into());
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn limiter(&self) -> &Arc<BucketLimiter> {
        &self.limiter
    }

    // ------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> BotResult<ApiResponse<T>> {
        self.request(Method::Get, path, None).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> BotResult<ApiResponse<T>> {
        let body = serde_json::to_value(body)?;
        self.request(Method::Post, path, Some(&body)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> BotResult<ApiResponse<T>> {
        let body = serde_json::to_value(body)?;
        self.request(Method::Put, path, Some(&body)).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> BotResult<ApiResponse<T>> {
        let body = serde_json::to_value(body)?;
        self.request(Method::Patch, path, Some(&body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> BotResult<ApiResponse<T>> {
        self.request(Method::Delete, path, None).await
    }

    /// POST a file as `multipart/form-data` with an optional `payload_json`
    /// part.
    pub async fn upload<T: DeserializeOwned>(
        &self,
        path: &str,
        filename: &str,
        file: Vec<u8>,
        payload: Option<&serde_json::Value>,
    ) -> BotResult<ApiResponse<T>> {
        let route = format!("{} /{}", Method::Post, path.trim_start_matches('/'));
        self.limiter.await_admission(&route).await;

        let part = reqwest::multipart::Part::bytes(file)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")?;
        let mut form = reqwest::multipart::Form::new().part("file", part);
        if let Some(payload) = payload {
            form = form.text("payload_json", serde_json::to_string(payload)?);
        }

        let req = self
            .authorized(self.client.post(self.url(path)))
            .multipart(form);
        self.execute(&route, req).await
    }

    // ------------------------------------------------------------------
    // Low-level: the single request method everything funnels through
    // ------------------------------------------------------------------

    /// Send `method` to `{base_url}/{path}` after bucket admission.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> BotResult<ApiResponse<T>> {
        let route = format!("{} /{}", method, path.trim_start_matches('/'));
        self.limiter.await_admission(&route).await;

        let mut req = self
            .authorized(self.client.request(method.into(), self.url(path)));
        if let Some(json) = body {
            req = req.json(json);
        }
        self.execute(&route, req).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        route: &str,
        req: RequestBuilder,
    ) -> BotResult<ApiResponse<T>> {
        debug!(route, "sending request");
        let resp = req.send().await?;

        let status = resp.status().as_u16();
        let info = parse_rate_limit_headers(resp.headers());
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<f64>().ok());

        self.limiter.record_response(route, &info);

        let body = resp.bytes().await?;
        let outcome = classify(route, status, &info, retry_after, &body);

        if let Err(BotError::RateLimited {
            retry_after,
            global,
            ..
        }) = &outcome
        {
            warn!(
                route,
                retry_after_ms = retry_after.as_millis() as u64,
                global,
                "rate-limited by server"
            );
            if *global {
                self.limiter.record_global(*retry_after);
            } else {
                self.limiter.record_response(
                    route,
                    &RateLimitInfo {
                        remaining: Some(0),
                        reset_after: Some(retry_after.as_secs_f64()),
                        ..info
                    },
                );
            }
        }

        outcome
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token() {
            Some(token) => req.header(AUTHORIZATION, format!("Bot {}", token)),
            None => req,
        }
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
