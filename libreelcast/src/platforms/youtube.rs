//! YouTube reference adapter
//!
//! Publishes through the Data API's resumable upload: one request opens an
//! upload session carrying the video metadata, a second one streams the media
//! into it. Media is read from the task's content URI (`http(s)://`,
//! `file://` or a plain path).
//!
//! Outcome classification:
//! - 2xx: `Accepted(video id)`
//! - 429, or 403 with a quota/rate-limit reason: `RateLimited(Retry-After)`
//! - any other 4xx: `RejectedPermanently(API message)`
//! - 5xx, transport errors: `TransientFailure`

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::config::YouTubeConfig;
use crate::platforms::{PlatformAdapter, PlatformResult};
use crate::types::{ContentRef, PlatformId};

/// Error reasons YouTube uses for quota and throttling
const RATE_LIMIT_REASONS: &[&str] = &[
    "quotaExceeded",
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "uploadLimitExceeded",
];

pub struct YouTubeAdapter {
    http: reqwest::Client,
    api_base: String,
    privacy_status: String,
}

#[derive(Deserialize)]
struct VideoResource {
    id: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    reason: String,
}

impl YouTubeAdapter {
    pub fn new(config: &YouTubeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();

        Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            privacy_status: config.privacy_status.clone(),
        }
    }

    fn metadata(&self, content: &ContentRef) -> serde_json::Value {
        serde_json::json!({
            "snippet": {
                "title": content.title,
                "description": content.description.clone().unwrap_or_default(),
                "tags": content.tags,
            },
            "status": {
                "privacyStatus": self.privacy_status,
            }
        })
    }

    /// Open a resumable upload session and return its URL
    async fn open_session(
        &self,
        access_token: &SecretString,
        content: &ContentRef,
        media_len: usize,
    ) -> Result<String, PlatformResult> {
        let url = format!(
            "{}/upload/youtube/v3/videos?uploadType=resumable&part=snippet,status",
            self.api_base
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token.expose_secret())
            .header("X-Upload-Content-Type", "video/*")
            .header("X-Upload-Content-Length", media_len.to_string())
            .json(&self.metadata(content))
            .send()
            .await
            .map_err(|e| transport_failure("upload session", e))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &headers, &body));
        }

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                PlatformResult::TransientFailure(
                    "upload session response had no Location header".to_string(),
                )
            })
    }

    async fn upload_media(
        &self,
        access_token: &SecretString,
        session_url: &str,
        media: Vec<u8>,
    ) -> PlatformResult {
        let response = match self
            .http
            .put(session_url)
            .bearer_auth(access_token.expose_secret())
            .header(reqwest::header::CONTENT_TYPE, "video/*")
            .body(media)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return transport_failure("media upload", e),
        };

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return classify_failure(status, &headers, &body);
        }

        match response.json::<VideoResource>().await {
            Ok(video) => PlatformResult::Accepted(video.id),
            Err(e) => PlatformResult::TransientFailure(format!(
                "upload finished but response was unreadable: {}",
                e
            )),
        }
    }

    /// Fetch the media bytes the content URI points at
    async fn load_media(&self, uri: &str) -> Result<Vec<u8>, PlatformResult> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            let response = self
                .http
                .get(uri)
                .send()
                .await
                .map_err(|e| transport_failure("media fetch", e))?;

            let status = response.status();
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(PlatformResult::TransientFailure(format!(
                    "media fetch returned {}",
                    status
                )));
            }
            if !status.is_success() {
                return Err(PlatformResult::RejectedPermanently(format!(
                    "media unavailable at {} ({})",
                    uri, status
                )));
            }

            return response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| transport_failure("media fetch", e));
        }

        let path = uri.strip_prefix("file://").unwrap_or(uri);
        tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PlatformResult::RejectedPermanently(format!("media not found: {}", path))
            } else {
                PlatformResult::TransientFailure(format!("media read failed: {}", e))
            }
        })
    }
}

fn transport_failure(stage: &str, err: reqwest::Error) -> PlatformResult {
    PlatformResult::TransientFailure(format!("{} failed: {}", stage, err))
}

/// Retry-After in delta-seconds form
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map a non-2xx API response onto a result variant
pub(crate) fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &str) -> PlatformResult {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();

    let rate_limited_reason = parsed.as_ref().is_some_and(|b| {
        b.error
            .errors
            .iter()
            .any(|e| RATE_LIMIT_REASONS.contains(&e.reason.as_str()))
    });

    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && rate_limited_reason)
    {
        return PlatformResult::RateLimited(retry_after(headers));
    }

    let message = parsed
        .map(|b| b.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("YouTube API returned {}", status));

    if status.is_client_error() {
        PlatformResult::RejectedPermanently(message)
    } else {
        PlatformResult::TransientFailure(message)
    }
}

#[async_trait]
impl PlatformAdapter for YouTubeAdapter {
    fn platform(&self) -> PlatformId {
        PlatformId::YouTube
    }

    async fn publish(&self, access_token: &SecretString, content: &ContentRef) -> PlatformResult {
        if content.title.trim().is_empty() {
            return PlatformResult::RejectedPermanently("video title must not be empty".to_string());
        }

        let media = match self.load_media(&content.uri).await {
            Ok(media) => media,
            Err(result) => return result,
        };

        tracing::debug!(
            "Uploading {} bytes to YouTube for '{}'",
            media.len(),
            content.title
        );

        let session_url = match self.open_session(access_token, content, media.len()).await {
            Ok(url) => url,
            Err(result) => return result,
        };

        self.upload_media(access_token, &session_url, media).await
    }
}
