//! Outbound adapters: the remote event API client and the chat notifier.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use evtrack_core::{ErrorDetail, Event, MessageHandle, Reaction};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error, info_span, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding events response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Source of events newer than a cursor.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// One bounded page, ordered as the source assigned it.
    async fn fetch_events(&self, cursor: Option<&str>) -> Result<Vec<Event>, FetchError>;
}

#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub lookback: chrono::Duration,
    pub page_size: u32,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(20),
            lookback: chrono::Duration::hours(1),
            page_size: 100,
        }
    }

    pub fn events_url(&self) -> String {
        format!("{}/events", self.base_url.trim_end_matches('/'))
    }

    pub fn query_params(&self, cursor: Option<&str>, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let start_time = (now - self.lookback).to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut params = vec![
            ("startTime", start_time),
            ("limit", self.page_size.to_string()),
        ];
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            params.push(("after", cursor.to_string()));
        }
        params
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("lookback", &self.lookback)
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[derive(Debug)]
pub struct HttpEventSource {
    client: reqwest::Client,
    config: ApiConfig,
}

impl HttpEventSource {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building event api client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn fetch_events(&self, cursor: Option<&str>) -> Result<Vec<Event>, FetchError> {
        let url = self.config.events_url();
        let params = self.config.query_params(cursor, Utc::now());
        let span = info_span!("fetch_events", url = %url, cursor = cursor.unwrap_or("none"));

        async {
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.config.api_key)
                .query(&params)
                .send()
                .await
                .map_err(FetchError::Request)?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let events = resp.json::<Vec<Event>>().await.map_err(FetchError::Decode)?;
            debug!(count = events.len(), "received events page");
            Ok(events)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("slack request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("slack {method} returned http status {status}")]
    HttpStatus { method: &'static str, status: u16 },
    #[error("slack {method} failed: {error}")]
    Api { method: &'static str, error: String },
    #[error("slack {method} response carried no message ts")]
    MissingTs { method: &'static str },
}

/// Best-effort status channel. Implementations log and swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_error(&self, context: &str, error: &anyhow::Error) -> Option<MessageHandle>;

    async fn send_success(&self, message: &str) -> Option<MessageHandle>;

    async fn send_detail(&self, parent: &MessageHandle, detail: &ErrorDetail);

    async fn add_reaction(&self, handle: &MessageHandle, reaction: Reaction);
}

#[derive(Clone)]
pub struct SlackConfig {
    pub bot_token: String,
    pub channel: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl SlackConfig {
    pub fn new(bot_token: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            channel: channel.into(),
            api_base: "https://slack.com/api".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackConfig")
            .field("bot_token", &"<redacted>")
            .field("channel", &self.channel)
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
pub struct SlackNotifier {
    client: reqwest::Client,
    config: SlackConfig,
}

impl SlackNotifier {
    pub fn new(config: SlackConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building slack client")?;
        Ok(Self { client, config })
    }

    async fn call(&self, method: &'static str, body: &JsonValue) -> Result<SlackResponse, NotifyError> {
        let url = format!("{}/{}", self.config.api_base.trim_end_matches('/'), method);
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.config.bot_token)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::HttpStatus {
                method,
                status: status.as_u16(),
            });
        }

        let parsed = resp.json::<SlackResponse>().await?;
        if !parsed.ok {
            return Err(NotifyError::Api {
                method,
                error: parsed.error.unwrap_or_else(|| "unknown".to_string()),
            });
        }
        Ok(parsed)
    }

    async fn post_message(&self, mut body: JsonValue) -> Result<MessageHandle, NotifyError> {
        body["channel"] = JsonValue::String(self.config.channel.clone());
        let resp = self.call("chat.postMessage", &body).await?;
        resp.ts.map(MessageHandle::new).ok_or(NotifyError::MissingTs {
            method: "chat.postMessage",
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send_error(&self, context: &str, error: &anyhow::Error) -> Option<MessageHandle> {
        match self.post_message(error_message(context, error, Utc::now())).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "failed to send slack error notification");
                None
            }
        }
    }

    async fn send_success(&self, message: &str) -> Option<MessageHandle> {
        match self.post_message(success_message(message)).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "failed to send slack success notification");
                None
            }
        }
    }

    async fn send_detail(&self, parent: &MessageHandle, detail: &ErrorDetail) {
        if let Err(err) = self.post_message(detail_message(parent, detail)).await {
            error!(error = %err, parent = %parent, "failed to send slack thread detail");
        }
    }

    async fn add_reaction(&self, handle: &MessageHandle, reaction: Reaction) {
        let body = json!({
            "channel": self.config.channel,
            "timestamp": handle.ts,
            "name": reaction.name(),
        });
        if let Err(err) = self.call("reactions.add", &body).await {
            error!(error = %err, message = %handle, reaction = reaction.name(), "failed to add slack reaction");
        }
    }
}

fn error_message(context: &str, error: &anyhow::Error, now: DateTime<Utc>) -> JsonValue {
    let causes = error
        .chain()
        .skip(1)
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let mut blocks = vec![
        json!({
            "type": "header",
            "text": { "type": "plain_text", "text": "🚨 Error Alert", "emoji": true }
        }),
        json!({
            "type": "section",
            "fields": [
                { "type": "mrkdwn", "text": format!("*Context:*\n{context}") },
                { "type": "mrkdwn", "text": format!("*Time:*\n{}", now.to_rfc3339_opts(SecondsFormat::Millis, true)) }
            ]
        }),
        json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*Error Message:*\n```{error}```") }
        }),
    ];
    if !causes.is_empty() {
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*Caused by:*\n```{}```", causes.join("\n")) }
        }));
    }

    json!({ "text": format!("Error Alert: {context}"), "blocks": blocks })
}

fn success_message(message: &str) -> JsonValue {
    json!({
        "text": message,
        "blocks": [
            {
                "type": "header",
                "text": { "type": "plain_text", "text": "✅ Success", "emoji": true }
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": message }
            }
        ]
    })
}

fn detail_message(parent: &MessageHandle, detail: &ErrorDetail) -> JsonValue {
    let pretty = serde_json::to_string_pretty(detail).unwrap_or_else(|_| format!("{detail:?}"));
    json!({
        "thread_ts": parent.ts,
        "text": format!("Failed to process event {}", detail.event_id),
        "blocks": [
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*Detailed Information:*\n```{pretty}```") }
            }
        ]
    })
}
