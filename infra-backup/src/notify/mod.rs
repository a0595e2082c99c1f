//! Leveled notifications.
//!
//! Every message is logged through `tracing`; messages at or above the
//! configured minimum level are also handed to the delivery channels
//! (a JSON webhook in production). Delivery failures are logged and
//! swallowed so a broken transport never changes a job outcome.

pub mod report;

use crate::config::Settings;
use crate::model::Status;
use crate::secret::Secret;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Success => "SUCCESS",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

impl From<Status> for Level {
    fn from(status: Status) -> Self {
        match status {
            Status::Pass => Level::Success,
            Status::Warning => Level::Warning,
            Status::Fail => Level::Error,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub level: Level,
    pub environment: String,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// A delivery transport for notifications.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Posts notifications as JSON to an HTTP endpoint.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    token: Option<Secret>,
}

impl WebhookChannel {
    pub fn new(url: String, token: Option<Secret>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        let mut request = self.client.post(&self.url).json(notification);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook responded with {}", response.status());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Notifier {
    environment: String,
    min_level: Level,
    channels: Vec<Arc<dyn Channel>>,
}

impl Notifier {
    /// A notifier that only logs.
    pub fn log_only(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            min_level: Level::Warning,
            channels: Vec::new(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut notifier = Self::log_only(&settings.environment);
        notifier.min_level = settings.notify.min_level;

        if let Some(url) = &settings.notify.webhook_url {
            let token = settings
                .notify
                .webhook_token_env
                .as_deref()
                .and_then(Secret::from_env);
            match WebhookChannel::new(
                url.clone(),
                token,
                Duration::from_secs(settings.notify.timeout_secs),
            ) {
                Ok(channel) => notifier.channels.push(Arc::new(channel)),
                Err(e) => warn!(error = %e, "Webhook channel disabled"),
            }
        }

        notifier
    }

    pub fn with_channel(mut self, channel: Arc<dyn Channel>, min_level: Level) -> Self {
        self.channels.push(channel);
        self.min_level = min_level;
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub async fn notify(&self, level: Level, subject: &str, body: &str) {
        match level {
            Level::Error => error!(level = %level, environment = %self.environment, "{subject}: {body}"),
            Level::Warning => warn!(level = %level, environment = %self.environment, "{subject}: {body}"),
            Level::Info | Level::Success => {
                info!(level = %level, environment = %self.environment, "{subject}: {body}")
            }
        }

        if level < self.min_level || self.channels.is_empty() {
            return;
        }

        let notification = Notification {
            level,
            environment: self.environment.clone(),
            subject: subject.to_string(),
            body: body.to_string(),
            sent_at: Utc::now(),
        };

        for channel in &self.channels {
            if let Err(e) = channel.deliver(&notification).await {
                warn!(channel = channel.name(), error = %e, "Notification delivery failed");
            }
        }
    }

    pub async fn info(&self, subject: &str, body: &str) {
        self.notify(Level::Info, subject, body).await
    }

    pub async fn success(&self, subject: &str, body: &str) {
        self.notify(Level::Success, subject, body).await
    }

    pub async fn warning(&self, subject: &str, body: &str) {
        self.notify(Level::Warning, subject, body).await
    }

    pub async fn error(&self, subject: &str, body: &str) {
        self.notify(Level::Error, subject, body).await
    }
}

/// In-memory channel that keeps every delivered notification.
#[derive(Default)]
pub struct RecordingChannel {
    delivered: std::sync::Mutex<Vec<Notification>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        self.delivered
            .lock()
            .map_err(|_| anyhow::anyhow!("recording channel poisoned"))?
            .push(notification.clone());
        Ok(())
    }
}
