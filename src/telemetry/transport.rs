use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::debug;

use super::aggregator::BehavioralSummary;
use super::event::Event;
use crate::config::TelemetryConfig;
use crate::error::DeliveryError;

/// Supplies the bearer token consulted before every flush.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

/// Token holder the host updates on sign-in / sign-out.
#[derive(Debug, Default)]
pub struct StaticAuth {
    token: RwLock<Option<String>>,
}

impl StaticAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token: RwLock::new(token) }
    }

    pub async fn set(&self, token: Option<String>) {
        *self.token.write().await = token;
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn bearer_token(&self) -> Option<String> {
        self.token.read().await.clone().filter(|t| !t.is_empty())
    }
}

/// The network leg of a flush. Any `Ok` is a confirmed acknowledgment.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Ships one session's events as a JSON array.
    async fn send_batch(&self, token: &str, events: &[Event]) -> Result<(), DeliveryError>;

    /// Inserts one summary row.
    async fn send_summary(&self, token: &str, summary: &BehavioralSummary) -> Result<(), DeliveryError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    ingest_url: String,
    summary_url: String,
}

impl HttpTransport {
    /// Fails only when the TLS backend cannot be initialized.
    pub fn new(config: &TelemetryConfig) -> Result<Self, DeliveryError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            ingest_url: config.ingest_url(),
            summary_url: config.summary_url(),
        })
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, url: &str, token: &str, body: &T) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected { status: status.as_u16() });
        }
        debug!(url, status = status.as_u16(), "telemetry request acknowledged");
        Ok(())
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn send_batch(&self, token: &str, events: &[Event]) -> Result<(), DeliveryError> {
        self.post(&self.ingest_url, token, events).await
    }

    async fn send_summary(&self, token: &str, summary: &BehavioralSummary) -> Result<(), DeliveryError> {
        self.post(&self.summary_url, token, summary).await
    }
}
