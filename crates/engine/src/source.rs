//! Poll mode: pull `InsightEvent`s from an HTTP Insight Source and push them
//! through ingestion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use herald_common::config::SourceConfig;
use herald_common::error::AppError;
use herald_common::types::InsightEvent;

use crate::ingress::{IngestError, IngressAdapter};

#[async_trait]
pub trait InsightSource: Send + Sync {
    /// Fetch up to `limit` events. Returning an event more than once is fine;
    /// ingestion deduplicates.
    async fn fetch(&self, limit: u32) -> Result<Vec<InsightEvent>, AppError>;
}

/// `GET {url}?limit=N`, answered with either a JSON array of events or
/// `{"insights": [...]}`.
pub struct HttpInsightSource {
    client: Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceBatch {
    Bare(Vec<InsightEvent>),
    Wrapped { insights: Vec<InsightEvent> },
}

impl HttpInsightSource {
    pub fn new(url: String, api_key: Option<String>) -> Result<Self, AppError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl InsightSource for HttpInsightSource {
    async fn fetch(&self, limit: u32) -> Result<Vec<InsightEvent>, AppError> {
        let mut request = self.client.get(&self.url).query(&[("limit", limit)]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let batch: SourceBatch = request.send().await?.error_for_status()?.json().await?;
        Ok(match batch {
            SourceBatch::Bare(events) => events,
            SourceBatch::Wrapped { insights } => insights,
        })
    }
}

/// Counts for one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub fetched: u32,
    pub created: u32,
    pub duplicates: u32,
    pub rejected: u32,
}

pub struct InsightPoller {
    source: Arc<dyn InsightSource>,
    ingress: Arc<IngressAdapter>,
    batch_size: u32,
    interval: Duration,
}

impl InsightPoller {
    pub fn new(
        source: Arc<dyn InsightSource>,
        ingress: Arc<IngressAdapter>,
        config: &SourceConfig,
    ) -> Self {
        Self {
            source,
            ingress,
            batch_size: config.batch_size,
            interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    /// Build the HTTP poller if a source URL is configured.
    pub fn from_config(
        config: &SourceConfig,
        ingress: Arc<IngressAdapter>,
    ) -> Result<Option<Self>, AppError> {
        let Some(url) = &config.url else {
            return Ok(None);
        };
        let source = HttpInsightSource::new(url.clone(), config.api_key.clone())?;
        Ok(Some(Self::new(Arc::new(source), ingress, config)))
    }

    pub async fn poll_once(&self) -> Result<PollReport, AppError> {
        let events = self.source.fetch(self.batch_size).await?;
        let mut report = PollReport {
            fetched: events.len() as u32,
            ..PollReport::default()
        };

        for event in events {
            let insight_id = event.insight_id.clone();
            match self.ingress.ingest(event).await {
                Ok(receipt) if receipt.created => report.created += 1,
                Ok(_) => report.duplicates += 1,
                Err(IngestError::InvalidEvent(reason)) => {
                    tracing::warn!(insight_id, reason, "Polled insight rejected");
                    report.rejected += 1;
                }
                // Storage trouble: stop here and let the next poll retry.
                Err(IngestError::Storage(e)) => return Err(e),
            }
        }

        Ok(report)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "Insight poller started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(report) if report.fetched > 0 => {
                            tracing::info!(?report, "Polled insights");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Insight poll failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Insight poller stopped");
    }
}
