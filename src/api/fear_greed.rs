use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::SentimentReading;

pub const FEAR_GREED_API_BASE: &str = "https://api.alternative.me";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Client for the alternative.me Crypto Fear & Greed Index
#[derive(Clone)]
pub struct FearGreedClient {
    client: Client,
    base_url: String,
    backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct FngResponse {
    #[serde(default)]
    data: Vec<FngEntry>,
}

#[derive(Debug, Deserialize)]
struct FngEntry {
    value: String,
    #[serde(default)]
    value_classification: String,
    timestamp: String,
}

impl FngEntry {
    fn into_reading(self) -> Result<SentimentReading> {
        let value: u8 = self
            .value
            .trim()
            .parse()
            .with_context(|| format!("Invalid index value '{}'", self.value))?;
        if value > 100 {
            anyhow::bail!("Index value {} outside 0-100", value);
        }

        let secs: i64 = self
            .timestamp
            .trim()
            .parse()
            .with_context(|| format!("Invalid index timestamp '{}'", self.timestamp))?;
        let timestamp = DateTime::<Utc>::from_timestamp(secs, 0)
            .with_context(|| format!("Index timestamp {} out of range", secs))?;

        Ok(SentimentReading {
            timestamp,
            value,
            classification: self.value_classification,
        })
    }
}

impl FearGreedClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the initial retry backoff
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Most recent published reading
    pub async fn latest(&self) -> Result<SentimentReading> {
        self.history(1)
            .await?
            .into_iter()
            .next()
            .context("Fear & Greed response contained no data")
    }

    /// Up to `days` readings, most recent first
    pub async fn history(&self, days: u32) -> Result<Vec<SentimentReading>> {
        let days = days.max(1);
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.fetch_once(days).await {
                Ok(readings) => {
                    if attempt > 1 {
                        tracing::info!("✓ Fetched Fear & Greed after {} attempts", attempt);
                    }
                    return Ok(readings);
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        let backoff = self.backoff * 2_u32.pow(attempt - 1);
                        tracing::warn!(
                            "Fear & Greed attempt {}/{} failed: {}. Retrying in {:?}...",
                            attempt,
                            MAX_RETRIES,
                            e,
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("All Fear & Greed attempts failed")))
    }

    async fn fetch_once(&self, days: u32) -> Result<Vec<SentimentReading>> {
        let url = format!("{}/fng/?limit={}", self.base_url, days);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Fear & Greed API error ({})", status);
        }

        let body: FngResponse = response
            .json()
            .await
            .context("Failed to parse Fear & Greed response")?;

        let mut readings = body
            .data
            .into_iter()
            .map(FngEntry::into_reading)
            .collect::<Result<Vec<_>>>()?;

        if readings.is_empty() {
            anyhow::bail!("Fear & Greed response contained no data");
        }

        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        readings.truncate(days as usize);

        Ok(readings)
    }
}
