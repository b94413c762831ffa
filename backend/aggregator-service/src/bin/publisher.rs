/// Load generator for aggregator-service
///
/// Sends a shuffled mix of unique events and resends to `POST /publish` in
/// batches, then logs the totals the aggregator's `/stats` should converge to.
use aggregator_service::models::{PublishEvent, PublishRequest};
use anyhow::{bail, Context};
use chrono::{SubsecRound, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const TOPICS: [&str; 2] = ["topic-x", "topic-y"];
const READY_RETRIES: u32 = 10;
const READY_BACKOFF: Duration = Duration::from_secs(2);
const BATCH_PAUSE: Duration = Duration::from_millis(100);

struct PublisherConfig {
    base_url: String,
    unique: usize,
    duplicates: usize,
    batch_size: usize,
}

impl PublisherConfig {
    fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let batch_size = env_usize("PUBLISH_BATCH_SIZE", 100)?;
        if batch_size == 0 {
            bail!("PUBLISH_BATCH_SIZE must be greater than zero");
        }

        Ok(Self {
            base_url: std::env::var("AGGREGATOR_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string())
                .trim_end_matches('/')
                .to_string(),
            unique: env_usize("PUBLISH_UNIQUE", 4000)?,
            duplicates: env_usize("PUBLISH_DUPLICATES", 1000)?,
            batch_size,
        })
    }
}

fn env_usize(key: &str, default: usize) -> anyhow::Result<usize> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn create_event(rng: &mut impl Rng) -> PublishEvent {
    let mut payload = serde_json::Map::new();
    payload.insert("value".to_string(), json!(rng.gen_range(1..=1000)));

    PublishEvent {
        topic: TOPICS[rng.gen_range(0..TOPICS.len())].to_string(),
        event_id: Uuid::new_v4().to_string(),
        timestamp: Utc::now().trunc_subsecs(0),
        source: "publisher".to_string(),
        payload,
    }
}

/// Unique events followed by resends of the first ones, shuffled
fn build_workload(unique: usize, duplicates: usize) -> Vec<PublishEvent> {
    let mut rng = rand::thread_rng();

    let mut events: Vec<PublishEvent> = (0..unique).map(|_| create_event(&mut rng)).collect();
    if unique > 0 {
        let resends: Vec<PublishEvent> = (0..duplicates)
            .map(|i| events[i % unique].clone())
            .collect();
        events.extend(resends);
    }

    events.shuffle(&mut rng);
    events
}

async fn wait_for_aggregator(client: &reqwest::Client, base_url: &str) -> bool {
    for attempt in 1..=READY_RETRIES {
        match client.get(format!("{}/", base_url)).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("Aggregator is up");
                return true;
            }
            Ok(resp) => warn!(status = %resp.status(), attempt, "Aggregator not ready"),
            Err(e) => warn!(error = %e, attempt, "Aggregator not reachable"),
        }
        tokio::time::sleep(READY_BACKOFF).await;
    }

    error!("Aggregator did not become ready after {} attempts", READY_RETRIES);
    false
}

async fn send_batch(client: &reqwest::Client, base_url: &str, batch: &[PublishEvent]) -> bool {
    let body = PublishRequest {
        events: batch.to_vec(),
    };

    match client
        .post(format!("{}/publish", base_url))
        .json(&body)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            info!(batch_size = batch.len(), "Batch sent");
            true
        }
        Ok(resp) => {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            warn!(%status, body = %text, "Batch rejected");
            false
        }
        Err(e) => {
            error!(error = %e, "Failed to send batch");
            false
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PublisherConfig::from_env()?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    if !wait_for_aggregator(&client, &config.base_url).await {
        bail!("aggregator at {} is not available", config.base_url);
    }

    let events = build_workload(config.unique, config.duplicates);
    info!(total = events.len(), "Starting publisher");

    let mut sent = 0usize;
    let mut rejected = 0usize;
    for batch in events.chunks(config.batch_size) {
        if send_batch(&client, &config.base_url, batch).await {
            sent += batch.len();
        } else {
            rejected += batch.len();
        }
        tokio::time::sleep(BATCH_PAUSE).await;
    }

    let expected_duplicates = if config.unique > 0 { config.duplicates } else { 0 };
    info!(
        sent,
        rejected,
        expected_unique = config.unique,
        expected_duplicates,
        "Publishing complete, check GET /stats on the aggregator"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn workload_contains_expected_resends() {
        let events = build_workload(50, 20);
        assert_eq!(events.len(), 70);

        let keys: HashSet<(String, String)> = events
            .iter()
            .map(|e| (e.event_id.clone(), e.topic.clone()))
            .collect();
        assert_eq!(keys.len(), 50);
        assert!(events.iter().all(|e| TOPICS.contains(&e.topic.as_str())));
    }

    #[test]
    fn no_resends_without_unique_events() {
        assert!(build_workload(0, 10).is_empty());
    }
}
