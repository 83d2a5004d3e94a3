use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

/// Read-side view of the worker fleet's software health. The marketplace can
/// report a lease as `running` while the worker process inside it never
/// registered; only the health collaborator can tell the difference.
#[async_trait]
pub trait WorkerHealth: Send + Sync {
    /// Map of worker-name -> responsive. Names follow the identity scheme,
    /// so they can be tied back to marketplace instance ids.
    async fn workers(&self) -> anyhow::Result<HashMap<String, bool>>;

    /// Count of queued, unclaimed jobs (the demand signal).
    async fn queue_backlog(&self) -> anyhow::Result<u64>;
}

/// Flower-backed implementation (the queue monitor the workers register with).
pub struct FlowerHealth {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct QueueLength {
    #[serde(default)]
    active_queues: Vec<QueueEntry>,
}

#[derive(Deserialize)]
struct QueueEntry {
    #[serde(default)]
    messages: u64,
}

impl FlowerHealth {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl WorkerHealth for FlowerHealth {
    async fn workers(&self) -> anyhow::Result<HashMap<String, bool>> {
        let url = format!("{}/workers", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("refresh", "true"), ("status", "true")])
            .send()
            .await
            .context("worker-health /workers request failed")?
            .error_for_status()
            .context("worker-health /workers returned an error status")?;
        let workers: HashMap<String, bool> = resp
            .json()
            .await
            .context("worker-health /workers decode failed")?;
        Ok(workers)
    }

    async fn queue_backlog(&self) -> anyhow::Result<u64> {
        let url = format!("{}/queues/length", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("worker-health /queues/length request failed")?
            .error_for_status()
            .context("worker-health /queues/length returned an error status")?;
        let parsed: QueueLength = resp
            .json()
            .await
            .context("worker-health /queues/length decode failed")?;
        Ok(parsed.active_queues.iter().map(|q| q.messages).sum())
    }
}
