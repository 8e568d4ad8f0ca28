//! Owner notifications, delivered off the scheduling path.
//!
//! The failure tracker only enqueues; a background worker drains the queue
//! into a [`Notifier`]. Delivery failures are logged and dropped.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::{AgentId, OwnerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub agent_id: AgentId,
    pub owner_id: OwnerId,
    pub agent_name: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_owner(&self, notification: &Notification) -> Result<()>;
}

/// Writes notices to the process log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_owner(&self, notification: &Notification) -> Result<()> {
        log::warn!(
            "Owner {} notified: agent '{}' ({}) {}",
            notification.owner_id,
            notification.agent_name,
            notification.agent_id,
            notification.reason
        );
        Ok(())
    }
}

/// POSTs each notification as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let url = reqwest::Url::parse(url).map_err(|e| anyhow!("Invalid webhook URL '{}': {}", url, e))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_owner(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(notification)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("Webhook returned {}", response.status()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Never blocks. Fails only if the worker has shut down.
    pub fn enqueue(&self, notification: Notification) -> Result<()> {
        self.tx
            .send(notification)
            .map_err(|_| anyhow!("notification worker is not running"))
    }
}

/// Drains `rx` until every sender is dropped.
pub fn spawn_notification_worker(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    notifier: Arc<dyn Notifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            if let Err(e) = notifier.notify_owner(&notification).await {
                log::error!(
                    "Failed to notify owner of agent {}: {}",
                    notification.agent_id,
                    e
                );
            }
        }
    })
}
