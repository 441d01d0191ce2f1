// ===============================
// src/notifier.rs (human-readable alerts, fire-and-forget)
// ===============================
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::errors::NotifyError;
use crate::metrics::NOTIFY_DROPPED;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Level { Info, Warn }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice { pub level: Level, pub text: String }

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Writes notices to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notice) -> Result<(), NotifyError> {
        match n.level {
            Level::Info => info!(text = %n.text, "NOTICE"),
            Level::Warn => warn!(text = %n.text, "NOTICE"),
        }
        Ok(())
    }
}

/// POSTs `{"level": ..., "text": ...}` to a chat webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: url::Url,
}

impl WebhookNotifier {
    pub fn new(url: url::Url) -> Self {
        Self { http: reqwest::Client::new(), url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: &Notice) -> Result<(), NotifyError> {
        let rsp = self
            .http
            .post(self.url.clone())
            .timeout(std::time::Duration::from_secs(5))
            .json(n)
            .send()
            .await?;
        if !rsp.status().is_success() {
            return Err(NotifyError::Status(rsp.status().as_u16()));
        }
        Ok(())
    }
}

/// Cheap cloneable sender side. Never blocks the caller: when the queue is
/// full the notice is dropped and counted.
#[derive(Clone)]
pub struct NotifyHandle {
    tx: mpsc::Sender<Notice>,
}

impl NotifyHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notice>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn info(&self, text: impl Into<String>) { self.send(Level::Info, text.into()) }

    pub fn warn(&self, text: impl Into<String>) { self.send(Level::Warn, text.into()) }

    fn send(&self, level: Level, text: String) {
        if self.tx.try_send(Notice { level, text }).is_err() {
            NOTIFY_DROPPED.inc();
        }
    }
}

/// Drains the queue into every sink; a failing sink is logged and skipped.
pub async fn run(mut rx: mpsc::Receiver<Notice>, sinks: Vec<Box<dyn Notifier>>) {
    while let Some(n) = rx.recv().await {
        for sink in &sinks {
            if let Err(e) = sink.notify(&n).await {
                warn!(?e, "notifier: delivery failed");
            }
        }
    }
    info!("notifier: channel closed, stopped");
}
