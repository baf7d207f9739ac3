//! Outbound circuit-breaker notifications.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::models::RiskLevel;

const CHANNEL_CAPACITY: usize = 64;

/// Fired once per circuit-breaker trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub reason: String,
    pub risk_level: RiskLevel,
    pub triggered_at: DateTime<Utc>,
}

/// Fan-out channel for breaker events. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<BreakerEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.tx.subscribe()
    }

    pub fn notify(&self, event: BreakerEvent) {
        if self.tx.send(event).is_err() {
            debug!("No breaker event subscribers");
        }
    }
}

/// Log every event and, when a webhook is configured, POST it as JSON.
pub fn spawn_alert_forwarder(notifier: &Notifier, webhook_url: Option<String>) -> JoinHandle<()> {
    let mut rx = notifier.subscribe();
    let client = Client::builder().timeout(Duration::from_secs(10)).build().ok();

    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Alert forwarder lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            error!(
                level = %event.risk_level,
                reason = %event.reason,
                "ALERT: circuit breaker triggered"
            );

            if let (Some(url), Some(client)) = (&webhook_url, &client) {
                match client.post(url).json(&event).send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => warn!(status = %resp.status(), "Alert webhook rejected event"),
                    Err(e) => warn!(error = %e, "Failed to deliver alert"),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        notifier.notify(BreakerEvent {
            reason: "daily loss 6.00% >= 2x limit".into(),
            risk_level: RiskLevel::Critical,
            triggered_at: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_notify_without_subscribers_is_silent() {
        let notifier = Notifier::default();
        notifier.notify(BreakerEvent {
            reason: "three losing days".into(),
            risk_level: RiskLevel::Medium,
            triggered_at: Utc::now(),
        });
    }
}
