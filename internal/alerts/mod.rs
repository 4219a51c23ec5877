pub mod sinks;

use crate::errors::ThresholdBreach;
use crate::meta::models::{Alert, AlertCategory, Severity};
use crate::obs::Metrics;
use crate::util::config::Config;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sinks::{LogSink, MetricsSink, PubSubSink, WebhookSink};
use std::sync::Arc;
use std::time::Duration;

/// Outbound alert contract shared by every sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage {
    pub level: Severity,
    pub service: String,
    pub category: AlertCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Alert> for AlertMessage {
    fn from(alert: &Alert) -> Self {
        Self {
            level: alert.level,
            service: alert.service.clone(),
            category: alert.category,
            message: alert.message.clone(),
            timestamp: alert.timestamp,
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, alert: &Alert) -> Result<(), String>;
}

type DedupeKey = (String, AlertCategory);

/// Fans alerts out to sinks. Inside the cooldown window only one alert per
/// `(service, category)` goes out, unless a later one escalates the level.
#[derive(Clone)]
pub struct AlertManager {
    cooldown: Duration,
    sinks: Vec<Arc<dyn AlertSink>>,
    last_emitted: Arc<DashMap<DedupeKey, (DateTime<Utc>, Severity)>>,
}

impl AlertManager {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            sinks: Vec::new(),
            last_emitted: Arc::new(DashMap::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Log and metrics sinks always; webhook and pub/sub when configured.
    /// An unreachable broker leaves the pub/sub sink out rather than failing
    /// startup.
    pub async fn from_config(config: &Config, metrics: Arc<Metrics>) -> Result<Self, String> {
        let mut manager = Self::new(config.alert_cooldown)
            .with_sink(Arc::new(LogSink))
            .with_sink(Arc::new(MetricsSink::new(metrics)));
        if let Some(url) = &config.alert_webhook_url {
            manager = manager.with_sink(Arc::new(WebhookSink::new(url)?));
        }
        if let Some(url) = &config.rabbit_url {
            match PubSubSink::connect(url).await {
                Ok(sink) => manager = manager.with_sink(Arc::new(sink)),
                Err(err) => tracing::warn!(error = %err, "pub/sub alert sink disabled"),
            }
        }
        Ok(manager)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|sink| sink.name().to_string()).collect()
    }

    /// Returns true when the alert was emitted, false when the dedupe window
    /// suppressed it. Sink delivery failures are logged, never returned.
    pub async fn raise(&self, mut alert: Alert) -> bool {
        if alert.level == Severity::Ok {
            return false;
        }
        let key = (alert.service.clone(), alert.category);
        if !self.claim(key, alert.level, alert.timestamp) {
            tracing::debug!(
                service = %alert.service,
                category = alert.category.as_str(),
                level = alert.level.as_str(),
                "alert suppressed by dedupe window"
            );
            return false;
        }
        alert.dedupe_window_seconds = self.cooldown.as_secs();
        for sink in &self.sinks {
            if let Err(err) = sink.deliver(&alert).await {
                tracing::warn!(sink = sink.name(), error = %err, "alert delivery failed");
            }
        }
        true
    }

    pub async fn raise_breach(&self, breach: &ThresholdBreach, now: DateTime<Utc>) -> bool {
        let alert = Alert::new(
            breach.level,
            &breach.service,
            breach.category,
            breach.to_string(),
            now,
        );
        self.raise(alert).await
    }

    fn claim(&self, key: DedupeKey, level: Severity, at: DateTime<Utc>) -> bool {
        let window =
            chrono::Duration::from_std(self.cooldown).unwrap_or_else(|_| chrono::Duration::days(3650));
        match self.last_emitted.entry(key) {
            Entry::Occupied(mut last) => {
                let (emitted_at, emitted_level) = *last.get();
                let expired = emitted_at
                    .checked_add_signed(window)
                    .is_some_and(|until| at >= until);
                if expired || level > emitted_level {
                    last.insert((at, level));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert((at, level));
                true
            }
        }
    }
}
