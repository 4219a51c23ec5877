use crate::alerts::{AlertMessage, AlertSink};
use crate::meta::models::{Alert, Severity};
use crate::obs::Metrics;
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions, options::ExchangeDeclareOptions, types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::future::Future;
#[cfg(test)]
use std::io;
#[cfg(test)]
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const ALERT_EXCHANGE: &str = "bdr.alerts";
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
static PUBSUB_FAILPOINT: AtomicU8 = AtomicU8::new(0);

#[cfg(test)]
fn pubsub_failpoint(step: u8) -> bool {
    if PUBSUB_FAILPOINT.load(Ordering::SeqCst) == step {
        PUBSUB_FAILPOINT.store(0, Ordering::SeqCst);
        true
    } else {
        false
    }
}

#[cfg(test)]
pub fn set_pubsub_failpoint(step: u8) {
    PUBSUB_FAILPOINT.store(step, Ordering::SeqCst);
}

#[cfg(test)]
pub fn clear_pubsub_failpoint() {
    PUBSUB_FAILPOINT.store(0, Ordering::SeqCst);
}

#[cfg(test)]
pub struct PubSubFailpointGuard;

#[cfg(test)]
impl Drop for PubSubFailpointGuard {
    fn drop(&mut self) {
        clear_pubsub_failpoint();
    }
}

#[cfg(test)]
pub fn pubsub_failpoint_guard(step: u8) -> PubSubFailpointGuard {
    set_pubsub_failpoint(step);
    PubSubFailpointGuard
}

/// Always-on sink: one structured log line per emitted alert.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), String> {
        match alert.level {
            Severity::Critical => tracing::error!(
                service = %alert.service,
                category = alert.category.as_str(),
                message = %alert.message,
                "critical alert"
            ),
            Severity::Warning => tracing::warn!(
                service = %alert.service,
                category = alert.category.as_str(),
                message = %alert.message,
                "warning alert"
            ),
            Severity::Ok => tracing::info!(
                service = %alert.service,
                category = alert.category.as_str(),
                message = %alert.message,
                "alert resolved"
            ),
        }
        Ok(())
    }
}

/// Counts emitted alerts in `bdr_alerts_total`.
pub struct MetricsSink {
    metrics: Arc<Metrics>,
}

impl MetricsSink {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl AlertSink for MetricsSink {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), String> {
        self.metrics
            .alerts
            .with_label_values(&[alert.level.as_str(), alert.category.as_str()])
            .inc();
        Ok(())
    }
}

/// Collects alerts in memory; used by dry runs and tests.
#[derive(Default)]
pub struct MemorySink {
    delivered: std::sync::Mutex<Vec<Alert>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.delivered
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().map(|alerts| alerts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AlertSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), String> {
        self.delivered
            .lock()
            .map_err(|_| "memory sink poisoned".to_string())?
            .push(alert.clone());
        Ok(())
    }
}

/// Chat webhook: POSTs the alert message as JSON.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|err| format!("webhook client init failed: {err}"))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(&AlertMessage::from(alert))
            .send()
            .await
            .map_err(|err| format!("webhook request failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "webhook rejected alert: {}",
                response.status().as_u16()
            ));
        }
        Ok(())
    }
}

/// Topic-exchange publisher; routing key `alert.<level>.<category>`.
#[derive(Clone)]
pub struct PubSubSink {
    channel: Arc<Mutex<Channel>>,
}

pub fn routing_key(alert: &Alert) -> String {
    format!("alert.{}.{}", alert.level.as_str(), alert.category.as_str())
}

#[cfg(test)]
fn failpoint_error() -> lapin::Error {
    lapin::Error::from(io::Error::new(io::ErrorKind::Other, "failpoint"))
}

async fn connect_rabbit(url: &str) -> Result<Connection, String> {
    Connection::connect(url, ConnectionProperties::default())
        .await
        .map_err(|err| format!("rabbit connect failed: {err}"))
}

async fn create_channel(conn: &Connection) -> Result<Channel, String> {
    create_channel_with_failpoint(conn)
        .await
        .map_err(|err| format!("rabbit channel failed: {err}"))
}

async fn create_channel_with_failpoint(conn: &Connection) -> Result<Channel, lapin::Error> {
    #[cfg(test)]
    {
        if pubsub_failpoint(1) {
            return Err(failpoint_error());
        }
    }
    conn.create_channel().await
}

async fn declare_exchange(channel: &Channel) -> Result<(), String> {
    declare_exchange_with_failpoint(channel)
        .await
        .map_err(|err| format!("rabbit exchange failed: {err}"))
}

async fn declare_exchange_with_failpoint(channel: &Channel) -> Result<(), lapin::Error> {
    #[cfg(test)]
    {
        if pubsub_failpoint(2) {
            return Err(failpoint_error());
        }
    }
    channel
        .exchange_declare(
            ALERT_EXCHANGE.into(),
            ExchangeKind::Topic,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
}

#[derive(Debug)]
enum PublishError {
    Publish(lapin::Error),
    Confirm(lapin::Error),
}

fn maybe_fail_publish() -> Result<(), PublishError> {
    #[cfg(test)]
    if pubsub_failpoint(4) {
        return Err(PublishError::Publish(failpoint_error()));
    }
    Ok(())
}

async fn wait_publish_confirm<F>(confirm: F) -> Result<(), PublishError>
where
    F: Future<Output = Result<lapin::publisher_confirm::Confirmation, lapin::Error>>,
{
    #[cfg(test)]
    if pubsub_failpoint(5) {
        return Err(PublishError::Confirm(failpoint_error()));
    }
    confirm.await.map(|_| ()).map_err(PublishError::Confirm)
}

fn serialize_alert(alert: &Alert) -> Result<Vec<u8>, String> {
    serialize_alert_payload(alert).map_err(|err| format!("alert serialize failed: {err}"))
}

fn serialize_alert_payload(alert: &Alert) -> Result<Vec<u8>, serde_json::Error> {
    #[cfg(test)]
    if pubsub_failpoint(3) {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "failpoint");
        return Err(serde_json::Error::io(err));
    }
    serde_json::to_vec(&AlertMessage::from(alert))
}

async fn publish_message(
    channel: &Channel,
    routing_key: &str,
    payload: &[u8],
) -> Result<(), String> {
    match publish_with_failpoint(channel, routing_key, payload).await {
        Ok(()) => Ok(()),
        Err(PublishError::Publish(err)) => Err(format!("alert publish failed: {err}")),
        Err(PublishError::Confirm(err)) => Err(format!("alert confirm failed: {err}")),
    }
}

async fn publish_with_failpoint(
    channel: &Channel,
    routing_key: &str,
    payload: &[u8],
) -> Result<(), PublishError> {
    maybe_fail_publish()?;
    let confirm = channel
        .basic_publish(
            ALERT_EXCHANGE.into(),
            routing_key.into(),
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default().with_content_type("application/json".into()),
        )
        .await
        .map_err(PublishError::Publish)?;
    wait_publish_confirm(confirm).await
}

impl PubSubSink {
    pub async fn connect(rabbit_url: &str) -> Result<Self, String> {
        let conn = connect_rabbit(rabbit_url).await?;
        let channel = create_channel(&conn).await?;
        declare_exchange(&channel).await?;
        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
        })
    }
}

#[async_trait]
impl AlertSink for PubSubSink {
    fn name(&self) -> &str {
        "pubsub"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), String> {
        let payload = serialize_alert(alert)?;
        let channel = self.channel.lock().await;
        publish_message(&channel, &routing_key(alert), &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::{
        pubsub_failpoint_guard, routing_key, serialize_alert, AlertSink, MemorySink, MetricsSink,
        PubSubSink, WebhookSink,
    };
    use crate::meta::models::{Alert, AlertCategory, Severity};
    use crate::obs::Metrics;
    use crate::test_support;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    fn sample_alert(level: Severity) -> Alert {
        Alert::new(
            level,
            "orders-db",
            AlertCategory::Staleness,
            "latest artifact is 30.0h old",
            Utc::now(),
        )
    }

    #[test]
    fn routing_keys_name_level_and_category() {
        assert_eq!(
            routing_key(&sample_alert(Severity::Critical)),
            "alert.critical.staleness"
        );
    }

    #[test]
    fn pubsub_failpoint_consumes_step() {
        super::set_pubsub_failpoint(9);
        assert!(super::pubsub_failpoint(9));
        assert!(!super::pubsub_failpoint(9));
    }

    #[test]
    fn serialize_failpoint_maps_error() {
        let _guard = pubsub_failpoint_guard(3);
        let err = serialize_alert(&sample_alert(Severity::Warning)).expect_err("err");
        assert!(err.contains("alert serialize failed"));
    }

    #[tokio::test]
    async fn unreachable_broker_is_reported() {
        let err = PubSubSink::connect("amqp://127.0.0.1:1")
            .await
            .err()
            .expect("err");
        assert!(err.contains("rabbit connect failed"));
    }

    #[tokio::test]
    async fn wait_publish_confirm_maps_future_errors() {
        let result = super::wait_publish_confirm(async {
            Err(lapin::Error::from(std::io::Error::other("confirm-failed")))
        })
        .await
        .expect_err("confirm error");
        assert!(format!("{result:?}").starts_with("Confirm("));
    }

    #[tokio::test]
    async fn memory_and_metrics_sinks_record_alerts() {
        let memory = MemorySink::new();
        let metrics = Metrics::new();
        let counter = MetricsSink::new(metrics.clone());
        let alert = sample_alert(Severity::Critical);
        memory.deliver(&alert).await.expect("memory");
        counter.deliver(&alert).await.expect("metrics");
        assert_eq!(memory.alerts(), vec![alert]);
        assert_eq!(
            metrics
                .alerts
                .with_label_values(&["critical", "staleness"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn webhook_posts_alert_contract() {
        let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(seen): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        seen.lock().expect("lock").push(body);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(received.clone());
        let (base_url, server) = test_support::spawn_http(app).await;

        let sink = WebhookSink::new(&format!("{base_url}/hook")).expect("sink");
        sink.deliver(&sample_alert(Severity::Warning))
            .await
            .expect("deliver");
        server.shutdown().await;

        let bodies = received.lock().expect("lock").clone();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["level"], "warning");
        assert_eq!(bodies[0]["service"], "orders-db");
        assert_eq!(bodies[0]["category"], "staleness");
        assert!(bodies[0]["timestamp"].is_string());
        assert!(bodies[0].get("message").is_some());
    }

    #[tokio::test]
    async fn webhook_rejection_is_an_error() {
        let app = Router::new().route("/hook", post(|| async { StatusCode::BAD_GATEWAY }));
        let (base_url, server) = test_support::spawn_http(app).await;
        let sink = WebhookSink::new(&format!("{base_url}/hook")).expect("sink");
        let err = sink
            .deliver(&sample_alert(Severity::Critical))
            .await
            .expect_err("rejected");
        server.shutdown().await;
        assert!(err.contains("502"));
    }
}
