use axum::extract::MatchedPath;
use axum::http::Request;
use futures_util::future::BoxFuture;
use prometheus::core::Collector;
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub http_requests: IntCounterVec,
    pub http_duration: HistogramVec,
    pub backup_runs: IntCounterVec,
    pub backup_duration: HistogramVec,
    pub validation: IntCounterVec,
    pub replication_syncs: IntCounterVec,
    pub replication_objects: IntGaugeVec,
    pub artifact_age: GaugeVec,
    pub integrity_pass_rate: GaugeVec,
    pub storage_used: GaugeVec,
    pub alerts: IntCounterVec,
    pub retention_deletions: IntCounterVec,
    pub dr_runs: IntCounterVec,
}

struct MetricVectors {
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    backup_runs: IntCounterVec,
    backup_duration: HistogramVec,
    validation: IntCounterVec,
    replication_syncs: IntCounterVec,
    replication_objects: IntGaugeVec,
    artifact_age: GaugeVec,
    integrity_pass_rate: GaugeVec,
    storage_used: GaugeVec,
    alerts: IntCounterVec,
    retention_deletions: IntCounterVec,
    dr_runs: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        let vectors = build_metric_vectors();
        register_metric_vectors(&registry, &vectors);
        Arc::new(Self {
            registry,
            http_requests: vectors.http_requests,
            http_duration: vectors.http_duration,
            backup_runs: vectors.backup_runs,
            backup_duration: vectors.backup_duration,
            validation: vectors.validation,
            replication_syncs: vectors.replication_syncs,
            replication_objects: vectors.replication_objects,
            artifact_age: vectors.artifact_age,
            integrity_pass_rate: vectors.integrity_pass_rate,
            storage_used: vectors.storage_used,
            alerts: vectors.alerts,
            retention_deletions: vectors.retention_deletions,
            dr_runs: vectors.dr_runs,
        })
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = prometheus::TextEncoder::new();
        encoder
            .encode_to_string(&self.gather())
            .map_err(|err| format!("metrics encode failed: {err}"))
    }
}

fn build_metric_vectors() -> MetricVectors {
    let (http_requests, http_duration) = build_http_vectors();
    let (backup_runs, backup_duration, validation) = build_backup_vectors();
    let (replication_syncs, replication_objects) = build_replication_vectors();
    let (artifact_age, integrity_pass_rate, storage_used) = build_health_vectors();
    let (alerts, retention_deletions, dr_runs) = build_lifecycle_vectors();
    MetricVectors {
        http_requests,
        http_duration,
        backup_runs,
        backup_duration,
        validation,
        replication_syncs,
        replication_objects,
        artifact_age,
        integrity_pass_rate,
        storage_used,
        alerts,
        retention_deletions,
        dr_runs,
    }
}

fn build_http_vectors() -> (IntCounterVec, HistogramVec) {
    let http_requests = IntCounterVec::new(
        Opts::new("bdr_http_requests_total", "HTTP requests"),
        &["service", "route", "method", "status"],
    )
    .expect("http_requests");
    let http_duration = HistogramVec::new(
        HistogramOpts::new("bdr_http_request_duration_seconds", "HTTP request duration"),
        &["service", "route", "method"],
    )
    .expect("http_duration");
    (http_requests, http_duration)
}

fn build_backup_vectors() -> (IntCounterVec, HistogramVec, IntCounterVec) {
    let backup_runs = IntCounterVec::new(
        Opts::new("bdr_backup_runs_total", "Backup strategy runs"),
        &["service", "strategy", "result"],
    )
    .expect("backup_runs");
    let backup_duration = HistogramVec::new(
        HistogramOpts::new("bdr_backup_duration_seconds", "Backup strategy duration")
            .buckets(vec![1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["service", "strategy"],
    )
    .expect("backup_duration");
    let validation = IntCounterVec::new(
        Opts::new("bdr_validation_total", "Artifact validations"),
        &["strategy", "result"],
    )
    .expect("validation");
    (backup_runs, backup_duration, validation)
}

fn build_replication_vectors() -> (IntCounterVec, IntGaugeVec) {
    let replication_syncs = IntCounterVec::new(
        Opts::new("bdr_replication_syncs_total", "Per-region replication syncs"),
        &["category", "region", "result"],
    )
    .expect("replication_syncs");
    let replication_objects = IntGaugeVec::new(
        Opts::new("bdr_replication_objects", "Objects held by a replication target"),
        &["category", "region"],
    )
    .expect("replication_objects");
    (replication_syncs, replication_objects)
}

fn build_health_vectors() -> (GaugeVec, GaugeVec, GaugeVec) {
    let artifact_age = GaugeVec::new(
        Opts::new(
            "bdr_artifact_age_seconds",
            "Age of the latest validated artifact",
        ),
        &["service"],
    )
    .expect("artifact_age");
    let integrity_pass_rate = GaugeVec::new(
        Opts::new("bdr_integrity_pass_rate", "Rolling integrity sample pass rate"),
        &["service"],
    )
    .expect("integrity_pass_rate");
    let storage_used = GaugeVec::new(
        Opts::new("bdr_storage_used_percent", "Backup volume utilisation"),
        &["path"],
    )
    .expect("storage_used");
    (artifact_age, integrity_pass_rate, storage_used)
}

fn build_lifecycle_vectors() -> (IntCounterVec, IntCounterVec, IntCounterVec) {
    let alerts = IntCounterVec::new(
        Opts::new("bdr_alerts_total", "Alerts emitted after dedupe"),
        &["level", "category"],
    )
    .expect("alerts");
    let retention_deletions = IntCounterVec::new(
        Opts::new("bdr_retention_deletions_total", "Artifacts pruned by retention"),
        &["scope"],
    )
    .expect("retention_deletions");
    let dr_runs = IntCounterVec::new(
        Opts::new("bdr_dr_runs_total", "DR drill runs"),
        &["kind", "result"],
    )
    .expect("dr_runs");
    (alerts, retention_deletions, dr_runs)
}

fn register_metric_vectors(registry: &Registry, vectors: &MetricVectors) {
    register_collector(registry, &vectors.http_requests);
    #[cfg(test)]
    {
        if std::env::var("BDR_TEST_METRICS_DUP").ok().as_deref() == Some("1") {
            register_collector(registry, &vectors.http_requests);
        }
    }
    register_collector(registry, &vectors.http_duration);
    register_collector(registry, &vectors.backup_runs);
    register_collector(registry, &vectors.backup_duration);
    register_collector(registry, &vectors.validation);
    register_collector(registry, &vectors.replication_syncs);
    register_collector(registry, &vectors.replication_objects);
    register_collector(registry, &vectors.artifact_age);
    register_collector(registry, &vectors.integrity_pass_rate);
    register_collector(registry, &vectors.storage_used);
    register_collector(registry, &vectors.alerts);
    register_collector(registry, &vectors.retention_deletions);
    register_collector(registry, &vectors.dr_runs);
}

fn register_collector<C>(registry: &Registry, collector: &C)
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone())).ok();
}

#[derive(Clone)]
pub struct MetricsLayer {
    metrics: Arc<Metrics>,
    service: &'static str,
}

impl MetricsLayer {
    pub fn new(metrics: Arc<Metrics>, service: &'static str) -> Self {
        Self { metrics, service }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics.clone(),
            service: self.service,
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    metrics: Arc<Metrics>,
    service: &'static str,
}

impl<S, B> Service<Request<B>> for MetricsService<S>
where
    S: Service<Request<B>, Response = axum::response::Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = axum::response::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let mut inner = self.inner.clone();
        let metrics = self.metrics.clone();
        let service = self.service;
        let method = req.method().clone();
        let path = request_path_label(&req);
        let start = Instant::now();
        Box::pin(async move {
            let response = inner.call(req).await?;
            let status_label = response.status().as_u16().to_string();
            metrics
                .http_requests
                .with_label_values(&[service, &path, method.as_str(), &status_label])
                .inc();
            metrics
                .http_duration
                .with_label_values(&[service, &path, method.as_str()])
                .observe(start.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

fn request_path_label<B>(req: &Request<B>) -> String {
    if let Some(matched) = req.extensions().get::<MatchedPath>() {
        return matched.as_str().to_string();
    }
    req.uri().path().to_string()
}

#[cfg(test)]
mod tests {
    use super::{Metrics, MetricsLayer};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use std::sync::Mutex;
    use tower::Service;

    static METRICS_ENV_LOCK: Mutex<()> = Mutex::new(());

    fn metrics_with_env(value: Option<&str>) -> std::sync::Arc<Metrics> {
        let _guard = METRICS_ENV_LOCK.lock().expect("lock");
        match value {
            Some(value) => std::env::set_var("BDR_TEST_METRICS_DUP", value),
            None => std::env::remove_var("BDR_TEST_METRICS_DUP"),
        }
        let metrics = Metrics::new();
        std::env::remove_var("BDR_TEST_METRICS_DUP");
        metrics
    }

    #[test]
    fn registry_exposes_domain_metrics() {
        let metrics = metrics_with_env(None);
        metrics
            .backup_runs
            .with_label_values(&["orders-db", "base_backup", "success"])
            .inc();
        metrics
            .replication_syncs
            .with_label_values(&["databases", "eu-west", "failure"])
            .inc();
        metrics.artifact_age.with_label_values(&["orders-db"]).set(12.0);
        let names: Vec<String> = metrics
            .gather()
            .into_iter()
            .map(|family| family.name().to_string())
            .collect();
        assert!(names.contains(&"bdr_backup_runs_total".to_string()));
        assert!(names.contains(&"bdr_replication_syncs_total".to_string()));
        assert!(names.contains(&"bdr_artifact_age_seconds".to_string()));
        let text = metrics.render().expect("render");
        assert!(text.contains("bdr_backup_runs_total{"));
        assert!(text.contains("service=\"orders-db\""));
    }

    #[test]
    fn registry_handles_duplicate_registration() {
        let _metrics = metrics_with_env(Some("1"));
    }

    #[tokio::test]
    async fn metrics_layer_records_matched_path() {
        let metrics = metrics_with_env(None);
        let mut app = Router::new()
            .route("/reports/{kind}", get(|| async { "" }))
            .layer(MetricsLayer::new(metrics.clone(), "bdr"));
        let req = Request::builder()
            .method("GET")
            .uri("/reports/backup")
            .body(Body::empty())
            .expect("request");
        let response = <Router as Service<Request<Body>>>::call(&mut app, req)
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let count = metrics
            .http_requests
            .with_label_values(&["bdr", "/reports/{kind}", "GET", "200"])
            .get();
        assert_eq!(count, 1);
    }
}
