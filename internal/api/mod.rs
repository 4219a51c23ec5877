use crate::alerts::AlertManager;
use crate::backup::{BackupExecutor, EngineConnector, ExecutorSettings, LiveConnector};
use crate::drill::environment::ComposeEnvironment;
use crate::drill::sandbox::DockerSandbox;
use crate::drill::{DrHarness, DrillSettings};
use crate::meta::catalog::ArtifactCatalog;
use crate::meta::cursor::SyncCursorStore;
use crate::monitor::{HealthMonitor, MonitorThresholds};
use crate::obs::{Metrics, MetricsLayer};
use crate::replication::Replicator;
use crate::retention::RetentionManager;
use crate::storage::object_store::{FsObjectStore, ObjectStore};
use crate::util::config::Config;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Everything the schedulers and the drill runner share.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub catalog: ArtifactCatalog,
    pub executor: Arc<BackupExecutor>,
    pub validator: crate::validate::IntegrityValidator,
    pub replicator: Arc<Replicator>,
    pub retention: Arc<RetentionManager>,
    pub monitor: Arc<HealthMonitor>,
    pub alerts: AlertManager,
    pub connector: Arc<dyn EngineConnector>,
    /// Services whose engine could not be reached at startup, with the error.
    pub unreachable: Arc<BTreeMap<String, String>>,
}

impl AppState {
    pub async fn new(config: Config, metrics: Arc<Metrics>) -> Result<Self, String> {
        let connector: Arc<dyn EngineConnector> = Arc::new(LiveConnector::new(config.tool_timeout));
        Self::with_connector(config, metrics, connector).await
    }

    pub async fn with_connector(
        config: Config,
        metrics: Arc<Metrics>,
        connector: Arc<dyn EngineConnector>,
    ) -> Result<Self, String> {
        let catalog = ArtifactCatalog::new(config.base_dir.clone());
        tokio::fs::create_dir_all(&config.base_dir)
            .await
            .map_err(|err| format!("mkdir {} failed: {err}", config.base_dir.display()))?;
        let services = config.topology.services.clone();

        let mut executor = BackupExecutor::new(catalog.clone(), ExecutorSettings::from_config(&config))
            .with_metrics(metrics.clone());
        let unreachable: BTreeMap<String, String> = executor
            .connect_all(&services, connector.as_ref())
            .await
            .into_iter()
            .collect();

        let validator =
            crate::validate::IntegrityValidator::from_services(&services).with_metrics(metrics.clone());
        let cursor = SyncCursorStore::load(config.cursor_file()).await?;
        let mut replicator = Replicator::new(catalog.clone(), cursor).with_metrics(metrics.clone());
        let mut retention = RetentionManager::new(catalog.clone()).with_metrics(metrics.clone());
        for region in &config.topology.regions {
            let store: Arc<dyn ObjectStore> =
                Arc::new(FsObjectStore::new(&region.name, region.root.clone()));
            replicator.add_region(store.clone());
            retention.add_region(store);
        }
        for category in &config.topology.categories {
            replicator.add_category(category.clone());
            retention.assign_regions(&category.name, category.regions.clone());
        }

        let alerts = AlertManager::from_config(&config, metrics.clone()).await?;
        let monitor = HealthMonitor::new(
            catalog.clone(),
            validator.clone(),
            alerts.clone(),
            MonitorThresholds::from_config(&config),
        )
        .with_services(&services)
        .with_metrics(metrics.clone());

        tracing::info!(
            services = services.len(),
            unreachable = unreachable.len(),
            categories = config.topology.categories.len(),
            regions = config.topology.regions.len(),
            sinks = ?alerts.sink_names(),
            "orchestrator state ready"
        );
        Ok(Self {
            config: Arc::new(config),
            metrics,
            catalog,
            executor: Arc::new(executor),
            validator,
            replicator: Arc::new(replicator),
            retention: Arc::new(retention),
            monitor: Arc::new(monitor),
            alerts,
            connector,
            unreachable: Arc::new(unreachable),
        })
    }

    /// Drill harness backed by docker sandboxes and, when a compose file is
    /// configured, the compose environment.
    pub fn drill_harness(&self) -> Result<DrHarness, String> {
        let drill = &self.config.topology.drill;
        let sandbox = Arc::new(DockerSandbox::new(&drill.sandbox_host, self.config.tool_timeout));
        let mut harness = DrHarness::new(
            self.executor.clone(),
            self.validator.clone(),
            self.connector.clone(),
            sandbox,
            DrillSettings::from_config(&self.config),
        )?
        .with_alerts(self.alerts.clone())
        .with_metrics(self.metrics.clone());
        if let Some(environment) = ComposeEnvironment::from_config(drill, self.config.tool_timeout) {
            harness = harness.with_environment(Arc::new(environment));
        }
        Ok(harness)
    }
}

pub fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(MetricsLayer::new(state.metrics.clone(), "metrics"))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> (StatusCode, String) {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            tracing::warn!(error = %err, "metrics render failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

pub fn spawn_server(addr: &str, app: Router) -> Result<JoinHandle<()>, String> {
    let socket: SocketAddr = addr
        .parse()
        .map_err(|_| format!("invalid listen addr {addr}"))?;
    let handle = tokio::spawn(async move {
        let listener = match TcpListener::bind(socket).await {
            Ok(val) => val,
            Err(err) => {
                tracing::error!(addr = %socket, error = %err, "metrics listener bind failed");
                return;
            }
        };
        tracing::info!(addr = %socket, "metrics listener started");
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(crate::util::shutdown::shutdown_signal())
            .await;
    });
    Ok(handle)
}
