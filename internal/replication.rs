use crate::errors::ReplicationFailure;
use crate::meta::catalog::{
    is_sidecar_name, parse_artifact_timestamp, sidecar_name, sidecar_path, ArtifactCatalog,
};
use crate::meta::cursor::SyncCursorStore;
use crate::meta::models::{BackupArtifact, ReplicationTarget, Validity};
use crate::obs::Metrics;
use crate::storage::object_store::{
    artifact_key, category_prefix, key_file_name, ObjectInfo, ObjectStore,
};
use crate::util::config::CategoryConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSyncResult {
    pub region: String,
    pub uploaded: u64,
    pub deleted: u64,
    /// Remote copies past primary retention, kept for secondary retention.
    pub retained: u64,
    pub primary_count: u64,
    pub secondary_count: u64,
    pub total_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegionSyncResult {
    fn failed(region: &str, primary_count: u64, detail: String) -> Self {
        Self {
            region: region.to_string(),
            uploaded: 0,
            deleted: 0,
            retained: 0,
            primary_count,
            secondary_count: 0,
            total_size_bytes: 0,
            error: Some(detail),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn drift(&self) -> f64 {
        drift(self.primary_count, self.secondary_count)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySync {
    pub category: String,
    pub due: bool,
    pub cursor_advanced: bool,
    pub results: Vec<RegionSyncResult>,
}

impl CategorySync {
    pub fn failures(&self) -> Vec<ReplicationFailure> {
        self.results
            .iter()
            .filter_map(|result| {
                result.error.as_ref().map(|detail| ReplicationFailure {
                    category: self.category.clone(),
                    region: result.region.clone(),
                    detail: detail.clone(),
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationEntry {
    pub category: String,
    pub primary: u64,
    pub secondary: u64,
    pub drift: f64,
    pub within_tolerance: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub region: String,
    pub entries: Vec<ReconciliationEntry>,
}

/// Relative difference between object counts; an empty primary with a
/// non-empty secondary counts as full drift.
pub fn drift(primary: u64, secondary: u64) -> f64 {
    if primary == 0 {
        return if secondary == 0 { 0.0 } else { 1.0 };
    }
    primary.abs_diff(secondary) as f64 / primary as f64
}

/// Mirrors validated artifacts into every region of a category. Regions sync
/// independently; the category cursor moves only when all of them succeed.
pub struct Replicator {
    catalog: ArtifactCatalog,
    cursor: SyncCursorStore,
    regions: BTreeMap<String, Arc<dyn ObjectStore>>,
    categories: BTreeMap<String, CategoryConfig>,
    targets: DashMap<(String, String), ReplicationTarget>,
    metrics: Option<Arc<Metrics>>,
}

impl Replicator {
    pub fn new(catalog: ArtifactCatalog, cursor: SyncCursorStore) -> Self {
        Self {
            catalog,
            cursor,
            regions: BTreeMap::new(),
            categories: BTreeMap::new(),
            targets: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn add_region(&mut self, store: Arc<dyn ObjectStore>) {
        self.regions.insert(store.region().to_string(), store);
    }

    pub fn add_category(&mut self, category: CategoryConfig) {
        self.categories.insert(category.name.clone(), category);
    }

    pub fn categories(&self) -> Vec<String> {
        self.categories.keys().cloned().collect()
    }

    pub fn cursor(&self) -> &SyncCursorStore {
        &self.cursor
    }

    pub fn target(&self, category: &str, region: &str) -> Option<ReplicationTarget> {
        self.targets
            .get(&(category.to_string(), region.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn drift_tolerance(&self, category: &str) -> Option<f64> {
        self.categories.get(category).map(|config| config.drift_tolerance)
    }

    /// Syncs `category` when its cadence has elapsed since the last fully
    /// successful sync.
    pub async fn sync(&self, category: &str, now: DateTime<Utc>) -> Result<CategorySync, String> {
        let config = self
            .categories
            .get(category)
            .ok_or_else(|| format!("unknown category '{category}'"))?;
        let last = self.cursor.last(category).await;
        if !config.cadence.is_due(last, now) {
            tracing::debug!(category, "replication not due");
            return Ok(CategorySync {
                category: category.to_string(),
                due: false,
                cursor_advanced: false,
                results: Vec::new(),
            });
        }
        self.sync_now(category, now).await
    }

    /// Syncs `category` regardless of cadence.
    pub async fn sync_now(
        &self,
        category: &str,
        now: DateTime<Utc>,
    ) -> Result<CategorySync, String> {
        let config = self
            .categories
            .get(category)
            .ok_or_else(|| format!("unknown category '{category}'"))?;
        let primary_cutoff = config.retention_policy().primary_cutoff(now);
        let artifacts: Vec<BackupArtifact> = self
            .catalog
            .list_category(category)
            .await?
            .into_iter()
            .filter(|artifact| artifact.validity == Validity::Validated)
            .collect();
        let artifacts = Arc::new(artifacts);

        let mut tasks = JoinSet::new();
        let mut task_regions = HashMap::new();
        let mut results = Vec::new();
        for region in &config.regions {
            let Some(store) = self.regions.get(region).cloned() else {
                results.push(RegionSyncResult::failed(
                    region,
                    artifacts.len() as u64,
                    "region is not configured".to_string(),
                ));
                continue;
            };
            let handle = tasks.spawn(sync_region(
                store,
                category.to_string(),
                artifacts.clone(),
                primary_cutoff,
            ));
            task_regions.insert(handle.id(), region.clone());
        }
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, result)) => results.push(result),
                Err(err) => {
                    let region = task_regions
                        .get(&err.id())
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string());
                    results.push(RegionSyncResult::failed(
                        &region,
                        artifacts.len() as u64,
                        format!("sync task aborted: {err}"),
                    ));
                }
            }
        }
        results.sort_by(|a, b| a.region.cmp(&b.region));

        for result in &results {
            self.record_region(category, result, now);
        }
        self.record_remote_uris(&artifacts, &results).await;

        let all_ok = !results.is_empty() && results.iter().all(RegionSyncResult::succeeded);
        let mut cursor_advanced = false;
        if all_ok {
            match self.cursor.advance(category, now).await {
                Ok(()) => cursor_advanced = true,
                Err(err) => {
                    tracing::warn!(category, error = %err, "cursor persist failed, next cycle resyncs")
                }
            }
        }
        Ok(CategorySync {
            category: category.to_string(),
            due: true,
            cursor_advanced,
            results,
        })
    }

    fn record_region(&self, category: &str, result: &RegionSyncResult, now: DateTime<Utc>) {
        let label = if result.succeeded() { "success" } else { "failure" };
        if let Some(metrics) = &self.metrics {
            metrics
                .replication_syncs
                .with_label_values(&[category, result.region.as_str(), label])
                .inc();
            if result.succeeded() {
                metrics
                    .replication_objects
                    .with_label_values(&[category, result.region.as_str()])
                    .set(result.secondary_count as i64);
            }
        }
        match &result.error {
            Some(err) => tracing::warn!(
                category,
                region = %result.region,
                error = %err,
                "region sync failed, retrying next cycle"
            ),
            None => tracing::info!(
                category,
                region = %result.region,
                uploaded = result.uploaded,
                deleted = result.deleted,
                objects = result.secondary_count,
                "region synced"
            ),
        }
        let key = (category.to_string(), result.region.clone());
        let mut target = self.targets.entry(key).or_insert_with(|| ReplicationTarget {
            category: category.to_string(),
            region: result.region.clone(),
            storage_location: self
                .regions
                .get(&result.region)
                .map(|store| store.uri(&category_prefix(category)))
                .unwrap_or_default(),
            last_successful_sync_at: None,
            object_count: 0,
            total_size_bytes: 0,
        });
        if result.succeeded() {
            target.last_successful_sync_at = Some(now);
            target.object_count = result.secondary_count;
            target.total_size_bytes = result.total_size_bytes;
        }
    }

    async fn record_remote_uris(&self, artifacts: &[BackupArtifact], results: &[RegionSyncResult]) {
        let synced: Vec<&Arc<dyn ObjectStore>> = results
            .iter()
            .filter(|result| result.succeeded())
            .filter_map(|result| self.regions.get(&result.region))
            .collect();
        if synced.is_empty() {
            return;
        }
        for artifact in artifacts {
            let key = artifact_key(artifact);
            let mut updated = artifact.clone();
            for store in &synced {
                let uri = store.uri(&key);
                if !updated.locations.remote_uris.contains(&uri) {
                    updated.locations.remote_uris.push(uri);
                }
            }
            if updated.locations.remote_uris != artifact.locations.remote_uris {
                if let Err(err) = self.catalog.record(&updated).await {
                    tracing::warn!(artifact = %artifact.name, error = %err, "remote uri update failed");
                }
            }
        }
    }

    /// Compares primary and secondary object counts for every category the
    /// region serves. Breaches are advisory.
    pub async fn verify(&self, region: &str) -> Result<ReconciliationResult, String> {
        let store = self
            .regions
            .get(region)
            .ok_or_else(|| format!("unknown region '{region}'"))?;
        let now = Utc::now();
        let mut entries = Vec::new();
        for config in self.categories.values() {
            if !config.regions.iter().any(|name| name == region) {
                continue;
            }
            let cutoff = config.retention_policy().primary_cutoff(now);
            let primary = self
                .catalog
                .list_category(&config.name)
                .await?
                .iter()
                .filter(|artifact| artifact.validity == Validity::Validated)
                .filter(|artifact| artifact.created_at >= cutoff)
                .count() as u64;
            let remote = store.list(&category_prefix(&config.name)).await?;
            let secondary = remote
                .iter()
                .filter(|object| !is_sidecar_name(&object.key))
                .filter(|object| object_created_at(object) >= cutoff)
                .count() as u64;
            let drift = drift(primary, secondary);
            entries.push(ReconciliationEntry {
                category: config.name.clone(),
                primary,
                secondary,
                drift,
                within_tolerance: drift <= config.drift_tolerance,
            });
        }
        Ok(ReconciliationResult {
            region: region.to_string(),
            entries,
        })
    }
}

fn object_created_at(object: &ObjectInfo) -> DateTime<Utc> {
    parse_artifact_timestamp(key_file_name(&object.key)).unwrap_or(object.modified_at)
}

async fn sync_region(
    store: Arc<dyn ObjectStore>,
    category: String,
    artifacts: Arc<Vec<BackupArtifact>>,
    primary_cutoff: DateTime<Utc>,
) -> RegionSyncResult {
    let region = store.region().to_string();
    let primary_count = artifacts.len() as u64;
    match mirror(store.as_ref(), &category, &artifacts, primary_cutoff).await {
        Ok(result) => result,
        Err(err) => RegionSyncResult::failed(&region, primary_count, err),
    }
}

async fn mirror(
    store: &dyn ObjectStore,
    category: &str,
    artifacts: &[BackupArtifact],
    primary_cutoff: DateTime<Utc>,
) -> Result<RegionSyncResult, String> {
    let prefix = category_prefix(category);
    let before: BTreeMap<String, ObjectInfo> = store
        .list(&prefix)
        .await?
        .into_iter()
        .map(|object| (object.key.clone(), object))
        .collect();

    let mut expected = BTreeSet::new();
    let mut uploaded = 0u64;
    for artifact in artifacts {
        let key = artifact_key(artifact);
        let sidecar_key = format!(
            "{}/{}",
            key.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(category),
            sidecar_name(&artifact.name)
        );
        let present = before
            .get(&key)
            .is_some_and(|object| object.size_bytes == artifact.size_bytes);
        if !present {
            store.put_file(&key, &artifact.locations.local_path).await?;
            uploaded += 1;
        }
        if !present || !before.contains_key(&sidecar_key) {
            store
                .put_file(&sidecar_key, &sidecar_path(&artifact.locations.local_path))
                .await?;
        }
        expected.insert(key);
        expected.insert(sidecar_key);
    }

    let mut deleted = 0u64;
    let mut retained = 0u64;
    for object in before.values() {
        if expected.contains(&object.key) {
            continue;
        }
        if object_created_at(object) < primary_cutoff {
            if !is_sidecar_name(&object.key) {
                retained += 1;
            }
            continue;
        }
        store.delete(&object.key).await?;
        if !is_sidecar_name(&object.key) {
            deleted += 1;
        }
    }

    let after = store.list(&prefix).await?;
    let current: Vec<&ObjectInfo> = after
        .iter()
        .filter(|object| !is_sidecar_name(&object.key))
        .filter(|object| object_created_at(object) >= primary_cutoff)
        .collect();
    Ok(RegionSyncResult {
        region: store.region().to_string(),
        uploaded,
        deleted,
        retained,
        primary_count: artifacts
            .iter()
            .filter(|artifact| artifact.created_at >= primary_cutoff)
            .count() as u64,
        secondary_count: current.len() as u64,
        total_size_bytes: after.iter().map(|object| object.size_bytes).sum(),
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::{drift, Replicator};
    use crate::meta::catalog::{tests::seed_artifact, ArtifactCatalog};
    use crate::meta::cursor::SyncCursorStore;
    use crate::meta::models::{Schedule, StrategyKind, Validity};
    use crate::storage::object_store::{FsObjectStore, ObjectInfo, ObjectStore};
    use crate::test_support;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::path::Path;
    use std::sync::Arc;

    struct UnreachableRegion;

    #[async_trait]
    impl ObjectStore for UnreachableRegion {
        fn region(&self) -> &str {
            "offline"
        }

        fn uri(&self, key: &str) -> String {
            format!("offline://{key}")
        }

        async fn put_file(&self, _key: &str, _source: &Path) -> Result<ObjectInfo, String> {
            Err("connection refused".to_string())
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<ObjectInfo>, String> {
            Err("connection refused".to_string())
        }

        async fn delete(&self, _key: &str) -> Result<(), String> {
            Err("connection refused".to_string())
        }
    }

    #[test]
    fn drift_is_relative_to_primary() {
        assert_eq!(drift(10, 10), 0.0);
        assert_eq!(drift(10, 9), 0.1);
        assert_eq!(drift(0, 0), 0.0);
        assert_eq!(drift(0, 3), 1.0);
    }

    #[tokio::test]
    async fn sync_mirrors_validated_artifacts_and_removes_strays() {
        let dirs = test_support::TempDirs::new();
        let catalog = ArtifactCatalog::new(dirs.base());
        let now = Utc::now();
        let valid = seed_artifact(
            &catalog,
            "orders",
            "databases",
            StrategyKind::BaseBackup,
            now - Duration::hours(2),
            Validity::Validated,
            b"valid-one",
        )
        .await;
        seed_artifact(
            &catalog,
            "orders",
            "databases",
            StrategyKind::BaseBackup,
            now - Duration::hours(1),
            Validity::Invalid,
            b"invalid",
        )
        .await;
        let region = Arc::new(FsObjectStore::new("eu-west", dirs.scratch("eu-west")));
        let stray = tempfile::NamedTempFile::new().expect("stray");
        region
            .put_file("databases/base_backup/gone-base_backup-20991231T000000Z-deadbeef.tar.gz", stray.path())
            .await
            .expect("seed stray");

        let mut replicator = Replicator::new(catalog.clone(), SyncCursorStore::in_memory());
        replicator.add_region(region.clone());
        replicator.add_category(test_support::category("databases", Schedule::Hourly, &["eu-west"]));

        let sync = replicator.sync("databases", now).await.expect("sync");
        assert!(sync.due);
        assert!(sync.cursor_advanced);
        let result = &sync.results[0];
        assert!(result.succeeded());
        assert_eq!(result.uploaded, 1);
        assert_eq!(result.deleted, 1);
        assert_eq!(result.primary_count, 1);
        assert_eq!(result.secondary_count, 1);
        assert!(result.drift() <= 0.10);

        let keys: Vec<String> = region
            .list("databases/")
            .await
            .expect("list")
            .into_iter()
            .map(|object| object.key)
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|key| key.ends_with(&valid.name)));
        assert!(keys.iter().any(|key| key.ends_with(".metadata.json")));

        let stored = catalog
            .list("orders", StrategyKind::BaseBackup)
            .await
            .expect("list")
            .into_iter()
            .find(|artifact| artifact.id == valid.id)
            .expect("stored");
        assert_eq!(stored.locations.remote_uris.len(), 1);
        let target = replicator.target("databases", "eu-west").expect("target");
        assert_eq!(target.object_count, 1);
        assert_eq!(target.last_successful_sync_at, Some(now));
    }

    #[tokio::test]
    async fn cadence_is_measured_from_last_successful_sync() {
        let dirs = test_support::TempDirs::new();
        let catalog = ArtifactCatalog::new(dirs.base());
        let now = Utc::now();
        let mut replicator = Replicator::new(catalog, SyncCursorStore::in_memory());
        replicator.add_region(Arc::new(FsObjectStore::new("eu-west", dirs.scratch("eu-west"))));
        replicator.add_category(test_support::category("databases", Schedule::Daily, &["eu-west"]));

        assert!(replicator.sync("databases", now).await.expect("sync").due);
        let later = replicator
            .sync("databases", now + Duration::hours(3))
            .await
            .expect("sync");
        assert!(!later.due);
        assert!(later.results.is_empty());
        assert!(replicator
            .sync("databases", now + Duration::hours(25))
            .await
            .expect("sync")
            .due);
    }

    #[tokio::test]
    async fn one_unreachable_region_does_not_block_the_other() {
        let dirs = test_support::TempDirs::new();
        let catalog = ArtifactCatalog::new(dirs.base());
        let now = Utc::now();
        seed_artifact(
            &catalog,
            "orders",
            "databases",
            StrategyKind::BaseBackup,
            now - Duration::minutes(5),
            Validity::Validated,
            b"valid",
        )
        .await;
        let mut replicator = Replicator::new(catalog, SyncCursorStore::in_memory());
        replicator.add_region(Arc::new(FsObjectStore::new("eu-west", dirs.scratch("eu-west"))));
        replicator.add_region(Arc::new(UnreachableRegion));
        replicator.add_category(test_support::category(
            "databases",
            Schedule::Hourly,
            &["eu-west", "offline"],
        ));

        let sync = replicator.sync("databases", now).await.expect("sync");
        assert!(!sync.cursor_advanced);
        let failures = sync.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].region, "offline");
        let healthy = sync
            .results
            .iter()
            .find(|result| result.region == "eu-west")
            .expect("eu-west");
        assert!(healthy.succeeded());
        assert_eq!(healthy.secondary_count, 1);
        assert!(replicator.cursor().last("databases").await.is_none());

        let retry = replicator
            .sync("databases", now + Duration::minutes(1))
            .await
            .expect("retry");
        assert!(retry.due, "a failed cycle is retried on the next invocation");
    }

    #[tokio::test]
    async fn verify_reports_drift_against_tolerance() {
        let dirs = test_support::TempDirs::new();
        let catalog = ArtifactCatalog::new(dirs.base());
        let now = Utc::now();
        for minutes in 1..=4 {
            seed_artifact(
                &catalog,
                "orders",
                "databases",
                StrategyKind::BaseBackup,
                now - Duration::minutes(minutes),
                Validity::Validated,
                b"valid",
            )
            .await;
        }
        let region = Arc::new(FsObjectStore::new("eu-west", dirs.scratch("eu-west")));
        let mut replicator = Replicator::new(catalog.clone(), SyncCursorStore::in_memory());
        replicator.add_region(region.clone());
        replicator.add_category(test_support::category("databases", Schedule::Hourly, &["eu-west"]));

        let before = replicator.verify("eu-west").await.expect("verify");
        assert_eq!(before.entries[0].primary, 4);
        assert_eq!(before.entries[0].secondary, 0);
        assert!(!before.entries[0].within_tolerance);

        replicator.sync("databases", now).await.expect("sync");
        let after = replicator.verify("eu-west").await.expect("verify");
        assert_eq!(after.entries[0].secondary, 4);
        assert!(after.entries[0].within_tolerance);
        assert!(replicator.verify("mars").await.is_err());
    }
}
