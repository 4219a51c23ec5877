use crate::meta::catalog::{parse_artifact_timestamp, ArtifactCatalog};
use crate::meta::models::{RetentionPolicy, Validity};
use crate::obs::Metrics;
use crate::storage::object_store::{category_prefix, key_file_name, ObjectStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionOutcome {
    pub local_deleted: Vec<String>,
    pub remote_deleted: Vec<String>,
    pub kept_unvalidated: Vec<String>,
    pub errors: Vec<String>,
}

impl RetentionOutcome {
    pub fn deletions(&self) -> usize {
        self.local_deleted.len() + self.remote_deleted.len()
    }
}

/// Age-based pruning of local artifacts and their replicated copies. Each
/// policy's `service_class` names a category.
pub struct RetentionManager {
    catalog: ArtifactCatalog,
    regions: BTreeMap<String, Arc<dyn ObjectStore>>,
    category_regions: BTreeMap<String, Vec<String>>,
    metrics: Option<Arc<Metrics>>,
}

impl RetentionManager {
    pub fn new(catalog: ArtifactCatalog) -> Self {
        Self {
            catalog,
            regions: BTreeMap::new(),
            category_regions: BTreeMap::new(),
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

    pub fn assign_regions(&mut self, category: &str, regions: Vec<String>) {
        self.category_regions.insert(category.to_string(), regions);
    }

    /// Deletes what the policy has aged out. Re-running with nothing new to
    /// prune deletes nothing.
    pub async fn enforce(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionOutcome, String> {
        policy.validate()?;
        let mut outcome = RetentionOutcome::default();
        self.prune_local(policy, now, &mut outcome).await?;
        self.prune_remote(policy, now, &mut outcome).await;

        if let Some(metrics) = &self.metrics {
            metrics
                .retention_deletions
                .with_label_values(&["local"])
                .inc_by(outcome.local_deleted.len() as u64);
            metrics
                .retention_deletions
                .with_label_values(&["remote"])
                .inc_by(outcome.remote_deleted.len() as u64);
        }
        tracing::info!(
            category = %policy.service_class,
            local_deleted = outcome.local_deleted.len(),
            remote_deleted = outcome.remote_deleted.len(),
            kept_unvalidated = outcome.kept_unvalidated.len(),
            "retention enforced"
        );
        Ok(outcome)
    }

    async fn prune_local(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        outcome: &mut RetentionOutcome,
    ) -> Result<(), String> {
        let cutoff = policy.primary_cutoff(now);
        for artifact in self.catalog.list_category(&policy.service_class).await? {
            if artifact.created_at >= cutoff {
                continue;
            }
            if artifact.validity == Validity::Created {
                outcome.kept_unvalidated.push(artifact.name);
                continue;
            }
            match self.catalog.remove(&artifact).await {
                Ok(()) => outcome.local_deleted.push(artifact.name),
                Err(err) => {
                    tracing::warn!(artifact = %artifact.name, error = %err, "local prune failed");
                    outcome.errors.push(err);
                }
            }
        }
        Ok(())
    }

    async fn prune_remote(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        outcome: &mut RetentionOutcome,
    ) {
        let cutoff = policy.secondary_cutoff(now);
        let prefix = category_prefix(&policy.service_class);
        let Some(regions) = self.category_regions.get(&policy.service_class) else {
            return;
        };
        for region in regions {
            let Some(store) = self.regions.get(region) else {
                continue;
            };
            let objects = match store.list(&prefix).await {
                Ok(objects) => objects,
                Err(err) => {
                    tracing::warn!(region = %region, error = %err, "remote listing failed, skipping prune");
                    outcome.errors.push(format!("{region}: {err}"));
                    continue;
                }
            };
            for object in objects {
                let created = parse_artifact_timestamp(key_file_name(&object.key))
                    .unwrap_or(object.modified_at);
                if created >= cutoff {
                    continue;
                }
                match store.delete(&object.key).await {
                    Ok(()) => outcome
                        .remote_deleted
                        .push(format!("{region}:{}", object.key)),
                    Err(err) => {
                        tracing::warn!(region = %region, key = %object.key, error = %err, "remote prune failed");
                        outcome.errors.push(format!("{region}: {err}"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RetentionManager;
    use crate::meta::catalog::{sidecar_name, tests::seed_artifact, ArtifactCatalog};
    use crate::meta::models::{RetentionPolicy, StrategyKind, Validity};
    use crate::storage::object_store::{artifact_key, FsObjectStore, ObjectStore};
    use crate::test_support;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    #[tokio::test]
    async fn enforce_is_idempotent_and_spares_unvalidated_artifacts() {
        let dirs = test_support::TempDirs::new();
        let catalog = ArtifactCatalog::new(dirs.base());
        let region = Arc::new(FsObjectStore::new("eu-west", dirs.scratch("eu-west")));
        let now = Utc::now();

        let old_valid = seed_artifact(
            &catalog,
            "orders",
            "databases",
            StrategyKind::BaseBackup,
            now - Duration::days(10),
            Validity::Validated,
            b"old-valid",
        )
        .await;
        let old_invalid = seed_artifact(
            &catalog,
            "orders",
            "databases",
            StrategyKind::BaseBackup,
            now - Duration::days(9),
            Validity::Invalid,
            b"old-invalid",
        )
        .await;
        let old_created = seed_artifact(
            &catalog,
            "orders",
            "databases",
            StrategyKind::BaseBackup,
            now - Duration::days(8),
            Validity::Created,
            b"old-created",
        )
        .await;
        let fresh = seed_artifact(
            &catalog,
            "orders",
            "databases",
            StrategyKind::BaseBackup,
            now - Duration::days(1),
            Validity::Validated,
            b"fresh",
        )
        .await;
        for artifact in [&old_valid, &fresh] {
            region
                .put_file(&artifact_key(artifact), &artifact.locations.local_path)
                .await
                .expect("put");
            region
                .put_file(
                    &format!("{}.metadata.json", artifact_key(artifact)),
                    &artifact.locations.local_path,
                )
                .await
                .expect("put sidecar");
        }

        let mut manager = RetentionManager::new(catalog.clone());
        manager.add_region(region.clone());
        manager.assign_regions("databases", vec!["eu-west".to_string()]);
        let policy = RetentionPolicy::new("databases", 7, 8).expect("policy");

        let first = manager.enforce(&policy, now).await.expect("enforce");
        assert_eq!(first.local_deleted.len(), 2);
        assert!(first.local_deleted.contains(&old_valid.name));
        assert!(first.local_deleted.contains(&old_invalid.name));
        assert_eq!(first.kept_unvalidated, vec![old_created.name.clone()]);
        assert_eq!(first.remote_deleted.len(), 2);
        assert!(first
            .remote_deleted
            .iter()
            .any(|key| key.ends_with(&sidecar_name(&old_valid.name))));
        assert!(first.errors.is_empty());

        let second = manager.enforce(&policy, now).await.expect("enforce");
        assert_eq!(second.deletions(), 0);
        assert_eq!(second.kept_unvalidated, vec![old_created.name.clone()]);

        let remaining = catalog.list_category("databases").await.expect("list");
        let names: Vec<&str> = remaining.iter().map(|a| a.name.as_str()).collect();
        assert!(names.contains(&fresh.name.as_str()));
        assert!(names.contains(&old_created.name.as_str()));
        assert_eq!(region.list("databases/").await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn secondary_copies_outlive_primary_deletion() {
        let dirs = test_support::TempDirs::new();
        let catalog = ArtifactCatalog::new(dirs.base());
        let region = Arc::new(FsObjectStore::new("eu-west", dirs.scratch("eu-west")));
        let now = Utc::now();
        let aged = seed_artifact(
            &catalog,
            "orders",
            "databases",
            StrategyKind::BaseBackup,
            now - Duration::days(10),
            Validity::Validated,
            b"aged",
        )
        .await;
        region
            .put_file(&artifact_key(&aged), &aged.locations.local_path)
            .await
            .expect("put");

        let mut manager = RetentionManager::new(catalog.clone());
        manager.add_region(region.clone());
        manager.assign_regions("databases", vec!["eu-west".to_string()]);
        let policy = RetentionPolicy::new("databases", 7, 30).expect("policy");
        let outcome = manager.enforce(&policy, now).await.expect("enforce");
        assert_eq!(outcome.local_deleted, vec![aged.name.clone()]);
        assert!(outcome.remote_deleted.is_empty());
        assert_eq!(region.list("databases/").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn policies_with_shorter_secondary_retention_are_rejected() {
        let dirs = test_support::TempDirs::new();
        let manager = RetentionManager::new(ArtifactCatalog::new(dirs.base()));
        let policy = RetentionPolicy {
            service_class: "databases".into(),
            primary_max_age_days: 7,
            secondary_max_age_days: 3,
        };
        assert!(manager.enforce(&policy, Utc::now()).await.is_err());
    }
}
