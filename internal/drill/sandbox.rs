use crate::errors::{EnvironmentFailure, EnvironmentPhase};
use crate::util::config::{SandboxSpec, ServiceConfig};
use crate::util::process::{run_tool, ToolCommand};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A disposable instance handed out for one drill run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxLease {
    pub id: String,
    pub service: String,
    pub endpoint: String,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Starts an instance of `service` whose data directory is `data_dir`.
    async fn provision(
        &self,
        run_id: Uuid,
        service: &ServiceConfig,
        spec: &SandboxSpec,
        data_dir: &Path,
    ) -> Result<SandboxLease, EnvironmentFailure>;
    async fn release(&self, lease: &SandboxLease) -> Result<(), EnvironmentFailure>;
}

pub fn sandbox_name(run_id: Uuid, service: &str) -> String {
    let run = run_id.simple().to_string();
    let service: String = service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("bdr-drill-{}-{service}", &run[..8])
}

pub fn render_endpoint(template: &str, host: &str, port: u16) -> String {
    template
        .replace("{host}", host)
        .replace("{port}", &port.to_string())
}

/// Parses `docker port` output such as `0.0.0.0:49153\n[::]:49153`.
pub fn parse_published_port(output: &str) -> Option<u16> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.rsplit(':').next())
        .and_then(|port| port.parse().ok())
}

/// One container on its own network per lease.
pub struct DockerSandbox {
    host: String,
    tool_timeout: Duration,
}

impl DockerSandbox {
    pub fn new(host: &str, tool_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            tool_timeout,
        }
    }

    async fn docker<I, S>(&self, phase: EnvironmentPhase, args: I) -> Result<String, EnvironmentFailure>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = ToolCommand::new("docker", self.tool_timeout).args(args);
        let display = command.display();
        run_tool(command)
            .await
            .map(|output| output.stdout_text())
            .map_err(|err| EnvironmentFailure::new(phase, format!("{display}: {err}")))
    }

    async fn start_container(
        &self,
        name: &str,
        spec: &SandboxSpec,
        data_dir: &Path,
    ) -> Result<u16, EnvironmentFailure> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--network".to_string(),
            name.to_string(),
            "-p".to_string(),
            format!("{}::{}", self.host, spec.port),
            "-v".to_string(),
            format!("{}:{}", data_dir.display(), spec.data_mount),
        ];
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        self.docker(EnvironmentPhase::Provision, args).await?;
        let published = self
            .docker(
                EnvironmentPhase::Provision,
                ["port".to_string(), name.to_string(), format!("{}/tcp", spec.port)],
            )
            .await?;
        parse_published_port(&published).ok_or_else(|| {
            EnvironmentFailure::new(
                EnvironmentPhase::Provision,
                format!("no published port for {name}: '{published}'"),
            )
        })
    }
}

#[async_trait]
impl SandboxProvider for DockerSandbox {
    async fn provision(
        &self,
        run_id: Uuid,
        service: &ServiceConfig,
        spec: &SandboxSpec,
        data_dir: &Path,
    ) -> Result<SandboxLease, EnvironmentFailure> {
        let name = sandbox_name(run_id, &service.name);
        self.docker(EnvironmentPhase::Provision, ["network", "create", name.as_str()])
            .await?;
        let lease = SandboxLease {
            id: name.clone(),
            service: service.name.clone(),
            endpoint: String::new(),
        };
        match self.start_container(&name, spec, data_dir).await {
            Ok(port) => {
                tracing::info!(sandbox = %name, service = %service.name, port, "sandbox provisioned");
                Ok(SandboxLease {
                    endpoint: render_endpoint(&spec.endpoint, &self.host, port),
                    ..lease
                })
            }
            Err(err) => {
                if let Err(cleanup) = self.release(&lease).await {
                    tracing::warn!(sandbox = %name, error = %cleanup, "partial sandbox cleanup failed");
                }
                Err(err)
            }
        }
    }

    async fn release(&self, lease: &SandboxLease) -> Result<(), EnvironmentFailure> {
        let container = self
            .docker(EnvironmentPhase::Teardown, ["rm", "-f", lease.id.as_str()])
            .await;
        let network = self
            .docker(EnvironmentPhase::Teardown, ["network", "rm", lease.id.as_str()])
            .await;
        container.and(network).map(|_| ())
    }
}

/// Owns everything a drill run acquires. Releasing is explicit; whatever is
/// still held when the scope is dropped is released in the background.
pub struct SandboxScope {
    provider: Arc<dyn SandboxProvider>,
    leases: Vec<SandboxLease>,
    scratch: Vec<PathBuf>,
}

impl SandboxScope {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            provider,
            leases: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn provider(&self) -> Arc<dyn SandboxProvider> {
        self.provider.clone()
    }

    pub fn track(&mut self, lease: SandboxLease) {
        self.leases.push(lease);
    }

    pub fn track_dir(&mut self, dir: PathBuf) {
        self.scratch.push(dir);
    }

    pub fn outstanding(&self) -> usize {
        self.leases.len()
    }

    /// Releases every lease, newest first. Errors are collected so one stuck
    /// sandbox does not keep the others alive.
    pub async fn release_all(&mut self) -> Vec<EnvironmentFailure> {
        let mut failures = Vec::new();
        while let Some(lease) = self.leases.pop() {
            if let Err(err) = self.provider.release(&lease).await {
                tracing::warn!(sandbox = %lease.id, error = %err, "sandbox release failed");
                failures.push(err);
            }
        }
        for dir in self.scratch.drain(..) {
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    failures.push(EnvironmentFailure::new(
                        EnvironmentPhase::Teardown,
                        format!("remove {} failed: {err}", dir.display()),
                    ));
                }
            }
        }
        failures
    }
}

impl Drop for SandboxScope {
    fn drop(&mut self) {
        for dir in self.scratch.drain(..) {
            let _ = std::fs::remove_dir_all(dir);
        }
        if self.leases.is_empty() {
            return;
        }
        let leases = std::mem::take(&mut self.leases);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(count = leases.len(), "sandbox scope dropped outside a runtime");
            return;
        };
        let provider = self.provider.clone();
        runtime.spawn(async move {
            for lease in leases.iter().rev() {
                if let Err(err) = provider.release(lease).await {
                    tracing::warn!(sandbox = %lease.id, error = %err, "deferred sandbox release failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_published_port, render_endpoint, sandbox_name, SandboxScope};
    use crate::test_support::FakeSandbox;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn names_are_docker_safe() {
        let id = Uuid::parse_str("12345678-9abc-def0-1234-56789abcdef0").expect("uuid");
        assert_eq!(sandbox_name(id, "Orders_DB"), "bdr-drill-12345678-orders-db");
    }

    #[test]
    fn published_ports_and_endpoints() {
        assert_eq!(parse_published_port("0.0.0.0:49153\n[::]:49153\n"), Some(49153));
        assert_eq!(parse_published_port(""), None);
        assert_eq!(
            render_endpoint("redis://{host}:{port}/0", "127.0.0.1", 49153),
            "redis://127.0.0.1:49153/0"
        );
    }

    #[tokio::test]
    async fn release_all_returns_every_lease() {
        let provider = Arc::new(FakeSandbox::default());
        let mut scope = SandboxScope::new(provider.clone());
        let service = crate::test_support::volume_service("files", "bulk", std::path::Path::new("/srv"));
        let spec = crate::test_support::sandbox_spec();
        let dir = tempfile::tempdir().expect("dir");
        for _ in 0..2 {
            let lease = scope
                .provider()
                .provision(Uuid::new_v4(), &service, &spec, dir.path())
                .await
                .expect("lease");
            scope.track(lease);
        }
        assert_eq!(provider.active(), 2);
        assert!(scope.release_all().await.is_empty());
        assert_eq!(provider.active(), 0);
        assert_eq!(scope.outstanding(), 0);
    }

    #[tokio::test]
    async fn dropped_scope_releases_in_background() {
        let provider = Arc::new(FakeSandbox::default());
        {
            let mut scope = SandboxScope::new(provider.clone());
            let service = crate::test_support::volume_service("files", "bulk", std::path::Path::new("/srv"));
            let dir = tempfile::tempdir().expect("dir");
            let lease = scope
                .provider()
                .provision(Uuid::new_v4(), &service, &crate::test_support::sandbox_spec(), dir.path())
                .await
                .expect("lease");
            scope.track(lease);
        }
        for _ in 0..50 {
            if provider.active() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(provider.active(), 0);
    }
}
