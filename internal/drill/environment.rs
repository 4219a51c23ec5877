use crate::errors::{EnvironmentFailure, EnvironmentPhase};
use crate::util::config::DrillConfig;
use crate::util::process::{run_tool, ToolCommand};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentState {
    pub name: String,
    pub running: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentAssessment {
    pub components: Vec<ComponentState>,
}

impl EnvironmentAssessment {
    pub fn running(&self) -> usize {
        self.components.iter().filter(|c| c.running).count()
    }

    pub fn summary(&self) -> String {
        format!("{}/{} components running", self.running(), self.components.len())
    }
}

/// Control over the live environment the failover and full-DR drills act on.
#[async_trait]
pub trait EnvironmentControl: Send + Sync {
    async fn stop(&self, component: &str) -> Result<(), EnvironmentFailure>;
    async fn start(&self, component: &str) -> Result<(), EnvironmentFailure>;
    async fn teardown(&self) -> Result<(), EnvironmentFailure>;
    async fn rebuild(&self) -> Result<(), EnvironmentFailure>;
    async fn assess(&self) -> Result<EnvironmentAssessment, EnvironmentFailure>;
    fn fingerprint(&self) -> BTreeMap<String, String>;
}

pub struct ComposeEnvironment {
    compose_file: PathBuf,
    project: Option<String>,
    command_timeout: Duration,
    rebuild_timeout: Duration,
}

impl ComposeEnvironment {
    pub fn new(
        compose_file: PathBuf,
        project: Option<String>,
        command_timeout: Duration,
        rebuild_timeout: Duration,
    ) -> Self {
        Self {
            compose_file,
            project,
            command_timeout,
            rebuild_timeout,
        }
    }

    pub fn from_config(drill: &DrillConfig, command_timeout: Duration) -> Option<Self> {
        let file = drill.compose_file.clone()?;
        Some(Self::new(
            file,
            drill.compose_project.clone(),
            command_timeout,
            Duration::from_secs(drill.rebuild_timeout_seconds),
        ))
    }

    fn compose(&self, timeout: Duration) -> ToolCommand {
        let mut command = ToolCommand::new("docker", timeout)
            .arg("compose")
            .arg("-f")
            .arg(self.compose_file.display().to_string());
        if let Some(project) = &self.project {
            command = command.arg("-p").arg(project.as_str());
        }
        command
    }

    async fn run(
        &self,
        phase: EnvironmentPhase,
        command: ToolCommand,
    ) -> Result<String, EnvironmentFailure> {
        let display = command.display();
        run_tool(command)
            .await
            .map(|output| output.stdout_text())
            .map_err(|err| EnvironmentFailure::new(phase, format!("{display}: {err}")))
    }
}

#[async_trait]
impl EnvironmentControl for ComposeEnvironment {
    async fn stop(&self, component: &str) -> Result<(), EnvironmentFailure> {
        let command = self.compose(self.command_timeout).args(["stop", component]);
        self.run(EnvironmentPhase::Control, command).await.map(|_| ())
    }

    async fn start(&self, component: &str) -> Result<(), EnvironmentFailure> {
        let command = self.compose(self.command_timeout).args(["start", component]);
        self.run(EnvironmentPhase::Control, command).await.map(|_| ())
    }

    async fn teardown(&self) -> Result<(), EnvironmentFailure> {
        let command = self
            .compose(self.command_timeout)
            .args(["down", "--remove-orphans"]);
        self.run(EnvironmentPhase::Control, command).await.map(|_| ())
    }

    async fn rebuild(&self) -> Result<(), EnvironmentFailure> {
        let command = self.compose(self.rebuild_timeout).args(["up", "-d"]);
        self.run(EnvironmentPhase::Provision, command).await.map(|_| ())
    }

    async fn assess(&self) -> Result<EnvironmentAssessment, EnvironmentFailure> {
        let command = self
            .compose(self.command_timeout)
            .args(["ps", "--all", "--format", "json"]);
        let raw = self.run(EnvironmentPhase::Control, command).await?;
        parse_compose_ps(&raw)
            .map_err(|err| EnvironmentFailure::new(EnvironmentPhase::Control, err))
    }

    fn fingerprint(&self) -> BTreeMap<String, String> {
        let mut fingerprint = BTreeMap::new();
        fingerprint.insert(
            "composeFile".to_string(),
            self.compose_file.display().to_string(),
        );
        if let Some(project) = &self.project {
            fingerprint.insert("composeProject".to_string(), project.clone());
        }
        fingerprint
    }
}

#[derive(Deserialize)]
struct ComposePsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
}

/// Accepts both shapes `docker compose ps --format json` has produced: a
/// single JSON array, or one object per line.
pub fn parse_compose_ps(raw: &str) -> Result<EnvironmentAssessment, String> {
    let trimmed = raw.trim();
    let entries: Vec<ComposePsEntry> = if trimmed.is_empty() {
        Vec::new()
    } else if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|err| format!("compose ps parse failed: {err}"))?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| format!("compose ps parse failed: {err}"))
            })
            .collect::<Result<_, _>>()?
    };
    let mut components: Vec<ComponentState> = entries
        .into_iter()
        .map(|entry| ComponentState {
            running: entry.state.eq_ignore_ascii_case("running"),
            name: entry.service,
        })
        .collect();
    components.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(EnvironmentAssessment { components })
}

#[cfg(test)]
mod tests {
    use super::{parse_compose_ps, ComposeEnvironment, EnvironmentControl};
    use crate::util::config::DrillConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn compose_ps_parses_line_and_array_output() {
        let lines = "{\"Service\":\"postgres\",\"State\":\"running\"}\n{\"Service\":\"redis\",\"State\":\"exited\"}\n";
        let parsed = parse_compose_ps(lines).expect("lines");
        assert_eq!(parsed.components.len(), 2);
        assert_eq!(parsed.running(), 1);
        assert_eq!(parsed.summary(), "1/2 components running");

        let array = "[{\"Service\":\"mongo\",\"State\":\"running\"}]";
        assert_eq!(parse_compose_ps(array).expect("array").running(), 1);
        assert!(parse_compose_ps("").expect("empty").components.is_empty());
        assert!(parse_compose_ps("not json").is_err());
    }

    #[test]
    fn compose_environment_needs_a_compose_file() {
        let mut drill = DrillConfig::default();
        assert!(ComposeEnvironment::from_config(&drill, Duration::from_secs(5)).is_none());
        drill.compose_file = Some(PathBuf::from("/srv/stack/compose.yml"));
        drill.compose_project = Some("bdr".to_string());
        let env = ComposeEnvironment::from_config(&drill, Duration::from_secs(5)).expect("env");
        let fingerprint = env.fingerprint();
        assert_eq!(fingerprint["composeFile"], "/srv/stack/compose.yml");
        assert_eq!(fingerprint["composeProject"], "bdr");
        let command = env.compose(Duration::from_secs(1)).args(["ps"]);
        assert_eq!(
            command.display(),
            "docker compose -f /srv/stack/compose.yml -p bdr ps"
        );
    }
}
