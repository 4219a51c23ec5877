use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone, Default)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            timeout,
            ..Self::default()
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.envs.push((key.to_string(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, payload: Vec<u8>) -> Self {
        self.stdin = Some(payload);
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    Spawn(String),
    Timeout(Duration),
    Exit { status: Option<i32>, stderr: String },
    Io(String),
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(err) => write!(f, "spawn failed: {err}"),
            Self::Timeout(limit) => write!(f, "timed out after {}s", limit.as_secs_f64()),
            Self::Exit { status, stderr } => match status {
                Some(code) => write!(f, "exited with status {code}: {stderr}"),
                None => write!(f, "terminated by signal: {stderr}"),
            },
            Self::Io(err) => write!(f, "io failed: {err}"),
        }
    }
}

/// Runs an external tool with a hard deadline; the child is killed when the
/// deadline passes.
pub async fn run_tool(command: ToolCommand) -> Result<ToolOutput, ToolError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &command.envs {
        cmd.env(key, value);
    }
    if let Some(dir) = &command.current_dir {
        cmd.current_dir(dir);
    }
    tracing::debug!(command = %command.display(), "running tool");
    let mut child = cmd
        .spawn()
        .map_err(|err| ToolError::Spawn(format!("{}: {err}", command.program)))?;
    if let Some(payload) = command.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let feed = async move {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await
            };
            match tokio::time::timeout(command.timeout, feed).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(ToolError::Io(format!("stdin write failed: {err}"))),
                Err(_) => return Err(ToolError::Timeout(command.timeout)),
            }
        }
    }
    let output = match tokio::time::timeout(command.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(ToolError::Io(err.to_string())),
        Err(_) => return Err(ToolError::Timeout(command.timeout)),
    };
    let stderr = stderr_tail(&output.stderr);
    if !output.status.success() {
        return Err(ToolError::Exit {
            status: output.status.code(),
            stderr,
        });
    }
    Ok(ToolOutput {
        stdout: output.stdout,
        stderr,
    })
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::{run_tool, stderr_tail, ToolCommand, ToolError};
    use std::time::Duration;

    #[tokio::test]
    async fn captures_stdout_of_successful_tool() {
        let output = run_tool(
            ToolCommand::new("sh", Duration::from_secs(5)).args(["-c", "printf 'hello'"]),
        )
        .await
        .expect("run");
        assert_eq!(output.stdout_text(), "hello");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let output = run_tool(
            ToolCommand::new("cat", Duration::from_secs(5)).stdin(b"piped".to_vec()),
        )
        .await
        .expect("run");
        assert_eq!(output.stdout, b"piped");
    }

    #[tokio::test]
    async fn non_zero_exit_is_classified() {
        let err = run_tool(
            ToolCommand::new("sh", Duration::from_secs(5)).args(["-c", "echo boom >&2; exit 3"]),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            ToolError::Exit {
                status: Some(3),
                stderr: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn slow_tool_times_out() {
        let err = run_tool(ToolCommand::new("sleep", Duration::from_millis(100)).arg("5"))
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = run_tool(ToolCommand::new(
            "definitely-not-a-real-binary-bdr",
            Duration::from_secs(1),
        ))
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Spawn(_)));
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = "x".repeat(5000) + "END";
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.ends_with("END"));
        assert!(tail.len() <= 2048);
    }
}
