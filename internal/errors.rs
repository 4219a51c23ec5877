use crate::meta::models::{AlertCategory, Severity, StrategyKind};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupFailureReason {
    Timeout { waited: Duration },
    Tool(String),
    Io(String),
    Engine(String),
    Unsupported,
    UnknownService,
}

impl BackupFailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Tool(_) => "tool_failed",
            Self::Io(_) => "io_error",
            Self::Engine(_) => "engine_error",
            Self::Unsupported => "unsupported_strategy",
            Self::UnknownService => "unknown_service",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFailure {
    pub service: String,
    pub strategy: StrategyKind,
    pub reason: BackupFailureReason,
}

impl BackupFailure {
    pub fn new(service: &str, strategy: StrategyKind, reason: BackupFailureReason) -> Self {
        Self {
            service: service.to_string(),
            strategy,
            reason,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.reason, BackupFailureReason::Timeout { .. })
    }
}

impl fmt::Display for BackupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let detail = match &self.reason {
            BackupFailureReason::Timeout { waited } => {
                format!("timed out after {}ms", waited.as_millis())
            }
            BackupFailureReason::Tool(msg)
            | BackupFailureReason::Io(msg)
            | BackupFailureReason::Engine(msg) => msg.clone(),
            BackupFailureReason::Unsupported => "strategy not supported by engine".to_string(),
            BackupFailureReason::UnknownService => "service is not configured".to_string(),
        };
        write!(
            f,
            "backup {}/{} failed ({}): {}",
            self.service,
            self.strategy.as_str(),
            self.reason.code(),
            detail
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Unreadable,
    TooSmall,
    BadMagic,
    Undecodable,
    Truncated,
    Incomplete,
    ChecksumMismatch,
}

impl InvalidReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unreadable => "unreadable",
            Self::TooSmall => "below_min_size",
            Self::BadMagic => "bad_header",
            Self::Undecodable => "undecodable_stream",
            Self::Truncated => "truncated",
            Self::Incomplete => "structurally_incomplete",
            Self::ChecksumMismatch => "checksum_mismatch",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unreadable" => Some(Self::Unreadable),
            "below_min_size" => Some(Self::TooSmall),
            "bad_header" => Some(Self::BadMagic),
            "undecodable_stream" => Some(Self::Undecodable),
            "truncated" => Some(Self::Truncated),
            "structurally_incomplete" => Some(Self::Incomplete),
            "checksum_mismatch" => Some(Self::ChecksumMismatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityFailure {
    pub artifact_id: Uuid,
    pub reason: InvalidReason,
    pub detail: String,
}

impl fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "artifact {} invalid ({}): {}",
            self.artifact_id,
            self.reason.code(),
            self.detail
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationFailure {
    pub category: String,
    pub region: String,
    pub detail: String,
}

impl fmt::Display for ReplicationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replication of '{}' to region '{}' failed: {}",
            self.category, self.region, self.detail
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdBreach {
    pub service: String,
    pub category: AlertCategory,
    pub level: Severity,
    pub observed: f64,
    pub limit: f64,
    pub message: String,
}

impl fmt::Display for ThresholdBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} for {}: {} (observed {:.2}, limit {:.2})",
            self.level.as_str(),
            self.category.as_str(),
            self.service,
            self.message,
            self.observed,
            self.limit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentPhase {
    Provision,
    Control,
    Teardown,
}

impl EnvironmentPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Control => "control",
            Self::Teardown => "teardown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentFailure {
    pub phase: EnvironmentPhase,
    pub detail: String,
}

impl EnvironmentFailure {
    pub fn new(phase: EnvironmentPhase, detail: impl Into<String>) -> Self {
        Self {
            phase,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for EnvironmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sandbox {} failed: {}", self.phase.as_str(), self.detail)
    }
}
