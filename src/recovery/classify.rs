use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

/// Category of a task error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The browser host itself went away
    FatalHost,
    Timeout,
    Connection,
    Protocol,
    Crash,
    ResourceLoad,
    OutOfMemory,
    Unknown,
}

/// How bad an error is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One step of a recovery plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    Wait,
    RefreshContext,
    RecreateContext,
    ReconnectProtocol,
    RestartResource,
    ClearCache,
    ReduceConcurrency,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::RefreshContext => "refresh-context",
            Self::RecreateContext => "recreate-context",
            Self::ReconnectProtocol => "reconnect-protocol",
            Self::RestartResource => "restart-resource",
            Self::ClearCache => "clear-cache",
            Self::ReduceConcurrency => "reduce-concurrency",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FatalHost => "fatal-host",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Crash => "crash",
            Self::ResourceLoad => "resource-load",
            Self::OutOfMemory => "out-of-memory",
            Self::Unknown => "unknown",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Timeout | Self::ResourceLoad => Severity::Low,
            Self::Connection | Self::Protocol | Self::Unknown => Severity::Medium,
            Self::Crash | Self::OutOfMemory => Severity::High,
            Self::FatalHost => Severity::Critical,
        }
    }

    /// Only a dead host is beyond recovery
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::FatalHost)
    }

    /// Recovery steps for this kind, always in canonical order
    pub fn plan(&self) -> &'static [RecoveryAction] {
        use RecoveryAction::*;
        match self {
            Self::Timeout | Self::Connection | Self::Unknown => {
                &[Wait, RefreshContext, RecreateContext]
            }
            Self::Protocol => &[Wait, RecreateContext, ReconnectProtocol, RestartResource],
            Self::Crash => &[Wait, RecreateContext, RestartResource, ClearCache],
            Self::ResourceLoad => &[Wait, RefreshContext],
            Self::OutOfMemory => &[Wait, RestartResource, ClearCache, ReduceConcurrency],
            Self::FatalHost => &[],
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one error message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorClass {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub recoverable: bool,
}

impl From<ErrorKind> for ErrorClass {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            recoverable: kind.is_recoverable(),
        }
    }
}

// Order matters: the first matching pattern wins.
static PATTERNS: LazyLock<Vec<(ErrorKind, Regex)>> = LazyLock::new(|| {
    [
        (ErrorKind::FatalHost, r"chrome (crashed|died)|browser (crashed|died)"),
        (ErrorKind::Timeout, r"timeout|timed out|etimedout"),
        (
            ErrorKind::Connection,
            r"connection|econnrefused|enotfound|econnreset",
        ),
        (ErrorKind::Protocol, r"network\.enable|protocol|cdp"),
        (ErrorKind::Crash, r"crash|target closed|session closed"),
        (ErrorKind::ResourceLoad, r"net::err_|failed to load resource"),
        (ErrorKind::OutOfMemory, r"out of memory|heap out of memory"),
    ]
    .into_iter()
    .map(|(kind, pattern)| {
        let regex = Regex::new(&format!("(?i){}", pattern)).expect("constant regex pattern is valid");
        (kind, regex)
    })
    .collect()
});

/// Classifies an error message by pattern, case-insensitively
pub fn classify(message: &str) -> ErrorClass {
    PATTERNS
        .iter()
        .find(|(_, regex)| regex.is_match(message))
        .map(|(kind, _)| ErrorClass::from(*kind))
        .unwrap_or_else(|| ErrorClass::from(ErrorKind::Unknown))
}
