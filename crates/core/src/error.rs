//! Error types and failure classification.
//!
//! Errors are classified exactly once, where they are first observed, into a
//! [`FailureCategory`]. Recovery and user-facing reporting key off the
//! category, never off the concrete error variant.

use crate::host::HostKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// HRESULT-style status code reported by the automation interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceCode(pub u32);

impl InterfaceCode {
    /// The server is busy processing another call (RPC_E_SERVERCALL_RETRYLATER).
    pub const SERVER_BUSY: InterfaceCode = InterfaceCode(0x8001_010A);
    /// The callee rejected the call (RPC_E_CALL_REJECTED).
    pub const CALL_REJECTED: InterfaceCode = InterfaceCode(0x8001_0001);
    /// The RPC server is unavailable (RPC_S_SERVER_UNAVAILABLE).
    pub const RPC_UNAVAILABLE: InterfaceCode = InterfaceCode(0x8007_06BA);
    /// The object has disconnected from its clients (RPC_E_DISCONNECTED).
    pub const DISCONNECTED: InterfaceCode = InterfaceCode(0x8001_0108);
    /// The remote procedure call failed (RPC_S_CALL_FAILED).
    pub const CALL_FAILED: InterfaceCode = InterfaceCode(0x8007_06BE);

    /// Codes that clear up on their own after a short wait.
    pub const TRANSIENT: [InterfaceCode; 3] = [
        InterfaceCode::SERVER_BUSY,
        InterfaceCode::CALL_REJECTED,
        InterfaceCode::RPC_UNAVAILABLE,
    ];

    pub fn is_transient(self) -> bool {
        Self::TRANSIENT.contains(&self)
    }

    /// The host process is gone; the handle can never work again.
    pub fn is_fatal(self) -> bool {
        self == InterfaceCode::DISCONNECTED || self == InterfaceCode::CALL_FAILED
    }
}

impl fmt::Display for InterfaceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Errors raised by an [`crate::host::AutomationHost`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The host application is not installed or cannot be started.
    #[error("{kind} is not available: {message}")]
    NotInstalled { kind: HostKind, message: String },

    /// A call through the automation interface returned a failure code.
    #[error("{kind} call '{operation}' failed with {code}: {message}")]
    Interface {
        kind: HostKind,
        operation: &'static str,
        code: InterfaceCode,
        message: String,
    },

    /// The host accepted the call but could not complete it.
    #[error("{kind} operation '{operation}' failed: {message}")]
    Operation {
        kind: HostKind,
        operation: &'static str,
        message: String,
    },

    /// The host process died underneath us.
    #[error("{kind} process exited unexpectedly: {message}")]
    Crashed { kind: HostKind, message: String },

    /// The host stopped answering.
    #[error("{kind} stopped responding during '{operation}'")]
    Hung {
        kind: HostKind,
        operation: &'static str,
    },
}

impl HostError {
    pub fn kind(&self) -> HostKind {
        match self {
            HostError::NotInstalled { kind, .. }
            | HostError::Interface { kind, .. }
            | HostError::Operation { kind, .. }
            | HostError::Crashed { kind, .. }
            | HostError::Hung { kind, .. } => *kind,
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            HostError::NotInstalled { .. } => FailureCategory::Configuration,
            HostError::Interface { code, .. } if code.is_fatal() => FailureCategory::HostCrash,
            HostError::Interface { .. } => FailureCategory::Interface,
            HostError::Operation { .. } => FailureCategory::HostOperation,
            HostError::Crashed { .. } => FailureCategory::HostCrash,
            HostError::Hung { .. } => FailureCategory::HostHang,
        }
    }

    pub fn code(&self) -> Option<InterfaceCode> {
        match self {
            HostError::Interface { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Reasons an input file is refused before it reaches the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("Input file not found: {0}")]
    NotFound(PathBuf),

    #[error("Input file is locked by another process: {0}")]
    Locked(PathBuf),

    #[error("Unsupported file format '{extension}' for {path}")]
    Unsupported { path: PathBuf, extension: String },

    #[error("Input file is empty: {0}")]
    Empty(PathBuf),

    #[error("Input file {path} is {size} bytes, limit is {limit}")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Input file {path} cannot be read: {message}")]
    Unreadable { path: PathBuf, message: String },

    /// Detected malicious or policy-violating input.
    #[error("Input file {path} blocked by security policy: {reason}")]
    Security { path: PathBuf, reason: String },
}

impl ValidationFailure {
    pub fn kind(&self) -> ValidationKind {
        match self {
            ValidationFailure::NotFound(_) => ValidationKind::NotFound,
            ValidationFailure::Locked(_) => ValidationKind::Locked,
            ValidationFailure::Unsupported { .. } => ValidationKind::Unsupported,
            ValidationFailure::Empty(_) => ValidationKind::Empty,
            ValidationFailure::TooLarge { .. } => ValidationKind::TooLarge,
            ValidationFailure::Unreadable { .. } => ValidationKind::Unreadable,
            ValidationFailure::Security { .. } => ValidationKind::Security,
        }
    }
}

/// Payload-free tag of a [`ValidationFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationKind {
    NotFound,
    Locked,
    Unsupported,
    Empty,
    TooLarge,
    Unreadable,
    Security,
}

/// Main error type for the conversion core.
#[derive(Error, Debug)]
pub enum ConversionError {
    /// The automation host is missing or unusable; nothing was attempted.
    #[error("Automation host unavailable: {0}")]
    HostUnavailable(String),

    /// Host work was attempted on a thread that is not a host apartment.
    #[error("Automation host calls must run on a host apartment thread")]
    ApartmentRequired,

    /// A session was touched from a thread other than the one that created it.
    #[error("{kind} session belongs to another thread")]
    ThreadAffinity { kind: HostKind },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The automation host reported a failure.
    #[error(transparent)]
    Host(#[from] HostError),

    /// The input was refused before conversion.
    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    /// Conversion exceeded its wall-clock budget.
    #[error("Conversion timed out after {timeout:?} for '{path}'")]
    Timeout { path: PathBuf, timeout: Duration },

    /// Filesystem error while staging input or preparing output.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to start a host worker thread.
    #[error("Failed to start host worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// The worker owning the session is gone.
    #[error("Host worker has shut down")]
    WorkerShutdown,

    /// Channel communication error.
    #[error("Internal channel error: {0}")]
    ChannelError(String),

    /// A recovery strategy itself failed.
    #[error("Recovery strategy '{strategy}' failed: {message}")]
    RecoveryFailed {
        strategy: &'static str,
        message: String,
    },
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, ConversionError>;

impl ConversionError {
    /// Classify this error into the recovery taxonomy.
    pub fn category(&self) -> FailureCategory {
        match self {
            ConversionError::HostUnavailable(_)
            | ConversionError::ApartmentRequired
            | ConversionError::ThreadAffinity { .. }
            | ConversionError::InvalidConfig(_)
            | ConversionError::WorkerSpawn(_) => FailureCategory::Configuration,
            ConversionError::Host(e) => e.category(),
            ConversionError::Validation(ValidationFailure::Security { .. }) => {
                FailureCategory::Security
            }
            ConversionError::Validation(_) => FailureCategory::Validation,
            ConversionError::Timeout { .. } => FailureCategory::HostHang,
            ConversionError::Io { .. }
            | ConversionError::WorkerShutdown
            | ConversionError::ChannelError(_)
            | ConversionError::RecoveryFailed { .. } => FailureCategory::Unknown,
        }
    }

    /// Build the record handed to the recovery dispatcher.
    pub fn to_failure(&self, kind: Option<HostKind>) -> Failure {
        let (kind, code, validation) = match self {
            ConversionError::Host(e) => (Some(e.kind()), e.code(), None),
            ConversionError::Validation(v) => (kind, None, Some(v.kind())),
            ConversionError::ThreadAffinity { kind } => (Some(*kind), None, None),
            _ => (kind, None, None),
        };
        Failure {
            category: self.category(),
            kind,
            code,
            validation,
            message: self.to_string(),
        }
    }
}

impl From<async_channel::RecvError> for ConversionError {
    fn from(_: async_channel::RecvError) -> Self {
        ConversionError::ChannelError("Channel closed".to_string())
    }
}

impl<T> From<async_channel::SendError<T>> for ConversionError {
    fn from(_: async_channel::SendError<T>) -> Self {
        ConversionError::ChannelError("Channel closed".to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ConversionError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ConversionError::WorkerShutdown
    }
}

/// Recovery taxonomy. Produced by classification, consumed by the
/// dispatcher's strategy table and by [`ErrorReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCategory {
    /// Host missing, misconfigured, or called from the wrong thread.
    Configuration,
    /// The host failed an operation but is still running.
    HostOperation,
    /// The host process died.
    HostCrash,
    /// The host stopped responding.
    HostHang,
    /// Bad, locked, or oversized input.
    Validation,
    /// Malicious or policy-violating input.
    Security,
    /// Low-level automation interface error.
    Interface,
    /// Anything else.
    Unknown,
}

impl FailureCategory {
    /// The next broader category, used when no strategy is registered for
    /// this one.
    pub fn parent(self) -> Option<FailureCategory> {
        match self {
            FailureCategory::HostHang => Some(FailureCategory::HostCrash),
            FailureCategory::HostCrash | FailureCategory::Interface => {
                Some(FailureCategory::HostOperation)
            }
            _ => None,
        }
    }

    /// Whether a failure of this category means the session that saw it can
    /// no longer be trusted.
    pub fn affects_host(self) -> bool {
        matches!(
            self,
            FailureCategory::HostOperation
                | FailureCategory::HostCrash
                | FailureCategory::HostHang
                | FailureCategory::Interface
        )
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCategory::Configuration => "configuration",
            FailureCategory::HostOperation => "host-operation",
            FailureCategory::HostCrash => "host-crash",
            FailureCategory::HostHang => "host-hang",
            FailureCategory::Validation => "validation",
            FailureCategory::Security => "security",
            FailureCategory::Interface => "interface",
            FailureCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified failure, as routed to the recovery dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub category: FailureCategory,
    /// Host kind implicated, when known.
    pub kind: Option<HostKind>,
    /// Interface status code, for [`FailureCategory::Interface`].
    pub code: Option<InterfaceCode>,
    /// Validation sub-kind, for [`FailureCategory::Validation`].
    pub validation: Option<ValidationKind>,
    pub message: String,
}

impl Failure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            kind: None,
            code: None,
            validation: None,
            message: message.into(),
        }
    }

    pub fn with_kind(mut self, kind: HostKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_code(mut self, code: InterfaceCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_validation(mut self, validation: ValidationKind) -> Self {
        self.validation = Some(validation);
        self
    }
}

/// What the UI collaborator shows for a failed conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub title: String,
    pub message: String,
    pub recovery_guidance: String,
    pub can_retry: bool,
}

impl ErrorReport {
    /// Derive the report from the failure's category.
    pub fn for_failure(failure: &Failure) -> Self {
        let (title, guidance, can_retry) = match failure.category {
            FailureCategory::Configuration => (
                "Office application unavailable",
                "Check that the office suite is installed and can be started, then try again.",
                false,
            ),
            FailureCategory::HostOperation => (
                "Conversion failed",
                "The office application could not process this file. Try again or open it manually to check it.",
                true,
            ),
            FailureCategory::HostCrash | FailureCategory::HostHang => (
                "Office application stopped",
                "The office application was restarted. Try the conversion again.",
                true,
            ),
            FailureCategory::Validation => match failure.validation {
                Some(ValidationKind::Locked) => (
                    "File in use",
                    "Close the file in any other program and try again.",
                    true,
                ),
                Some(ValidationKind::TooLarge) => (
                    "File too large",
                    "Reduce the file size or split it before converting.",
                    false,
                ),
                Some(ValidationKind::Unsupported) => (
                    "Unsupported file type",
                    "Only word-processor and spreadsheet files can be converted.",
                    false,
                ),
                _ => (
                    "File cannot be converted",
                    "Check that the file exists and is a valid document.",
                    false,
                ),
            },
            FailureCategory::Security => (
                "File blocked",
                "This file was blocked by security policy and will not be converted.",
                false,
            ),
            FailureCategory::Interface => {
                let transient = failure.code.map(InterfaceCode::is_transient).unwrap_or(false);
                (
                    "Office application busy",
                    "Wait a moment and try again.",
                    transient,
                )
            }
            FailureCategory::Unknown => (
                "Unexpected error",
                "Try again. If the problem persists, restart the application.",
                true,
            ),
        };

        Self {
            title: title.to_string(),
            message: failure.message.clone(),
            recovery_guidance: guidance.to_string(),
            can_retry,
        }
    }
}
