//! Configuration and request/result types for office-pdf conversion.

use crate::error::{ConversionError, ErrorReport, Failure, FailureCategory, Result};
use crate::host::{HostKind, HostOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for locating and starting automation hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Path to the soffice binary. If None, searches well-known locations and PATH.
    pub soffice_path: Option<PathBuf>,

    /// Executable names per host kind, used to find instances the user
    /// already had running at startup.
    pub process_names: BTreeMap<HostKind, Vec<String>>,

    /// Application options applied to every new host before any file is opened.
    pub options: HostOptions,

    /// Time to wait for a new host to come up.
    /// Default: 30 seconds.
    pub startup_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        let process_names = HostKind::ALL
            .iter()
            .map(|kind| {
                let names = kind
                    .default_process_names()
                    .iter()
                    .map(|n| n.to_string())
                    .collect();
                (*kind, names)
            })
            .collect();

        Self {
            soffice_path: None,
            process_names,
            options: HostOptions::automation(),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

impl HostConfig {
    /// Set the soffice binary path.
    pub fn soffice_path(mut self, path: PathBuf) -> Self {
        self.soffice_path = Some(path);
        self
    }

    /// Names to look for when snapshotting user-owned instances of `kind`.
    pub fn names_for(&self, kind: HostKind) -> &[String] {
        self.process_names
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Configuration for the per-thread converter pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum conversions served by one host session before it is recycled.
    /// Bounds memory growth inside the host process.
    /// Default: 20.
    pub max_uses_per_session: u32,

    /// A session idle for longer than this is recycled on its next use.
    /// Default: 300 seconds.
    pub idle_timeout: Duration,

    /// Wall-clock budget for one conversion. On expiry the host is treated
    /// as hung.
    /// Default: 120 seconds.
    pub conversion_timeout: Duration,

    /// Probe a reused session with a responsiveness check before handing it out.
    /// Default: true.
    pub health_check_on_acquire: bool,

    /// Directory for staged copies of remote inputs.
    /// Default: system temp directory.
    pub temp_dir: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_uses_per_session: 20,
            idle_timeout: Duration::from_secs(300),
            conversion_timeout: Duration::from_secs(120),
            health_check_on_acquire: true,
            temp_dir: None,
        }
    }
}

impl PoolConfig {
    /// Set the maximum conversions per session before recycling.
    pub fn max_uses_per_session(mut self, max: u32) -> Self {
        self.max_uses_per_session = max;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the conversion timeout.
    pub fn conversion_timeout(mut self, timeout: Duration) -> Self {
        self.conversion_timeout = timeout;
        self
    }

    /// Set the temporary directory.
    pub fn temp_dir(mut self, dir: PathBuf) -> Self {
        self.temp_dir = Some(dir);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_uses_per_session == 0 {
            return Err(ConversionError::InvalidConfig(
                "max_uses_per_session must be at least 1".to_string(),
            ));
        }
        if self.conversion_timeout.is_zero() {
            return Err(ConversionError::InvalidConfig(
                "conversion_timeout must be greater than 0".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConversionError::InvalidConfig(
                "idle_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for terminating host processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// How long a graceful close may take before the process is killed.
    /// Default: 5 seconds.
    pub graceful_timeout: Duration,

    /// Polling interval while waiting for a process to exit.
    /// Default: 100 milliseconds.
    pub poll_interval: Duration,

    /// Interval of the opportunistic orphan sweep. None disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            sweep_interval: None,
        }
    }
}

impl ReaperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ConversionError::InvalidConfig(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        if matches!(self.sweep_interval, Some(d) if d.is_zero()) {
            return Err(ConversionError::InvalidConfig(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Delays used by the recovery strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Wait after reaping orphans for a failed host operation.
    /// Default: 2 seconds.
    pub host_operation_delay: Duration,

    /// Wait after terminating every app-created host on a crash.
    /// Default: 5 seconds.
    pub host_crash_delay: Duration,

    /// Wait before retrying a locked input file.
    /// Default: 1 second.
    pub lock_retry_delay: Duration,

    /// Wait before retrying a transient interface error.
    /// Default: 500 milliseconds.
    pub transient_retry_delay: Duration,

    /// Wait used by the generic fallback strategy.
    /// Default: 250 milliseconds.
    pub generic_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            host_operation_delay: Duration::from_secs(2),
            host_crash_delay: Duration::from_secs(5),
            lock_retry_delay: Duration::from_secs(1),
            transient_retry_delay: Duration::from_millis(500),
            generic_delay: Duration::from_millis(250),
        }
    }
}

impl RecoveryConfig {
    /// All delays set to `delay`. Mostly useful in tests.
    pub fn uniform(delay: Duration) -> Self {
        Self {
            host_operation_delay: delay,
            host_crash_delay: delay,
            lock_retry_delay: delay,
            transient_retry_delay: delay,
            generic_delay: delay,
        }
    }
}

/// Limits applied by the built-in input validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Largest accepted input.
    /// Default: 200 MiB.
    pub max_input_bytes: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 200 * 1024 * 1024,
        }
    }
}

/// Combined configuration for the converter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub host: HostConfig,
    pub pool: PoolConfig,
    pub reaper: ReaperConfig,
    pub recovery: RecoveryConfig,
    pub validation: ValidationConfig,

    /// Upper bound on concurrent single-use conversions.
    /// Default: number of CPU cores.
    pub max_parallel: Option<usize>,
}

impl ConverterConfig {
    /// Parse a configuration from JSON. Missing sections fall back to defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConversionError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| ConversionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Effective parallelism limit.
    pub fn parallelism(&self) -> usize {
        self.max_parallel.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Validate the entire configuration.
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.reaper.validate()?;
        if self.max_parallel == Some(0) {
            return Err(ConversionError::InvalidConfig(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if self.validation.max_input_bytes == 0 {
            return Err(ConversionError::InvalidConfig(
                "max_input_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a request uses its host session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversionMode {
    /// Create a session, convert one file, retire the session.
    #[default]
    SingleUse,
    /// Reuse the live session until the batch is finished.
    Batch,
}

/// A single conversion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    /// Path to the input document.
    pub input_path: PathBuf,

    /// Where the PDF should be written.
    pub output_path: PathBuf,

    /// Session usage mode.
    pub mode: ConversionMode,
}

impl ConversionRequest {
    /// Create a new single-use conversion request.
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            mode: ConversionMode::SingleUse,
        }
    }

    /// Convert next to the input, replacing its extension with `.pdf`.
    pub fn beside_input(input_path: impl Into<PathBuf>) -> Self {
        let input_path = input_path.into();
        let output_path = input_path.with_extension("pdf");
        Self::new(input_path, output_path)
    }

    /// Set the session usage mode.
    pub fn with_mode(mut self, mode: ConversionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Host kind able to open the input, if any.
    pub fn host_kind(&self) -> Option<HostKind> {
        HostKind::for_path(&self.input_path)
    }
}

/// Outcome of one conversion call. Never mutated after it is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub input_path: PathBuf,
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub error_message: Option<String>,
    /// Category of the failure, for the UI collaborator's report.
    pub failure: Option<FailureCategory>,
    pub duration: Duration,
    #[serde(skip)]
    failure_detail: Option<Failure>,
}

impl ConversionResult {
    pub fn succeeded(input_path: PathBuf, output_path: PathBuf, duration: Duration) -> Self {
        Self {
            input_path,
            success: true,
            output_path: Some(output_path),
            error_message: None,
            failure: None,
            duration,
            failure_detail: None,
        }
    }

    pub fn failed(input_path: PathBuf, failure: Failure, duration: Duration) -> Self {
        Self {
            input_path,
            success: false,
            output_path: None,
            error_message: Some(failure.message.clone()),
            failure: Some(failure.category),
            duration,
            failure_detail: Some(failure),
        }
    }

    /// User-facing report for a failed conversion.
    pub fn report(&self) -> Option<ErrorReport> {
        self.failure_detail.as_ref().map(ErrorReport::for_failure)
    }
}

/// Progress information for a batch operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionProgress {
    /// Index of the current file being processed.
    pub file_index: usize,

    /// Total number of files to process.
    pub total_files: usize,

    /// Name of the current file.
    pub current_file: String,

    /// Current stage of processing.
    pub stage: ConversionStage,
}

/// Stage of a file within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionStage {
    /// Queued, waiting to start.
    Queued,
    /// Being converted by the automation host.
    Converting,
    /// Completed successfully.
    Completed,
    /// Failed with error.
    Failed,
}

/// Result of a batch conversion operation.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Successfully converted files.
    pub successful: Vec<ConversionResult>,

    /// Failed conversions.
    pub failed: Vec<ConversionResult>,

    /// Total processing time.
    pub total_duration: Duration,
}

impl BatchResult {
    /// Output paths in input order, for the merge collaborator.
    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.successful
            .iter()
            .filter_map(|r| r.output_path.clone())
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Counters exposed to the telemetry/UI layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Host object references acquired.
    pub created_count: u64,
    /// Host object references released.
    pub released_count: u64,
    /// `created_count - released_count`; non-zero at rest means a leak.
    pub outstanding: u64,
    /// Releases the host reported as failed.
    pub release_failures: u64,
    pub recovery_attempts: u64,
    pub recovery_successes: u64,
}
