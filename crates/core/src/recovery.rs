//! Recovery dispatch keyed by failure category.
//!
//! The dispatcher looks up a strategy for the exact category, then walks up
//! [`FailureCategory::parent`] to the nearest registered one, then falls back
//! to a generic strategy. Attempts are serialized: two recoveries never race
//! against the same set of host processes.

use crate::config::RecoveryConfig;
use crate::error::{ConversionError, Failure, FailureCategory, Result, ValidationKind};
use crate::ledger::ResourceLedger;
use crate::reaper::ProcessReaper;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Outcome of one recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub message: String,
    pub duration: Option<Duration>,
    /// The failed operation may be retried once.
    pub retry: bool,
}

impl RecoveryOutcome {
    pub fn recovered(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            duration: None,
            retry: false,
        }
    }

    pub fn retry_after(message: impl Into<String>) -> Self {
        Self {
            retry: true,
            ..Self::recovered(message)
        }
    }

    pub fn not_recoverable(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            duration: None,
            retry: false,
        }
    }
}

/// Running recovery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub total_attempts: u64,
    pub successful_attempts: u64,
}

/// Collaborators a strategy may act on.
pub struct RecoveryContext<'a> {
    pub reaper: &'a ProcessReaper,
    pub ledger: &'a ResourceLedger,
    pub config: &'a RecoveryConfig,
    /// Free text describing what was being done.
    pub context: &'a str,
}

/// Remediation for one failure category.
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn recover(&self, failure: &Failure, ctx: &RecoveryContext<'_>) -> Result<RecoveryOutcome>;
}

/// Reap orphans of the implicated kind, wait, reclaim.
struct HostOperationRecovery;

impl RecoveryStrategy for HostOperationRecovery {
    fn name(&self) -> &'static str {
        "host-operation"
    }

    fn recover(&self, failure: &Failure, ctx: &RecoveryContext<'_>) -> Result<RecoveryOutcome> {
        let report = match failure.kind {
            Some(kind) => ctx.reaper.reap_orphans(kind),
            None => ctx.reaper.reap_all_orphans(),
        };
        std::thread::sleep(ctx.config.host_operation_delay);
        ctx.ledger.force_reclaim();
        Ok(RecoveryOutcome::recovered(format!(
            "reaped {} orphaned host process(es)",
            report.terminated.len()
        )))
    }
}

/// Terminate every app-created host regardless of kind, wait longer, reclaim.
struct HostCrashRecovery;

impl RecoveryStrategy for HostCrashRecovery {
    fn name(&self) -> &'static str {
        "host-crash"
    }

    fn recover(&self, _failure: &Failure, ctx: &RecoveryContext<'_>) -> Result<RecoveryOutcome> {
        let report = ctx.reaper.terminate_app_created(None);
        std::thread::sleep(ctx.config.host_crash_delay);
        ctx.ledger.force_reclaim();
        Ok(RecoveryOutcome::recovered(format!(
            "terminated {} app-created host process(es)",
            report.terminated.len()
        )))
    }
}

/// Only a locked file is worth waiting for.
struct ValidationRecovery;

impl RecoveryStrategy for ValidationRecovery {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn recover(&self, failure: &Failure, ctx: &RecoveryContext<'_>) -> Result<RecoveryOutcome> {
        if failure.validation == Some(ValidationKind::Locked) {
            std::thread::sleep(ctx.config.lock_retry_delay);
            return Ok(RecoveryOutcome::retry_after(format!(
                "waited {:?} for file lock to clear",
                ctx.config.lock_retry_delay
            )));
        }
        Ok(RecoveryOutcome::not_recoverable(format!(
            "invalid input is not recoverable: {}",
            failure.message
        )))
    }
}

/// Never recovered, never retried.
struct SecurityBlock;

impl RecoveryStrategy for SecurityBlock {
    fn name(&self) -> &'static str {
        "security"
    }

    fn recover(&self, failure: &Failure, _ctx: &RecoveryContext<'_>) -> Result<RecoveryOutcome> {
        Ok(RecoveryOutcome::not_recoverable(format!(
            "permanently blocked: {}",
            failure.message
        )))
    }
}

/// Retry the known transient interface codes after a short wait.
struct InterfaceRecovery;

impl RecoveryStrategy for InterfaceRecovery {
    fn name(&self) -> &'static str {
        "interface"
    }

    fn recover(&self, failure: &Failure, ctx: &RecoveryContext<'_>) -> Result<RecoveryOutcome> {
        match failure.code {
            Some(code) if code.is_transient() => {
                std::thread::sleep(ctx.config.transient_retry_delay);
                Ok(RecoveryOutcome::retry_after(format!(
                    "transient interface error {}, retrying",
                    code
                )))
            }
            Some(code) => Ok(RecoveryOutcome::not_recoverable(format!(
                "interface error {} is not recoverable",
                code
            ))),
            None => Ok(RecoveryOutcome::not_recoverable(
                "interface error without status code",
            )),
        }
    }
}

/// The host is missing or misused; waiting will not help.
struct ConfigurationFailure;

impl RecoveryStrategy for ConfigurationFailure {
    fn name(&self) -> &'static str {
        "configuration"
    }

    fn recover(&self, failure: &Failure, _ctx: &RecoveryContext<'_>) -> Result<RecoveryOutcome> {
        Ok(RecoveryOutcome::not_recoverable(format!(
            "configuration problem: {}",
            failure.message
        )))
    }
}

/// Fallback: reclaim and pause briefly.
struct GenericRecovery;

impl RecoveryStrategy for GenericRecovery {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn recover(&self, _failure: &Failure, ctx: &RecoveryContext<'_>) -> Result<RecoveryOutcome> {
        ctx.ledger.force_reclaim();
        std::thread::sleep(ctx.config.generic_delay);
        Ok(RecoveryOutcome::recovered("reclaimed resources"))
    }
}

/// Maps failures to recovery strategies and keeps recovery statistics.
pub struct RecoveryDispatcher {
    reaper: Arc<ProcessReaper>,
    ledger: Arc<ResourceLedger>,
    config: RecoveryConfig,
    strategies: HashMap<FailureCategory, Arc<dyn RecoveryStrategy>>,
    fallback: Arc<dyn RecoveryStrategy>,
    gate: Mutex<()>,
    total_attempts: AtomicU64,
    successful_attempts: AtomicU64,
}

impl std::fmt::Debug for RecoveryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryDispatcher")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RecoveryDispatcher {
    /// Dispatcher with the built-in strategy table.
    pub fn new(
        reaper: Arc<ProcessReaper>,
        ledger: Arc<ResourceLedger>,
        config: RecoveryConfig,
    ) -> Self {
        let mut strategies: HashMap<FailureCategory, Arc<dyn RecoveryStrategy>> = HashMap::new();
        strategies.insert(FailureCategory::Configuration, Arc::new(ConfigurationFailure));
        strategies.insert(FailureCategory::HostOperation, Arc::new(HostOperationRecovery));
        strategies.insert(FailureCategory::HostCrash, Arc::new(HostCrashRecovery));
        strategies.insert(FailureCategory::Validation, Arc::new(ValidationRecovery));
        strategies.insert(FailureCategory::Security, Arc::new(SecurityBlock));
        strategies.insert(FailureCategory::Interface, Arc::new(InterfaceRecovery));

        Self {
            reaper,
            ledger,
            config,
            strategies,
            fallback: Arc::new(GenericRecovery),
            gate: Mutex::new(()),
            total_attempts: AtomicU64::new(0),
            successful_attempts: AtomicU64::new(0),
        }
    }

    /// Register or replace the strategy for a category.
    pub fn with_strategy(
        mut self,
        category: FailureCategory,
        strategy: Arc<dyn RecoveryStrategy>,
    ) -> Self {
        self.strategies.insert(category, strategy);
        self
    }

    /// Exact match, then nearest broader category, then the fallback.
    pub fn resolve(&self, category: FailureCategory) -> &dyn RecoveryStrategy {
        let mut current = Some(category);
        while let Some(c) = current {
            if let Some(strategy) = self.strategies.get(&c) {
                return strategy.as_ref();
            }
            current = c.parent();
        }
        self.fallback.as_ref()
    }

    /// Run the strategy for `failure`. Never panics and never returns an
    /// error; a failing strategy yields an unsuccessful outcome.
    pub fn handle(&self, failure: &Failure, context: &str) -> RecoveryOutcome {
        let _gate = self.gate.lock();
        let start = Instant::now();
        self.total_attempts.fetch_add(1, Ordering::SeqCst);

        let strategy = self.resolve(failure.category);
        let ctx = RecoveryContext {
            reaper: &self.reaper,
            ledger: &self.ledger,
            config: &self.config,
            context,
        };

        info!(
            category = %failure.category,
            strategy = strategy.name(),
            "Recovering from failure in {}: {}",
            context,
            failure.message
        );

        let mut outcome = match catch_unwind(AssertUnwindSafe(|| strategy.recover(failure, &ctx))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let e = ConversionError::RecoveryFailed {
                    strategy: strategy.name(),
                    message: e.to_string(),
                };
                warn!("{}", e);
                RecoveryOutcome::not_recoverable(e.to_string())
            }
            Err(_) => {
                error!("Recovery strategy '{}' panicked", strategy.name());
                RecoveryOutcome::not_recoverable(format!(
                    "recovery strategy '{}' panicked",
                    strategy.name()
                ))
            }
        };
        outcome.duration = Some(start.elapsed());

        if outcome.success {
            self.successful_attempts.fetch_add(1, Ordering::SeqCst);
            info!(
                "Recovery '{}' succeeded in {:?}: {}",
                strategy.name(),
                start.elapsed(),
                outcome.message
            );
        } else {
            warn!("Recovery '{}' did not recover: {}", strategy.name(), outcome.message);
        }
        outcome
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            total_attempts: self.total_attempts.load(Ordering::SeqCst),
            successful_attempts: self.successful_attempts.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }
}
