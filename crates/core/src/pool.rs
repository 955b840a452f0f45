//! Converter pool: at most one live host session per document type.
//!
//! A pool is bound to the thread that created it, like the sessions it owns.
//! Parallelism comes from running several pools on separate worker threads,
//! never from sharing one. Everything a pool shares with other pools lives in
//! [`HostServices`].

use crate::apartment;
use crate::config::{
    ConversionMode, ConversionRequest, ConversionResult, ConverterConfig, PoolConfig,
};
use crate::error::{ConversionError, Result, ValidationFailure};
use crate::host::{HostFactory, HostKind, HostOptions, OpenOptions};
use crate::ledger::ResourceLedger;
use crate::process::ProcessTable;
use crate::reaper::ProcessReaper;
use crate::recovery::RecoveryDispatcher;
use crate::registry::OwnershipRegistry;
use crate::session::{HostSession, RetireReason, SessionState};
use crate::validation::{BasicValidator, InputValidator};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Process-wide collaborators shared by every pool.
#[derive(Clone)]
pub struct HostServices {
    pub factory: Arc<dyn HostFactory>,
    pub registry: Arc<OwnershipRegistry>,
    pub ledger: Arc<ResourceLedger>,
    pub reaper: Arc<ProcessReaper>,
    pub recovery: Arc<RecoveryDispatcher>,
    pub validator: Arc<dyn InputValidator>,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("registry", &self.registry)
            .field("ledger", &self.ledger)
            .field("recovery", &self.recovery)
            .finish()
    }
}

impl HostServices {
    /// Wire the shared services. Snapshots user-owned host processes, so
    /// call this once at startup, before any host is created.
    pub fn new(
        factory: Arc<dyn HostFactory>,
        table: Arc<dyn ProcessTable>,
        config: &ConverterConfig,
    ) -> Self {
        let registry = Arc::new(OwnershipRegistry::new(
            Arc::clone(&table),
            config.host.process_names.clone(),
        ));
        let ledger = Arc::new(ResourceLedger::new());
        let reaper = Arc::new(ProcessReaper::new(
            table,
            Arc::clone(&registry),
            config.reaper.clone(),
        ));
        let recovery = Arc::new(RecoveryDispatcher::new(
            Arc::clone(&reaper),
            Arc::clone(&ledger),
            config.recovery.clone(),
        ));

        Self {
            factory,
            registry,
            ledger,
            reaper,
            recovery,
            validator: Arc::new(BasicValidator::new(&config.validation)),
        }
    }

    /// Replace the input validator.
    pub fn with_validator(mut self, validator: Arc<dyn InputValidator>) -> Self {
        self.validator = validator;
        self
    }
}

/// Counters for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub sessions_created: u64,
    pub sessions_retired: u64,
    pub conversions_succeeded: u64,
    pub conversions_failed: u64,
    pub retries: u64,
}

/// Serves conversion requests on the current thread.
pub struct ConverterPool {
    services: HostServices,
    config: PoolConfig,
    host_options: HostOptions,
    sessions: HashMap<HostKind, HostSession>,
    states: HashMap<HostKind, SessionState>,
    generations: HashMap<HostKind, u64>,
    stats: PoolStats,
    /// Set by the owning worker once it has recovered from a timeout.
    hang_recovered: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for ConverterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterPool")
            .field("sessions", &self.sessions)
            .field("states", &self.states)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ConverterPool {
    pub fn new(services: HostServices, config: PoolConfig, host_options: HostOptions) -> Self {
        Self {
            services,
            config,
            host_options,
            sessions: HashMap::new(),
            states: HashMap::new(),
            generations: HashMap::new(),
            stats: PoolStats::default(),
            hang_recovered: None,
        }
    }

    /// Share a flag the caller sets after it has already routed a hang of
    /// this pool's in-flight call to recovery. Failures seen after that are
    /// not dispatched or retried again.
    pub fn with_hang_signal(mut self, signal: Arc<AtomicBool>) -> Self {
        self.hang_recovered = Some(signal);
        self
    }

    fn hang_already_recovered(&self) -> bool {
        self.hang_recovered
            .as_ref()
            .map_or(false, |signal| signal.load(Ordering::SeqCst))
    }

    pub fn services(&self) -> &HostServices {
        &self.services
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn state(&self, kind: HostKind) -> SessionState {
        self.states.get(&kind).copied().unwrap_or_default()
    }

    pub fn session(&self, kind: HostKind) -> Option<&HostSession> {
        self.sessions.get(&kind)
    }

    /// Convert one file. Never fails: every error ends up in the result.
    pub fn convert(&mut self, request: &ConversionRequest) -> ConversionResult {
        let start = Instant::now();
        let kind = request.host_kind();

        let outcome = self.convert_with_retry(request, kind);

        if request.mode == ConversionMode::SingleUse {
            if let Some(kind) = kind {
                self.retire(kind, RetireReason::SingleUse);
            }
        }

        match outcome {
            Ok(output) => {
                self.stats.conversions_succeeded += 1;
                info!(
                    "Converted {:?} in {:?}",
                    request.input_path.file_name(),
                    start.elapsed()
                );
                ConversionResult::succeeded(request.input_path.clone(), output, start.elapsed())
            }
            Err(e) => {
                self.stats.conversions_failed += 1;
                warn!("Conversion of {:?} failed: {}", request.input_path, e);
                ConversionResult::failed(
                    request.input_path.clone(),
                    e.to_failure(kind),
                    start.elapsed(),
                )
            }
        }
    }

    fn convert_with_retry(
        &mut self,
        request: &ConversionRequest,
        kind: Option<HostKind>,
    ) -> Result<PathBuf> {
        apartment::require()?;
        let kind = kind.ok_or_else(|| ValidationFailure::Unsupported {
            path: request.input_path.clone(),
            extension: request
                .input_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_string(),
        })?;

        let context = format!("converting {}", request.input_path.display());
        let mut retried = false;
        loop {
            let err = match self.attempt(request, kind) {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };

            let failure = err.to_failure(Some(kind));
            if failure.category.affects_host() {
                if let Some(session) = self.sessions.get_mut(&kind) {
                    session.mark_unhealthy();
                }
                self.retire(kind, RetireReason::Unhealthy);
            }

            if self.hang_already_recovered() {
                debug!(
                    "{:?} failed after its timeout was handled: {}",
                    request.input_path.file_name(),
                    err
                );
                return Err(err);
            }

            let outcome = self.services.recovery.handle(&failure, &context);
            if outcome.retry && !retried {
                retried = true;
                self.stats.retries += 1;
                debug!("Retrying {:?} after recovery", request.input_path.file_name());
                continue;
            }
            return Err(err);
        }
    }

    fn attempt(&mut self, request: &ConversionRequest, kind: HostKind) -> Result<PathBuf> {
        self.services.validator.validate(&request.input_path)?;

        let staged = stage_input(&request.input_path, self.config.temp_dir.as_deref())?;
        let input = staged
            .as_ref()
            .map(|(_, path)| path.as_path())
            .unwrap_or(&request.input_path);

        if let Some(parent) = request.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| ConversionError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        self.acquire(kind)?;
        let session = self
            .sessions
            .get_mut(&kind)
            .ok_or_else(|| ConversionError::HostUnavailable(format!("no {} session", kind)))?;
        session.check_affinity()?;

        self.states.insert(kind, SessionState::Converting);
        let result = export_document(&self.services.ledger, session, input, &request.output_path);
        session.record_use();
        self.states.insert(kind, SessionState::Ready);

        // Dropping `staged` removes the local copy.
        result.map(|_| request.output_path.clone())
    }

    /// Make sure a usable session exists for `kind`, retiring the current one
    /// first when the recycle policy says so.
    pub fn warm_up(&mut self, kind: HostKind) -> Result<()> {
        self.acquire(kind)
    }

    fn acquire(&mut self, kind: HostKind) -> Result<()> {
        apartment::require()?;

        let reason = match self.sessions.get_mut(&kind) {
            Some(session) => {
                session.check_affinity()?;
                match session.retirement_reason(&self.config) {
                    None => return Ok(()),
                    Some(reason) => Some(reason),
                }
            }
            None => None,
        };
        if let Some(reason) = reason {
            self.retire(kind, reason);
        }

        self.states.insert(kind, SessionState::Creating);
        let generation = {
            let g = self.generations.entry(kind).or_insert(0);
            *g += 1;
            *g
        };
        debug!("Creating {} session (generation {})", kind, generation);

        match start_session(&self.services, kind, &self.host_options, generation) {
            Ok(session) => {
                self.sessions.insert(kind, session);
                self.states.insert(kind, SessionState::Ready);
                self.stats.sessions_created += 1;
                Ok(())
            }
            Err(e) => {
                self.states.insert(kind, SessionState::Absent);
                Err(e)
            }
        }
    }

    /// Retire every session. Used when a batch is done.
    pub fn finish_batch(&mut self) {
        self.retire_all(RetireReason::BatchFinished);
        self.services.ledger.force_reclaim();
    }

    /// Retire every session before the pool goes away.
    pub fn shutdown(&mut self) {
        self.retire_all(RetireReason::Shutdown);
    }

    fn retire_all(&mut self, reason: RetireReason) {
        let kinds: Vec<HostKind> = self.sessions.keys().copied().collect();
        for kind in kinds {
            self.retire(kind, reason);
        }
    }

    /// Tear a session down: close leftovers, quit, release the application,
    /// make sure the process is gone, forget it.
    fn retire(&mut self, kind: HostKind, reason: RetireReason) {
        let Some(mut session) = self.sessions.remove(&kind) else {
            self.states.insert(kind, SessionState::Absent);
            return;
        };
        self.states.insert(kind, SessionState::Retiring);
        info!(
            "Retiring {} session (generation {}, {} use(s)): {}",
            kind,
            session.generation(),
            session.use_count(),
            reason
        );

        match session.host.close_all() {
            Ok(0) => {}
            Ok(n) => debug!("Closed {} residual {} file(s)", n, kind),
            Err(e) => warn!("Failed to close residual {} files: {}", kind, e),
        }

        if session.is_owned() {
            if let Err(e) = session.host.quit() {
                warn!("{} did not quit cleanly: {}", kind, e);
            }
        } else {
            debug!("Leaving adopted {} process running", kind);
        }

        let application = session.application();
        self.services
            .ledger
            .release(session.host.as_mut(), application, "session");

        if let (true, Some(pid)) = (session.is_owned(), session.pid()) {
            if let Some(record) = self.services.reaper.ensure_exited(kind, pid) {
                warn!(
                    "{} pid {} had to be terminated (forced: {})",
                    kind, pid, record.forced
                );
            }
            self.services.registry.clear_in_use(pid);
            self.services.registry.unregister_app_created(kind, pid);
        }

        drop(session);
        self.services.ledger.force_reclaim();
        self.states.insert(kind, SessionState::Absent);
        self.stats.sessions_retired += 1;
    }
}

impl Drop for ConverterPool {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            self.shutdown();
        }
    }
}

/// Create, configure and register a new host.
fn start_session(
    services: &HostServices,
    kind: HostKind,
    options: &HostOptions,
    generation: u64,
) -> Result<HostSession> {
    let mut host = services.factory.create(kind)?;
    if let Err(e) = host.configure(options) {
        if let Err(quit) = host.quit() {
            warn!(
                "{} failed to configure and did not quit cleanly (pid {:?}): {}",
                kind,
                host.process_id(),
                quit
            );
        }
        return Err(e.into());
    }

    let owned = match host.process_id() {
        Some(pid) if services.registry.is_user_owned(pid) => {
            warn!(
                "New {} attached to user-owned pid {}; it will not be terminated",
                kind, pid
            );
            false
        }
        Some(pid) => {
            services.registry.register_app_created(kind, pid);
            services.registry.mark_in_use(pid);
            true
        }
        None => true,
    };

    let application = services.ledger.track(host.application(), "session");
    info!(
        "Started {} session (generation {}, pid {:?})",
        kind,
        generation,
        host.process_id()
    );
    Ok(HostSession::new(host, application, owned, generation))
}

/// Open, export, close inside one release scope.
fn export_document(
    ledger: &ResourceLedger,
    session: &mut HostSession,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let kind = session.kind();
    let options = OpenOptions::for_conversion();

    let closed = {
        let mut scope = ledger.scope(session.host.as_mut(), format!("convert {}", input.display()));
        let document = match kind {
            HostKind::Word => scope.open_document(input, &options)?,
            HostKind::Excel => scope.open_workbook(input, &options)?,
        };
        let exported = scope.host().export_pdf(document, output);
        let closed = scope.host().close(document, false);
        exported?;
        closed
    };

    if let Err(e) = closed {
        warn!("{} failed to close {:?} after export: {}", kind, input.file_name(), e);
        session.mark_unhealthy();
    }
    Ok(())
}

/// UNC and `//server` paths are not locally addressable.
pub fn is_network_path(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.starts_with("\\\\") || s.starts_with("//")
}

/// Copy a network input to a local temporary directory. The copy is removed
/// when the returned directory is dropped.
fn stage_input(input: &Path, temp_root: Option<&Path>) -> Result<Option<(TempDir, PathBuf)>> {
    if !is_network_path(input) {
        return Ok(None);
    }
    let io_err = |source| ConversionError::Io {
        path: input.to_path_buf(),
        source,
    };
    let dir = match temp_root {
        Some(root) => TempDir::with_prefix_in("office-pdf-stage-", root),
        None => TempDir::with_prefix("office-pdf-stage-"),
    }
    .map_err(io_err)?;

    let name = input
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "input".into());
    let local = dir.path().join(name);
    std::fs::copy(input, &local).map_err(io_err)?;
    debug!("Staged {:?} to {:?}", input, local);
    Ok(Some((dir, local)))
}
