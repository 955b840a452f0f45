//! Main converter orchestrator.
//!
//! This module provides the high-level API: single-use and batch
//! conversions, parallel conversion over independent single-use workers,
//! progress callbacks, statistics and shutdown.

use crate::config::{
    BatchResult, ConversionMode, ConversionProgress, ConversionRequest, ConversionResult,
    ConversionStage, ConverterConfig, Statistics,
};
use crate::error::{ConversionError, Result};
use crate::host::SofficeFactory;
use crate::pool::HostServices;
use crate::process::{ProcessTable, SystemProcessTable};
use crate::worker::HostWorker;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Main converter for Office documents to PDF.
///
/// Single-use requests each get a fresh worker thread and host. Batch
/// requests share one long-lived worker until [`Converter::finish_batch`].
pub struct Converter {
    /// Shared registry, ledger, reaper and recovery.
    services: HostServices,
    /// Worker serving batch-mode requests.
    batch: Mutex<Option<HostWorker>>,
    /// Periodic orphan sweep, if configured.
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Configuration.
    config: ConverterConfig,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("services", &self.services)
            .field("config", &self.config)
            .finish()
    }
}

impl Converter {
    /// Create a converter backed by the local LibreOffice install.
    pub async fn new(config: ConverterConfig) -> Result<Self> {
        config.validate()?;

        let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
        let factory = SofficeFactory::locate(&config.host)?
            .with_export_timeout(config.pool.conversion_timeout)
            .with_process_table(Arc::clone(&table));
        let services = HostServices::new(Arc::new(factory), table, &config);

        info!(
            "Initializing converter with max_parallel={}, max_uses_per_session={}",
            config.parallelism(),
            config.pool.max_uses_per_session
        );
        Ok(Self::with_services(config, services))
    }

    /// Create a converter over pre-wired services.
    pub fn with_services(config: ConverterConfig, services: HostServices) -> Self {
        let sweeper = match (config.reaper.sweep_interval, tokio::runtime::Handle::try_current()) {
            (Some(interval), Ok(_)) => Some(Arc::clone(&services.reaper).spawn_sweeper(interval)),
            (Some(_), Err(_)) => {
                warn!("No tokio runtime; periodic orphan sweep disabled");
                None
            }
            (None, _) => None,
        };

        Self {
            services,
            batch: Mutex::new(None),
            sweeper: parking_lot::Mutex::new(sweeper),
            config,
        }
    }

    fn spawn_worker(&self) -> Result<HostWorker> {
        HostWorker::spawn(
            self.services.clone(),
            self.config.pool.clone(),
            self.config.host.options.clone(),
        )
    }

    /// Convert a single document to PDF.
    pub async fn convert(&self, request: ConversionRequest) -> ConversionResult {
        match request.mode {
            ConversionMode::SingleUse => self.convert_single_use(request).await,
            ConversionMode::Batch => self.convert_in_batch(request).await,
        }
    }

    async fn convert_single_use(&self, request: ConversionRequest) -> ConversionResult {
        let worker = match self.spawn_worker() {
            Ok(worker) => worker,
            Err(e) => return spawn_failure(&request, e),
        };
        let result = worker.convert(request).await;
        if worker.is_hung() {
            worker.detach();
        } else {
            worker.shutdown().await;
        }
        result
    }

    async fn convert_in_batch(&self, request: ConversionRequest) -> ConversionResult {
        let mut batch = self.batch.lock().await;
        if batch.is_none() {
            match self.spawn_worker() {
                Ok(worker) => *batch = Some(worker),
                Err(e) => return spawn_failure(&request, e),
            }
        }
        let result = match batch.as_ref() {
            Some(worker) => worker.convert(request).await,
            None => return spawn_failure(&request, ConversionError::WorkerShutdown),
        };

        // The hung call still occupies that worker; later requests get a
        // fresh one.
        if batch.as_ref().map_or(false, HostWorker::is_hung) {
            if let Some(worker) = batch.take() {
                warn!("Replacing hung batch worker {}", worker.id());
                worker.detach();
            }
        }
        result
    }

    /// Retire the batch sessions and stop the batch worker.
    pub async fn finish_batch(&self) -> Result<()> {
        let worker = self.batch.lock().await.take();
        if let Some(worker) = worker {
            let stats = worker.finish_batch().await;
            worker.shutdown().await;
            debug!("Batch finished: {:?}", stats?);
        }
        Ok(())
    }

    /// Convert documents one after another on one reused session per
    /// document type, then finish the batch.
    pub async fn convert_batch(&self, requests: Vec<ConversionRequest>) -> BatchResult {
        self.convert_batch_with_progress(requests, |_| {}).await
    }

    /// [`Converter::convert_batch`] with a progress callback per file.
    pub async fn convert_batch_with_progress<F>(
        &self,
        requests: Vec<ConversionRequest>,
        progress_callback: F,
    ) -> BatchResult
    where
        F: Fn(ConversionProgress) + Send + Sync,
    {
        let start = Instant::now();
        let total_files = requests.len();
        let mut successful = Vec::new();
        let mut failed = Vec::new();

        for (file_index, request) in requests.into_iter().enumerate() {
            let current_file = request
                .input_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string();
            let report = |stage| ConversionProgress {
                file_index,
                total_files,
                current_file: current_file.clone(),
                stage,
            };

            progress_callback(report(ConversionStage::Converting));
            let result = self.convert(request.with_mode(ConversionMode::Batch)).await;
            if result.success {
                progress_callback(report(ConversionStage::Completed));
                successful.push(result);
            } else {
                error!(
                    "Failed to convert {:?}: {}",
                    result.input_path,
                    result.error_message.as_deref().unwrap_or("unknown error")
                );
                progress_callback(report(ConversionStage::Failed));
                failed.push(result);
            }
        }

        if let Err(e) = self.finish_batch().await {
            warn!("Failed to finish batch: {}", e);
        }

        BatchResult {
            successful,
            failed,
            total_duration: start.elapsed(),
        }
    }

    /// Convert documents on independent single-use workers, at most
    /// `min(max_parallel, file count)` at a time. Results keep input order.
    pub async fn convert_parallel(&self, requests: Vec<ConversionRequest>) -> BatchResult {
        let start = Instant::now();
        let limit = self.config.parallelism().min(requests.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        debug!("Converting {} file(s), {} at a time", requests.len(), limit);

        let futures = requests.into_iter().map(|request| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                self.convert(request.with_mode(ConversionMode::SingleUse)).await
            }
        });
        let results = join_all(futures).await;

        let (successful, failed): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| r.success);
        BatchResult {
            successful,
            failed,
            total_duration: start.elapsed(),
        }
    }

    /// Counters for the telemetry/UI layer.
    pub fn statistics(&self) -> Statistics {
        let ledger = self.services.ledger.stats();
        let recovery = self.services.recovery.stats();
        Statistics {
            created_count: ledger.created,
            released_count: ledger.released,
            outstanding: ledger.outstanding,
            release_failures: ledger.release_failures,
            recovery_attempts: recovery.total_attempts,
            recovery_successes: recovery.successful_attempts,
        }
    }

    /// Finish the batch, stop the sweep and terminate every host process this
    /// application started that is still running.
    pub async fn shutdown(&self) {
        info!("Shutting down converter");
        if let Err(e) = self.finish_batch().await {
            warn!("Failed to finish batch during shutdown: {}", e);
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        let reaper = Arc::clone(&self.services.reaper);
        match tokio::task::spawn_blocking(move || reaper.terminate_app_created(None)).await {
            Ok(report) if !report.terminated.is_empty() => {
                info!("Terminated leftover hosts {:?}", report.terminated_pids());
            }
            Ok(_) => {}
            Err(e) => warn!("Shutdown reaping failed: {}", e),
        }
    }

    /// Shared services, for callers that need the registry or ledger.
    pub fn services(&self) -> &HostServices {
        &self.services
    }

    /// Get the current configuration.
    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }
}

impl Drop for Converter {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

fn spawn_failure(request: &ConversionRequest, e: ConversionError) -> ConversionResult {
    error!("Cannot start host worker: {}", e);
    ConversionResult::failed(
        request.input_path.clone(),
        e.to_failure(request.host_kind()),
        Duration::ZERO,
    )
}

/// Builder for creating a Converter with custom settings.
pub struct ConverterBuilder {
    config: ConverterConfig,
}

impl ConverterBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ConverterConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: ConverterConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the path to soffice binary.
    pub fn soffice_path(mut self, path: PathBuf) -> Self {
        self.config.host.soffice_path = Some(path);
        self
    }

    /// Recycle a session after this many conversions.
    pub fn max_uses_per_session(mut self, max: u32) -> Self {
        self.config.pool.max_uses_per_session = max;
        self
    }

    /// Recycle a session idle for longer than this.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.idle_timeout = timeout;
        self
    }

    /// Set the conversion timeout.
    pub fn conversion_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.conversion_timeout = timeout;
        self
    }

    /// Set the temporary directory.
    pub fn temp_dir(mut self, dir: PathBuf) -> Self {
        self.config.pool.temp_dir = Some(dir);
        self
    }

    /// Limit concurrent single-use conversions.
    pub fn max_parallel(mut self, max: usize) -> Self {
        self.config.max_parallel = Some(max);
        self
    }

    /// Sweep for orphaned hosts on this interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.reaper.sweep_interval = Some(interval);
        self
    }

    /// Build the converter.
    pub async fn build(self) -> Result<Converter> {
        Converter::new(self.config).await
    }
}

impl Default for ConverterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
