//! Dedicated host threads.
//!
//! A [`HostWorker`] owns one OS thread that enters the host apartment and
//! owns one [`ConverterPool`]. Work reaches it only through its channel, so
//! every call against a session comes from the thread that created it.
//! Callers await replies without blocking the runtime.
//!
//! A worker whose call timed out is still blocked in that call. It must not
//! be given more work or joined; [`HostWorker::detach`] lets it finish on
//! its own.

use crate::apartment::ApartmentGuard;
use crate::config::{ConversionRequest, ConversionResult, PoolConfig};
use crate::error::{ConversionError, Result};
use crate::host::{HostKind, HostOptions};
use crate::pool::{ConverterPool, HostServices, PoolStats};
use async_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(0);

enum WorkItem {
    Convert {
        request: ConversionRequest,
        reply: oneshot::Sender<ConversionResult>,
    },
    WarmUp {
        kind: HostKind,
        reply: oneshot::Sender<Result<()>>,
    },
    FinishBatch {
        reply: oneshot::Sender<PoolStats>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
}

/// Handle to one host thread.
pub struct HostWorker {
    id: usize,
    jobs: Sender<WorkItem>,
    thread: Option<JoinHandle<()>>,
    services: HostServices,
    conversion_timeout: Duration,
    hung: Arc<AtomicBool>,
}

impl std::fmt::Debug for HostWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostWorker")
            .field("id", &self.id)
            .field("queued", &self.jobs.len())
            .field("conversion_timeout", &self.conversion_timeout)
            .field("hung", &self.is_hung())
            .finish()
    }
}

impl HostWorker {
    /// Start a host thread with its own pool.
    pub fn spawn(
        services: HostServices,
        config: PoolConfig,
        host_options: HostOptions,
    ) -> Result<Self> {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst);
        let (jobs, rx) = async_channel::unbounded();
        let conversion_timeout = config.conversion_timeout;
        let pool_services = services.clone();
        let hung = Arc::new(AtomicBool::new(false));
        let hang_signal = Arc::clone(&hung);

        let thread = std::thread::Builder::new()
            .name(format!("office-host-{}", id))
            .spawn(move || run(id, pool_services, config, host_options, hang_signal, rx))
            .map_err(ConversionError::WorkerSpawn)?;

        debug!("Spawned host worker {}", id);
        Ok(Self {
            id,
            jobs,
            thread: Some(thread),
            services,
            conversion_timeout,
            hung,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether a call on this worker timed out. A hung worker's thread may
    /// still be blocked in the host.
    pub fn is_hung(&self) -> bool {
        self.hung.load(Ordering::SeqCst)
    }

    /// Convert one file on this worker's thread.
    ///
    /// If no reply arrives within the conversion timeout the host is treated
    /// as hung: the worker is marked hung, the failure is routed to recovery,
    /// which terminates the app-created hosts, and a timeout result is
    /// returned. The in-flight call is not aborted.
    pub async fn convert(&self, request: ConversionRequest) -> ConversionResult {
        let start = Instant::now();
        let input_path = request.input_path.clone();
        let kind = request.host_kind();

        let (reply, rx) = oneshot::channel();
        if let Err(e) = self.jobs.send(WorkItem::Convert { request, reply }).await {
            let err = ConversionError::from(e);
            return ConversionResult::failed(input_path, err.to_failure(kind), start.elapsed());
        }

        match tokio::time::timeout(self.conversion_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let err = ConversionError::from(e);
                ConversionResult::failed(input_path, err.to_failure(kind), start.elapsed())
            }
            Err(_) => {
                self.hung.store(true, Ordering::SeqCst);
                let err = ConversionError::Timeout {
                    path: input_path.clone(),
                    timeout: self.conversion_timeout,
                };
                warn!("Worker {}: {}", self.id, err);

                let failure = err.to_failure(kind);
                let recovery = Arc::clone(&self.services.recovery);
                let routed = failure.clone();
                let context = format!("timeout converting {}", input_path.display());
                if let Err(e) =
                    tokio::task::spawn_blocking(move || recovery.handle(&routed, &context)).await
                {
                    warn!("Hang recovery task failed: {}", e);
                }
                ConversionResult::failed(input_path, failure, start.elapsed())
            }
        }
    }

    /// Create the session for `kind` ahead of the first request.
    pub async fn warm_up(&self, kind: HostKind) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.jobs.send(WorkItem::WarmUp { kind, reply }).await?;
        rx.await?
    }

    /// Retire every session on this worker.
    pub async fn finish_batch(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.jobs.send(WorkItem::FinishBatch { reply }).await?;
        Ok(rx.await?)
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.jobs.send(WorkItem::Stats { reply }).await?;
        Ok(rx.await?)
    }

    /// Stop accepting work without waiting for the thread. It finishes the
    /// call it is blocked in, retires its sessions and exits on its own.
    pub fn detach(mut self) {
        self.jobs.close();
        if self.thread.take().is_some() {
            debug!("Detached host worker {}", self.id);
        }
    }

    /// Stop accepting work, let the thread retire its sessions, and wait for
    /// it to exit.
    pub async fn shutdown(mut self) {
        self.jobs.close();
        if let Some(thread) = self.thread.take() {
            let id = self.id;
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => debug!("Host worker {} stopped", id),
                Ok(Err(_)) => warn!("Host worker {} panicked", id),
                Err(e) => warn!("Failed to join host worker {}: {}", id, e),
            }
        }
    }
}

impl Drop for HostWorker {
    fn drop(&mut self) {
        // The thread drains what is queued, then retires its sessions.
        self.jobs.close();
    }
}

fn run(
    id: usize,
    services: HostServices,
    config: PoolConfig,
    host_options: HostOptions,
    hang_signal: Arc<AtomicBool>,
    jobs: Receiver<WorkItem>,
) {
    let _apartment = ApartmentGuard::enter();
    let mut pool =
        ConverterPool::new(services, config, host_options).with_hang_signal(hang_signal);

    while let Ok(item) = jobs.recv_blocking() {
        match item {
            WorkItem::Convert { request, reply } => {
                if reply.is_closed() {
                    debug!(
                        "Worker {}: skipping cancelled request for {:?}",
                        id, request.input_path
                    );
                    continue;
                }
                let result = pool.convert(&request);
                let _ = reply.send(result);
            }
            WorkItem::WarmUp { kind, reply } => {
                let _ = reply.send(pool.warm_up(kind));
            }
            WorkItem::FinishBatch { reply } => {
                pool.finish_batch();
                let _ = reply.send(pool.stats());
            }
            WorkItem::Stats { reply } => {
                let _ = reply.send(pool.stats());
            }
        }
    }

    pool.shutdown();
    info!("Host worker {} exiting: {:?}", id, pool.stats());
}
