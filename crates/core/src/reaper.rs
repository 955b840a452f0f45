//! Process health checks and orphan reaping.
//!
//! Termination is always gated by the ownership registry and always tries a
//! graceful close before a forced kill. When in doubt, a process is left
//! alone.

use crate::config::ReaperConfig;
use crate::host::HostKind;
use crate::process::{ProcessInfo, ProcessTable};
use crate::registry::OwnershipRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Record of one termination attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationRecord {
    pub pid: u32,
    pub kind: HostKind,
    pub memory_bytes: u64,
    /// Safety checks that passed before the attempt.
    pub checks: Vec<&'static str>,
    /// The process exited within the graceful window.
    pub graceful: bool,
    /// The process had to be killed.
    pub forced: bool,
    /// The process is gone.
    pub exited: bool,
}

/// Summary of a reaping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Processes looked at.
    pub examined: usize,
    /// Processes left alone by a safety check.
    pub skipped: usize,
    pub terminated: Vec<TerminationRecord>,
}

impl ReapReport {
    fn merge(&mut self, other: ReapReport) {
        self.examined += other.examined;
        self.skipped += other.skipped;
        self.terminated.extend(other.terminated);
    }

    pub fn terminated_pids(&self) -> Vec<u32> {
        self.terminated.iter().map(|r| r.pid).collect()
    }
}

/// Finds and terminates host processes this application is responsible for.
pub struct ProcessReaper {
    table: Arc<dyn ProcessTable>,
    registry: Arc<OwnershipRegistry>,
    config: ReaperConfig,
}

impl std::fmt::Debug for ProcessReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessReaper")
            .field("config", &self.config)
            .finish()
    }
}

impl ProcessReaper {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        registry: Arc<OwnershipRegistry>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            table,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Live OS processes for a host kind.
    pub fn enumerate(&self, kind: HostKind) -> Vec<ProcessInfo> {
        let mut found = BTreeMap::new();
        for name in self.registry.process_names(kind) {
            match self.table.list_by_name(name) {
                Ok(processes) => {
                    for process in processes {
                        found.insert(process.pid, process);
                    }
                }
                Err(e) => warn!("Failed to enumerate '{}' processes: {}", name, e),
            }
        }
        found.into_values().collect()
    }

    /// Whether `pid` has lost its parent: no parent at all, a parent that is
    /// this application, or a parent that no longer exists. Unknown or
    /// vanished processes are not orphans, and neither is a process held by
    /// a live session.
    pub fn is_orphaned(&self, pid: u32) -> bool {
        if self.registry.is_in_use(pid) {
            return false;
        }
        let Some(process) = self.table.find(pid) else {
            return false;
        };
        match process.parent_pid {
            None => true,
            Some(parent) if parent == self.table.current_pid() => true,
            Some(parent) => !self.table.is_alive(parent),
        }
    }

    /// Whether the process answers requests. Unknown processes are not.
    pub fn is_responding(&self, pid: u32) -> bool {
        self.table.find(pid).map(|p| p.responding).unwrap_or(false)
    }

    /// Terminate orphaned, app-created processes of one kind.
    pub fn reap_orphans(&self, kind: HostKind) -> ReapReport {
        let mut report = ReapReport::default();
        for process in self.enumerate(kind) {
            report.examined += 1;
            if !self.is_orphaned(process.pid) {
                report.skipped += 1;
                continue;
            }
            match self.terminate(kind, process.pid, vec!["orphaned"]) {
                Some(record) => report.terminated.push(record),
                None => report.skipped += 1,
            }
        }
        if !report.terminated.is_empty() {
            info!(
                "Reaped {} orphaned {} process(es)",
                report.terminated.len(),
                kind
            );
        }
        report
    }

    /// Terminate orphans of every kind.
    pub fn reap_all_orphans(&self) -> ReapReport {
        let mut report = ReapReport::default();
        for kind in HostKind::ALL {
            report.merge(self.reap_orphans(kind));
        }
        report
    }

    /// Terminate every app-created process, of one kind or of all kinds,
    /// whether orphaned or not. Used on crash recovery and shutdown.
    pub fn terminate_app_created(&self, kind: Option<HostKind>) -> ReapReport {
        let mut report = ReapReport::default();
        for entry in self.registry.app_created(kind) {
            report.examined += 1;
            match self.terminate(entry.kind, entry.pid, vec!["registered"]) {
                Some(record) => report.terminated.push(record),
                None => {
                    // Already gone; nothing left to own.
                    self.registry.unregister_app_created(entry.kind, entry.pid);
                    report.skipped += 1;
                }
            }
        }
        report
    }

    /// Make sure an app-created process that was asked to quit is gone.
    pub fn ensure_exited(&self, kind: HostKind, pid: u32) -> Option<TerminationRecord> {
        if self.wait_for_exit(pid, self.config.graceful_timeout) {
            return None;
        }
        self.terminate(kind, pid, vec!["quit issued"])
    }

    /// Terminate one process after re-validating ownership. Returns None when
    /// a safety check refused the termination.
    pub fn terminate(
        &self,
        kind: HostKind,
        pid: u32,
        mut checks: Vec<&'static str>,
    ) -> Option<TerminationRecord> {
        if self.registry.is_user_owned(pid) {
            debug!("Not terminating pid {}: user-owned", pid);
            return None;
        }
        checks.push("not user-owned");
        if !self.registry.is_definitely_app_created(kind, pid) {
            debug!("Not terminating pid {}: not a live app-created {}", pid, kind);
            return None;
        }
        checks.push("app-created");
        checks.push("alive");

        let memory_bytes = self.table.find(pid).map(|p| p.memory_bytes).unwrap_or(0);
        info!(
            pid,
            %kind,
            memory_bytes,
            checks = ?checks,
            "Terminating host process"
        );

        if !self.table.request_close(pid) {
            self.table.send_close_message(pid);
        }
        let graceful = self.wait_for_exit(pid, self.config.graceful_timeout);

        let mut forced = false;
        if !graceful {
            warn!(
                pid,
                %kind,
                "Host process ignored close request for {:?}, killing",
                self.config.graceful_timeout
            );
            forced = self.table.kill(pid);
        }
        let exited = graceful || self.wait_for_exit(pid, self.config.poll_interval * 10);

        if exited {
            self.registry.unregister_app_created(kind, pid);
        } else {
            warn!(pid, %kind, "Host process survived termination");
        }

        Some(TerminationRecord {
            pid,
            kind,
            memory_bytes,
            checks,
            graceful,
            forced,
            exited,
        })
    }

    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.table.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Sweep for orphans of every kind on a fixed interval.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reaper = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || reaper.reap_all_orphans()).await {
                    Ok(report) if !report.terminated.is_empty() => {
                        info!("Orphan sweep terminated {:?}", report.terminated_pids());
                    }
                    Ok(_) => debug!("Orphan sweep found nothing"),
                    Err(e) => warn!("Orphan sweep task failed: {}", e),
                }
            }
        })
    }
}
