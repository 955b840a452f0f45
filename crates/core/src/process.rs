//! OS process enumeration and termination primitives.
//!
//! [`ProcessTable`] is the seam between the ownership/reaper logic and the
//! operating system, so that logic can be exercised against a scripted table
//! in tests. [`SystemProcessTable`] is the real implementation.

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessStatus, Signal, System};
use tracing::debug;

/// What the reaper needs to know about one OS process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub memory_bytes: u64,
    /// False when the process is stopped, a zombie, or otherwise not
    /// servicing requests.
    pub responding: bool,
}

/// Process-level primitives the core relies on.
pub trait ProcessTable: Send + Sync {
    /// Live processes whose executable name matches `name`, case-insensitively.
    fn list_by_name(&self, name: &str) -> std::io::Result<Vec<ProcessInfo>>;

    /// Look up a live process.
    fn find(&self, pid: u32) -> Option<ProcessInfo>;

    /// Whether `pid` is still running.
    fn is_alive(&self, pid: u32) -> bool {
        self.find(pid).is_some()
    }

    /// Pid of this application.
    fn current_pid(&self) -> u32;

    /// Ask the process to close its main window. Returns whether the request
    /// was delivered.
    fn request_close(&self, pid: u32) -> bool;

    /// Fallback close message when the main-window request was not delivered.
    fn send_close_message(&self, pid: u32) -> bool;

    /// Terminate the process unconditionally.
    fn kill(&self, pid: u32) -> bool;
}

/// [`ProcessTable`] backed by the live OS process list.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn info(process: &sysinfo::Process) -> ProcessInfo {
        let responding = !matches!(
            process.status(),
            ProcessStatus::Zombie | ProcessStatus::Stop | ProcessStatus::Dead
        );
        ProcessInfo {
            pid: process.pid().as_u32(),
            parent_pid: process.parent().map(|p| p.as_u32()),
            name: process.name().to_string(),
            memory_bytes: process.memory(),
            responding,
        }
    }

    fn signal(&self, pid: u32, signal: Signal) -> bool {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return false;
        }
        match system.process(pid) {
            Some(process) => process.kill_with(signal).unwrap_or(false),
            None => false,
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemProcessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProcessTable").finish()
    }
}

impl ProcessTable for SystemProcessTable {
    fn list_by_name(&self, name: &str) -> std::io::Result<Vec<ProcessInfo>> {
        let mut system = self.system.lock();
        system.refresh_processes();
        Ok(system
            .processes()
            .values()
            .filter(|p| p.name().eq_ignore_ascii_case(name))
            .map(Self::info)
            .collect())
    }

    fn find(&self, pid: u32) -> Option<ProcessInfo> {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return None;
        }
        system
            .process(pid)
            .filter(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .map(Self::info)
    }

    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn request_close(&self, pid: u32) -> bool {
        let delivered = self.signal(pid, Signal::Term);
        debug!("Close request to pid {}: delivered={}", pid, delivered);
        delivered
    }

    fn send_close_message(&self, pid: u32) -> bool {
        let delivered = self.signal(pid, Signal::Interrupt);
        debug!("Close message to pid {}: delivered={}", pid, delivered);
        delivered
    }

    fn kill(&self, pid: u32) -> bool {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return false;
        }
        system.process(pid).map(|p| p.kill()).unwrap_or(false)
    }
}
