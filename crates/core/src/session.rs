//! One live automation host and its bookkeeping.

use crate::config::PoolConfig;
use crate::error::{ConversionError, Result};
use crate::host::{AutomationHost, HostKind, HostObject};
use serde::Serialize;
use std::fmt;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Lifecycle of the session slot for one host kind.
///
/// `Absent → Creating → Ready → (Converting → Ready)* → Retiring → Absent`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    #[default]
    Absent,
    Creating,
    Ready,
    Converting,
    Retiring,
}

/// Why a session was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RetireReason {
    /// Reached `max_uses_per_session`.
    UseLimit,
    /// Idle longer than `idle_timeout`.
    IdleTimeout,
    /// Failed the liveness probe on acquisition.
    Unresponsive,
    /// A conversion failed in a way that taints the host.
    Unhealthy,
    /// Single-use request finished.
    SingleUse,
    /// `finish_batch` was called.
    BatchFinished,
    /// The pool is going away.
    Shutdown,
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetireReason::UseLimit => "use limit reached",
            RetireReason::IdleTimeout => "idle timeout",
            RetireReason::Unresponsive => "unresponsive",
            RetireReason::Unhealthy => "unhealthy",
            RetireReason::SingleUse => "single use",
            RetireReason::BatchFinished => "batch finished",
            RetireReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// A live host owned by exactly one pool thread.
pub struct HostSession {
    pub(crate) host: Box<dyn AutomationHost>,
    application: HostObject,
    kind: HostKind,
    pid: Option<u32>,
    /// False when the host turned out to be a process the user already had
    /// running; such a session is never quit or terminated.
    owned: bool,
    use_count: u32,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
    owner_thread: ThreadId,
    generation: u64,
}

impl fmt::Debug for HostSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSession")
            .field("kind", &self.kind)
            .field("pid", &self.pid)
            .field("owned", &self.owned)
            .field("use_count", &self.use_count)
            .field("healthy", &self.healthy)
            .field("generation", &self.generation)
            .finish()
    }
}

impl HostSession {
    /// Wrap a configured host. The calling thread becomes the owner.
    pub fn new(
        host: Box<dyn AutomationHost>,
        application: HostObject,
        owned: bool,
        generation: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            kind: host.kind(),
            pid: host.process_id(),
            host,
            application,
            owned,
            use_count: 0,
            created_at: now,
            last_used: now,
            healthy: true,
            owner_thread: thread::current().id(),
            generation,
        }
    }

    pub fn kind(&self) -> HostKind {
        self.kind
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn application(&self) -> HostObject {
        self.application
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.owner_thread
    }

    /// Increases by one every time the pool creates a session for this kind.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub(crate) fn record_use(&mut self) {
        self.use_count += 1;
        self.last_used = Instant::now();
    }

    /// Fail with [`ConversionError::ThreadAffinity`] off the owner thread.
    pub fn check_affinity(&self) -> Result<()> {
        if thread::current().id() == self.owner_thread {
            Ok(())
        } else {
            Err(ConversionError::ThreadAffinity { kind: self.kind })
        }
    }

    /// Recycle policy evaluated before reuse; the first threshold hit wins.
    /// The liveness probe runs last since it talks to the host.
    pub fn retirement_reason(&mut self, config: &PoolConfig) -> Option<RetireReason> {
        if !self.healthy {
            return Some(RetireReason::Unhealthy);
        }
        if self.use_count >= config.max_uses_per_session {
            return Some(RetireReason::UseLimit);
        }
        if self.idle_for() > config.idle_timeout {
            return Some(RetireReason::IdleTimeout);
        }
        if config.health_check_on_acquire && !self.host.is_responsive() {
            return Some(RetireReason::Unresponsive);
        }
        None
    }
}
