//! Ownership registry for automation host processes.
//!
//! At startup every host process already running is recorded as
//! [`ProcessOrigin::UserOwned`]. Processes this application starts are
//! recorded as [`ProcessOrigin::AppCreated`]. Only the latter may ever be
//! terminated, and only after [`OwnershipRegistry::is_definitely_app_created`]
//! says so.
//!
//! App-created processes currently held by a live session are additionally
//! marked in use. Orphan reaping never touches them.

use crate::host::HostKind;
use crate::process::ProcessTable;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Who started a host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProcessOrigin {
    UserOwned,
    AppCreated,
}

/// One registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessOwnership {
    pub pid: u32,
    pub kind: HostKind,
    pub origin: ProcessOrigin,
}

#[derive(Debug, Default)]
struct OwnershipSets {
    user_owned: HashSet<(HostKind, u32)>,
    app_created: HashSet<(HostKind, u32)>,
    in_use: HashSet<u32>,
}

impl OwnershipSets {
    fn user_owns(&self, pid: u32) -> bool {
        self.user_owned.iter().any(|(_, p)| *p == pid)
    }

    fn app_created(&self, pid: u32) -> bool {
        self.app_created.iter().any(|(_, p)| *p == pid)
    }
}

/// Shared, read-mostly record of which host processes belong to whom.
pub struct OwnershipRegistry {
    table: Arc<dyn ProcessTable>,
    process_names: BTreeMap<HostKind, Vec<String>>,
    sets: RwLock<OwnershipSets>,
}

impl std::fmt::Debug for OwnershipRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sets = self.sets.read();
        f.debug_struct("OwnershipRegistry")
            .field("user_owned", &sets.user_owned.len())
            .field("app_created", &sets.app_created.len())
            .field("in_use", &sets.in_use.len())
            .finish()
    }
}

impl OwnershipRegistry {
    /// Create the registry and snapshot the host processes already running.
    pub fn new(
        table: Arc<dyn ProcessTable>,
        process_names: BTreeMap<HostKind, Vec<String>>,
    ) -> Self {
        let registry = Self {
            table,
            process_names,
            sets: RwLock::new(OwnershipSets::default()),
        };
        registry.record_pre_existing();
        registry
    }

    /// Mark every running host process as user-owned. Enumeration failures
    /// are logged and treated as "nothing found". Never touches app-created
    /// entries. Returns how many new entries were recorded.
    pub fn record_pre_existing(&self) -> usize {
        let mut found = Vec::new();
        for (kind, names) in &self.process_names {
            for name in names {
                match self.table.list_by_name(name) {
                    Ok(processes) => {
                        found.extend(processes.into_iter().map(|p| (*kind, p.pid)));
                    }
                    Err(e) => {
                        warn!("Failed to enumerate '{}' processes: {}", name, e);
                    }
                }
            }
        }

        let mut sets = self.sets.write();
        let mut recorded = 0;
        for (kind, pid) in found {
            if sets.app_created(pid) {
                continue;
            }
            if sets.user_owned.insert((kind, pid)) {
                recorded += 1;
            }
        }
        if recorded > 0 {
            info!("Recorded {} user-owned host process(es)", recorded);
        }
        recorded
    }

    /// Record a process this application started. Refused when the pid is
    /// already known as user-owned.
    pub fn register_app_created(&self, kind: HostKind, pid: u32) -> bool {
        let mut sets = self.sets.write();
        if sets.user_owns(pid) {
            warn!(
                "Refusing to register pid {} as app-created {}: it is user-owned",
                pid, kind
            );
            return false;
        }
        let inserted = sets.app_created.insert((kind, pid));
        if inserted {
            debug!("Registered app-created {} pid {}", kind, pid);
        }
        inserted
    }

    /// Forget an app-created process after its handle was disposed.
    pub fn unregister_app_created(&self, kind: HostKind, pid: u32) -> bool {
        let removed = {
            let mut sets = self.sets.write();
            let removed = sets.app_created.remove(&(kind, pid));
            if !sets.app_created(pid) {
                sets.in_use.remove(&pid);
            }
            removed
        };
        if removed {
            debug!("Unregistered app-created {} pid {}", kind, pid);
        }
        removed
    }

    /// True only if this application started `pid`, the user did not own it,
    /// and it is still running. The sole gate before any termination.
    pub fn is_definitely_app_created(&self, kind: HostKind, pid: u32) -> bool {
        {
            let sets = self.sets.read();
            if !sets.app_created.contains(&(kind, pid)) || sets.user_owns(pid) {
                return false;
            }
        }
        self.table.is_alive(pid)
    }

    /// Mark an app-created process as held by a live session. Refused for
    /// pids that are not app-created.
    pub fn mark_in_use(&self, pid: u32) -> bool {
        let mut sets = self.sets.write();
        if !sets.app_created(pid) {
            return false;
        }
        sets.in_use.insert(pid)
    }

    /// The session holding `pid` has been retired.
    pub fn clear_in_use(&self, pid: u32) -> bool {
        self.sets.write().in_use.remove(&pid)
    }

    pub fn is_in_use(&self, pid: u32) -> bool {
        self.sets.read().in_use.contains(&pid)
    }

    pub fn is_user_owned(&self, pid: u32) -> bool {
        self.sets.read().user_owns(pid)
    }

    pub fn origin_of(&self, kind: HostKind, pid: u32) -> Option<ProcessOrigin> {
        let sets = self.sets.read();
        if sets.user_owned.contains(&(kind, pid)) {
            Some(ProcessOrigin::UserOwned)
        } else if sets.app_created.contains(&(kind, pid)) {
            Some(ProcessOrigin::AppCreated)
        } else {
            None
        }
    }

    /// App-created entries, optionally restricted to one kind.
    pub fn app_created(&self, kind: Option<HostKind>) -> Vec<ProcessOwnership> {
        let sets = self.sets.read();
        let mut entries: Vec<_> = sets
            .app_created
            .iter()
            .filter(|(k, _)| kind.map_or(true, |wanted| *k == wanted))
            .map(|(kind, pid)| ProcessOwnership {
                pid: *pid,
                kind: *kind,
                origin: ProcessOrigin::AppCreated,
            })
            .collect();
        entries.sort_by_key(|e| (e.kind, e.pid));
        entries
    }

    /// Every entry in the registry.
    pub fn snapshot(&self) -> Vec<ProcessOwnership> {
        let sets = self.sets.read();
        let user = sets.user_owned.iter().map(|(kind, pid)| ProcessOwnership {
            pid: *pid,
            kind: *kind,
            origin: ProcessOrigin::UserOwned,
        });
        let app = sets.app_created.iter().map(|(kind, pid)| ProcessOwnership {
            pid: *pid,
            kind: *kind,
            origin: ProcessOrigin::AppCreated,
        });
        let mut entries: Vec<_> = user.chain(app).collect();
        entries.sort_by_key(|e| (e.kind, e.pid));
        entries
    }

    /// Executable names watched for `kind`.
    pub fn process_names(&self, kind: HostKind) -> &[String] {
        self.process_names
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn process_table(&self) -> &Arc<dyn ProcessTable> {
        &self.table
    }
}
