//! Release tracking for automation host object references.
//!
//! Every reference handed out by the host must be released exactly once, in
//! the reverse order it was acquired: a document goes before the collection
//! that owns it, and the collection before the application. [`ResourceScope`]
//! enforces this for one conversion; [`ResourceLedger`] keeps process-wide
//! created/released counters so leaks show up in statistics.

use crate::error::HostError;
use crate::host::{AutomationHost, HostKind, HostObject, ObjectType, OpenOptions};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// One tracked acquisition.
#[derive(Debug, Clone)]
pub struct AutomationObjectRecord {
    pub object: HostObject,
    /// Free text for diagnostics.
    pub context: String,
    pub created_at: Instant,
}

impl AutomationObjectRecord {
    pub fn object_type(&self) -> ObjectType {
        self.object.object_type()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TypeCounts {
    created: u64,
    released: u64,
}

/// Per-object-type counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub object_type: ObjectType,
    pub created: u64,
    pub released: u64,
}

/// Snapshot of the ledger counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub created: u64,
    pub released: u64,
    pub outstanding: u64,
    pub release_failures: u64,
    pub reclaim_passes: u64,
    pub by_type: Vec<TypeStats>,
}

/// Result of a reclamation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    /// References acquired but not yet released at the time of the pass.
    pub outstanding: u64,
}

/// Process-wide counting registry of host object acquisitions and releases.
///
/// Created once at startup and shared by reference with every pool.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    created: AtomicU64,
    released: AtomicU64,
    release_failures: AtomicU64,
    reclaim_passes: AtomicU64,
    by_type: Mutex<BTreeMap<ObjectType, TypeCounts>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acquisition and hand the object back.
    pub fn track(&self, object: HostObject, context: &str) -> HostObject {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.by_type
            .lock()
            .entry(object.object_type())
            .or_default()
            .created += 1;
        debug!(
            "Tracked {} #{} ({})",
            object.object_type(),
            object.id(),
            context
        );
        object
    }

    /// Release one reference through the host. Never fails: host errors are
    /// logged and counted.
    pub fn release(&self, host: &mut dyn AutomationHost, object: HostObject, context: &str) {
        let result = host.release(object);
        self.released.fetch_add(1, Ordering::SeqCst);
        self.by_type
            .lock()
            .entry(object.object_type())
            .or_default()
            .released += 1;

        if let Err(e) = result {
            self.release_failures.fetch_add(1, Ordering::SeqCst);
            warn!(
                "Failed to release {} #{} ({}): {}",
                object.object_type(),
                object.id(),
                context,
                e
            );
        }
    }

    /// Open a scope whose tracked objects are released when it ends.
    pub fn scope<'h>(
        &'h self,
        host: &'h mut dyn AutomationHost,
        context: impl Into<String>,
    ) -> ResourceScope<'h> {
        ResourceScope {
            ledger: self,
            host,
            context: context.into(),
            records: Vec::new(),
        }
    }

    /// Last-resort leak mitigation, run after a batch or a recovery.
    ///
    /// Host references are released deterministically by scopes, so this
    /// pass only surfaces what is still outstanding.
    pub fn force_reclaim(&self) -> ReclaimReport {
        self.reclaim_passes.fetch_add(1, Ordering::SeqCst);
        let outstanding = self.outstanding();
        if outstanding > 0 {
            warn!(
                "Reclaim pass found {} unreleased host object reference(s)",
                outstanding
            );
        } else {
            debug!("Reclaim pass: no outstanding host object references");
        }
        ReclaimReport { outstanding }
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> u64 {
        self.created().saturating_sub(self.released())
    }

    pub fn stats(&self) -> LedgerStats {
        let by_type = self
            .by_type
            .lock()
            .iter()
            .map(|(object_type, counts)| TypeStats {
                object_type: *object_type,
                created: counts.created,
                released: counts.released,
            })
            .collect();

        LedgerStats {
            created: self.created(),
            released: self.released(),
            outstanding: self.outstanding(),
            release_failures: self.release_failures.load(Ordering::SeqCst),
            reclaim_passes: self.reclaim_passes.load(Ordering::SeqCst),
            by_type,
        }
    }
}

/// A bounded acquisition region.
///
/// Every object tracked through the scope is released, newest first, when the
/// scope is dropped: on success, on an early `?` return, and during a panic
/// unwind. A failing release does not stop the remaining ones.
pub struct ResourceScope<'h> {
    ledger: &'h ResourceLedger,
    host: &'h mut dyn AutomationHost,
    context: String,
    records: Vec<AutomationObjectRecord>,
}

impl<'h> ResourceScope<'h> {
    /// The host this scope releases against.
    pub fn host(&mut self) -> &mut dyn AutomationHost {
        &mut *self.host
    }

    /// Track an object acquired inside this scope.
    pub fn track(&mut self, object: HostObject, context: &str) -> HostObject {
        let context = format!("{}: {}", self.context, context);
        self.ledger.track(object, &context);
        self.records.push(AutomationObjectRecord {
            object,
            context,
            created_at: Instant::now(),
        });
        object
    }

    /// Objects tracked so far, oldest first.
    pub fn tracked(&self) -> &[AutomationObjectRecord] {
        &self.records
    }

    /// Open `path` inside the host's file collection, tracking both the
    /// collection and the opened file.
    pub fn open(&mut self, path: &Path, options: &OpenOptions) -> Result<HostObject, HostError> {
        let collection = self.host.collection()?;
        let collection = self.track(collection, "collection");
        let document = self.host.open(collection, path, options)?;
        Ok(self.track(document, &path.display().to_string()))
    }

    /// Open a word-processor document (Documents → Document).
    pub fn open_document(
        &mut self,
        path: &Path,
        options: &OpenOptions,
    ) -> Result<HostObject, HostError> {
        self.expect_kind(HostKind::Word, "Documents.Open")?;
        self.open(path, options)
    }

    /// Open a spreadsheet workbook (Workbooks → Workbook).
    pub fn open_workbook(
        &mut self,
        path: &Path,
        options: &OpenOptions,
    ) -> Result<HostObject, HostError> {
        self.expect_kind(HostKind::Excel, "Workbooks.Open")?;
        self.open(path, options)
    }

    fn expect_kind(&self, kind: HostKind, operation: &'static str) -> Result<(), HostError> {
        let actual = self.host.kind();
        if actual == kind {
            Ok(())
        } else {
            Err(HostError::Operation {
                kind: actual,
                operation,
                message: format!("{} cannot be used on a {} host", operation, actual),
            })
        }
    }

    /// Release everything tracked so far, newest first. Returns how many
    /// objects were released.
    pub fn release_all(&mut self) -> usize {
        let count = self.records.len();
        while let Some(record) = self.records.pop() {
            self.ledger
                .release(&mut *self.host, record.object, &record.context);
        }
        count
    }
}

impl Drop for ResourceScope<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}
