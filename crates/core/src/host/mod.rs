//! Typed adapter over the office suite's out-of-process object model.
//!
//! Higher layers never talk to the automation host directly. They go through
//! [`AutomationHost`], which exposes only the operations conversion needs:
//! configure, open, export, close, release and quit. A host value is bound to
//! the thread that created it, so the trait deliberately carries no `Send`
//! bound; [`HostFactory`] is the shareable part.

pub mod soffice;

use crate::error::HostError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub use soffice::{SofficeFactory, SofficeHost};

/// The two automation host applications driven by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HostKind {
    /// Word-processor host (documents).
    Word,
    /// Spreadsheet host (workbooks).
    Excel,
}

impl HostKind {
    /// Every host kind, in a stable order.
    pub const ALL: [HostKind; 2] = [HostKind::Word, HostKind::Excel];

    /// Pick the host kind able to open `path`, based on its extension.
    pub fn for_path(path: &Path) -> Option<HostKind> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "doc" | "docx" | "docm" | "dot" | "dotx" | "rtf" | "odt" => Some(HostKind::Word),
            "xls" | "xlsx" | "xlsm" | "xlsb" | "csv" | "ods" => Some(HostKind::Excel),
            _ => None,
        }
    }

    /// Object type of the application-level collection holding open files.
    pub fn collection_type(self) -> ObjectType {
        match self {
            HostKind::Word => ObjectType::Documents,
            HostKind::Excel => ObjectType::Workbooks,
        }
    }

    /// Object type of a single open file.
    pub fn document_type(self) -> ObjectType {
        match self {
            HostKind::Word => ObjectType::Document,
            HostKind::Excel => ObjectType::Workbook,
        }
    }

    /// Executable names the host runs under, used to snapshot user-owned
    /// instances at startup.
    pub fn default_process_names(self) -> &'static [&'static str] {
        match self {
            HostKind::Word => &["WINWORD.EXE", "soffice.bin", "soffice"],
            HostKind::Excel => &["EXCEL.EXE", "soffice.bin", "soffice"],
        }
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKind::Word => f.write_str("WordHost"),
            HostKind::Excel => f.write_str("ExcelHost"),
        }
    }
}

/// Type tag of an object handed out by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectType {
    Application,
    Documents,
    Document,
    Workbooks,
    Workbook,
}

impl ObjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Application => "Application",
            ObjectType::Documents => "Documents",
            ObjectType::Document => "Document",
            ObjectType::Workbooks => "Workbooks",
            ObjectType::Workbook => "Workbook",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to an object living inside the host process.
///
/// Each reference must be released exactly once through
/// [`AutomationHost::release`]; [`crate::ledger::ResourceScope`] takes care of
/// that for everything acquired during a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostObject {
    id: u64,
    object_type: ObjectType,
}

impl HostObject {
    pub fn new(id: u64, object_type: ObjectType) -> Self {
        Self { id, object_type }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }
}

/// How an input file is opened for conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Open without taking a write lock.
    pub read_only: bool,
    /// Allow the host to run its repair dialog on damaged files.
    pub open_and_repair: bool,
    /// Add the file to the host's recent-files list.
    pub add_to_recent: bool,
    /// Let the host prompt for format conversion confirmation.
    pub confirm_conversions: bool,
}

impl OpenOptions {
    /// Read-only, no dialogs, no side effects on the user's profile.
    pub fn for_conversion() -> Self {
        Self {
            read_only: true,
            open_and_repair: false,
            add_to_recent: false,
            confirm_conversions: false,
        }
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::for_conversion()
    }
}

/// Application-level switches applied to a fresh host before any file is
/// opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOptions {
    pub visible: bool,
    pub display_alerts: bool,
    pub screen_updating: bool,
    pub auto_save: bool,
    pub auto_recover: bool,
}

impl HostOptions {
    /// Everything interactive or persistent switched off.
    pub fn automation() -> Self {
        Self {
            visible: false,
            display_alerts: false,
            screen_updating: false,
            auto_save: false,
            auto_recover: false,
        }
    }
}

impl Default for HostOptions {
    fn default() -> Self {
        Self::automation()
    }
}

/// A live automation host application.
///
/// Implementations are bound to the thread that created them. Every method
/// reports failures as [`HostError`]; none of them may panic on host
/// misbehaviour.
pub trait AutomationHost {
    /// Which application this is.
    fn kind(&self) -> HostKind;

    /// OS process backing this host, once it is running.
    fn process_id(&self) -> Option<u32>;

    /// The top-level application object. Released by the pool after `quit`.
    fn application(&self) -> HostObject;

    /// Apply application-level options. Must be called before any `open`.
    fn configure(&mut self, options: &HostOptions) -> Result<(), HostError>;

    /// Fetch the collection that owns open files (Documents / Workbooks).
    fn collection(&mut self) -> Result<HostObject, HostError>;

    /// Open `path` inside `collection`.
    fn open(
        &mut self,
        collection: HostObject,
        path: &Path,
        options: &OpenOptions,
    ) -> Result<HostObject, HostError>;

    /// Export an open file as PDF to `output`.
    fn export_pdf(&mut self, document: HostObject, output: &Path) -> Result<(), HostError>;

    /// Close an open file.
    fn close(&mut self, document: HostObject, save_changes: bool) -> Result<(), HostError>;

    /// Close every file still open, without saving. Returns how many were open.
    fn close_all(&mut self) -> Result<usize, HostError>;

    /// Drop one reference to a host object.
    fn release(&mut self, object: HostObject) -> Result<(), HostError>;

    /// Cheap liveness probe used before reusing a session.
    fn is_responsive(&mut self) -> bool;

    /// Ask the application to exit.
    fn quit(&mut self) -> Result<(), HostError>;
}

/// Creates automation hosts. Shared across worker threads.
pub trait HostFactory: Send + Sync {
    /// Start a new host application of the given kind on the calling thread.
    fn create(&self, kind: HostKind) -> Result<Box<dyn AutomationHost>, HostError>;
}
