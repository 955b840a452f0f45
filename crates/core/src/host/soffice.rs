//! LibreOffice backend for [`AutomationHost`].
//!
//! Each host runs one headless `soffice` listener with a private user
//! profile. Exports are issued with a `--convert-to` client pointed at the
//! same profile, which hands the request to the running listener.
//!
//! The `soffice` launcher is usually a wrapper (`oosplash` on Linux,
//! `soffice.exe` on Windows) that starts the real `soffice.bin` as a child.
//! The host reports that child's pid, so it is the process the registry
//! tracks and the one stopped on quit.

use super::{
    AutomationHost, HostFactory, HostKind, HostObject, HostOptions, ObjectType, OpenOptions,
};
use crate::config::HostConfig;
use crate::error::{ConversionError, HostError, Result};
use crate::process::{ProcessTable, SystemProcessTable};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

const APPLICATION_ID: u64 = 0;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const LISTENER_SETTLE: Duration = Duration::from_millis(500);
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);
const HOST_BINARY: &str = "soffice.bin";
/// Launcher wrappers are at most this many generations above the host.
const MAX_LAUNCH_DEPTH: usize = 6;

/// Starts [`SofficeHost`]s from one located binary.
#[derive(Clone)]
pub struct SofficeFactory {
    soffice: PathBuf,
    startup_timeout: Duration,
    export_timeout: Duration,
    table: Arc<dyn ProcessTable>,
}

impl std::fmt::Debug for SofficeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SofficeFactory")
            .field("soffice", &self.soffice)
            .field("startup_timeout", &self.startup_timeout)
            .field("export_timeout", &self.export_timeout)
            .finish()
    }
}

impl SofficeFactory {
    /// Find the soffice binary: explicit path, well-known install
    /// locations, then `PATH`.
    pub fn locate(config: &HostConfig) -> Result<Self> {
        let soffice = Self::find_soffice(config)?;
        info!("Found LibreOffice at: {:?}", soffice);
        Ok(Self {
            soffice,
            startup_timeout: config.startup_timeout,
            export_timeout: Duration::from_secs(120),
            table: Arc::new(SystemProcessTable::new()),
        })
    }

    /// Process table used to find and stop the real host process.
    pub fn with_process_table(mut self, table: Arc<dyn ProcessTable>) -> Self {
        self.table = table;
        self
    }

    /// Wall-clock limit for a single export.
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    pub fn soffice_path(&self) -> &Path {
        &self.soffice
    }

    fn find_soffice(config: &HostConfig) -> Result<PathBuf> {
        if let Some(ref path) = config.soffice_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(ConversionError::HostUnavailable(format!(
                "soffice not found at {}",
                path.display()
            )));
        }

        let candidates = [
            // macOS
            "/Applications/LibreOffice.app/Contents/MacOS/soffice",
            // Linux
            "/usr/bin/soffice",
            "/usr/lib/libreoffice/program/soffice",
            "/opt/libreoffice/program/soffice",
            // Snap (Ubuntu)
            "/snap/bin/libreoffice.soffice",
            // Windows
            "C:\\Program Files\\LibreOffice\\program\\soffice.exe",
        ];

        for candidate in candidates {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(path);
            }
        }

        which::which("soffice")
            .or_else(|_| which::which("libreoffice"))
            .map_err(|_| {
                ConversionError::HostUnavailable(
                    "LibreOffice (soffice) not found; install it or set host.soffice_path"
                        .to_string(),
                )
            })
    }
}

impl HostFactory for SofficeFactory {
    fn create(&self, kind: HostKind) -> std::result::Result<Box<dyn AutomationHost>, HostError> {
        if !self.soffice.exists() {
            return Err(HostError::NotInstalled {
                kind,
                message: format!("{} no longer exists", self.soffice.display()),
            });
        }
        let host = SofficeHost::new(
            kind,
            self.soffice.clone(),
            self.startup_timeout,
            self.export_timeout,
            Arc::clone(&self.table),
        )?;
        Ok(Box::new(host))
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Application,
    Collection,
    Document { path: PathBuf, open: bool },
}

/// One headless LibreOffice listener serving a single host kind.
pub struct SofficeHost {
    kind: HostKind,
    soffice: PathBuf,
    profile: TempDir,
    pipe_name: String,
    listener: Option<Child>,
    /// The real `soffice.bin` behind the launcher.
    host_pid: Option<u32>,
    table: Arc<dyn ProcessTable>,
    startup_timeout: Duration,
    export_timeout: Duration,
    next_id: u64,
    objects: HashMap<u64, Slot>,
}

impl std::fmt::Debug for SofficeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SofficeHost")
            .field("kind", &self.kind)
            .field("profile", &self.profile.path())
            .field("launcher", &self.listener.as_ref().map(Child::id))
            .field("pid", &self.host_pid)
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl SofficeHost {
    fn new(
        kind: HostKind,
        soffice: PathBuf,
        startup_timeout: Duration,
        export_timeout: Duration,
        table: Arc<dyn ProcessTable>,
    ) -> std::result::Result<Self, HostError> {
        let profile = TempDir::with_prefix("office-pdf-profile-").map_err(|e| {
            HostError::NotInstalled {
                kind,
                message: format!("cannot create profile directory: {}", e),
            }
        })?;
        let mut objects = HashMap::new();
        objects.insert(APPLICATION_ID, Slot::Application);

        debug!("Created {} profile at {:?}", kind, profile.path());
        Ok(Self {
            kind,
            soffice,
            profile,
            pipe_name: format!("office-pdf-{}", Uuid::new_v4().simple()),
            listener: None,
            host_pid: None,
            table,
            startup_timeout,
            export_timeout,
            next_id: APPLICATION_ID + 1,
            objects,
        })
    }

    fn alloc(&mut self, slot: Slot) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(id, slot);
        id
    }

    fn operation_error(&self, operation: &'static str, message: impl Into<String>) -> HostError {
        HostError::Operation {
            kind: self.kind,
            operation,
            message: message.into(),
        }
    }

    fn listener_alive(&mut self) -> bool {
        match self.listener.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn require_listener(&mut self, operation: &'static str) -> std::result::Result<(), HostError> {
        if self.listener.is_none() {
            return Err(self.operation_error(operation, "host has not been configured"));
        }
        if !self.listener_alive() {
            return Err(HostError::Crashed {
                kind: self.kind,
                message: "LibreOffice listener exited".to_string(),
            });
        }
        Ok(())
    }

    fn export_filter(&self) -> &'static str {
        match self.kind {
            HostKind::Word => "pdf:writer_pdf_Export",
            HostKind::Excel => "pdf:calc_pdf_Export",
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--headless".to_string(),
            "--invisible".to_string(),
            "--nologo".to_string(),
            "--nofirststartwizard".to_string(),
            "--norestore".to_string(),
            format!("-env:UserInstallation={}", profile_url(self.profile.path())),
        ]
    }

    fn run_convert(
        &mut self,
        input: &Path,
        output_dir: &Path,
    ) -> std::result::Result<(), HostError> {
        let mut cmd = Command::new(&self.soffice);
        cmd.args(self.base_args())
            .args(["--convert-to", self.export_filter(), "--outdir"])
            .arg(output_dir)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| self.operation_error("ExportAsFixedFormat", e.to_string()))?;

        let deadline = Instant::now() + self.export_timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    warn!(
                        "{} export of {:?} exceeded {:?}, killing client",
                        self.kind,
                        input.file_name(),
                        self.export_timeout
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(HostError::Hung {
                        kind: self.kind,
                        operation: "ExportAsFixedFormat",
                    });
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(self.operation_error("ExportAsFixedFormat", e.to_string())),
            }
        };

        if status.success() {
            return Ok(());
        }

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        if !self.listener_alive() {
            return Err(HostError::Crashed {
                kind: self.kind,
                message: format!("listener died during export: {}", stderr.trim()),
            });
        }
        Err(self.operation_error(
            "ExportAsFixedFormat",
            format!("soffice exited with {}: {}", status, stderr.trim()),
        ))
    }

    fn stop_listener(&mut self) {
        let launcher = self.listener.as_ref().map(Child::id);
        if let Some(mut child) = self.listener.take() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
            debug!("Stopped {} launcher pid {}", self.kind, child.id());
        }

        let Some(pid) = self.host_pid.take() else {
            return;
        };
        if Some(pid) == launcher || !self.table.is_alive(pid) {
            return;
        }
        self.table.request_close(pid);
        let deadline = Instant::now() + QUIT_TIMEOUT;
        while self.table.is_alive(pid) && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
        }
        if self.table.is_alive(pid) {
            warn!("{} pid {} ignored quit, killing", self.kind, pid);
            self.table.kill(pid);
        } else {
            debug!("Stopped {} host pid {}", self.kind, pid);
        }
    }

    /// Wait for the launcher to bring up `soffice.bin`. Falls back to the
    /// launcher pid when it is the host itself or no child shows up.
    fn resolve_host_pid(&self, launcher: u32) -> u32 {
        // The macOS bundle binary is the host itself.
        if cfg!(target_os = "macos") {
            return launcher;
        }
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if let Some(pid) = find_host_process(self.table.as_ref(), launcher) {
                if pid != launcher {
                    debug!("{} launcher {} started host pid {}", self.kind, launcher, pid);
                }
                return pid;
            }
            if Instant::now() >= deadline || !self.table.is_alive(launcher) {
                debug!("{} launcher {} is the host process", self.kind, launcher);
                return launcher;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl AutomationHost for SofficeHost {
    fn kind(&self) -> HostKind {
        self.kind
    }

    fn process_id(&self) -> Option<u32> {
        self.host_pid.or_else(|| self.listener.as_ref().map(Child::id))
    }

    fn application(&self) -> HostObject {
        HostObject::new(APPLICATION_ID, ObjectType::Application)
    }

    fn configure(&mut self, options: &HostOptions) -> std::result::Result<(), HostError> {
        if self.listener.is_some() {
            return Err(self.operation_error("Configure", "options must be applied before start"));
        }

        let user_dir = self.profile.path().join("user");
        std::fs::create_dir_all(&user_dir)
            .and_then(|_| {
                std::fs::write(user_dir.join("registrymodifications.xcu"), registry_xcu(options))
            })
            .map_err(|e| self.operation_error("Configure", e.to_string()))?;

        let mut args = self.base_args();
        if options.visible {
            args.retain(|a| a != "--invisible" && a != "--headless");
        }
        args.push("--nodefault".to_string());
        args.push("--nolockcheck".to_string());
        args.push(format!("--accept=pipe,name={};urp;", self.pipe_name));

        let child = Command::new(&self.soffice)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HostError::NotInstalled {
                kind: self.kind,
                message: format!("failed to start {}: {}", self.soffice.display(), e),
            })?;
        let launcher = child.id();
        self.listener = Some(child);
        let host_pid = self.resolve_host_pid(launcher);
        self.host_pid = Some(host_pid);
        info!(
            "Started {} listener pid {} (launcher {})",
            self.kind, host_pid, launcher
        );

        let settle = LISTENER_SETTLE.min(self.startup_timeout);
        let deadline = Instant::now() + settle;
        while Instant::now() < deadline {
            if !self.listener_alive() {
                self.stop_listener();
                return Err(HostError::Crashed {
                    kind: self.kind,
                    message: "listener exited during startup".to_string(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn collection(&mut self) -> std::result::Result<HostObject, HostError> {
        self.require_listener("Collection")?;
        let id = self.alloc(Slot::Collection);
        Ok(HostObject::new(id, self.kind.collection_type()))
    }

    fn open(
        &mut self,
        collection: HostObject,
        path: &Path,
        options: &OpenOptions,
    ) -> std::result::Result<HostObject, HostError> {
        if !matches!(self.objects.get(&collection.id()), Some(Slot::Collection)) {
            return Err(self.operation_error("Open", "collection reference is not live"));
        }
        self.require_listener("Open")?;
        if !path.is_file() {
            return Err(self.operation_error("Open", format!("cannot open {}", path.display())));
        }
        if !options.read_only {
            debug!("{} opens are always read-only", self.kind);
        }
        let id = self.alloc(Slot::Document {
            path: path.to_path_buf(),
            open: true,
        });
        Ok(HostObject::new(id, self.kind.document_type()))
    }

    fn export_pdf(
        &mut self,
        document: HostObject,
        output: &Path,
    ) -> std::result::Result<(), HostError> {
        let input = match self.objects.get(&document.id()) {
            Some(Slot::Document { path, open: true }) => path.clone(),
            _ => return Err(self.operation_error("ExportAsFixedFormat", "document is not open")),
        };
        self.require_listener("ExportAsFixedFormat")?;

        let output_dir = self.profile.path().join("out").join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| self.operation_error("ExportAsFixedFormat", e.to_string()))?;

        let start = Instant::now();
        let result = self
            .run_convert(&input, &output_dir)
            .and_then(|_| {
                find_pdf(&input, &output_dir).ok_or_else(|| {
                    self.operation_error("ExportAsFixedFormat", "PDF output file not found")
                })
            })
            .and_then(|pdf| {
                move_file(&pdf, output)
                    .map_err(|e| self.operation_error("ExportAsFixedFormat", e.to_string()))
            });
        let _ = std::fs::remove_dir_all(&output_dir);

        if result.is_ok() {
            debug!(
                "{} exported {:?} in {:?}",
                self.kind,
                input.file_name(),
                start.elapsed()
            );
        }
        result
    }

    fn close(
        &mut self,
        document: HostObject,
        _save_changes: bool,
    ) -> std::result::Result<(), HostError> {
        if let Some(Slot::Document { open, .. }) = self.objects.get_mut(&document.id()) {
            if *open {
                *open = false;
                return Ok(());
            }
        }
        Err(self.operation_error("Close", "document is not open"))
    }

    fn close_all(&mut self) -> std::result::Result<usize, HostError> {
        let mut closed = 0;
        for slot in self.objects.values_mut() {
            if let Slot::Document { open, .. } = slot {
                if *open {
                    *open = false;
                    closed += 1;
                }
            }
        }
        Ok(closed)
    }

    fn release(&mut self, object: HostObject) -> std::result::Result<(), HostError> {
        match self.objects.remove(&object.id()) {
            Some(_) => Ok(()),
            None => Err(self.operation_error(
                "Release",
                format!("{} #{} already released", object.object_type(), object.id()),
            )),
        }
    }

    fn is_responsive(&mut self) -> bool {
        self.listener_alive()
    }

    fn quit(&mut self) -> std::result::Result<(), HostError> {
        self.stop_listener();
        Ok(())
    }
}

impl Drop for SofficeHost {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

/// `file://` URL for a profile directory, as soffice expects in
/// `-env:UserInstallation`.
fn profile_url(path: &Path) -> String {
    let path = path.to_string_lossy().replace('\\', "/").replace(' ', "%20");
    if path.starts_with('/') {
        format!("file://{}", path)
    } else {
        format!("file:///{}", path)
    }
}

fn xcu_item(path: &str, prop: &str, value: &str) -> String {
    format!(
        concat!(
            "<item oor:path=\"{}\"><prop oor:name=\"{}\" oor:op=\"fuse\">",
            "<value>{}</value></prop></item>\n"
        ),
        path,
        prop,
        value
    )
}

/// Profile settings equivalent to the automation options.
fn registry_xcu(options: &HostOptions) -> String {
    let flag = |b: bool| if b { "true" } else { "false" };
    let mut xcu = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <oor:items xmlns:oor=\"http://openoffice.org/2001/registry\" \
         xmlns:xs=\"http://www.w3.org/2001/XMLSchema\" \
         xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\n",
    );
    xcu.push_str(&xcu_item(
        "/org.openoffice.Office.Recovery/AutoSave",
        "Enabled",
        flag(options.auto_save),
    ));
    xcu.push_str(&xcu_item(
        "/org.openoffice.Office.Recovery/RecoveryInfo",
        "Enabled",
        flag(options.auto_recover),
    ));
    xcu.push_str(&xcu_item(
        "/org.openoffice.Office.Common/Misc",
        "ShowTipOfTheDay",
        flag(options.display_alerts),
    ));
    xcu.push_str(&xcu_item("/org.openoffice.Office.Common/Misc", "FirstRun", "false"));
    xcu.push_str(&xcu_item(
        "/org.openoffice.Office.Common/Save/Document",
        "CreateBackup",
        "false",
    ));
    xcu.push_str("</oor:items>\n");
    xcu
}

/// The `soffice.bin` process that is `launcher` or descends from it.
fn find_host_process(table: &dyn ProcessTable, launcher: u32) -> Option<u32> {
    let candidates = table.list_by_name(HOST_BINARY).ok()?;
    candidates
        .iter()
        .find(|p| p.pid == launcher)
        .or_else(|| {
            candidates
                .iter()
                .find(|p| descends_from(table, p.parent_pid, launcher))
        })
        .map(|p| p.pid)
}

fn descends_from(table: &dyn ProcessTable, mut parent: Option<u32>, ancestor: u32) -> bool {
    for _ in 0..MAX_LAUNCH_DEPTH {
        match parent {
            Some(pid) if pid == ancestor => return true,
            Some(pid) => parent = table.find(pid).and_then(|p| p.parent_pid),
            None => return false,
        }
    }
    false
}

fn find_pdf(input: &Path, output_dir: &Path) -> Option<PathBuf> {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let expected = output_dir.join(format!("{}.pdf", stem));
    if expected.exists() {
        return Some(expected);
    }
    // LibreOffice might have created a file with a slightly different name
    std::fs::read_dir(output_dir).ok().and_then(|entries| {
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().map(|ext| ext == "pdf").unwrap_or(false))
    })
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Cross-device moves fall back to copy.
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}
