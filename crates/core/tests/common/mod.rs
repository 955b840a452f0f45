//! Scripted stand-ins for the office suite and the OS process table.
#![allow(dead_code)]

use office_pdf_core::config::{
    ConverterConfig, HostConfig, PoolConfig, ReaperConfig, RecoveryConfig,
};
use office_pdf_core::error::{HostError, InterfaceCode};
use office_pdf_core::host::{
    AutomationHost, HostFactory, HostKind, HostObject, HostOptions, ObjectType, OpenOptions,
};
use office_pdf_core::pool::HostServices;
use office_pdf_core::process::{ProcessInfo, ProcessTable};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const HOST_PROCESS: &str = "soffice.bin";
pub const APP_PID: u32 = 1;

/// What an export of a given file should do instead of succeeding.
#[derive(Debug, Clone)]
pub enum Fault {
    /// The host process dies.
    Crash,
    /// The call fails with an interface status code.
    Interface(InterfaceCode),
    /// The host reports an operation failure and stays up.
    Operation,
    /// The call blocks for this long, then fails if the host was killed
    /// meanwhile.
    Hang(Duration),
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub name: String,
    pub parent: Option<u32>,
    pub memory_bytes: u64,
    pub responding: bool,
    /// Ignores graceful close requests; only a kill stops it.
    pub stubborn: bool,
}

#[derive(Default)]
struct WorldState {
    next_pid: u32,
    next_object: u64,
    processes: BTreeMap<u32, FakeProcess>,
    live_objects: BTreeSet<u64>,
    release_log: Vec<(u64, ObjectType)>,
    fail_release: BTreeSet<u64>,
    faults: HashMap<String, VecDeque<Fault>>,
    hosts_created: BTreeMap<HostKind, usize>,
    live_hosts: usize,
    max_live_hosts: usize,
    adopt_next: Option<u32>,
    not_installed: bool,
    fail_configure: bool,
    exports: Vec<PathBuf>,
    close_requests: Vec<u32>,
    kills: Vec<u32>,
    quits: Vec<u32>,
}

/// Shared fake office suite plus process table.
#[derive(Clone)]
pub struct FakeWorld {
    state: Arc<Mutex<WorldState>>,
}

impl Default for FakeWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeWorld {
    pub fn new() -> Self {
        let mut state = WorldState {
            next_pid: 1000,
            next_object: 1,
            ..Default::default()
        };
        // The application itself and an unrelated long-lived parent.
        state.processes.insert(
            APP_PID,
            FakeProcess {
                name: "office-pdf".into(),
                parent: None,
                memory_bytes: 0,
                responding: true,
                stubborn: false,
            },
        );
        state.processes.insert(
            2,
            FakeProcess {
                name: "explorer.exe".into(),
                parent: None,
                memory_bytes: 0,
                responding: true,
                stubborn: false,
            },
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn spawn(&self, parent: Option<u32>, stubborn: bool) -> u32 {
        let mut state = self.state.lock();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(
            pid,
            FakeProcess {
                name: HOST_PROCESS.into(),
                parent,
                memory_bytes: 64 * 1024 * 1024,
                responding: true,
                stubborn,
            },
        );
        pid
    }

    /// A host process the user started themselves.
    pub fn spawn_user_process(&self) -> u32 {
        self.spawn(Some(2), false)
    }

    /// A host process with no parent at all.
    pub fn spawn_orphan(&self) -> u32 {
        self.spawn(None, false)
    }

    /// A host process whose parent is this application.
    pub fn spawn_child(&self) -> u32 {
        self.spawn(Some(APP_PID), false)
    }

    /// A child that ignores close requests.
    pub fn spawn_stubborn_child(&self) -> u32 {
        self.spawn(Some(APP_PID), true)
    }

    /// A host process whose parent has a given pid.
    pub fn spawn_with_parent(&self, parent: u32) -> u32 {
        self.spawn(Some(parent), false)
    }

    pub fn remove_process(&self, pid: u32) {
        self.state.lock().processes.remove(&pid);
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.state.lock().processes.contains_key(&pid)
    }

    pub fn set_responding(&self, pid: u32, responding: bool) {
        if let Some(p) = self.state.lock().processes.get_mut(&pid) {
            p.responding = responding;
        }
    }

    /// Queue a fault for the next export of a file with this name.
    pub fn fail_export(&self, file_name: &str, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry(file_name.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Next host reports this pid instead of starting a new process.
    pub fn adopt_next(&self, pid: u32) {
        self.state.lock().adopt_next = Some(pid);
    }

    /// Next host starts its process, then fails to apply its options.
    pub fn fail_next_configure(&self) {
        self.state.lock().fail_configure = true;
    }

    pub fn set_not_installed(&self, not_installed: bool) {
        self.state.lock().not_installed = not_installed;
    }

    pub fn fail_release_of(&self, id: u64) {
        self.state.lock().fail_release.insert(id);
    }

    pub fn hosts_created(&self, kind: HostKind) -> usize {
        self.state.lock().hosts_created.get(&kind).copied().unwrap_or(0)
    }

    pub fn max_live_hosts(&self) -> usize {
        self.state.lock().max_live_hosts
    }

    pub fn release_log(&self) -> Vec<(u64, ObjectType)> {
        self.state.lock().release_log.clone()
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().live_objects.len()
    }

    pub fn exports(&self) -> Vec<PathBuf> {
        self.state.lock().exports.clone()
    }

    pub fn kills(&self) -> Vec<u32> {
        self.state.lock().kills.clone()
    }

    pub fn close_requests(&self) -> Vec<u32> {
        self.state.lock().close_requests.clone()
    }

    pub fn quits(&self) -> Vec<u32> {
        self.state.lock().quits.clone()
    }

    pub fn host_pids(&self) -> Vec<u32> {
        self.state
            .lock()
            .processes
            .iter()
            .filter(|(_, p)| p.name == HOST_PROCESS)
            .map(|(pid, _)| *pid)
            .collect()
    }

    fn new_object(&self, object_type: ObjectType) -> HostObject {
        let mut state = self.state.lock();
        let id = state.next_object;
        state.next_object += 1;
        state.live_objects.insert(id);
        HostObject::new(id, object_type)
    }

    /// A configured host outside any pool.
    pub fn host(&self, kind: HostKind) -> Box<dyn AutomationHost> {
        let mut host = self.create(kind).expect("fake host");
        host.configure(&HostOptions::automation()).expect("configure");
        host
    }

    /// Shared services over this world.
    pub fn services(&self, config: &ConverterConfig) -> HostServices {
        HostServices::new(Arc::new(self.clone()), Arc::new(self.clone()), config)
    }
}

impl HostFactory for FakeWorld {
    fn create(&self, kind: HostKind) -> Result<Box<dyn AutomationHost>, HostError> {
        let mut state = self.state.lock();
        if state.not_installed {
            return Err(HostError::NotInstalled {
                kind,
                message: "fake office suite is not installed".into(),
            });
        }
        *state.hosts_created.entry(kind).or_insert(0) += 1;
        let application = state.next_object;
        state.next_object += 1;
        state.live_objects.insert(application);
        Ok(Box::new(FakeHost {
            world: self.clone(),
            kind,
            pid: None,
            application: HostObject::new(application, ObjectType::Application),
            open: Vec::new(),
            options: None,
            counted: false,
        }))
    }
}

impl ProcessTable for FakeWorld {
    fn list_by_name(&self, name: &str) -> io::Result<Vec<ProcessInfo>> {
        Ok(self
            .state
            .lock()
            .processes
            .iter()
            .filter(|(_, p)| p.name.eq_ignore_ascii_case(name))
            .map(|(pid, p)| info(*pid, p))
            .collect())
    }

    fn find(&self, pid: u32) -> Option<ProcessInfo> {
        self.state.lock().processes.get(&pid).map(|p| info(pid, p))
    }

    fn current_pid(&self) -> u32 {
        APP_PID
    }

    fn request_close(&self, pid: u32) -> bool {
        let mut state = self.state.lock();
        state.close_requests.push(pid);
        match state.processes.get(&pid) {
            Some(p) if !p.stubborn => {
                state.processes.remove(&pid);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn send_close_message(&self, pid: u32) -> bool {
        self.request_close(pid)
    }

    fn kill(&self, pid: u32) -> bool {
        let mut state = self.state.lock();
        state.kills.push(pid);
        state.processes.remove(&pid).is_some()
    }
}

fn info(pid: u32, p: &FakeProcess) -> ProcessInfo {
    ProcessInfo {
        pid,
        parent_pid: p.parent,
        name: p.name.clone(),
        memory_bytes: p.memory_bytes,
        responding: p.responding,
    }
}

/// Host backed by [`FakeWorld`].
pub struct FakeHost {
    world: FakeWorld,
    kind: HostKind,
    pid: Option<u32>,
    application: HostObject,
    open: Vec<HostObject>,
    options: Option<HostOptions>,
    counted: bool,
}

impl FakeHost {
    fn alive(&self) -> bool {
        self.pid.map(|pid| self.world.is_alive(pid)).unwrap_or(false)
    }

    fn crashed(&self, message: &str) -> HostError {
        HostError::Crashed {
            kind: self.kind,
            message: message.to_string(),
        }
    }

    fn uncount(&mut self) {
        if self.counted {
            self.counted = false;
            self.world.state.lock().live_hosts -= 1;
        }
    }
}

impl AutomationHost for FakeHost {
    fn kind(&self) -> HostKind {
        self.kind
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    fn application(&self) -> HostObject {
        self.application
    }

    fn configure(&mut self, options: &HostOptions) -> Result<(), HostError> {
        let adopted = self.world.state.lock().adopt_next.take();
        let pid = match adopted {
            Some(pid) => pid,
            None => self.world.spawn_child(),
        };
        self.pid = Some(pid);
        self.options = Some(options.clone());

        let mut state = self.world.state.lock();
        state.live_hosts += 1;
        state.max_live_hosts = state.max_live_hosts.max(state.live_hosts);
        self.counted = true;
        if std::mem::take(&mut state.fail_configure) {
            return Err(HostError::Operation {
                kind: self.kind,
                operation: "Configure",
                message: "simulated configure failure".into(),
            });
        }
        Ok(())
    }

    fn collection(&mut self) -> Result<HostObject, HostError> {
        if !self.alive() {
            return Err(self.crashed("process gone"));
        }
        Ok(self.world.new_object(self.kind.collection_type()))
    }

    fn open(
        &mut self,
        _collection: HostObject,
        path: &Path,
        options: &OpenOptions,
    ) -> Result<HostObject, HostError> {
        assert!(options.read_only, "conversion opens must be read-only");
        assert!(
            self.options.as_ref().map(|o| !o.display_alerts).unwrap_or(false),
            "options must be applied before open"
        );
        if !self.alive() {
            return Err(self.crashed("process gone"));
        }
        if !path.exists() {
            return Err(HostError::Operation {
                kind: self.kind,
                operation: "Open",
                message: format!("{} not found", path.display()),
            });
        }
        let document = self.world.new_object(self.kind.document_type());
        self.open.push(document);
        Ok(document)
    }

    fn export_pdf(&mut self, document: HostObject, output: &Path) -> Result<(), HostError> {
        let name = output
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let fault = {
            let mut state = self.world.state.lock();
            let key = state
                .faults
                .keys()
                .find(|k| Path::new(k).file_stem().and_then(|s| s.to_str()) == Some(name.as_str()))
                .cloned();
            key.and_then(|k| state.faults.get_mut(&k).and_then(VecDeque::pop_front))
        };

        match fault {
            Some(Fault::Crash) => {
                if let Some(pid) = self.pid {
                    self.world.remove_process(pid);
                }
                return Err(self.crashed("simulated crash"));
            }
            Some(Fault::Interface(code)) => {
                return Err(HostError::Interface {
                    kind: self.kind,
                    operation: "ExportAsFixedFormat",
                    code,
                    message: "simulated interface error".into(),
                });
            }
            Some(Fault::Operation) => {
                return Err(HostError::Operation {
                    kind: self.kind,
                    operation: "ExportAsFixedFormat",
                    message: "simulated export failure".into(),
                });
            }
            Some(Fault::Hang(duration)) => {
                std::thread::sleep(duration);
                if !self.alive() {
                    return Err(self.crashed("killed while hung"));
                }
            }
            None => {}
        }

        if !self.open.contains(&document) {
            return Err(HostError::Operation {
                kind: self.kind,
                operation: "ExportAsFixedFormat",
                message: "document is not open".into(),
            });
        }
        std::fs::write(output, b"%PDF-1.4 fake").map_err(|e| HostError::Operation {
            kind: self.kind,
            operation: "ExportAsFixedFormat",
            message: e.to_string(),
        })?;
        self.world.state.lock().exports.push(output.to_path_buf());
        Ok(())
    }

    fn close(&mut self, document: HostObject, save_changes: bool) -> Result<(), HostError> {
        assert!(!save_changes, "conversion must not save the input");
        self.open.retain(|d| *d != document);
        Ok(())
    }

    fn close_all(&mut self) -> Result<usize, HostError> {
        let n = self.open.len();
        self.open.clear();
        Ok(n)
    }

    fn release(&mut self, object: HostObject) -> Result<(), HostError> {
        let mut state = self.world.state.lock();
        state.release_log.push((object.id(), object.object_type()));
        if state.fail_release.contains(&object.id()) || !state.live_objects.remove(&object.id()) {
            return Err(HostError::Operation {
                kind: self.kind,
                operation: "Release",
                message: format!("object {} not releasable", object.id()),
            });
        }
        Ok(())
    }

    fn is_responsive(&mut self) -> bool {
        self.pid
            .and_then(|pid| self.world.find(pid))
            .map(|p| p.responding)
            .unwrap_or(false)
    }

    fn quit(&mut self) -> Result<(), HostError> {
        self.uncount();
        let Some(pid) = self.pid else {
            return Ok(());
        };
        self.world.state.lock().quits.push(pid);
        if self.world.is_alive(pid) {
            self.world.remove_process(pid);
            Ok(())
        } else {
            Err(self.crashed("already gone"))
        }
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        self.uncount();
    }
}

/// Configuration with every delay shrunk so tests run fast.
pub fn fast_config() -> ConverterConfig {
    let mut process_names = BTreeMap::new();
    for kind in HostKind::ALL {
        process_names.insert(kind, vec![HOST_PROCESS.to_string()]);
    }
    ConverterConfig {
        host: HostConfig {
            process_names,
            ..HostConfig::default()
        },
        pool: PoolConfig::default(),
        reaper: ReaperConfig {
            graceful_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
            sweep_interval: None,
        },
        recovery: RecoveryConfig::uniform(Duration::from_millis(1)),
        validation: Default::default(),
        max_parallel: None,
    }
}

/// Scratch directory with input files.
pub struct Inputs {
    pub dir: TempDir,
}

impl Inputs {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    /// Write a small input file and return its path.
    pub fn file(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"PK\x03\x04 fake office document").expect("write input");
        path
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
