use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RoomConfig;
use crate::error::ChatError;
use crate::room;
use crate::store::Store;
use crate::types::RoomAddress;
use crate::validate::Validator;

/// A started room worker.
pub trait WorkerHandle: Send {
    fn is_alive(&mut self) -> bool;

    /// Short description for logs, e.g. a pid.
    fn describe(&self) -> String;
}

/// Starts isolated room workers bound to a given address.
pub trait Launcher: Send + Sync {
    fn start(&self, name: &str, addr: &RoomAddress) -> Result<Box<dyn WorkerHandle>, ChatError>;
}

struct Running {
    addr: RoomAddress,
    handle: Box<dyn WorkerHandle>,
}

/// One room's entry. Its lock is held while that room is checked or
/// started, so a slow start blocks requests for the same room only.
type Slot = Arc<Mutex<Option<Running>>>;

/// Running-process table plus the launcher that fills it.
///
/// Each room name has its own slot. The slot lock is held across check,
/// start and liveness probe, so concurrent `ensure_running` calls for one
/// name start at most one worker while other rooms stay reachable.
pub struct Supervisor {
    launcher: Box<dyn Launcher>,
    startup_grace: Duration,
    running: Mutex<HashMap<String, Slot>>,
}

impl Supervisor {
    pub fn new(launcher: Box<dyn Launcher>, startup_grace: Duration) -> Self {
        Self {
            launcher,
            startup_grace,
            running: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, name: &str) -> Slot {
        let mut running = self.running.lock().await;
        Arc::clone(running.entry(name.to_string()).or_default())
    }

    /// Return the address of a live worker for `name`, starting one at
    /// `addr` if none is alive. A dead entry is replaced, never returned.
    pub async fn ensure_running(&self, name: &str, addr: &RoomAddress) -> Result<RoomAddress, ChatError> {
        let slot = self.slot(name).await;
        let mut entry = slot.lock().await;

        if let Some(current) = entry.as_mut() {
            if current.handle.is_alive() {
                debug!(room = name, worker = %current.handle.describe(), "room already running");
                return Ok(current.addr.clone());
            }
            warn!(room = name, worker = %current.handle.describe(), "room worker died, restarting");
            *entry = None;
        }

        let mut handle = self.launcher.start(name, addr)?;
        if !self.startup_grace.is_zero() {
            tokio::time::sleep(self.startup_grace).await;
        }
        if !handle.is_alive() {
            error!(room = name, %addr, worker = %handle.describe(), "room worker exited during startup");
            return Err(ChatError::ProcessStart {
                name: name.to_string(),
                reason: "worker exited during startup".to_string(),
            });
        }

        info!(room = name, %addr, worker = %handle.describe(), "room started");
        *entry = Some(Running {
            addr: addr.clone(),
            handle,
        });
        Ok(addr.clone())
    }

    /// Whether a live worker is recorded for `name`.
    pub async fn is_running(&self, name: &str) -> bool {
        let slot = self.running.lock().await.get(name).cloned();
        let Some(slot) = slot else {
            return false;
        };
        let mut entry = slot.lock().await;
        entry.as_mut().is_some_and(|r| r.handle.is_alive())
    }
}

// ── OS process workers ──────────────────────────────────────────────

/// Re-executes a room-capable binary as `room --name .. --host .. --port ..`.
///
/// Children are killed when their handle is dropped, so rooms do not
/// outlive the master.
pub struct ProcessLauncher {
    program: PathBuf,
    database: String,
    banned_words: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, database: impl Into<String>, banned_words: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            database: database.into(),
            banned_words,
        }
    }

    /// Launch rooms with the currently running executable.
    pub fn current_exe(database: impl Into<String>, banned_words: Option<PathBuf>) -> Result<Self, ChatError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, database, banned_words))
    }
}

impl Launcher for ProcessLauncher {
    fn start(&self, name: &str, addr: &RoomAddress) -> Result<Box<dyn WorkerHandle>, ChatError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("room")
            .arg("--name")
            .arg(name)
            .arg("--host")
            .arg(&addr.host)
            .arg("--port")
            .arg(addr.port.to_string())
            .arg("--database")
            .arg(&self.database)
            .kill_on_drop(true);
        if let Some(path) = &self.banned_words {
            cmd.arg("--banned-words").arg(path);
        }

        let child = cmd.spawn().map_err(|e| ChatError::ProcessStart {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(ChildWorker(child)))
    }
}

struct ChildWorker(Child);

impl WorkerHandle for ChildWorker {
    fn is_alive(&mut self) -> bool {
        matches!(self.0.try_wait(), Ok(None))
    }

    fn describe(&self) -> String {
        match self.0.id() {
            Some(pid) => format!("pid {pid}"),
            None => "exited process".to_string(),
        }
    }
}

// ── In-process task workers ─────────────────────────────────────────

/// Runs each room as its own tokio task with its own room state. Rooms
/// still share nothing but the store.
pub struct TaskLauncher {
    store: Arc<dyn Store>,
    validator: Validator,
    shutdown: CancellationToken,
}

impl TaskLauncher {
    pub fn new(store: Arc<dyn Store>, validator: Validator, shutdown: CancellationToken) -> Self {
        Self {
            store,
            validator,
            shutdown,
        }
    }
}

impl Launcher for TaskLauncher {
    fn start(&self, name: &str, addr: &RoomAddress) -> Result<Box<dyn WorkerHandle>, ChatError> {
        let config = RoomConfig::builder(name).address(addr).build();
        let store = Arc::clone(&self.store);
        let validator = self.validator.clone();
        let shutdown = self.shutdown.child_token();
        let room_name = name.to_string();

        let task = tokio::spawn(async move {
            if let Err(e) = room::run(config, store, validator, shutdown).await {
                error!(room = %room_name, error = %e, "room task failed");
            }
        });
        Ok(Box::new(TaskWorker(task)))
    }
}

struct TaskWorker(JoinHandle<()>);

impl WorkerHandle for TaskWorker {
    fn is_alive(&mut self) -> bool {
        !self.0.is_finished()
    }

    fn describe(&self) -> String {
        "in-process task".to_string()
    }
}

impl Drop for TaskWorker {
    fn drop(&mut self) {
        self.0.abort();
    }
}
