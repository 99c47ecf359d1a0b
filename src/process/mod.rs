//! ServerProcess - one supervised child process per server definition
//!
//! Each run spawns the server's launch script with stdout and stderr sharing
//! one pipe, so the console keeps the order the child wrote in. A supervisor
//! task then multiplexes three inputs until the child exits:
//! - queued commands, written to stdin in submission order
//! - console lines from the output reader, classified and appended to history
//! - the child's exit
//!
//! Console history, the player roster and the operational latch are reset at
//! the start of every run. The roster is cleared again when the run ends.

pub mod command;
pub mod error;
pub mod properties;

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, PipeReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::backup::{self, BackupError, BackupSlot};
use crate::console;
use crate::notify::{Notifier, ServerEvent};
use crate::registry::ServerDefinition;
use crate::runtime::{self, RuntimeResolver};
use crate::utils;

use self::command::{CommandReceiver, CommandSender};
pub use self::error::ProcessError;

const CONSOLE_BROADCAST_CAPACITY: usize = 2048;

// ─── Status ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    /// Registry overlay for a definition that is still being provisioned.
    Creating,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Creating => "CREATING",
        })
    }
}

/// A console line as broadcast to live subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub server: String,
    /// Position in this run's console history.
    pub index: usize,
    pub line: String,
}

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Written to stdin by [`ServerProcess::stop`].
    pub stop_command: String,
    /// Upper bound on waiting for the output reader after the child exits.
    pub output_join_timeout: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            stop_command: "stop".to_string(),
            output_join_timeout: Duration::from_secs(5),
        }
    }
}

// ─── Run state ───────────────────────────────────────────────

enum Phase {
    Stopped,
    /// Runtime is being resolved / child is being spawned.
    Launching,
    Live {
        pid: Option<u32>,
        commands: CommandSender,
    },
}

struct RunState {
    phase: Phase,
    console: Vec<String>,
    players: BTreeSet<String>,
    operational: bool,
    started_at: Option<DateTime<Local>>,
    /// Set once the registry accepted a delete; no further runs.
    retired: bool,
}

impl RunState {
    fn reset_for_run(&mut self) {
        self.console.clear();
        self.players.clear();
        self.operational = false;
        self.started_at = None;
    }
}

// ─── Server process ──────────────────────────────────────────

pub struct ServerProcess {
    definition: ServerDefinition,
    state: Mutex<RunState>,
    console_tx: broadcast::Sender<ConsoleLine>,
    running_tx: watch::Sender<bool>,
    notifier: Notifier,
    runtime: Arc<dyn RuntimeResolver>,
    backup_slot: Arc<BackupSlot>,
    options: ProcessOptions,
}

impl ServerProcess {
    pub fn new(
        definition: ServerDefinition,
        notifier: Notifier,
        runtime: Arc<dyn RuntimeResolver>,
        options: ProcessOptions,
    ) -> Arc<Self> {
        // 백업 폴더가 없어도 서버 시작은 가능해야 함
        if let Err(e) = std::fs::create_dir_all(&definition.backup_location) {
            tracing::warn!(
                "Could not create backup directory {} for '{}': {}",
                definition.backup_location.display(),
                definition.name,
                e
            );
        }

        let (console_tx, _) = broadcast::channel(CONSOLE_BROADCAST_CAPACITY);
        let (running_tx, _) = watch::channel(false);

        Arc::new(Self {
            definition,
            state: Mutex::new(RunState {
                phase: Phase::Stopped,
                console: Vec::new(),
                players: BTreeSet::new(),
                operational: false,
                started_at: None,
                retired: false,
            }),
            console_tx,
            running_tx,
            notifier,
            runtime,
            backup_slot: BackupSlot::new(),
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub fn data_dir(&self) -> &Path {
        &self.definition.server_location
    }

    pub fn backup_dir(&self) -> &Path {
        &self.definition.backup_location
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("State lock of '{}' poisoned, recovering", self.definition.name);
            poisoned.into_inner()
        })
    }

    // ── lifecycle ────────────────────────────────────────────

    /// Start a new run. Returns `Ok(false)` without side effects if a process
    /// is already live (or being launched).
    pub async fn start(self: &Arc<Self>) -> Result<bool, ProcessError> {
        {
            let mut state = self.lock_state();
            if state.retired {
                return Err(ProcessError::Removed(self.definition.name.clone()));
            }
            if !matches!(state.phase, Phase::Stopped) {
                return Ok(false);
            }
            state.phase = Phase::Launching;
            state.reset_for_run();
        }

        let (mut child, output) = match self.spawn_child().await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.lock_state().phase = Phase::Stopped;
                tracing::error!("Failed to start '{}': {}", self.definition.name, e);
                return Err(e);
            }
        };

        let pid = child.id();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let server = self.definition.name.clone();
        let reader = tokio::task::spawn_blocking(move || read_lines(output, line_tx, server));
        let stdin = child.stdin.take();

        let (cmd_tx, cmd_rx) = command::channel();
        {
            let mut state = self.lock_state();
            state.phase = Phase::Live { pid, commands: cmd_tx };
            state.started_at = Some(Local::now());
        }
        self.running_tx.send_replace(true);
        tracing::info!("Server '{}' started (pid {:?})", self.definition.name, pid);
        self.notifier.emit(ServerEvent::ServerStarting {
            server: self.definition.name.clone(),
        });

        tokio::spawn(Arc::clone(self).supervise(child, stdin, cmd_rx, line_rx, reader));
        Ok(true)
    }

    /// Spawn the launch script. The returned reader carries stdout and stderr.
    async fn spawn_child(&self) -> Result<(Child, PipeReader), ProcessError> {
        let name = &self.definition.name;
        let runtime_home = self
            .runtime
            .resolve(self.definition.game_version.as_deref())
            .await
            .map_err(|e| ProcessError::RuntimeUnavailable {
                server: name.clone(),
                reason: format!("{:#}", e),
            })?;

        let data_dir = &self.definition.server_location;
        let script = data_dir.join(utils::LAUNCH_SCRIPT);
        if !script.is_file() {
            return Err(ProcessError::LaunchScriptMissing(script));
        }

        let spawn_failed = |source: std::io::Error| ProcessError::SpawnFailed {
            server: name.clone(),
            source,
        };
        let (output, writer) = std::io::pipe().map_err(spawn_failed)?;
        let err_writer = writer.try_clone().map_err(spawn_failed)?;

        let mut cmd = utils::launch_command(data_dir);
        cmd.env("JAVA_HOME", &runtime_home)
            .env("PATH", runtime::path_with_runtime(&runtime_home))
            .stdin(Stdio::piped())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(err_writer))
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(spawn_failed)?;
        // our copies of the write end must go, or the reader never sees EOF
        drop(cmd);
        Ok((child, output))
    }

    /// Runs for the lifetime of one child process.
    async fn supervise(
        self: Arc<Self>,
        mut child: Child,
        mut stdin: Option<ChildStdin>,
        mut commands: CommandReceiver,
        mut lines: mpsc::UnboundedReceiver<String>,
        reader: JoinHandle<()>,
    ) {
        let name = self.definition.name.clone();
        let mut lines_open = true;

        let exit = loop {
            tokio::select! {
                biased;
                Some(cmd) = commands.recv() => self.write_command(&mut stdin, &cmd).await,
                line = lines.recv(), if lines_open => match line {
                    Some(line) => self.handle_line(line),
                    None => lines_open = false,
                },
                status = child.wait() => break status,
            }
        };

        match exit {
            Ok(status) => tracing::info!("Server '{}' exited with {}", name, status),
            Err(e) => tracing::warn!("Failed to wait for server '{}': {}", name, e),
        }
        drop(stdin);

        match tokio::time::timeout(self.options.output_join_timeout, reader).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Output reader of '{}' panicked: {}", name, e),
            Err(_) => tracing::warn!(
                "Output of '{}' still open after {:?}, detaching reader",
                name,
                self.options.output_join_timeout
            ),
        }
        while let Ok(line) = lines.try_recv() {
            self.handle_line(line);
        }

        {
            let mut state = self.lock_state();
            state.players.clear();
            state.operational = false;
            state.started_at = None;
            // drops the command sender; anything still queued is discarded
            state.phase = Phase::Stopped;
        }
        self.running_tx.send_replace(false);
        self.notifier.emit(ServerEvent::ServerStopped {
            server: self.definition.name.clone(),
        });
    }

    async fn write_command(&self, stdin: &mut Option<ChildStdin>, cmd: &str) {
        let Some(handle) = stdin.as_mut() else {
            tracing::warn!("'{}' has no stdin, dropping command '{}'", self.definition.name, cmd);
            return;
        };
        let data = format!("{}\n", cmd);
        if let Err(e) = handle.write_all(data.as_bytes()).await {
            tracing::warn!("Failed to write command to '{}': {}", self.definition.name, e);
            return;
        }
        if let Err(e) = handle.flush().await {
            tracing::warn!("Failed to flush stdin of '{}': {}", self.definition.name, e);
        }
    }

    fn handle_line(&self, raw: String) {
        let info = console::classify(&raw);
        let line = console::redact_ipv4(&raw);
        let server = &self.definition.name;
        let mut events = Vec::new();

        let index = {
            let mut state = self.lock_state();
            if let Some(player) = info.joined {
                state.players.insert(player.clone());
                events.push(ServerEvent::PlayerJoin { server: server.clone(), player });
            }
            if let Some(player) = info.left {
                state.players.remove(&player);
                events.push(ServerEvent::PlayerLeave { server: server.clone(), player });
            }
            if let Some((player, achievement)) = info.achievement {
                events.push(ServerEvent::PlayerAchievement {
                    server: server.clone(),
                    player,
                    achievement,
                });
            }
            if info.done && !state.operational {
                state.operational = true;
                tracing::info!("Server '{}' is operational", server);
                events.push(ServerEvent::ServerStarted { server: server.clone() });
            }
            state.console.push(line.clone());
            state.console.len() - 1
        };

        tracing::debug!(server = server.as_str(), "{}", line);
        // no subscribers is fine
        let _ = self.console_tx.send(ConsoleLine {
            server: server.clone(),
            index,
            line,
        });
        for event in events {
            self.notifier.emit(event);
        }
    }

    /// Queue the configured stop command. Never kills the process.
    /// Returns false when nothing is running.
    pub fn stop(&self) -> bool {
        let state = self.lock_state();
        match &state.phase {
            Phase::Live { commands, .. } => {
                tracing::info!("Stopping server '{}'", self.definition.name);
                commands.send(self.options.stop_command.clone())
            }
            _ => false,
        }
    }

    /// Queue a console command for the live process.
    pub fn run_command(&self, cmd: &str) -> Result<(), ProcessError> {
        let state = self.lock_state();
        match &state.phase {
            Phase::Live { commands, .. } if commands.send(cmd) => Ok(()),
            _ => Err(ProcessError::NotRunning(self.definition.name.clone())),
        }
    }

    /// Mark the server as removed if nothing is running or launching.
    /// Once retired, [`start`](Self::start) refuses to run it.
    pub(crate) fn retire(&self) -> bool {
        let mut state = self.lock_state();
        if state.retired || !matches!(state.phase, Phase::Stopped) {
            return false;
        }
        state.retired = true;
        true
    }

    /// Undo [`retire`](Self::retire) after a delete that did not go through.
    pub(crate) fn unretire(&self) {
        self.lock_state().retired = false;
    }

    /// Resolves once no process is live.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.running_tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    // ── queries ──────────────────────────────────────────────

    pub fn status(&self) -> ServerStatus {
        let state = self.lock_state();
        match state.phase {
            Phase::Stopped => ServerStatus::Stopped,
            Phase::Launching => ServerStatus::Starting,
            Phase::Live { .. } if state.operational => ServerStatus::Running,
            Phase::Live { .. } => ServerStatus::Starting,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lock_state().phase, Phase::Live { .. })
    }

    pub fn is_operational(&self) -> bool {
        self.lock_state().operational
    }

    pub fn pid(&self) -> Option<u32> {
        match self.lock_state().phase {
            Phase::Live { pid, .. } => pid,
            _ => None,
        }
    }

    /// Whole console history of the current (or last) run.
    pub fn console(&self) -> Vec<String> {
        self.lock_state().console.clone()
    }

    /// Lines after the first `seen` ones, for incremental polling.
    pub fn console_since(&self, seen: usize) -> Vec<String> {
        let state = self.lock_state();
        state.console.get(seen..).map(<[String]>::to_vec).unwrap_or_default()
    }

    /// Live feed of appended console lines.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleLine> {
        self.console_tx.subscribe()
    }

    pub fn players(&self) -> Vec<String> {
        self.lock_state().players.iter().cloned().collect()
    }

    pub fn start_time(&self) -> Option<DateTime<Local>> {
        self.lock_state().started_at
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.start_time()
            .map(|at| (Local::now() - at).to_std().unwrap_or_default())
    }

    // ── server.properties ────────────────────────────────────

    /// Editable entries of `server.properties`; network binding keys are left out.
    pub fn properties(&self) -> Result<BTreeMap<String, String>, ProcessError> {
        properties::read(&self.properties_path()).map_err(|source| ProcessError::Properties {
            server: self.definition.name.clone(),
            source,
        })
    }

    /// Rewrite existing keys in `server.properties`. Unknown and hidden keys
    /// are ignored; returns how many lines changed. Takes effect on next start.
    pub fn set_properties(&self, changes: &BTreeMap<String, String>) -> Result<usize, ProcessError> {
        properties::update(&self.properties_path(), changes).map_err(|source| ProcessError::Properties {
            server: self.definition.name.clone(),
            source,
        })
    }

    fn properties_path(&self) -> PathBuf {
        self.definition.server_location.join(properties::FILE_NAME)
    }

    // ── backups ──────────────────────────────────────────────

    pub fn start_backup(&self) -> Result<JoinHandle<Result<PathBuf, BackupError>>, BackupError> {
        backup::start(
            &self.definition.name,
            &self.backup_slot,
            &self.definition.server_location,
            &self.definition.backup_location,
        )
    }

    /// `(in_flight, percent)`
    pub fn backup_progress(&self) -> (bool, u8) {
        self.backup_slot.progress()
    }

    pub fn list_backups(&self) -> Result<Vec<String>, BackupError> {
        backup::list_backups(&self.definition.backup_location)
    }

    /// Replace the data directory with the named backup. Destructive; the
    /// caller is expected to stop the server first.
    pub async fn restore(&self, backup_name: &str) -> Result<(), BackupError> {
        if self.is_running() {
            tracing::warn!("Restoring '{}' while it is running", self.definition.name);
        }
        let data_dir = self.definition.server_location.clone();
        let backup_dir = self.definition.backup_location.clone();
        let name = backup_name.to_string();
        tokio::task::spawn_blocking(move || backup::restore(&data_dir, &backup_dir, &name))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcess")
            .field("name", &self.definition.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// `h:mm:ss`
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Blocking line pump for the merged output pipe. Runs until EOF, which
/// arrives once the child and anything it spawned have closed their ends.
fn read_lines(stream: PipeReader, tx: mpsc::UnboundedSender<String>, server: String) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
                if tx.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Console read error for '{}': {}", server, e);
                break;
            }
        }
    }
}
