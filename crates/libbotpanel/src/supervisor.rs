use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use botpanel_protocol::BotId;

use crate::broker::BroadcastHub;
use crate::error::SupervisorError;
use crate::launch::{LaunchSpec, RunnerConfig, RuntimeInstallConfig};
use crate::output::LineSource;

const READ_CHUNK_BYTES: usize = 4096;
/// How long trailing output is still forwarded after the child has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

pub const MSG_EXITED: &str = "Bot process exited\n";
pub const MSG_STOPPED: &str = "Process forcefully stopped\n";
pub const MSG_NOTHING_TO_STOP: &str = "No running process to stop\n";
pub const MSG_NOT_RUNNING: &str = "Process is not running or cannot receive commands.\n";

#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// Parent of every bot's working directory.
    pub bots_dir: PathBuf,
    pub runner: RunnerConfig,
    pub install: RuntimeInstallConfig,
}

/// What a control operation did. Failures are already reported on the
/// bot's console by the time this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Started { pid: u32, superseded: Option<u32> },
    StartFailed,
    Stopped { pid: u32 },
    StopFailed { pid: u32 },
    NotRunning,
    InputQueued,
    InstallStarted { pid: Option<u32> },
    InstallFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    /// The child has been reaped; trailing output is still being drained.
    Exited,
}

/// The live process bound to one bot.
#[derive(Debug)]
struct ProcessRecord {
    instance: Uuid,
    pid: u32,
    cwd: PathBuf,
    started_at: SystemTime,
    state: ProcessState,
    stdin: Option<mpsc::UnboundedSender<String>>,
}

type Slot = Arc<Mutex<Option<ProcessRecord>>>;

enum ChildRole {
    Service { slot: Slot, instance: Uuid },
    Installer,
}

/// Owns at most one service process per bot and routes its console into
/// the broadcast hub.
///
/// Each bot has its own slot mutex: operations on the same bot are
/// serialized, operations on different bots never wait on each other.
#[derive(Clone)]
pub struct ProcessSupervisor {
    config: Arc<SupervisorConfig>,
    hub: Arc<BroadcastHub>,
    slots: Arc<DashMap<BotId, Slot>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, hub: Arc<BroadcastHub>) -> Self {
        Self {
            config: Arc::new(config),
            hub,
            slots: Arc::new(DashMap::new()),
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn bot_dir(&self, bot_id: &BotId) -> PathBuf {
        self.config.bots_dir.join(bot_id.as_str())
    }

    fn slot(&self, bot_id: &BotId) -> Slot {
        self.slots
            .entry(bot_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Spawn the bot's service process, killing any previous one first.
    /// Returns as soon as the child is spawned.
    pub async fn start(&self, bot_id: &BotId, spec: &LaunchSpec) -> ControlOutcome {
        let slot = self.slot(bot_id);
        let mut guard = slot.lock().await;

        // An exited record's pid is already reaped and may belong to someone else.
        let superseded = guard
            .take()
            .filter(|old| old.state == ProcessState::Running)
            .map(|old| {
                match kill_process_group(old.pid) {
                    Ok(()) => info!(bot_id = %bot_id, pid = old.pid, "superseded running process"),
                    Err(e) => warn!(bot_id = %bot_id, pid = old.pid, error = %e, "kill of superseded process failed"),
                }
                old.pid
            });

        let cwd = self.bot_dir(bot_id);
        let spawned = self
            .config
            .runner
            .resolve(spec)
            .and_then(|resolved| {
                let mut cmd = Command::new(&resolved.program);
                cmd.args(&resolved.args)
                    .current_dir(&cwd)
                    .envs(resolved.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .process_group(0);
                cmd.spawn().map_err(|source| SupervisorError::Spawn {
                    program: resolved.program.clone(),
                    source,
                })
            });

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                drop(guard);
                warn!(bot_id = %bot_id, error = %e, "start failed");
                self.status(bot_id, format!("Failed to start process: {e}\n"))
                    .await;
                return ControlOutcome::StartFailed;
            }
        };

        let Some(pid) = child.id() else {
            drop(guard);
            warn!(bot_id = %bot_id, "child exited before its pid was read");
            self.status(bot_id, "Failed to start process: exited immediately\n")
                .await;
            return ControlOutcome::StartFailed;
        };

        let instance = Uuid::new_v4();
        let stdin = child
            .stdin
            .take()
            .map(|stdin| spawn_stdin_writer(Arc::clone(&self.hub), bot_id.clone(), stdin));
        let out_rx = spawn_output_pumps(&mut child);

        *guard = Some(ProcessRecord {
            instance,
            pid,
            cwd: cwd.clone(),
            started_at: SystemTime::now(),
            state: ProcessState::Running,
            stdin,
        });
        drop(guard);

        tokio::spawn(monitor_child(
            Arc::clone(&self.hub),
            bot_id.clone(),
            child,
            out_rx,
            ChildRole::Service {
                slot: Arc::clone(&slot),
                instance,
            },
        ));

        info!(bot_id = %bot_id, pid, cwd = %cwd.display(), "process started");
        ControlOutcome::Started { pid, superseded }
    }

    /// Kill the bot's process group. Does not wait for the exit.
    pub async fn stop(&self, bot_id: &BotId) -> ControlOutcome {
        let slot = self.slot(bot_id);
        let mut guard = slot.lock().await;

        let record = match guard.take() {
            Some(record) if record.state == ProcessState::Running => record,
            other => {
                *guard = other;
                drop(guard);
                self.status(bot_id, MSG_NOTHING_TO_STOP).await;
                return ControlOutcome::NotRunning;
            }
        };

        let result = kill_process_group(record.pid);
        drop(guard);

        match result {
            Ok(()) => {
                info!(bot_id = %bot_id, pid = record.pid, "process stopped");
                self.status(bot_id, MSG_STOPPED).await;
                ControlOutcome::Stopped { pid: record.pid }
            }
            Err(e) => {
                warn!(bot_id = %bot_id, pid = record.pid, error = %e, "stop failed");
                self.status(bot_id, format!("Failed to stop process: {e}\n"))
                    .await;
                ControlOutcome::StopFailed { pid: record.pid }
            }
        }
    }

    /// Run the runtime installer for `version`. Untracked: several installs
    /// may run at once, and none of them blocks start/stop.
    pub async fn install_runtime(&self, bot_id: &BotId, version: &str) -> ControlOutcome {
        let spawned = self.config.install.render(version).and_then(|script| {
            Command::new("bash")
                .arg("-c")
                .arg(&script)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|source| SupervisorError::Spawn {
                    program: "bash".to_string(),
                    source,
                })
        });

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(bot_id = %bot_id, version, error = %e, "runtime install failed to start");
                self.status(bot_id, format!("Failed to start runtime install: {e}\n"))
                    .await;
                return ControlOutcome::InstallFailed;
            }
        };

        let pid = child.id();
        let out_rx = spawn_output_pumps(&mut child);
        tokio::spawn(monitor_child(
            Arc::clone(&self.hub),
            bot_id.clone(),
            child,
            out_rx,
            ChildRole::Installer,
        ));

        info!(bot_id = %bot_id, version, pid = ?pid, "runtime install started");
        ControlOutcome::InstallStarted { pid }
    }

    /// Queue `line` for the bot's stdin and echo it to the console.
    pub async fn send_input(&self, bot_id: &BotId, line: &str) -> ControlOutcome {
        let queued = {
            let slot = self.slot(bot_id);
            let guard = slot.lock().await;
            match guard.as_ref() {
                Some(record) if record.state == ProcessState::Running => record
                    .stdin
                    .as_ref()
                    .is_some_and(|tx| tx.send(format!("{line}\n")).is_ok()),
                _ => false,
            }
        };

        if queued {
            self.status(bot_id, format!("> {line}\n")).await;
            ControlOutcome::InputQueued
        } else {
            debug!(bot_id = %bot_id, "input for a bot that is not running");
            self.status(bot_id, MSG_NOT_RUNNING).await;
            ControlOutcome::NotRunning
        }
    }

    /// Pid of the bot's live service process, if any.
    pub async fn running_pid(&self, bot_id: &BotId) -> Option<u32> {
        let slot = self.slots.get(bot_id).map(|s| s.clone())?;
        let guard = slot.lock().await;
        guard
            .as_ref()
            .filter(|r| r.state == ProcessState::Running)
            .map(|r| r.pid)
    }

    /// Every bot with a live service process, sorted by name.
    pub async fn running(&self) -> Vec<(BotId, u32)> {
        let slots: Vec<(BotId, Slot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut running = Vec::new();
        for (bot_id, slot) in slots {
            let guard = slot.lock().await;
            if let Some(record) = guard.as_ref().filter(|r| r.state == ProcessState::Running) {
                debug!(
                    bot_id = %bot_id,
                    pid = record.pid,
                    cwd = %record.cwd.display(),
                    uptime_s = record.started_at.elapsed().unwrap_or_default().as_secs(),
                    "running"
                );
                running.push((bot_id, record.pid));
            }
        }
        running.sort();
        running
    }

    /// Kill every tracked process group. Used on service shutdown.
    pub async fn shutdown_all(&self) -> usize {
        let slots: Vec<(BotId, Slot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut killed = 0;
        for (bot_id, slot) in slots {
            let Some(record) = slot
                .lock()
                .await
                .take()
                .filter(|r| r.state == ProcessState::Running)
            else {
                continue;
            };
            match kill_process_group(record.pid) {
                Ok(()) => killed += 1,
                Err(e) => warn!(bot_id = %bot_id, pid = record.pid, error = %e, "kill on shutdown failed"),
            }
        }
        info!(killed, "supervisor shut down");
        killed
    }

    async fn status(&self, bot_id: &BotId, text: impl Into<String>) {
        self.hub.publish(bot_id, LineSource::Status, text).await;
    }
}

/// SIGKILL the process group led by `pid`, falling back to the pid alone
/// when the group is already gone.
fn kill_process_group(pid: u32) -> Result<(), SupervisorError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| SupervisorError::Signal {
        pid,
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })?;

    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(-raw, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let group_err = std::io::Error::last_os_error();

    // SAFETY: as above.
    if unsafe { libc::kill(raw, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    Err(SupervisorError::Signal {
        pid,
        source: group_err,
    })
}

fn spawn_output_pumps(child: &mut Child) -> mpsc::UnboundedReceiver<(LineSource, String)> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_output(stdout, LineSource::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_output(stderr, LineSource::Stderr, tx));
    }
    rx
}

async fn pump_output<R>(
    mut reader: R,
    source: LineSource,
    tx: mpsc::UnboundedSender<(LineSource, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                if tx.send((source, text)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(source = ?source, error = %e, "output read error");
                break;
            }
        }
    }
}

fn spawn_stdin_writer(
    hub: Arc<BroadcastHub>,
    bot_id: BotId,
    mut stdin: ChildStdin,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let written = match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                debug!(bot_id = %bot_id, error = %e, "stdin write failed");
                hub.publish(
                    &bot_id,
                    LineSource::Status,
                    format!("Failed to write to process: {e}\n"),
                )
                .await;
                break;
            }
        }
    });
    tx
}

/// Single writer for one child's console: forwards output chunks in arrival
/// order, then reports the exit once the streams drain.
async fn monitor_child(
    hub: Arc<BroadcastHub>,
    bot_id: BotId,
    mut child: Child,
    mut out_rx: mpsc::UnboundedReceiver<(LineSource, String)>,
    role: ChildRole,
) {
    let mut exit: Option<std::io::Result<ExitStatus>> = None;
    let mut drain_deadline: Option<Instant> = None;
    let mut streams_open = true;

    while streams_open || exit.is_none() {
        tokio::select! {
            chunk = out_rx.recv(), if streams_open => match chunk {
                Some((source, text)) => {
                    hub.publish(&bot_id, source, text).await;
                }
                None => streams_open = false,
            },
            status = child.wait(), if exit.is_none() => {
                if let ChildRole::Service { slot, instance } = &role {
                    mark_exited(slot, *instance).await;
                }
                exit = Some(status);
                drain_deadline = Some(Instant::now() + EXIT_DRAIN_GRACE);
            },
            _ = sleep_until_opt(drain_deadline), if exit.is_some() && streams_open => {
                debug!(bot_id = %bot_id, "output still open after exit, stop draining");
                break;
            }
        }
    }

    let exit = exit.unwrap_or_else(|| Err(std::io::Error::other("exit status unavailable")));
    match role {
        ChildRole::Service { slot, instance } => {
            let mut guard = slot.lock().await;
            if guard.as_ref().is_some_and(|r| r.instance == instance) {
                *guard = None;
            }
            drop(guard);
            info!(bot_id = %bot_id, status = %describe_exit(&exit), "process exited");
            hub.publish(&bot_id, LineSource::Status, MSG_EXITED).await;
        }
        ChildRole::Installer => {
            info!(bot_id = %bot_id, status = %describe_exit(&exit), "runtime install finished");
            hub.publish(
                &bot_id,
                LineSource::Status,
                format!("Runtime install finished ({})\n", describe_exit(&exit)),
            )
            .await;
        }
    }
}

async fn mark_exited(slot: &Slot, instance: Uuid) {
    let mut guard = slot.lock().await;
    if let Some(record) = guard.as_mut().filter(|r| r.instance == instance) {
        record.state = ProcessState::Exited;
        record.stdin = None;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn describe_exit(exit: &std::io::Result<ExitStatus>) -> String {
    use std::os::unix::process::ExitStatusExt;

    match exit {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("killed by signal {signal}"),
            (None, None) => "unknown status".to_string(),
        },
        Err(e) => format!("wait failed: {e}"),
    }
}
