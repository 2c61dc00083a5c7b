//! Core process supervisor.
//!
//! Owns the external core process end to end: config synthesis and
//! validation, spawn with platform IPC flags, stdout readiness scanning,
//! crash recovery with a bounded budget, and stream/API wiring. All process
//! state lives in one worker task; handles only queue commands, so child
//! handling never races.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use veil_api::{ApiClient, EndpointSource, FrameSource, IpcEndpoint, StreamKind, StreamSupervisor, WsFrameSource};
use veil_config::{AppSettings, ConfigStore, ConfigSynthesizer, RuntimeConfig, VeilDirs};
use veil_events::{CorePhase, Event, EventBus};

use crate::error::{EngineError, EngineResult};
use crate::pidfile;
use crate::platform::Platform;
use crate::validate;

/// Stdout line announcing the control API is listening.
///
/// These signal strings are a versioned contract with the core binary;
/// revalidate them against the target core's actual output when bumping
/// the bundled core version.
pub const READY_SIGNAL: &str = "RESTful API listening";
/// Stdout line announcing providers finished their initial load.
pub const PROVIDERS_SIGNAL: &str = "Initial configuration complete";
/// Stdout fragment identifying a TUN setup attempt.
pub const TUN_SIGNAL: &str = "configure tun interface";
/// Stdout line announcing the control listener failed to bind.
pub const LISTEN_ERROR_SIGNAL: &str = "External controller listen error";

/// Automatic restarts granted after unexpected exits.
const CRASH_BUDGET: u8 = 10;
/// Attempts one `restart()` call makes before giving up.
const RESTART_ATTEMPTS: u32 = 3;
/// Size at which the core's log file is rotated aside.
const CORE_LOG_ROTATE_BYTES: u64 = 4 * 1024 * 1024;

const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Tunables for the supervisor; the defaults suit production use.
#[derive(Debug, Clone)]
pub struct CoreManagerOptions {
    /// Directory holding the core binaries named by `AppSettings.core_name`.
    pub core_dir: PathBuf,
    /// Probes against the control API after readiness.
    pub api_poll_attempts: u32,
    /// Pause between control API probes.
    pub api_poll_interval: Duration,
    /// How often the worker checks the child for an exit.
    pub exit_poll_interval: Duration,
    /// Window for the readiness signals to appear on stdout.
    pub ready_timeout: Duration,
    /// Base pause between restart attempts, growing linearly.
    pub restart_backoff: Duration,
}

impl CoreManagerOptions {
    /// Defaults with the given core directory.
    #[must_use]
    pub const fn new(core_dir: PathBuf) -> Self {
        Self {
            core_dir,
            api_poll_attempts: 10,
            api_poll_interval: Duration::from_millis(200),
            exit_poll_interval: Duration::from_millis(250),
            ready_timeout: Duration::from_secs(30),
            restart_backoff: Duration::from_millis(500),
        }
    }
}

/// Signal classes recognised on the core's stdout.
#[derive(Debug, PartialEq, Eq)]
enum LineSignal {
    Ready,
    ProvidersInitialized,
    TunPermission,
    ListenError,
    Other,
}

fn classify_line(line: &str) -> LineSignal {
    if line.contains(LISTEN_ERROR_SIGNAL) {
        LineSignal::ListenError
    } else if line.contains(TUN_SIGNAL)
        && (line.contains("operation not permitted") || line.contains("permission denied"))
    {
        LineSignal::TunPermission
    } else if line.contains(READY_SIGNAL) {
        LineSignal::Ready
    } else if line.contains(PROVIDERS_SIGNAL) {
        LineSignal::ProvidersInitialized
    } else {
        LineSignal::Other
    }
}

#[derive(Default)]
struct SharedState {
    endpoint: Mutex<Option<IpcEndpoint>>,
    phase: Mutex<PhaseCell>,
}

struct PhaseCell(CorePhase);

impl Default for PhaseCell {
    fn default() -> Self {
        Self(CorePhase::Stopped)
    }
}

struct CoreEndpoint {
    shared: Arc<SharedState>,
}

#[async_trait]
impl EndpointSource for CoreEndpoint {
    async fn current(&self) -> Option<IpcEndpoint> {
        self.shared
            .endpoint
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

enum CoreCommand {
    Start {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Stop {
        force: bool,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Restart {
        reply: oneshot::Sender<EngineResult<()>>,
    },
}

/// Handle to the core supervisor worker.
///
/// Cheap to clone; all clones drive the same core process.
#[derive(Clone)]
pub struct CoreManager {
    commands: mpsc::Sender<CoreCommand>,
    restarting: Arc<AtomicBool>,
    shared: Arc<SharedState>,
    endpoints: Arc<dyn EndpointSource>,
    api: Arc<ApiClient>,
}

impl CoreManager {
    /// Spawn the supervisor with the production WebSocket frame source.
    #[must_use]
    pub fn spawn(
        store: ConfigStore,
        platform: Arc<dyn Platform>,
        bus: EventBus,
        options: CoreManagerOptions,
    ) -> Self {
        Self::with_frame_source(store, platform, bus, options, Arc::new(WsFrameSource))
    }

    /// Spawn with a custom frame source, the seam the stream tests use.
    #[must_use]
    pub fn with_frame_source(
        store: ConfigStore,
        platform: Arc<dyn Platform>,
        bus: EventBus,
        options: CoreManagerOptions,
        frames: Arc<dyn FrameSource>,
    ) -> Self {
        let shared = Arc::new(SharedState::default());
        let endpoints: Arc<dyn EndpointSource> = Arc::new(CoreEndpoint {
            shared: Arc::clone(&shared),
        });
        let api = Arc::new(ApiClient::new(Arc::clone(&endpoints)));

        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let worker = CoreWorker {
            synthesizer: ConfigSynthesizer::new(store.clone()),
            store,
            platform,
            bus,
            api: Arc::clone(&api),
            endpoints: Arc::clone(&endpoints),
            frames,
            options,
            shared: Arc::clone(&shared),
            child: None,
            streams: Vec::new(),
            crash_budget: CRASH_BUDGET,
        };
        tokio::spawn(worker.run(receiver));

        Self {
            commands,
            restarting: Arc::new(AtomicBool::new(false)),
            shared,
            endpoints,
            api,
        }
    }

    /// Synthesize, validate, spawn, and await readiness.
    ///
    /// # Errors
    /// Returns an error when synthesis, validation, spawning, or the
    /// readiness scan fails, or when the worker has shut down.
    pub async fn start(&self) -> EngineResult<()> {
        self.request("start", |reply| CoreCommand::Start { reply })
            .await?
    }

    /// Stop the core. A forced stop skips OS network-state recovery; it is
    /// used when the application itself is terminating.
    ///
    /// # Errors
    /// Returns an error when the PID file cannot be removed or the worker
    /// has shut down.
    pub async fn stop(&self, force: bool) -> EngineResult<()> {
        self.request("stop", |reply| CoreCommand::Stop { force, reply })
            .await?
    }

    /// Full stop-then-start cycle with up to three attempts.
    ///
    /// Idempotent under concurrency: while one restart is in flight, other
    /// callers no-op and get `Ok(false)`.
    ///
    /// # Errors
    /// Returns an error when every attempt of the cycle fails or the
    /// worker has shut down.
    pub async fn restart(&self) -> EngineResult<bool> {
        if self.restarting.swap(true, Ordering::SeqCst) {
            debug!("restart already in flight, collapsing to no-op");
            return Ok(false);
        }
        let result = self
            .request("restart", |reply| CoreCommand::Restart { reply })
            .await;
        self.restarting.store(false, Ordering::SeqCst);
        result?.map(|()| true)
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> CorePhase {
        self.shared
            .phase
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .0
    }

    /// Control endpoint of the running core, if any.
    #[must_use]
    pub fn endpoint(&self) -> Option<IpcEndpoint> {
        self.shared
            .endpoint
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Endpoint source bound to this supervisor, for extra API consumers.
    #[must_use]
    pub fn endpoint_source(&self) -> Arc<dyn EndpointSource> {
        Arc::clone(&self.endpoints)
    }

    /// Control-plane client bound to this supervisor's endpoint.
    #[must_use]
    pub fn api(&self) -> Arc<ApiClient> {
        Arc::clone(&self.api)
    }

    async fn request<T>(
        &self,
        operation: &'static str,
        build: impl FnOnce(oneshot::Sender<T>) -> CoreCommand,
    ) -> EngineResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::SupervisorClosed { operation })?;
        response
            .await
            .map_err(|_| EngineError::SupervisorClosed { operation })
    }
}

struct CoreWorker {
    store: ConfigStore,
    synthesizer: ConfigSynthesizer,
    platform: Arc<dyn Platform>,
    bus: EventBus,
    api: Arc<ApiClient>,
    endpoints: Arc<dyn EndpointSource>,
    frames: Arc<dyn FrameSource>,
    options: CoreManagerOptions,
    shared: Arc<SharedState>,
    child: Option<Child>,
    streams: Vec<StreamSupervisor>,
    crash_budget: u8,
}

impl CoreWorker {
    async fn run(mut self, mut receiver: mpsc::Receiver<CoreCommand>) {
        let mut ticker = tokio::time::interval(self.options.exit_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = receiver.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick() => self.poll_child().await,
            }
        }
        debug!("core supervisor worker exiting");
    }

    async fn handle(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::Start { reply } => {
                let _ = reply.send(self.start_op().await);
            }
            CoreCommand::Stop { force, reply } => {
                let _ = reply.send(self.stop_op(force).await);
            }
            CoreCommand::Restart { reply } => {
                let _ = reply.send(self.restart_op().await);
            }
        }
    }

    /// Detect unexpected exits between commands. Intentional stops clear
    /// the child before resetting the phase, so anything observed here
    /// while not stopping is a crash. The crash and every failed comeback
    /// attempt spend one unit of the budget; a start that reaches
    /// `Running` refills it.
    async fn poll_child(&mut self) {
        let status = match &mut self.child {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => return,
                Err(error) => {
                    warn!(%error, "failed to poll core process");
                    return;
                }
            },
            None => return,
        };
        self.child = None;
        if matches!(self.phase(), CorePhase::Stopping | CorePhase::Stopped) {
            return;
        }

        self.stop_streams();
        self.clear_endpoint().await;
        self.crash_budget = self.crash_budget.saturating_sub(1);
        warn!(
            code = ?status.code(),
            remaining = self.crash_budget,
            "core exited unexpectedly"
        );
        self.bus.publish(Event::CoreCrashed {
            code: status.code(),
            remaining_budget: self.crash_budget,
        });

        loop {
            if self.crash_budget == 0 {
                self.bus.publish(Event::CoreRetriesExhausted);
                self.set_phase(CorePhase::Stopped);
                return;
            }
            self.set_phase(CorePhase::Restarting);
            match self.start_op().await {
                Ok(()) => return,
                Err(error) => {
                    self.crash_budget = self.crash_budget.saturating_sub(1);
                    warn!(
                        %error,
                        remaining = self.crash_budget,
                        "automatic restart after crash failed"
                    );
                    tokio::time::sleep(self.options.restart_backoff).await;
                }
            }
        }
    }

    async fn start_op(&mut self) -> EngineResult<()> {
        let result = self.start_cycle().await;
        if result.is_err() {
            self.shutdown_child().await;
            self.clear_endpoint().await;
            self.set_phase(CorePhase::Stopped);
        }
        result
    }

    async fn start_cycle(&mut self) -> EngineResult<()> {
        self.set_phase(CorePhase::Preparing);
        let settings = self.store.app_settings().await?;
        let dirs = self.store.dirs().clone();
        pidfile::kill_stale(&dirs.pid_file()).await?;

        let runtime = self.synthesizer.synthesize().await?;
        self.bus.publish(Event::ConfigSynthesized {
            profile_id: runtime.profile_id.clone(),
        });

        let core_path = self.options.core_dir.join(&settings.core_name);
        validate::check_config(&core_path, &runtime.path, &dirs.check_dir(), &runtime.profile_id)
            .await?;

        // Replace any instance we are already running.
        self.stop_streams();
        self.shutdown_child().await;

        let endpoint = self.platform.ipc_endpoint(std::process::id());
        self.cleanup_endpoint(&endpoint).await;

        let mut retried = false;
        loop {
            match self
                .spawn_and_await_ready(&core_path, &runtime, &endpoint, &settings, &dirs)
                .await
            {
                Err(EngineError::ListenError { line })
                    if !retried && self.platform.on_listen_error(&endpoint) =>
                {
                    debug!(%line, "retrying spawn after listener cleanup");
                    retried = true;
                    self.shutdown_child().await;
                    self.cleanup_endpoint(&endpoint).await;
                }
                outcome => break outcome,
            }
        }?;

        self.set_endpoint(endpoint.clone()).await;
        self.poll_api_root().await;
        self.start_streams().await;
        // A start that gets this far restores the full crash budget.
        self.crash_budget = CRASH_BUDGET;
        self.set_phase(CorePhase::Running);

        let pid = self.child.as_ref().and_then(Child::id).unwrap_or_default();
        info!(%pid, %endpoint, "core is running");
        self.bus.publish(Event::CoreReady {
            pid,
            ipc_address: endpoint.to_string(),
        });
        Ok(())
    }

    async fn spawn_and_await_ready(
        &mut self,
        core_path: &std::path::Path,
        runtime: &RuntimeConfig,
        endpoint: &IpcEndpoint,
        settings: &AppSettings,
        dirs: &VeilDirs,
    ) -> EngineResult<()> {
        self.set_phase(CorePhase::Spawned);
        let log = open_core_log(dirs).await?;

        let mut command = Command::new(core_path);
        command
            .arg("-d")
            .arg(&runtime.work_dir)
            .arg(self.platform.control_flag())
            .arg(endpoint.flag_value())
            .stderr(log_stdio(&log).await?)
            .kill_on_drop(!settings.keep_core_alive);
        if settings.keep_core_alive {
            // A detached core must not hold a pipe to this process: once we
            // exit, the next write to a closed pipe kills it with SIGPIPE.
            // It writes straight into the log file instead.
            command.stdout(log_stdio(&log).await?);
        } else {
            command.stdout(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|source| EngineError::Process {
            operation: "spawn_core",
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        self.platform.apply_priority(pid);

        if settings.keep_core_alive {
            pidfile::write(&dirs.pid_file(), pid).await?;
            self.child = Some(child);
            // No stdout pipe in detached mode, so readiness rests on the
            // exit poll and the API probe instead of the stdout contract.
            self.set_phase(CorePhase::AwaitingReady);
            return Ok(());
        }

        let stdout = child.stdout.take();
        self.child = Some(child);
        let Some(stdout) = stdout else {
            return Err(EngineError::Process {
                operation: "capture_core_stdout",
                source: std::io::Error::other("stdout was not piped"),
            });
        };

        self.set_phase(CorePhase::AwaitingReady);
        self.scan_readiness(stdout, log).await
    }

    /// Scan stdout for the readiness contract, mirroring every line into
    /// the core log. Success requires the API-listening line followed by
    /// the providers line.
    async fn scan_readiness(
        &mut self,
        stdout: ChildStdout,
        mut log: tokio::fs::File,
    ) -> EngineResult<()> {
        let mut lines = BufReader::new(stdout).lines();
        let deadline = Instant::now() + self.options.ready_timeout;
        let mut api_listening = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::ReadinessTimeout);
            }
            let line = match timeout(remaining, lines.next_line()).await {
                Err(_) => return Err(EngineError::ReadinessTimeout),
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    let code = self.child.as_mut().and_then(|child| {
                        child
                            .try_wait()
                            .ok()
                            .flatten()
                            .and_then(|status| status.code())
                    });
                    return Err(EngineError::ExitedEarly { code });
                }
                Ok(Err(source)) => {
                    return Err(EngineError::Process {
                        operation: "read_core_stdout",
                        source,
                    });
                }
            };
            append_core_log(&mut log, &line).await;

            match classify_line(&line) {
                LineSignal::TunPermission => {
                    warn!(%line, "core rejected TUN, disabling it");
                    self.store.disable_tun().await?;
                    self.bus.publish(Event::TunDisabled {
                        reason: line.clone(),
                    });
                    return Err(EngineError::TunPermission { reason: line });
                }
                LineSignal::ListenError => {
                    return Err(EngineError::ListenError { line });
                }
                LineSignal::Ready => {
                    debug!("core control API is listening");
                    api_listening = true;
                }
                LineSignal::ProvidersInitialized if api_listening => break,
                LineSignal::ProvidersInitialized | LineSignal::Other => {}
            }
        }

        // Keep the pipe drained and the log fed for the core's lifetime.
        tokio::spawn(drain_stdout(lines, log));
        Ok(())
    }

    /// Bounded probe of the control API after readiness. Exhaustion is
    /// logged, not fatal: the stdout contract already proved liveness.
    async fn poll_api_root(&self) {
        for attempt in 1..=self.options.api_poll_attempts {
            match self.api.version().await {
                Ok(version) => {
                    debug!(version = %version.version, "core control plane responding");
                    return;
                }
                Err(error) if error.is_retryable() => {
                    debug!(attempt, %error, "control plane not responding yet");
                }
                Err(error) => {
                    warn!(%error, "control plane probe failed");
                    return;
                }
            }
            tokio::time::sleep(self.options.api_poll_interval).await;
        }
        warn!("control plane did not respond within the polling budget");
    }

    async fn start_streams(&mut self) {
        self.stop_streams();
        let debug_logs = self
            .store
            .controlled()
            .await
            .is_ok_and(|controlled| controlled.log_level() == Some("debug"));
        let level = if debug_logs { "debug" } else { "info" }.to_string();
        let kinds = [
            StreamKind::Traffic,
            StreamKind::Memory,
            StreamKind::Logs { level },
            StreamKind::Connections,
        ];
        for kind in kinds {
            self.streams.push(StreamSupervisor::spawn(
                kind,
                Arc::clone(&self.endpoints),
                Arc::clone(&self.frames),
                self.bus.clone(),
            ));
        }
    }

    fn stop_streams(&mut self) {
        for stream in self.streams.drain(..) {
            stream.stop();
        }
    }

    async fn stop_op(&mut self, force: bool) -> EngineResult<()> {
        self.set_phase(CorePhase::Stopping);
        self.stop_streams();
        if !force {
            self.platform.recover_network();
        }
        self.shutdown_child().await;
        if let Some(endpoint) = self.endpoint() {
            self.cleanup_endpoint(&endpoint).await;
        }
        self.clear_endpoint().await;
        pidfile::remove(&self.store.dirs().pid_file()).await?;
        self.set_phase(CorePhase::Stopped);
        Ok(())
    }

    async fn restart_op(&mut self) -> EngineResult<()> {
        self.stop_op(false).await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.start_op().await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < RESTART_ATTEMPTS => {
                    warn!(attempt, %error, "restart attempt failed");
                    tokio::time::sleep(self.options.restart_backoff * attempt).await;
                }
                Err(error) => {
                    warn!(attempt, %error, "restart attempts exhausted");
                    return Err(EngineError::RetryExhausted { attempts: attempt });
                }
            }
        }
    }

    async fn shutdown_child(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Err(error) = child.kill().await
        {
            warn!(%error, "failed to terminate core process");
        }
    }

    async fn cleanup_endpoint(&self, endpoint: &IpcEndpoint) {
        let Some(path) = self.platform.endpoint_artifact(endpoint) else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed stale endpoint artifact"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(path = %path.display(), %error, "failed to remove endpoint artifact"),
        }
    }

    fn phase(&self) -> CorePhase {
        self.shared
            .phase
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .0
    }

    fn set_phase(&self, phase: CorePhase) {
        {
            let mut cell = self
                .shared
                .phase
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if cell.0 == phase {
                return;
            }
            cell.0 = phase;
        }
        self.bus.publish(Event::CorePhaseChanged { phase });
    }

    fn endpoint(&self) -> Option<IpcEndpoint> {
        self.shared
            .endpoint
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    async fn set_endpoint(&self, endpoint: IpcEndpoint) {
        *self
            .shared
            .endpoint
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(endpoint);
        self.api.invalidate().await;
    }

    async fn clear_endpoint(&self) {
        *self
            .shared
            .endpoint
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.api.invalidate().await;
    }
}

async fn open_core_log(dirs: &VeilDirs) -> EngineResult<tokio::fs::File> {
    let logs_dir = dirs.logs_dir();
    tokio::fs::create_dir_all(&logs_dir)
        .await
        .map_err(|error| EngineError::io("create_logs_dir", &logs_dir, error))?;

    let path = dirs.core_log();
    if let Ok(metadata) = tokio::fs::metadata(&path).await
        && metadata.len() > CORE_LOG_ROTATE_BYTES
    {
        let rotated = path.with_extension("log.old");
        if let Err(error) = tokio::fs::rename(&path, &rotated).await {
            warn!(%error, "failed to rotate core log");
        }
    }

    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|error| EngineError::io("open_core_log", &path, error))
}

/// Duplicate the log file handle as a `Stdio` for the child process.
async fn log_stdio(log: &tokio::fs::File) -> EngineResult<Stdio> {
    let clone = log
        .try_clone()
        .await
        .map_err(|source| EngineError::Process {
            operation: "clone_core_log",
            source,
        })?;
    Ok(Stdio::from(clone.into_std().await))
}

async fn append_core_log(log: &mut tokio::fs::File, line: &str) {
    if log.write_all(line.as_bytes()).await.is_err() || log.write_all(b"\n").await.is_err() {
        debug!("failed to append to core log");
    }
}

async fn drain_stdout(mut lines: Lines<BufReader<ChildStdout>>, mut log: tokio::fs::File) {
    while let Ok(Some(line)) = lines.next_line().await {
        append_core_log(&mut log, &line).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_errors_outrank_everything() {
        let line = "External controller listen error: listen tcp bind failed";
        assert_eq!(classify_line(line), LineSignal::ListenError);
    }

    #[test]
    fn tun_rejection_requires_a_permission_hint() {
        let rejected = "configure tun interface: operation not permitted";
        assert_eq!(classify_line(rejected), LineSignal::TunPermission);

        let benign = "configure tun interface: done";
        assert_eq!(classify_line(benign), LineSignal::Other);
    }

    #[test]
    fn readiness_lines_classify_in_order() {
        let listening = r#"level=info msg="RESTful API listening at: unix:///tmp/x.sock""#;
        assert_eq!(classify_line(listening), LineSignal::Ready);

        let providers = "Initial configuration complete, total time: 12ms";
        assert_eq!(classify_line(providers), LineSignal::ProvidersInitialized);

        assert_eq!(classify_line("plain log noise"), LineSignal::Other);
    }
}
