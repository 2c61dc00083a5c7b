//! Filesystem layout of the Veil data directory.
//!
//! Everything the subsystem persists lives under a single root so tests can
//! point the whole stack at a temporary directory.

use std::path::{Path, PathBuf};

/// Resolved locations of the configuration stores and working directories.
#[derive(Debug, Clone)]
pub struct VeilDirs {
    root: PathBuf,
}

impl VeilDirs {
    /// Anchor the layout at the given root directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root data directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Index of profiles plus the current-profile marker.
    #[must_use]
    pub fn profile_index(&self) -> PathBuf {
        self.root.join("profiles.yaml")
    }

    /// Raw YAML body of one profile.
    #[must_use]
    pub fn profile_file(&self, id: &str) -> PathBuf {
        self.root.join("profiles").join(format!("{id}.yaml"))
    }

    /// Index of override items (source text inline).
    #[must_use]
    pub fn override_index(&self) -> PathBuf {
        self.root.join("overrides.yaml")
    }

    /// App-managed core settings, persisted independently of profiles.
    #[must_use]
    pub fn controlled_file(&self) -> PathBuf {
        self.root.join("controlled.yaml")
    }

    /// Application settings consumed read-only by this subsystem.
    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.yaml")
    }

    /// Directory for override log artifacts and the core's piped output.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Log artifact collecting one override's sandbox output and failures.
    #[must_use]
    pub fn override_log(&self, id: &str) -> PathBuf {
        self.logs_dir().join(format!("override-{id}.log"))
    }

    /// Shared working directory handed to the core process.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    /// Private working directory for one profile (diff-work-dir mode).
    #[must_use]
    pub fn profile_work_dir(&self, id: &str) -> PathBuf {
        self.work_dir().join(id)
    }

    /// Scratch directory used when validating a candidate config.
    #[must_use]
    pub fn check_dir(&self) -> PathBuf {
        self.root.join("check")
    }

    /// PID file recording a core left alive across app restarts.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("core.pid")
    }

    /// Rotating log file receiving the core's piped stdout/stderr.
    #[must_use]
    pub fn core_log(&self) -> PathBuf {
        self.logs_dir().join("core.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_under_one_directory() {
        let dirs = VeilDirs::new("/data/veil");
        assert_eq!(dirs.profile_file("abc"), Path::new("/data/veil/profiles/abc.yaml"));
        assert_eq!(dirs.override_log("x1"), Path::new("/data/veil/logs/override-x1.log"));
        assert_eq!(dirs.profile_work_dir("abc"), Path::new("/data/veil/run/abc"));
        assert!(dirs.pid_file().starts_with(dirs.root()));
    }
}
