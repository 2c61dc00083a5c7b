//! Wires the store, event bus, platform strategy, and core supervisor
//! together and runs until a shutdown signal arrives.

use std::path::{Path, PathBuf};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use veil_config::{ConfigStore, VeilDirs};
use veil_engine::{CoreManager, CoreManagerOptions};
use veil_events::{CorePhase, EventBus};

use crate::error::{AppError, AppResult};
use crate::logging::{LoggingConfig, init_logging};

/// Environment override for the data directory.
const DATA_DIR_ENV: &str = "VEIL_DATA_DIR";
/// Environment override for the directory holding core binaries.
const CORE_DIR_ENV: &str = "VEIL_CORE_DIR";

/// Boot the manager and block until shutdown.
///
/// A failed initial core start is logged but not fatal: the store stays
/// reachable so a broken profile or settings entry can be corrected and the
/// core started again.
///
/// # Errors
///
/// Returns an error when logging, the data directory, or the config store
/// cannot be set up, or when signal handling fails.
pub async fn run_app() -> AppResult<()> {
    init_logging(&LoggingConfig::default())?;

    let data_root = data_root_from(env_path(DATA_DIR_ENV), dirs::data_dir())?;
    let core_dir = core_dir_from(env_path(CORE_DIR_ENV), &data_root);
    info!(
        data_root = %data_root.display(),
        core_dir = %core_dir.display(),
        "starting veil"
    );

    let store = ConfigStore::open(VeilDirs::new(&data_root))
        .await
        .map_err(|source| AppError::config("store.open", source))?;
    let bus = EventBus::new();
    let event_logger = spawn_event_logger(&bus);

    let manager = CoreManager::spawn(
        store.clone(),
        veil_engine::detect(),
        bus.clone(),
        CoreManagerOptions::new(core_dir),
    );
    if let Err(error) = manager.start().await {
        error!(%error, "initial core start failed, waiting for corrected settings");
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|source| AppError::Signal { source })?;
    info!("shutdown signal received");

    let settings = store
        .app_settings()
        .await
        .map_err(|source| AppError::config("store.app_settings", source))?;
    if settings.keep_core_alive && manager.phase() == CorePhase::Running {
        info!("leaving core running per keep-alive setting");
    } else {
        manager
            .stop(true)
            .await
            .map_err(|source| AppError::engine("manager.stop", source))?;
    }

    event_logger.abort();
    info!("veil shutdown complete");
    Ok(())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name).map(PathBuf::from)
}

fn data_root_from(explicit: Option<PathBuf>, user_dir: Option<PathBuf>) -> AppResult<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    user_dir
        .map(|dir| dir.join("veil"))
        .ok_or(AppError::MissingDataDir)
}

fn core_dir_from(explicit: Option<PathBuf>, data_root: &Path) -> PathBuf {
    explicit.unwrap_or_else(|| data_root.join("bin"))
}

/// Mirror every bus event into the application log at debug level.
fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut events = bus.subscribe(None);
    tokio::spawn(async move {
        while let Some(envelope) = events.next().await {
            debug!(id = envelope.id, kind = envelope.event.kind(), "event");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_data_dir_wins_over_the_user_directory() -> AppResult<()> {
        let root = data_root_from(
            Some(PathBuf::from("/custom/data")),
            Some(PathBuf::from("/home/user/.local/share")),
        )?;
        assert_eq!(root, PathBuf::from("/custom/data"));
        Ok(())
    }

    #[test]
    fn user_directory_gets_the_app_suffix() -> AppResult<()> {
        let root = data_root_from(None, Some(PathBuf::from("/home/user/.local/share")))?;
        assert_eq!(root, PathBuf::from("/home/user/.local/share/veil"));
        Ok(())
    }

    #[test]
    fn missing_directories_are_an_error() {
        assert!(matches!(
            data_root_from(None, None),
            Err(AppError::MissingDataDir)
        ));
    }

    #[test]
    fn core_dir_defaults_next_to_the_data_root() {
        let data_root = PathBuf::from("/data/veil");
        assert_eq!(
            core_dir_from(None, &data_root),
            PathBuf::from("/data/veil/bin")
        );
        assert_eq!(
            core_dir_from(Some(PathBuf::from("/opt/cores")), &data_root),
            PathBuf::from("/opt/cores")
        );
    }
}
