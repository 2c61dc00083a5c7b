//! End-to-end supervisor tests against a scripted stand-in core binary.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use veil_api::{ApiResult, FrameSource, FrameStream, IpcEndpoint, StreamKind};
use veil_config::{AppSettings, ConfigStore, ProfileMeta, VeilDirs};
use veil_engine::platform::UnixPlatform;
use veil_engine::{CoreManager, CoreManagerOptions, EngineError};
use veil_events::{CorePhase, Event, EventBus, EventStream};

const EVENT_DEADLINE: Duration = Duration::from_secs(30);

/// Frame source whose streams never produce anything, keeping telemetry
/// quiet while the lifecycle is exercised.
struct IdleFrames;

#[async_trait]
impl FrameSource for IdleFrames {
    async fn open(
        &self,
        _endpoint: &IpcEndpoint,
        _kind: &StreamKind,
    ) -> ApiResult<Box<dyn FrameStream>> {
        Ok(Box::new(IdleStream))
    }
}

struct IdleStream;

#[async_trait]
impl FrameStream for IdleStream {
    async fn next_frame(&mut self) -> Option<String> {
        std::future::pending().await
    }
}

/// Install a shell script standing in for the core binary.
///
/// Validation runs (`-t ...`) are handled by the script header; `body`
/// scripts the real launch. `runs.log` next to the binary counts launches.
async fn install_core(dir: &Path, body: &str) -> anyhow::Result<()> {
    let path = dir.join("mihomo");
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"-t\" ]; then exit 0; fi\n\
         echo run >> \"$(dirname \"$0\")/runs.log\"\n{body}"
    );
    tokio::fs::write(&path, script).await?;
    let mut perms = tokio::fs::metadata(&path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(&path, perms).await?;
    Ok(())
}

const HEALTHY_CORE: &str = "echo 'RESTful API listening at: unix socket'\n\
                            echo 'Initial configuration complete, total time: 1ms'\n\
                            exec sleep 30\n";

async fn seeded_store(root: &Path) -> anyhow::Result<ConfigStore> {
    let store = ConfigStore::open(VeilDirs::new(root.join("data"))).await?;
    store
        .upsert_profile(
            ProfileMeta {
                id: "main".to_string(),
                name: "Main".to_string(),
                override_ids: Vec::new(),
                rules: None,
            },
            "mixed-port: 7890\n".to_string(),
        )
        .await?;
    store.set_current("main").await?;
    Ok(store)
}

fn fast_options(core_dir: PathBuf) -> CoreManagerOptions {
    let mut options = CoreManagerOptions::new(core_dir);
    options.api_poll_attempts = 1;
    options.api_poll_interval = Duration::from_millis(10);
    options.exit_poll_interval = Duration::from_millis(50);
    options.ready_timeout = Duration::from_secs(10);
    options.restart_backoff = Duration::from_millis(20);
    options
}

fn manager(store: ConfigStore, bus: EventBus, core_dir: PathBuf) -> CoreManager {
    CoreManager::with_frame_source(
        store,
        Arc::new(UnixPlatform::new()),
        bus,
        fast_options(core_dir),
        Arc::new(IdleFrames),
    )
}

async fn wait_for(events: &mut EventStream, pick: impl Fn(&Event) -> bool) -> Event {
    tokio::time::timeout(EVENT_DEADLINE, async {
        loop {
            let envelope = events.next().await.expect("event bus closed");
            if pick(&envelope.event) {
                return envelope.event;
            }
        }
    })
    .await
    .expect("expected event before the deadline")
}

async fn launch_count(core_dir: &Path) -> anyhow::Result<usize> {
    let text = tokio::fs::read_to_string(core_dir.join("runs.log")).await?;
    Ok(text.lines().count())
}

async fn wait_for_log(path: &Path, needle: &str) {
    tokio::time::timeout(EVENT_DEADLINE, async {
        loop {
            if let Ok(text) = tokio::fs::read_to_string(path).await
                && text.contains(needle)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("expected log line before the deadline");
}

#[tokio::test]
async fn start_reaches_running_and_announces_the_endpoint() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    install_core(root.path(), HEALTHY_CORE).await?;
    let store = seeded_store(root.path()).await?;
    let bus = EventBus::new();
    let mut events = bus.subscribe(None);

    let manager = manager(store, bus, root.path().to_path_buf());
    manager.start().await?;

    assert_eq!(manager.phase(), CorePhase::Running);
    let endpoint = manager.endpoint().expect("running core has an endpoint");
    assert!(endpoint.to_string().starts_with("unix://"));

    let synthesized = wait_for(&mut events, |event| {
        matches!(event, Event::ConfigSynthesized { .. })
    })
    .await;
    assert_eq!(
        synthesized,
        Event::ConfigSynthesized {
            profile_id: "main".to_string()
        }
    );

    let ready = wait_for(&mut events, |event| matches!(event, Event::CoreReady { .. })).await;
    let Event::CoreReady { pid, ipc_address } = ready else {
        unreachable!();
    };
    assert!(pid > 0);
    assert_eq!(ipc_address, endpoint.to_string());

    manager.stop(true).await?;
    assert_eq!(manager.phase(), CorePhase::Stopped);
    assert!(manager.endpoint().is_none());
    Ok(())
}

#[tokio::test]
async fn concurrent_restarts_collapse_into_one_cycle() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    install_core(root.path(), HEALTHY_CORE).await?;
    let store = seeded_store(root.path()).await?;

    let manager = manager(store, EventBus::new(), root.path().to_path_buf());
    manager.start().await?;
    assert_eq!(launch_count(root.path()).await?, 1);

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let handle = manager.clone();
        tasks.push(tokio::spawn(async move { handle.restart().await }));
    }
    let mut winners = 0;
    for task in tasks {
        if task.await?? {
            winners += 1;
        }
    }

    assert_eq!(winners, 1, "exactly one restart call does the work");
    assert_eq!(launch_count(root.path()).await?, 2);
    assert_eq!(manager.phase(), CorePhase::Running);

    manager.stop(true).await?;
    Ok(())
}

#[tokio::test]
async fn validation_rejections_surface_the_checker_output() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let path = root.path().join("mihomo");
    tokio::fs::write(
        &path,
        "#!/bin/sh\nif [ \"$1\" = \"-t\" ]; then echo 'unknown field: bogus'; exit 1; fi\nexec sleep 30\n",
    )
    .await?;
    let mut perms = tokio::fs::metadata(&path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(&path, perms).await?;
    let store = seeded_store(root.path()).await?;

    let manager = manager(store, EventBus::new(), root.path().to_path_buf());
    let error = manager.start().await.expect_err("validation must fail");
    match error {
        EngineError::Validation { id, output } => {
            assert_eq!(id, "main");
            assert!(output.contains("unknown field"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(manager.phase(), CorePhase::Stopped);
    Ok(())
}

#[tokio::test]
async fn tun_rejection_disables_tun_and_aborts_the_start() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    install_core(
        root.path(),
        "echo 'configure tun interface: operation not permitted'\nexec sleep 30\n",
    )
    .await?;
    let store = seeded_store(root.path()).await?;
    let bus = EventBus::new();
    let mut events = bus.subscribe(None);

    let manager = manager(store.clone(), bus, root.path().to_path_buf());
    let error = manager.start().await.expect_err("TUN rejection must abort");
    assert!(matches!(error, EngineError::TunPermission { .. }));
    assert_eq!(manager.phase(), CorePhase::Stopped);

    let disabled = wait_for(&mut events, |event| {
        matches!(event, Event::TunDisabled { .. })
    })
    .await;
    let Event::TunDisabled { reason } = disabled else {
        unreachable!();
    };
    assert!(reason.contains("operation not permitted"));

    let controlled = store.controlled().await?;
    assert!(!controlled.tun_enabled());
    Ok(())
}

#[tokio::test]
async fn recovery_refills_the_crash_budget() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    install_core(
        root.path(),
        "echo 'RESTful API listening at: unix socket'\n\
         echo 'Initial configuration complete, total time: 1ms'\n\
         sleep 0.3\n\
         exit 7\n",
    )
    .await?;
    let store = seeded_store(root.path()).await?;
    let bus = EventBus::new();
    let mut events = bus.subscribe(None);

    let manager = manager(store, bus, root.path().to_path_buf());
    manager.start().await?;

    // Each crash follows a full recovery, so the budget never drains:
    // every crash reports the same single unit spent.
    for _ in 0..3 {
        let crashed = wait_for(&mut events, |event| {
            matches!(event, Event::CoreCrashed { .. })
        })
        .await;
        let Event::CoreCrashed {
            remaining_budget, ..
        } = crashed
        else {
            unreachable!();
        };
        assert_eq!(remaining_budget, 9, "recovered cores keep a full budget");
        wait_for(&mut events, |event| matches!(event, Event::CoreReady { .. })).await;
    }

    manager.stop(true).await?;
    assert_eq!(manager.phase(), CorePhase::Stopped);
    Ok(())
}

#[tokio::test]
async fn a_core_that_cannot_come_back_exhausts_the_budget() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    // First launch is healthy then crashes; every later launch dies before
    // the readiness lines, so the comeback attempts drain the budget.
    install_core(
        root.path(),
        "if [ \"$(wc -l < \"$(dirname \"$0\")/runs.log\")\" -gt 1 ]; then exit 7; fi\n\
         echo 'RESTful API listening at: unix socket'\n\
         echo 'Initial configuration complete, total time: 1ms'\n\
         sleep 0.2\n\
         exit 7\n",
    )
    .await?;
    let store = seeded_store(root.path()).await?;
    let bus = EventBus::new();
    let mut events = bus.subscribe(None);

    let manager = manager(store, bus, root.path().to_path_buf());
    manager.start().await?;

    let crashed = wait_for(&mut events, |event| {
        matches!(event, Event::CoreCrashed { .. })
    })
    .await;
    let Event::CoreCrashed {
        remaining_budget, ..
    } = crashed
    else {
        unreachable!();
    };
    assert_eq!(remaining_budget, 9, "the crash itself spends one unit");

    wait_for(&mut events, |event| {
        matches!(event, Event::CoreRetriesExhausted)
    })
    .await;
    assert_eq!(manager.phase(), CorePhase::Stopped);
    // One healthy launch plus nine failed comeback attempts.
    assert_eq!(launch_count(root.path()).await?, 10);
    Ok(())
}

#[tokio::test]
async fn keep_alive_mode_detaches_stdio_and_records_the_core_pid() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    install_core(root.path(), HEALTHY_CORE).await?;
    let store = seeded_store(root.path()).await?;
    store
        .set_app_settings(AppSettings {
            keep_core_alive: true,
            ..AppSettings::default()
        })
        .await?;
    let pid_file = store.dirs().pid_file();
    let core_log = store.dirs().core_log();

    let manager = manager(store, EventBus::new(), root.path().to_path_buf());
    manager.start().await?;
    assert_eq!(manager.phase(), CorePhase::Running);

    let recorded = tokio::fs::read_to_string(&pid_file).await?;
    assert!(recorded.trim().parse::<u32>().is_ok());

    // A detached core gets the log file as stdout instead of a pipe, so
    // its output lands there without this process relaying it.
    wait_for_log(&core_log, veil_engine::supervisor::READY_SIGNAL).await;

    manager.stop(false).await?;
    assert!(!tokio::fs::try_exists(&pid_file).await?);
    Ok(())
}
