//! Persistent stores for profiles, overrides, controlled config, and
//! application settings.
//!
//! All reads and writes funnel through a single writer task per store
//! instance, so read-modify-write sequences are FIFO ordered and two
//! callers can never interleave partial updates to the same file.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{AppSettings, ControlledConfig, OverrideItem, ProfileIndex, ProfileMeta};
use crate::paths::VeilDirs;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

enum StoreCommand {
    ProfileIndex {
        reply: oneshot::Sender<ProfileIndex>,
    },
    ProfileBody {
        id: String,
        reply: oneshot::Sender<ConfigResult<String>>,
    },
    UpsertProfile {
        meta: ProfileMeta,
        body: String,
        reply: oneshot::Sender<ConfigResult<()>>,
    },
    RemoveProfile {
        id: String,
        reply: oneshot::Sender<ConfigResult<()>>,
    },
    SetCurrent {
        id: String,
        reply: oneshot::Sender<ConfigResult<()>>,
    },
    Overrides {
        reply: oneshot::Sender<Vec<OverrideItem>>,
    },
    UpsertOverride {
        item: OverrideItem,
        reply: oneshot::Sender<ConfigResult<()>>,
    },
    RemoveOverride {
        id: String,
        reply: oneshot::Sender<ConfigResult<()>>,
    },
    Controlled {
        reply: oneshot::Sender<ControlledConfig>,
    },
    SetControlled {
        controlled: ControlledConfig,
        reply: oneshot::Sender<ConfigResult<()>>,
    },
    DisableTun {
        reply: oneshot::Sender<ConfigResult<()>>,
    },
    AppSettings {
        reply: oneshot::Sender<AppSettings>,
    },
    SetAppSettings {
        settings: AppSettings,
        reply: oneshot::Sender<ConfigResult<()>>,
    },
}

/// Handle to the configuration store's writer task.
///
/// Cheap to clone; all clones talk to the same task.
#[derive(Clone)]
pub struct ConfigStore {
    commands: mpsc::Sender<StoreCommand>,
    dirs: VeilDirs,
}

impl ConfigStore {
    /// Open the store rooted at the given layout, loading any persisted
    /// state and spawning the writer task.
    ///
    /// # Errors
    /// Returns an error when the root directory cannot be created or a
    /// persisted file fails to read or parse.
    pub async fn open(dirs: VeilDirs) -> ConfigResult<Self> {
        tokio::fs::create_dir_all(dirs.root())
            .await
            .map_err(|error| ConfigError::io("create_store_root", dirs.root(), error))?;

        let state = StoreState::load(dirs.clone()).await?;
        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(state.run(receiver));

        Ok(Self { commands, dirs })
    }

    /// Filesystem layout the store was opened with.
    #[must_use]
    pub fn dirs(&self) -> &VeilDirs {
        &self.dirs
    }

    /// Snapshot of the profile index.
    ///
    /// # Errors
    /// Returns an error when the writer task has shut down.
    pub async fn profile_index(&self) -> ConfigResult<ProfileIndex> {
        self.request("profile_index", |reply| StoreCommand::ProfileIndex { reply })
            .await
    }

    /// Metadata of the current profile.
    ///
    /// # Errors
    /// Returns an error when no profile is selected or the selection
    /// points at an unknown profile.
    pub async fn current_profile(&self) -> ConfigResult<ProfileMeta> {
        let index = self.profile_index().await?;
        let current = index.current.ok_or(ConfigError::NoCurrentProfile)?;
        index
            .items
            .into_iter()
            .find(|meta| meta.id == current)
            .ok_or(ConfigError::UnknownProfile { id: current })
    }

    /// Raw YAML body of one profile.
    ///
    /// # Errors
    /// Returns an error when the profile is unknown or its body cannot
    /// be read.
    pub async fn profile_body(&self, id: &str) -> ConfigResult<String> {
        let id = id.to_string();
        self.request("profile_body", |reply| StoreCommand::ProfileBody { id, reply })
            .await?
    }

    /// Insert or replace a profile and its body.
    ///
    /// # Errors
    /// Returns an error when the body or index cannot be written.
    pub async fn upsert_profile(&self, meta: ProfileMeta, body: String) -> ConfigResult<()> {
        self.request("upsert_profile", |reply| StoreCommand::UpsertProfile {
            meta,
            body,
            reply,
        })
        .await?
    }

    /// Remove a profile, clearing the current marker if it pointed at it.
    ///
    /// # Errors
    /// Returns an error when the body or index cannot be removed or
    /// rewritten.
    pub async fn remove_profile(&self, id: &str) -> ConfigResult<()> {
        let id = id.to_string();
        self.request("remove_profile", |reply| StoreCommand::RemoveProfile { id, reply })
            .await?
    }

    /// Mark a profile as current.
    ///
    /// # Errors
    /// Returns an error when the profile is unknown or the index cannot
    /// be written.
    pub async fn set_current(&self, id: &str) -> ConfigResult<()> {
        let id = id.to_string();
        self.request("set_current", |reply| StoreCommand::SetCurrent { id, reply })
            .await?
    }

    /// All stored override items, in application order.
    ///
    /// # Errors
    /// Returns an error when the writer task has shut down.
    pub async fn overrides(&self) -> ConfigResult<Vec<OverrideItem>> {
        self.request("overrides", |reply| StoreCommand::Overrides { reply })
            .await
    }

    /// Insert or replace an override item.
    ///
    /// # Errors
    /// Returns an error when the override index cannot be written.
    pub async fn upsert_override(&self, item: OverrideItem) -> ConfigResult<()> {
        self.request("upsert_override", |reply| StoreCommand::UpsertOverride { item, reply })
            .await?
    }

    /// Remove an override item.
    ///
    /// # Errors
    /// Returns an error when the override index cannot be written.
    pub async fn remove_override(&self, id: &str) -> ConfigResult<()> {
        let id = id.to_string();
        self.request("remove_override", |reply| StoreCommand::RemoveOverride { id, reply })
            .await?
    }

    /// Snapshot of the app-managed core settings.
    ///
    /// # Errors
    /// Returns an error when the writer task has shut down.
    pub async fn controlled(&self) -> ConfigResult<ControlledConfig> {
        self.request("controlled", |reply| StoreCommand::Controlled { reply })
            .await
    }

    /// Replace the app-managed core settings.
    ///
    /// # Errors
    /// Returns an error when the controlled file cannot be written.
    pub async fn set_controlled(&self, controlled: ControlledConfig) -> ConfigResult<()> {
        self.request("set_controlled", |reply| StoreCommand::SetControlled {
            controlled,
            reply,
        })
        .await?
    }

    /// Persist `tun.enable: false`, used when the core rejects TUN.
    ///
    /// # Errors
    /// Returns an error when the controlled file cannot be written.
    pub async fn disable_tun(&self) -> ConfigResult<()> {
        self.request("disable_tun", |reply| StoreCommand::DisableTun { reply })
            .await?
    }

    /// Snapshot of the application settings.
    ///
    /// # Errors
    /// Returns an error when the writer task has shut down.
    pub async fn app_settings(&self) -> ConfigResult<AppSettings> {
        self.request("app_settings", |reply| StoreCommand::AppSettings { reply })
            .await
    }

    /// Replace the application settings.
    ///
    /// # Errors
    /// Returns an error when the settings file cannot be written.
    pub async fn set_app_settings(&self, settings: AppSettings) -> ConfigResult<()> {
        self.request("set_app_settings", |reply| StoreCommand::SetAppSettings {
            settings,
            reply,
        })
        .await?
    }

    async fn request<T>(
        &self,
        operation: &'static str,
        build: impl FnOnce(oneshot::Sender<T>) -> StoreCommand,
    ) -> ConfigResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ConfigError::StoreClosed { operation })?;
        response
            .await
            .map_err(|_| ConfigError::StoreClosed { operation })
    }
}

struct StoreState {
    dirs: VeilDirs,
    profiles: ProfileIndex,
    overrides: Vec<OverrideItem>,
    controlled: ControlledConfig,
    settings: AppSettings,
}

impl StoreState {
    async fn load(dirs: VeilDirs) -> ConfigResult<Self> {
        let profiles = read_yaml_or_default(&dirs.profile_index()).await?;
        let overrides = read_yaml_or_default(&dirs.override_index()).await?;
        let controlled = read_yaml_or_default(&dirs.controlled_file()).await?;
        let settings = read_yaml_or_default(&dirs.settings_file()).await?;
        Ok(Self {
            dirs,
            profiles,
            overrides,
            controlled,
            settings,
        })
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<StoreCommand>) {
        while let Some(command) = receiver.recv().await {
            self.handle(command).await;
        }
        debug!("configuration store writer task exiting");
    }

    async fn handle(&mut self, command: StoreCommand) {
        match command {
            StoreCommand::ProfileIndex { reply } => {
                let _ = reply.send(self.profiles.clone());
            }
            StoreCommand::ProfileBody { id, reply } => {
                let _ = reply.send(self.read_profile_body(&id).await);
            }
            StoreCommand::UpsertProfile { meta, body, reply } => {
                let _ = reply.send(self.upsert_profile(meta, body).await);
            }
            StoreCommand::RemoveProfile { id, reply } => {
                let _ = reply.send(self.remove_profile(&id).await);
            }
            StoreCommand::SetCurrent { id, reply } => {
                let _ = reply.send(self.set_current(id).await);
            }
            StoreCommand::Overrides { reply } => {
                let _ = reply.send(self.overrides.clone());
            }
            StoreCommand::UpsertOverride { item, reply } => {
                let _ = reply.send(self.upsert_override(item).await);
            }
            StoreCommand::RemoveOverride { id, reply } => {
                let _ = reply.send(self.remove_override(&id).await);
            }
            StoreCommand::Controlled { reply } => {
                let _ = reply.send(self.controlled.clone());
            }
            StoreCommand::SetControlled { controlled, reply } => {
                self.controlled = controlled;
                let _ = reply.send(self.persist_controlled().await);
            }
            StoreCommand::DisableTun { reply } => {
                self.controlled.set_tun_enabled(false);
                let _ = reply.send(self.persist_controlled().await);
            }
            StoreCommand::AppSettings { reply } => {
                let _ = reply.send(self.settings.clone());
            }
            StoreCommand::SetAppSettings { settings, reply } => {
                self.settings = settings;
                let _ = reply
                    .send(write_yaml(&self.dirs.settings_file(), &self.settings, "write_settings").await);
            }
        }
    }

    async fn read_profile_body(&self, id: &str) -> ConfigResult<String> {
        if !self.profiles.items.iter().any(|meta| meta.id == id) {
            return Err(ConfigError::UnknownProfile { id: id.to_string() });
        }
        let path = self.dirs.profile_file(id);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|error| ConfigError::io("read_profile_body", &path, error))
    }

    #[allow(clippy::option_if_let_else)]
    async fn upsert_profile(&mut self, meta: ProfileMeta, body: String) -> ConfigResult<()> {
        let path = self.dirs.profile_file(&meta.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| ConfigError::io("create_profiles_dir", parent, error))?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|error| ConfigError::io("write_profile_body", &path, error))?;

        match self.profiles.items.iter_mut().find(|item| item.id == meta.id) {
            Some(existing) => *existing = meta,
            None => self.profiles.items.push(meta),
        }
        self.persist_profiles().await
    }

    async fn remove_profile(&mut self, id: &str) -> ConfigResult<()> {
        self.profiles.items.retain(|meta| meta.id != id);
        if self.profiles.current.as_deref() == Some(id) {
            self.profiles.current = None;
        }
        let path = self.dirs.profile_file(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(ConfigError::io("remove_profile_body", &path, error)),
        }
        self.persist_profiles().await
    }

    async fn set_current(&mut self, id: String) -> ConfigResult<()> {
        if !self.profiles.items.iter().any(|meta| meta.id == id) {
            return Err(ConfigError::UnknownProfile { id });
        }
        self.profiles.current = Some(id);
        self.persist_profiles().await
    }

    #[allow(clippy::option_if_let_else)]
    async fn upsert_override(&mut self, item: OverrideItem) -> ConfigResult<()> {
        match self.overrides.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item,
            None => self.overrides.push(item),
        }
        self.persist_overrides().await
    }

    async fn remove_override(&mut self, id: &str) -> ConfigResult<()> {
        self.overrides.retain(|item| item.id != id);
        self.persist_overrides().await
    }

    async fn persist_profiles(&self) -> ConfigResult<()> {
        write_yaml(&self.dirs.profile_index(), &self.profiles, "write_profile_index").await
    }

    async fn persist_overrides(&self) -> ConfigResult<()> {
        write_yaml(&self.dirs.override_index(), &self.overrides, "write_override_index").await
    }

    async fn persist_controlled(&self) -> ConfigResult<()> {
        write_yaml(&self.dirs.controlled_file(), &self.controlled, "write_controlled").await
    }
}

async fn read_yaml_or_default<T>(path: &std::path::Path) -> ConfigResult<T>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_yaml::from_str(&text).map_err(|source| ConfigError::Serialize {
            operation: "parse_store_file",
            source,
        }),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(error) => Err(ConfigError::io("read_store_file", path, error)),
    }
}

async fn write_yaml<T: Serialize>(
    path: &std::path::Path,
    value: &T,
    operation: &'static str,
) -> ConfigResult<()> {
    let text = serde_yaml::to_string(value).map_err(|source| ConfigError::Serialize {
        operation,
        source,
    })?;
    tokio::fs::write(path, text)
        .await
        .map_err(|error| ConfigError::io(operation, path, error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OverrideKind, OverrideScope};

    async fn open_store(root: &std::path::Path) -> ConfigStore {
        ConfigStore::open(VeilDirs::new(root)).await.expect("open store")
    }

    fn meta(id: &str) -> ProfileMeta {
        ProfileMeta {
            id: id.to_string(),
            name: format!("profile {id}"),
            override_ids: Vec::new(),
            rules: None,
        }
    }

    #[tokio::test]
    async fn profiles_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = open_store(dir.path()).await;
            store
                .upsert_profile(meta("p1"), "mixed-port: 7890\n".to_string())
                .await
                .expect("upsert");
            store.set_current("p1").await.expect("set current");
        }

        let store = open_store(dir.path()).await;
        let current = store.current_profile().await.expect("current profile");
        assert_eq!(current.id, "p1");
        let body = store.profile_body("p1").await.expect("body");
        assert_eq!(body, "mixed-port: 7890\n");
    }

    #[tokio::test]
    async fn current_profile_requires_a_selection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;

        assert!(matches!(
            store.current_profile().await,
            Err(ConfigError::NoCurrentProfile)
        ));
        assert!(matches!(
            store.set_current("missing").await,
            Err(ConfigError::UnknownProfile { .. })
        ));
    }

    #[tokio::test]
    async fn removing_the_current_profile_clears_the_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        store
            .upsert_profile(meta("p1"), String::new())
            .await
            .expect("upsert");
        store.set_current("p1").await.expect("set current");

        store.remove_profile("p1").await.expect("remove");
        assert!(matches!(
            store.current_profile().await,
            Err(ConfigError::NoCurrentProfile)
        ));
    }

    #[tokio::test]
    async fn overrides_upsert_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;

        let item = OverrideItem {
            id: "o1".to_string(),
            name: "first".to_string(),
            kind: OverrideKind::YamlPatch,
            scope: OverrideScope::Global,
            source: "a: 1\n".to_string(),
        };
        store.upsert_override(item.clone()).await.expect("insert");
        store
            .upsert_override(OverrideItem {
                source: "a: 2\n".to_string(),
                ..item
            })
            .await
            .expect("replace");

        let overrides = store.overrides().await.expect("list");
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].source, "a: 2\n");
    }

    #[tokio::test]
    async fn disable_tun_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;

        let controlled: ControlledConfig =
            serde_yaml::from_str("tun:\n  enable: true\n").expect("controlled");
        store.set_controlled(controlled).await.expect("set controlled");
        store.disable_tun().await.expect("disable tun");

        let store = open_store(dir.path()).await;
        assert!(!store.controlled().await.expect("controlled").tun_enabled());
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;

        let settings = AppSettings {
            control_dns: false,
            keep_core_alive: true,
            ..AppSettings::default()
        };
        store.set_app_settings(settings.clone()).await.expect("set");

        let store = open_store(dir.path()).await;
        assert_eq!(store.app_settings().await.expect("settings"), settings);
    }
}
