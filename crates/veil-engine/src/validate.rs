//! Config validation via the core's check mode.

use std::path::Path;

use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Run `<core> -t -f <config> -d <check_dir>` and surface rejections with
/// the validator's raw output.
///
/// # Errors
/// Fails when the check process cannot be spawned or the core rejects the
/// config.
pub async fn check_config(
    core: &Path,
    config: &Path,
    check_dir: &Path,
    profile_id: &str,
) -> EngineResult<()> {
    tokio::fs::create_dir_all(check_dir)
        .await
        .map_err(|error| EngineError::io("create_check_dir", check_dir, error))?;

    let output = tokio::process::Command::new(core)
        .arg("-t")
        .arg("-f")
        .arg(config)
        .arg("-d")
        .arg(check_dir)
        .output()
        .await
        .map_err(|source| EngineError::Process {
            operation: "spawn_config_check",
            source,
        })?;

    if output.status.success() {
        debug!(profile_id, "config validated by the core");
        return Ok(());
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(EngineError::Validation {
        id: profile_id.to_string(),
        output: combined,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    async fn fake_validator(dir: &Path, script: &str) -> std::path::PathBuf {
        let path = dir.join("core");
        tokio::fs::write(&path, script).await.expect("write script");
        let mut perms = tokio::fs::metadata(&path).await.expect("metadata").permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms)
            .await
            .expect("chmod");
        path
    }

    #[tokio::test]
    async fn passing_checks_succeed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let core = fake_validator(dir.path(), "#!/bin/sh\nexit 0\n").await;
        let config = dir.path().join("config.yaml");
        tokio::fs::write(&config, "mixed-port: 7890\n").await?;

        check_config(&core, &config, &dir.path().join("check"), "p1").await?;
        Ok(())
    }

    #[tokio::test]
    async fn rejections_carry_the_validator_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let core =
            fake_validator(dir.path(), "#!/bin/sh\necho 'proxy 3: unknown type'\nexit 1\n").await;
        let config = dir.path().join("config.yaml");
        tokio::fs::write(&config, "proxies: []\n").await?;

        let error = check_config(&core, &config, &dir.path().join("check"), "p1")
            .await
            .expect_err("validation must fail");
        match error {
            EngineError::Validation { id, output } => {
                assert_eq!(id, "p1");
                assert!(output.contains("unknown type"));
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }
}
