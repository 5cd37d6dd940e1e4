use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::{info, warn};

use ndrive_core::NuxeoClient;

use crate::manager::Manager;
use crate::options::{OptionSetter, Options};
use crate::updater::UpdateStatus;

const DEFAULT_SYNC_DIR_NAME: &str = "Nuxeo Drive";
const DEFAULT_HOME_DIR_NAME: &str = ".ndrive";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub home: PathBuf,
    pub sync_root: PathBuf,
    pub server_url: Option<String>,
    pub token: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home_dir = dirs::home_dir().context("home directory is unavailable")?;
        let home = std::env::var("NDRIVE_HOME")
            .ok()
            .map(|value| expand_with_home(&value, &home_dir))
            .unwrap_or_else(|| home_dir.join(DEFAULT_HOME_DIR_NAME));
        let sync_root = std::env::var("NDRIVE_SYNC_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home_dir))
            .unwrap_or_else(|| home_dir.join(DEFAULT_SYNC_DIR_NAME));
        Ok(Self {
            home,
            sync_root,
            server_url: std::env::var("NDRIVE_SERVER_URL").ok(),
            token: std::env::var("NDRIVE_TOKEN").ok(),
        })
    }
}

/// Applies environment overrides onto the options (the `local` layer).
pub fn options_from_env() -> Arc<Options> {
    let options = Arc::new(Options::new());
    for (env, key) in [
        ("NDRIVE_DELAY", "delay"),
        ("NDRIVE_TIMEOUT", "timeout"),
        ("NDRIVE_MAX_ERRORS", "max_errors"),
        ("NDRIVE_CHUNK_SIZE", "chunk_size"),
        ("NDRIVE_CHUNK_LIMIT", "chunk_limit"),
        ("NDRIVE_SYNC_WORKERS", "sync_workers"),
    ] {
        if let Ok(value) = std::env::var(env)
            && let Ok(number) = value.parse::<i64>()
            && let Err(err) = options.set(key, json!(number), OptionSetter::Local)
        {
            warn!(env, error = %err, "ignoring invalid override");
        }
    }
    if let Ok(channel) = std::env::var("NDRIVE_CHANNEL")
        && let Err(err) = options.set("channel", json!(channel), OptionSetter::Local)
    {
        warn!(error = %err, "ignoring invalid channel override");
    }
    options
}

pub struct DaemonRuntime {
    manager: Arc<Manager>,
}

impl DaemonRuntime {
    /// Restores registered engines; binds a first one from the environment
    /// when the registry is empty.
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let options = options_from_env();
        let manager = Arc::new(
            Manager::new(config.home.clone(), options)
                .await
                .context("cannot initialize the manager")?,
        );

        let engines = manager.load_engines().await?;
        if engines.is_empty()
            && let (Some(server_url), Some(token)) = (&config.server_url, &config.token)
        {
            let client = NuxeoClient::new(server_url, token.clone())?;
            let root = client
                .get_filesystem_root_info()
                .await
                .context("cannot resolve the top-level folder")?;
            manager
                .bind_engine(server_url, token, &config.sync_root, &root.uid, None)
                .await
                .context("cannot bind the first engine")?;
        }

        Ok(Self { manager })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let engines = self.manager.engines();
        if engines.is_empty() {
            anyhow::bail!(
                "no engine bound; set NDRIVE_SERVER_URL and NDRIVE_TOKEN to bind the first one"
            );
        }
        for engine in &engines {
            engine.start().await?;
        }
        info!(engines = engines.len(), "daemon running");

        // Periodic update check, driven by the configured cadence.
        let manager = Arc::clone(&self.manager);
        let update_task = tokio::spawn(async move {
            let interval =
                Duration::from_secs(manager.options().snapshot().update_check_delay_secs.max(60));
            loop {
                tokio::time::sleep(interval).await;
                match manager.check_for_update().await {
                    Ok(Some((status, version))) if status == UpdateStatus::UpdateAvailable => {
                        info!(version = %version, "a new client version is available");
                    }
                    Ok(Some((status, _))) => {
                        info!(status = status.as_str(), "update check done");
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "update check failed"),
                }
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("cannot listen for shutdown")?;
        info!("shutdown requested");
        update_task.abort();
        self.manager.stop().await;
        Ok(())
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None if value == "~" => home.to_path_buf(),
        None => PathBuf::from(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_paths_expand_under_home() {
        let home = Path::new("/home/user");
        assert_eq!(
            expand_with_home("~/Drive", home),
            PathBuf::from("/home/user/Drive")
        );
        assert_eq!(expand_with_home("~", home), PathBuf::from("/home/user"));
        assert_eq!(
            expand_with_home("/var/drive", home),
            PathBuf::from("/var/drive")
        );
    }
}
