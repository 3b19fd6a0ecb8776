//! Polls the config files and swaps fresh snapshots into the agents.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use lighthouse_core::agent::{ConfigAgent, PluginAgent};
use lighthouse_core::{Config, PluginConfig};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

pub fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {path}"))?;
    let mut config = Config::from_yaml(&text)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn load_plugin_config(path: &str) -> Result<PluginConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plugins file {path}"))?;
    PluginConfig::from_yaml(&text)
}

/// Environment wins over the file for status target URL composition.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(base) = std::env::var("LIGHTHOUSE_REPORT_URL_BASE")
        && !base.is_empty()
    {
        config.report.url_base = base;
    }
    if let Ok(team) = std::env::var("LIGHTHOUSE_REPORT_URL_TEAM")
        && !team.is_empty()
    {
        config.report.url_team = team;
    }
}

fn modified(path: &str) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Reload either file whenever its mtime moves. Runs until cancelled.
pub async fn watch(
    config_path: String,
    plugins_path: String,
    config_agent: Arc<ConfigAgent>,
    plugin_agent: Arc<PluginAgent>,
    cancel: CancellationToken,
) {
    let mut config_seen = modified(&config_path);
    let mut plugins_seen = modified(&plugins_path);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        let config_now = modified(&config_path);
        if config_now != config_seen {
            config_seen = config_now;
            match load_config(&config_path) {
                Ok(config) => {
                    tracing::info!(path = %config_path, "Updating core configuration");
                    config_agent.set(config);
                }
                Err(e) => tracing::error!("Error processing the config YAML: {e:?}"),
            }
        }
        let plugins_now = modified(&plugins_path);
        if plugins_now != plugins_seen {
            plugins_seen = plugins_now;
            match load_plugin_config(&plugins_path) {
                Ok(config) => {
                    tracing::info!(path = %plugins_path, "Updating plugins configuration");
                    plugin_agent.set(config);
                }
                Err(e) => tracing::error!("Error processing the plugins YAML: {e:?}"),
            }
        }
    }
}

/// Best-effort initial load so the process can come up before the files
/// exist; readiness stays false until both agents hold a snapshot.
pub fn initial_load(
    config_path: &str,
    plugins_path: &str,
    config_agent: &ConfigAgent,
    plugin_agent: &PluginAgent,
) {
    if Path::new(config_path).exists() {
        match load_config(config_path) {
            Ok(config) => config_agent.set(config),
            Err(e) => tracing::error!("Error processing the config YAML: {e:?}"),
        }
    }
    if Path::new(plugins_path).exists() {
        match load_plugin_config(plugins_path) {
            Ok(config) => plugin_agent.set(config),
            Err(e) => tracing::error!("Error processing the plugins YAML: {e:?}"),
        }
    }
}
