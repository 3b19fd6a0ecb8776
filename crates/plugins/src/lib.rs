//! Webhook plugins and their registry.
//!
//! Plugins are values registered in an explicit table at startup. Per-repo
//! enablement comes from the plugin configuration: a repo enables a plugin
//! when its `org/repo` name or bare owner is listed for it.

pub mod external;
pub mod trigger;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lighthouse_core::config::{Config, ExternalPlugin, PluginConfig};
use lighthouse_launcher::Launcher;
use lighthouse_scm::git::GitClient;
use lighthouse_scm::webhook::{Webhook, WebhookKind};
use lighthouse_scm::ScmProvider;
use lighthouse_store::JobStore;

/// Everything a plugin may touch while handling one event.
///
/// Handlers must not block beyond network I/O; long work goes through the
/// launcher.
#[derive(Clone)]
pub struct PluginContext {
    pub scm: Arc<dyn ScmProvider>,
    pub git: Arc<dyn GitClient>,
    pub store: Arc<dyn JobStore>,
    pub launcher: Arc<Launcher>,
    pub bot_name: String,
    pub config: Arc<Config>,
    pub plugin_config: Arc<PluginConfig>,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Event kinds this plugin subscribes to.
    fn events(&self) -> &'static [WebhookKind];

    async fn handle(&self, ctx: &PluginContext, event: &Webhook) -> Result<()>;
}

/// The startup-built table of available plugins.
#[derive(Default)]
pub struct Registry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Registry {
    pub fn new() -> Registry { Registry::default() }

    /// Registry with every built-in plugin registered.
    pub fn with_defaults() -> Registry {
        let mut registry = Registry::new();
        registry.register(Arc::new(trigger::Trigger));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Handlers enabled for `repo` that subscribe to `kind`.
    pub fn handlers_for(
        &self,
        config: &PluginConfig,
        repo: &str,
        kind: WebhookKind,
    ) -> Vec<Arc<dyn Plugin>> {
        let enabled = config.plugins_for(repo);
        self.plugins
            .iter()
            .filter(|p| enabled.contains(&p.name()) && p.events().contains(&kind))
            .cloned()
            .collect()
    }

    /// External plugin webhooks subscribed to `kind` for `repo`.
    pub fn external_plugins_for(
        &self,
        config: &PluginConfig,
        repo: &str,
        kind: WebhookKind,
    ) -> Vec<ExternalPlugin> {
        config.external_plugins_for(repo, kind.as_str()).into_iter().cloned().collect()
    }

    /// Run every enabled handler for `event` in registration order. Handler
    /// errors are logged and do not propagate.
    pub async fn dispatch(&self, ctx: &PluginContext, event: &Webhook) {
        let Some(repository) = event.repository() else {
            return;
        };
        let repo = repository.full_name();
        for plugin in self.handlers_for(&ctx.plugin_config, &repo, event.kind()) {
            if let Err(e) = plugin.handle(ctx, event).await {
                tracing::error!(
                    plugin = plugin.name(),
                    repo = %repo,
                    event = %event.kind(),
                    "Plugin failed: {e:?}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use lighthouse_scm::webhook::PingHook;

    use super::*;

    struct Recorder;

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &'static str { "recorder" }

        fn events(&self) -> &'static [WebhookKind] {
            &[WebhookKind::PullRequest, WebhookKind::Push]
        }

        async fn handle(&self, _ctx: &PluginContext, _event: &Webhook) -> Result<()> { Ok(()) }
    }

    #[test]
    fn test_handlers_for_respects_enablement_and_kind() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Recorder));

        let config = PluginConfig::from_yaml("plugins:\n  org/repo: [recorder]\n").unwrap();
        assert_eq!(registry.handlers_for(&config, "org/repo", WebhookKind::PullRequest).len(), 1);
        // Not subscribed to reviews.
        assert!(registry.handlers_for(&config, "org/repo", WebhookKind::Review).is_empty());
        // Not enabled for other repos.
        assert!(registry.handlers_for(&config, "other/repo", WebhookKind::PullRequest).is_empty());
    }

    #[test]
    fn test_ping_has_no_repository() {
        let hook = Webhook::Ping(PingHook { repository: None });
        assert!(hook.repository().is_none());
    }
}
