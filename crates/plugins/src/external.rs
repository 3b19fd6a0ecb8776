//! One-way delivery of event payloads to external plugin webhooks.

use std::sync::Arc;
use std::time::Duration;

use lighthouse_core::config::ExternalPlugin;
use lighthouse_scm::webhook::sign;
use tokio_util::task::TaskTracker;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fire-and-forget POSTs to subscribed external plugins, at most one per
/// subscription per event. Deliveries are tracked so shutdown can wait for
/// in-flight requests.
pub struct ExternalDispatcher {
    client: reqwest::Client,
    hmac_token: String,
    tracker: TaskTracker,
}

impl ExternalDispatcher {
    pub fn new(hmac_token: &str) -> ExternalDispatcher {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .expect("default HTTP client");
        ExternalDispatcher {
            client,
            hmac_token: hmac_token.to_string(),
            tracker: TaskTracker::new(),
        }
    }

    /// Deliver `body` to each plugin asynchronously. `kind_header` carries the
    /// provider event name so receivers can parse the payload the same way we
    /// did. Failures are logged, never retried.
    pub fn dispatch(
        self: &Arc<Self>,
        plugins: Vec<ExternalPlugin>,
        kind_header: &str,
        body: Arc<Vec<u8>>,
    ) {
        for plugin in plugins {
            let dispatcher = self.clone();
            let kind = kind_header.to_string();
            let body = body.clone();
            self.tracker.spawn(async move {
                let mut request = dispatcher
                    .client
                    .post(&plugin.endpoint)
                    .header("Content-Type", "application/json")
                    .header("X-GitHub-Event", &kind)
                    .body(body.to_vec());
                if !dispatcher.hmac_token.is_empty() {
                    request = request
                        .header("X-Hub-Signature-256", sign(&dispatcher.hmac_token, &body));
                }
                match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!(plugin = %plugin.name, event = %kind, "Delivered event");
                    }
                    Ok(response) => {
                        tracing::error!(
                            plugin = %plugin.name,
                            event = %kind,
                            status = %response.status(),
                            "External plugin rejected event"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            plugin = %plugin.name,
                            event = %kind,
                            "Failed to deliver event: {e}"
                        );
                    }
                }
            });
        }
    }

    /// Wait for in-flight deliveries to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
