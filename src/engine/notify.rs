use super::models::Decision;

/// Fire-and-forget callback to whatever human-facing system collects
/// decisions. Delivery is best effort by contract: the pending decision is
/// already durable when this runs, and a decision-maker can always discover
/// it by polling the status endpoint.
#[derive(Clone)]
pub struct NotificationGateway {
    client: reqwest::Client,
    callback_url: Option<String>,
}

impl NotificationGateway {
    pub fn new(callback_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            callback_url,
        }
    }

    /// POST the checkpoint descriptor to the configured callback URL on a
    /// detached task. Failures are logged and never reach the caller.
    pub fn decision_requested(&self, decision: &Decision) {
        let Some(url) = self.callback_url.clone() else {
            tracing::debug!(
                run_id = %decision.run_id,
                checkpoint = %decision.checkpoint_name,
                "no notify callback configured"
            );
            return;
        };

        let client = self.client.clone();
        let payload = serde_json::json!({
            "event": "decision_requested",
            "run_id": decision.run_id,
            "checkpoint_name": decision.checkpoint_name,
            "phase_index": decision.phase_index,
            "title": decision.title,
            "description": decision.description,
            "context": decision.context,
            "options": decision.options,
            "recommended_option": decision.recommended_option,
            "expires_at": decision.expires_at,
        });
        let run_id = decision.run_id.clone();
        let checkpoint = decision.checkpoint_name.clone();

        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(%run_id, %checkpoint, "decision notification delivered");
                }
                Ok(resp) => {
                    tracing::warn!(
                        %run_id,
                        %checkpoint,
                        status = %resp.status(),
                        "decision notification rejected by callback"
                    );
                }
                Err(e) => {
                    tracing::warn!(%run_id, %checkpoint, error = %e, "decision notification failed");
                }
            }
        });
    }
}
