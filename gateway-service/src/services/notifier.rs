//! Out-of-band operator notification for server-side failures.

use serde_json::json;

/// Fire-and-forget webhook client. Server errors page an operator; a
/// failed delivery only logs, it never touches the request.
#[derive(Clone)]
pub struct OperatorNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    service_name: String,
}

impl OperatorNotifier {
    pub fn new(webhook_url: Option<String>, service_name: &str) -> Self {
        if webhook_url.is_none() {
            tracing::info!("Operator webhook not configured, 5xx notifications disabled");
        }
        Self {
            client: reqwest::Client::new(),
            webhook_url,
            service_name: service_name.to_string(),
        }
    }

    pub fn notify_server_error(&self, request_id: &str, status: u16, method: &str, path: &str) {
        let Some(url) = self.webhook_url.clone() else {
            return;
        };

        let payload = json!({
            "service": self.service_name,
            "requestId": request_id,
            "status": status,
            "method": method,
            "path": path,
            "timestamp": chrono::Utc::now(),
        });

        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        status = response.status().as_u16(),
                        "Operator webhook rejected notification"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Operator notification failed");
                }
            }
        });
    }
}
