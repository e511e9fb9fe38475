use std::time::Duration;

/// Best-effort operator notification (cost-ceiling breach, backup batch
/// failures). A missing webhook or a delivery error never fails the caller.
pub async fn notify_operator(message: &str) {
    let Ok(webhook) = std::env::var("OPERATOR_ALERT_WEBHOOK") else {
        eprintln!("🚨 [alert] (no webhook configured) {}", message);
        return;
    };
    let webhook = webhook.trim().to_string();
    if webhook.is_empty() {
        eprintln!("🚨 [alert] (no webhook configured) {}", message);
        return;
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(5))
        .build();
    let Ok(client) = client else {
        return;
    };

    let payload = serde_json::json!({ "text": message });
    match client.post(&webhook).json(&payload).send().await {
        Ok(resp) if resp.status().is_success() => {
            println!("🚨 [alert] delivered: {}", message);
        }
        Ok(resp) => {
            eprintln!("⚠️  [alert] webhook returned {}: {}", resp.status(), message);
        }
        Err(e) => {
            eprintln!("⚠️  [alert] webhook delivery failed: {} ({})", e, message);
        }
    }
}
