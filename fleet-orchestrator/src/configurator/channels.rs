use fleet_common::{ChannelConfig, Error};
use std::time::Duration;

/// Plugin name enabled on the runtime for each channel kind.
pub fn plugin_for(kind: &str) -> Option<&'static str> {
    match kind {
        "telegram" => Some("channel-telegram"),
        "discord" => Some("channel-discord"),
        "slack" => Some("channel-slack"),
        _ => None,
    }
}

fn probe_client() -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(8))
        .build()
        .map_err(|e| Error::Configuration(format!("http client build failed: {e}")))
}

/// Validate a channel token against its platform before anything is written
/// to the VM. A token the platform rejects fails the configure run.
pub async fn validate_channel(channel: &ChannelConfig) -> Result<(), Error> {
    match channel.kind.as_str() {
        "telegram" => validate_telegram(&channel.token).await,
        "discord" => validate_discord(&channel.token).await,
        "slack" => validate_slack(&channel.token).await,
        other => Err(Error::Validation(format!(
            "unknown channel kind {other:?}"
        ))),
    }
}

async fn validate_telegram(token: &str) -> Result<(), Error> {
    let client = probe_client()?;
    let url = format!("https://api.telegram.org/bot{token}/getMe");
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Configuration(format!("telegram validation request failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::Validation(format!(
            "telegram rejected bot token (status {})",
            resp.status()
        )));
    }
    let v: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| Error::Configuration(format!("telegram validation parse failed: {e}")))?;
    if v["ok"].as_bool() != Some(true) {
        return Err(Error::Validation("telegram getMe returned ok=false".to_string()));
    }
    Ok(())
}

async fn validate_discord(token: &str) -> Result<(), Error> {
    let client = probe_client()?;
    let resp = client
        .get("https://discord.com/api/v10/users/@me")
        .header("Authorization", format!("Bot {token}"))
        .send()
        .await
        .map_err(|e| Error::Configuration(format!("discord validation request failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::Validation(format!(
            "discord rejected bot token (status {})",
            resp.status()
        )));
    }
    Ok(())
}

async fn validate_slack(token: &str) -> Result<(), Error> {
    let client = probe_client()?;
    let resp = client
        .post("https://slack.com/api/auth.test")
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| Error::Configuration(format!("slack validation request failed: {e}")))?;
    let v: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| Error::Configuration(format!("slack validation parse failed: {e}")))?;
    if v["ok"].as_bool() != Some(true) {
        return Err(Error::Validation(format!(
            "slack rejected token: {}",
            v["error"].as_str().unwrap_or("unknown")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_map_to_plugins() {
        assert_eq!(plugin_for("telegram"), Some("channel-telegram"));
        assert_eq!(plugin_for("discord"), Some("channel-discord"));
        assert_eq!(plugin_for("slack"), Some("channel-slack"));
        assert_eq!(plugin_for("carrier-pigeon"), None);
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected_before_any_network_call() {
        let channel = ChannelConfig {
            kind: "carrier-pigeon".to_string(),
            token: "tok".to_string(),
        };
        let err = validate_channel(&channel).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
