//! Stage completion messages posted to a Discord webhook.

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

const USERNAME: &str = "caremap";
const COLOR_OK: u32 = 0x2E_CC_71;
const COLOR_FAILED: u32 = 0xE7_4C_3C;

#[derive(Serialize, Debug)]
struct Embed {
    title: String,
    description: String,
    color: u32,
    timestamp: String,
}

#[derive(Serialize, Debug)]
struct Payload {
    username: String,
    embeds: Vec<Embed>,
}

pub struct DiscordWebhook {
    url: String,
    client: reqwest::Client,
}

impl DiscordWebhook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn send(&self, title: &str, description: &str, success: bool) -> Result<()> {
        let payload = Payload {
            username: USERNAME.to_string(),
            embeds: vec![Embed {
                title: title.to_string(),
                description: description.to_string(),
                color: if success { COLOR_OK } else { COLOR_FAILED },
                timestamp: chrono::Utc::now().to_rfc3339(),
            }],
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Discord notification rejected ({}): {}", status, body);
            anyhow::bail!("Discord notification failed with {}", status);
        }

        info!("Sent Discord notification: {}", title);
        Ok(())
    }
}

/// Optional sink for stage outcomes; a missing webhook is a no-op and
/// delivery failures are only logged.
#[derive(Default)]
pub struct StageNotifier {
    webhook: Option<DiscordWebhook>,
}

impl StageNotifier {
    pub fn new(url: Option<String>) -> Self {
        Self {
            webhook: url.filter(|u| !u.trim().is_empty()).map(DiscordWebhook::new),
        }
    }

    pub async fn finished(&self, stage: &str, summary: &str) {
        self.post(&format!("{} stage finished", stage), summary, true)
            .await;
    }

    pub async fn failed(&self, stage: &str, err: &anyhow::Error) {
        self.post(&format!("{} stage failed", stage), &format!("{:#}", err), false)
            .await;
    }

    async fn post(&self, title: &str, description: &str, success: bool) {
        if let Some(webhook) = &self.webhook {
            if let Err(e) = webhook.send(title, description, success).await {
                warn!("Could not deliver notification '{}': {:#}", title, e);
            }
        }
    }
}
