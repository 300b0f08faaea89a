//! Evolution-style WhatsApp gateway client.
//!
//! The gateway is treated as a remote, possibly-slow, possibly-failing
//! collaborator: every call returns a plain `Result` and callers decide
//! whether to skip the item or surface a control-operation failure.

use super::{ConnectionState, MessagingGateway, NumberCheck, SentMessage};
use crate::config::MessagingConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

pub struct EvolutionGateway {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl EvolutionGateway {
    pub fn new(config: &MessagingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to build gateway HTTP client")?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn error_for_status(resp: reqwest::Response, what: &str) -> Result<serde_json::Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = extract_error_message(&body).unwrap_or_else(|| body.chars().take(200).collect());
            anyhow::bail!("Gateway {what} failed: {status} — {detail}");
        }
        resp.json::<serde_json::Value>()
            .await
            .with_context(|| format!("Gateway {what} returned a non-JSON body"))
    }
}

#[async_trait]
impl MessagingGateway for EvolutionGateway {
    async fn connection_state(&self, instance: &str) -> Result<ConnectionState> {
        let url = self.url(&format!("/instance/connectionState/{instance}"));
        let resp = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .send()
            .await
            .context("Gateway connection-state request failed")?;

        let body = Self::error_for_status(resp, "connection-state").await?;
        Ok(parse_connection_state(&body))
    }

    async fn check_number(&self, instance: &str, phone: &str) -> Result<NumberCheck> {
        let url = self.url(&format!("/chat/whatsappNumbers/{instance}"));
        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({ "numbers": [phone] }))
            .send()
            .await
            .context("Gateway number-check request failed")?;

        let body = Self::error_for_status(resp, "number-check").await?;
        parse_number_check(&body, phone)
    }

    async fn send_text(
        &self,
        instance: &str,
        destination: &str,
        text: &str,
    ) -> Result<SentMessage> {
        let url = self.url(&format!("/message/sendText/{instance}"));
        let resp = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({ "number": destination, "text": text }))
            .send()
            .await
            .context("Gateway send-text request failed")?;

        let body = Self::error_for_status(resp, "send-text").await?;
        Ok(SentMessage {
            id: parse_sent_message_id(&body),
        })
    }
}

/// Connection-state payload: `{ "instance": { "state": "open" } }`,
/// with a flat `{ "state": ... }` fallback seen on older gateways.
fn parse_connection_state(body: &serde_json::Value) -> ConnectionState {
    let state = body
        .get("instance")
        .and_then(|i| i.get("state"))
        .or_else(|| body.get("state"))
        .and_then(|s| s.as_str())
        .unwrap_or("");
    ConnectionState::parse(state)
}

/// Number-check payload: an array with one entry per requested number,
/// `[{ "exists": true, "jid": "...", "number": "..." }]`.
fn parse_number_check(body: &serde_json::Value, phone: &str) -> Result<NumberCheck> {
    let entries = body
        .as_array()
        .context("Gateway number-check response is not an array")?;

    let entry = entries
        .iter()
        .find(|e| {
            e.get("number")
                .and_then(|n| n.as_str())
                .is_some_and(|n| n == phone)
        })
        .or_else(|| entries.first())
        .with_context(|| format!("Gateway number-check returned no entry for {phone}"))?;

    let exists = entry
        .get("exists")
        .and_then(|e| e.as_bool())
        .unwrap_or(false);
    let jid = entry
        .get("jid")
        .and_then(|j| j.as_str())
        .map(ToString::to_string);

    Ok(NumberCheck { exists, jid })
}

/// Send receipts carry the message id at `key.id`; fall back to a
/// top-level `id`, then to an empty string (the send still succeeded).
fn parse_sent_message_id(body: &serde_json::Value) -> String {
    body.get("key")
        .and_then(|k| k.get("id"))
        .or_else(|| body.get("id"))
        .and_then(|id| id.as_str())
        .unwrap_or_default()
        .to_string()
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(|m| m.as_str())
        .map(ToString::to_string)
}
