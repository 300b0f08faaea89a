use super::{BusinessHit, DirectorySearch, SearchPage};
use crate::config::DirectoryConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// HTTP client for the business search provider.
pub struct PlacesClient {
    base_url: String,
    api_key: Option<String>,
    page_size: u32,
    client: reqwest::Client,
}

impl PlacesClient {
    pub fn new(config: &DirectoryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to build directory HTTP client")?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            page_size: config.page_size.max(1),
            client,
        })
    }
}

#[async_trait]
impl DirectorySearch for PlacesClient {
    async fn search(&self, query: &str, location: &str, page: u32) -> Result<SearchPage> {
        let url = format!("{}/search", self.base_url);
        let mut request = self.client.get(&url).query(&[
            ("query", query.to_string()),
            ("location", location.to_string()),
            ("page", page.to_string()),
            ("limit", self.page_size.to_string()),
        ]);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let resp = request
            .send()
            .await
            .context("Directory search request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Directory search failed: {status} — {}",
                body.chars().take(200).collect::<String>()
            );
        }

        let body = resp
            .json::<serde_json::Value>()
            .await
            .context("Directory search returned a non-JSON body")?;
        Ok(parse_search_page(&body, page))
    }
}

/// Provider payload: `{ "results": [{ "name": ..., "phone": ... }],
/// "has_more": bool }`. Entries without a name are dropped.
fn parse_search_page(body: &serde_json::Value, page: u32) -> SearchPage {
    let items = body
        .get("results")
        .and_then(|r| r.as_array())
        .map(|results| {
            results
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name").and_then(|n| n.as_str())?;
                    if name.trim().is_empty() {
                        return None;
                    }
                    Some(BusinessHit {
                        name: name.to_string(),
                        phone: entry
                            .get("phone")
                            .and_then(|p| p.as_str())
                            .map(ToString::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let has_more = body
        .get("has_more")
        .and_then(|m| m.as_bool())
        .unwrap_or(false);

    SearchPage {
        items,
        next_page: has_more.then(|| page + 1),
    }
}
