//! Prospecting: drive the directory search provider to find candidate
//! businesses for a campaign, then push them through the validation
//! gate. Covers the `searching` -> `validating` stretch of the
//! campaign lifecycle.

use crate::campaign::{self, CampaignStatus};
use crate::config::Config;
use crate::directory::DirectorySearch;
use crate::messaging::MessagingGateway;
use crate::validate::{self, Candidate, ValidationSummary};
use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProspectSummary {
    pub pages_fetched: u32,
    pub businesses_found: u32,
    /// Businesses listed without any phone number.
    pub without_phone: u32,
    pub validation: ValidationSummary,
}

/// Search up to `max_pages` pages of businesses and validate every
/// contact found. A provider failure mid-search keeps whatever was
/// already gathered; the campaign is left in a resumable state either
/// way.
pub async fn run_prospecting(
    config: &Config,
    directory: &dyn DirectorySearch,
    gateway: &dyn MessagingGateway,
    campaign_id: &str,
    query: &str,
    location: &str,
    max_pages: u32,
) -> Result<ProspectSummary> {
    let campaign = campaign::get_campaign(config, campaign_id)?;
    let entered_searching = if campaign.status.can_transition(CampaignStatus::Searching) {
        campaign::set_campaign_status(config, campaign_id, CampaignStatus::Searching).is_ok()
    } else {
        false
    };

    let mut summary = ProspectSummary::default();
    let mut candidates = Vec::new();
    let mut page = 1u32;

    loop {
        match directory.search(query, location, page).await {
            Ok(results) => {
                summary.pages_fetched += 1;
                for hit in results.items {
                    summary.businesses_found += 1;
                    match hit.phone {
                        Some(phone) => candidates.push(Candidate {
                            business_name: hit.name,
                            phone,
                        }),
                        None => summary.without_phone += 1,
                    }
                }
                match results.next_page {
                    Some(next) if summary.pages_fetched < max_pages.max(1) => page = next,
                    _ => break,
                }
            }
            Err(e) => {
                // keep what we have; the operator can prospect again
                warn!("Directory search failed on page {page}: {e:#}");
                break;
            }
        }
    }

    info!(
        campaign = campaign_id,
        query,
        location,
        pages = summary.pages_fetched,
        found = summary.businesses_found,
        "Prospecting search finished"
    );

    // validate_candidates takes the campaign through
    // searching -> validating -> draft
    summary.validation = validate::validate_candidates(config, gateway, campaign_id, &candidates)
        .await
        .unwrap_or_else(|e| {
            warn!("Validation after prospecting failed: {e:#}");
            ValidationSummary::default()
        });

    // search failed before any validation could run: put the campaign
    // back where dispatch can be started
    if entered_searching {
        let current = campaign::get_campaign(config, campaign_id)?;
        if current.status == CampaignStatus::Searching {
            if let Err(e) = campaign::set_campaign_status(config, campaign_id, CampaignStatus::Draft)
            {
                warn!("Could not leave searching state: {e:#}");
            }
        }
    }

    campaign::refresh_total_leads(config, campaign_id)?;
    Ok(summary)
}
