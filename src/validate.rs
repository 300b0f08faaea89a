//! Lead Validation Gate.
//!
//! Takes candidate contacts, normalizes their phone numbers and checks
//! them against the messaging gateway. Contacts without WhatsApp are
//! persisted as invalid and never queued for dispatch. One contact's
//! failure never aborts the rest of the batch.

use crate::campaign::{self, CampaignStatus, NewLead};
use crate::config::Config;
use crate::messaging::MessagingGateway;
use anyhow::Result;
use serde::Serialize;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// A contact as it arrives from prospecting or a manual import.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub business_name: String,
    pub phone: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationSummary {
    /// Candidates dropped before any gateway call (unusable numbers).
    pub skipped: u32,
    pub checked: u32,
    pub valid: u32,
    pub invalid: u32,
    /// Gateway failures; the leads stay unchecked and can be retried.
    pub errors: u32,
}

/// Canonical digit-only international form, or `None` when the raw
/// input cannot be a dialable number.
///
/// Strips formatting, drops the `00` international dial prefix and
/// prepends the configured country code to numbers short enough to be
/// local ones.
pub fn normalize_phone(raw: &str, default_country_code: Option<&str>) -> Option<String> {
    let mut digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    if let Some(stripped) = digits.strip_prefix("00") {
        digits = stripped.to_string();
    }

    if digits.len() < 8 || digits.len() > 15 {
        return None;
    }

    if let Some(cc) = default_country_code {
        if !cc.is_empty() && digits.len() <= 11 && !digits.starts_with(cc) {
            digits = format!("{cc}{digits}");
        }
    }

    Some(digits)
}

/// Intake path: normalize each candidate, persist it as a lead and
/// record the gateway's verdict. Duplicate numbers already on the
/// campaign are skipped.
pub async fn validate_candidates(
    config: &Config,
    gateway: &dyn MessagingGateway,
    campaign_id: &str,
    candidates: &[Candidate],
) -> Result<ValidationSummary> {
    let campaign = campaign::get_campaign(config, campaign_id)?;
    let entered_validating = enter_validating(config, campaign_id, campaign.status);

    let known: std::collections::HashSet<String> = campaign::list_leads(config, campaign_id)?
        .into_iter()
        .map(|lead| lead.phone)
        .collect();

    let mut summary = ValidationSummary::default();
    let delay = Duration::from_millis(config.dispatch.validation_delay_ms);
    let cc = config.dispatch.default_country_code.as_deref();

    for (index, candidate) in candidates.iter().enumerate() {
        let Some(phone) = normalize_phone(&candidate.phone, cc) else {
            debug!(
                business = %candidate.business_name,
                raw = %candidate.phone,
                "Skipping candidate with unusable phone number"
            );
            summary.skipped += 1;
            continue;
        };

        if known.contains(&phone) {
            summary.skipped += 1;
            continue;
        }

        if index > 0 {
            // pace gateway lookups to respect third-party rate limits
            sleep(delay).await;
        }

        let lead = match campaign::insert_lead(
            config,
            campaign_id,
            &NewLead {
                business_name: candidate.business_name.clone(),
                phone: phone.clone(),
                jid: None,
            },
        ) {
            Ok(lead) => lead,
            Err(e) => {
                warn!("Failed to persist candidate '{}': {e:#}", candidate.business_name);
                summary.errors += 1;
                continue;
            }
        };

        check_one(config, gateway, &campaign.instance, &lead.id, &phone, &mut summary).await;
    }

    if entered_validating {
        leave_validating(config, campaign_id);
    }

    info!(
        campaign = campaign_id,
        checked = summary.checked,
        valid = summary.valid,
        invalid = summary.invalid,
        errors = summary.errors,
        skipped = summary.skipped,
        "Candidate validation finished"
    );
    Ok(summary)
}

/// Re-check leads a previous run left unverified (gateway outage,
/// process restart mid-batch).
pub async fn validate_pending(
    config: &Config,
    gateway: &dyn MessagingGateway,
    campaign_id: &str,
) -> Result<ValidationSummary> {
    let campaign = campaign::get_campaign(config, campaign_id)?;
    let entered_validating = enter_validating(config, campaign_id, campaign.status);

    let leads = campaign::unvalidated_leads(config, campaign_id)?;
    let mut summary = ValidationSummary::default();
    let delay = Duration::from_millis(config.dispatch.validation_delay_ms);

    for (index, lead) in leads.iter().enumerate() {
        if index > 0 {
            sleep(delay).await;
        }
        check_one(config, gateway, &campaign.instance, &lead.id, &lead.phone, &mut summary).await;
    }

    if entered_validating {
        leave_validating(config, campaign_id);
    }
    Ok(summary)
}

async fn check_one(
    config: &Config,
    gateway: &dyn MessagingGateway,
    instance: &str,
    lead_id: &str,
    phone: &str,
    summary: &mut ValidationSummary,
) {
    match gateway.check_number(instance, phone).await {
        Ok(check) => {
            summary.checked += 1;
            if check.exists {
                summary.valid += 1;
            } else {
                summary.invalid += 1;
            }
            if let Err(e) =
                campaign::mark_lead_validity(config, lead_id, check.exists, check.jid.as_deref())
            {
                warn!("Failed to persist validity for lead {lead_id}: {e:#}");
                summary.errors += 1;
            }
        }
        Err(e) => {
            warn!("Number check failed for {phone}: {e:#}");
            summary.errors += 1;
        }
    }
}

fn enter_validating(config: &Config, campaign_id: &str, current: CampaignStatus) -> bool {
    if current.can_transition(CampaignStatus::Validating) {
        match campaign::set_campaign_status(config, campaign_id, CampaignStatus::Validating) {
            Ok(_) => return true,
            Err(e) => warn!("Could not enter validating state: {e:#}"),
        }
    }
    false
}

fn leave_validating(config: &Config, campaign_id: &str) {
    if let Err(e) = campaign::set_campaign_status(config, campaign_id, CampaignStatus::Draft) {
        warn!("Could not leave validating state: {e:#}");
    }
}
