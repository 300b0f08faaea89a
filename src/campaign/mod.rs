use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod store;

#[allow(unused_imports)]
pub use store::{
    append_message_log, campaigns_in_status, create_campaign, delete_campaign, get_campaign,
    get_lead, insert_lead, list_campaigns, list_leads, list_message_logs, mark_lead_validity,
    pending_leads, record_send_outcome, refresh_total_leads, set_campaign_status,
    set_live_progress, unvalidated_leads, NewCampaign, NewLead,
};

/// Campaign lifecycle. `Searching`/`Validating` are entered during lead
/// acquisition, before dispatch ever runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Searching,
    Validating,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Searching => "searching",
            Self::Validating => "validating",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(match raw {
            "draft" => Self::Draft,
            "searching" => Self::Searching,
            "validating" => Self::Validating,
            "active" => Self::Active,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            other => bail!("Unknown campaign status '{other}'"),
        })
    }

    /// Whether moving to `next` is a legal lifecycle transition.
    ///
    /// Stale timers must check this (via the persisted status) before
    /// acting; an out-of-band change makes the pending action a no-op.
    pub fn can_transition(self, next: Self) -> bool {
        use CampaignStatus::{
            Active, Cancelled, Completed, Draft, Paused, Searching, Validating,
        };
        match (self, next) {
            (Draft, Searching | Validating | Active | Cancelled)
            | (Searching, Validating | Draft | Cancelled)
            | (Validating, Draft | Active | Cancelled)
            | (Active, Paused | Completed | Cancelled)
            | (Paused, Active | Cancelled) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Per-lead send state. Transitions pending -> {sent | failed} at most
/// once and never reverts; `invalid_number` marks leads the validation
/// gate rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadMessageStatus {
    Pending,
    Sent,
    Failed,
    InvalidNumber,
}

impl LeadMessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::InvalidNumber => "invalid_number",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(match raw {
            "pending" => Self::Pending,
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            "invalid_number" => Self::InvalidNumber,
            other => bail!("Unknown lead message status '{other}'"),
        })
    }
}

/// Outcome of one send attempt, as recorded in the message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Sent,
    Failed,
}

impl SendOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub message_template: String,
    /// Gateway instance this campaign sends through.
    pub instance: String,
    pub min_interval_minutes: u32,
    pub max_interval_minutes: u32,
    pub total_leads: u32,
    pub sent_messages: u32,
    pub failed_messages: u32,
    pub current_lead_id: Option<String>,
    pub next_dispatch_at: Option<DateTime<Utc>>,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignLead {
    pub id: String,
    pub campaign_id: String,
    pub business_name: String,
    /// Canonical digit-only international form.
    pub phone: String,
    /// Gateway-resolved routable address, preferred over `phone` when set.
    pub jid: Option<String>,
    /// None = not yet checked against the gateway.
    pub whatsapp_valid: Option<bool>,
    pub message_status: LeadMessageStatus,
    pub message_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record, one per send attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLog {
    pub id: i64,
    pub campaign_id: String,
    pub lead_id: String,
    pub phone: String,
    pub outcome: SendOutcome,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Check interval bounds the way campaign creation does: whole minutes,
/// at least one, min never above max (never silently swapped).
pub fn validate_intervals(min_minutes: u32, max_minutes: u32) -> Result<()> {
    if max_minutes == 0 {
        bail!("max_interval_minutes must be at least 1");
    }
    if min_minutes > max_minutes {
        bail!(
            "min_interval_minutes ({min_minutes}) must not exceed max_interval_minutes ({max_minutes})"
        );
    }
    Ok(())
}
