use crate::campaign::{
    validate_intervals, Campaign, CampaignLead, CampaignStatus, LeadMessageStatus, MessageLog,
    SendOutcome,
};
use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

const MAX_ERROR_BYTES: usize = 4 * 1024;
const TRUNCATED_ERROR_MARKER: &str = "...[truncated]";

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub name: String,
    pub message_template: String,
    pub instance: String,
    pub min_interval_minutes: u32,
    pub max_interval_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct NewLead {
    pub business_name: String,
    pub phone: String,
    pub jid: Option<String>,
}

pub fn create_campaign(config: &Config, new: &NewCampaign) -> Result<Campaign> {
    validate_intervals(new.min_interval_minutes, new.max_interval_minutes)?;
    if new.name.trim().is_empty() {
        anyhow::bail!("Campaign name must not be empty");
    }
    if new.instance.trim().is_empty() {
        anyhow::bail!("Campaign gateway instance must not be empty");
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    with_connection(config, |conn| {
        conn.execute(
            "INSERT INTO campaigns (
                id, name, status, message_template, instance,
                min_interval_minutes, max_interval_minutes, created_at, updated_at
             ) VALUES (?1, ?2, 'draft', ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                new.name,
                new.message_template,
                new.instance,
                new.min_interval_minutes,
                new.max_interval_minutes,
                now,
            ],
        )
        .context("Failed to insert campaign")?;
        Ok(())
    })?;

    get_campaign(config, &id)
}

pub fn get_campaign(config: &Config, campaign_id: &str) -> Result<Campaign> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![campaign_id])?;
        if let Some(row) = rows.next()? {
            map_campaign_row(row).map_err(Into::into)
        } else {
            anyhow::bail!("Campaign '{campaign_id}' not found")
        }
    })
}

pub fn list_campaigns(config: &Config) -> Result<Vec<Campaign>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], map_campaign_row)?;

        let mut campaigns = Vec::new();
        for row in rows {
            campaigns.push(row?);
        }
        Ok(campaigns)
    })
}

/// Apply a lifecycle transition, enforcing the state machine. Returns
/// the updated record; fails without writing when the transition is
/// illegal (e.g. a stale timer trying to complete a cancelled campaign).
pub fn set_campaign_status(
    config: &Config,
    campaign_id: &str,
    next: CampaignStatus,
) -> Result<Campaign> {
    let current = get_campaign(config, campaign_id)?;
    if !current.status.can_transition(next) {
        anyhow::bail!(
            "Illegal campaign transition {} -> {} for '{campaign_id}'",
            current.status.as_str(),
            next.as_str()
        );
    }

    with_connection(config, |conn| {
        conn.execute(
            "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![next.as_str(), Utc::now().to_rfc3339(), campaign_id],
        )
        .context("Failed to update campaign status")?;
        Ok(())
    })?;

    get_campaign(config, campaign_id)
}

/// Update the live-progress fields the dashboard polls between sends.
pub fn set_live_progress(
    config: &Config,
    campaign_id: &str,
    current_lead_id: Option<&str>,
    next_dispatch_at: Option<DateTime<Utc>>,
    estimated_completion_at: Option<DateTime<Utc>>,
) -> Result<()> {
    with_connection(config, |conn| {
        conn.execute(
            "UPDATE campaigns
             SET current_lead_id = ?1, next_dispatch_at = ?2,
                 estimated_completion_at = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                current_lead_id,
                next_dispatch_at.map(|t| t.to_rfc3339()),
                estimated_completion_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
                campaign_id,
            ],
        )
        .context("Failed to update campaign live progress")?;
        Ok(())
    })
}

pub fn delete_campaign(config: &Config, campaign_id: &str) -> Result<()> {
    let changed = with_connection(config, |conn| {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM message_logs WHERE campaign_id = ?1",
            params![campaign_id],
        )?;
        tx.execute(
            "DELETE FROM campaign_leads WHERE campaign_id = ?1",
            params![campaign_id],
        )?;
        let changed = tx.execute("DELETE FROM campaigns WHERE id = ?1", params![campaign_id])?;
        tx.commit().context("Failed to commit campaign delete")?;
        Ok(changed)
    })?;

    if changed == 0 {
        anyhow::bail!("Campaign '{campaign_id}' not found");
    }
    Ok(())
}

pub fn insert_lead(config: &Config, campaign_id: &str, new: &NewLead) -> Result<CampaignLead> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    with_connection(config, |conn| {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO campaign_leads (
                id, campaign_id, business_name, phone, jid, message_status, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
            params![id, campaign_id, new.business_name, new.phone, new.jid, now],
        )
        .context("Failed to insert lead")?;
        tx.execute(
            "UPDATE campaigns
             SET total_leads = total_leads + 1, updated_at = ?1
             WHERE id = ?2",
            params![now, campaign_id],
        )
        .context("Failed to bump campaign lead count")?;
        tx.commit().context("Failed to commit lead insert")?;
        Ok(())
    })?;

    get_lead(config, &id)
}

pub fn get_lead(config: &Config, lead_id: &str) -> Result<CampaignLead> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {LEAD_COLUMNS} FROM campaign_leads WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![lead_id])?;
        if let Some(row) = rows.next()? {
            map_lead_row(row).map_err(Into::into)
        } else {
            anyhow::bail!("Lead '{lead_id}' not found")
        }
    })
}

pub fn list_leads(config: &Config, campaign_id: &str) -> Result<Vec<CampaignLead>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {LEAD_COLUMNS} FROM campaign_leads WHERE campaign_id = ?1 ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![campaign_id], map_lead_row)?;

        let mut leads = Vec::new();
        for row in rows {
            leads.push(row?);
        }
        Ok(leads)
    })
}

/// Dispatch queue: validated leads still waiting to be sent, in
/// insertion order. No reordering or prioritization.
pub fn pending_leads(config: &Config, campaign_id: &str) -> Result<Vec<CampaignLead>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {LEAD_COLUMNS} FROM campaign_leads
             WHERE campaign_id = ?1 AND whatsapp_valid = 1 AND message_status = 'pending'
             ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![campaign_id], map_lead_row)?;

        let mut leads = Vec::new();
        for row in rows {
            leads.push(row?);
        }
        Ok(leads)
    })
}

/// Leads the validation gate has not yet checked against the gateway.
pub fn unvalidated_leads(config: &Config, campaign_id: &str) -> Result<Vec<CampaignLead>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {LEAD_COLUMNS} FROM campaign_leads
             WHERE campaign_id = ?1 AND whatsapp_valid IS NULL
             ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![campaign_id], map_lead_row)?;

        let mut leads = Vec::new();
        for row in rows {
            leads.push(row?);
        }
        Ok(leads)
    })
}

/// Record the validation gate's verdict. Numbers without WhatsApp are
/// excluded from dispatch by marking the lead `invalid_number`.
pub fn mark_lead_validity(
    config: &Config,
    lead_id: &str,
    valid: bool,
    jid: Option<&str>,
) -> Result<()> {
    with_connection(config, |conn| {
        if valid {
            conn.execute(
                "UPDATE campaign_leads SET whatsapp_valid = 1, jid = ?1 WHERE id = ?2",
                params![jid, lead_id],
            )
            .context("Failed to mark lead valid")?;
        } else {
            conn.execute(
                "UPDATE campaign_leads
                 SET whatsapp_valid = 0,
                     message_status = CASE WHEN message_status = 'pending'
                                           THEN 'invalid_number' ELSE message_status END
                 WHERE id = ?1",
                params![lead_id],
            )
            .context("Failed to mark lead invalid")?;
        }
        Ok(())
    })
}

/// Persist one send attempt: lead state, append-only log entry and the
/// campaign counter move together in one transaction. The lead update
/// is guarded on `pending` so a finished lead can never revert.
pub fn record_send_outcome(
    config: &Config,
    campaign_id: &str,
    lead_id: &str,
    phone: &str,
    outcome: SendOutcome,
    error: Option<&str>,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let bounded_error = error.map(truncate_error);

    with_connection(config, |conn| {
        let tx = conn.unchecked_transaction()?;

        let changed = tx
            .execute(
                "UPDATE campaign_leads
                 SET message_status = ?1, message_error = ?2
                 WHERE id = ?3 AND message_status = 'pending'",
                params![outcome.as_str(), bounded_error.as_deref(), lead_id],
            )
            .context("Failed to update lead send state")?;
        if changed == 0 {
            anyhow::bail!("Lead '{lead_id}' is not pending; refusing to record a second outcome");
        }

        tx.execute(
            "INSERT INTO message_logs (campaign_id, lead_id, phone, outcome, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                campaign_id,
                lead_id,
                phone,
                outcome.as_str(),
                bounded_error.as_deref(),
                now,
            ],
        )
        .context("Failed to append message log")?;

        let counter_sql = match outcome {
            SendOutcome::Sent => {
                "UPDATE campaigns
                 SET sent_messages = sent_messages + 1, updated_at = ?1 WHERE id = ?2"
            }
            SendOutcome::Failed => {
                "UPDATE campaigns
                 SET failed_messages = failed_messages + 1, updated_at = ?1 WHERE id = ?2"
            }
        };
        tx.execute(counter_sql, params![now, campaign_id])
            .context("Failed to bump campaign send counter")?;

        tx.commit().context("Failed to commit send outcome")?;
        Ok(())
    })
}

/// Append a log entry outside the send path (e.g. an operator note on
/// a failed delivery retry).
pub fn append_message_log(
    config: &Config,
    campaign_id: &str,
    lead_id: &str,
    phone: &str,
    outcome: SendOutcome,
    error: Option<&str>,
) -> Result<()> {
    with_connection(config, |conn| {
        conn.execute(
            "INSERT INTO message_logs (campaign_id, lead_id, phone, outcome, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                campaign_id,
                lead_id,
                phone,
                outcome.as_str(),
                error.map(truncate_error).as_deref(),
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to append message log")?;
        Ok(())
    })
}

pub fn list_message_logs(
    config: &Config,
    campaign_id: &str,
    limit: usize,
) -> Result<Vec<MessageLog>> {
    with_connection(config, |conn| {
        let lim = i64::try_from(limit.max(1)).context("Message log limit overflow")?;
        let mut stmt = conn.prepare(
            "SELECT id, campaign_id, lead_id, phone, outcome, error, created_at
             FROM message_logs
             WHERE campaign_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![campaign_id, lim], |row| {
            let outcome_raw: String = row.get(4)?;
            let outcome = match outcome_raw.as_str() {
                "sent" => SendOutcome::Sent,
                _ => SendOutcome::Failed,
            };
            Ok(MessageLog {
                id: row.get(0)?,
                campaign_id: row.get(1)?,
                lead_id: row.get(2)?,
                phone: row.get(3)?,
                outcome,
                error: row.get(5)?,
                created_at: parse_rfc3339(&row.get::<_, String>(6)?)
                    .map_err(sql_conversion_error)?,
            })
        })?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    })
}

/// Recompute `total_leads` from the leads table (used after bulk
/// imports so the aggregate cannot drift).
pub fn refresh_total_leads(config: &Config, campaign_id: &str) -> Result<u32> {
    with_connection(config, |conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM campaign_leads WHERE campaign_id = ?1",
            params![campaign_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "UPDATE campaigns SET total_leads = ?1, updated_at = ?2 WHERE id = ?3",
            params![count, Utc::now().to_rfc3339(), campaign_id],
        )
        .context("Failed to refresh campaign lead count")?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    })
}

/// Campaigns the process left `active` (e.g. before a crash). Startup
/// recovery forces these back to `paused` so they are never stuck
/// "active but nothing is running".
pub fn campaigns_in_status(config: &Config, status: CampaignStatus) -> Result<Vec<Campaign>> {
    with_connection(config, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], map_campaign_row)?;

        let mut campaigns = Vec::new();
        for row in rows {
            campaigns.push(row?);
        }
        Ok(campaigns)
    })
}

const CAMPAIGN_COLUMNS: &str = "id, name, status, message_template, instance, \
     min_interval_minutes, max_interval_minutes, total_leads, sent_messages, failed_messages, \
     current_lead_id, next_dispatch_at, estimated_completion_at, created_at, updated_at";

const LEAD_COLUMNS: &str = "id, campaign_id, business_name, phone, jid, whatsapp_valid, \
     message_status, message_error, created_at";

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_BYTES {
        return error.to_string();
    }
    let mut cutoff = MAX_ERROR_BYTES - TRUNCATED_ERROR_MARKER.len();
    while cutoff > 0 && !error.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    let mut truncated = error[..cutoff].to_string();
    truncated.push_str(TRUNCATED_ERROR_MARKER);
    truncated
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in campaign DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn sql_conversion_error(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(err.into())
}

fn map_campaign_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Campaign> {
    let status_raw: String = row.get(2)?;
    let next_dispatch_raw: Option<String> = row.get(11)?;
    let estimated_raw: Option<String> = row.get(12)?;

    Ok(Campaign {
        id: row.get(0)?,
        name: row.get(1)?,
        status: CampaignStatus::parse(&status_raw).map_err(sql_conversion_error)?,
        message_template: row.get(3)?,
        instance: row.get(4)?,
        min_interval_minutes: row.get(5)?,
        max_interval_minutes: row.get(6)?,
        total_leads: row.get(7)?,
        sent_messages: row.get(8)?,
        failed_messages: row.get(9)?,
        current_lead_id: row.get(10)?,
        next_dispatch_at: match next_dispatch_raw {
            Some(raw) => Some(parse_rfc3339(&raw).map_err(sql_conversion_error)?),
            None => None,
        },
        estimated_completion_at: match estimated_raw {
            Some(raw) => Some(parse_rfc3339(&raw).map_err(sql_conversion_error)?),
            None => None,
        },
        created_at: parse_rfc3339(&row.get::<_, String>(13)?).map_err(sql_conversion_error)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(14)?).map_err(sql_conversion_error)?,
    })
}

fn map_lead_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CampaignLead> {
    let status_raw: String = row.get(6)?;
    let valid_raw: Option<i64> = row.get(5)?;

    Ok(CampaignLead {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        business_name: row.get(2)?,
        phone: row.get(3)?,
        jid: row.get(4)?,
        whatsapp_valid: valid_raw.map(|v| v != 0),
        message_status: LeadMessageStatus::parse(&status_raw).map_err(sql_conversion_error)?,
        message_error: row.get(7)?,
        created_at: parse_rfc3339(&row.get::<_, String>(8)?).map_err(sql_conversion_error)?,
    })
}

fn with_connection<T>(config: &Config, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let db_path = config.workspace_dir.join("campaigns.db");
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }

    let conn = Connection::open(&db_path)
        .with_context(|| format!("Failed to open campaign DB: {}", db_path.display()))?;

    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE IF NOT EXISTS campaigns (
            id                      TEXT PRIMARY KEY,
            name                    TEXT NOT NULL,
            status                  TEXT NOT NULL DEFAULT 'draft',
            message_template        TEXT NOT NULL,
            instance                TEXT NOT NULL,
            min_interval_minutes    INTEGER NOT NULL,
            max_interval_minutes    INTEGER NOT NULL,
            total_leads             INTEGER NOT NULL DEFAULT 0,
            sent_messages           INTEGER NOT NULL DEFAULT 0,
            failed_messages         INTEGER NOT NULL DEFAULT 0,
            current_lead_id         TEXT,
            next_dispatch_at        TEXT,
            estimated_completion_at TEXT,
            created_at              TEXT NOT NULL,
            updated_at              TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS campaign_leads (
            id              TEXT PRIMARY KEY,
            campaign_id     TEXT NOT NULL REFERENCES campaigns(id),
            business_name   TEXT NOT NULL,
            phone           TEXT NOT NULL,
            jid             TEXT,
            whatsapp_valid  INTEGER,
            message_status  TEXT NOT NULL DEFAULT 'pending',
            message_error   TEXT,
            created_at      TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_campaign_leads_campaign
            ON campaign_leads(campaign_id);
         CREATE TABLE IF NOT EXISTS message_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id TEXT NOT NULL,
            lead_id     TEXT NOT NULL,
            phone       TEXT NOT NULL,
            outcome     TEXT NOT NULL,
            error       TEXT,
            created_at  TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_message_logs_campaign
            ON message_logs(campaign_id);",
    )
    .context("Failed to initialize campaign DB schema")?;

    f(&conn)
}
