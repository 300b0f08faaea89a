//! Live-progress snapshots for the dashboard polling loop.
//!
//! One snapshot per campaign, held in memory and rebuilt from the
//! store on restart. Events are appended only after the corresponding
//! store write, so a poll can lag the store but never lead it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Dispatching,
    Paused,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub level: EventLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProgressCounts {
    pub total: u32,
    pub sent: u32,
    pub failed: u32,
}

/// What `GET /api/campaigns/{id}/progress` returns.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub current_lead_id: Option<String>,
    pub next_dispatch_at: Option<DateTime<Utc>>,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub counts: ProgressCounts,
    pub events: Vec<ProgressEvent>,
}

struct CampaignProgress {
    stage: Stage,
    current_lead_id: Option<String>,
    next_dispatch_at: Option<DateTime<Utc>>,
    estimated_completion_at: Option<DateTime<Utc>>,
    counts: ProgressCounts,
    events: VecDeque<ProgressEvent>,
}

impl CampaignProgress {
    fn new(counts: ProgressCounts) -> Self {
        Self {
            stage: Stage::Idle,
            current_lead_id: None,
            next_dispatch_at: None,
            estimated_completion_at: None,
            counts,
            events: VecDeque::new(),
        }
    }
}

pub struct ProgressTracker {
    capacity: usize,
    inner: RwLock<HashMap<String, CampaignProgress>>,
}

impl ProgressTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// (Re)initialize a campaign's snapshot from persisted counters.
    pub fn begin(&self, campaign_id: &str, stage: Stage, counts: ProgressCounts) {
        let mut inner = self.inner.write();
        let entry = inner
            .entry(campaign_id.to_string())
            .or_insert_with(|| CampaignProgress::new(counts));
        entry.stage = stage;
        entry.counts = counts;
        entry.current_lead_id = None;
        entry.next_dispatch_at = None;
        entry.estimated_completion_at = None;
    }

    pub fn set_stage(&self, campaign_id: &str, stage: Stage) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.get_mut(campaign_id) {
            entry.stage = stage;
            if stage != Stage::Dispatching {
                entry.next_dispatch_at = None;
            }
        }
    }

    pub fn set_current_lead(&self, campaign_id: &str, lead_id: Option<&str>) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.get_mut(campaign_id) {
            entry.current_lead_id = lead_id.map(ToString::to_string);
        }
    }

    pub fn set_schedule(
        &self,
        campaign_id: &str,
        next_dispatch_at: Option<DateTime<Utc>>,
        estimated_completion_at: Option<DateTime<Utc>>,
    ) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.get_mut(campaign_id) {
            entry.next_dispatch_at = next_dispatch_at;
            entry.estimated_completion_at = estimated_completion_at;
        }
    }

    pub fn record_sent(&self, campaign_id: &str) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.get_mut(campaign_id) {
            entry.counts.sent += 1;
        }
    }

    pub fn record_failed(&self, campaign_id: &str) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.get_mut(campaign_id) {
            entry.counts.failed += 1;
        }
    }

    /// Append a human-readable event, evicting the oldest past capacity.
    pub fn push_event(&self, campaign_id: &str, level: EventLevel, message: impl Into<String>) {
        let mut inner = self.inner.write();
        let entry = inner
            .entry(campaign_id.to_string())
            .or_insert_with(|| CampaignProgress::new(ProgressCounts::default()));
        entry.events.push_back(ProgressEvent {
            level,
            message: message.into(),
            at: Utc::now(),
        });
        while entry.events.len() > self.capacity {
            entry.events.pop_front();
        }
    }

    pub fn snapshot(&self, campaign_id: &str) -> Option<ProgressSnapshot> {
        let inner = self.inner.read();
        inner.get(campaign_id).map(|entry| ProgressSnapshot {
            stage: entry.stage,
            current_lead_id: entry.current_lead_id.clone(),
            next_dispatch_at: entry.next_dispatch_at,
            estimated_completion_at: entry.estimated_completion_at,
            counts: entry.counts,
            events: entry.events.iter().cloned().collect(),
        })
    }

    pub fn remove(&self, campaign_id: &str) {
        self.inner.write().remove(campaign_id);
    }
}
