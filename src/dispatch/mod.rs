//! Campaign dispatch engine.
//!
//! Owns the single-flight registry of live runs and the control
//! surface the dashboard calls: start, pause, resume, cancel, plus the
//! progress read. All control operations return immediately; the
//! waiting happens inside the per-campaign worker task.

mod progress;
mod worker;

pub use progress::{
    EventLevel, ProgressCounts, ProgressEvent, ProgressSnapshot, ProgressTracker, Stage,
};

use crate::campaign::{self, Campaign, CampaignLead, CampaignStatus};
use crate::config::Config;
use crate::messaging::{ConnectionState, MessagingGateway};
use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) type RunId = u64;

/// Live scheduling token for one campaign's run. Exactly one exists
/// per actively-dispatching campaign; dropped on pause, cancel,
/// completion or process restart.
pub(crate) struct DispatchHandle {
    run_id: RunId,
    cancel: CancellationToken,
}

/// What a control operation tells the operator. Conditions ("already
/// running", "nothing to send") are outcomes, not transport errors.
#[derive(Debug, Clone, Serialize)]
pub struct ControlOutcome {
    pub success: bool,
    pub message: String,
}

impl ControlOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub struct DispatchEngine {
    config: Config,
    gateway: Arc<dyn MessagingGateway>,
    progress: Arc<ProgressTracker>,
    handles: Arc<Mutex<HashMap<String, DispatchHandle>>>,
    next_run_id: AtomicU64,
}

impl DispatchEngine {
    pub fn new(config: Config, gateway: Arc<dyn MessagingGateway>) -> Self {
        let capacity = config.dispatch.progress_log_capacity;
        Self {
            config,
            gateway,
            progress: Arc::new(ProgressTracker::new(capacity)),
            handles: Arc::new(Mutex::new(HashMap::new())),
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Begin dispatching a campaign. The first message goes out
    /// immediately; the call itself returns as soon as the run is
    /// accepted and its worker spawned.
    pub async fn start(&self, campaign_id: &str) -> ControlOutcome {
        // Claim the registry slot first: two concurrent starts must
        // resolve to exactly one run.
        let (run_id, cancel) = {
            let mut handles = self.handles.lock();
            if handles.contains_key(campaign_id) {
                return ControlOutcome::rejected("Dispatch is already running for this campaign");
            }
            let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            handles.insert(
                campaign_id.to_string(),
                DispatchHandle {
                    run_id,
                    cancel: cancel.clone(),
                },
            );
            (run_id, cancel)
        };

        match self.prepare_run(campaign_id).await {
            Ok((campaign, queue)) => {
                self.progress.begin(
                    campaign_id,
                    Stage::Dispatching,
                    ProgressCounts {
                        total: campaign.total_leads,
                        sent: campaign.sent_messages,
                        failed: campaign.failed_messages,
                    },
                );
                let ctx = worker::RunContext {
                    config: self.config.clone(),
                    gateway: Arc::clone(&self.gateway),
                    progress: Arc::clone(&self.progress),
                    handles: Arc::clone(&self.handles),
                    run_id,
                    cancel,
                };
                tokio::spawn(worker::run_campaign(ctx, campaign, queue));
                ControlOutcome::ok("Dispatch started")
            }
            Err(message) => {
                self.release_slot(campaign_id, run_id);
                ControlOutcome::rejected(message)
            }
        }
    }

    /// Everything that must hold before the campaign turns `active`.
    /// Fails without touching campaign state.
    async fn prepare_run(&self, campaign_id: &str) -> Result<(Campaign, Vec<CampaignLead>), String> {
        let campaign = campaign::get_campaign(&self.config, campaign_id)
            .map_err(|e| format!("Campaign lookup failed: {e:#}"))?;

        if campaign.status == CampaignStatus::Active {
            return Err(
                "Campaign is marked active with no live run; pause it first (or restart recovery \
                 will)"
                    .to_string(),
            );
        }
        if !campaign.status.can_transition(CampaignStatus::Active) {
            return Err(format!(
                "Campaign cannot start dispatching from status '{}'",
                campaign.status.as_str()
            ));
        }

        campaign::validate_intervals(
            campaign.min_interval_minutes,
            campaign.max_interval_minutes,
        )
        .map_err(|e| format!("Invalid campaign schedule: {e:#}"))?;

        match self.gateway.connection_state(&campaign.instance).await {
            Ok(ConnectionState::Open) => {}
            Ok(state) => {
                return Err(format!(
                    "Gateway instance '{}' is not connected (state: {})",
                    campaign.instance,
                    state.as_str()
                ));
            }
            Err(e) => {
                return Err(format!("Gateway instance check failed: {e:#}"));
            }
        }

        let queue = campaign::pending_leads(&self.config, campaign_id)
            .map_err(|e| format!("Could not build dispatch queue: {e:#}"))?;
        if queue.is_empty() {
            return Err("Nothing to send: no validated pending leads".to_string());
        }

        let campaign = campaign::set_campaign_status(&self.config, campaign_id, CampaignStatus::Active)
            .map_err(|e| format!("Could not activate campaign: {e:#}"))?;

        Ok((campaign, queue))
    }

    /// Stop scheduling future sends and leave the campaign resumable.
    /// Safe to call with no armed timer; a send already underway is
    /// never interrupted.
    pub async fn pause(&self, campaign_id: &str) -> ControlOutcome {
        let had_run = self.cancel_run(campaign_id);

        let campaign = match campaign::get_campaign(&self.config, campaign_id) {
            Ok(campaign) => campaign,
            Err(e) => return ControlOutcome::rejected(format!("Campaign lookup failed: {e:#}")),
        };

        match campaign.status {
            CampaignStatus::Active => {
                match campaign::set_campaign_status(&self.config, campaign_id, CampaignStatus::Paused)
                {
                    Ok(_) => {
                        self.progress.set_stage(campaign_id, Stage::Paused);
                        self.progress.push_event(
                            campaign_id,
                            EventLevel::Info,
                            "Dispatch paused; remaining leads stay queued",
                        );
                        info!(campaign = %campaign_id, "Dispatch paused");
                        ControlOutcome::ok("Dispatch paused")
                    }
                    Err(e) => ControlOutcome::rejected(format!("Could not pause campaign: {e:#}")),
                }
            }
            CampaignStatus::Paused => ControlOutcome::ok("Campaign is already paused"),
            other => {
                if had_run {
                    warn!(
                        campaign = %campaign_id,
                        status = other.as_str(),
                        "Cancelled a live run for a campaign not marked active"
                    );
                }
                ControlOutcome::rejected(format!(
                    "Campaign is not dispatching (status: {})",
                    other.as_str()
                ))
            }
        }
    }

    /// Resume is a restart: the pending set is re-derived from
    /// persisted lead state, so it is safe after a partial run.
    pub async fn resume(&self, campaign_id: &str) -> ControlOutcome {
        self.start(campaign_id).await
    }

    /// Terminal stop. Pending leads keep their `pending` label.
    pub async fn cancel(&self, campaign_id: &str) -> ControlOutcome {
        self.cancel_run(campaign_id);

        let campaign = match campaign::get_campaign(&self.config, campaign_id) {
            Ok(campaign) => campaign,
            Err(e) => return ControlOutcome::rejected(format!("Campaign lookup failed: {e:#}")),
        };

        if campaign.status == CampaignStatus::Cancelled {
            return ControlOutcome::ok("Campaign is already cancelled");
        }
        if !campaign.status.can_transition(CampaignStatus::Cancelled) {
            return ControlOutcome::rejected(format!(
                "Campaign cannot be cancelled from status '{}'",
                campaign.status.as_str()
            ));
        }

        match campaign::set_campaign_status(&self.config, campaign_id, CampaignStatus::Cancelled) {
            Ok(_) => {
                self.progress.set_stage(campaign_id, Stage::Cancelled);
                self.progress.push_event(
                    campaign_id,
                    EventLevel::Warning,
                    "Dispatch cancelled by operator",
                );
                info!(campaign = %campaign_id, "Dispatch cancelled");
                ControlOutcome::ok("Dispatch cancelled")
            }
            Err(e) => ControlOutcome::rejected(format!("Could not cancel campaign: {e:#}")),
        }
    }

    /// Snapshot for the polling UI. After a restart the in-memory
    /// tracker is empty, so fall back to the persisted record.
    pub fn progress(&self, campaign_id: &str) -> Option<ProgressSnapshot> {
        if let Some(snapshot) = self.progress.snapshot(campaign_id) {
            return Some(snapshot);
        }

        let campaign = campaign::get_campaign(&self.config, campaign_id).ok()?;
        Some(ProgressSnapshot {
            stage: stage_for_status(campaign.status),
            current_lead_id: campaign.current_lead_id,
            next_dispatch_at: campaign.next_dispatch_at,
            estimated_completion_at: campaign.estimated_completion_at,
            counts: ProgressCounts {
                total: campaign.total_leads,
                sent: campaign.sent_messages,
                failed: campaign.failed_messages,
            },
            events: Vec::new(),
        })
    }

    pub fn is_running(&self, campaign_id: &str) -> bool {
        self.handles.lock().contains_key(campaign_id)
    }

    pub fn forget_progress(&self, campaign_id: &str) {
        self.progress.remove(campaign_id);
    }

    /// Startup recovery: campaigns the previous process left `active`
    /// have no live run anymore. Force them to `paused` so the
    /// operator can resume deliberately.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let stuck = campaign::campaigns_in_status(&self.config, CampaignStatus::Active)?;
        let mut recovered = 0;

        for campaign in stuck {
            match campaign::set_campaign_status(&self.config, &campaign.id, CampaignStatus::Paused)
            {
                Ok(_) => {
                    self.progress.push_event(
                        &campaign.id,
                        EventLevel::Warning,
                        "Dispatch was interrupted by a restart; campaign paused",
                    );
                    self.progress.set_stage(&campaign.id, Stage::Paused);
                    warn!(
                        campaign = %campaign.id,
                        "Recovered interrupted dispatch: campaign forced to paused"
                    );
                    recovered += 1;
                }
                Err(e) => warn!("Could not recover campaign {}: {e:#}", campaign.id),
            }
        }

        Ok(recovered)
    }

    /// Cancel and drop the live run for a campaign, if any.
    /// Returns whether a run existed.
    fn cancel_run(&self, campaign_id: &str) -> bool {
        let handle = self.handles.lock().remove(campaign_id);
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a claimed slot, but only if it still belongs to this run.
    fn release_slot(&self, campaign_id: &str, run_id: RunId) {
        let mut handles = self.handles.lock();
        if handles
            .get(campaign_id)
            .is_some_and(|handle| handle.run_id == run_id)
        {
            handles.remove(campaign_id);
        }
    }
}

fn stage_for_status(status: CampaignStatus) -> Stage {
    match status {
        CampaignStatus::Active => Stage::Dispatching,
        CampaignStatus::Paused => Stage::Paused,
        CampaignStatus::Completed => Stage::Completed,
        CampaignStatus::Cancelled => Stage::Cancelled,
        _ => Stage::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{
        create_campaign, get_campaign, insert_lead, mark_lead_validity, NewCampaign, NewLead,
    };
    use crate::messaging::{NumberCheck, SentMessage};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Gateway double with a switchable connection state and an
    /// optional per-destination failure script.
    struct TestGateway {
        state: Mutex<ConnectionState>,
        failing: Mutex<std::collections::HashSet<String>>,
        sends: Mutex<Vec<String>>,
    }

    impl TestGateway {
        fn open() -> Self {
            Self {
                state: Mutex::new(ConnectionState::Open),
                failing: Mutex::new(std::collections::HashSet::new()),
                sends: Mutex::new(Vec::new()),
            }
        }

        fn closed() -> Self {
            let gateway = Self::open();
            *gateway.state.lock() = ConnectionState::Closed;
            gateway
        }

        fn sends(&self) -> Vec<String> {
            self.sends.lock().clone()
        }
    }

    #[async_trait]
    impl MessagingGateway for TestGateway {
        async fn connection_state(&self, _instance: &str) -> anyhow::Result<ConnectionState> {
            Ok(*self.state.lock())
        }

        async fn check_number(&self, _instance: &str, phone: &str) -> anyhow::Result<NumberCheck> {
            Ok(NumberCheck {
                exists: true,
                jid: Some(format!("{phone}@s.whatsapp.net")),
            })
        }

        async fn send_text(
            &self,
            _instance: &str,
            destination: &str,
            _text: &str,
        ) -> anyhow::Result<SentMessage> {
            if self.failing.lock().contains(destination) {
                anyhow::bail!("gateway rejected message");
            }
            self.sends.lock().push(destination.to_string());
            Ok(SentMessage { id: "wamid".into() })
        }
    }

    fn test_config(tmp: &TempDir) -> Config {
        Config {
            workspace_dir: tmp.path().join("workspace"),
            config_path: tmp.path().join("config.toml"),
            ..Config::default()
        }
    }

    fn campaign_with_leads(config: &Config, lead_count: usize) -> String {
        let campaign = create_campaign(
            config,
            &NewCampaign {
                name: "test".into(),
                message_template: "hello there".into(),
                instance: "main".into(),
                min_interval_minutes: 1,
                max_interval_minutes: 1,
            },
        )
        .unwrap();

        for n in 1..=lead_count {
            let lead = insert_lead(
                config,
                &campaign.id,
                &NewLead {
                    business_name: format!("Shop {n}"),
                    phone: format!("55119999900{n:02}"),
                    jid: None,
                },
            )
            .unwrap();
            mark_lead_validity(config, &lead.id, true, None).unwrap();
        }

        campaign.id
    }

    #[tokio::test(start_paused = true)]
    async fn start_rejects_concurrent_second_call() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let campaign_id = campaign_with_leads(&config, 3);
        let engine = DispatchEngine::new(config, Arc::new(TestGateway::open()));

        let first = engine.start(&campaign_id).await;
        assert!(first.success, "{}", first.message);

        let second = engine.start(&campaign_id).await;
        assert!(!second.success);
        assert!(second.message.contains("already running"));
        assert!(engine.is_running(&campaign_id));
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_connected_gateway_leaves_campaign_draft() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let campaign_id = campaign_with_leads(&config, 2);
        let engine = DispatchEngine::new(config.clone(), Arc::new(TestGateway::closed()));

        let outcome = engine.start(&campaign_id).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("not connected"));

        let campaign = get_campaign(&config, &campaign_id).unwrap();
        assert_eq!(campaign.status, CampaignStatus::Draft);
        assert!(!engine.is_running(&campaign_id));
    }

    #[tokio::test(start_paused = true)]
    async fn start_with_empty_queue_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let campaign_id = campaign_with_leads(&config, 0);
        let engine = DispatchEngine::new(config.clone(), Arc::new(TestGateway::open()));

        let outcome = engine.start(&campaign_id).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("Nothing to send"));
        assert_eq!(
            get_campaign(&config, &campaign_id).unwrap().status,
            CampaignStatus::Draft
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pause_without_armed_timer_is_clean() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let campaign_id = campaign_with_leads(&config, 1);
        let engine = DispatchEngine::new(config, Arc::new(TestGateway::open()));

        let outcome = engine.pause(&campaign_id).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("not dispatching"));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_single_lead_campaign_never_arms_a_timer() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let campaign_id = campaign_with_leads(&config, 1);
        let gateway = Arc::new(TestGateway::open());
        let engine = DispatchEngine::new(config.clone(), Arc::clone(&gateway) as Arc<dyn MessagingGateway>);

        let outcome = engine.start(&campaign_id).await;
        assert!(outcome.success);

        // no timer to advance past: the run finishes on its own
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        assert_eq!(gateway.sends().len(), 1);
        assert_eq!(
            get_campaign(&config, &campaign_id).unwrap().status,
            CampaignStatus::Completed
        );
        assert!(!engine.is_running(&campaign_id));

        let snapshot = engine.progress(&campaign_id).unwrap();
        assert_eq!(snapshot.stage, Stage::Completed);
        assert_eq!(snapshot.counts.sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_completion_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let campaign_id = campaign_with_leads(&config, 1);
        let engine = DispatchEngine::new(config, Arc::new(TestGateway::open()));

        engine.start(&campaign_id).await;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let outcome = engine.start(&campaign_id).await;
        assert!(!outcome.success);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_terminal_and_frees_the_slot() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let campaign_id = campaign_with_leads(&config, 3);
        let engine = DispatchEngine::new(config.clone(), Arc::new(TestGateway::open()));

        engine.start(&campaign_id).await;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let outcome = engine.cancel(&campaign_id).await;
        assert!(outcome.success, "{}", outcome.message);
        assert!(!engine.is_running(&campaign_id));
        assert_eq!(
            get_campaign(&config, &campaign_id).unwrap().status,
            CampaignStatus::Cancelled
        );

        let restart = engine.start(&campaign_id).await;
        assert!(!restart.success);
        assert!(restart.message.contains("cannot start"));
    }

    #[tokio::test(start_paused = true)]
    async fn recover_interrupted_forces_active_campaigns_to_paused() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let campaign_id = campaign_with_leads(&config, 2);
        campaign::set_campaign_status(&config, &campaign_id, CampaignStatus::Active).unwrap();

        let engine = DispatchEngine::new(config.clone(), Arc::new(TestGateway::open()));
        let recovered = engine.recover_interrupted().unwrap();

        assert_eq!(recovered, 1);
        assert_eq!(
            get_campaign(&config, &campaign_id).unwrap().status,
            CampaignStatus::Paused
        );

        let snapshot = engine.progress(&campaign_id).unwrap();
        assert!(snapshot
            .events
            .iter()
            .any(|event| event.message.contains("interrupted")));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_falls_back_to_store_after_restart() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let campaign_id = campaign_with_leads(&config, 2);
        campaign::set_campaign_status(&config, &campaign_id, CampaignStatus::Active).unwrap();
        campaign::set_campaign_status(&config, &campaign_id, CampaignStatus::Paused).unwrap();

        // fresh engine, empty tracker: snapshot comes from the record
        let engine = DispatchEngine::new(config, Arc::new(TestGateway::open()));
        let snapshot = engine.progress(&campaign_id).unwrap();
        assert_eq!(snapshot.stage, Stage::Paused);
        assert_eq!(snapshot.counts.total, 2);
        assert!(snapshot.events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_campaign_has_no_progress() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let engine = DispatchEngine::new(config, Arc::new(TestGateway::open()));
        assert!(engine.progress("nope").is_none());
    }
}
