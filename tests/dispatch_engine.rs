//! End-to-end dispatch engine scenarios, driven on a paused tokio
//! clock so minute-scale pacing runs instantly and deterministically.

use async_trait::async_trait;
use leadcaster::campaign::{
    self, CampaignStatus, LeadMessageStatus, NewCampaign, NewLead, SendOutcome,
};
use leadcaster::config::Config;
use leadcaster::dispatch::{DispatchEngine, Stage};
use leadcaster::messaging::{ConnectionState, MessagingGateway, NumberCheck, SentMessage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

/// Scripted gateway double: records every send with its (paused-clock)
/// timestamp and fails the destinations it was told to fail.
struct RecordingGateway {
    state: Mutex<ConnectionState>,
    failing: Mutex<HashSet<String>>,
    sends: Mutex<Vec<(String, Instant)>>,
}

impl RecordingGateway {
    fn open() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Open),
            failing: Mutex::new(HashSet::new()),
            sends: Mutex::new(Vec::new()),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn fail_destination(&self, destination: &str) {
        self.failing.lock().insert(destination.to_string());
    }

    fn sends(&self) -> Vec<(String, Instant)> {
        self.sends.lock().clone()
    }

    fn destinations(&self) -> Vec<String> {
        self.sends.lock().iter().map(|(d, _)| d.clone()).collect()
    }
}

#[async_trait]
impl MessagingGateway for RecordingGateway {
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
            anyhow::bail!("gateway refused the message");
        }
        self.sends
            .lock()
            .push((destination.to_string(), Instant::now()));
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

/// Campaign with `count` validated pending leads and a fixed
/// one-minute interval window.
fn seeded_campaign(config: &Config, count: usize) -> (String, Vec<String>) {
    let created = campaign::create_campaign(
        config,
        &NewCampaign {
            name: "integration".into(),
            message_template: "Hello from the shop next door!".into(),
            instance: "main".into(),
            min_interval_minutes: 1,
            max_interval_minutes: 1,
        },
    )
    .unwrap();

    let mut phones = Vec::new();
    for n in 1..=count {
        let phone = format!("55119999000{n:02}");
        let lead = campaign::insert_lead(
            config,
            &created.id,
            &NewLead {
                business_name: format!("Shop {n}"),
                phone: phone.clone(),
                jid: None,
            },
        )
        .unwrap();
        campaign::mark_lead_validity(config, &lead.id, true, None).unwrap();
        phones.push(phone);
    }

    (created.id, phones)
}

async fn settle() {
    // lets spawned workers run and the paused clock catch up
    tokio::time::sleep(Duration::from_secs(1)).await;
}

// ── Scenario A: full run on a fixed interval ────────────────────

#[tokio::test(start_paused = true)]
async fn scenario_a_five_leads_sent_in_order_one_minute_apart() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (campaign_id, phones) = seeded_campaign(&config, 5);
    let gateway = Arc::new(RecordingGateway::open());
    let engine = DispatchEngine::new(config.clone(), Arc::clone(&gateway) as Arc<dyn MessagingGateway>);

    let begun = Instant::now();
    let outcome = engine.start(&campaign_id).await;
    assert!(outcome.success, "{}", outcome.message);

    // allow the full chain (4 one-minute waits) to play out
    tokio::time::sleep(Duration::from_secs(5 * 60)).await;

    let sends = gateway.sends();
    assert_eq!(sends.len(), 5);
    assert_eq!(gateway.destinations(), phones);

    // first send immediate, then one-minute spacing
    let offsets: Vec<u64> = sends
        .iter()
        .map(|(_, at)| at.duration_since(begun).as_secs())
        .collect();
    assert_eq!(offsets[0], 0);
    for (i, offset) in offsets.iter().enumerate().skip(1) {
        assert_eq!(*offset, i as u64 * 60, "send {i} mistimed: {offsets:?}");
    }

    let finished = campaign::get_campaign(&config, &campaign_id).unwrap();
    assert_eq!(finished.status, CampaignStatus::Completed);
    assert_eq!(finished.sent_messages, 5);
    assert_eq!(finished.failed_messages, 0);
    assert!(!engine.is_running(&campaign_id));

    let snapshot = engine.progress(&campaign_id).unwrap();
    assert_eq!(snapshot.stage, Stage::Completed);
    assert_eq!(snapshot.counts.sent, 5);
}

// ── Scenario B: pause mid-run, resume re-derives the queue ──────

#[tokio::test(start_paused = true)]
async fn scenario_b_pause_after_first_send_then_resume() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (campaign_id, phones) = seeded_campaign(&config, 5);
    let gateway = Arc::new(RecordingGateway::open());
    let engine = DispatchEngine::new(config.clone(), Arc::clone(&gateway) as Arc<dyn MessagingGateway>);

    engine.start(&campaign_id).await;

    // t = 30s: L1 is out, the timer for L2 is still armed
    tokio::time::sleep(Duration::from_secs(30)).await;
    let outcome = engine.pause(&campaign_id).await;
    assert!(outcome.success, "{}", outcome.message);

    let paused = campaign::get_campaign(&config, &campaign_id).unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);
    assert_eq!(gateway.sends().len(), 1);
    assert!(!engine.is_running(&campaign_id));

    // no further sends or log entries while paused
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(gateway.sends().len(), 1);
    assert_eq!(
        campaign::list_message_logs(&config, &campaign_id, 100)
            .unwrap()
            .len(),
        1
    );

    let still_pending: Vec<_> = campaign::pending_leads(&config, &campaign_id)
        .unwrap()
        .into_iter()
        .map(|lead| lead.phone)
        .collect();
    assert_eq!(still_pending, phones[1..].to_vec());

    // resume picks the pending set back up, in the same order
    let outcome = engine.resume(&campaign_id).await;
    assert!(outcome.success, "{}", outcome.message);
    tokio::time::sleep(Duration::from_secs(5 * 60)).await;

    assert_eq!(gateway.destinations(), phones);
    let finished = campaign::get_campaign(&config, &campaign_id).unwrap();
    assert_eq!(finished.status, CampaignStatus::Completed);
    assert_eq!(finished.sent_messages, 5);
}

// ── Scenario C: one failing lead never stops the loop ───────────

#[tokio::test(start_paused = true)]
async fn scenario_c_failed_lead_is_recorded_and_skipped() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (campaign_id, phones) = seeded_campaign(&config, 5);
    let gateway = Arc::new(RecordingGateway::open());
    gateway.fail_destination(&phones[2]);
    let engine = DispatchEngine::new(config.clone(), Arc::clone(&gateway) as Arc<dyn MessagingGateway>);

    engine.start(&campaign_id).await;
    tokio::time::sleep(Duration::from_secs(5 * 60)).await;

    // L3 failed, the other four went out
    assert_eq!(gateway.sends().len(), 4);

    let finished = campaign::get_campaign(&config, &campaign_id).unwrap();
    assert_eq!(finished.status, CampaignStatus::Completed);
    assert_eq!(finished.sent_messages, 4);
    assert_eq!(finished.failed_messages, 1);

    let leads = campaign::list_leads(&config, &campaign_id).unwrap();
    let failed: Vec<_> = leads
        .iter()
        .filter(|lead| lead.message_status == LeadMessageStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].phone, phones[2]);
    assert!(failed[0]
        .message_error
        .as_deref()
        .unwrap()
        .contains("refused"));

    let logs = campaign::list_message_logs(&config, &campaign_id, 100).unwrap();
    assert_eq!(logs.len(), 5);
    assert_eq!(
        logs.iter()
            .filter(|log| log.outcome == SendOutcome::Failed)
            .count(),
        1
    );
}

// ── Scenario D: no connected gateway, no state change ───────────

#[tokio::test(start_paused = true)]
async fn scenario_d_disconnected_gateway_rejects_start() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (campaign_id, _) = seeded_campaign(&config, 3);
    let gateway = Arc::new(RecordingGateway::open());
    gateway.set_state(ConnectionState::Connecting);
    let engine = DispatchEngine::new(config.clone(), Arc::clone(&gateway) as Arc<dyn MessagingGateway>);

    let outcome = engine.start(&campaign_id).await;
    assert!(!outcome.success);
    assert!(outcome.message.contains("not connected"));

    let campaign = campaign::get_campaign(&config, &campaign_id).unwrap();
    assert_eq!(campaign.status, CampaignStatus::Draft);
    assert!(gateway.sends().is_empty());
    assert!(!engine.is_running(&campaign_id));
}

// ── Cross-cutting properties ────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn single_flight_second_start_rejected_while_running() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (campaign_id, _) = seeded_campaign(&config, 3);
    let gateway = Arc::new(RecordingGateway::open());
    let engine = DispatchEngine::new(config, Arc::clone(&gateway) as Arc<dyn MessagingGateway>);

    assert!(engine.start(&campaign_id).await.success);
    settle().await;

    let second = engine.start(&campaign_id).await;
    assert!(!second.success);

    // still exactly one timer chain: one send so far, one pending
    assert_eq!(gateway.sends().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn no_lead_ever_has_two_sent_log_entries() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (campaign_id, _) = seeded_campaign(&config, 4);
    let gateway = Arc::new(RecordingGateway::open());
    let engine = DispatchEngine::new(config.clone(), Arc::clone(&gateway) as Arc<dyn MessagingGateway>);

    engine.start(&campaign_id).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    engine.pause(&campaign_id).await;
    engine.resume(&campaign_id).await;
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;

    let logs = campaign::list_message_logs(&config, &campaign_id, 100).unwrap();
    let mut sent_per_lead = std::collections::HashMap::new();
    for log in logs.iter().filter(|log| log.outcome == SendOutcome::Sent) {
        *sent_per_lead.entry(log.lead_id.clone()).or_insert(0u32) += 1;
    }
    assert!(sent_per_lead.values().all(|&count| count == 1));
    assert_eq!(sent_per_lead.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn counters_only_grow_across_the_run() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (campaign_id, phones) = seeded_campaign(&config, 4);
    let gateway = Arc::new(RecordingGateway::open());
    gateway.fail_destination(&phones[1]);
    let engine = DispatchEngine::new(config.clone(), Arc::clone(&gateway) as Arc<dyn MessagingGateway>);

    engine.start(&campaign_id).await;

    let mut last_sent = 0;
    let mut last_failed = 0;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let campaign = campaign::get_campaign(&config, &campaign_id).unwrap();
        assert!(campaign.sent_messages >= last_sent);
        assert!(campaign.failed_messages >= last_failed);
        assert!(campaign.sent_messages + campaign.failed_messages <= campaign.total_leads);
        last_sent = campaign.sent_messages;
        last_failed = campaign.failed_messages;
    }

    assert_eq!(last_sent, 3);
    assert_eq!(last_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_leaves_pending_leads_pending() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (campaign_id, _) = seeded_campaign(&config, 5);
    let gateway = Arc::new(RecordingGateway::open());
    let engine = DispatchEngine::new(config.clone(), Arc::clone(&gateway) as Arc<dyn MessagingGateway>);

    engine.start(&campaign_id).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let outcome = engine.cancel(&campaign_id).await;
    assert!(outcome.success);

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(gateway.sends().len(), 1);

    let campaign = campaign::get_campaign(&config, &campaign_id).unwrap();
    assert_eq!(campaign.status, CampaignStatus::Cancelled);

    // cancellation does not relabel unsent leads
    let leads = campaign::list_leads(&config, &campaign_id).unwrap();
    let pending = leads
        .iter()
        .filter(|lead| lead.message_status == LeadMessageStatus::Pending)
        .count();
    assert_eq!(pending, 4);

    // a cancelled campaign cannot be resumed
    let resume = engine.resume(&campaign_id).await;
    assert!(!resume.success);
}

#[tokio::test(start_paused = true)]
async fn progress_snapshot_tracks_schedule_between_sends() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (campaign_id, _) = seeded_campaign(&config, 2);
    let gateway = Arc::new(RecordingGateway::open());
    let engine = DispatchEngine::new(config.clone(), Arc::clone(&gateway) as Arc<dyn MessagingGateway>);

    engine.start(&campaign_id).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let snapshot = engine.progress(&campaign_id).unwrap();
    assert_eq!(snapshot.stage, Stage::Dispatching);
    assert_eq!(snapshot.counts.sent, 1);
    assert!(snapshot.next_dispatch_at.is_some());
    assert!(snapshot.estimated_completion_at.is_some());
    assert!(!snapshot.events.is_empty());

    // the persisted record carries the same live-progress fields
    let record = campaign::get_campaign(&config, &campaign_id).unwrap();
    assert!(record.next_dispatch_at.is_some());
}
