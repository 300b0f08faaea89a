//! Actor task for one campaign's dispatch run.
//!
//! One task per active campaign: send the first message immediately,
//! then alternate randomized waits and sends until the queue is
//! exhausted or the run is cancelled. The task re-checks persisted
//! campaign state before every send so a stale timer can never act on
//! a campaign that was paused, cancelled or deleted out of band.

use super::progress::{EventLevel, ProgressTracker, Stage};
use super::{DispatchHandle, RunId};
use crate::campaign::{self, Campaign, CampaignLead, CampaignStatus, SendOutcome};
use crate::config::Config;
use crate::messaging::MessagingGateway;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(super) struct RunContext {
    pub config: Config,
    pub gateway: Arc<dyn MessagingGateway>,
    pub progress: Arc<ProgressTracker>,
    pub handles: Arc<Mutex<HashMap<String, DispatchHandle>>>,
    pub run_id: RunId,
    pub cancel: CancellationToken,
}

/// Uniform whole-minute wait in `[min, max]`, both inclusive.
pub(super) fn sample_interval_minutes(min: u32, max: u32) -> u32 {
    if min >= max {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

/// Completion estimate: remaining sends spaced by the average interval.
pub(super) fn estimate_completion(
    now: DateTime<Utc>,
    remaining: usize,
    min_minutes: u32,
    max_minutes: u32,
) -> DateTime<Utc> {
    // average of min and max, in seconds: (min + max) / 2 * 60
    let avg_secs = i64::from(min_minutes + max_minutes) * 30;
    now + ChronoDuration::seconds(avg_secs * remaining as i64)
}

pub(super) async fn run_campaign(ctx: RunContext, campaign: Campaign, queue: Vec<CampaignLead>) {
    let campaign_id = campaign.id.clone();
    let total = queue.len();
    info!(
        campaign = %campaign_id,
        queued = total,
        "Dispatch run started"
    );
    ctx.progress.push_event(
        &campaign_id,
        EventLevel::Info,
        format!("Dispatch started: {total} message(s) queued"),
    );

    for (index, lead) in queue.iter().enumerate() {
        // A pause/cancel that landed while the previous send was in
        // flight: stop before scheduling anything further.
        if ctx.cancel.is_cancelled() {
            release_handle(&ctx, &campaign_id);
            return;
        }

        if index > 0 {
            let wait_minutes = sample_interval_minutes(
                campaign.min_interval_minutes,
                campaign.max_interval_minutes,
            );
            let now = Utc::now();
            let next_at = now + ChronoDuration::minutes(i64::from(wait_minutes));
            let estimated = estimate_completion(
                now,
                total - index,
                campaign.min_interval_minutes,
                campaign.max_interval_minutes,
            );

            if let Err(e) = campaign::set_live_progress(
                &ctx.config,
                &campaign_id,
                Some(&lead.id),
                Some(next_at),
                Some(estimated),
            ) {
                warn!("Failed to persist next-dispatch time: {e:#}");
            }
            ctx.progress
                .set_schedule(&campaign_id, Some(next_at), Some(estimated));
            ctx.progress.push_event(
                &campaign_id,
                EventLevel::Info,
                format!("Next message to {} in {wait_minutes} min", lead.business_name),
            );

            tokio::select! {
                () = ctx.cancel.cancelled() => {
                    // pause/cancel already transitioned the campaign
                    info!(campaign = %campaign_id, "Dispatch run stopped before next send");
                    release_handle(&ctx, &campaign_id);
                    return;
                }
                () = sleep(Duration::from_secs(u64::from(wait_minutes) * 60)) => {}
            }
        }

        // A cancel that raced the timer: never send after cancellation
        // was requested.
        if ctx.cancel.is_cancelled() {
            release_handle(&ctx, &campaign_id);
            return;
        }

        // Stale-timer guard: the campaign must still be active in the
        // store before we act on it.
        match campaign::get_campaign(&ctx.config, &campaign_id) {
            Ok(current) if current.status == CampaignStatus::Active => {}
            Ok(current) => {
                info!(
                    campaign = %campaign_id,
                    status = current.status.as_str(),
                    "Campaign no longer active; stopping dispatch run"
                );
                release_handle(&ctx, &campaign_id);
                return;
            }
            Err(e) => {
                warn!("Could not re-check campaign state, stopping run: {e:#}");
                release_handle(&ctx, &campaign_id);
                return;
            }
        }

        dispatch_one(&ctx, &campaign, lead).await;
    }

    finish_run(&ctx, &campaign_id);
}

/// One send attempt for one lead. Failures are recorded on the lead
/// and the log; they never abort the loop.
async fn dispatch_one(ctx: &RunContext, campaign: &Campaign, lead: &CampaignLead) {
    let campaign_id = &campaign.id;
    ctx.progress.set_current_lead(campaign_id, Some(&lead.id));

    // JID wins over the raw number when the gateway resolved one
    let destination = lead.jid.as_deref().unwrap_or(&lead.phone);

    match ctx
        .gateway
        .send_text(&campaign.instance, destination, &campaign.message_template)
        .await
    {
        Ok(sent) => {
            match campaign::record_send_outcome(
                &ctx.config,
                campaign_id,
                &lead.id,
                &lead.phone,
                SendOutcome::Sent,
                None,
            ) {
                Ok(()) => {
                    ctx.progress.record_sent(campaign_id);
                    ctx.progress.push_event(
                        campaign_id,
                        EventLevel::Success,
                        format!("Sent to {} ({})", lead.business_name, lead.phone),
                    );
                }
                Err(e) => {
                    // the message is out; the store can catch up later
                    warn!("Send succeeded but could not be persisted: {e:#}");
                    ctx.progress.push_event(
                        campaign_id,
                        EventLevel::Warning,
                        format!(
                            "Sent to {} but the outcome could not be stored",
                            lead.business_name
                        ),
                    );
                }
            }
            info!(
                campaign = %campaign_id,
                lead = %lead.id,
                message_id = %sent.id,
                "Message sent"
            );
        }
        Err(e) => {
            let error_text = format!("{e:#}");
            warn!(
                campaign = %campaign_id,
                lead = %lead.id,
                "Send failed: {error_text}"
            );
            match campaign::record_send_outcome(
                &ctx.config,
                campaign_id,
                &lead.id,
                &lead.phone,
                SendOutcome::Failed,
                Some(&error_text),
            ) {
                Ok(()) => {
                    ctx.progress.record_failed(campaign_id);
                    ctx.progress.push_event(
                        campaign_id,
                        EventLevel::Error,
                        format!(
                            "Failed to send to {}: {}",
                            lead.business_name,
                            crate::util::truncate_with_ellipsis(&error_text, 160)
                        ),
                    );
                }
                Err(persist_err) => {
                    warn!("Failed send could not be persisted either: {persist_err:#}");
                }
            }
        }
    }
}

/// Queue exhausted: clear live-progress fields and move the campaign
/// to its terminal completed state.
fn finish_run(ctx: &RunContext, campaign_id: &str) {
    if let Err(e) = campaign::set_live_progress(&ctx.config, campaign_id, None, None, None) {
        warn!("Failed to clear live progress: {e:#}");
    }

    match campaign::set_campaign_status(&ctx.config, campaign_id, CampaignStatus::Completed) {
        Ok(_) => {
            ctx.progress.set_stage(campaign_id, Stage::Completed);
            ctx.progress.set_current_lead(campaign_id, None);
            ctx.progress.push_event(
                campaign_id,
                EventLevel::Success,
                "All queued messages processed; campaign completed",
            );
            info!(campaign = %campaign_id, "Dispatch run completed");
        }
        Err(e) => {
            // raced with an out-of-band transition; nothing to undo
            warn!("Could not mark campaign completed: {e:#}");
        }
    }

    release_handle(ctx, campaign_id);
}

/// Drop this run's registry entry, leaving a newer run's entry alone.
fn release_handle(ctx: &RunContext, campaign_id: &str) {
    let mut handles = ctx.handles.lock();
    if handles
        .get(campaign_id)
        .is_some_and(|handle| handle.run_id == ctx.run_id)
    {
        handles.remove(campaign_id);
    }
}
