use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::within_radius_km;
use crate::models::job::{Job, JobStatus};
use crate::models::transporter::AvailabilityRecord;
use crate::state::AppState;

/// One pass of offer publication for a job. `attempt` counts the passes
/// that found nobody eligible.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTicket {
    pub job_id: Uuid,
    pub attempt: u32,
}

impl DispatchTicket {
    pub fn first(job_id: Uuid) -> Self {
        Self { job_id, attempt: 0 }
    }
}

pub async fn enqueue_dispatch(state: &AppState, ticket: DispatchTicket) -> Result<(), AppError> {
    state
        .dispatch_tx
        .send(ticket)
        .await
        .map_err(|err| AppError::Internal(format!("dispatch queue send failed: {err}")))?;

    state.metrics.jobs_awaiting_offer.inc();
    Ok(())
}

pub async fn run_dispatch_loop(state: Arc<AppState>, mut ticket_rx: mpsc::Receiver<DispatchTicket>) {
    info!("dispatch loop started");

    while let Some(ticket) = ticket_rx.recv().await {
        state.metrics.jobs_awaiting_offer.dec();

        let start = Instant::now();
        match publish_offers(state.clone(), ticket).await {
            Ok(outcome) => {
                let elapsed = start.elapsed().as_secs_f64();
                state
                    .metrics
                    .dispatch_latency_seconds
                    .with_label_values(&[outcome])
                    .observe(elapsed);
            }
            Err(err) => {
                let elapsed = start.elapsed().as_secs_f64();
                state
                    .metrics
                    .dispatch_latency_seconds
                    .with_label_values(&["error"])
                    .observe(elapsed);
                error!(error = %err, job_id = %ticket.job_id, "failed to publish offers");
            }
        }
    }

    warn!("dispatch loop stopped: ticket channel closed");
}

async fn publish_offers(
    state: Arc<AppState>,
    ticket: DispatchTicket,
) -> Result<&'static str, AppError> {
    let job = match state.store.get(ticket.job_id) {
        Ok(job) => job,
        Err(AppError::NotFound(_)) => {
            warn!(job_id = %ticket.job_id, "dispatch ticket for unknown job");
            return Ok("skipped");
        }
        Err(err) => return Err(err),
    };

    // Accepted or cancelled while the ticket sat in the queue.
    if job.status != JobStatus::Pending {
        return Ok("skipped");
    }

    let eligible: Vec<AvailabilityRecord> = state
        .transporters
        .iter()
        .filter_map(|entry| {
            let record = entry.value();
            if can_offer(record, &job) {
                Some(record.clone())
            } else {
                None
            }
        })
        .collect();

    if eligible.is_empty() {
        let next_attempt = ticket.attempt + 1;
        if next_attempt >= state.config.dispatch_retry_attempts {
            warn!(
                job_id = %job.id,
                attempts = next_attempt,
                "no eligible transporters; job stays pending for polling"
            );
            return Ok("exhausted");
        }

        // Retrying inline would stall every ticket behind this one, so the
        // delayed re-enqueue runs on its own task.
        let retry = DispatchTicket {
            job_id: job.id,
            attempt: next_attempt,
        };
        let retry_state = state.clone();
        let delay = Duration::from_millis(state.config.dispatch_retry_delay_ms);
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(err) = enqueue_dispatch(&retry_state, retry).await {
                error!(error = %err, job_id = %retry.job_id, "failed to re-enqueue dispatch ticket");
            }
        });
        return Ok("requeued");
    }

    for record in &eligible {
        state.fanout.subscribe_bidder(record.id, job.id);
    }

    // Live-connected bidders learn about the offer over their socket; the
    // rest catch it through the push notification or the offer poll. The
    // announcement re-reads the job under its entry guard, so it can never
    // land after an accept or cancel has committed.
    let announced = state.store.with_pending(job.id, |current| {
        state.fanout.publish_status(current);
    });
    if !announced {
        // Decided while this pass was preparing; undo its subscriptions.
        let bound = state.store.get(job.id).ok().and_then(|job| job.transporter_id);
        for record in &eligible {
            if Some(record.id) != bound {
                state.fanout.unsubscribe(record.id, job.id);
            }
        }
        return Ok("skipped");
    }

    let push = state.push.clone();
    let targets: Vec<Uuid> = eligible.iter().map(|record| record.id).collect();
    let body = format!("{} pickup at {}", job.category.as_str(), job.pickup.address);
    tokio::spawn(async move {
        for target in targets {
            push.notify(target, "New delivery offer", &body).await;
        }
    });

    info!(
        job_id = %job.id,
        reference = %job.reference,
        offered = eligible.len(),
        "offers published"
    );

    Ok("offered")
}

/// Offer eligibility at one instant: reachable for work and close enough to
/// the pickup for the job's category.
fn can_offer(record: &AvailabilityRecord, job: &Job) -> bool {
    record.online
        && record.verified
        && record.has_capacity()
        && within_radius_km(
            &record.location,
            &job.pickup.coords,
            job.category.spec().offer_radius_km,
        )
}

/// Everything a transporter could accept right now. The poll path for
/// transporters that came online after the push went out.
pub fn open_offers(state: &AppState, transporter_id: Uuid) -> Result<Vec<Job>, AppError> {
    let record = state
        .transporters
        .get(&transporter_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("transporter {} not found", transporter_id)))?;

    if !record.online || !record.verified {
        return Ok(Vec::new());
    }

    let mut offers: Vec<Job> = state
        .store
        .pending_jobs()
        .into_iter()
        .filter(|job| can_offer(&record, job))
        .collect();
    offers.sort_by_key(|job| job.created_at);

    Ok(offers)
}

/// Decides the accept race and wires the winner into the job's channel.
/// Exactly one of any number of concurrent callers gets the job; the rest
/// see `OrderNoLongerAvailable`.
pub async fn accept_job(
    state: &AppState,
    job_id: Uuid,
    transporter_id: Uuid,
) -> Result<Job, AppError> {
    let record = state
        .transporters
        .get(&transporter_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::Unauthorized("unknown transporter".to_string()))?;

    if !record.verified {
        return Err(AppError::Unauthorized(
            "transporter is not verified".to_string(),
        ));
    }
    if !record.has_capacity() {
        return Err(AppError::LimitExceeded(
            "transporter is at its concurrent job limit".to_string(),
        ));
    }

    // Binding and announcing under the job's entry guard: no later commit
    // can fan out ahead of the accepted event.
    let job = match state.store.try_accept(job_id, transporter_id, |job| {
        state.fanout.bind_transporter(transporter_id, job.id);
        state.fanout.publish_status(job);
    }) {
        Ok(job) => {
            state
                .metrics
                .accept_race_total
                .with_label_values(&["won"])
                .inc();
            job
        }
        Err(AppError::OrderNoLongerAvailable) => {
            state
                .metrics
                .accept_race_total
                .with_label_values(&["lost"])
                .inc();
            return Err(AppError::OrderNoLongerAvailable);
        }
        Err(err) => return Err(err),
    };

    if let Some(mut record) = state.transporters.get_mut(&transporter_id) {
        record.active_jobs = record.active_jobs.saturating_add(1);
        record.updated_at = Utc::now();
    }

    // Losers saw the accepted event; now their subscription goes away.
    state.fanout.revoke_losers(job.id, transporter_id);

    let push = state.push.clone();
    let customer_id = job.customer_id;
    let body = format!("{} will handle {}", record.name, job.reference);
    tokio::spawn(async move {
        push.notify(customer_id, "Job accepted", &body).await;
    });

    info!(job_id = %job.id, transporter_id = %transporter_id, "job accepted");
    Ok(job)
}
