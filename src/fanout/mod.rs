use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::models::event::{EventPayload, JobEvent};
use crate::models::job::Job;
use crate::models::transporter::GeoPoint;
use crate::observability::metrics::Metrics;
use crate::session::SessionRegistry;

struct ChannelInner {
    next_seq: u64,
    subscribers: HashSet<Uuid>,
    /// Transporters competing during the open offer window. Always a subset
    /// of `subscribers`; emptied once the race is decided.
    bidders: HashSet<Uuid>,
    buffer: VecDeque<JobEvent>,
}

struct JobChannel(Mutex<ChannelInner>);

impl JobChannel {
    fn new() -> Self {
        Self(Mutex::new(ChannelInner {
            next_seq: 0,
            subscribers: HashSet::new(),
            bidders: HashSet::new(),
            buffer: VecDeque::new(),
        }))
    }
}

/// Delivers job events to subscribed live sessions, at-least-once. Every
/// event carries a per-job monotonic seq; a bounded buffer lets briefly
/// disconnected subscribers catch up, and anyone further behind than the
/// buffer reaches is told to re-fetch from the store.
pub struct FanOut {
    channels: DashMap<Uuid, JobChannel>,
    transporter_jobs: DashMap<Uuid, HashSet<Uuid>>,
    sessions: Arc<SessionRegistry>,
    metrics: Metrics,
    buffer_capacity: usize,
}

impl FanOut {
    pub fn new(sessions: Arc<SessionRegistry>, metrics: Metrics, buffer_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            transporter_jobs: DashMap::new(),
            sessions,
            metrics,
            buffer_capacity,
        }
    }

    pub fn open_channel(&self, job_id: Uuid) {
        self.channels.insert(job_id, JobChannel::new());
    }

    pub fn subscribe(&self, user_id: Uuid, job_id: Uuid) -> bool {
        match self.channels.get(&job_id) {
            Some(chan) => {
                chan.0.lock().expect("channel lock").subscribers.insert(user_id);
                true
            }
            None => false,
        }
    }

    /// Registers a transporter competing for a pending job: subscribed like
    /// any interested party, and indexed so its location heartbeats reach
    /// the job's watchers while the offer window is open.
    pub fn subscribe_bidder(&self, transporter_id: Uuid, job_id: Uuid) -> bool {
        match self.channels.get(&job_id) {
            Some(chan) => {
                let mut inner = chan.0.lock().expect("channel lock");
                inner.subscribers.insert(transporter_id);
                inner.bidders.insert(transporter_id);
                drop(inner);
                self.transporter_jobs
                    .entry(transporter_id)
                    .or_default()
                    .insert(job_id);
                true
            }
            None => false,
        }
    }

    /// Keeps the accept winner wired up once bound, whether or not it was
    /// push-offered earlier (it may have found the job by polling). A job
    /// whose channel is already gone takes no index entry.
    pub fn bind_transporter(&self, transporter_id: Uuid, job_id: Uuid) {
        if let Some(chan) = self.channels.get(&job_id) {
            let mut inner = chan.0.lock().expect("channel lock");
            inner.subscribers.insert(transporter_id);
            inner.bidders.remove(&transporter_id);
            drop(inner);
            self.transporter_jobs
                .entry(transporter_id)
                .or_default()
                .insert(job_id);
        }
    }

    pub fn unsubscribe(&self, user_id: Uuid, job_id: Uuid) {
        if let Some(chan) = self.channels.get(&job_id) {
            let mut inner = chan.0.lock().expect("channel lock");
            inner.subscribers.remove(&user_id);
            inner.bidders.remove(&user_id);
        }
        self.forget_transporter_job(user_id, job_id);
    }

    pub fn is_subscribed(&self, user_id: Uuid, job_id: Uuid) -> bool {
        self.channels
            .get(&job_id)
            .map(|chan| chan.0.lock().expect("channel lock").subscribers.contains(&user_id))
            .unwrap_or(false)
    }

    /// Ends the offer window: every bidder except the winner is dropped.
    /// Callers publish the accepted status first so the losers see the
    /// revocation before their subscription disappears.
    pub fn revoke_losers(&self, job_id: Uuid, winner: Uuid) -> usize {
        let losers: Vec<Uuid> = match self.channels.get(&job_id) {
            Some(chan) => {
                let mut inner = chan.0.lock().expect("channel lock");
                let losers: Vec<Uuid> = inner
                    .bidders
                    .iter()
                    .copied()
                    .filter(|id| *id != winner)
                    .collect();
                for loser in &losers {
                    inner.subscribers.remove(loser);
                }
                inner.bidders.clear();
                losers
            }
            None => return 0,
        };

        for loser in &losers {
            self.forget_transporter_job(*loser, job_id);
        }
        debug!(job_id = %job_id, revoked = losers.len(), "offer window closed");
        losers.len()
    }

    /// Terminal status: tear the channel down. Late subscribers re-fetch
    /// the job from the store, which stays authoritative.
    pub fn close_job(&self, job_id: Uuid) {
        let Some((_, chan)) = self.channels.remove(&job_id) else {
            return;
        };

        let inner = chan.0.into_inner().expect("channel lock");
        for user in inner.subscribers.iter().chain(inner.bidders.iter()) {
            self.forget_transporter_job(*user, job_id);
        }
    }

    pub fn publish_status(&self, job: &Job) -> Option<JobEvent> {
        let record = job.history.last()?;
        self.publish(
            job.id,
            EventPayload::Status {
                status: record.status,
                actor: record.actor,
                transporter_id: job.transporter_id,
                note: record.note.clone(),
                location: record.location,
            },
        )
    }

    /// Fans a heartbeat out to every job this transporter is bound to or
    /// bidding on. Returns how many job channels saw the position.
    pub fn publish_location(
        &self,
        transporter_id: Uuid,
        coords: GeoPoint,
        accuracy_m: f64,
        heading: Option<f64>,
    ) -> usize {
        let job_ids: Vec<Uuid> = self
            .transporter_jobs
            .get(&transporter_id)
            .map(|jobs| jobs.iter().copied().collect())
            .unwrap_or_default();

        let mut published = 0;
        for job_id in job_ids {
            let sent = self.publish(
                job_id,
                EventPayload::Location {
                    transporter_id,
                    coords,
                    accuracy_m,
                    heading,
                },
            );
            if sent.is_some() {
                published += 1;
            }
        }
        published
    }

    /// Events newer than `last_seq`, from the bounded buffer. When the
    /// buffer no longer reaches back that far (or the channel is gone) the
    /// subscriber gets a single resync marker instead.
    pub fn replay_since(&self, job_id: Uuid, last_seq: u64) -> Vec<JobEvent> {
        let Some(chan) = self.channels.get(&job_id) else {
            return vec![resync_event(job_id, 0)];
        };
        let inner = chan.0.lock().expect("channel lock");

        if last_seq.saturating_add(1) >= inner.next_seq {
            return Vec::new();
        }

        match inner.buffer.front().map(|event| event.seq) {
            Some(oldest) if oldest <= last_seq + 1 => inner
                .buffer
                .iter()
                .filter(|event| event.seq > last_seq)
                .cloned()
                .collect(),
            _ => vec![resync_event(job_id, inner.next_seq.saturating_sub(1))],
        }
    }

    pub fn jobs_for_transporter(&self, transporter_id: Uuid) -> Vec<Uuid> {
        self.transporter_jobs
            .get(&transporter_id)
            .map(|jobs| jobs.iter().copied().collect())
            .unwrap_or_default()
    }

    fn publish(&self, job_id: Uuid, payload: EventPayload) -> Option<JobEvent> {
        let (event, targets) = {
            let chan = self.channels.get(&job_id)?;
            let mut inner = chan.0.lock().expect("channel lock");

            let event = JobEvent {
                job_id,
                seq: inner.next_seq,
                at: Utc::now(),
                payload,
            };
            inner.next_seq += 1;

            // A stale buffered position for the same transporter is
            // superseded; only the latest needs to survive for replay.
            if let EventPayload::Location { transporter_id, .. } = &event.payload {
                let transporter_id = *transporter_id;
                inner.buffer.retain(|buffered| {
                    !matches!(
                        &buffered.payload,
                        EventPayload::Location { transporter_id: t, .. } if *t == transporter_id
                    )
                });
            }

            inner.buffer.push_back(event.clone());
            while inner.buffer.len() > self.buffer_capacity {
                inner.buffer.pop_front();
            }

            let targets: Vec<Uuid> = inner.subscribers.iter().copied().collect();
            (event, targets)
        };

        self.metrics
            .fanout_events_total
            .with_label_values(&[event.kind()])
            .inc();

        for user_id in targets {
            let delivery = self.sessions.send_to_user(user_id, &event);
            if delivery.failed > 0 {
                self.metrics.fanout_dropped_total.inc_by(delivery.failed as u64);
            }
        }

        Some(event)
    }

    fn forget_transporter_job(&self, transporter_id: Uuid, job_id: Uuid) {
        if let Some(mut jobs) = self.transporter_jobs.get_mut(&transporter_id) {
            jobs.remove(&job_id);
        }
        self.transporter_jobs
            .remove_if(&transporter_id, |_, jobs| jobs.is_empty());
    }
}

fn resync_event(job_id: Uuid, seq: u64) -> JobEvent {
    JobEvent {
        job_id,
        seq,
        at: Utc::now(),
        payload: EventPayload::Resync,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::FanOut;
    use crate::models::event::EventPayload;
    use crate::models::job::{Actor, JobStatus};
    use crate::models::transporter::GeoPoint;
    use crate::observability::metrics::Metrics;
    use crate::session::SessionRegistry;

    fn fanout(buffer_capacity: usize) -> (FanOut, Arc<SessionRegistry>) {
        let sessions = Arc::new(SessionRegistry::new());
        let fanout = FanOut::new(sessions.clone(), Metrics::new(), buffer_capacity);
        (fanout, sessions)
    }

    fn status_payload(status: JobStatus) -> EventPayload {
        EventPayload::Status {
            status,
            actor: Actor::Customer(Uuid::new_v4()),
            transporter_id: None,
            note: None,
            location: None,
        }
    }

    fn point(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint { lat, lng }
    }

    #[test]
    fn events_carry_increasing_seq() {
        let (fanout, sessions) = fanout(16);
        let job_id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let (_, mut rx) = sessions.register(user);

        fanout.open_channel(job_id);
        assert!(fanout.subscribe(user, job_id));

        for _ in 0..3 {
            fanout.publish(job_id, status_payload(JobStatus::Pending)).unwrap();
        }

        for expected in 0..3u64 {
            assert_eq!(rx.try_recv().unwrap().seq, expected);
        }
    }

    #[test]
    fn replay_returns_exactly_the_missed_suffix() {
        let (fanout, _) = fanout(16);
        let job_id = Uuid::new_v4();
        fanout.open_channel(job_id);

        for _ in 0..4 {
            fanout.publish(job_id, status_payload(JobStatus::Pending)).unwrap();
        }

        let missed = fanout.replay_since(job_id, 0);
        let seqs: Vec<u64> = missed.iter().map(|event| event.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        assert!(fanout.replay_since(job_id, 3).is_empty());
    }

    #[test]
    fn replay_past_the_buffer_horizon_resyncs() {
        let (fanout, _) = fanout(2);
        let job_id = Uuid::new_v4();
        fanout.open_channel(job_id);

        for _ in 0..5 {
            fanout.publish(job_id, status_payload(JobStatus::Pending)).unwrap();
        }

        let replay = fanout.replay_since(job_id, 0);
        assert_eq!(replay.len(), 1);
        assert!(matches!(replay[0].payload, EventPayload::Resync));
        assert_eq!(replay[0].seq, 4);
    }

    #[test]
    fn replay_on_closed_job_resyncs() {
        let (fanout, _) = fanout(16);
        let job_id = Uuid::new_v4();
        fanout.open_channel(job_id);
        fanout.close_job(job_id);

        let replay = fanout.replay_since(job_id, 0);
        assert_eq!(replay.len(), 1);
        assert!(matches!(replay[0].payload, EventPayload::Resync));
    }

    #[test]
    fn buffered_locations_coalesce_per_transporter() {
        let (fanout, _) = fanout(16);
        let job_id = Uuid::new_v4();
        let mover = Uuid::new_v4();
        let other = Uuid::new_v4();
        fanout.open_channel(job_id);
        fanout.subscribe_bidder(mover, job_id);
        fanout.subscribe_bidder(other, job_id);

        fanout.publish_location(mover, point(52.50, 13.40), 10.0, None);
        fanout.publish_location(other, point(52.51, 13.41), 10.0, None);
        fanout.publish_location(mover, point(52.52, 13.42), 10.0, None);
        fanout.publish_location(mover, point(52.53, 13.43), 10.0, None);

        let replay = fanout.replay_since(job_id, 0);
        let mover_positions: Vec<_> = replay
            .iter()
            .filter_map(|event| match &event.payload {
                EventPayload::Location { transporter_id, coords, .. } if *transporter_id == mover => {
                    Some(*coords)
                }
                _ => None,
            })
            .collect();

        assert_eq!(mover_positions.len(), 1);
        assert_eq!(mover_positions[0].lat, 52.53);
        assert_eq!(replay.iter().filter(|e| e.seq == 1).count(), 1);
    }

    #[test]
    fn losers_stop_receiving_after_revocation() {
        let (fanout, sessions) = fanout(16);
        let job_id = Uuid::new_v4();
        let winner = Uuid::new_v4();
        let loser = Uuid::new_v4();
        let (_, mut winner_rx) = sessions.register(winner);
        let (_, mut loser_rx) = sessions.register(loser);

        fanout.open_channel(job_id);
        fanout.subscribe_bidder(winner, job_id);
        fanout.subscribe_bidder(loser, job_id);

        fanout.publish(job_id, status_payload(JobStatus::Pending)).unwrap();
        assert!(winner_rx.try_recv().is_ok());
        assert!(loser_rx.try_recv().is_ok());

        // The accepted event is the revocation signal, then the window closes.
        fanout.publish(job_id, status_payload(JobStatus::Accepted)).unwrap();
        assert_eq!(fanout.revoke_losers(job_id, winner), 1);
        assert!(loser_rx.try_recv().is_ok());

        fanout.publish(job_id, status_payload(JobStatus::PickedUp)).unwrap();
        assert!(winner_rx.try_recv().is_ok());
        assert!(winner_rx.try_recv().is_ok());
        assert!(loser_rx.try_recv().is_err());

        assert!(!fanout.is_subscribed(loser, job_id));
        assert!(fanout.jobs_for_transporter(loser).is_empty());
        assert_eq!(fanout.jobs_for_transporter(winner), vec![job_id]);
    }

    #[test]
    fn close_clears_subscriptions_and_heartbeat_index() {
        let (fanout, _) = fanout(16);
        let job_id = Uuid::new_v4();
        let transporter = Uuid::new_v4();
        fanout.open_channel(job_id);
        fanout.subscribe_bidder(transporter, job_id);

        fanout.close_job(job_id);

        assert!(!fanout.is_subscribed(transporter, job_id));
        assert!(fanout.jobs_for_transporter(transporter).is_empty());
        assert_eq!(fanout.publish_location(transporter, point(52.5, 13.4), 5.0, None), 0);
    }

    #[test]
    fn binding_after_close_leaves_no_heartbeat_index() {
        let (fanout, _) = fanout(16);
        let job_id = Uuid::new_v4();
        let transporter = Uuid::new_v4();
        fanout.open_channel(job_id);
        fanout.close_job(job_id);

        // Accept raced a cancel: the channel went down before the bind landed.
        fanout.bind_transporter(transporter, job_id);

        assert!(fanout.jobs_for_transporter(transporter).is_empty());
        assert_eq!(fanout.publish_location(transporter, point(52.5, 13.4), 5.0, None), 0);
    }

    #[test]
    fn delivery_to_dead_session_is_absorbed() {
        let (fanout, sessions) = fanout(16);
        let job_id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let (_, rx) = sessions.register(user);
        drop(rx);

        fanout.open_channel(job_id);
        fanout.subscribe(user, job_id);
        let event = fanout.publish(job_id, status_payload(JobStatus::Pending));

        assert!(event.is_some());
        assert_eq!(fanout.metrics.fanout_dropped_total.get(), 1);
    }
}
