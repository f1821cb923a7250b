use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::job::{Actor, Job, JobStatus, Package, Place, Priority, StatusRecord};
use crate::models::transporter::GeoPoint;
use crate::pricing::{self, ServiceCategory};

pub struct NewJob {
    pub customer_id: Uuid,
    pub category: ServiceCategory,
    pub priority: Priority,
    pub pickup: Place,
    pub dropoff: Place,
    pub package: Package,
    pub add_ons: Vec<String>,
    pub scheduled_pickup: Option<DateTime<Utc>>,
    /// Total the customer saw at quote time. When present it must match the
    /// recomputed price within the configured tolerance.
    pub quoted_total: Option<f64>,
}

#[derive(Debug, Default, Clone)]
pub struct AdvanceContext {
    pub note: Option<String>,
    pub location: Option<GeoPoint>,
}

pub struct Advanced {
    pub job: Job,
    /// Transporter whose active-job slot this transition frees up
    /// (delivery completed, or an accepted job cancelled out from under it).
    pub released_transporter: Option<Uuid>,
}

/// Canonical job records. All mutation goes through the state machine here;
/// per-entry map guards scope concurrency control to a single job.
pub struct JobStore {
    jobs: DashMap<Uuid, Job>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    /// Validates limits, re-prices, and inserts the job together with its
    /// first history entry. Nothing is persisted on any failure path.
    pub fn create(&self, spec: NewJob, tolerance: f64, currency: &str) -> Result<Job, AppError> {
        let distance_km = pricing::validate_shipment(
            spec.category,
            &spec.pickup.coords,
            &spec.dropoff.coords,
            spec.package.weight_kg,
        )?;

        let price = pricing::quote(
            distance_km,
            spec.package.weight_kg,
            spec.category,
            &spec.add_ons,
        );
        if let Some(quoted) = spec.quoted_total {
            if !pricing::within_tolerance(quoted, price.total, tolerance) {
                return Err(AppError::PriceMismatch {
                    quoted,
                    computed: price.total,
                });
            }
        }

        let now = Utc::now();
        let estimated_duration_min = pricing::estimate_duration_min(distance_km, spec.category);
        let departs_at = spec.scheduled_pickup.unwrap_or(now);

        let job = Job {
            id: Uuid::new_v4(),
            reference: new_reference(),
            customer_id: spec.customer_id,
            transporter_id: None,
            category: spec.category,
            priority: spec.priority,
            pickup: spec.pickup,
            dropoff: spec.dropoff,
            package: spec.package,
            distance_km,
            price,
            currency: currency.to_string(),
            scheduled_pickup: spec.scheduled_pickup,
            estimated_duration_min,
            estimated_delivery: departs_at + Duration::minutes(estimated_duration_min as i64),
            status: JobStatus::Pending,
            history: vec![StatusRecord {
                status: JobStatus::Pending,
                at: now,
                actor: Actor::Customer(spec.customer_id),
                note: None,
                location: None,
            }],
            created_at: now,
        };

        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    pub fn get(&self, id: Uuid) -> Result<Job, AppError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("job {} not found", id)))
    }

    /// Conditional update arbitrating the accept race: binds the transporter
    /// only if the job is still pending and unbound. The check and the write
    /// happen under the job's exclusive entry guard, so of any number of
    /// concurrent callers exactly one sees the precondition hold. `on_commit`
    /// runs with the updated record before the guard drops; anything it
    /// publishes is ordered with the history entry it reflects.
    pub fn try_accept(
        &self,
        job_id: Uuid,
        transporter_id: Uuid,
        on_commit: impl FnOnce(&Job),
    ) -> Result<Job, AppError> {
        let mut entry = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {} not found", job_id)))?;

        if entry.status != JobStatus::Pending || entry.transporter_id.is_some() {
            return Err(AppError::OrderNoLongerAvailable);
        }

        entry.status = JobStatus::Accepted;
        entry.transporter_id = Some(transporter_id);
        entry.history.push(StatusRecord {
            status: JobStatus::Accepted,
            at: Utc::now(),
            actor: Actor::Transporter(transporter_id),
            note: None,
            location: None,
        });

        on_commit(entry.value());
        Ok(entry.clone())
    }

    /// Single-step lifecycle advance. The caller-supplied target is checked
    /// against the current status under the entry guard, so a replayed
    /// advance finds its precondition already consumed and fails. `on_commit`
    /// runs with the updated record before the guard drops.
    pub fn advance(
        &self,
        job_id: Uuid,
        target: JobStatus,
        actor: Actor,
        ctx: AdvanceContext,
        on_commit: impl FnOnce(&Job),
    ) -> Result<Advanced, AppError> {
        let mut entry = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {} not found", job_id)))?;

        match target {
            JobStatus::PickedUp | JobStatus::InTransit | JobStatus::Delivered => match actor {
                Actor::Transporter(id) if entry.transporter_id == Some(id) => {}
                _ => {
                    return Err(AppError::Unauthorized(
                        "only the accepting transporter may advance this job".to_string(),
                    ));
                }
            },
            JobStatus::Cancelled => match actor {
                Actor::Customer(id) if entry.customer_id == id => {}
                _ => {
                    return Err(AppError::Unauthorized(
                        "only the customer may cancel this job".to_string(),
                    ));
                }
            },
            JobStatus::Pending | JobStatus::Accepted => {
                return Err(AppError::InvalidTransition(
                    "acceptance is decided by the accept operation".to_string(),
                ));
            }
        }

        if !entry.status.permits(target) {
            return Err(AppError::InvalidTransition(format!(
                "{:?} does not permit {:?}",
                entry.status, target
            )));
        }

        let released_transporter = match target {
            // Cancelling an accepted job unbinds the transporter; a bound
            // transporter exists only on jobs in active custody states.
            JobStatus::Cancelled => entry.transporter_id.take(),
            JobStatus::Delivered => entry.transporter_id,
            _ => None,
        };

        entry.status = target;
        entry.history.push(StatusRecord {
            status: target,
            at: Utc::now(),
            actor,
            note: ctx.note,
            location: ctx.location,
        });

        on_commit(entry.value());
        Ok(Advanced {
            job: entry.clone(),
            released_transporter,
        })
    }

    /// Runs `f` with the job's current record under its entry guard, only
    /// while the job is still pending. Offer announcements go through here,
    /// so none can land after an accept or cancel has committed.
    pub fn with_pending(&self, job_id: Uuid, f: impl FnOnce(&Job)) -> bool {
        match self.jobs.get(&job_id) {
            Some(entry) if entry.status == JobStatus::Pending => {
                f(entry.value());
                true
            }
            _ => false,
        }
    }

    pub fn pending_jobs(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|entry| entry.value().status == JobStatus::Pending)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn new_reference() -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!("CD-{}", tag[..8].to_uppercase())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier, Mutex};

    use uuid::Uuid;

    use super::{AdvanceContext, JobStore, NewJob};
    use crate::error::AppError;
    use crate::models::job::{Actor, Dimensions, JobStatus, Package, Place, Priority};
    use crate::models::transporter::GeoPoint;
    use crate::pricing::ServiceCategory;

    const TOLERANCE: f64 = 0.01;

    fn place(lat: f64, lng: f64) -> Place {
        Place {
            address: "Torstraße 1, Berlin".to_string(),
            coords: GeoPoint { lat, lng },
        }
    }

    fn package(weight_kg: f64) -> Package {
        Package {
            weight_kg,
            dims_cm: Dimensions {
                length_cm: 40.0,
                width_cm: 30.0,
                height_cm: 20.0,
            },
            fragile: false,
            signature_required: false,
            description: "boxed records".to_string(),
        }
    }

    fn new_job(customer_id: Uuid, weight_kg: f64) -> NewJob {
        NewJob {
            customer_id,
            category: ServiceCategory::Standard,
            priority: Priority::Normal,
            pickup: place(52.5200, 13.4050),
            dropoff: place(52.4800, 13.4400),
            package: package(weight_kg),
            add_ons: vec![],
            scheduled_pickup: None,
            quoted_total: None,
        }
    }

    fn accepted_job(store: &JobStore, customer: Uuid, transporter: Uuid) -> Uuid {
        let job = store.create(new_job(customer, 2.0), TOLERANCE, "EUR").unwrap();
        store.try_accept(job.id, transporter, |_| {}).unwrap();
        job.id
    }

    #[test]
    fn create_starts_pending_with_initial_history() {
        let store = JobStore::new();
        let customer = Uuid::new_v4();
        let job = store.create(new_job(customer, 2.0), TOLERANCE, "EUR").unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.transporter_id.is_none());
        assert_eq!(job.history.len(), 1);
        assert_eq!(job.history[0].status, JobStatus::Pending);
        assert_eq!(job.history[0].actor, Actor::Customer(customer));
        assert!(job.reference.starts_with("CD-"));
        assert!(job.price.total >= job.price.base_fee);
        assert!(job.estimated_duration_min >= 15);
    }

    #[test]
    fn create_rejects_overweight_package() {
        let store = JobStore::new();
        let result = store.create(new_job(Uuid::new_v4(), 80.0), TOLERANCE, "EUR");

        assert!(matches!(result, Err(AppError::LimitExceeded(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn create_rejects_route_beyond_service_range() {
        let store = JobStore::new();
        let mut spec = new_job(Uuid::new_v4(), 2.0);
        // Berlin to Munich, far past the standard 120 km range.
        spec.dropoff = place(48.1351, 11.5820);
        let result = store.create(spec, TOLERANCE, "EUR");

        assert!(matches!(result, Err(AppError::ServiceUnavailable(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn create_rejects_out_of_range_coordinates() {
        let store = JobStore::new();
        let mut spec = new_job(Uuid::new_v4(), 2.0);
        spec.pickup = place(95.0, 13.4);
        let result = store.create(spec, TOLERANCE, "EUR");

        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn create_checks_quoted_total_within_tolerance() {
        let store = JobStore::new();
        let priced = store.create(new_job(Uuid::new_v4(), 2.0), TOLERANCE, "EUR").unwrap();

        let mut ok = new_job(Uuid::new_v4(), 2.0);
        ok.quoted_total = Some(priced.price.total);
        assert!(store.create(ok, TOLERANCE, "EUR").is_ok());

        let mut stale = new_job(Uuid::new_v4(), 2.0);
        stale.quoted_total = Some(priced.price.total - 5.0);
        assert!(matches!(
            store.create(stale, TOLERANCE, "EUR"),
            Err(AppError::PriceMismatch { .. })
        ));
    }

    #[test]
    fn accept_binds_a_single_transporter() {
        let store = JobStore::new();
        let job = store.create(new_job(Uuid::new_v4(), 2.0), TOLERANCE, "EUR").unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let accepted = store.try_accept(job.id, first, |_| {}).unwrap();
        assert_eq!(accepted.status, JobStatus::Accepted);
        assert_eq!(accepted.transporter_id, Some(first));
        assert_eq!(accepted.history.len(), 2);

        let lost = store.try_accept(job.id, second, |_| {});
        assert!(matches!(lost, Err(AppError::OrderNoLongerAvailable)));
        assert_eq!(store.get(job.id).unwrap().transporter_id, Some(first));
    }

    #[test]
    fn racing_accepts_yield_exactly_one_winner() {
        let store = Arc::new(JobStore::new());
        let job = store.create(new_job(Uuid::new_v4(), 2.0), TOLERANCE, "EUR").unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                let job_id = job.id;
                std::thread::spawn(move || {
                    let me = Uuid::new_v4();
                    barrier.wait();
                    store.try_accept(job_id, me, |_| {}).map(|_| me)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        let losers: Vec<_> = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::OrderNoLongerAvailable)))
            .collect();

        assert_eq!(winners.len(), 1);
        assert_eq!(losers.len(), 1);

        let bound = store.get(job.id).unwrap().transporter_id.unwrap();
        assert_eq!(*winners[0].as_ref().unwrap(), bound);
    }

    #[test]
    fn commit_hooks_fire_in_history_order() {
        let store = Arc::new(JobStore::new());
        let transporter = Uuid::new_v4();
        let job_id = accepted_job(&store, Uuid::new_v4(), transporter);
        let actor = Actor::Transporter(transporter);
        let seen: Arc<Mutex<Vec<JobStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(2));

        let pickup = {
            let store = store.clone();
            let seen = seen.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                store
                    .advance(
                        job_id,
                        JobStatus::PickedUp,
                        actor,
                        AdvanceContext::default(),
                        |job| seen.lock().unwrap().push(job.status),
                    )
                    .unwrap();
            })
        };
        let transit = {
            let store = store.clone();
            let seen = seen.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                // Legal only once the pickup has committed; spins until then.
                loop {
                    let result = store.advance(
                        job_id,
                        JobStatus::InTransit,
                        actor,
                        AdvanceContext::default(),
                        |job| seen.lock().unwrap().push(job.status),
                    );
                    match result {
                        Ok(_) => break,
                        Err(AppError::InvalidTransition(_)) => std::thread::yield_now(),
                        Err(err) => panic!("unexpected advance failure: {err}"),
                    }
                }
            })
        };

        pickup.join().unwrap();
        transit.join().unwrap();

        // Hook order is commit order, however the two threads interleave.
        assert_eq!(
            *seen.lock().unwrap(),
            vec![JobStatus::PickedUp, JobStatus::InTransit]
        );
    }

    #[test]
    fn with_pending_skips_decided_jobs() {
        let store = JobStore::new();
        let job = store.create(new_job(Uuid::new_v4(), 2.0), TOLERANCE, "EUR").unwrap();

        assert!(store.with_pending(job.id, |current| {
            assert_eq!(current.status, JobStatus::Pending);
        }));

        store.try_accept(job.id, Uuid::new_v4(), |_| {}).unwrap();
        assert!(!store.with_pending(job.id, |_| panic!("ran on an accepted job")));
        assert!(!store.with_pending(Uuid::new_v4(), |_| panic!("ran on a missing job")));
    }

    #[test]
    fn advance_walks_the_full_lifecycle() {
        let store = JobStore::new();
        let transporter = Uuid::new_v4();
        let job_id = accepted_job(&store, Uuid::new_v4(), transporter);
        let actor = Actor::Transporter(transporter);

        for target in [JobStatus::PickedUp, JobStatus::InTransit] {
            let advanced = store
                .advance(job_id, target, actor, AdvanceContext::default(), |_| {})
                .unwrap();
            assert_eq!(advanced.job.status, target);
            assert!(advanced.released_transporter.is_none());
        }

        let delivered = store
            .advance(job_id, JobStatus::Delivered, actor, AdvanceContext::default(), |_| {})
            .unwrap();
        assert_eq!(delivered.released_transporter, Some(transporter));
        // Delivered keeps the binding; only cancellation clears it.
        assert_eq!(delivered.job.transporter_id, Some(transporter));

        let job = store.get(job_id).unwrap();
        assert_eq!(job.history.len(), 5);
        assert_eq!(job.history.last().unwrap().status, job.status);
        assert!(
            job.history
                .windows(2)
                .all(|pair| pair[0].at <= pair[1].at)
        );
    }

    #[test]
    fn advance_rejects_skipping_pickup() {
        let store = JobStore::new();
        let transporter = Uuid::new_v4();
        let job_id = accepted_job(&store, Uuid::new_v4(), transporter);

        let result = store.advance(
            job_id,
            JobStatus::InTransit,
            Actor::Transporter(transporter),
            AdvanceContext::default(),
            |_| {},
        );

        assert!(matches!(result, Err(AppError::InvalidTransition(_))));
        assert_eq!(store.get(job_id).unwrap().status, JobStatus::Accepted);
    }

    #[test]
    fn advance_requires_the_bound_transporter() {
        let store = JobStore::new();
        let job_id = accepted_job(&store, Uuid::new_v4(), Uuid::new_v4());

        let result = store.advance(
            job_id,
            JobStatus::PickedUp,
            Actor::Transporter(Uuid::new_v4()),
            AdvanceContext::default(),
            |_| {},
        );

        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn customer_cannot_advance_custody_states() {
        let store = JobStore::new();
        let customer = Uuid::new_v4();
        let job_id = accepted_job(&store, customer, Uuid::new_v4());

        let result = store.advance(
            job_id,
            JobStatus::PickedUp,
            Actor::Customer(customer),
            AdvanceContext::default(),
            |_| {},
        );

        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn replayed_advance_is_rejected_not_reapplied() {
        let store = JobStore::new();
        let transporter = Uuid::new_v4();
        let job_id = accepted_job(&store, Uuid::new_v4(), transporter);
        let actor = Actor::Transporter(transporter);

        store
            .advance(job_id, JobStatus::PickedUp, actor, AdvanceContext::default(), |_| {})
            .unwrap();
        let replay =
            store.advance(job_id, JobStatus::PickedUp, actor, AdvanceContext::default(), |_| {});

        assert!(matches!(replay, Err(AppError::InvalidTransition(_))));
        assert_eq!(store.get(job_id).unwrap().history.len(), 3);
    }

    #[test]
    fn customer_cancels_pending_job() {
        let store = JobStore::new();
        let customer = Uuid::new_v4();
        let job = store.create(new_job(customer, 2.0), TOLERANCE, "EUR").unwrap();

        let advanced = store
            .advance(
                job.id,
                JobStatus::Cancelled,
                Actor::Customer(customer),
                AdvanceContext::default(),
                |_| {},
            )
            .unwrap();

        assert_eq!(advanced.job.status, JobStatus::Cancelled);
        assert!(advanced.job.transporter_id.is_none());
        assert!(advanced.released_transporter.is_none());
    }

    #[test]
    fn cancelling_accepted_job_releases_the_transporter() {
        let store = JobStore::new();
        let customer = Uuid::new_v4();
        let transporter = Uuid::new_v4();
        let job_id = accepted_job(&store, customer, transporter);

        let advanced = store
            .advance(
                job_id,
                JobStatus::Cancelled,
                Actor::Customer(customer),
                AdvanceContext::default(),
                |_| {},
            )
            .unwrap();

        assert_eq!(advanced.released_transporter, Some(transporter));
        assert!(advanced.job.transporter_id.is_none());
    }

    #[test]
    fn cancel_after_pickup_is_rejected() {
        let store = JobStore::new();
        let customer = Uuid::new_v4();
        let transporter = Uuid::new_v4();
        let job_id = accepted_job(&store, customer, transporter);
        store
            .advance(
                job_id,
                JobStatus::PickedUp,
                Actor::Transporter(transporter),
                AdvanceContext::default(),
                |_| {},
            )
            .unwrap();

        let result = store.advance(
            job_id,
            JobStatus::Cancelled,
            Actor::Customer(customer),
            AdvanceContext::default(),
            |_| {},
        );

        assert!(matches!(result, Err(AppError::InvalidTransition(_))));
    }

    #[test]
    fn cancel_by_stranger_is_unauthorized() {
        let store = JobStore::new();
        let job = store.create(new_job(Uuid::new_v4(), 2.0), TOLERANCE, "EUR").unwrap();

        let stranger = store.advance(
            job.id,
            JobStatus::Cancelled,
            Actor::Customer(Uuid::new_v4()),
            AdvanceContext::default(),
            |_| {},
        );
        assert!(matches!(stranger, Err(AppError::Unauthorized(_))));

        let transporter = store.advance(
            job.id,
            JobStatus::Cancelled,
            Actor::Transporter(Uuid::new_v4()),
            AdvanceContext::default(),
            |_| {},
        );
        assert!(matches!(transporter, Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn transporter_bound_iff_status_requires_it() {
        let store = JobStore::new();
        let customer = Uuid::new_v4();
        let transporter = Uuid::new_v4();
        let job = store.create(new_job(customer, 2.0), TOLERANCE, "EUR").unwrap();

        let check = |id| {
            let job = store.get(id).unwrap();
            assert_eq!(job.transporter_id.is_some(), job.status.requires_transporter());
        };

        check(job.id);
        store.try_accept(job.id, transporter, |_| {}).unwrap();
        check(job.id);
        for target in [JobStatus::PickedUp, JobStatus::InTransit, JobStatus::Delivered] {
            store
                .advance(
                    job.id,
                    target,
                    Actor::Transporter(transporter),
                    AdvanceContext::default(),
                    |_| {},
                )
                .unwrap();
            check(job.id);
        }

        let cancelled = store.create(new_job(customer, 2.0), TOLERANCE, "EUR").unwrap();
        store.try_accept(cancelled.id, transporter, |_| {}).unwrap();
        store
            .advance(
                cancelled.id,
                JobStatus::Cancelled,
                Actor::Customer(customer),
                AdvanceContext::default(),
                |_| {},
            )
            .unwrap();
        check(cancelled.id);
    }

    #[test]
    fn advance_into_accepted_goes_through_accept() {
        let store = JobStore::new();
        let job = store.create(new_job(Uuid::new_v4(), 2.0), TOLERANCE, "EUR").unwrap();

        let result = store.advance(
            job.id,
            JobStatus::Accepted,
            Actor::Transporter(Uuid::new_v4()),
            AdvanceContext::default(),
            |_| {},
        );

        assert!(matches!(result, Err(AppError::InvalidTransition(_))));
    }
}
