use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Actor, JobStatus};
use crate::models::transporter::GeoPoint;

/// One fan-out delivery. `seq` is monotonically increasing per job;
/// subscribers that see a seq they already applied drop the duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum EventPayload {
    Status {
        status: JobStatus,
        actor: Actor,
        #[serde(skip_serializing_if = "Option::is_none")]
        transporter_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        location: Option<GeoPoint>,
    },
    Location {
        transporter_id: Uuid,
        coords: GeoPoint,
        accuracy_m: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
    },
    /// The replay buffer no longer reaches back to the seq the subscriber
    /// asked for; it must re-fetch the job from the store.
    Resync,
}

impl JobEvent {
    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::Status { .. } => "status",
            EventPayload::Location { .. } => "location",
            EventPayload::Resync => "resync",
        }
    }
}
