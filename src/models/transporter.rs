use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn in_range(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Ephemeral availability record, one per transporter. Mutated only by the
/// owning transporter's own status/heartbeat calls; the dispatch resolver
/// only reads it. Never historized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub id: Uuid,
    pub name: String,
    pub location: GeoPoint,
    pub accuracy_m: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    pub online: bool,
    pub verified: bool,
    pub active_jobs: u8,
    pub max_active_jobs: u8,
    pub updated_at: DateTime<Utc>,
}

impl AvailabilityRecord {
    pub fn has_capacity(&self) -> bool {
        self.active_jobs < self.max_active_jobs
    }
}
