use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::transporter::GeoPoint;
use crate::pricing::{PriceBreakdown, ServiceCategory};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Accepted,
    PickedUp,
    InTransit,
    Delivered,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Delivered | JobStatus::Cancelled)
    }

    /// Statuses during which a transporter must be bound to the job.
    pub fn requires_transporter(&self) -> bool {
        matches!(
            self,
            JobStatus::Accepted | JobStatus::PickedUp | JobStatus::InTransit | JobStatus::Delivered
        )
    }

    /// The fixed lifecycle: pending → accepted → picked_up → in_transit →
    /// delivered, with cancellation possible while the package has not been
    /// picked up yet.
    pub fn permits(&self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (JobStatus::Pending, JobStatus::Accepted)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Accepted, JobStatus::PickedUp)
                | (JobStatus::Accepted, JobStatus::Cancelled)
                | (JobStatus::PickedUp, JobStatus::InTransit)
                | (JobStatus::InTransit, JobStatus::Delivered)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role", content = "id")]
pub enum Actor {
    Customer(Uuid),
    Transporter(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    pub actor: Actor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Place {
    pub address: String,
    pub coords: GeoPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimensions {
    pub length_cm: f64,
    pub width_cm: f64,
    pub height_cm: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub weight_kg: f64,
    pub dims_cm: Dimensions,
    pub fragile: bool,
    pub signature_required: bool,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub reference: String,
    pub customer_id: Uuid,
    /// Bound by the accept race; cleared again if the job is cancelled
    /// before pickup.
    pub transporter_id: Option<Uuid>,
    pub category: ServiceCategory,
    pub priority: Priority,
    pub pickup: Place,
    pub dropoff: Place,
    pub package: Package,
    pub distance_km: f64,
    pub price: PriceBreakdown,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_pickup: Option<DateTime<Utc>>,
    pub estimated_duration_min: u32,
    pub estimated_delivery: DateTime<Utc>,
    pub status: JobStatus,
    pub history: Vec<StatusRecord>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.customer_id == user_id || self.transporter_id == Some(user_id)
    }
}
