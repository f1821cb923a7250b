use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::transporter::GeoPoint;

pub const TAX_RATE: f64 = 0.19;
pub const MIN_DURATION_MIN: f64 = 15.0;

/// Flat surcharges per add-on identifier. Identifiers not in this table are
/// priced at zero and logged.
const ADD_ON_SURCHARGES: &[(&str, f64)] = &[
    ("fragile_handling", 3.50),
    ("signature", 1.50),
    ("insurance", 4.00),
    ("two_person", 12.00),
    ("cooling", 6.00),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCategory {
    Express,
    Standard,
    Moving,
    Storage,
}

/// Pricing constants and service limits, carried as data per category so an
/// unknown category cannot exist past deserialization.
#[derive(Debug, Clone, Copy)]
pub struct CategorySpec {
    pub base_fee: f64,
    pub per_km: f64,
    pub per_kg: f64,
    pub avg_speed_kmh: f64,
    pub max_weight_kg: f64,
    pub max_distance_km: f64,
    pub offer_radius_km: f64,
}

impl ServiceCategory {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ServiceCategory::Express => "express",
            ServiceCategory::Standard => "standard",
            ServiceCategory::Moving => "moving",
            ServiceCategory::Storage => "storage",
        }
    }

    pub const fn spec(&self) -> CategorySpec {
        match self {
            ServiceCategory::Express => CategorySpec {
                base_fee: 6.50,
                per_km: 1.80,
                per_kg: 0.40,
                avg_speed_kmh: 35.0,
                max_weight_kg: 30.0,
                max_distance_km: 50.0,
                offer_radius_km: 8.0,
            },
            ServiceCategory::Standard => CategorySpec {
                base_fee: 4.90,
                per_km: 1.20,
                per_kg: 0.25,
                avg_speed_kmh: 30.0,
                max_weight_kg: 60.0,
                max_distance_km: 120.0,
                offer_radius_km: 15.0,
            },
            ServiceCategory::Moving => CategorySpec {
                base_fee: 49.00,
                per_km: 2.20,
                per_kg: 0.10,
                avg_speed_kmh: 45.0,
                max_weight_kg: 1200.0,
                max_distance_km: 400.0,
                offer_radius_km: 40.0,
            },
            ServiceCategory::Storage => CategorySpec {
                base_fee: 19.00,
                per_km: 1.50,
                per_kg: 0.15,
                avg_speed_kmh: 40.0,
                max_weight_kg: 500.0,
                max_distance_km: 200.0,
                offer_radius_km: 25.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub base_fee: f64,
    pub distance_fee: f64,
    pub weight_fee: f64,
    pub surcharges: f64,
    pub tax: f64,
    pub total: f64,
}

/// Quote a job. Pure and deterministic: booking re-invokes this with the
/// same inputs and compares totals against the client's quote.
pub fn quote(
    distance_km: f64,
    weight_kg: f64,
    category: ServiceCategory,
    add_ons: &[String],
) -> PriceBreakdown {
    let spec = category.spec();

    let base_fee = round_cents(spec.base_fee);
    let distance_fee = round_cents(distance_km * spec.per_km);
    let weight_fee = round_cents(weight_kg * spec.per_kg);
    let surcharges = round_cents(add_ons.iter().map(|a| add_on_surcharge(a)).sum());

    let net = base_fee + distance_fee + weight_fee + surcharges;
    let tax = round_cents(net * TAX_RATE);

    PriceBreakdown {
        base_fee,
        distance_fee,
        weight_fee,
        surcharges,
        tax,
        total: round_cents(net + tax),
    }
}

fn add_on_surcharge(name: &str) -> f64 {
    match ADD_ON_SURCHARGES.iter().find(|(id, _)| *id == name) {
        Some((_, surcharge)) => *surcharge,
        None => {
            warn!(add_on = %name, "unknown add-on priced at zero");
            0.0
        }
    }
}

/// Travel time from distance and the category's average speed, floored so a
/// near-zero-distance job never reports a zero-minute estimate.
pub fn estimate_duration_min(distance_km: f64, category: ServiceCategory) -> u32 {
    let minutes = distance_km / category.spec().avg_speed_kmh * 60.0;
    minutes.max(MIN_DURATION_MIN).ceil() as u32
}

pub fn within_tolerance(quoted: f64, computed: f64, tolerance: f64) -> bool {
    (quoted - computed).abs() <= tolerance
}

/// Gate shared by quoting and booking. Returns the route distance that the
/// price and the duration estimate are computed from.
pub fn validate_shipment(
    category: ServiceCategory,
    pickup: &GeoPoint,
    dropoff: &GeoPoint,
    weight_kg: f64,
) -> Result<f64, AppError> {
    if !pickup.in_range() || !dropoff.in_range() {
        return Err(AppError::Validation(
            "pickup or dropoff coordinates out of range".to_string(),
        ));
    }
    if weight_kg <= 0.0 {
        return Err(AppError::Validation("package weight must be > 0".to_string()));
    }

    let limits = category.spec();
    if weight_kg > limits.max_weight_kg {
        return Err(AppError::LimitExceeded(format!(
            "package weight {:.1} kg exceeds the {:.0} kg maximum",
            weight_kg, limits.max_weight_kg
        )));
    }

    let distance_km = haversine_km(pickup, dropoff);
    if distance_km > limits.max_distance_km {
        return Err(AppError::ServiceUnavailable(format!(
            "route of {:.1} km is beyond the {:.0} km service range",
            distance_km, limits.max_distance_km
        )));
    }

    Ok(distance_km)
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
