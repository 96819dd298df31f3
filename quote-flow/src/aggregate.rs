use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The complete, server-authoritative record of one in-progress quote.
///
/// The client never constructs or mutates one locally: every partial update
/// sent to the quoting service returns the full updated aggregate, which
/// replaces the cached copy wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteAggregate {
    /// Opaque quote number (`DZ` + 8 alphanumeric). Immutable once issued.
    pub quote_number: String,
    pub quote_id: Uuid,
    pub primary_driver: PrimaryDriver,
    pub additional_drivers: Vec<AdditionalDriver>,
    pub vehicles: Vec<Vehicle>,
    pub coverages: Coverages,
    /// Server-derived. Never computed or guessed client-side.
    pub premium: Premium,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryDriver {
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub email: String,
    pub phone: String,
    pub address: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditionalDriver {
    /// Server-issued, stable across list edits.
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub relationship: Relationship,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    Spouse,
    Child,
    Parent,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    /// Server-issued, stable across list edits.
    pub id: Uuid,
    pub year: u16,
    pub make: String,
    pub model: String,
    pub vin: String,
    pub body_type: BodyType,
    pub annual_mileage: u32,
    /// References a driver id; `None` means the primary driver.
    pub primary_driver_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyType {
    Sedan,
    Coupe,
    Suv,
    Truck,
    Van,
    Wagon,
}

/// Coverage selections: the slice of the aggregate the pricing synchronizer
/// watches. Limits are per-incident dollar amounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coverages {
    pub bodily_injury_limit: u32,
    pub property_damage_limit: u32,
    pub collision: Option<Deductible>,
    pub comprehensive: Option<Deductible>,
    pub uninsured_motorist: bool,
    pub roadside_assistance: bool,
    pub rental_reimbursement: bool,
    pub start_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deductible(pub u32);

/// Derived premium figures. `total` is the six-month term premium.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Premium {
    pub total: f64,
    pub monthly: f64,
    pub six_month: f64,
}

impl Premium {
    pub fn from_term_total(total: f64) -> Self {
        Self {
            total,
            monthly: total / 6.0,
            six_month: total,
        }
    }
}
