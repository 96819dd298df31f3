//! Contracts for the external collaborators: the quoting/pricing service
//! and the identity service. The core consumes these only through their
//! request/response shapes; rating math stays opaque behind the seam.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::aggregate::{
    AdditionalDriver, BodyType, Coverages, Premium, PrimaryDriver, QuoteAggregate, Relationship,
    Vehicle,
};
use crate::error::{FlowError, Result};

/// Vehicle fields as submitted by a step; the service issues the stable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleInput {
    pub year: u16,
    pub make: String,
    pub model: String,
    pub vin: String,
    pub body_type: BodyType,
    pub annual_mileage: u32,
    pub primary_driver_id: Option<Uuid>,
}

/// Additional-driver fields as submitted by a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverInput {
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub relationship: Relationship,
}

/// First-step submission: primary driver plus at least one vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQuoteRequest {
    pub primary_driver: PrimaryDriver,
    pub vehicles: Vec<VehicleInput>,
    pub coverage_start: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCard {
    pub number: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
    pub cvv: String,
}

/// The quoting service. Every partial update returns the full updated
/// aggregate with a freshly computed premium, never a delta.
#[async_trait]
pub trait QuoteService: Send + Sync {
    async fn create_quote(&self, request: NewQuoteRequest) -> Result<QuoteAggregate>;
    async fn get_quote(&self, quote_number: &str) -> Result<QuoteAggregate>;
    async fn update_primary_driver(
        &self,
        quote_number: &str,
        driver: PrimaryDriver,
    ) -> Result<QuoteAggregate>;
    async fn update_drivers(
        &self,
        quote_number: &str,
        drivers: Vec<DriverInput>,
    ) -> Result<QuoteAggregate>;
    async fn update_vehicles(
        &self,
        quote_number: &str,
        vehicles: Vec<VehicleInput>,
    ) -> Result<QuoteAggregate>;
    /// Doubles as the recalculation call: carries the full coverage slice,
    /// returns the repriced aggregate.
    async fn update_coverage(
        &self,
        quote_number: &str,
        coverages: Coverages,
    ) -> Result<QuoteAggregate>;
    /// Terminal call; yields a policy number on success.
    async fn bind_quote(&self, quote_number: &str, card: PaymentCard) -> Result<String>;
    async fn email_exists(&self, email: &str) -> Result<bool>;
    async fn create_account(&self, email: &str) -> Result<Uuid>;
}

const QUOTE_NUMBER_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// In-memory reference backend. Rating output is opaque but deterministic
/// for a given aggregate, so tests can assert stability without knowing
/// the math.
pub struct InProcessQuoteService {
    quotes: DashMap<String, QuoteAggregate>,
    accounts: DashMap<String, Uuid>,
}

impl InProcessQuoteService {
    pub fn new() -> Self {
        Self {
            quotes: DashMap::new(),
            accounts: DashMap::new(),
        }
    }

    fn issue_quote_number(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let suffix: String = (0..8)
                .map(|_| {
                    let idx = rng.gen_range(0..QUOTE_NUMBER_CHARSET.len());
                    QUOTE_NUMBER_CHARSET[idx] as char
                })
                .collect();
            let number = format!("DZ{suffix}");
            // Issued numbers are never reused.
            if !self.quotes.contains_key(&number) {
                return number;
            }
        }
    }

    fn reprice(aggregate: &mut QuoteAggregate) {
        aggregate.premium = rate(aggregate);
        aggregate.updated_at = Utc::now();
    }

    fn with_quote<F>(&self, quote_number: &str, mutate: F) -> Result<QuoteAggregate>
    where
        F: FnOnce(&mut QuoteAggregate),
    {
        let mut entry = self
            .quotes
            .get_mut(quote_number)
            .ok_or_else(|| FlowError::QuoteNotFound(quote_number.to_string()))?;
        mutate(&mut entry);
        Self::reprice(&mut entry);
        Ok(entry.clone())
    }
}

impl Default for InProcessQuoteService {
    fn default() -> Self {
        Self::new()
    }
}

fn materialize_vehicle(input: VehicleInput) -> Vehicle {
    Vehicle {
        id: Uuid::new_v4(),
        year: input.year,
        make: input.make,
        model: input.model,
        vin: input.vin,
        body_type: input.body_type,
        annual_mileage: input.annual_mileage,
        primary_driver_id: input.primary_driver_id,
    }
}

fn materialize_driver(input: DriverInput) -> AdditionalDriver {
    AdditionalDriver {
        id: Uuid::new_v4(),
        first_name: input.first_name,
        last_name: input.last_name,
        birth_date: input.birth_date,
        relationship: input.relationship,
    }
}

/// Stand-in rating model. Strictly positive once a vehicle exists.
fn rate(aggregate: &QuoteAggregate) -> Premium {
    let mut total = 0.0;
    for vehicle in &aggregate.vehicles {
        total += 250.0;
        total += vehicle.annual_mileage as f64 / 1000.0 * 6.0;
        let age = Utc::now().year() as i64 - vehicle.year as i64;
        if age < 3 {
            total += 45.0;
        }
    }
    total += aggregate.additional_drivers.len() as f64 * 60.0;

    let c = &aggregate.coverages;
    total += c.bodily_injury_limit as f64 / 1000.0 * 0.6;
    total += c.property_damage_limit as f64 / 1000.0 * 0.4;
    if let Some(deductible) = c.collision {
        total += (120.0 - deductible.0 as f64 / 20.0).max(25.0);
    }
    if let Some(deductible) = c.comprehensive {
        total += (80.0 - deductible.0 as f64 / 25.0).max(20.0);
    }
    if c.uninsured_motorist {
        total += 40.0;
    }
    if c.roadside_assistance {
        total += 12.0;
    }
    if c.rental_reimbursement {
        total += 18.0;
    }
    Premium::from_term_total(total)
}

#[async_trait]
impl QuoteService for InProcessQuoteService {
    async fn create_quote(&self, request: NewQuoteRequest) -> Result<QuoteAggregate> {
        let quote_number = self.issue_quote_number();
        let mut aggregate = QuoteAggregate {
            quote_number: quote_number.clone(),
            quote_id: Uuid::new_v4(),
            primary_driver: request.primary_driver,
            additional_drivers: Vec::new(),
            vehicles: request.vehicles.into_iter().map(materialize_vehicle).collect(),
            coverages: Coverages {
                bodily_injury_limit: 50_000,
                property_damage_limit: 25_000,
                collision: None,
                comprehensive: None,
                uninsured_motorist: false,
                roadside_assistance: false,
                rental_reimbursement: false,
                start_date: request.coverage_start,
            },
            premium: Premium::from_term_total(0.0),
            updated_at: Utc::now(),
        };
        Self::reprice(&mut aggregate);
        info!(quote_number = %quote_number, "quote created");
        self.quotes.insert(quote_number, aggregate.clone());
        Ok(aggregate)
    }

    async fn get_quote(&self, quote_number: &str) -> Result<QuoteAggregate> {
        self.quotes
            .get(quote_number)
            .map(|entry| entry.clone())
            .ok_or_else(|| FlowError::QuoteNotFound(quote_number.to_string()))
    }

    async fn update_primary_driver(
        &self,
        quote_number: &str,
        driver: PrimaryDriver,
    ) -> Result<QuoteAggregate> {
        self.with_quote(quote_number, |quote| quote.primary_driver = driver)
    }

    async fn update_drivers(
        &self,
        quote_number: &str,
        drivers: Vec<DriverInput>,
    ) -> Result<QuoteAggregate> {
        self.with_quote(quote_number, |quote| {
            quote.additional_drivers = drivers.into_iter().map(materialize_driver).collect();
        })
    }

    async fn update_vehicles(
        &self,
        quote_number: &str,
        vehicles: Vec<VehicleInput>,
    ) -> Result<QuoteAggregate> {
        self.with_quote(quote_number, |quote| {
            quote.vehicles = vehicles.into_iter().map(materialize_vehicle).collect();
        })
    }

    async fn update_coverage(
        &self,
        quote_number: &str,
        coverages: Coverages,
    ) -> Result<QuoteAggregate> {
        self.with_quote(quote_number, |quote| quote.coverages = coverages)
    }

    async fn bind_quote(&self, quote_number: &str, _card: PaymentCard) -> Result<String> {
        let quote = self.get_quote(quote_number).await?;
        let policy_number = format!("POL{}", &quote.quote_number[2..]);
        info!(quote_number = %quote_number, policy_number = %policy_number, "quote bound");
        Ok(policy_number)
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        Ok(self.accounts.contains_key(email))
    }

    async fn create_account(&self, email: &str) -> Result<Uuid> {
        let token = Uuid::new_v4();
        self.accounts.insert(email.to_string(), token);
        Ok(token)
    }
}
