//! Per-step session client: binds one wizard step to one slice of the
//! quote aggregate. Loads go through the reactive cache; submissions
//! validate locally, push the partial update, and replace the cached entry
//! with the full aggregate the server returns.

use std::sync::Arc;

use tracing::{info, warn};

use crate::aggregate::{Coverages, PrimaryDriver, QuoteAggregate};
use crate::cache::{CacheRead, QuoteCache};
use crate::error::Result;
use crate::flow::Flow;
use crate::service::{DriverInput, NewQuoteRequest, PaymentCard, QuoteService, VehicleInput};
use crate::validation::{
    ValidationErrors, is_plausible_birth_date, is_valid_postal_code, is_valid_vehicle_year,
    is_valid_vin, passes_luhn,
};

/// The steps of a quote wizard, identical across flows; flows differ only
/// in routing and presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStep {
    PrimaryDriver,
    Drivers,
    Vehicles,
    Coverage,
    Review,
}

impl WizardStep {
    pub fn next(self) -> Option<WizardStep> {
        match self {
            WizardStep::PrimaryDriver => Some(WizardStep::Drivers),
            WizardStep::Drivers => Some(WizardStep::Vehicles),
            WizardStep::Vehicles => Some(WizardStep::Coverage),
            WizardStep::Coverage => Some(WizardStep::Review),
            WizardStep::Review => None,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            WizardStep::PrimaryDriver => "primary-driver",
            WizardStep::Drivers => "drivers",
            WizardStep::Vehicles => "vehicles",
            WizardStep::Coverage => "coverage",
            WizardStep::Review => "review",
        }
    }

    pub fn path(self, flow: Flow) -> String {
        format!("/{flow}/{}", self.slug())
    }
}

/// Step-level client over the quoting service and the reactive cache.
#[derive(Clone)]
pub struct QuoteSessionClient {
    service: Arc<dyn QuoteService>,
    cache: QuoteCache,
}

impl QuoteSessionClient {
    pub fn new(service: Arc<dyn QuoteService>, cache: QuoteCache) -> Self {
        Self { service, cache }
    }

    pub fn cache(&self) -> &QuoteCache {
        &self.cache
    }

    /// Read-through load: a fresh cache entry is served as-is; a miss marks
    /// the entry pending, fetches, and replaces it. A failed fetch clears
    /// the pending flag and leaves any previous value untouched.
    pub async fn load(&self, quote_number: &str) -> Result<QuoteAggregate> {
        if let CacheRead::Fresh(aggregate) = self.cache.read(quote_number) {
            return Ok(aggregate);
        }
        self.cache.mark_pending(quote_number);
        match self.service.get_quote(quote_number).await {
            Ok(aggregate) => {
                self.cache.write(quote_number, aggregate.clone());
                Ok(aggregate)
            }
            Err(e) => {
                self.cache.clear_pending(quote_number);
                warn!(quote_number, error = %e, "quote load failed");
                Err(e)
            }
        }
    }

    /// First-step submission: creates the quote and seeds the cache.
    pub async fn start_quote(&self, request: NewQuoteRequest) -> Result<QuoteAggregate> {
        let mut errors = ValidationErrors::new();
        validate_primary_driver(&request.primary_driver, &mut errors);
        validate_vehicles(&request.vehicles, &mut errors);
        errors.into_result()?;

        let aggregate = self.service.create_quote(request).await?;
        info!(quote_number = %aggregate.quote_number, "quote session started");
        self.cache.write(&aggregate.quote_number, aggregate.clone());
        Ok(aggregate)
    }

    pub async fn submit_primary_driver(
        &self,
        quote_number: &str,
        driver: PrimaryDriver,
    ) -> Result<QuoteAggregate> {
        let mut errors = ValidationErrors::new();
        validate_primary_driver(&driver, &mut errors);
        errors.into_result()?;

        let aggregate = self.service.update_primary_driver(quote_number, driver).await?;
        self.cache.write(quote_number, aggregate.clone());
        Ok(aggregate)
    }

    pub async fn submit_drivers(
        &self,
        quote_number: &str,
        drivers: Vec<DriverInput>,
    ) -> Result<QuoteAggregate> {
        let mut errors = ValidationErrors::new();
        validate_additional_drivers(&drivers, &mut errors);
        errors.into_result()?;

        let aggregate = self.service.update_drivers(quote_number, drivers).await?;
        self.cache.write(quote_number, aggregate.clone());
        Ok(aggregate)
    }

    pub async fn submit_vehicles(
        &self,
        quote_number: &str,
        vehicles: Vec<VehicleInput>,
    ) -> Result<QuoteAggregate> {
        let mut errors = ValidationErrors::new();
        validate_vehicles(&vehicles, &mut errors);
        errors.into_result()?;

        let aggregate = self.service.update_vehicles(quote_number, vehicles).await?;
        self.cache.write(quote_number, aggregate.clone());
        Ok(aggregate)
    }

    pub async fn submit_coverage(
        &self,
        quote_number: &str,
        coverages: Coverages,
    ) -> Result<QuoteAggregate> {
        let aggregate = self.service.update_coverage(quote_number, coverages).await?;
        self.cache.write(quote_number, aggregate.clone());
        Ok(aggregate)
    }

    /// Terminal bind. The card never reaches the network unless it passes
    /// the local checks.
    pub async fn bind(&self, quote_number: &str, card: PaymentCard) -> Result<String> {
        let mut errors = ValidationErrors::new();
        validate_payment_card(&card, &mut errors);
        errors.into_result()?;
        self.service.bind_quote(quote_number, card).await
    }
}

fn validate_primary_driver(driver: &PrimaryDriver, errors: &mut ValidationErrors) {
    errors.require("first_name", &driver.first_name);
    errors.require("last_name", &driver.last_name);
    errors.require("email", &driver.email);
    if !driver.email.trim().is_empty() && !driver.email.contains('@') {
        errors.push("email", "must be a valid email address");
    }
    if !is_plausible_birth_date(driver.birth_date) {
        errors.push("birth_date", "driver must be at least 16 years old");
    }
    errors.require("address.street", &driver.address.street);
    errors.require("address.city", &driver.address.city);
    errors.require("address.state", &driver.address.state);
    if !is_valid_postal_code(&driver.address.postal_code) {
        errors.push("address.postal_code", "must be a 5-digit postal code");
    }
}

fn validate_vehicles(vehicles: &[VehicleInput], errors: &mut ValidationErrors) {
    if vehicles.is_empty() {
        errors.push("vehicles", "at least one vehicle is required");
    }
    for (i, vehicle) in vehicles.iter().enumerate() {
        errors.require(&format!("vehicles[{i}].make"), &vehicle.make);
        errors.require(&format!("vehicles[{i}].model"), &vehicle.model);
        if !is_valid_vin(&vehicle.vin) {
            errors.push(
                format!("vehicles[{i}].vin"),
                "must be 17 characters, excluding I, O and Q",
            );
        }
        if !is_valid_vehicle_year(vehicle.year) {
            errors.push(format!("vehicles[{i}].year"), "is outside the accepted range");
        }
    }
}

fn validate_additional_drivers(drivers: &[DriverInput], errors: &mut ValidationErrors) {
    for (i, driver) in drivers.iter().enumerate() {
        errors.require(&format!("drivers[{i}].first_name"), &driver.first_name);
        errors.require(&format!("drivers[{i}].last_name"), &driver.last_name);
        if !is_plausible_birth_date(driver.birth_date) {
            errors.push(
                format!("drivers[{i}].birth_date"),
                "driver must be at least 16 years old",
            );
        }
    }
}

fn validate_payment_card(card: &PaymentCard, errors: &mut ValidationErrors) {
    if !passes_luhn(&card.number) {
        errors.push("card.number", "is not a valid card number");
    }
    if !(1..=12).contains(&card.expiry_month) {
        errors.push("card.expiry_month", "must be between 1 and 12");
    }
    if card.cvv.len() < 3 || card.cvv.len() > 4 || !card.cvv.bytes().all(|b| b.is_ascii_digit()) {
        errors.push("card.cvv", "must be 3 or 4 digits");
    }
}
