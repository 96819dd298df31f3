//! Client-local field validation. Failures here block submission and never
//! reach the network.

use std::fmt;

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One field's failure, keyed by the field name the UI surfaced it under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Per-field messages collected across a whole step slice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn require(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.push(field, "is required");
        }
    }

    /// Turn the collected errors into a `Result`, the shape every submit
    /// path consumes.
    pub fn into_result(self) -> crate::error::Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(crate::error::FlowError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// 5-digit US postal code.
pub fn is_valid_postal_code(code: &str) -> bool {
    code.len() == 5 && code.bytes().all(|b| b.is_ascii_digit())
}

/// 17-character VIN over the charset excluding I, O and Q.
pub fn is_valid_vin(vin: &str) -> bool {
    vin.len() == 17
        && vin.bytes().all(|b| {
            (b.is_ascii_digit() || b.is_ascii_uppercase()) && b != b'I' && b != b'O' && b != b'Q'
        })
}

/// Luhn check for payment card numbers (spaces and dashes tolerated).
pub fn passes_luhn(number: &str) -> bool {
    let digits: Vec<u32> = number
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_digit(10))
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default();
    if digits.len() < 12 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Drivers must be at least 16 and born after 1900.
pub fn is_plausible_birth_date(date: NaiveDate) -> bool {
    let today = Utc::now().date_naive();
    let year = date.year();
    year > 1900 && date <= today && today.year() - year >= 16
}

/// Model years accepted by the quoting service.
pub fn is_valid_vehicle_year(year: u16) -> bool {
    let next_model_year = Utc::now().year() as u16 + 1;
    (1981..=next_model_year).contains(&year)
}
