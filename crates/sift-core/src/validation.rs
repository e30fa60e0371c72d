//! Sanity checks for reviewed fields

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::ReviewedFields;

/// Amounts at or above this are rejected
pub const MAX_AMOUNT: f64 = 1_000_000.0;

/// Days a document date may lie in the future
pub const DEFAULT_FUTURE_TOLERANCE_DAYS: i64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Amounts at or above this are rejected
    pub max_amount: f64,
    /// Days a document date may lie in the future
    pub future_tolerance_days: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_amount: MAX_AMOUNT,
            future_tolerance_days: DEFAULT_FUTURE_TOLERANCE_DAYS,
        }
    }
}

/// Every problem with the fields, empty when they are acceptable
pub fn problems(
    fields: &ReviewedFields,
    today: NaiveDate,
    config: &ValidationConfig,
) -> Vec<String> {
    let mut problems = Vec::new();

    if fields.vendor.trim().is_empty() {
        problems.push("vendor is empty".to_string());
    }
    if !fields.amount.is_finite() {
        problems.push("amount is not a number".to_string());
    } else if fields.amount < 0.0 {
        problems.push(format!("amount {:.2} is negative", fields.amount));
    } else if fields.amount >= config.max_amount {
        problems.push(format!(
            "amount {:.2} is not below {:.0}",
            fields.amount, config.max_amount
        ));
    }
    let tolerance = config.future_tolerance_days;
    if fields.date > today + Duration::days(tolerance) {
        problems.push(format!(
            "date {} is more than {} day(s) in the future",
            fields.date, tolerance
        ));
    }

    problems
}

/// Validate reviewed fields before categorization
pub fn validate_reviewed(
    fields: &ReviewedFields,
    today: NaiveDate,
    config: &ValidationConfig,
) -> Result<()> {
    let problems = problems(fields, today, config);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(vendor: &str, amount: f64, date: NaiveDate) -> ReviewedFields {
        ReviewedFields {
            vendor: vendor.into(),
            amount,
            currency: None,
            date,
            invoice_number: None,
            description: String::new(),
            notes: None,
            tags: vec![],
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 11, 5).unwrap()
    }

    fn check(fields: &ReviewedFields) -> Result<()> {
        validate_reviewed(fields, today(), &ValidationConfig::default())
    }

    #[test]
    fn test_valid_fields() {
        assert!(check(&fields("Acme", 12.5, today())).is_ok());
        assert!(check(&fields("Acme", 0.0, today())).is_ok());
        let tomorrow = NaiveDate::from_ymd_opt(2024, 11, 6).unwrap();
        assert!(check(&fields("Acme", 1.0, tomorrow)).is_ok());
    }

    #[test]
    fn test_future_tolerance_is_configurable() {
        let in_three_days = NaiveDate::from_ymd_opt(2024, 11, 8).unwrap();
        let ahead = fields("Acme", 1.0, in_three_days);
        assert!(check(&ahead).is_err());

        let lenient = ValidationConfig {
            future_tolerance_days: 3,
            ..ValidationConfig::default()
        };
        assert!(validate_reviewed(&ahead, today(), &lenient).is_ok());

        let strict = ValidationConfig {
            future_tolerance_days: 0,
            max_amount: 100.0,
        };
        let tomorrow = NaiveDate::from_ymd_opt(2024, 11, 6).unwrap();
        let costly = fields("Acme", 250.0, tomorrow);
        let message = problems(&costly, today(), &strict).join("; ");
        assert!(message.contains("not below 100"));
        assert!(message.contains("0 day(s)"));
    }

    #[test]
    fn test_rejections() {
        let err = check(&fields("  ", -1.0, today())).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("vendor is empty"));
        assert!(message.contains("negative"));

        assert!(check(&fields("Acme", f64::NAN, today())).is_err());
        assert!(check(&fields("Acme", f64::INFINITY, today())).is_err());
        assert!(check(&fields("Acme", 1_000_000.0, today())).is_err());

        let later = NaiveDate::from_ymd_opt(2024, 11, 7).unwrap();
        assert!(matches!(
            check(&fields("Acme", 1.0, later)),
            Err(Error::Validation(_))
        ));
    }
}
