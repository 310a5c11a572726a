use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Derived classification of a site's cumulative emissions against its limit.
///
/// `Unknown` is reserved for sites without limit information. The create path
/// requires a limit, so it is currently unreachable, but the variant is kept
/// for forward compatibility with external data sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    WithinLimit,
    LimitExceeded,
    Unknown,
}

impl ComplianceStatus {
    /// Pure classification rule: exceeded only when the total strictly
    /// exceeds the limit.
    pub fn evaluate(total_emissions: Decimal, emission_limit: Decimal) -> Self {
        if total_emissions > emission_limit {
            ComplianceStatus::LimitExceeded
        } else {
            ComplianceStatus::WithinLimit
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::WithinLimit => "within_limit",
            ComplianceStatus::LimitExceeded => "limit_exceeded",
            ComplianceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "within_limit" => Ok(ComplianceStatus::WithinLimit),
            "limit_exceeded" => Ok(ComplianceStatus::LimitExceeded),
            "unknown" => Ok(ComplianceStatus::Unknown),
            other => Err(DomainError::Integrity(format!(
                "unknown compliance status: {other}"
            ))),
        }
    }
}

/// A monitored physical facility with an emissions ceiling.
///
/// `total_emissions_to_date`, `last_measurement_at` and
/// `current_compliance_status` are derived from the site's measurements and
/// are rewritten in the same transaction as any measurement insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub site_name: String,
    pub site_type: String,
    pub emission_limit: Decimal,
    pub total_emissions_to_date: Decimal,
    pub last_measurement_at: Option<DateTime<Utc>>,
    pub current_compliance_status: ComplianceStatus,
    pub metadata: serde_json::Value,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Input for creating a new site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSiteInput {
    pub site_name: String,
    pub site_type: String,
    pub emission_limit: Decimal,
    pub metadata: serde_json::Value,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Site row handed to the persistence gateway, with the service-generated id.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteRecord {
    pub id: String,
    pub site_name: String,
    pub site_type: String,
    pub emission_limit: Decimal,
    pub metadata: serde_json::Value,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_within_limit() {
        let status = ComplianceStatus::evaluate(Decimal::from(999), Decimal::from(1000));
        assert_eq!(status, ComplianceStatus::WithinLimit);
    }

    #[test]
    fn test_evaluate_at_limit_is_within() {
        let status = ComplianceStatus::evaluate(Decimal::from(1000), Decimal::from(1000));
        assert_eq!(status, ComplianceStatus::WithinLimit);
    }

    #[test]
    fn test_evaluate_exceeded() {
        let status = ComplianceStatus::evaluate(Decimal::from(1100), Decimal::from(1000));
        assert_eq!(status, ComplianceStatus::LimitExceeded);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ComplianceStatus::WithinLimit,
            ComplianceStatus::LimitExceeded,
            ComplianceStatus::Unknown,
        ] {
            assert_eq!(status.as_str().parse::<ComplianceStatus>().unwrap(), status);
        }
        assert!("over_limit".parse::<ComplianceStatus>().is_err());
    }
}
