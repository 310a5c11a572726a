use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::measurement::Measurement;
use crate::quantity::normalized_kg;
use crate::site::ComplianceStatus;

/// Derived view of a site's emissions state, as of the calling transaction's
/// snapshot. Invariant: `total_emissions_to_date` equals the
/// kilogram-normalized decimal sum over all of the site's measurements, and
/// `current_compliance_status` is a pure function of that total against the
/// site's limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteAggregate {
    pub total_emissions_to_date: Decimal,
    pub last_measurement_at: Option<DateTime<Utc>>,
    pub current_compliance_status: ComplianceStatus,
}

/// Fold measurements into a site aggregate. Storage backends may instead
/// compute the identical result in the store (the PostgreSQL gateway does it
/// in SQL); the invariant, not the mechanism, is the contract.
pub fn compute_aggregate<'a, I>(measurements: I, emission_limit: Decimal) -> SiteAggregate
where
    I: IntoIterator<Item = &'a Measurement>,
{
    let mut total = Decimal::ZERO;
    let mut last_measurement_at: Option<DateTime<Utc>> = None;

    for measurement in measurements {
        total += normalized_kg(measurement.emission_value, measurement.unit);
        last_measurement_at = Some(match last_measurement_at {
            Some(current) => current.max(measurement.measured_at),
            None => measurement.measured_at,
        });
    }

    SiteAggregate {
        total_emissions_to_date: total,
        last_measurement_at,
        current_compliance_status: ComplianceStatus::evaluate(total, emission_limit),
    }
}
