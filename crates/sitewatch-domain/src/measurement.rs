use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::quantity::EmissionUnit;

/// One timestamped emissions reading for a site. Immutable once stored and
/// never deleted by this subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: String,
    pub site_id: String,
    /// Weak reference to the ingestion batch that carried this reading, if
    /// any. Single-measurement inserts have no batch.
    pub batch_id: Option<String>,
    /// Caller-supplied reading time, not server receipt time.
    pub measured_at: DateTime<Utc>,
    pub emission_value: Decimal,
    pub unit: EmissionUnit,
    pub raw_payload: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

/// A reading as submitted by a caller, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMeasurement {
    pub measured_at: DateTime<Utc>,
    pub emission_value: Decimal,
    pub unit: EmissionUnit,
    pub raw_payload: Option<serde_json::Value>,
}

/// Measurement row handed to the persistence gateway, with the
/// service-generated id and owner references resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub id: String,
    pub site_id: String,
    pub batch_id: Option<String>,
    pub measured_at: DateTime<Utc>,
    pub emission_value: Decimal,
    pub unit: EmissionUnit,
    pub raw_payload: Option<serde_json::Value>,
}
