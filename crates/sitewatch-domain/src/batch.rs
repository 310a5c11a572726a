use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::measurement::NewMeasurement;
use crate::site::ComplianceStatus;

/// A client-defined group of measurements submitted together under one
/// idempotency token. Created exactly once per distinct `client_batch_id`;
/// never mutated except to flip `processed` once all of its measurements are
/// durably inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub id: String,
    pub site_id: String,
    /// Caller-supplied idempotency token, globally unique across all sites.
    pub client_batch_id: String,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
}

/// Batch row handed to the persistence gateway, with the service-generated id.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub id: String,
    pub site_id: String,
    pub client_batch_id: String,
}

/// Input for ingesting a batch of measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestBatchInput {
    pub site_id: String,
    pub client_batch_id: String,
    pub measurements: Vec<NewMeasurement>,
}

/// Result payload for a created or duplicate batch. The aggregate fields
/// always reflect the site's current state, never a value frozen at original
/// ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchIngestionPayload {
    pub batch_id: String,
    pub site_id: String,
    pub client_batch_id: String,
    pub inserted_count: u64,
    pub received_at: DateTime<Utc>,
    pub total_emissions_to_date: Decimal,
    pub last_measurement_at: Option<DateTime<Utc>>,
    pub current_compliance_status: ComplianceStatus,
}

/// Outcome of a batch ingestion attempt. `SiteNotFound` and
/// `ClientBatchConflict` are structured outcomes for the caller to map onto
/// its own status scheme, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestBatchOutcome {
    Created(BatchIngestionPayload),
    Duplicate(BatchIngestionPayload),
    SiteNotFound,
    ClientBatchConflict { existing_site_id: String },
}

impl IngestBatchOutcome {
    /// True for a duplicate resubmission. Callers must treat `Created` and
    /// `Duplicate` identically as success; the flag exists purely for
    /// client-side observability.
    pub fn duplicate_request(&self) -> bool {
        matches!(self, IngestBatchOutcome::Duplicate(_))
    }

    pub fn payload(&self) -> Option<&BatchIngestionPayload> {
        match self {
            IngestBatchOutcome::Created(payload) | IngestBatchOutcome::Duplicate(payload) => {
                Some(payload)
            }
            _ => None,
        }
    }
}
