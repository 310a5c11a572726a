use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::batch::{
    BatchIngestionPayload, BatchRecord, IngestBatchInput, IngestBatchOutcome, IngestionBatch,
};
use crate::error::{DomainError, DomainResult};
use crate::events::EventPublisher;
use crate::gateway::{GatewayTransaction, PersistenceGateway};
use crate::measurement::MeasurementRecord;
use crate::quantity::ensure_measurement_value;

/// Maximum accepted length of a client batch token, after trimming.
pub const MAX_CLIENT_BATCH_ID_CHARS: usize = 128;
/// Maximum number of measurements accepted in one batch.
pub const MAX_BATCH_MEASUREMENTS: usize = 100;

/// Coordinates idempotent batch ingestion: duplicate detection by client
/// token, atomic bulk insert, conflict classification and recovery from a
/// lost uniqueness race at the store.
pub struct BatchIngestionService {
    gateway: Arc<dyn PersistenceGateway>,
    publisher: Arc<dyn EventPublisher>,
}

impl BatchIngestionService {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { gateway, publisher }
    }

    /// Ingest a batch of measurements under the caller's idempotency token.
    ///
    /// Resubmitting the same token for the same site returns the `Duplicate`
    /// outcome without writing rows; the same token for a different site is a
    /// terminal `ClientBatchConflict`. Exactly one of N concurrent callers
    /// with the same token observes `Created`.
    pub async fn ingest_batch(&self, input: IngestBatchInput) -> DomainResult<IngestBatchOutcome> {
        let input = validate_ingest_input(input)?;

        debug!(
            site_id = %input.site_id,
            client_batch_id = %input.client_batch_id,
            measurement_count = input.measurements.len(),
            "Ingesting measurement batch"
        );

        let outcome = match self.attempt_ingest(&input).await {
            Ok(outcome) => outcome,
            // Another transaction won the token race and committed first.
            // Re-read the winner and fall back to the duplicate/conflict
            // classification instead of surfacing a storage error.
            Err(DomainError::DuplicateClientBatchId(_)) => {
                self.recover_lost_token_race(&input).await?
            }
            // Any other failure is propagated unchanged; no retry here.
            Err(other) => return Err(other),
        };

        if let IngestBatchOutcome::Created(payload) = &outcome {
            info!(
                batch_id = %payload.batch_id,
                site_id = %payload.site_id,
                inserted_count = payload.inserted_count,
                status = %payload.current_compliance_status,
                "Measurement batch ingested"
            );
            // Post-commit, fire-and-forget: delivery failures never fail the
            // ingestion call, and duplicates never re-emit.
            if let Err(err) = self.publisher.batch_ingested(payload).await {
                warn!(
                    batch_id = %payload.batch_id,
                    error = %err,
                    "Failed to publish measurement.batch_ingested event"
                );
            }
        }

        Ok(outcome)
    }

    /// Single ingestion attempt inside one transaction. Dropping the
    /// transaction on any early return rolls back everything staged so far.
    async fn attempt_ingest(&self, input: &IngestBatchInput) -> DomainResult<IngestBatchOutcome> {
        let mut txn = self.gateway.begin().await?;

        if txn.find_site(&input.site_id).await?.is_none() {
            return Ok(IngestBatchOutcome::SiteNotFound);
        }

        if let Some(existing) = txn
            .find_batch_by_client_token(&input.client_batch_id)
            .await?
        {
            if existing.site_id != input.site_id {
                debug!(
                    client_batch_id = %input.client_batch_id,
                    existing_site_id = %existing.site_id,
                    "Client batch token already bound to another site"
                );
                return Ok(IngestBatchOutcome::ClientBatchConflict {
                    existing_site_id: existing.site_id,
                });
            }

            let payload = build_payload(txn.as_mut(), &existing, None).await?;
            txn.commit().await?;
            return Ok(IngestBatchOutcome::Duplicate(payload));
        }

        let batch = txn
            .insert_batch(BatchRecord {
                id: xid::new().to_string(),
                site_id: input.site_id.clone(),
                client_batch_id: input.client_batch_id.clone(),
            })
            .await?;

        let records: Vec<MeasurementRecord> = input
            .measurements
            .iter()
            .map(|m| MeasurementRecord {
                id: xid::new().to_string(),
                site_id: input.site_id.clone(),
                batch_id: Some(batch.id.clone()),
                measured_at: m.measured_at,
                emission_value: m.emission_value,
                unit: m.unit,
                raw_payload: m.raw_payload.clone(),
            })
            .collect();

        let inserted_count = txn.insert_many_measurements(records).await?;
        txn.mark_batch_processed(&batch.id).await?;

        let payload = build_payload(txn.as_mut(), &batch, Some(inserted_count)).await?;
        txn.commit().await?;

        Ok(IngestBatchOutcome::Created(payload))
    }

    /// The losing side of the token race: the store rejected our batch insert
    /// because a concurrent transaction committed the same token first.
    /// Re-fetch the committed batch outside the failed transaction and treat
    /// it exactly like a duplicate resubmission (or a conflict if the token
    /// belongs to another site).
    async fn recover_lost_token_race(
        &self,
        input: &IngestBatchInput,
    ) -> DomainResult<IngestBatchOutcome> {
        debug!(
            client_batch_id = %input.client_batch_id,
            "Lost client batch token race, re-reading committed batch"
        );

        let existing = self
            .gateway
            .find_batch_by_client_token(&input.client_batch_id)
            .await?
            .ok_or_else(|| DomainError::DuplicateClientBatchId(input.client_batch_id.clone()))?;

        if existing.site_id != input.site_id {
            return Ok(IngestBatchOutcome::ClientBatchConflict {
                existing_site_id: existing.site_id,
            });
        }

        let mut txn = self.gateway.begin().await?;
        let payload = build_payload(txn.as_mut(), &existing, None).await?;
        txn.commit().await?;

        Ok(IngestBatchOutcome::Duplicate(payload))
    }
}

/// Build the ingestion payload for a new or pre-existing batch. The inserted
/// count is known directly on the create path; duplicate and race-recovery
/// paths recount, since this coordinator did not itself insert those rows.
/// The aggregate is read inside the same transaction, after any inserts it
/// reports on, so the caller never sees a stale total.
async fn build_payload(
    txn: &mut dyn GatewayTransaction,
    batch: &IngestionBatch,
    inserted_count: Option<u64>,
) -> DomainResult<BatchIngestionPayload> {
    let inserted_count = match inserted_count {
        Some(count) => count,
        None => txn.count_measurements_for_batch(&batch.id).await?,
    };

    let aggregate = txn.site_aggregate(&batch.site_id).await?.ok_or_else(|| {
        DomainError::Integrity(format!(
            "site {} missing while building ingestion payload for batch {}",
            batch.site_id, batch.id
        ))
    })?;

    Ok(BatchIngestionPayload {
        batch_id: batch.id.clone(),
        site_id: batch.site_id.clone(),
        client_batch_id: batch.client_batch_id.clone(),
        inserted_count,
        received_at: batch.received_at,
        total_emissions_to_date: aggregate.total_emissions_to_date,
        last_measurement_at: aggregate.last_measurement_at,
        current_compliance_status: aggregate.current_compliance_status,
    })
}

/// Defensive validation of an already-schema-validated request. Trims the
/// client token and re-checks the bounds the transport layer promised.
fn validate_ingest_input(mut input: IngestBatchInput) -> DomainResult<IngestBatchInput> {
    if input.site_id.trim().is_empty() {
        return Err(DomainError::ValidationError(
            "site_id cannot be empty".to_string(),
        ));
    }

    let token = input.client_batch_id.trim().to_string();
    let token_chars = token.chars().count();
    if token_chars == 0 || token_chars > MAX_CLIENT_BATCH_ID_CHARS {
        return Err(DomainError::ValidationError(format!(
            "client_batch_id must be 1-{MAX_CLIENT_BATCH_ID_CHARS} characters after trimming"
        )));
    }

    if input.measurements.is_empty() || input.measurements.len() > MAX_BATCH_MEASUREMENTS {
        return Err(DomainError::ValidationError(format!(
            "a batch must contain 1-{MAX_BATCH_MEASUREMENTS} measurements"
        )));
    }

    for measurement in &input.measurements {
        ensure_measurement_value(measurement.emission_value)?;
    }

    input.client_batch_id = token;
    Ok(input)
}
