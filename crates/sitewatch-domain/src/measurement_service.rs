use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{DomainError, DomainResult};
use crate::events::EventPublisher;
use crate::gateway::PersistenceGateway;
use crate::measurement::{Measurement, MeasurementRecord, NewMeasurement};
use crate::quantity::ensure_measurement_value;

/// Number of readings returned by the cross-site feed.
pub const LATEST_MEASUREMENTS_LIMIT: u64 = 100;

/// Ingests single measurements outside any batch. There is no idempotency
/// token on this path: repeated identical calls create distinct rows by
/// design, an accepted asymmetry with the batch coordinator.
pub struct MeasurementService {
    gateway: Arc<dyn PersistenceGateway>,
    publisher: Arc<dyn EventPublisher>,
}

impl MeasurementService {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { gateway, publisher }
    }

    /// Insert one measurement for a site inside one transaction, updating the
    /// site's derived fields alongside it.
    pub async fn add_measurement(
        &self,
        site_id: &str,
        input: NewMeasurement,
    ) -> DomainResult<Measurement> {
        if site_id.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "site_id cannot be empty".to_string(),
            ));
        }
        ensure_measurement_value(input.emission_value)?;

        debug!(site_id = %site_id, unit = %input.unit, "Adding single measurement");

        let mut txn = self.gateway.begin().await?;

        if txn.find_site(site_id).await?.is_none() {
            // Dropped transaction rolls back; nothing was written anyway.
            return Err(DomainError::SiteNotFound(site_id.to_string()));
        }

        let measurement = txn
            .insert_measurement(MeasurementRecord {
                id: xid::new().to_string(),
                site_id: site_id.to_string(),
                batch_id: None,
                measured_at: input.measured_at,
                emission_value: input.emission_value,
                unit: input.unit,
                raw_payload: input.raw_payload,
            })
            .await?;

        txn.commit().await?;

        info!(
            measurement_id = %measurement.id,
            site_id = %site_id,
            "Measurement created"
        );

        if let Err(err) = self.publisher.measurement_created(&measurement).await {
            warn!(
                measurement_id = %measurement.id,
                error = %err,
                "Failed to publish measurement.created event"
            );
        }

        Ok(measurement)
    }

    /// Most recent readings across all sites, newest first.
    pub async fn latest_measurements(&self) -> DomainResult<Vec<Measurement>> {
        let measurements = self
            .gateway
            .latest_measurements(LATEST_MEASUREMENTS_LIMIT)
            .await?;
        debug!(count = measurements.len(), "Listed latest measurements");
        Ok(measurements)
    }
}
