use async_trait::async_trait;
use tracing::debug;

use crate::batch::BatchIngestionPayload;
use crate::error::DomainResult;
use crate::measurement::Measurement;

/// Outbound domain events, published post-commit only and never inside a
/// transaction. Delivery (websocket, message bus, ...) is a collaborator's
/// job; implementations must not be load-bearing for ingestion correctness.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// `measurement.created` — a single measurement was committed.
    async fn measurement_created(&self, measurement: &Measurement) -> DomainResult<()>;

    /// `measurement.batch_ingested` — a new batch was committed. Duplicate
    /// resubmissions never re-emit this event.
    async fn batch_ingested(&self, payload: &BatchIngestionPayload) -> DomainResult<()>;
}

/// Publisher for deployments without a realtime channel. Logs and drops.
#[derive(Debug, Default, Clone)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn measurement_created(&self, measurement: &Measurement) -> DomainResult<()> {
        debug!(
            measurement_id = %measurement.id,
            site_id = %measurement.site_id,
            "measurement.created event dropped (no publisher configured)"
        );
        Ok(())
    }

    async fn batch_ingested(&self, payload: &BatchIngestionPayload) -> DomainResult<()> {
        debug!(
            batch_id = %payload.batch_id,
            site_id = %payload.site_id,
            "measurement.batch_ingested event dropped (no publisher configured)"
        );
        Ok(())
    }
}
