use async_trait::async_trait;

use crate::aggregate::SiteAggregate;
use crate::batch::{BatchRecord, IngestionBatch};
use crate::error::DomainResult;
use crate::measurement::{Measurement, MeasurementRecord};
use crate::site::{Site, SiteRecord};

/// Abstract transactional store for sites, measurements and ingestion
/// batches. Infrastructure crates (e.g. sitewatch-postgres) implement this;
/// the in-memory gateway backs integration tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Open a new atomic transaction. Dropping the returned transaction
    /// without calling `commit` rolls every staged effect back.
    async fn begin(&self) -> DomainResult<Box<dyn GatewayTransaction>>;

    /// Snapshot read of a batch by its idempotency token, outside any caller
    /// transaction. Used by the uniqueness-race recovery path, which must
    /// observe the concurrently committed winner.
    async fn find_batch_by_client_token(
        &self,
        client_batch_id: &str,
    ) -> DomainResult<Option<IngestionBatch>>;

    /// Persist a new site with zeroed derived fields.
    async fn insert_site(&self, record: SiteRecord) -> DomainResult<Site>;

    /// Fetch a site by id (excludes soft-deleted sites).
    async fn find_site(&self, site_id: &str) -> DomainResult<Option<Site>>;

    /// List all active sites, newest first.
    async fn list_sites(&self) -> DomainResult<Vec<Site>>;

    /// Most recent readings across all sites, newest first.
    async fn latest_measurements(&self, limit: u64) -> DomainResult<Vec<Measurement>>;
}

/// One open transaction against the store. Every read observes the
/// transaction's consistent snapshot; either all effects commit or none do.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GatewayTransaction: Send + Sync {
    async fn find_site(&self, site_id: &str) -> DomainResult<Option<Site>>;

    /// Insert one measurement and rewrite the owning site's derived fields
    /// within this transaction.
    async fn insert_measurement(&mut self, record: MeasurementRecord) -> DomainResult<Measurement>;

    /// Bulk-insert measurements (all for the same site) and rewrite that
    /// site's derived fields within this transaction. Returns the inserted
    /// row count.
    async fn insert_many_measurements(
        &mut self,
        records: Vec<MeasurementRecord>,
    ) -> DomainResult<u64>;

    async fn find_batch_by_client_token(
        &self,
        client_batch_id: &str,
    ) -> DomainResult<Option<IngestionBatch>>;

    /// Insert a new ingestion batch. The store enforces global uniqueness of
    /// `client_batch_id`; losing that arbitration surfaces as
    /// `DomainError::DuplicateClientBatchId`.
    async fn insert_batch(&mut self, record: BatchRecord) -> DomainResult<IngestionBatch>;

    /// Flip the batch's `processed` flag after all its measurements are in.
    async fn mark_batch_processed(&mut self, batch_id: &str) -> DomainResult<()>;

    async fn count_measurements_for_batch(&self, batch_id: &str) -> DomainResult<u64>;

    /// Derived emissions state for a site, reflecting all measurements
    /// visible to this transaction, including its own uncommitted inserts.
    async fn site_aggregate(&self, site_id: &str) -> DomainResult<Option<SiteAggregate>>;

    /// Commit all staged effects. The transaction is unusable afterwards.
    async fn commit(&mut self) -> DomainResult<()>;
}
