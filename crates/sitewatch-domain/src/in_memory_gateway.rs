use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::aggregate::{compute_aggregate, SiteAggregate};
use crate::batch::{BatchRecord, IngestionBatch};
use crate::error::{DomainError, DomainResult};
use crate::gateway::{GatewayTransaction, PersistenceGateway};
use crate::measurement::{Measurement, MeasurementRecord};
use crate::site::{ComplianceStatus, Site, SiteRecord};

#[derive(Debug, Default)]
struct InMemoryState {
    sites: HashMap<String, Site>,
    measurements: Vec<Measurement>,
    batches: HashMap<String, IngestionBatch>,
    /// client_batch_id -> batch id. The uniqueness arbiter.
    tokens: HashMap<String, String>,
}

/// In-memory persistence gateway for integration tests and demos.
///
/// Transactions serialize on one mutex and stage their writes; staged effects
/// become visible only at commit, and a transaction dropped without commit
/// discards them. Token uniqueness is enforced at `insert_batch`, mirroring
/// the storage-level constraint of the PostgreSQL gateway.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of committed measurement rows, across all sites.
    pub async fn measurement_count(&self) -> usize {
        self.state.lock().await.measurements.len()
    }

    /// Number of committed batch rows holding the given token.
    pub async fn batches_with_token(&self, client_batch_id: &str) -> usize {
        let state = self.state.lock().await;
        state
            .batches
            .values()
            .filter(|b| b.client_batch_id == client_batch_id)
            .count()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn begin(&self) -> DomainResult<Box<dyn GatewayTransaction>> {
        let state = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            state,
            staged_measurements: Vec::new(),
            staged_batches: HashMap::new(),
            finished: false,
        }))
    }

    async fn find_batch_by_client_token(
        &self,
        client_batch_id: &str,
    ) -> DomainResult<Option<IngestionBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .tokens
            .get(client_batch_id)
            .and_then(|batch_id| state.batches.get(batch_id))
            .cloned())
    }

    async fn insert_site(&self, record: SiteRecord) -> DomainResult<Site> {
        let now = Utc::now();
        let site = Site {
            id: record.id.clone(),
            site_name: record.site_name,
            site_type: record.site_type,
            emission_limit: record.emission_limit,
            total_emissions_to_date: Decimal::ZERO,
            last_measurement_at: None,
            current_compliance_status: ComplianceStatus::evaluate(
                Decimal::ZERO,
                record.emission_limit,
            ),
            metadata: record.metadata,
            latitude: record.latitude,
            longitude: record.longitude,
            created_at: Some(now),
            updated_at: Some(now),
            deleted_at: None,
        };

        let mut state = self.state.lock().await;
        state.sites.insert(record.id, site.clone());
        Ok(site)
    }

    async fn find_site(&self, site_id: &str) -> DomainResult<Option<Site>> {
        let state = self.state.lock().await;
        Ok(state
            .sites
            .get(site_id)
            .filter(|site| site.deleted_at.is_none())
            .cloned())
    }

    async fn list_sites(&self) -> DomainResult<Vec<Site>> {
        let state = self.state.lock().await;
        let mut sites: Vec<Site> = state
            .sites
            .values()
            .filter(|site| site.deleted_at.is_none())
            .cloned()
            .collect();
        sites.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sites)
    }

    async fn latest_measurements(&self, limit: u64) -> DomainResult<Vec<Measurement>> {
        let state = self.state.lock().await;
        let mut measurements = state.measurements.clone();
        measurements.sort_by(|a, b| b.measured_at.cmp(&a.measured_at));
        measurements.truncate(limit as usize);
        Ok(measurements)
    }
}

struct InMemoryTransaction {
    state: OwnedMutexGuard<InMemoryState>,
    staged_measurements: Vec<Measurement>,
    staged_batches: HashMap<String, IngestionBatch>,
    finished: bool,
}

impl InMemoryTransaction {
    fn stage_measurement(&mut self, record: MeasurementRecord) -> Measurement {
        let measurement = Measurement {
            id: record.id,
            site_id: record.site_id,
            batch_id: record.batch_id,
            measured_at: record.measured_at,
            emission_value: record.emission_value,
            unit: record.unit,
            raw_payload: record.raw_payload,
            created_at: Some(Utc::now()),
        };
        self.staged_measurements.push(measurement.clone());
        measurement
    }
}

#[async_trait]
impl GatewayTransaction for InMemoryTransaction {
    async fn find_site(&self, site_id: &str) -> DomainResult<Option<Site>> {
        Ok(self
            .state
            .sites
            .get(site_id)
            .filter(|site| site.deleted_at.is_none())
            .cloned())
    }

    async fn insert_measurement(&mut self, record: MeasurementRecord) -> DomainResult<Measurement> {
        Ok(self.stage_measurement(record))
    }

    async fn insert_many_measurements(
        &mut self,
        records: Vec<MeasurementRecord>,
    ) -> DomainResult<u64> {
        let count = records.len() as u64;
        for record in records {
            self.stage_measurement(record);
        }
        Ok(count)
    }

    async fn find_batch_by_client_token(
        &self,
        client_batch_id: &str,
    ) -> DomainResult<Option<IngestionBatch>> {
        if let Some(staged) = self
            .staged_batches
            .values()
            .find(|b| b.client_batch_id == client_batch_id)
        {
            return Ok(Some(staged.clone()));
        }
        Ok(self
            .state
            .tokens
            .get(client_batch_id)
            .and_then(|batch_id| self.state.batches.get(batch_id))
            .cloned())
    }

    async fn insert_batch(&mut self, record: BatchRecord) -> DomainResult<IngestionBatch> {
        let token_taken = self.state.tokens.contains_key(&record.client_batch_id)
            || self
                .staged_batches
                .values()
                .any(|b| b.client_batch_id == record.client_batch_id);
        if token_taken {
            return Err(DomainError::DuplicateClientBatchId(record.client_batch_id));
        }

        let batch = IngestionBatch {
            id: record.id.clone(),
            site_id: record.site_id,
            client_batch_id: record.client_batch_id,
            received_at: Utc::now(),
            processed: false,
        };
        self.staged_batches.insert(record.id, batch.clone());
        Ok(batch)
    }

    async fn mark_batch_processed(&mut self, batch_id: &str) -> DomainResult<()> {
        if let Some(batch) = self.staged_batches.get_mut(batch_id) {
            batch.processed = true;
            return Ok(());
        }
        if let Some(batch) = self.state.batches.get(batch_id) {
            let mut updated = batch.clone();
            updated.processed = true;
            self.staged_batches.insert(batch_id.to_string(), updated);
            return Ok(());
        }
        Err(DomainError::Integrity(format!(
            "cannot mark unknown batch {batch_id} as processed"
        )))
    }

    async fn count_measurements_for_batch(&self, batch_id: &str) -> DomainResult<u64> {
        let committed = self
            .state
            .measurements
            .iter()
            .filter(|m| m.batch_id.as_deref() == Some(batch_id))
            .count();
        let staged = self
            .staged_measurements
            .iter()
            .filter(|m| m.batch_id.as_deref() == Some(batch_id))
            .count();
        Ok((committed + staged) as u64)
    }

    async fn site_aggregate(&self, site_id: &str) -> DomainResult<Option<SiteAggregate>> {
        let site = match self
            .state
            .sites
            .get(site_id)
            .filter(|site| site.deleted_at.is_none())
        {
            Some(site) => site,
            None => return Ok(None),
        };

        let aggregate = compute_aggregate(
            self.state
                .measurements
                .iter()
                .chain(self.staged_measurements.iter())
                .filter(|m| m.site_id == site_id),
            site.emission_limit,
        );
        Ok(Some(aggregate))
    }

    async fn commit(&mut self) -> DomainResult<()> {
        if self.finished {
            return Err(DomainError::Integrity(
                "transaction already committed".to_string(),
            ));
        }

        let state = &mut *self.state;

        for (_, batch) in self.staged_batches.drain() {
            state
                .tokens
                .insert(batch.client_batch_id.clone(), batch.id.clone());
            state.batches.insert(batch.id.clone(), batch);
        }

        let mut touched_sites: BTreeSet<String> = BTreeSet::new();
        for measurement in self.staged_measurements.drain(..) {
            touched_sites.insert(measurement.site_id.clone());
            state.measurements.push(measurement);
        }

        // Rewrite derived fields of every site this transaction touched,
        // keeping the site row consistent with its measurements.
        let now = Utc::now();
        for site_id in touched_sites {
            let emission_limit = match state.sites.get(&site_id) {
                Some(site) => site.emission_limit,
                None => continue,
            };
            let aggregate = compute_aggregate(
                state.measurements.iter().filter(|m| m.site_id == site_id),
                emission_limit,
            );
            if let Some(site) = state.sites.get_mut(&site_id) {
                site.total_emissions_to_date = aggregate.total_emissions_to_date;
                site.last_measurement_at = aggregate.last_measurement_at;
                site.current_compliance_status = aggregate.current_compliance_status;
                site.updated_at = Some(now);
            }
        }

        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::EmissionUnit;

    fn site_record(id: &str, limit: i64) -> SiteRecord {
        SiteRecord {
            id: id.to_string(),
            site_name: format!("Site {id}"),
            site_type: "Gas Processing Plant".to_string(),
            emission_limit: Decimal::from(limit),
            metadata: serde_json::json!({}),
            latitude: None,
            longitude: None,
        }
    }

    fn measurement_record(site_id: &str, batch_id: Option<&str>, value: i64) -> MeasurementRecord {
        MeasurementRecord {
            id: xid::new().to_string(),
            site_id: site_id.to_string(),
            batch_id: batch_id.map(str::to_string),
            measured_at: Utc::now(),
            emission_value: Decimal::from(value),
            unit: EmissionUnit::Kg,
            raw_payload: None,
        }
    }

    #[tokio::test]
    async fn test_token_uniqueness_is_enforced_across_transactions() {
        let gateway = InMemoryGateway::new();
        gateway.insert_site(site_record("site-a", 1000)).await.unwrap();

        let mut txn = gateway.begin().await.unwrap();
        txn.insert_batch(BatchRecord {
            id: "batch-1".to_string(),
            site_id: "site-a".to_string(),
            client_batch_id: "b1".to_string(),
        })
        .await
        .unwrap();
        txn.commit().await.unwrap();

        let mut txn = gateway.begin().await.unwrap();
        let result = txn
            .insert_batch(BatchRecord {
                id: "batch-2".to_string(),
                site_id: "site-a".to_string(),
                client_batch_id: "b1".to_string(),
            })
            .await;
        assert!(matches!(
            result,
            Err(DomainError::DuplicateClientBatchId(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_staged_writes() {
        let gateway = InMemoryGateway::new();
        gateway.insert_site(site_record("site-a", 1000)).await.unwrap();

        {
            let mut txn = gateway.begin().await.unwrap();
            txn.insert_batch(BatchRecord {
                id: "batch-1".to_string(),
                site_id: "site-a".to_string(),
                client_batch_id: "b1".to_string(),
            })
            .await
            .unwrap();
            txn.insert_measurement(measurement_record("site-a", Some("batch-1"), 40))
                .await
                .unwrap();
            // Dropped without commit.
        }

        assert_eq!(gateway.measurement_count().await, 0);
        assert!(gateway
            .find_batch_by_client_token("b1")
            .await
            .unwrap()
            .is_none());
        let site = gateway.find_site("site-a").await.unwrap().unwrap();
        assert_eq!(site.total_emissions_to_date, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_commit_rewrites_site_derived_fields() {
        let gateway = InMemoryGateway::new();
        gateway.insert_site(site_record("site-a", 100)).await.unwrap();

        let mut txn = gateway.begin().await.unwrap();
        txn.insert_many_measurements(vec![
            measurement_record("site-a", None, 60),
            measurement_record("site-a", None, 50),
        ])
        .await
        .unwrap();

        // The transaction sees its own staged inserts.
        let aggregate = txn.site_aggregate("site-a").await.unwrap().unwrap();
        assert_eq!(aggregate.total_emissions_to_date, Decimal::from(110));
        assert_eq!(
            aggregate.current_compliance_status,
            ComplianceStatus::LimitExceeded
        );

        txn.commit().await.unwrap();

        let site = gateway.find_site("site-a").await.unwrap().unwrap();
        assert_eq!(site.total_emissions_to_date, Decimal::from(110));
        assert_eq!(
            site.current_compliance_status,
            ComplianceStatus::LimitExceeded
        );
        assert!(site.last_measurement_at.is_some());
    }
}
