use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio_postgres::types::ToSql;
use tracing::{debug, warn};

use sitewatch_domain::{
    BatchRecord, ComplianceStatus, DomainError, DomainResult, GatewayTransaction, IngestionBatch,
    Measurement, MeasurementRecord, PersistenceGateway, Site, SiteAggregate, SiteRecord,
};

use crate::client::PostgresClient;
use crate::models::{
    batch_from_row, measurement_from_row, site_from_row, BATCH_COLUMNS, MEASUREMENT_COLUMNS,
    SITE_COLUMNS,
};

/// Name of the unique constraint arbitrating client batch tokens. Other
/// 23505 violations are plain storage errors.
const CLIENT_BATCH_ID_CONSTRAINT: &str = "ingestion_batches_client_batch_id_key";

/// Kilogram-normalized sum over a site's measurements. The per-unit factors
/// must stay in lockstep with `EmissionUnit::kg_factor`.
const SITE_AGGREGATE_SQL: &str = "SELECT s.emission_limit, \
     COALESCE(SUM(m.emission_value * CASE m.unit \
         WHEN 'kg' THEN 1 \
         WHEN 'tonne' THEN 1000 \
         WHEN 'scf' THEN 0.0192 \
         WHEN 'ppm' THEN 0.000001 \
     END), 0) AS total_kg, \
     MAX(m.measured_at) AS last_at \
     FROM sites s \
     LEFT JOIN measurements m ON m.site_id = s.id \
     WHERE s.id = $1 AND s.deleted_at IS NULL \
     GROUP BY s.id, s.emission_limit";

/// Rewrites a site's derived fields from its measurements. Runs inside the
/// ingesting transaction so readers never observe a site out of step with
/// its measurement rows.
const REFRESH_SITE_SQL: &str = "UPDATE sites SET \
     total_emissions_to_date = agg.total_kg, \
     last_measurement_at = agg.last_at, \
     current_compliance_status = CASE \
         WHEN agg.total_kg > sites.emission_limit THEN 'limit_exceeded' \
         ELSE 'within_limit' \
     END, \
     updated_at = NOW() \
     FROM (SELECT COALESCE(SUM(m.emission_value * CASE m.unit \
             WHEN 'kg' THEN 1 \
             WHEN 'tonne' THEN 1000 \
             WHEN 'scf' THEN 0.0192 \
             WHEN 'ppm' THEN 0.000001 \
         END), 0) AS total_kg, \
         MAX(m.measured_at) AS last_at \
         FROM measurements m \
         WHERE m.site_id = $1) AS agg \
     WHERE sites.id = $1";

/// PostgreSQL implementation of the persistence gateway.
///
/// Transactions are driven manually (`BEGIN`/`COMMIT`/`ROLLBACK`) on a pooled
/// connection owned by the transaction object, so the object can be boxed and
/// moved without borrowing the pool.
#[derive(Clone)]
pub struct PostgresGateway {
    client: PostgresClient,
}

impl PostgresGateway {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PersistenceGateway for PostgresGateway {
    async fn begin(&self) -> DomainResult<Box<dyn GatewayTransaction>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.batch_execute("BEGIN")
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(Box::new(PostgresTransaction {
            conn: Some(conn),
            touched_sites: HashSet::new(),
        }))
    }

    async fn find_batch_by_client_token(
        &self,
        client_batch_id: &str,
    ) -> DomainResult<Option<IngestionBatch>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let query =
            format!("SELECT {BATCH_COLUMNS} FROM ingestion_batches WHERE client_batch_id = $1");
        let row = conn
            .query_opt(query.as_str(), &[&client_batch_id])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.as_ref().map(batch_from_row))
    }

    async fn insert_site(&self, record: SiteRecord) -> DomainResult<Site> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let now = Utc::now();
        let status = ComplianceStatus::evaluate(Decimal::ZERO, record.emission_limit);
        let status_str = status.as_str();

        conn.execute(
            "INSERT INTO sites (id, site_name, site_type, emission_limit, \
                 total_emissions_to_date, last_measurement_at, current_compliance_status, \
                 metadata, latitude, longitude, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, 0, NULL, $5, $6, $7, $8, $9, $9)",
            &[
                &record.id,
                &record.site_name,
                &record.site_type,
                &record.emission_limit,
                &status_str,
                &record.metadata,
                &record.latitude,
                &record.longitude,
                &now,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!(site_id = %record.id, "Site created in database");

        Ok(Site {
            id: record.id,
            site_name: record.site_name,
            site_type: record.site_type,
            emission_limit: record.emission_limit,
            total_emissions_to_date: Decimal::ZERO,
            last_measurement_at: None,
            current_compliance_status: status,
            metadata: record.metadata,
            latitude: record.latitude,
            longitude: record.longitude,
            created_at: Some(now),
            updated_at: Some(now),
            deleted_at: None,
        })
    }

    async fn find_site(&self, site_id: &str) -> DomainResult<Option<Site>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let query =
            format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = $1 AND deleted_at IS NULL");
        let row = conn
            .query_opt(query.as_str(), &[&site_id])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        row.as_ref().map(site_from_row).transpose()
    }

    async fn list_sites(&self) -> DomainResult<Vec<Site>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let query = format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE deleted_at IS NULL ORDER BY created_at DESC"
        );
        let rows = conn
            .query(query.as_str(), &[])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        rows.iter().map(site_from_row).collect()
    }

    async fn latest_measurements(&self, limit: u64) -> DomainResult<Vec<Measurement>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let limit = limit as i64;
        let query = format!(
            "SELECT {MEASUREMENT_COLUMNS} FROM measurements ORDER BY measured_at DESC LIMIT $1"
        );
        let rows = conn
            .query(query.as_str(), &[&limit])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        rows.iter().map(measurement_from_row).collect()
    }
}

/// One in-flight database transaction on a dedicated pooled connection.
struct PostgresTransaction {
    /// Taken on commit; `None` means the transaction is finished.
    conn: Option<deadpool_postgres::Client>,
    /// Sites whose derived fields must be refreshed before commit.
    touched_sites: HashSet<String>,
}

impl PostgresTransaction {
    fn conn(&self) -> DomainResult<&deadpool_postgres::Client> {
        self.conn.as_ref().ok_or_else(|| {
            DomainError::Integrity("transaction already finished".to_string())
        })
    }
}

#[async_trait]
impl GatewayTransaction for PostgresTransaction {
    async fn find_site(&self, site_id: &str) -> DomainResult<Option<Site>> {
        let query =
            format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = $1 AND deleted_at IS NULL");
        let row = self
            .conn()?
            .query_opt(query.as_str(), &[&site_id])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        row.as_ref().map(site_from_row).transpose()
    }

    async fn insert_measurement(&mut self, record: MeasurementRecord) -> DomainResult<Measurement> {
        let now = Utc::now();
        let unit = record.unit.as_str();

        self.conn()?
            .execute(
                "INSERT INTO measurements \
                     (id, site_id, batch_id, measured_at, emission_value, unit, raw_payload, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &record.id,
                    &record.site_id,
                    &record.batch_id,
                    &record.measured_at,
                    &record.emission_value,
                    &unit,
                    &record.raw_payload,
                    &now,
                ],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        self.touched_sites.insert(record.site_id.clone());

        Ok(Measurement {
            id: record.id,
            site_id: record.site_id,
            batch_id: record.batch_id,
            measured_at: record.measured_at,
            emission_value: record.emission_value,
            unit: record.unit,
            raw_payload: record.raw_payload,
            created_at: Some(now),
        })
    }

    async fn insert_many_measurements(
        &mut self,
        records: Vec<MeasurementRecord>,
    ) -> DomainResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let units: Vec<&str> = records.iter().map(|r| r.unit.as_str()).collect();

        // One multi-row INSERT instead of a statement per measurement.
        let mut placeholders = Vec::with_capacity(records.len());
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(records.len() * 8);
        for (i, record) in records.iter().enumerate() {
            let base = i * 8;
            placeholders.push(format!(
                "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6,
                base + 7,
                base + 8
            ));
            params.push(&record.id);
            params.push(&record.site_id);
            params.push(&record.batch_id);
            params.push(&record.measured_at);
            params.push(&record.emission_value);
            params.push(&units[i]);
            params.push(&record.raw_payload);
            params.push(&now);
        }

        let sql = format!(
            "INSERT INTO measurements \
                 (id, site_id, batch_id, measured_at, emission_value, unit, raw_payload, created_at) \
             VALUES {}",
            placeholders.join(", ")
        );

        let inserted = self
            .conn()?
            .execute(sql.as_str(), &params)
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        for record in &records {
            self.touched_sites.insert(record.site_id.clone());
        }

        Ok(inserted)
    }

    async fn find_batch_by_client_token(
        &self,
        client_batch_id: &str,
    ) -> DomainResult<Option<IngestionBatch>> {
        let query =
            format!("SELECT {BATCH_COLUMNS} FROM ingestion_batches WHERE client_batch_id = $1");
        let row = self
            .conn()?
            .query_opt(query.as_str(), &[&client_batch_id])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(row.as_ref().map(batch_from_row))
    }

    async fn insert_batch(&mut self, record: BatchRecord) -> DomainResult<IngestionBatch> {
        let now = Utc::now();

        let result = self
            .conn()?
            .execute(
                "INSERT INTO ingestion_batches (id, site_id, client_batch_id, received_at, processed) \
                 VALUES ($1, $2, $3, $4, FALSE)",
                &[&record.id, &record.site_id, &record.client_batch_id, &now],
            )
            .await;

        if let Err(e) = result {
            if let Some(db_err) = e.as_db_error() {
                // PostgreSQL error code 23505 is unique_violation. Only the
                // token constraint maps to the domain's duplicate error;
                // anything else stays a storage error.
                if db_err.code().code() == "23505"
                    && db_err.constraint() == Some(CLIENT_BATCH_ID_CONSTRAINT)
                {
                    return Err(DomainError::DuplicateClientBatchId(record.client_batch_id));
                }
            }
            return Err(DomainError::RepositoryError(e.into()));
        }

        debug!(
            batch_id = %record.id,
            client_batch_id = %record.client_batch_id,
            "Ingestion batch created in database"
        );

        Ok(IngestionBatch {
            id: record.id,
            site_id: record.site_id,
            client_batch_id: record.client_batch_id,
            received_at: now,
            processed: false,
        })
    }

    async fn mark_batch_processed(&mut self, batch_id: &str) -> DomainResult<()> {
        let rows_affected = self
            .conn()?
            .execute(
                "UPDATE ingestion_batches SET processed = TRUE WHERE id = $1",
                &[&batch_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        if rows_affected == 0 {
            return Err(DomainError::Integrity(format!(
                "cannot mark unknown batch {batch_id} as processed"
            )));
        }

        Ok(())
    }

    async fn count_measurements_for_batch(&self, batch_id: &str) -> DomainResult<u64> {
        let row = self
            .conn()?
            .query_one(
                "SELECT COUNT(*) AS count FROM measurements WHERE batch_id = $1",
                &[&batch_id],
            )
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let count: i64 = row.get("count");
        Ok(count as u64)
    }

    async fn site_aggregate(&self, site_id: &str) -> DomainResult<Option<SiteAggregate>> {
        let row = self
            .conn()?
            .query_opt(SITE_AGGREGATE_SQL, &[&site_id])
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        match row {
            Some(row) => {
                let emission_limit: Decimal = row.get("emission_limit");
                let total: Decimal = row.get("total_kg");
                let last_at: Option<DateTime<Utc>> = row.get("last_at");
                Ok(Some(SiteAggregate {
                    total_emissions_to_date: total,
                    last_measurement_at: last_at,
                    current_compliance_status: ComplianceStatus::evaluate(total, emission_limit),
                }))
            }
            None => Ok(None),
        }
    }

    async fn commit(&mut self) -> DomainResult<()> {
        let touched: Vec<String> = self.touched_sites.drain().collect();
        for site_id in &touched {
            let refreshed = self
                .conn()?
                .execute(REFRESH_SITE_SQL, &[site_id])
                .await
                .map_err(|e| DomainError::RepositoryError(e.into()))?;

            if refreshed == 0 {
                return Err(DomainError::Integrity(format!(
                    "site {site_id} disappeared during ingestion"
                )));
            }
        }

        self.conn()?
            .batch_execute("COMMIT")
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        // Only release the connection once COMMIT succeeded; a failed commit
        // leaves it for Drop to roll back.
        self.conn = None;
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        // A transaction abandoned without commit rolls back before its
        // connection rejoins the pool. The spawned task owns the connection,
        // so the pool cannot hand it out mid-rollback.
        if let Some(conn) = self.conn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = conn.batch_execute("ROLLBACK").await {
                            warn!(error = %err, "Failed to roll back abandoned transaction");
                        }
                    });
                }
                Err(_) => {
                    warn!("Transaction dropped outside a runtime; connection discarded");
                }
            }
        }
    }
}
