use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{DomainError, DomainResult};
use crate::gateway::PersistenceGateway;
use crate::quantity::ensure_emission_limit;
use crate::site::{CreateSiteInput, Site, SiteRecord};

/// Domain service for site lifecycle and read paths.
pub struct SiteService {
    gateway: Arc<dyn PersistenceGateway>,
}

impl SiteService {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Create a new site with a generated id. The emission limit is mandatory
    /// here, so a freshly created site always has a computable compliance
    /// status.
    pub async fn create_site(&self, input: CreateSiteInput) -> DomainResult<Site> {
        if input.site_name.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "site_name cannot be empty".to_string(),
            ));
        }
        if input.site_type.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "site_type cannot be empty".to_string(),
            ));
        }
        ensure_emission_limit(input.emission_limit)?;

        let site_id = xid::new().to_string();
        debug!(site_id = %site_id, site_name = %input.site_name, "Creating site");

        let site = self
            .gateway
            .insert_site(SiteRecord {
                id: site_id,
                site_name: input.site_name,
                site_type: input.site_type,
                emission_limit: input.emission_limit,
                metadata: input.metadata,
                latitude: input.latitude,
                longitude: input.longitude,
            })
            .await?;

        info!(site_id = %site.id, "Site created");
        Ok(site)
    }

    /// Get a site with its current derived metrics (excludes soft-deleted).
    pub async fn get_site(&self, site_id: &str) -> DomainResult<Site> {
        if site_id.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "site_id cannot be empty".to_string(),
            ));
        }

        self.gateway
            .find_site(site_id)
            .await?
            .ok_or_else(|| DomainError::SiteNotFound(site_id.to_string()))
    }

    /// List all active sites, newest first.
    pub async fn list_sites(&self) -> DomainResult<Vec<Site>> {
        let sites = self.gateway.list_sites().await?;
        debug!(count = sites.len(), "Listed sites");
        Ok(sites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockPersistenceGateway;
    use crate::site::ComplianceStatus;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn test_input() -> CreateSiteInput {
        CreateSiteInput {
            site_name: "Prairie Sky Landfill".to_string(),
            site_type: "Landfill Gas Recovery Facility".to_string(),
            emission_limit: Decimal::from(2500),
            metadata: serde_json::json!({ "region": "region-2" }),
            latitude: Some(46.87),
            longitude: Some(-113.99),
        }
    }

    fn from_record(record: SiteRecord) -> Site {
        Site {
            id: record.id,
            site_name: record.site_name,
            site_type: record.site_type,
            emission_limit: record.emission_limit,
            total_emissions_to_date: Decimal::ZERO,
            last_measurement_at: None,
            current_compliance_status: ComplianceStatus::WithinLimit,
            metadata: record.metadata,
            latitude: record.latitude,
            longitude: record.longitude,
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_site_success() {
        let mut mock_gateway = MockPersistenceGateway::new();
        mock_gateway
            .expect_insert_site()
            .withf(|record: &SiteRecord| {
                !record.id.is_empty() && record.site_name == "Prairie Sky Landfill"
            })
            .times(1)
            .return_once(|record| Ok(from_record(record)));

        let service = SiteService::new(Arc::new(mock_gateway));
        let site = service.create_site(test_input()).await.unwrap();

        assert_eq!(site.site_name, "Prairie Sky Landfill");
        assert_eq!(site.total_emissions_to_date, Decimal::ZERO);
        assert_eq!(
            site.current_compliance_status,
            ComplianceStatus::WithinLimit
        );
    }

    #[tokio::test]
    async fn test_create_site_empty_name() {
        let service = SiteService::new(Arc::new(MockPersistenceGateway::new()));
        let mut input = test_input();
        input.site_name = "  ".to_string();

        let result = service.create_site(input).await;
        assert!(matches!(result, Err(DomainError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_create_site_negative_limit() {
        let service = SiteService::new(Arc::new(MockPersistenceGateway::new()));
        let mut input = test_input();
        input.emission_limit = Decimal::from(-1);

        let result = service.create_site(input).await;
        assert!(matches!(result, Err(DomainError::InvalidQuantity(_))));
    }

    #[tokio::test]
    async fn test_create_site_zero_limit_is_allowed() {
        let mut mock_gateway = MockPersistenceGateway::new();
        mock_gateway
            .expect_insert_site()
            .times(1)
            .return_once(|record| Ok(from_record(record)));

        let service = SiteService::new(Arc::new(mock_gateway));
        let mut input = test_input();
        input.emission_limit = Decimal::ZERO;

        assert!(service.create_site(input).await.is_ok());
    }

    #[tokio::test]
    async fn test_get_site_not_found() {
        let mut mock_gateway = MockPersistenceGateway::new();
        mock_gateway
            .expect_find_site()
            .times(1)
            .return_once(|_| Ok(None));

        let service = SiteService::new(Arc::new(mock_gateway));
        let result = service.get_site("nonexistent").await;
        assert!(matches!(result, Err(DomainError::SiteNotFound(_))));
    }

    #[tokio::test]
    async fn test_get_site_empty_id() {
        let service = SiteService::new(Arc::new(MockPersistenceGateway::new()));
        let result = service.get_site("").await;
        assert!(matches!(result, Err(DomainError::ValidationError(_))));
    }
}
