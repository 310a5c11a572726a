use tokio_postgres::Row;

use sitewatch_domain::{
    ComplianceStatus, DomainResult, EmissionUnit, IngestionBatch, Measurement, Site,
};

pub(crate) const SITE_COLUMNS: &str = "id, site_name, site_type, emission_limit, \
     total_emissions_to_date, last_measurement_at, current_compliance_status, metadata, \
     latitude, longitude, created_at, updated_at, deleted_at";

pub(crate) const MEASUREMENT_COLUMNS: &str =
    "id, site_id, batch_id, measured_at, emission_value, unit, raw_payload, created_at";

pub(crate) const BATCH_COLUMNS: &str = "id, site_id, client_batch_id, received_at, processed";

pub(crate) fn site_from_row(row: &Row) -> DomainResult<Site> {
    let status: String = row.get("current_compliance_status");
    Ok(Site {
        id: row.get("id"),
        site_name: row.get("site_name"),
        site_type: row.get("site_type"),
        emission_limit: row.get("emission_limit"),
        total_emissions_to_date: row.get("total_emissions_to_date"),
        last_measurement_at: row.get("last_measurement_at"),
        current_compliance_status: status.parse::<ComplianceStatus>()?,
        metadata: row.get("metadata"),
        latitude: row.get("latitude"),
        longitude: row.get("longitude"),
        created_at: Some(row.get("created_at")),
        updated_at: Some(row.get("updated_at")),
        deleted_at: row.get("deleted_at"),
    })
}

pub(crate) fn measurement_from_row(row: &Row) -> DomainResult<Measurement> {
    let unit: String = row.get("unit");
    Ok(Measurement {
        id: row.get("id"),
        site_id: row.get("site_id"),
        batch_id: row.get("batch_id"),
        measured_at: row.get("measured_at"),
        emission_value: row.get("emission_value"),
        unit: unit.parse::<EmissionUnit>()?,
        raw_payload: row.get("raw_payload"),
        created_at: Some(row.get("created_at")),
    })
}

pub(crate) fn batch_from_row(row: &Row) -> IngestionBatch {
    IngestionBatch {
        id: row.get("id"),
        site_id: row.get("site_id"),
        client_batch_id: row.get("client_batch_id"),
        received_at: row.get("received_at"),
        processed: row.get("processed"),
    }
}
