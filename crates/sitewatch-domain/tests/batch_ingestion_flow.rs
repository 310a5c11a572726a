use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sitewatch_domain::{
    BatchIngestionService, ComplianceStatus, CreateSiteInput, EmissionUnit, IngestBatchInput,
    IngestBatchOutcome, InMemoryGateway, MeasurementService, NewMeasurement, NoopEventPublisher,
    Site, SiteService,
};

fn services(
    gateway: Arc<InMemoryGateway>,
) -> (SiteService, MeasurementService, BatchIngestionService) {
    let publisher = Arc::new(NoopEventPublisher);
    (
        SiteService::new(gateway.clone()),
        MeasurementService::new(gateway.clone(), publisher.clone()),
        BatchIngestionService::new(gateway, publisher),
    )
}

async fn create_site(sites: &SiteService, name: &str, limit: i64) -> Site {
    sites
        .create_site(CreateSiteInput {
            site_name: name.to_string(),
            site_type: "Oil & Gas Well Pad".to_string(),
            emission_limit: Decimal::from(limit),
            metadata: serde_json::json!({}),
            latitude: None,
            longitude: None,
        })
        .await
        .unwrap()
}

fn kg(value: i64) -> NewMeasurement {
    NewMeasurement {
        measured_at: Utc::now(),
        emission_value: Decimal::from(value),
        unit: EmissionUnit::Kg,
        raw_payload: None,
    }
}

#[tokio::test]
async fn test_ingest_then_resubmit_then_conflicting_site() {
    let gateway = Arc::new(InMemoryGateway::new());
    let (sites, _, batches) = services(gateway.clone());

    let site_s = create_site(&sites, "Site S", 1000).await;
    let site_t = create_site(&sites, "Site T", 1000).await;

    // First submission creates the batch and pushes the site over its limit.
    let outcome = batches
        .ingest_batch(IngestBatchInput {
            site_id: site_s.id.clone(),
            client_batch_id: "b1".to_string(),
            measurements: vec![kg(600), kg(500)],
        })
        .await
        .unwrap();

    let created = match &outcome {
        IngestBatchOutcome::Created(payload) => payload.clone(),
        other => panic!("expected Created, got {other:?}"),
    };
    assert_eq!(created.inserted_count, 2);
    assert_eq!(created.total_emissions_to_date, Decimal::from(1100));
    assert_eq!(
        created.current_compliance_status,
        ComplianceStatus::LimitExceeded
    );
    assert!(!outcome.duplicate_request());

    let stored = sites.get_site(&site_s.id).await.unwrap();
    assert_eq!(stored.total_emissions_to_date, Decimal::from(1100));
    assert_eq!(
        stored.current_compliance_status,
        ComplianceStatus::LimitExceeded
    );
    assert!(stored.last_measurement_at.is_some());

    // Resubmission with the same token writes nothing and reports the same
    // batch back.
    let outcome = batches
        .ingest_batch(IngestBatchInput {
            site_id: site_s.id.clone(),
            client_batch_id: "b1".to_string(),
            measurements: vec![kg(600), kg(500)],
        })
        .await
        .unwrap();

    let duplicate = match &outcome {
        IngestBatchOutcome::Duplicate(payload) => payload.clone(),
        other => panic!("expected Duplicate, got {other:?}"),
    };
    assert!(outcome.duplicate_request());
    assert_eq!(duplicate.batch_id, created.batch_id);
    assert_eq!(duplicate.inserted_count, 2);
    assert_eq!(duplicate.total_emissions_to_date, Decimal::from(1100));
    assert_eq!(gateway.measurement_count().await, 2);
    assert_eq!(gateway.batches_with_token("b1").await, 1);

    // The same token against a different site is a terminal conflict.
    let outcome = batches
        .ingest_batch(IngestBatchInput {
            site_id: site_t.id.clone(),
            client_batch_id: "b1".to_string(),
            measurements: vec![kg(10)],
        })
        .await
        .unwrap();

    match outcome {
        IngestBatchOutcome::ClientBatchConflict { existing_site_id } => {
            assert_eq!(existing_site_id, site_s.id);
        }
        other => panic!("expected ClientBatchConflict, got {other:?}"),
    }
    assert_eq!(gateway.measurement_count().await, 2);
}

#[tokio::test]
async fn test_unknown_site_writes_nothing() {
    let gateway = Arc::new(InMemoryGateway::new());
    let (_, _, batches) = services(gateway.clone());

    let outcome = batches
        .ingest_batch(IngestBatchInput {
            site_id: "no-such-site".to_string(),
            client_batch_id: "b-missing".to_string(),
            measurements: vec![kg(10)],
        })
        .await
        .unwrap();

    assert_eq!(outcome, IngestBatchOutcome::SiteNotFound);
    assert_eq!(gateway.measurement_count().await, 0);
    assert_eq!(gateway.batches_with_token("b-missing").await, 0);
}

#[tokio::test]
async fn test_aggregate_normalizes_mixed_units() {
    let gateway = Arc::new(InMemoryGateway::new());
    let (sites, _, batches) = services(gateway.clone());
    let site = create_site(&sites, "Mixed Units", 5000).await;

    let now = Utc::now();
    let outcome = batches
        .ingest_batch(IngestBatchInput {
            site_id: site.id.clone(),
            client_batch_id: "b-units".to_string(),
            measurements: vec![
                NewMeasurement {
                    measured_at: now - Duration::hours(2),
                    emission_value: Decimal::from(1),
                    unit: EmissionUnit::Tonne,
                    raw_payload: None,
                },
                NewMeasurement {
                    measured_at: now - Duration::hours(1),
                    emission_value: Decimal::from(500),
                    unit: EmissionUnit::Kg,
                    raw_payload: None,
                },
                NewMeasurement {
                    measured_at: now,
                    emission_value: Decimal::from(100),
                    unit: EmissionUnit::Scf,
                    raw_payload: None,
                },
            ],
        })
        .await
        .unwrap();

    let payload = outcome.payload().unwrap();
    // 1 tonne + 500 kg + 100 scf = 1000 + 500 + 1.92 kg.
    assert_eq!(
        payload.total_emissions_to_date,
        Decimal::new(150192, 2)
    );
    assert_eq!(
        payload.current_compliance_status,
        ComplianceStatus::WithinLimit
    );
    assert_eq!(payload.last_measurement_at, Some(now));
}

#[tokio::test]
async fn test_single_measurements_and_batches_share_aggregates() {
    let gateway = Arc::new(InMemoryGateway::new());
    let (sites, measurements, batches) = services(gateway.clone());
    let site = create_site(&sites, "Shared", 1000).await;

    measurements
        .add_measurement(&site.id, kg(300))
        .await
        .unwrap();

    let outcome = batches
        .ingest_batch(IngestBatchInput {
            site_id: site.id.clone(),
            client_batch_id: "b-shared".to_string(),
            measurements: vec![kg(200)],
        })
        .await
        .unwrap();

    // Batch aggregates include the earlier single-measurement insert.
    let payload = outcome.payload().unwrap();
    assert_eq!(payload.total_emissions_to_date, Decimal::from(500));
    assert_eq!(payload.inserted_count, 1);

    let feed = measurements.latest_measurements().await.unwrap();
    assert_eq!(feed.len(), 2);
    assert!(feed[0].measured_at >= feed[1].measured_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_token_creates_exactly_once() {
    let gateway = Arc::new(InMemoryGateway::new());
    let (sites, _, batches) = services(gateway.clone());
    let site = create_site(&sites, "Race", 10_000).await;
    let batches = Arc::new(batches);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let batches = batches.clone();
        let site_id = site.id.clone();
        handles.push(tokio::spawn(async move {
            batches
                .ingest_batch(IngestBatchInput {
                    site_id,
                    client_batch_id: "b-race".to_string(),
                    measurements: vec![kg(100), kg(50)],
                })
                .await
                .unwrap()
        }));
    }

    let mut created = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            IngestBatchOutcome::Created(payload) => {
                created += 1;
                assert_eq!(payload.inserted_count, 2);
            }
            IngestBatchOutcome::Duplicate(payload) => {
                duplicates += 1;
                assert_eq!(payload.inserted_count, 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(created, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(gateway.measurement_count().await, 2);
    assert_eq!(gateway.batches_with_token("b-race").await, 1);

    let site = sites.get_site(&site.id).await.unwrap();
    assert_eq!(site.total_emissions_to_date, Decimal::from(150));
}
