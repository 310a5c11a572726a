pub mod aggregate;
pub mod batch;
pub mod batch_ingestion_service;
pub mod error;
pub mod events;
pub mod gateway;
pub mod in_memory_gateway;
pub mod measurement;
pub mod measurement_service;
pub mod quantity;
pub mod site;
pub mod site_service;

pub use aggregate::*;
pub use batch::*;
pub use batch_ingestion_service::BatchIngestionService;
pub use error::{DomainError, DomainResult};
pub use events::{EventPublisher, NoopEventPublisher};
pub use gateway::{GatewayTransaction, PersistenceGateway};
pub use in_memory_gateway::InMemoryGateway;
pub use measurement::*;
pub use measurement_service::MeasurementService;
pub use quantity::*;
pub use site::*;
pub use site_service::SiteService;
