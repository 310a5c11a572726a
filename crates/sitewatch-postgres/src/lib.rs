mod client;
mod config;
mod gateway;
mod models;

pub use client::PostgresClient;
pub use config::PostgresConfig;
pub use gateway::PostgresGateway;
