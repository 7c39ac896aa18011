pub mod channel;
pub mod config;
pub mod coordinator;
pub mod identity;
pub mod lease;
pub mod lease_postgres;
pub mod lease_redis;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod queue_file;
pub mod rest;
pub mod routes;
pub mod signals;
pub mod state;
pub mod telemetry;
