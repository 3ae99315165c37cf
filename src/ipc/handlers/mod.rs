pub mod admin;
pub mod core;
pub mod exchange;
pub mod ingest;
pub mod query;
pub mod schedule;
pub mod setup;
