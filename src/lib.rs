pub mod changes;
pub mod config;
pub mod coordinator;
pub mod cron;
pub mod database;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fingerprints;
pub mod index;
pub mod patterns;
pub mod scanner;
pub mod scheduler;
pub mod schema;
pub mod sources;
