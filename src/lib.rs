pub mod agent;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod export;
pub mod metrics;
pub mod reconcile;
pub mod sink;
pub mod snapshot;
pub mod source;
