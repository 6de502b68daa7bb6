//! Scheduled jobs — persistent store, per-job timers, and isolated headless
//! agent fires with a delivery contract.

pub mod schedule;
pub mod service;
pub mod store;
pub mod types;

pub use service::{delivery_instructions, CronExecutor, CronService};
pub use store::CronStore;
pub use types::{CronJob, CronJobOptions, DeliveryConfig, Schedule};
