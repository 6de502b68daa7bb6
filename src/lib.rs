#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod agent;
pub mod agents;
pub mod channels;
pub mod config;
pub mod cron;
pub mod gateway;
pub mod providers;
pub mod routing;
pub mod session;
pub mod skills;
pub mod subagents;
pub mod tools;
pub mod util;
