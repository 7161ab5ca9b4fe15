//! Cyclemetric - calendar-cycle metric computation with pluggable collect, filter, aggregate and output stages.

pub mod config;
pub mod es_http;
pub mod executor;
pub mod guard;
pub mod lock;
pub mod pipeline;
pub mod plugin;
pub mod retry;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod task;
pub mod time_windows;
pub mod types;
pub mod worker;
