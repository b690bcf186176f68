pub mod cache;
pub mod config;
pub mod logging;
pub mod queue;
pub mod store;
pub mod subjects;
