pub mod classifier;
pub mod error;
pub mod jobs;
pub mod memory;
pub mod moderation;
pub mod ports;
pub mod repository;
pub mod requests;

pub type DomainResult<T> = Result<T, error::DomainError>;
