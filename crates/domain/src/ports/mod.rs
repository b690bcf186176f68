use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod cache;
pub mod classifier;
pub mod queue;
pub mod store;
pub mod subjects;
