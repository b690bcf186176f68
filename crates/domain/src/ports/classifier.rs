use crate::DomainResult;
use crate::classifier::{FeatureVector, Verdict};
use crate::ports::BoxFuture;

pub trait Classifier: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> BoxFuture<'_, DomainResult<Verdict>>;
}
