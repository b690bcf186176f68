use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::classifier::Classifier;
use crate::ports::subjects::SubjectDirectory;

const IMAGES_CAP: f64 = 10.0;
const DESCRIPTION_SCALE: f64 = 1000.0;
const CATEGORY_SCALE: f64 = 100.0;

pub const FEATURE_COUNT: usize = 4;

/// Item attributes the classifier is fed, joined with the owner's verification flag.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubjectFeatures {
    pub owner_id: i64,
    pub is_verified_owner: bool,
    pub subject_id: i64,
    pub name: String,
    pub description: String,
    pub category: i32,
    pub images_qty: i32,
}

impl SubjectFeatures {
    pub fn to_vector(&self) -> FeatureVector {
        let verified = if self.is_verified_owner { 1.0 } else { 0.0 };
        let images = f64::from(self.images_qty.max(0)).min(IMAGES_CAP) / IMAGES_CAP;
        let description = self.description.chars().count() as f64 / DESCRIPTION_SCALE;
        let category = f64::from(self.category) / CATEGORY_SCALE;
        FeatureVector([verified, images, description, category])
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureVector(pub [f64; FEATURE_COUNT]);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub is_violation: bool,
    pub probability: f64,
}

/// Binary logistic model over [`FeatureVector`]; inference only.
#[derive(Clone, Debug, PartialEq)]
pub struct LogisticClassifier {
    weights: [f64; FEATURE_COUNT],
    bias: f64,
    threshold: f64,
}

impl LogisticClassifier {
    pub fn new(weights: [f64; FEATURE_COUNT], bias: f64, threshold: f64) -> Self {
        Self {
            weights,
            bias,
            threshold,
        }
    }

    pub fn violation_probability(&self, features: &FeatureVector) -> f64 {
        let logit = self
            .weights
            .iter()
            .zip(features.0.iter())
            .fold(self.bias, |acc, (weight, value)| acc + weight * value);
        1.0 / (1.0 + (-logit).exp())
    }
}

impl Classifier for LogisticClassifier {
    fn predict(&self, features: &FeatureVector) -> BoxFuture<'_, DomainResult<Verdict>> {
        let probability = self.violation_probability(features);
        let threshold = self.threshold;
        Box::pin(async move {
            if !probability.is_finite() {
                return Err(DomainError::Unexpected(
                    "classifier produced a non-finite probability".to_string(),
                ));
            }
            Ok(Verdict {
                is_violation: probability >= threshold,
                probability,
            })
        })
    }
}

/// Long-lived holder for the loaded model, shared by handle.
///
/// Predicting before a model is loaded is a transient failure: the worker retries
/// until the model shows up.
#[derive(Clone, Default)]
pub struct ClassifierHandle {
    model: Arc<RwLock<Option<Arc<dyn Classifier>>>>,
}

impl ClassifierHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loaded(model: Arc<dyn Classifier>) -> Self {
        Self {
            model: Arc::new(RwLock::new(Some(model))),
        }
    }

    pub async fn load(&self, model: Arc<dyn Classifier>) {
        *self.model.write().await = Some(model);
    }

    pub async fn unload(&self) {
        *self.model.write().await = None;
    }

    pub async fn is_ready(&self) -> bool {
        self.model.read().await.is_some()
    }
}

impl Classifier for ClassifierHandle {
    fn predict(&self, features: &FeatureVector) -> BoxFuture<'_, DomainResult<Verdict>> {
        let features = *features;
        Box::pin(async move {
            let model = self.model.read().await.clone();
            match model {
                Some(model) => model.predict(&features).await,
                None => Err(DomainError::Transient("classifier not ready".to_string())),
            }
        })
    }
}

/// Fetches a subject's current attributes and asks the classifier for a verdict.
#[derive(Clone)]
pub struct PredictionService {
    subjects: Arc<dyn SubjectDirectory>,
    classifier: Arc<dyn Classifier>,
}

impl PredictionService {
    pub fn new(subjects: Arc<dyn SubjectDirectory>, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            subjects,
            classifier,
        }
    }

    pub async fn predict_subject(&self, subject_id: i64) -> DomainResult<Verdict> {
        let input = self.subjects.prediction_input(subject_id).await?;
        let verdict = self.classifier.predict(&input.to_vector()).await?;
        tracing::debug!(
            subject_id,
            is_violation = verdict.is_violation,
            probability = verdict.probability,
            "subject classified"
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(verified: bool, images_qty: i32, description: &str) -> SubjectFeatures {
        SubjectFeatures {
            owner_id: 1,
            is_verified_owner: verified,
            subject_id: 10,
            name: "bike".to_string(),
            description: description.to_string(),
            category: 50,
            images_qty,
        }
    }

    #[test]
    fn feature_vector_normalizes_attributes() {
        let vector = features(true, 25, &"x".repeat(250)).to_vector();
        assert_eq!(vector.0, [1.0, 1.0, 0.25, 0.5]);

        let vector = features(false, 3, "").to_vector();
        assert_eq!(vector.0, [0.0, 0.3, 0.0, 0.5]);
    }

    #[tokio::test]
    async fn logistic_model_thresholds_probability() {
        let model = LogisticClassifier::new([-4.0, -3.0, 0.0, 0.0], 1.5, 0.5);

        let risky = model
            .predict(&features(false, 0, "cheap").to_vector())
            .await
            .unwrap();
        assert!(risky.is_violation);
        assert!(risky.probability > 0.8);

        let trusted = model
            .predict(&features(true, 8, "well described").to_vector())
            .await
            .unwrap();
        assert!(!trusted.is_violation);
        assert!((0.0..0.5).contains(&trusted.probability));
    }

    #[tokio::test]
    async fn empty_handle_is_not_ready() {
        let handle = ClassifierHandle::new();
        assert!(!handle.is_ready().await);

        let err = handle
            .predict(&features(true, 1, "a").to_vector())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("classifier not ready"));

        handle
            .load(Arc::new(LogisticClassifier::new([0.0; 4], 0.0, 0.5)))
            .await;
        let verdict = handle
            .predict(&features(true, 1, "a").to_vector())
            .await
            .unwrap();
        assert_eq!(verdict.probability, 0.5);
        assert!(verdict.is_violation);
    }
}
