use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::DomainResult;
use crate::error::DomainError;

const PROBABILITY_MIN: f64 = 0.0;
const PROBABILITY_MAX: f64 = 1.0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationStatusParseError {
    Unknown,
}

impl ModerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ModerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModerationStatus {
    type Err = ModerationStatusParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(ModerationStatusParseError::Unknown),
        }
    }
}

/// One classification attempt for a subject, as persisted in `moderation_results`.
///
/// The serialized form doubles as the cache snapshot and uses the store's column
/// names (`id`, `item_id`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModerationTask {
    #[serde(rename = "id")]
    pub task_id: i64,
    #[serde(rename = "item_id")]
    pub subject_id: i64,
    pub status: ModerationStatus,
    pub is_violation: Option<bool>,
    pub probability: Option<f64>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

impl ModerationTask {
    pub fn is_completed(&self) -> bool {
        self.status == ModerationStatus::Completed
    }

    pub fn check_invariants(&self) -> DomainResult<()> {
        check_verdict_fields(
            self.status,
            self.is_violation,
            self.probability,
            self.error_message.as_deref(),
        )
    }

    pub fn apply(&mut self, changes: &TaskChanges) {
        self.status = changes.status;
        self.is_violation = changes.is_violation;
        self.probability = changes.probability;
        self.error_message = changes.error_message.clone();
        self.processed_at = changes.processed_at;
    }
}

/// Insert payload; the store assigns `task_id` and `created_at`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NewModerationTask {
    pub subject_id: i64,
    pub status: ModerationStatus,
    pub is_violation: Option<bool>,
    pub probability: Option<f64>,
    pub error_message: Option<String>,
}

impl NewModerationTask {
    pub fn pending(subject_id: i64) -> Self {
        Self {
            subject_id,
            status: ModerationStatus::Pending,
            is_violation: None,
            probability: None,
            error_message: None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        check_verdict_fields(
            self.status,
            self.is_violation,
            self.probability,
            self.error_message.as_deref(),
        )
    }
}

/// Full replacement of a task's verdict columns.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskChanges {
    pub status: ModerationStatus,
    pub is_violation: Option<bool>,
    pub probability: Option<f64>,
    pub error_message: Option<String>,
    pub processed_at: Option<OffsetDateTime>,
}

impl TaskChanges {
    pub fn completed(is_violation: bool, probability: f64) -> Self {
        Self {
            status: ModerationStatus::Completed,
            is_violation: Some(is_violation),
            probability: Some(probability),
            error_message: None,
            processed_at: Some(OffsetDateTime::now_utc()),
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: ModerationStatus::Failed,
            is_violation: None,
            probability: None,
            error_message: Some(error_message.into()),
            processed_at: Some(OffsetDateTime::now_utc()),
        }
    }

    pub fn processed_at(mut self, processed_at: OffsetDateTime) -> Self {
        self.processed_at = Some(processed_at);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        check_verdict_fields(
            self.status,
            self.is_violation,
            self.probability,
            self.error_message.as_deref(),
        )
    }
}

fn check_verdict_fields(
    status: ModerationStatus,
    is_violation: Option<bool>,
    probability: Option<f64>,
    error_message: Option<&str>,
) -> DomainResult<()> {
    if let Some(probability) = probability {
        if !(PROBABILITY_MIN..=PROBABILITY_MAX).contains(&probability) {
            return Err(DomainError::Unexpected(format!(
                "probability {probability} outside [{PROBABILITY_MIN}, {PROBABILITY_MAX}]"
            )));
        }
    }

    let consistent = match status {
        ModerationStatus::Pending => {
            is_violation.is_none() && probability.is_none() && error_message.is_none()
        }
        ModerationStatus::Completed => {
            is_violation.is_some() && probability.is_some() && error_message.is_none()
        }
        ModerationStatus::Failed => error_message.is_some(),
    };
    if consistent {
        Ok(())
    } else {
        Err(DomainError::Unexpected(format!(
            "inconsistent verdict fields for status '{status}'"
        )))
    }
}
