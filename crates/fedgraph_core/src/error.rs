/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

/// Why an activity pipeline refused or failed to apply an activity.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A protocol invariant was violated (actor mismatch, forbidden field, missing field).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A mandatory referenced object is absent locally and could not be fetched.
    #[error("not found: {0}")]
    NotFound(String),

    /// The authenticated principal may not act for this actor or box.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Storage or transport failure; aborts the transaction.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Outcome class of a failed background job.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Worth retrying later (5xx, 408/429, timeout, transport error).
    #[error("retryable: {0}")]
    Retryable(String),

    /// Retrying cannot help (4xx, malformed destination, local validation error).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<PipelineError> for JobError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Internal(e) => JobError::Retryable(format!("{e:#}")),
            other => JobError::Permanent(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        JobError::Retryable(format!("{e:#}"))
    }
}
