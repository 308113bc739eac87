// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! The State Store Gateway trait: the single gate for all Conductor persistence.
//!
//! Every method here corresponds to exactly one transaction (§4.1). The
//! Workflow Manager never issues raw queries against the store — it only
//! calls through this trait, so the single-writer discipline and the
//! invariants in §3 are enforced in one place.

use crate::models::{Case, CaseHistoryEntry, ParkedCase, ResourceSlot};
use async_trait::async_trait;
use thiserror::Error;

/// Error types for Gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No case with the given id exists.
    #[error("case not found: {0}")]
    NotFound(String),

    /// The requested mutation is illegal for the case's current status
    /// (e.g. advancing a terminal case).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The database is locked/busy; the caller may retry the transaction
    /// (§7 `TransientStoreError`).
    #[error("store busy: {0}")]
    Busy(String),

    /// Any other database error.
    #[error("database error: {0}")]
    Database(String),

    /// JSON (de)serialization of a stored column failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    /// `TransientStoreError` per §7: retry in-process with backoff, else nack-requeue.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) if is_sqlite_busy(db_err.as_ref()) => {
                Self::Busy(db_err.to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

fn is_sqlite_busy(db_err: &(dyn sqlx::error::DatabaseError + 'static)) -> bool {
    db_err
        .code()
        .map(|code| code == "5" || code == "6") // SQLITE_BUSY / SQLITE_LOCKED
        .unwrap_or(false)
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Outcome of `admit_case`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Inserted,
    AlreadyPresent,
}

/// Outcome of `try_reserve_gpu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(i64),
    NoneAvailable,
}

/// The State Store Gateway (§4.1).
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Insert into the scanned ledger and create a `New` case row atomically.
    /// A duplicate case id is a no-op, not an error.
    async fn admit_case(&self, case_id: &str) -> GatewayResult<AdmitOutcome>;

    /// Load a case by id.
    async fn load_case(&self, case_id: &str) -> GatewayResult<Case>;

    /// Set status to `Processing`, write step/resource/progress, append history.
    /// Fails with `Conflict` if the case is terminal.
    async fn advance_to_step(
        &self,
        case_id: &str,
        new_step: &str,
        resource_index: Option<i64>,
        new_progress: i32,
        cause: &str,
    ) -> GatewayResult<()>;

    /// Set status to `PendingResource`, record the intended step, append history.
    /// Asserts the case holds no resource.
    async fn park_for_resource(&self, case_id: &str, intended_step: &str) -> GatewayResult<()>;

    /// Set status to `Completed`, progress 100, clear the resource column.
    /// Returns the resource index that was held, if any, so the caller can release it.
    async fn mark_completed(&self, case_id: &str) -> GatewayResult<Option<i64>>;

    /// Set status to `Failed` with the given error kind/message. Same shape as
    /// `mark_completed`.
    async fn mark_failed(
        &self,
        case_id: &str,
        error_kind: &str,
        error_message: &str,
    ) -> GatewayResult<Option<i64>>;

    /// Atomically find the lowest-index `Free` slot, flip it to `Reserved`,
    /// and stamp the owner.
    async fn try_reserve_gpu(&self, case_id: &str) -> GatewayResult<ReserveOutcome>;

    /// Flip a slot back to `Free` and clear its owner. Idempotent: releasing
    /// an already-free slot is a no-op (the caller is expected to log a warning).
    async fn release_gpu(&self, gpu_index: i64) -> GatewayResult<()>;

    /// Load a single resource slot (used by tests and the dashboard-facing read path).
    async fn load_resource(&self, gpu_index: i64) -> GatewayResult<ResourceSlot>;

    /// Parked cases, oldest park timestamp first, ties broken by case id.
    async fn list_parked_cases(&self) -> GatewayResult<Vec<ParkedCase>>;

    /// The append-only history for one case, in chronological order.
    async fn case_history(&self, case_id: &str) -> GatewayResult<Vec<CaseHistoryEntry>>;

    /// Lightweight connectivity check for the health surface.
    async fn health_check(&self) -> GatewayResult<()>;
}
