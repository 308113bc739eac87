// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! Data models for the Conductor's persisted state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Case lifecycle status.
///
/// Transitions form a DAG: `New -> PendingResource <-> Processing -> {Completed | Failed}`.
/// Once a case reaches `Completed` or `Failed` no further transition is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum CaseStatus {
    /// Admitted, no step dispatched yet.
    New,
    /// Waiting for a GPU slot before the intended step can be dispatched.
    PendingResource,
    /// A step has been dispatched and the case holds whatever resource it needs.
    Processing,
    /// Terminal: all workflow steps completed.
    Completed,
    /// Terminal: a worker reported failure, or the workflow is misconfigured.
    Failed,
}

impl CaseStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::PendingResource => "pending_resource",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "pending_resource" => Ok(Self::PendingResource),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid case status: {other}")),
        }
    }
}

/// One unit of QA work, identified by the source directory name that was discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    pub status: CaseStatus,
    /// Current workflow step name, or the step a `PendingResource` case is blocked on.
    pub current_step: Option<String>,
    pub resource_index: Option<i64>,
    pub progress: i32,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl Case {
    /// `status = Processing` must imply a held resource and a current step (§3 invariant).
    pub fn invariants_hold(&self) -> bool {
        match self.status {
            CaseStatus::Processing => self.resource_index.is_some() && self.current_step.is_some(),
            CaseStatus::New
            | CaseStatus::PendingResource
            | CaseStatus::Completed
            | CaseStatus::Failed => self.resource_index.is_none(),
        }
    }
}

/// GPU slot mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum ResourceState {
    Free,
    Reserved,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "FREE"),
            Self::Reserved => write!(f, "RESERVED"),
        }
    }
}

/// One GPU slot in the shared resource pool.
///
/// Only `state` and `owner_case_id` are written by the Conductor; the metrics
/// fields are written by the external resource-metrics updater and are
/// read-only from the Conductor's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSlot {
    pub gpu_index: i64,
    pub gpu_id: String,
    pub state: ResourceState,
    pub owner_case_id: Option<String>,
    pub utilization: Option<f64>,
    pub memory_used: Option<i64>,
    pub memory_total: Option<i64>,
    pub temperature: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// One append-only row in a case's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseHistoryEntry {
    pub id: i64,
    pub case_id: String,
    pub ts: DateTime<Utc>,
    pub from_status: CaseStatus,
    pub to_status: CaseStatus,
    pub step: Option<String>,
    pub cause: String,
}

/// A case parked waiting for a GPU to free up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkedCase {
    pub case_id: String,
    pub intended_step: String,
    pub parked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_status_round_trips_through_display_and_from_str() {
        for s in [
            CaseStatus::New,
            CaseStatus::PendingResource,
            CaseStatus::Processing,
            CaseStatus::Completed,
            CaseStatus::Failed,
        ] {
            let parsed: CaseStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!CaseStatus::New.is_terminal());
        assert!(!CaseStatus::PendingResource.is_terminal());
        assert!(!CaseStatus::Processing.is_terminal());
        assert!(CaseStatus::Completed.is_terminal());
        assert!(CaseStatus::Failed.is_terminal());
    }

    fn case_with(status: CaseStatus, step: Option<&str>, resource: Option<i64>) -> Case {
        Case {
            case_id: "C1".to_string(),
            status,
            current_step: step.map(str::to_string),
            resource_index: resource,
            progress: 0,
            correlation_id: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            terminal_at: None,
            error_kind: None,
            error_message: None,
        }
    }

    #[test]
    fn processing_case_must_hold_a_resource_and_a_step() {
        assert!(case_with(CaseStatus::Processing, Some("run"), Some(0)).invariants_hold());
        assert!(!case_with(CaseStatus::Processing, Some("run"), None).invariants_hold());
        assert!(!case_with(CaseStatus::Processing, None, Some(0)).invariants_hold());
    }

    #[test]
    fn non_processing_cases_must_not_hold_a_resource() {
        assert!(case_with(CaseStatus::New, None, None).invariants_hold());
        assert!(!case_with(CaseStatus::Completed, None, Some(0)).invariants_hold());
    }
}
