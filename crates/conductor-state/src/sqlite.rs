// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! SQLite-backed implementation of the [`Gateway`] trait.
//!
//! The Conductor has exactly one writer (the event loop, §5), so every
//! mutating operation here opens with `BEGIN IMMEDIATE` rather than a plain
//! `BEGIN`: it claims the reserved lock up front instead of discovering a
//! conflict partway through the transaction, which under WAL journaling is
//! what lets long-running readers (health checks, the dashboard query in
//! `case_history`) proceed without ever seeing `SQLITE_BUSY`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::models::{Case, CaseHistoryEntry, CaseStatus, ParkedCase, ResourceSlot, ResourceState};
use crate::traits::{AdmitOutcome, Gateway, GatewayError, GatewayResult, ReserveOutcome};

/// A single GPU slot to seed the resource pool with at startup.
#[derive(Debug, Clone)]
pub struct ResourceSeed {
    pub gpu_index: i64,
    pub gpu_id: String,
}

/// The SQLite-backed Gateway. Holds a pool rather than a single connection
/// so concurrent readers (health check, dashboard reads) don't block behind
/// the single writer's `BEGIN IMMEDIATE` transactions.
#[derive(Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    /// Open (creating if absent) the database at `path` and run migrations.
    /// `path` may be `:memory:` for tests.
    pub async fn connect(path: &str) -> GatewayResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| GatewayError::Database(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(SqliteSynchronous::Normal)
            .pragma("journal_mode", "WAL");

        // A single writer means a pool bigger than ~4 buys nothing for
        // writes, but readers (health check, history queries) benefit from
        // not queuing behind each other.
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::Database(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| GatewayError::Database(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Seed the GPU pool. Idempotent: a gpu_index already present is left
    /// untouched (its `state`/`owner_case_id` survive process restarts).
    pub async fn seed_resources(&self, seeds: &[ResourceSeed]) -> GatewayResult<()> {
        let now = Utc::now();
        for seed in seeds {
            sqlx::query(
                "INSERT INTO gpu_resources (gpu_index, gpu_id, state, owner_case_id, updated_at)
                 VALUES (?, ?, 'FREE', NULL, ?)
                 ON CONFLICT(gpu_index) DO NOTHING",
            )
            .bind(seed.gpu_index)
            .bind(&seed.gpu_id)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn begin_immediate(&self) -> GatewayResult<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await?;
        Ok(conn)
    }

    async fn commit(mut conn: sqlx::pool::PoolConnection<sqlx::Sqlite>) -> GatewayResult<()> {
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(())
    }

    async fn rollback(mut conn: sqlx::pool::PoolConnection<sqlx::Sqlite>) {
        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
    }
}

fn parse_ts(s: &str) -> GatewayResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GatewayError::Database(format!("malformed timestamp {s}: {e}")))
}

fn row_to_case(row: &sqlx::sqlite::SqliteRow) -> GatewayResult<Case> {
    let status: String = row.try_get("status")?;
    let correlation_id: String = row.try_get("correlation_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let terminal_at: Option<String> = row.try_get("terminal_at")?;

    Ok(Case {
        case_id: row.try_get("case_id")?,
        status: CaseStatus::from_str(&status)
            .map_err(GatewayError::Database)?,
        current_step: row.try_get("current_step")?,
        resource_index: row.try_get("resource_index")?,
        progress: row.try_get("progress")?,
        correlation_id: uuid::Uuid::parse_str(&correlation_id)
            .map_err(|e| GatewayError::Database(e.to_string()))?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        terminal_at: terminal_at.map(|s| parse_ts(&s)).transpose()?,
        error_kind: row.try_get("error_kind")?,
        error_message: row.try_get("error_message")?,
    })
}

fn row_to_resource(row: &sqlx::sqlite::SqliteRow) -> GatewayResult<ResourceSlot> {
    let state: String = row.try_get("state")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(ResourceSlot {
        gpu_index: row.try_get("gpu_index")?,
        gpu_id: row.try_get("gpu_id")?,
        state: match state.as_str() {
            "FREE" => ResourceState::Free,
            "RESERVED" => ResourceState::Reserved,
            other => {
                return Err(GatewayError::Database(format!(
                    "invalid resource state: {other}"
                )))
            }
        },
        owner_case_id: row.try_get("owner_case_id")?,
        utilization: row.try_get("utilization")?,
        memory_used: row.try_get("memory_used")?,
        memory_total: row.try_get("memory_total")?,
        temperature: row.try_get("temperature")?,
        updated_at: parse_ts(&updated_at)?,
    })
}

#[async_trait]
impl Gateway for SqliteGateway {
    async fn admit_case(&self, case_id: &str) -> GatewayResult<AdmitOutcome> {
        let mut conn = self.begin_immediate().await?;

        let already: Option<(String,)> =
            sqlx::query_as("SELECT case_id FROM scanned_cases WHERE case_id = ?")
                .bind(case_id)
                .fetch_optional(&mut *conn)
                .await?;

        if already.is_some() {
            Self::commit(conn).await?;
            return Ok(AdmitOutcome::AlreadyPresent);
        }

        let now = Utc::now().to_rfc3339();
        let correlation_id = uuid::Uuid::new_v4().to_string();

        let result = async {
            sqlx::query("INSERT INTO scanned_cases (case_id, discovered_at) VALUES (?, ?)")
                .bind(case_id)
                .bind(&now)
                .execute(&mut *conn)
                .await?;

            sqlx::query(
                "INSERT INTO cases
                    (case_id, status, current_step, resource_index, progress,
                     correlation_id, created_at, updated_at, parked_at, terminal_at,
                     error_kind, error_message)
                 VALUES (?, 'new', NULL, NULL, 0, ?, ?, ?, NULL, NULL, NULL, NULL)",
            )
            .bind(case_id)
            .bind(&correlation_id)
            .bind(&now)
            .bind(&now)
            .execute(&mut *conn)
            .await?;

            Ok::<(), sqlx::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                Self::commit(conn).await?;
                Ok(AdmitOutcome::Inserted)
            }
            Err(e) => {
                Self::rollback(conn).await;
                Err(e.into())
            }
        }
    }

    async fn load_case(&self, case_id: &str) -> GatewayResult<Case> {
        let row = sqlx::query("SELECT * FROM cases WHERE case_id = ?")
            .bind(case_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| GatewayError::NotFound(case_id.to_string()))?;
        row_to_case(&row)
    }

    async fn advance_to_step(
        &self,
        case_id: &str,
        new_step: &str,
        resource_index: Option<i64>,
        new_progress: i32,
        cause: &str,
    ) -> GatewayResult<()> {
        let mut conn = self.begin_immediate().await?;

        let existing: Option<sqlx::sqlite::SqliteRow> =
            sqlx::query("SELECT status FROM cases WHERE case_id = ?")
                .bind(case_id)
                .fetch_optional(&mut *conn)
                .await?;

        let Some(row) = existing else {
            Self::rollback(conn).await;
            return Err(GatewayError::NotFound(case_id.to_string()));
        };

        let from_status: String = row.try_get("status")?;
        let from = CaseStatus::from_str(&from_status).map_err(GatewayError::Database)?;
        if from.is_terminal() {
            Self::rollback(conn).await;
            return Err(GatewayError::Conflict(format!(
                "case {case_id} is terminal ({from})"
            )));
        }

        let now = Utc::now().to_rfc3339();
        let result = async {
            sqlx::query(
                "UPDATE cases
                 SET status = 'processing', current_step = ?, resource_index = ?,
                     progress = ?, updated_at = ?, parked_at = NULL
                 WHERE case_id = ?",
            )
            .bind(new_step)
            .bind(resource_index)
            .bind(new_progress)
            .bind(&now)
            .bind(case_id)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "INSERT INTO case_history (case_id, ts, from_status, to_status, step, cause)
                 VALUES (?, ?, ?, 'processing', ?, ?)",
            )
            .bind(case_id)
            .bind(&now)
            .bind(from.to_string())
            .bind(new_step)
            .bind(cause)
            .execute(&mut *conn)
            .await?;

            Ok::<(), sqlx::Error>(())
        }
        .await;

        match result {
            Ok(()) => Self::commit(conn).await,
            Err(e) => {
                Self::rollback(conn).await;
                Err(e.into())
            }
        }
    }

    async fn park_for_resource(&self, case_id: &str, intended_step: &str) -> GatewayResult<()> {
        let mut conn = self.begin_immediate().await?;

        let existing: Option<sqlx::sqlite::SqliteRow> =
            sqlx::query("SELECT status, resource_index FROM cases WHERE case_id = ?")
                .bind(case_id)
                .fetch_optional(&mut *conn)
                .await?;

        let Some(row) = existing else {
            Self::rollback(conn).await;
            return Err(GatewayError::NotFound(case_id.to_string()));
        };

        let from_status: String = row.try_get("status")?;
        let from = CaseStatus::from_str(&from_status).map_err(GatewayError::Database)?;
        let resource_index: Option<i64> = row.try_get("resource_index")?;

        if from.is_terminal() {
            Self::rollback(conn).await;
            return Err(GatewayError::Conflict(format!(
                "case {case_id} is terminal ({from})"
            )));
        }
        if resource_index.is_some() {
            Self::rollback(conn).await;
            return Err(GatewayError::Conflict(format!(
                "case {case_id} still holds resource {resource_index:?}, cannot park"
            )));
        }

        let now = Utc::now().to_rfc3339();
        let result = async {
            // parked_at keeps its original value across a re-park so the
            // FIFO wake order in list_parked_cases stays stable.
            sqlx::query(
                "UPDATE cases
                 SET status = 'pending_resource', current_step = ?, updated_at = ?,
                     parked_at = COALESCE(parked_at, ?)
                 WHERE case_id = ?",
            )
            .bind(intended_step)
            .bind(&now)
            .bind(&now)
            .bind(case_id)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "INSERT INTO case_history (case_id, ts, from_status, to_status, step, cause)
                 VALUES (?, ?, ?, 'pending_resource', ?, 'parked_for_resource')",
            )
            .bind(case_id)
            .bind(&now)
            .bind(from.to_string())
            .bind(intended_step)
            .execute(&mut *conn)
            .await?;

            Ok::<(), sqlx::Error>(())
        }
        .await;

        match result {
            Ok(()) => Self::commit(conn).await,
            Err(e) => {
                Self::rollback(conn).await;
                Err(e.into())
            }
        }
    }

    async fn mark_completed(&self, case_id: &str) -> GatewayResult<Option<i64>> {
        self.mark_terminal(case_id, CaseStatus::Completed, 100, None, None, "completed")
            .await
    }

    async fn mark_failed(
        &self,
        case_id: &str,
        error_kind: &str,
        error_message: &str,
    ) -> GatewayResult<Option<i64>> {
        self.mark_terminal(
            case_id,
            CaseStatus::Failed,
            -1,
            Some(error_kind),
            Some(error_message),
            "failed",
        )
        .await
    }

    async fn try_reserve_gpu(&self, case_id: &str) -> GatewayResult<ReserveOutcome> {
        let mut conn = self.begin_immediate().await?;

        let free: Option<(i64,)> = sqlx::query_as(
            "SELECT gpu_index FROM gpu_resources WHERE state = 'FREE' ORDER BY gpu_index ASC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await?;

        let Some((gpu_index,)) = free else {
            Self::commit(conn).await?;
            return Ok(ReserveOutcome::NoneAvailable);
        };

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE gpu_resources
             SET state = 'RESERVED', owner_case_id = ?, updated_at = ?
             WHERE gpu_index = ?",
        )
        .bind(case_id)
        .bind(&now)
        .bind(gpu_index)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => {
                Self::commit(conn).await?;
                Ok(ReserveOutcome::Reserved(gpu_index))
            }
            Err(e) => {
                Self::rollback(conn).await;
                Err(e.into())
            }
        }
    }

    async fn release_gpu(&self, gpu_index: i64) -> GatewayResult<()> {
        let mut conn = self.begin_immediate().await?;

        let state: Option<(String,)> =
            sqlx::query_as("SELECT state FROM gpu_resources WHERE gpu_index = ?")
                .bind(gpu_index)
                .fetch_optional(&mut *conn)
                .await?;

        let Some((state,)) = state else {
            Self::rollback(conn).await;
            return Err(GatewayError::NotFound(format!(
                "gpu slot {gpu_index} not found"
            )));
        };

        if state == "FREE" {
            tracing::warn!(gpu_index, "release_gpu called on an already-free slot");
            Self::commit(conn).await?;
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE gpu_resources
             SET state = 'FREE', owner_case_id = NULL, updated_at = ?
             WHERE gpu_index = ?",
        )
        .bind(&now)
        .bind(gpu_index)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Self::commit(conn).await,
            Err(e) => {
                Self::rollback(conn).await;
                Err(e.into())
            }
        }
    }

    async fn load_resource(&self, gpu_index: i64) -> GatewayResult<ResourceSlot> {
        let row = sqlx::query("SELECT * FROM gpu_resources WHERE gpu_index = ?")
            .bind(gpu_index)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("gpu slot {gpu_index} not found")))?;
        row_to_resource(&row)
    }

    async fn list_parked_cases(&self) -> GatewayResult<Vec<ParkedCase>> {
        let rows = sqlx::query(
            "SELECT case_id, current_step, parked_at FROM cases
             WHERE status = 'pending_resource'
             ORDER BY parked_at ASC, case_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let case_id: String = row.try_get("case_id")?;
                let intended_step: Option<String> = row.try_get("current_step")?;
                let parked_at: Option<String> = row.try_get("parked_at")?;
                Ok(ParkedCase {
                    case_id,
                    intended_step: intended_step.unwrap_or_default(),
                    parked_at: parked_at
                        .map(|s| parse_ts(&s))
                        .transpose()?
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    async fn case_history(&self, case_id: &str) -> GatewayResult<Vec<CaseHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, case_id, ts, from_status, to_status, step, cause
             FROM case_history WHERE case_id = ? ORDER BY ts ASC, id ASC",
        )
        .bind(case_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let ts: String = row.try_get("ts")?;
                let from_status: String = row.try_get("from_status")?;
                let to_status: String = row.try_get("to_status")?;
                Ok(CaseHistoryEntry {
                    id: row.try_get("id")?,
                    case_id: row.try_get("case_id")?,
                    ts: parse_ts(&ts)?,
                    from_status: CaseStatus::from_str(&from_status)
                        .map_err(GatewayError::Database)?,
                    to_status: CaseStatus::from_str(&to_status)
                        .map_err(GatewayError::Database)?,
                    step: row.try_get("step")?,
                    cause: row.try_get("cause")?,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> GatewayResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

impl SqliteGateway {
    /// Shared body for `mark_completed`/`mark_failed`: both set a terminal
    /// status, clear the held resource, and stamp `terminal_at`.
    async fn mark_terminal(
        &self,
        case_id: &str,
        to: CaseStatus,
        progress: i32,
        error_kind: Option<&str>,
        error_message: Option<&str>,
        cause: &str,
    ) -> GatewayResult<Option<i64>> {
        let mut conn = self.begin_immediate().await?;

        let existing: Option<sqlx::sqlite::SqliteRow> =
            sqlx::query("SELECT status, resource_index, progress FROM cases WHERE case_id = ?")
                .bind(case_id)
                .fetch_optional(&mut *conn)
                .await?;

        let Some(row) = existing else {
            Self::rollback(conn).await;
            return Err(GatewayError::NotFound(case_id.to_string()));
        };

        let from_status: String = row.try_get("status")?;
        let from = CaseStatus::from_str(&from_status).map_err(GatewayError::Database)?;
        let resource_index: Option<i64> = row.try_get("resource_index")?;
        let prior_progress: i32 = row.try_get("progress")?;

        if from.is_terminal() {
            Self::rollback(conn).await;
            return Err(GatewayError::Conflict(format!(
                "case {case_id} is already terminal ({from})"
            )));
        }

        let final_progress = if progress < 0 { prior_progress } else { progress };
        let now = Utc::now().to_rfc3339();

        let result = async {
            sqlx::query(
                "UPDATE cases
                 SET status = ?, progress = ?, resource_index = NULL, parked_at = NULL,
                     terminal_at = ?, updated_at = ?, error_kind = ?, error_message = ?
                 WHERE case_id = ?",
            )
            .bind(to.to_string())
            .bind(final_progress)
            .bind(&now)
            .bind(&now)
            .bind(error_kind)
            .bind(error_message)
            .bind(case_id)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                "INSERT INTO case_history (case_id, ts, from_status, to_status, step, cause)
                 VALUES (?, ?, ?, ?, NULL, ?)",
            )
            .bind(case_id)
            .bind(&now)
            .bind(from.to_string())
            .bind(to.to_string())
            .bind(cause)
            .execute(&mut *conn)
            .await?;

            Ok::<(), sqlx::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                Self::commit(conn).await?;
                Ok(resource_index)
            }
            Err(e) => {
                Self::rollback(conn).await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn gateway_with_gpus(n: i64) -> SqliteGateway {
        let gw = SqliteGateway::connect(":memory:").await.unwrap();
        let seeds: Vec<ResourceSeed> = (0..n)
            .map(|i| ResourceSeed {
                gpu_index: i,
                gpu_id: format!("gpu-{i}"),
            })
            .collect();
        gw.seed_resources(&seeds).await.unwrap();
        gw
    }

    #[tokio::test]
    async fn admit_case_is_idempotent() {
        let gw = gateway_with_gpus(1).await;
        assert_eq!(
            gw.admit_case("case-1").await.unwrap(),
            AdmitOutcome::Inserted
        );
        assert_eq!(
            gw.admit_case("case-1").await.unwrap(),
            AdmitOutcome::AlreadyPresent
        );

        let case = gw.load_case("case-1").await.unwrap();
        assert_eq!(case.status, CaseStatus::New);
    }

    #[tokio::test]
    async fn advance_to_step_rejects_terminal_cases() {
        let gw = gateway_with_gpus(1).await;
        gw.admit_case("case-1").await.unwrap();
        gw.advance_to_step("case-1", "upload", None, 10, "dispatch")
            .await
            .unwrap();
        gw.mark_completed("case-1").await.unwrap();

        let err = gw
            .advance_to_step("case-1", "upload", None, 10, "dispatch")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn reserve_and_release_gpu_round_trips() {
        let gw = gateway_with_gpus(1).await;
        match gw.try_reserve_gpu("case-1").await.unwrap() {
            ReserveOutcome::Reserved(idx) => {
                let slot = gw.load_resource(idx).await.unwrap();
                assert_eq!(slot.state, ResourceState::Reserved);
                assert_eq!(slot.owner_case_id.as_deref(), Some("case-1"));

                assert!(matches!(
                    gw.try_reserve_gpu("case-2").await.unwrap(),
                    ReserveOutcome::NoneAvailable
                ));

                gw.release_gpu(idx).await.unwrap();
                let slot = gw.load_resource(idx).await.unwrap();
                assert_eq!(slot.state, ResourceState::Free);
            }
            ReserveOutcome::NoneAvailable => panic!("expected a free slot"),
        }
    }

    #[tokio::test]
    async fn release_already_free_gpu_is_a_noop() {
        let gw = gateway_with_gpus(1).await;
        gw.release_gpu(0).await.unwrap();
        let slot = gw.load_resource(0).await.unwrap();
        assert_eq!(slot.state, ResourceState::Free);
    }

    #[tokio::test]
    async fn park_for_resource_preserves_original_timestamp_across_reparks() {
        let gw = gateway_with_gpus(1).await;
        gw.admit_case("case-1").await.unwrap();
        gw.park_for_resource("case-1", "execute").await.unwrap();
        let first = gw.load_case("case-1").await.unwrap();

        gw.park_for_resource("case-1", "execute").await.unwrap();
        let second = gw.load_case("case-1").await.unwrap();

        let parked = gw.list_parked_cases().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].case_id, "case-1");
        assert_eq!(first.status, second.status);
    }

    #[tokio::test]
    async fn parked_cases_are_ordered_fifo() {
        let gw = gateway_with_gpus(1).await;
        for id in ["a", "b", "c"] {
            gw.admit_case(id).await.unwrap();
            gw.park_for_resource(id, "execute").await.unwrap();
        }
        let parked = gw.list_parked_cases().await.unwrap();
        let ids: Vec<&str> = parked.iter().map(|p| p.case_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn mark_completed_clears_resource_and_sets_progress_full() {
        let gw = gateway_with_gpus(1).await;
        gw.admit_case("case-1").await.unwrap();
        let ReserveOutcome::Reserved(idx) = gw.try_reserve_gpu("case-1").await.unwrap() else {
            panic!("expected reservation");
        };
        gw.advance_to_step("case-1", "execute", Some(idx), 40, "dispatch")
            .await
            .unwrap();

        let released = gw.mark_completed("case-1").await.unwrap();
        assert_eq!(released, Some(idx));

        let case = gw.load_case("case-1").await.unwrap();
        assert_eq!(case.status, CaseStatus::Completed);
        assert_eq!(case.progress, 100);
        assert!(case.resource_index.is_none());
        assert!(case.terminal_at.is_some());
    }

    #[tokio::test]
    async fn mark_failed_preserves_progress_and_records_error() {
        let gw = gateway_with_gpus(1).await;
        gw.admit_case("case-1").await.unwrap();
        gw.advance_to_step("case-1", "upload", None, 25, "dispatch")
            .await
            .unwrap();

        gw.mark_failed("case-1", "worker_reported_failure", "exit code 1")
            .await
            .unwrap();

        let case = gw.load_case("case-1").await.unwrap();
        assert_eq!(case.status, CaseStatus::Failed);
        assert_eq!(case.progress, 25);
        assert_eq!(case.error_kind.as_deref(), Some("worker_reported_failure"));
    }

    #[tokio::test]
    async fn case_history_is_chronological() {
        let gw = gateway_with_gpus(1).await;
        gw.admit_case("case-1").await.unwrap();
        gw.advance_to_step("case-1", "upload", None, 10, "dispatch")
            .await
            .unwrap();
        gw.mark_completed("case-1").await.unwrap();

        let history = gw.case_history("case-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].to_status, CaseStatus::Processing);
        assert_eq!(history[1].to_status, CaseStatus::Completed);
    }

    #[tokio::test]
    async fn health_check_succeeds_against_a_live_pool() {
        let gw = gateway_with_gpus(0).await;
        gw.health_check().await.unwrap();
    }
}
