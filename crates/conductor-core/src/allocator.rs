// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! GPU resource pool management (§4.2).
//!
//! Wraps the Gateway's reservation primitives with the policy layer the
//! store itself doesn't know about: a case that can't get a GPU parks
//! instead of failing, and releasing a GPU wakes the longest-waiting parked
//! case rather than whichever caller asks next.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use conductor_state::{Gateway, ParkedCase, ReserveOutcome};

use crate::error::Result;
use crate::metrics;

/// The result of attempting to reserve a GPU for a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// A slot was reserved; `gpu_id` is the external device identifier used
    /// to render `{gpu_id}` into execute-step commands.
    Reserved { gpu_index: i64, gpu_id: String },
    /// No slot is currently free; the caller should park the case.
    NoneAvailable,
}

/// Wraps a [`Gateway`] with the Conductor's resource-pool policy.
pub struct ResourceAllocator<G> {
    gateway: Arc<G>,
    /// Mirrors how many slots this allocator currently holds reserved, for
    /// the occupancy gauge (§10). Only valid because every reserve/release
    /// for this pool goes through this allocator — never read the store for
    /// a reserved count directly.
    reserved_count: AtomicI64,
}

impl<G: Gateway> ResourceAllocator<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            reserved_count: AtomicI64::new(0),
        }
    }

    /// Attempt to reserve the lowest-index free slot for `case_id`.
    pub async fn reserve(&self, case_id: &str) -> Result<Reservation> {
        let outcome = match self.gateway.try_reserve_gpu(case_id).await? {
            ReserveOutcome::Reserved(gpu_index) => {
                let slot = self.gateway.load_resource(gpu_index).await?;
                let reserved = self.reserved_count.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::set_gpu_slots_reserved(reserved);
                Reservation::Reserved {
                    gpu_index,
                    gpu_id: slot.gpu_id,
                }
            }
            ReserveOutcome::NoneAvailable => Reservation::NoneAvailable,
        };
        metrics::set_cases_parked(self.gateway.list_parked_cases().await?.len() as i64);
        Ok(outcome)
    }

    /// Release a held slot back to the pool. Idempotent — releasing an
    /// already-free slot is a no-op at the store layer.
    pub async fn release(&self, gpu_index: i64) -> Result<()> {
        self.gateway.release_gpu(gpu_index).await?;
        let reserved = (self.reserved_count.fetch_sub(1, Ordering::SeqCst) - 1).max(0);
        metrics::set_gpu_slots_reserved(reserved);
        metrics::set_cases_parked(self.gateway.list_parked_cases().await?.len() as i64);
        Ok(())
    }

    /// The device id string for a slot index, needed to render `{gpu_id}`
    /// when an execute step resumes with a GPU it already holds.
    pub async fn gpu_id_for(&self, gpu_index: i64) -> Result<String> {
        let slot = self.gateway.load_resource(gpu_index).await?;
        Ok(slot.gpu_id)
    }

    /// The longest-parked case, if any, in FIFO order (§4.2, §4.6: a freed
    /// GPU wakes the oldest waiter, not whoever happens to ask next).
    pub async fn next_parked(&self) -> Result<Option<ParkedCase>> {
        let mut parked = self.gateway.list_parked_cases().await?;
        Ok(if parked.is_empty() {
            None
        } else {
            Some(parked.remove(0))
        })
    }

    /// Every currently parked case, oldest first.
    pub async fn parked_cases(&self) -> Result<Vec<ParkedCase>> {
        Ok(self.gateway.list_parked_cases().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_state::{ResourceSeed, SqliteGateway};

    async fn gateway_with_one_gpu() -> Arc<SqliteGateway> {
        let gw = SqliteGateway::connect(":memory:").await.unwrap();
        gw.seed_resources(&[ResourceSeed {
            gpu_index: 0,
            gpu_id: "gpu-0".to_string(),
        }])
        .await
        .unwrap();
        Arc::new(gw)
    }

    #[tokio::test]
    async fn reserves_the_only_free_slot_then_reports_none_available() {
        let gw = gateway_with_one_gpu().await;
        gw.admit_case("C1").await.unwrap();
        gw.admit_case("C2").await.unwrap();
        let alloc = ResourceAllocator::new(gw);

        let first = alloc.reserve("C1").await.unwrap();
        assert!(matches!(first, Reservation::Reserved { gpu_index: 0, .. }));

        let second = alloc.reserve("C2").await.unwrap();
        assert_eq!(second, Reservation::NoneAvailable);
    }

    #[tokio::test]
    async fn release_then_reserve_round_trips() {
        let gw = gateway_with_one_gpu().await;
        gw.admit_case("C1").await.unwrap();
        let alloc = ResourceAllocator::new(gw);

        let reservation = alloc.reserve("C1").await.unwrap();
        let gpu_index = match reservation {
            Reservation::Reserved { gpu_index, .. } => gpu_index,
            Reservation::NoneAvailable => panic!("expected a reservation"),
        };

        alloc.release(gpu_index).await.unwrap();

        let reserved_again = alloc.reserve("C1").await.unwrap();
        assert!(matches!(
            reserved_again,
            Reservation::Reserved { gpu_index: 0, .. }
        ));
    }

    #[tokio::test]
    async fn next_parked_returns_oldest_first() {
        let gw = SqliteGateway::connect(":memory:").await.unwrap();
        gw.admit_case("C1").await.unwrap();
        gw.admit_case("C2").await.unwrap();
        gw.park_for_resource("C1", "run_sim").await.unwrap();
        gw.park_for_resource("C2", "run_sim").await.unwrap();

        let alloc = ResourceAllocator::new(Arc::new(gw));
        let next = alloc.next_parked().await.unwrap().unwrap();
        assert_eq!(next.case_id, "C1");
    }

    #[tokio::test]
    async fn next_parked_is_none_when_nothing_is_parked() {
        let gw = SqliteGateway::connect(":memory:").await.unwrap();
        let alloc = ResourceAllocator::new(Arc::new(gw));
        assert!(alloc.next_parked().await.unwrap().is_none());
    }
}
