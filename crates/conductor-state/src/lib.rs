// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! Transactional state store gateway for the Conductor.
//!
//! This crate owns the single-file SQLite database that holds every case,
//! its history, and the shared GPU pool. Nothing outside [`sqlite::SqliteGateway`]
//! issues SQL; every other crate talks to the store through the [`traits::Gateway`]
//! trait.

pub mod models;
pub mod sqlite;
pub mod traits;

pub use models::{Case, CaseHistoryEntry, CaseStatus, ParkedCase, ResourceSlot, ResourceState};
pub use sqlite::{ResourceSeed, SqliteGateway};
pub use traits::{AdmitOutcome, Gateway, GatewayError, GatewayResult, ReserveOutcome};
