// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! The Workflow Manager: the core state machine (§4.6).
//!
//! Every handler is load case -> decide -> mutate -> publish, built out of
//! the Gateway's already-transactional operations. This is the direct
//! successor of an in-process step executor, re-purposed from "run the step"
//! to "dispatch the step and wait for the worker's event".

use std::sync::Arc;
use std::time::Duration;

use conductor_broker::OutboxPublisher;
use conductor_state::{Case, CaseStatus, Gateway};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::allocator::{Reservation, ResourceAllocator};
use crate::dispatcher::{Dispatcher, TransferPaths};
use crate::error::{ConductorError, Result};
use crate::metrics;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::router::RoutedEvent;
use crate::workflow::{StepType, WorkflowDefinition};

/// §7: up to ~5 in-process attempts for `TransientBrokerError`/
/// `TransientStoreError` before the Consumer falls back to nack-requeue.
fn default_retry_policy() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(25), 2.0, Duration::from_secs(2))
}

/// The configured root paths a `{case_id}`-rendered local/remote path pair
/// is built from for a transfer step (§4.4, §6).
#[derive(Debug, Clone)]
pub struct TransferRoots {
    pub local_root: String,
    pub remote_root: String,
}

impl TransferRoots {
    /// Render `{case_id}` into both roots to produce the paths for one
    /// transfer step.
    pub fn render(&self, case_id: &str) -> Result<TransferPaths> {
        let ctx = crate::context::TemplateContext::new(case_id);
        Ok(TransferPaths {
            local_path: ctx.render(&self.local_root)?,
            remote_path: ctx.render(&self.remote_root)?,
        })
    }
}

/// Upload steps and download steps read/write different root directories
/// (§6: separate `upload_*_root`/`download_*_root` configuration), so the
/// Manager needs one [`TransferRoots`] per direction rather than one shared
/// pair.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub upload: TransferRoots,
    pub download: TransferRoots,
}

/// The core state machine. Generic over the Gateway and outbox publisher so
/// tests can swap in an in-memory store and a recording publisher.
pub struct WorkflowManager<G, P> {
    gateway: Arc<G>,
    allocator: ResourceAllocator<G>,
    dispatcher: Dispatcher<P>,
    workflow: WorkflowDefinition,
    transfer_config: TransferConfig,
    retry: RetryExecutor,
}

impl<G, P> WorkflowManager<G, P>
where
    G: Gateway,
    P: OutboxPublisher,
{
    pub fn new(
        gateway: Arc<G>,
        publisher: Arc<P>,
        workflow: WorkflowDefinition,
        transfer_config: TransferConfig,
    ) -> Self {
        Self::with_retry_policy(gateway, publisher, workflow, transfer_config, default_retry_policy())
    }

    /// Like [`Self::new`], but with an explicit in-process retry policy for
    /// `TransientBrokerError`/`TransientStoreError` (§7). Exposed so a
    /// deployment can tune retry/backoff without touching the default.
    pub fn with_retry_policy(
        gateway: Arc<G>,
        publisher: Arc<P>,
        workflow: WorkflowDefinition,
        transfer_config: TransferConfig,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            allocator: ResourceAllocator::new(gateway.clone()),
            dispatcher: Dispatcher::new(publisher),
            gateway,
            workflow,
            transfer_config,
            retry: RetryExecutor::new(retry_policy),
        }
    }

    /// Dispatch a routed event to its handler (§4.5/§4.6), retrying
    /// transient broker/store errors in-process with capped exponential
    /// backoff before giving up and letting the Consumer nack-requeue (§7).
    pub async fn handle(&self, event: RoutedEvent) -> Result<()> {
        match event {
            RoutedEvent::Start { case_id } => {
                self.retry.execute(|| self.start(&case_id)).await
            }
            RoutedEvent::Advance { case_id } => {
                self.retry.execute(|| self.advance(&case_id)).await
            }
            RoutedEvent::Fail {
                case_id,
                error_type,
                error_message,
            } => {
                self.retry
                    .execute(|| self.fail(&case_id, &error_type, &error_message))
                    .await
            }
        }
    }

    /// `new_case_found`.
    #[instrument(skip(self))]
    pub async fn start(&self, case_id: &str) -> Result<()> {
        self.gateway.admit_case(case_id).await?;
        let case = self.gateway.load_case(case_id).await?;
        if case.status != CaseStatus::New {
            info!(case_id, status = %case.status, "stale new_case_found, dropping");
            return Ok(());
        }

        let Some(first_step) = self.workflow.first_step() else {
            warn!(case_id, "workflow has no steps, failing case");
            self.gateway
                .mark_failed(
                    case_id,
                    "ConfigurationError",
                    "workflow definition has no steps",
                )
                .await?;
            metrics::record_case_failed("ConfigurationError");
            return Ok(());
        };

        self.advance_into_step(&case, first_step, "start").await
    }

    /// Any success event: `execution_succeeded`, `case_upload_completed`,
    /// `results_download_completed`.
    #[instrument(skip(self))]
    pub async fn advance(&self, case_id: &str) -> Result<()> {
        let case = self.gateway.load_case(case_id).await?;
        if case.status.is_terminal() {
            info!(case_id, status = %case.status, "stale success event, dropping");
            return Ok(());
        }

        let current_step = case.current_step.as_deref().unwrap_or_default();
        let Some(next_step) = self.workflow.next_step(current_step) else {
            if let Some(gpu_index) = self.gateway.mark_completed(case_id).await? {
                self.release_and_wake(gpu_index).await?;
            }
            metrics::record_case_completed();
            info!(case_id, "workflow complete");
            return Ok(());
        };

        if next_step.step_type.needs_resource() {
            if let Some(gpu_index) = case.resource_index {
                // Already holding a slot and the next step needs one too
                // (e.g. execute -> execute): retain it rather than releasing
                // and re-reserving, since `try_reserve_gpu` only looks at
                // FREE slots and would otherwise park a case on its own
                // held resource (§8 Scenario F).
                let gpu_id = self.allocator.gpu_id_for(gpu_index).await?;
                self.gateway
                    .advance_to_step(
                        case_id,
                        &next_step.name,
                        Some(gpu_index),
                        next_step.progress,
                        "advance",
                    )
                    .await?;
                return self.dispatch_or_fail(&case, next_step, Some(&gpu_id)).await;
            }
        } else if let Some(gpu_index) = case.resource_index {
            self.release_and_wake(gpu_index).await?;
        }

        self.advance_into_step(&case, next_step, "advance").await
    }

    /// Any failure event: `execution_failed`, `file_transfer_failed`.
    #[instrument(skip(self))]
    pub async fn fail(&self, case_id: &str, error_type: &str, error_message: &str) -> Result<()> {
        let case = self.gateway.load_case(case_id).await?;
        if case.status.is_terminal() {
            info!(case_id, status = %case.status, "stale failure event, dropping");
            return Ok(());
        }

        let held_resource = self
            .gateway
            .mark_failed(case_id, error_type, error_message)
            .await?;
        if let Some(gpu_index) = held_resource {
            self.release_and_wake(gpu_index).await?;
        }
        metrics::record_case_failed(error_type);
        Ok(())
    }

    /// Internal `retry_parked` event, raised by the Allocator after a
    /// release wakes the oldest parked case.
    #[instrument(skip(self))]
    pub async fn retry_parked(&self, case_id: &str) -> Result<()> {
        let case = self.gateway.load_case(case_id).await?;
        if case.status != CaseStatus::PendingResource {
            info!(case_id, status = %case.status, "parked case state drifted, dropping");
            return Ok(());
        }

        let Some(intended_step) = case.current_step.as_deref() else {
            warn!(case_id, "parked case has no intended step recorded");
            return Ok(());
        };
        let Some(step) = self.workflow.step_by_name(intended_step).cloned() else {
            self.gateway
                .mark_failed(
                    case_id,
                    "ConfigurationError",
                    &format!("intended step '{intended_step}' no longer exists"),
                )
                .await?;
            metrics::record_case_failed("ConfigurationError");
            return Ok(());
        };

        match self.allocator.reserve(case_id).await? {
            Reservation::NoneAvailable => {
                // Re-park preserves the original park timestamp (§4.6): the
                // store's COALESCE semantics handle that, not us.
                self.gateway.park_for_resource(case_id, &step.name).await?;
                Ok(())
            }
            Reservation::Reserved { gpu_index, gpu_id } => {
                self.gateway
                    .advance_to_step(case_id, &step.name, Some(gpu_index), step.progress, "retry_parked")
                    .await?;
                self.dispatch_or_fail(&case, &step, Some(&gpu_id)).await
            }
        }
    }

    /// Shared by `start`/`advance`/`retry_parked`: reserve a resource if the
    /// step needs one (parking on contention), commit the step transition,
    /// and dispatch.
    async fn advance_into_step(
        &self,
        case: &Case,
        step: &crate::workflow::Step,
        cause: &str,
    ) -> Result<()> {
        if step.step_type.needs_resource() {
            match self.allocator.reserve(&case.case_id).await? {
                Reservation::NoneAvailable => {
                    self.gateway
                        .park_for_resource(&case.case_id, &step.name)
                        .await?;
                    return Ok(());
                }
                Reservation::Reserved { gpu_index, gpu_id } => {
                    self.gateway
                        .advance_to_step(
                            &case.case_id,
                            &step.name,
                            Some(gpu_index),
                            step.progress,
                            cause,
                        )
                        .await?;
                    return self.dispatch_or_fail(case, step, Some(&gpu_id)).await;
                }
            }
        }

        self.gateway
            .advance_to_step(&case.case_id, &step.name, None, step.progress, cause)
            .await?;
        self.dispatch_or_fail(case, step, None).await
    }

    /// Dispatch a step, turning a `ConfigurationError` raised by rendering
    /// (a stray placeholder, or a `{gpu_id}` template with no gpu held) into
    /// a terminal `FAILED` case instead of letting it escape `handle()` —
    /// the case has already been committed into this step holding its GPU
    /// by the time rendering runs, so a bad template must release that
    /// resource and fail the case here, not just ack and drop the event
    /// (§7: a runtime configuration error is fatal to the case, never
    /// retried).
    async fn dispatch_or_fail(
        &self,
        case: &Case,
        step: &crate::workflow::Step,
        gpu_id: Option<&str>,
    ) -> Result<()> {
        match self.dispatch(case, step, gpu_id).await {
            Ok(()) => Ok(()),
            Err(ConductorError::Configuration(message)) => {
                warn!(
                    case_id = %case.case_id,
                    error = %message,
                    "dispatch failed to render its template, failing case"
                );
                let held = self
                    .gateway
                    .mark_failed(&case.case_id, "ConfigurationError", &message)
                    .await?;
                if let Some(gpu_index) = held {
                    self.release_and_wake(gpu_index).await?;
                }
                metrics::record_case_failed("ConfigurationError");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    async fn dispatch(
        &self,
        case: &Case,
        step: &crate::workflow::Step,
        gpu_id: Option<&str>,
    ) -> Result<()> {
        let correlation_id: Uuid = case.correlation_id;
        match step.step_type {
            StepType::Upload => {
                let paths = self.transfer_config.upload.render(&case.case_id)?;
                self.dispatcher
                    .dispatch_transfer(&self.workflow, step, &case.case_id, correlation_id, paths)
                    .await
            }
            StepType::Download => {
                let paths = self.transfer_config.download.render(&case.case_id)?;
                self.dispatcher
                    .dispatch_transfer(&self.workflow, step, &case.case_id, correlation_id, paths)
                    .await
            }
            StepType::Execute => {
                let gpu_id = gpu_id.expect("execute step always dispatches with a held gpu");
                self.dispatcher
                    .dispatch_execute(&self.workflow, step, &case.case_id, gpu_id, correlation_id)
                    .await
            }
        }
    }

    /// Release a GPU slot, then wake the oldest parked case if any (§4.2).
    async fn release_and_wake(&self, gpu_index: i64) -> Result<()> {
        self.allocator.release(gpu_index).await?;
        if let Some(parked) = self.allocator.next_parked().await? {
            self.retry_parked(&parked.case_id).await?;
        }
        Ok(())
    }
}
