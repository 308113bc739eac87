// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! Turns a workflow step into an outbound command and publishes it (§4.4).
//!
//! One step type, one queue, one command shape — there is no generic
//! "action" step to dispatch through a plugin registry, so this stays a
//! direct match rather than a lookup table.

use std::sync::Arc;

use conductor_broker::{OutboundCommand, OutboxPublisher};
use uuid::Uuid;

use crate::error::Result;
use crate::workflow::{Step, StepType, WorkflowDefinition};

/// Where an upload/download step reads from and writes to, and the remote
/// paths a worker should use. Resolved by the caller from the step name and
/// the configured root directories (§4.4, §6).
#[derive(Debug, Clone)]
pub struct TransferPaths {
    pub local_path: String,
    pub remote_path: String,
}

/// Publishes a step's command to the correct outbox queue.
pub struct Dispatcher<P> {
    publisher: Arc<P>,
}

impl<P: OutboxPublisher> Dispatcher<P> {
    pub fn new(publisher: Arc<P>) -> Self {
        Self { publisher }
    }

    /// Dispatch an `upload`/`download` step. `transfer` supplies the local
    /// and remote paths already rendered against the case id.
    pub async fn dispatch_transfer(
        &self,
        workflow: &WorkflowDefinition,
        step: &Step,
        case_id: &str,
        correlation_id: Uuid,
        transfer: TransferPaths,
    ) -> Result<()> {
        let _ = workflow;
        let command = match step.step_type {
            StepType::Upload => OutboundCommand::UploadCase {
                case_id: case_id.to_string(),
                local_path: transfer.local_path,
                remote_path: transfer.remote_path,
            },
            StepType::Download => OutboundCommand::DownloadResults {
                case_id: case_id.to_string(),
                local_path: transfer.local_path,
                remote_path: transfer.remote_path,
            },
            StepType::Execute => unreachable!("dispatch_transfer called on an execute step"),
        };
        self.publish(command, correlation_id).await
    }

    /// Dispatch an `execute` step, rendering its command template against
    /// the case id and the GPU id it currently holds.
    pub async fn dispatch_execute(
        &self,
        workflow: &WorkflowDefinition,
        step: &Step,
        case_id: &str,
        gpu_id: &str,
        correlation_id: Uuid,
    ) -> Result<()> {
        let rendered = workflow.render_command(step, case_id, gpu_id)?;
        let command = OutboundCommand::ExecuteCommand {
            case_id: case_id.to_string(),
            command: rendered,
            gpu_id: gpu_id.to_string(),
            step: step.name.clone(),
        };
        self.publish(command, correlation_id).await
    }

    async fn publish(&self, command: OutboundCommand, correlation_id: Uuid) -> Result<()> {
        let queue = command.queue();
        let envelope = command.into_envelope(correlation_id);
        self.publisher.publish(queue, &envelope).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conductor_broker::{BrokerResult, Envelope, OutboxQueue};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(OutboxQueue, Envelope)>>,
    }

    #[async_trait]
    impl OutboxPublisher for RecordingPublisher {
        async fn publish(&self, queue: OutboxQueue, envelope: &Envelope) -> BrokerResult<()> {
            self.published
                .lock()
                .unwrap()
                .push((queue, envelope.clone()));
            Ok(())
        }
    }

    fn workflow() -> WorkflowDefinition {
        let steps = vec![
            Step {
                name: "upload_case_files".to_string(),
                step_type: StepType::Upload,
                progress: 33,
            },
            Step {
                name: "run_sim".to_string(),
                step_type: StepType::Execute,
                progress: 66,
            },
        ];
        let mut templates = HashMap::new();
        templates.insert(
            "run_sim".to_string(),
            "run --case {case_id} --gpu {gpu_id}".to_string(),
        );
        WorkflowDefinition::new(steps, templates).unwrap()
    }

    #[tokio::test]
    async fn dispatches_an_upload_step_to_the_file_transfer_queue() {
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = Dispatcher::new(publisher.clone());
        let wf = workflow();
        let step = wf.step_by_name("upload_case_files").unwrap();

        dispatcher
            .dispatch_transfer(
                &wf,
                step,
                "C1",
                Uuid::new_v4(),
                TransferPaths {
                    local_path: "/local/C1".to_string(),
                    remote_path: "/remote/C1".to_string(),
                },
            )
            .await
            .unwrap();

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, OutboxQueue::FileTransfer);
        assert_eq!(published[0].1.command, "upload_case");
    }

    #[tokio::test]
    async fn dispatches_an_execute_step_with_a_rendered_command() {
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = Dispatcher::new(publisher.clone());
        let wf = workflow();
        let step = wf.step_by_name("run_sim").unwrap();

        dispatcher
            .dispatch_execute(&wf, step, "C1", "0", Uuid::new_v4())
            .await
            .unwrap();

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, OutboxQueue::RemoteExecutor);
        assert_eq!(published[0].1.payload["command"], "run --case C1 --gpu 0");
    }
}
