// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! The Outbox Publisher: publisher-confirms on a dedicated channel (§4.4, §5).

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use crate::envelope::{Envelope, OutboxQueue};
use crate::error::{BrokerError, BrokerResult};

/// Queue names for the two outbox queues (§6).
#[derive(Debug, Clone)]
pub struct OutboxTopology {
    pub file_transfer_queue: String,
    pub remote_executor_queue: String,
}

impl OutboxTopology {
    fn queue_name(&self, queue: OutboxQueue) -> &str {
        match queue {
            OutboxQueue::FileTransfer => &self.file_transfer_queue,
            OutboxQueue::RemoteExecutor => &self.remote_executor_queue,
        }
    }
}

/// The publish side of the broker (§4.4): publishes wait for a broker
/// confirm before the call returns, so a failed inbound ack can safely
/// assume the outbound command never reached a worker.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, queue: OutboxQueue, envelope: &Envelope) -> BrokerResult<()>;
}

/// `lapin`-backed [`OutboxPublisher`] on its own channel with confirms
/// enabled, per §6's "one connection, two channels" topology.
pub struct LapinOutboxPublisher {
    channel: Channel,
    topology: OutboxTopology,
}

impl LapinOutboxPublisher {
    pub async fn connect(amqp_url: &str, topology: OutboxTopology) -> BrokerResult<Self> {
        let conn = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        channel
            .confirm_select(lapin::options::ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        for name in [&topology.file_transfer_queue, &topology.remote_executor_queue] {
            channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
        }

        Ok(Self { channel, topology })
    }
}

#[async_trait]
impl OutboxPublisher for LapinOutboxPublisher {
    async fn publish(&self, queue: OutboxQueue, envelope: &Envelope) -> BrokerResult<()> {
        let bytes = envelope.encode()?;
        let queue_name = self.topology.queue_name(queue);

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue_name,
                BasicPublishOptions::default(),
                &bytes,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        match confirm {
            Confirmation::Ack(_) => Ok(()),
            Confirmation::Nack(_) => Err(BrokerError::Publish(format!(
                "broker nacked publish to {queue_name}"
            ))),
            Confirmation::NotRequested => Err(BrokerError::Publish(
                "publisher confirms not enabled on this channel".to_string(),
            )),
        }
    }
}
