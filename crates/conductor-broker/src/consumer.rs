// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! The Inbox Consumer: one AMQP channel, strictly-serialized delivery (§5).

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};

use crate::envelope::Envelope;
use crate::error::{BrokerError, BrokerResult};

/// Topology for one logical queue: its own name, the dead-letter exchange
/// bound to it, and the dead-letter queue behind that exchange.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

/// A delivery pulled off the broker, still undecoded: a malformed payload
/// must still be dead-letterable, so decoding happens after `recv`, not during it.
pub struct RawDelivery {
    bytes: Vec<u8>,
    inner: lapin::message::Delivery,
}

impl RawDelivery {
    pub fn decode(&self) -> BrokerResult<Envelope> {
        Envelope::decode(&self.bytes)
    }

    /// Re-encode this delivery's envelope with `retry_count` bumped, for the
    /// `PoisonMessage` redelivery path (§7).
    fn encode_with_incremented_retry(&self) -> BrokerResult<Vec<u8>> {
        self.decode()?.with_incremented_retry().encode()
    }
}

/// The consume side of the broker (§4.5, §5): one prefetch window, one
/// envelope handed to the caller at a time.
#[async_trait]
pub trait InboxConsumer: Send {
    async fn recv(&mut self) -> BrokerResult<RawDelivery>;
    async fn ack(&mut self, delivery: RawDelivery) -> BrokerResult<()>;
    /// Requeue for redelivery (`TransientBrokerError`/`TransientStoreError`/`PoisonMessage`).
    async fn nack_requeue(&mut self, delivery: RawDelivery) -> BrokerResult<()>;
    /// Publish to the bound dead-letter exchange, then ack the original
    /// delivery (§6: dead-lettering is a publish, not broker-native reject).
    async fn dead_letter(&mut self, delivery: RawDelivery) -> BrokerResult<()>;

    /// `PoisonMessage` redelivery (§7): republish the envelope to this same
    /// queue with `retry_count` incremented, then ack the original delivery.
    /// The broker's own redelivery counter is never consulted — the envelope
    /// field is the single source of truth for retry accounting (§6).
    async fn redeliver_incremented(&mut self, delivery: RawDelivery) -> BrokerResult<()>;
}

/// `lapin`-backed [`InboxConsumer`] against a single durable queue with a
/// bound dead-letter exchange/queue pair.
pub struct LapinInboxConsumer {
    channel: Channel,
    consumer: Consumer,
    topology: QueueTopology,
}

impl LapinInboxConsumer {
    /// Connect, declare topology idempotently, and start consuming.
    /// `prefetch` is the broker QoS window (§5: "broker QoS ≤ 8").
    pub async fn connect(
        amqp_url: &str,
        topology: QueueTopology,
        prefetch: u16,
    ) -> BrokerResult<Self> {
        let conn = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        declare_topology(&channel, &topology).await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let consumer = channel
            .basic_consume(
                &topology.queue,
                "conductor",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            channel,
            consumer,
            topology,
        })
    }
}

/// Idempotently declare a durable, non-auto-delete queue and its
/// dead-letter exchange/queue pair (§6: restartable against an already
/// provisioned broker).
pub async fn declare_topology(channel: &Channel, topology: &QueueTopology) -> BrokerResult<()> {
    channel
        .exchange_declare(
            &topology.dead_letter_exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

    channel
        .queue_declare(
            &topology.dead_letter_queue,
            QueueDeclareOptions {
                durable: true,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

    channel
        .queue_bind(
            &topology.dead_letter_queue,
            &topology.dead_letter_exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

    channel
        .queue_declare(
            &topology.queue,
            QueueDeclareOptions {
                durable: true,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

    Ok(())
}

#[async_trait]
impl InboxConsumer for LapinInboxConsumer {
    async fn recv(&mut self) -> BrokerResult<RawDelivery> {
        let delivery = self
            .consumer
            .next()
            .await
            .ok_or_else(|| BrokerError::Consume("consumer stream closed".to_string()))?
            .map_err(|e| BrokerError::Consume(e.to_string()))?;
        let bytes = delivery.data.clone();
        Ok(RawDelivery {
            bytes,
            inner: delivery,
        })
    }

    async fn ack(&mut self, delivery: RawDelivery) -> BrokerResult<()> {
        delivery
            .inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }

    async fn nack_requeue(&mut self, delivery: RawDelivery) -> BrokerResult<()> {
        delivery
            .inner
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }

    async fn dead_letter(&mut self, delivery: RawDelivery) -> BrokerResult<()> {
        self.channel
            .basic_publish(
                &self.topology.dead_letter_exchange,
                "",
                BasicPublishOptions::default(),
                &delivery.bytes,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        delivery
            .inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }

    async fn redeliver_incremented(&mut self, delivery: RawDelivery) -> BrokerResult<()> {
        let bumped = delivery.encode_with_incremented_retry()?;

        self.channel
            .basic_publish(
                "",
                &self.topology.queue,
                BasicPublishOptions::default(),
                &bumped,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        delivery
            .inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))
    }
}
