// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! AMQP transport for the Conductor: the inbox (commands in) and the two
//! outbox queues (commands out), both on top of `lapin`.

pub mod consumer;
pub mod envelope;
pub mod error;
pub mod publisher;

pub use consumer::{InboxConsumer, LapinInboxConsumer, QueueTopology, RawDelivery};
pub use envelope::{Envelope, InboundCommand, OutboundCommand, OutboxQueue};
pub use error::{BrokerError, BrokerResult};
pub use publisher::{LapinOutboxPublisher, OutboxPublisher, OutboxTopology};
