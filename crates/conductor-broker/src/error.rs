// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! Broker-facing error kinds (§7).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Connection/channel setup or reconnect failed.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// A publish did not receive a positive confirm in time (`TransientBrokerError`).
    #[error("publish-confirm error: {0}")]
    Publish(String),

    /// The consumer stream ended or a channel-level error surfaced while consuming.
    #[error("consume error: {0}")]
    Consume(String),

    /// Envelope bytes could not be decoded, or a required field was missing
    /// (`MalformedEnvelope`, §7): dead-letter immediately, never retried.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Envelope decoded but named a command the router has no handler for
    /// (`UnknownCommand`, §7): ack and drop, never dead-lettered.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

impl BrokerError {
    /// `TransientBrokerError` per §7: nack-requeue, reconnect with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Publish(_) | Self::Consume(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
