// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! The Conductor's error taxonomy: behavioral kinds, not a type hierarchy (§7).
//!
//! Every variant maps to exactly one row of §7's policy table via
//! [`ConductorError::is_retryable`] and [`ConductorError::ack_decision`]. The
//! Workflow Manager never lets one of these escape to the Consumer as a raw
//! exception — it returns the decision and the Consumer acts on it.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConductorError {
    /// Malformed workflow definition or a missing command template. Fatal at
    /// startup; if surfaced while rendering a step at runtime, the case is
    /// marked `FAILED` and the event is dropped, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Publish-confirm timeout or a broker connection reset.
    #[error("transient broker error: {0}")]
    TransientBroker(String),

    /// The store was locked/busy when a transaction tried to start.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// An event for a case that is already terminal, or whose current step
    /// does not match the event (out-of-order/duplicate delivery).
    #[error("stale event for case {0}")]
    StaleEvent(String),

    /// The envelope's `command` field named nothing the router recognizes.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The envelope could not be decoded, or a required field was missing.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A worker reported `*_failed` for a case. Always terminal; the
    /// Conductor never retries a step the worker gave up on.
    #[error("worker reported failure ({error_type}): {error_message}")]
    WorkerReportedFailure {
        error_type: String,
        error_message: String,
    },

    /// The handler raised an unexpected error while processing an envelope.
    #[error("poison message: {0}")]
    Poison(String),
}

/// What the Consumer should do with the delivery once a handler returns
/// one of the kinds above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    NackRequeue,
    DeadLetter,
}

impl ConductorError {
    /// True for the two kinds the Workflow Manager retries in-process
    /// (broker reconnect with backoff, store transaction retry) before
    /// falling back to nack-requeue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientBroker(_) | Self::TransientStore(_))
    }

    /// The default ack decision for this kind (§7). `Poison` is deliberately
    /// excluded: its decision depends on the envelope's `retry_count` versus
    /// the configured maximum, which this error alone doesn't know — the
    /// Consumer decides that case by comparing counts.
    pub fn ack_decision(&self) -> AckDecision {
        match self {
            Self::Configuration(_) => AckDecision::Ack,
            Self::TransientBroker(_) | Self::TransientStore(_) => AckDecision::NackRequeue,
            Self::StaleEvent(_) => AckDecision::Ack,
            Self::UnknownCommand(_) => AckDecision::Ack,
            Self::MalformedEnvelope(_) => AckDecision::DeadLetter,
            Self::WorkerReportedFailure { .. } => AckDecision::Ack,
            Self::Poison(_) => AckDecision::NackRequeue,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;

impl From<conductor_state::GatewayError> for ConductorError {
    fn from(err: conductor_state::GatewayError) -> Self {
        match err {
            conductor_state::GatewayError::Busy(msg) => Self::TransientStore(msg),
            conductor_state::GatewayError::Database(msg) => Self::TransientStore(msg),
            conductor_state::GatewayError::Serialization(msg) => Self::MalformedEnvelope(msg),
            conductor_state::GatewayError::NotFound(msg) => Self::StaleEvent(msg),
            conductor_state::GatewayError::Conflict(msg) => Self::StaleEvent(msg),
        }
    }
}

impl From<conductor_broker::BrokerError> for ConductorError {
    fn from(err: conductor_broker::BrokerError) -> Self {
        match err {
            conductor_broker::BrokerError::Connection(msg)
            | conductor_broker::BrokerError::Publish(msg)
            | conductor_broker::BrokerError::Consume(msg) => Self::TransientBroker(msg),
            conductor_broker::BrokerError::MalformedEnvelope(msg) => Self::MalformedEnvelope(msg),
            conductor_broker::BrokerError::UnknownCommand(msg) => Self::UnknownCommand(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(ConductorError::TransientBroker("x".into()).is_retryable());
        assert!(ConductorError::TransientStore("x".into()).is_retryable());
        assert!(!ConductorError::StaleEvent("x".into()).is_retryable());
        assert!(!ConductorError::Poison("x".into()).is_retryable());
    }

    #[test]
    fn malformed_envelope_always_dead_letters() {
        assert_eq!(
            ConductorError::MalformedEnvelope("x".into()).ack_decision(),
            AckDecision::DeadLetter
        );
    }

    #[test]
    fn unknown_command_acks_and_drops_never_dead_letters() {
        assert_eq!(
            ConductorError::UnknownCommand("x".into()).ack_decision(),
            AckDecision::Ack
        );
    }

    #[test]
    fn gateway_busy_maps_to_transient_store() {
        let err: ConductorError = conductor_state::GatewayError::Busy("locked".into()).into();
        assert!(matches!(err, ConductorError::TransientStore(_)));
    }
}
