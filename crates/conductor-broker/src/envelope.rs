// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! The wire envelope and the closed set of inbound/outbound commands (§6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BrokerError;

/// Raw, on-the-wire shape. `correlation_id` and `retry_count` are optional on
/// the wire even though the decoded [`Envelope`] always carries both.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    command: String,
    payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    correlation_id: Option<Uuid>,
    #[serde(default)]
    retry_count: Option<u32>,
}

/// A decoded envelope, common to every queue (§6).
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub command: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub retry_count: u32,
}

impl Envelope {
    /// Decode raw bytes off the wire. Missing `command`/`payload` or
    /// undecodable JSON is `MalformedEnvelope`; a missing `correlation_id`
    /// is tolerated and synthesized (§6).
    pub fn decode(bytes: &[u8]) -> Result<Self, BrokerError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| BrokerError::MalformedEnvelope(e.to_string()))?;

        let correlation_id = wire.correlation_id.unwrap_or_else(|| {
            let id = Uuid::new_v4();
            tracing::warn!(synthesized_correlation_id = %id, "inbound envelope missing correlation_id");
            id
        });

        Ok(Self {
            command: wire.command,
            payload: wire.payload,
            timestamp: wire.timestamp,
            correlation_id,
            retry_count: wire.retry_count.unwrap_or(0),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|e| BrokerError::MalformedEnvelope(e.to_string()))
    }

    /// A copy with `retry_count` incremented, used when redelivering a
    /// `PoisonMessage` (§7).
    pub fn with_incremented_retry(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

/// Every command the Event Router (§4.5) knows how to handle.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    NewCaseFound {
        case_id: String,
    },
    ExecutionSucceeded {
        case_id: String,
        stdout: Option<String>,
    },
    ExecutionFailed {
        case_id: String,
        error_type: String,
        error_message: String,
        original_payload: Option<serde_json::Value>,
    },
    CaseUploadCompleted {
        case_id: String,
        local_path: String,
        remote_path: String,
    },
    ResultsDownloadCompleted {
        case_id: String,
        local_path: String,
        remote_path: String,
    },
    FileTransferFailed {
        case_id: String,
        error_type: String,
        error_message: String,
        original_payload: Option<serde_json::Value>,
    },
}

impl InboundCommand {
    /// The case this event pertains to, used by the router to load the case
    /// row before dispatching to a handler.
    pub fn case_id(&self) -> &str {
        match self {
            Self::NewCaseFound { case_id }
            | Self::ExecutionSucceeded { case_id, .. }
            | Self::ExecutionFailed { case_id, .. }
            | Self::CaseUploadCompleted { case_id, .. }
            | Self::ResultsDownloadCompleted { case_id, .. }
            | Self::FileTransferFailed { case_id, .. } => case_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CaseIdPayload {
    case_id: String,
}

#[derive(Debug, Deserialize)]
struct ExecutionSucceededPayload {
    case_id: String,
    #[serde(default)]
    stdout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FailurePayload {
    case_id: String,
    error_type: String,
    error_message: String,
    #[serde(default)]
    original_payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TransferPayload {
    case_id: String,
    local_path: String,
    remote_path: String,
}

impl TryFrom<&Envelope> for InboundCommand {
    type Error = BrokerError;

    fn try_from(envelope: &Envelope) -> Result<Self, Self::Error> {
        let malformed = |e: serde_json::Error| {
            BrokerError::MalformedEnvelope(format!(
                "command {}: {e}",
                envelope.command
            ))
        };

        match envelope.command.as_str() {
            "new_case_found" => {
                let p: CaseIdPayload =
                    serde_json::from_value(envelope.payload.clone()).map_err(malformed)?;
                Ok(Self::NewCaseFound { case_id: p.case_id })
            }
            "execution_succeeded" => {
                let p: ExecutionSucceededPayload =
                    serde_json::from_value(envelope.payload.clone()).map_err(malformed)?;
                Ok(Self::ExecutionSucceeded {
                    case_id: p.case_id,
                    stdout: p.stdout,
                })
            }
            "execution_failed" => {
                let p: FailurePayload =
                    serde_json::from_value(envelope.payload.clone()).map_err(malformed)?;
                Ok(Self::ExecutionFailed {
                    case_id: p.case_id,
                    error_type: p.error_type,
                    error_message: p.error_message,
                    original_payload: p.original_payload,
                })
            }
            "case_upload_completed" => {
                let p: TransferPayload =
                    serde_json::from_value(envelope.payload.clone()).map_err(malformed)?;
                Ok(Self::CaseUploadCompleted {
                    case_id: p.case_id,
                    local_path: p.local_path,
                    remote_path: p.remote_path,
                })
            }
            "results_download_completed" => {
                let p: TransferPayload =
                    serde_json::from_value(envelope.payload.clone()).map_err(malformed)?;
                Ok(Self::ResultsDownloadCompleted {
                    case_id: p.case_id,
                    local_path: p.local_path,
                    remote_path: p.remote_path,
                })
            }
            "file_transfer_failed" => {
                let p: FailurePayload =
                    serde_json::from_value(envelope.payload.clone()).map_err(malformed)?;
                Ok(Self::FileTransferFailed {
                    case_id: p.case_id,
                    error_type: p.error_type,
                    error_message: p.error_message,
                    original_payload: p.original_payload,
                })
            }
            other => Err(BrokerError::UnknownCommand(other.to_string())),
        }
    }
}

/// Commands the core produces for the file-transfer or remote-executor queues (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    UploadCase {
        case_id: String,
        local_path: String,
        remote_path: String,
    },
    DownloadResults {
        case_id: String,
        local_path: String,
        remote_path: String,
    },
    ExecuteCommand {
        case_id: String,
        command: String,
        gpu_id: String,
        step: String,
    },
}

impl OutboundCommand {
    fn command_name(&self) -> &'static str {
        match self {
            Self::UploadCase { .. } => "upload_case",
            Self::DownloadResults { .. } => "download_results",
            Self::ExecuteCommand { .. } => "execute_command",
        }
    }

    /// Which outbox queue this command is published to (§4.4).
    pub fn queue(&self) -> OutboxQueue {
        match self {
            Self::UploadCase { .. } | Self::DownloadResults { .. } => OutboxQueue::FileTransfer,
            Self::ExecuteCommand { .. } => OutboxQueue::RemoteExecutor,
        }
    }

    /// Wrap into an envelope with `retry_count = 0` and the case's carried
    /// correlation id (§4.4: every outbound envelope carries it).
    pub fn into_envelope(self, correlation_id: Uuid) -> Envelope {
        let command = self.command_name();
        let payload = self.into_payload();

        Envelope {
            command: command.to_string(),
            payload,
            timestamp: Utc::now(),
            correlation_id,
            retry_count: 0,
        }
    }

    /// The wire payload object for this command, independent of serde's
    /// default externally-tagged enum representation.
    fn into_payload(self) -> serde_json::Value {
        match self {
            OutboundCommand::UploadCase {
                case_id,
                local_path,
                remote_path,
            }
            | OutboundCommand::DownloadResults {
                case_id,
                local_path,
                remote_path,
            } => serde_json::json!({
                "case_id": case_id,
                "local_path": local_path,
                "remote_path": remote_path,
            }),
            OutboundCommand::ExecuteCommand {
                case_id,
                command,
                gpu_id,
                step,
            } => serde_json::json!({
                "case_id": case_id,
                "command": command,
                "gpu_id": gpu_id,
                "step": step,
            }),
        }
    }
}

/// The two outbox queues (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxQueue {
    FileTransfer,
    RemoteExecutor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_tolerates_missing_correlation_id_and_retry_count() {
        let raw = br#"{"command":"new_case_found","payload":{"case_id":"C1"}}"#;
        let envelope = Envelope::decode(raw).unwrap();
        assert_eq!(envelope.command, "new_case_found");
        assert_eq!(envelope.retry_count, 0);
    }

    #[test]
    fn decode_rejects_undecodable_bytes() {
        let err = Envelope::decode(b"not json").unwrap_err();
        assert!(matches!(err, BrokerError::MalformedEnvelope(_)));
    }

    #[test]
    fn unknown_command_is_reported_distinctly_from_malformed() {
        let raw = br#"{"command":"reticulate_splines","payload":{}}"#;
        let envelope = Envelope::decode(raw).unwrap();
        let err = InboundCommand::try_from(&envelope).unwrap_err();
        assert!(matches!(err, BrokerError::UnknownCommand(_)));
    }

    #[test]
    fn new_case_found_parses_into_the_typed_command() {
        let raw = br#"{"command":"new_case_found","payload":{"case_id":"C1"},"correlation_id":"5b1b1b1b-1b1b-1b1b-1b1b-1b1b1b1b1b1b","retry_count":2}"#;
        let envelope = Envelope::decode(raw).unwrap();
        assert_eq!(envelope.retry_count, 2);
        let cmd = InboundCommand::try_from(&envelope).unwrap();
        assert_eq!(
            cmd,
            InboundCommand::NewCaseFound {
                case_id: "C1".to_string()
            }
        );
    }

    #[test]
    fn missing_required_field_is_malformed_not_unknown() {
        let raw = br#"{"command":"execution_failed","payload":{"case_id":"C1"}}"#;
        let envelope = Envelope::decode(raw).unwrap();
        let err = InboundCommand::try_from(&envelope).unwrap_err();
        assert!(matches!(err, BrokerError::MalformedEnvelope(_)));
    }

    #[test]
    fn outbound_execute_command_round_trips_through_an_envelope() {
        let cmd = OutboundCommand::ExecuteCommand {
            case_id: "C1".to_string(),
            command: "run --case C1 --gpu 0".to_string(),
            gpu_id: "0".to_string(),
            step: "run_sim".to_string(),
        };
        assert_eq!(cmd.queue(), OutboxQueue::RemoteExecutor);

        let correlation_id = Uuid::new_v4();
        let envelope = cmd.into_envelope(correlation_id);
        assert_eq!(envelope.command, "execute_command");
        assert_eq!(envelope.retry_count, 0);
        assert_eq!(envelope.correlation_id, correlation_id);
        assert_eq!(envelope.payload["case_id"], "C1");
        assert_eq!(envelope.payload["gpu_id"], "0");
    }

    #[test]
    fn with_incremented_retry_bumps_only_the_counter() {
        let raw = br#"{"command":"new_case_found","payload":{"case_id":"C1"},"retry_count":1}"#;
        let envelope = Envelope::decode(raw).unwrap();
        let bumped = envelope.with_incremented_retry();
        assert_eq!(bumped.retry_count, 2);
        assert_eq!(bumped.command, envelope.command);
    }
}
