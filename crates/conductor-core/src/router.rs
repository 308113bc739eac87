// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! Table-driven dispatch from an inbound command to a Workflow Manager
//! handler (§4.5).

use conductor_broker::InboundCommand;

/// What the Workflow Manager should do with a decoded inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedEvent {
    /// `new_case_found`.
    Start { case_id: String },
    /// Any success event: `execution_succeeded`, `case_upload_completed`,
    /// `results_download_completed`.
    Advance { case_id: String },
    /// Any failure event: `execution_failed`, `file_transfer_failed`.
    Fail {
        case_id: String,
        error_type: String,
        error_message: String,
    },
}

/// Maps every known [`InboundCommand`] onto its handler (§4.5's table).
/// There is no "unknown" or "malformed" variant here — those are rejected
/// earlier, at envelope decode and command parsing, never reaching the
/// router with a typed command in hand.
pub struct EventRouter;

impl EventRouter {
    pub fn route(command: InboundCommand) -> RoutedEvent {
        match command {
            InboundCommand::NewCaseFound { case_id } => RoutedEvent::Start { case_id },
            InboundCommand::ExecutionSucceeded { case_id, .. }
            | InboundCommand::CaseUploadCompleted { case_id, .. }
            | InboundCommand::ResultsDownloadCompleted { case_id, .. } => {
                RoutedEvent::Advance { case_id }
            }
            InboundCommand::ExecutionFailed {
                case_id,
                error_type,
                error_message,
                ..
            }
            | InboundCommand::FileTransferFailed {
                case_id,
                error_type,
                error_message,
                ..
            } => RoutedEvent::Fail {
                case_id,
                error_type,
                error_message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_case_found_routes_to_start() {
        let routed = EventRouter::route(InboundCommand::NewCaseFound {
            case_id: "C1".to_string(),
        });
        assert_eq!(
            routed,
            RoutedEvent::Start {
                case_id: "C1".to_string()
            }
        );
    }

    #[test]
    fn every_success_event_routes_to_advance() {
        let events = [
            InboundCommand::ExecutionSucceeded {
                case_id: "C1".to_string(),
                stdout: None,
            },
            InboundCommand::CaseUploadCompleted {
                case_id: "C1".to_string(),
                local_path: "/l".to_string(),
                remote_path: "/r".to_string(),
            },
            InboundCommand::ResultsDownloadCompleted {
                case_id: "C1".to_string(),
                local_path: "/l".to_string(),
                remote_path: "/r".to_string(),
            },
        ];
        for event in events {
            assert_eq!(
                EventRouter::route(event),
                RoutedEvent::Advance {
                    case_id: "C1".to_string()
                }
            );
        }
    }

    #[test]
    fn every_failure_event_routes_to_fail_with_error_details() {
        let events = [
            InboundCommand::ExecutionFailed {
                case_id: "C1".to_string(),
                error_type: "timeout".to_string(),
                error_message: "worker timed out".to_string(),
                original_payload: None,
            },
            InboundCommand::FileTransferFailed {
                case_id: "C1".to_string(),
                error_type: "timeout".to_string(),
                error_message: "worker timed out".to_string(),
                original_payload: None,
            },
        ];
        for event in events {
            assert_eq!(
                EventRouter::route(event),
                RoutedEvent::Fail {
                    case_id: "C1".to_string(),
                    error_type: "timeout".to_string(),
                    error_message: "worker timed out".to_string(),
                }
            );
        }
    }
}
