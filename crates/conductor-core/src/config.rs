// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! Process configuration: a single YAML file, validated eagerly at startup,
//! with environment overrides for deployment-time secrets (§6).
//!
//! No hot-reload: the file is read once, validated, and the result is
//! immutable for the life of the process.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ConductorError, Result};
use crate::manager::{TransferConfig, TransferRoots};
use crate::workflow::{Step, WorkflowDefinition};

const BROKER_URL_ENV: &str = "CONDUCTOR_BROKER_URL";
const STORE_PATH_ENV: &str = "CONDUCTOR_STORE_PATH";

/// The raw shape of the YAML configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    broker_url: String,
    inbox_queue: String,
    file_transfer_queue: String,
    remote_executor_queue: String,
    dead_letter_exchange: String,
    #[serde(default = "default_prefetch")]
    prefetch: u16,
    #[serde(default = "default_max_retry_count")]
    max_retry_count: u32,
    store_path: String,
    workflow: Vec<Step>,
    command_templates: HashMap<String, String>,
    upload_local_root: String,
    upload_remote_root: String,
    download_local_root: String,
    download_remote_root: String,
}

fn default_prefetch() -> u16 {
    8
}

fn default_max_retry_count() -> u32 {
    5
}

/// Fully parsed and validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker_url: String,
    pub inbox_queue: String,
    pub file_transfer_queue: String,
    pub remote_executor_queue: String,
    pub dead_letter_exchange: String,
    pub prefetch: u16,
    pub max_retry_count: u32,
    pub store_path: String,
    pub workflow: WorkflowDefinition,
    pub transfer: TransferConfig,
}

impl Config {
    /// Load, parse, and eagerly validate configuration from a YAML file,
    /// applying environment overrides for the broker URL and store path on
    /// top of the parsed values (§6).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConductorError::Configuration(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from an in-memory YAML string.
    /// Split out from [`Config::load`] so tests can exercise parsing without
    /// touching the filesystem.
    pub fn parse(yaml: &str) -> Result<Self> {
        let mut raw: RawConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ConductorError::Configuration(format!("invalid config yaml: {e}")))?;

        if let Ok(broker_url) = std::env::var(BROKER_URL_ENV) {
            raw.broker_url = broker_url;
        }
        if let Ok(store_path) = std::env::var(STORE_PATH_ENV) {
            raw.store_path = store_path;
        }

        if raw.broker_url.trim().is_empty() {
            return Err(ConductorError::Configuration(
                "broker_url must not be empty".to_string(),
            ));
        }
        if raw.store_path.trim().is_empty() {
            return Err(ConductorError::Configuration(
                "store_path must not be empty".to_string(),
            ));
        }

        let workflow = WorkflowDefinition::new(raw.workflow, raw.command_templates)?;

        Ok(Self {
            broker_url: raw.broker_url,
            inbox_queue: raw.inbox_queue,
            file_transfer_queue: raw.file_transfer_queue,
            remote_executor_queue: raw.remote_executor_queue,
            dead_letter_exchange: raw.dead_letter_exchange,
            prefetch: raw.prefetch,
            max_retry_count: raw.max_retry_count,
            store_path: raw.store_path,
            workflow,
            transfer: TransferConfig {
                upload: TransferRoots {
                    local_root: raw.upload_local_root,
                    remote_root: raw.upload_remote_root,
                },
                download: TransferRoots {
                    local_root: raw.download_local_root,
                    remote_root: raw.download_remote_root,
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
broker_url: "amqp://localhost:5672/%2f"
inbox_queue: "conductor_queue"
file_transfer_queue: "file_transfer_queue"
remote_executor_queue: "remote_executor_queue"
dead_letter_exchange: "conductor.dlx"
store_path: "/var/lib/conductor/state.db"
workflow:
  - name: upload_case_files
    type: upload
    progress: 25
  - name: run_sim
    type: execute
    progress: 75
  - name: download_results
    type: download
    progress: 100
command_templates:
  run_sim: "run --case {case_id} --gpu {gpu_id}"
upload_local_root: "/data/cases/{case_id}"
upload_remote_root: "/remote/cases/{case_id}"
download_local_root: "/data/results/{case_id}"
download_remote_root: "/remote/results/{case_id}"
"#;

    #[test]
    fn parses_a_complete_valid_file() {
        let config = Config::parse(VALID_YAML).unwrap();
        assert_eq!(config.broker_url, "amqp://localhost:5672/%2f");
        assert_eq!(config.prefetch, 8);
        assert_eq!(config.max_retry_count, 5);
        assert!(config.workflow.first_step().is_some());
    }

    #[test]
    fn rejects_a_workflow_with_duplicate_step_names() {
        let yaml = VALID_YAML.replace("download_results", "run_sim");
        let err = Config::parse(&yaml).unwrap_err();
        assert!(matches!(err, ConductorError::Configuration(_)));
    }

    #[test]
    fn rejects_an_execute_step_missing_a_template() {
        let yaml = VALID_YAML.replace(
            "command_templates:\n  run_sim: \"run --case {case_id} --gpu {gpu_id}\"",
            "command_templates: {}",
        );
        let err = Config::parse(&yaml).unwrap_err();
        assert!(matches!(err, ConductorError::Configuration(_)));
    }

    #[test]
    fn rejects_an_empty_broker_url() {
        let yaml = VALID_YAML.replace(
            "broker_url: \"amqp://localhost:5672/%2f\"",
            "broker_url: \"\"",
        );
        let err = Config::parse(&yaml).unwrap_err();
        assert!(matches!(err, ConductorError::Configuration(_)));
    }

    #[test]
    fn rejects_unparseable_yaml() {
        let err = Config::parse("not: valid: yaml: [").unwrap_err();
        assert!(matches!(err, ConductorError::Configuration(_)));
    }
}
