// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! The workflow definition: a flat, ordered list of steps (§4.3).
//!
//! Every case walks the same linear sequence — there is no fan-out/fan-in or
//! conditional branching to resolve at runtime, so this is deliberately a
//! thinner structure than a dependency graph.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::context::TemplateContext;
use crate::error::{ConductorError, Result};

/// The kind of work a step performs, and therefore which outbox queue and
/// resource policy apply to it (§4.2, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Upload,
    Execute,
    Download,
}

impl StepType {
    /// Only `execute` steps require a GPU (§4.2).
    pub fn needs_resource(self) -> bool {
        matches!(self, Self::Execute)
    }
}

/// One entry in the workflow's ordered list (§6: `{name, type, progress}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// The case's `progress` value once this step has been dispatched.
    pub progress: i32,
}

/// Parsed, validated workflow definition plus the execute-step command
/// templates it renders against.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    steps: Vec<Step>,
    templates: HashMap<String, String>,
}

impl WorkflowDefinition {
    /// Build and eagerly validate a definition (§4.3): step names must be
    /// unique, every `execute` step must name a template key, and the
    /// workflow must not be empty. All three are `ConfigurationError`s, not
    /// runtime surprises.
    pub fn new(steps: Vec<Step>, templates: HashMap<String, String>) -> Result<Self> {
        if steps.is_empty() {
            return Err(ConductorError::Configuration(
                "workflow has no steps".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ConductorError::Configuration(format!(
                    "duplicate step name: {}",
                    step.name
                )));
            }
        }

        for step in &steps {
            if step.step_type == StepType::Execute && !templates.contains_key(&step.name) {
                return Err(ConductorError::Configuration(format!(
                    "execute step '{}' has no command template",
                    step.name
                )));
            }
        }

        Ok(Self { steps, templates })
    }

    /// True when the workflow has no steps; §8's empty-workflow boundary
    /// case routes a case straight to `Failed` instead of dispatching.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }

    /// The step that follows `current`, or `None` at the end of the workflow.
    pub fn next_step(&self, current: &str) -> Option<&Step> {
        let idx = self.steps.iter().position(|s| s.name == current)?;
        self.steps.get(idx + 1)
    }

    pub fn step_by_name(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Render an `execute` step's command template against a case id and
    /// reserved GPU index (§4.3). Any other step type is a programmer error,
    /// not a data error, since only `execute` steps carry a template.
    pub fn render_command(&self, step: &Step, case_id: &str, gpu_id: &str) -> Result<String> {
        let template = self.templates.get(&step.name).ok_or_else(|| {
            ConductorError::Configuration(format!(
                "execute step '{}' has no command template",
                step.name
            ))
        })?;
        TemplateContext::new(case_id)
            .with_gpu_id(gpu_id)
            .render(template)
    }
}
