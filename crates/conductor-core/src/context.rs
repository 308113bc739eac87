// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! Placeholder substitution for command and path templates (§4.3, §4.4).
//!
//! The wire format fixes exactly two placeholders, `{case_id}` and
//! `{gpu_id}`, with literal single-brace syntax — there is no conditional
//! logic or nested field access to support, so rendering is a bounded
//! find-and-replace rather than a general template engine.

use crate::error::{ConductorError, Result};

const CASE_ID_PLACEHOLDER: &str = "{case_id}";
const GPU_ID_PLACEHOLDER: &str = "{gpu_id}";

/// The values available for substitution when rendering one step's command
/// or path template.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub case_id: &'a str,
    pub gpu_id: Option<&'a str>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(case_id: &'a str) -> Self {
        Self {
            case_id,
            gpu_id: None,
        }
    }

    pub fn with_gpu_id(mut self, gpu_id: &'a str) -> Self {
        self.gpu_id = Some(gpu_id);
        self
    }

    /// Substitute `{case_id}`/`{gpu_id}` into `template`. A `{gpu_id}`
    /// placeholder with no gpu id in context, or any other unrecognized
    /// brace-delimited token, is a `ConfigurationError` (§4.3: a rendering
    /// failure is fatal configuration, never a runtime surprise).
    pub fn render(&self, template: &str) -> Result<String> {
        if template.contains(GPU_ID_PLACEHOLDER) && self.gpu_id.is_none() {
            return Err(ConductorError::Configuration(format!(
                "template {template:?} references {{gpu_id}} but no gpu is held"
            )));
        }

        let mut rendered = template.replace(CASE_ID_PLACEHOLDER, self.case_id);
        if let Some(gpu_id) = self.gpu_id {
            rendered = rendered.replace(GPU_ID_PLACEHOLDER, gpu_id);
        }

        if let Some(stray) = find_unresolved_placeholder(&rendered) {
            return Err(ConductorError::Configuration(format!(
                "template {template:?} contains unknown placeholder {stray:?}"
            )));
        }

        Ok(rendered)
    }
}

/// Find a `{...}` token left over after substitution, if any.
fn find_unresolved_placeholder(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s[start..].find('}')? + start;
    Some(&s[start..=end])
}
