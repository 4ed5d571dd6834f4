// WorkflowState: the findings accumulator for one multi-step tool run.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use conclave_common::Confidence;
use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// One caller-supplied step of a workflow tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepRequest {
    /// What the caller is investigating in this step.
    pub step: String,
    pub step_number: u32,
    pub total_steps: u32,
    pub next_step_required: bool,
    pub findings: String,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub relevant_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_id: Option<String>,
    /// Provider routing hints forwarded to expert analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl StepRequest {
    pub fn validate(&self) -> Result<(), CallError> {
        if self.step_number == 0 {
            return Err(CallError::InvalidParams("step_number must be at least 1".into()));
        }
        if self.total_steps == 0 {
            return Err(CallError::InvalidParams("total_steps must be at least 1".into()));
        }
        if self.step.trim().is_empty() {
            return Err(CallError::InvalidParams("step must not be empty".into()));
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(CallError::InvalidParams(format!(
                    "temperature must be within 0.0..=2.0 (got {temperature})"
                )));
            }
        }
        Ok(())
    }
}

/// Evidence recorded by a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub step_number: u32,
    pub step: String,
    pub findings: String,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,
    #[serde(default)]
    pub relevant_files: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub continuation_id: String,
    pub tool: String,
    pub step_number: u32,
    pub total_steps: u32,
    pub confidence: Confidence,
    pub next_step_required: bool,
    pub findings: Vec<Finding>,
    pub relevant_files: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(continuation_id: impl Into<String>, tool: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            continuation_id: continuation_id.into(),
            tool: tool.into(),
            step_number: 0,
            total_steps: 0,
            confidence: Confidence::default(),
            next_step_required: true,
            findings: Vec::new(),
            relevant_files: BTreeSet::new(),
            hypothesis: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record `step`. A step number at or below the last one recorded is a
    /// revision: findings from that step onward are discarded first.
    /// Returns true when the step revised earlier findings.
    pub fn apply_step(&mut self, step: &StepRequest) -> bool {
        let revision = self.step_number > 0 && step.step_number <= self.step_number;
        if revision {
            self.findings.retain(|finding| finding.step_number < step.step_number);
        }

        let files = normalize_paths(&step.relevant_files);
        self.findings.push(Finding {
            step_number: step.step_number,
            step: step.step.clone(),
            findings: step.findings.clone(),
            confidence: step.confidence,
            hypothesis: step.hypothesis.clone(),
            relevant_files: files,
            recorded_at: Utc::now(),
        });

        self.step_number = step.step_number;
        self.total_steps = step.total_steps.max(step.step_number);
        self.confidence = step.confidence;
        self.next_step_required = step.next_step_required;
        if step.hypothesis.is_some() {
            self.hypothesis = step.hypothesis.clone();
        } else if revision {
            self.hypothesis =
                self.findings.iter().rev().find_map(|finding| finding.hypothesis.clone());
        }
        self.relevant_files = self
            .findings
            .iter()
            .flat_map(|finding| finding.relevant_files.iter().cloned())
            .collect();
        self.updated_at = Utc::now();
        revision
    }

    /// The accumulated findings rendered as the expert-analysis prompt.
    pub fn render_prompt(&self) -> String {
        let mut prompt = format!(
            "Tool: {}\nStep {} of {}\nConfidence: {}\n",
            self.tool, self.step_number, self.total_steps, self.confidence
        );
        if let Some(hypothesis) = &self.hypothesis {
            prompt.push_str(&format!("Current hypothesis: {hypothesis}\n"));
        }
        if !self.relevant_files.is_empty() {
            prompt.push_str("Relevant files:\n");
            for file in &self.relevant_files {
                prompt.push_str(&format!("- {file}\n"));
            }
        }
        prompt.push_str("\nFindings:\n");
        for finding in &self.findings {
            prompt.push_str(&format!(
                "\n[step {} | {}] {}\n{}\n",
                finding.step_number, finding.confidence, finding.step, finding.findings
            ));
        }
        prompt
    }
}

/// Normalize a caller-supplied path: `\` becomes `/`, repeated separators and
/// `.` segments collapse, a trailing `/` is dropped.
pub fn normalize_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    let absolute = unified.starts_with('/');
    let segments: Vec<&str> =
        unified.split('/').filter(|segment| !segment.is_empty() && *segment != ".").collect();

    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Normalized, deduplicated and sorted.
pub fn normalize_paths(raw: &[String]) -> Vec<String> {
    raw.iter()
        .filter(|path| !path.trim().is_empty())
        .map(|path| normalize_path(path))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(number: u32, confidence: Confidence, next: bool) -> StepRequest {
        StepRequest {
            step: format!("step {number}"),
            step_number: number,
            total_steps: 3,
            next_step_required: next,
            findings: format!("found {number}"),
            confidence,
            relevant_files: Vec::new(),
            hypothesis: None,
            continuation_id: None,
            model: None,
            temperature: None,
            provider: None,
        }
    }

    #[test]
    fn paths_normalize_separators_and_dots() {
        assert_eq!(normalize_path("src\\lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("./src//daemon/./main.rs"), "src/daemon/main.rs");
        assert_eq!(normalize_path("/abs/dir/"), "/abs/dir");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("./"), ".");
    }

    #[test]
    fn path_list_is_deduplicated_and_sorted() {
        let raw = vec!["b.rs".to_string(), "./a.rs".to_string(), "a.rs".into(), "  ".into()];
        assert_eq!(normalize_paths(&raw), vec!["a.rs".to_string(), "b.rs".to_string()]);
    }

    #[test]
    fn steps_accumulate_findings_and_files() {
        let mut state = WorkflowState::new("c1", "analyze");
        let mut first = step(1, Confidence::Low, true);
        first.relevant_files = vec!["src\\a.rs".into()];
        let mut second = step(2, Confidence::Medium, true);
        second.relevant_files = vec!["src/b.rs".into(), "src/a.rs".into()];

        assert!(!state.apply_step(&first));
        assert!(!state.apply_step(&second));

        assert_eq!(state.step_number, 2);
        assert_eq!(state.confidence, Confidence::Medium);
        assert_eq!(state.findings.len(), 2);
        assert_eq!(
            state.relevant_files.iter().cloned().collect::<Vec<_>>(),
            vec!["src/a.rs".to_string(), "src/b.rs".to_string()]
        );
    }

    #[test]
    fn revisiting_a_step_drops_later_findings() {
        let mut state = WorkflowState::new("c1", "debug");
        state.apply_step(&step(1, Confidence::Low, true));
        let mut second = step(2, Confidence::Medium, true);
        second.relevant_files = vec!["only-in-two.rs".into()];
        second.hypothesis = Some("race".into());
        state.apply_step(&second);
        state.apply_step(&step(3, Confidence::High, true));

        let revised = state.apply_step(&step(2, Confidence::Low, true));
        assert!(revised);
        assert_eq!(
            state.findings.iter().map(|finding| finding.step_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(state.relevant_files.is_empty());
        assert_eq!(state.hypothesis, None);
        assert_eq!(state.confidence, Confidence::Low);
    }

    #[test]
    fn total_steps_grows_when_caller_overruns_estimate() {
        let mut state = WorkflowState::new("c1", "thinkdeep");
        let mut fifth = step(5, Confidence::High, true);
        fifth.total_steps = 3;
        state.apply_step(&fifth);
        assert_eq!(state.total_steps, 5);
    }

    #[test]
    fn prompt_includes_every_finding_in_order() {
        let mut state = WorkflowState::new("c1", "analyze");
        state.apply_step(&step(1, Confidence::Low, true));
        state.apply_step(&step(2, Confidence::High, false));

        let prompt = state.render_prompt();
        let first = prompt.find("found 1").unwrap();
        let second = prompt.find("found 2").unwrap();
        assert!(first < second);
        assert!(prompt.contains("Confidence: high"));
    }

    #[test]
    fn validation_rejects_zero_step_and_empty_text() {
        assert!(step(0, Confidence::Low, true).validate().is_err());
        let mut blank = step(1, Confidence::Low, true);
        blank.step = "   ".into();
        assert!(blank.validate().is_err());
        let mut hot = step(1, Confidence::Low, true);
        hot.temperature = Some(3.5);
        assert!(hot.validate().is_err());
        assert!(step(1, Confidence::Low, true).validate().is_ok());
    }
}
