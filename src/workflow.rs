//! Workflow documents.
//!
//! A document is an ordered list of jobs, each an ordered list of shell steps.
//! Documents are immutable once loaded; the runner and the fleet orchestrator
//! only ever borrow them.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use void::Void;

use crate::error::{Result, StormError};
use crate::serde::Shorthand;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub name: String,
    /// Default working directory for every step. Defaults to the process's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    /// Descriptive only. Never used to pick where the job runs.
    #[serde(rename = "runs-on", default)]
    pub runs_on: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs: Option<String>,
    #[serde(default, deserialize_with = "deserialize_steps")]
    pub steps: Vec<Step>,
}

impl Job {
    /// The job this one depends on. An empty `needs` counts as none.
    pub fn dependency(&self) -> Option<&str> {
        self.needs.as_deref().filter(|needs| !needs.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Deadline for the step, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Step {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    /// Name shown in step headers. Falls back to the command itself.
    pub fn label(&self) -> &str {
        match &self.name {
            Some(name) if !name.is_empty() => name,
            _ => &self.run,
        }
    }
}

impl FromStr for Step {
    type Err = Void;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self {
            name: None,
            run: s.to_string(),
            directory: None,
            timeout: None,
        })
    }
}

fn deserialize_steps<'de, D>(deserializer: D) -> std::result::Result<Vec<Step>, D::Error>
where
    D: Deserializer<'de>,
{
    let steps = Vec::<Shorthand<Step>>::deserialize(deserializer)?;
    Ok(steps.into_iter().map(|Shorthand(step)| step).collect())
}

impl WorkflowDocument {
    /// Reads and validates a workflow file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| StormError::config(path, e))?;
        Self::parse(&text).map_err(|reason| StormError::config(path, reason))
    }

    /// Parses and validates a workflow from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Self::parse(text).map_err(|reason| StormError::config("<inline workflow>", reason))
    }

    /// The wire form uploaded to remote hosts.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| StormError::config(format!("<workflow '{}'>", self.name), e))
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        let document: Self = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
        document.validate()?;
        Ok(document)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::with_capacity(self.jobs.len());
        for (i, job) in self.jobs.iter().enumerate() {
            if job.name.is_empty() {
                return Err(format!("Job {} has no name", i));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(format!("Job name '{}' is used more than once", job.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
name: build
directory: /srv/app
jobs:
  - name: test
    runs-on: ubuntu
    steps:
      - name: Unit tests
        run: make test
        directory: backend
        timeout: 600
      - echo done
  - name: deploy
    runs-on: ubuntu
    needs: test
    steps:
      - run: ./deploy.sh && echo ok
"#;

    #[test]
    fn test_parse_document() {
        let doc = WorkflowDocument::from_yaml(DOCUMENT).unwrap();
        assert_eq!(doc.name, "build");
        assert_eq!(doc.directory.as_deref(), Some("/srv/app"));
        assert_eq!(doc.jobs.len(), 2);

        let test = &doc.jobs[0];
        assert_eq!(test.runs_on, "ubuntu");
        assert_eq!(test.dependency(), None);
        assert_eq!(test.steps[0].label(), "Unit tests");
        assert_eq!(test.steps[0].directory.as_deref(), Some("backend"));
        assert_eq!(test.steps[0].timeout(), Some(Duration::from_secs(600)));

        assert_eq!(doc.jobs[1].dependency(), Some("test"));
        assert_eq!(doc.jobs[1].steps[0].run, "./deploy.sh && echo ok");
    }

    #[test]
    fn test_bare_string_step() {
        let doc = WorkflowDocument::from_yaml(DOCUMENT).unwrap();
        let step = &doc.jobs[0].steps[1];
        assert_eq!(step.run, "echo done");
        assert_eq!(step.name, None);
        assert_eq!(step.label(), "echo done");
    }

    #[test]
    fn test_round_trip() {
        let doc = WorkflowDocument::from_yaml(DOCUMENT).unwrap();
        let reloaded = WorkflowDocument::from_yaml(&doc.to_yaml().unwrap()).unwrap();
        assert_eq!(doc, reloaded);
    }

    #[test]
    fn test_empty_needs_is_no_dependency() {
        let doc = WorkflowDocument::from_yaml(
            "name: x\njobs:\n  - name: a\n    needs: ''\n    steps: [echo a]\n",
        )
        .unwrap();
        assert_eq!(doc.jobs[0].dependency(), None);
        assert_eq!(doc.directory, None);
    }

    #[test]
    fn test_duplicate_job_names_rejected() {
        let err = WorkflowDocument::from_yaml(
            "name: x\njobs:\n  - name: a\n    steps: []\n  - name: a\n    steps: []\n",
        )
        .unwrap_err();
        assert!(matches!(err, StormError::Config { .. }));
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = WorkflowDocument::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, StormError::Config { .. }));
    }
}
