//! Local workflow execution.
//!
//! Jobs run strictly in document order. A job's `needs` is a gate checked
//! against the results collected so far, not a scheduling hint: a dependency
//! that appears later in the document has no result yet, so the gate fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use crate::error::StormError;
use crate::executor::CommandExecutor;
use crate::sink::OutputSink;
use crate::workflow::{Job, WorkflowDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobResult {
    /// Every step was attempted until the job succeeded or one step failed.
    pub completed: bool,
    pub success: bool,
}

impl JobResult {
    pub const NOT_RUN: JobResult = JobResult {
        completed: false,
        success: false,
    };
    pub const FAILED: JobResult = JobResult {
        completed: true,
        success: false,
    };
    pub const SUCCEEDED: JobResult = JobResult {
        completed: true,
        success: true,
    };

    pub fn succeeded(&self) -> bool {
        self.completed && self.success
    }
}

/// Results of a single document run, keyed by job name.
///
/// Created by `JobRunner::run_document` and owned by its caller. Never shared
/// between runs.
#[derive(Debug, Default)]
pub struct JobResults {
    results: HashMap<String, JobResult>,
    order: Vec<String>,
}

impl JobResults {
    fn record(&mut self, job: &str, result: JobResult) {
        if self.results.insert(job.to_string(), result).is_none() {
            self.order.push(job.to_string());
        }
    }

    pub fn get(&self, job: &str) -> Option<JobResult> {
        self.results.get(job).copied()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(JobResult::succeeded)
    }

    /// Names of jobs that did not succeed, in document order.
    pub fn failed_jobs(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, result)| !result.succeeded())
            .map(|(name, _)| name)
            .collect()
    }

    /// Results in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, JobResult)> + '_ {
        self.order
            .iter()
            .map(move |name| (name.as_str(), self.results[name]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct JobRunner<'a> {
    executor: CommandExecutor,
    sink: &'a dyn OutputSink,
}

impl<'a> JobRunner<'a> {
    pub fn new(executor: CommandExecutor, sink: &'a dyn OutputSink) -> Self {
        Self { executor, sink }
    }

    pub async fn run_document(&self, document: &WorkflowDocument) -> JobResults {
        let base = PathBuf::from(document.directory.as_deref().unwrap_or("."));
        let mut results = JobResults::default();

        for job in &document.jobs {
            let started = Instant::now();
            println!("[{}]", job.name);

            let result = match job.dependency() {
                Some(needs) if !results.get(needs).is_some_and(|r| r.succeeded()) => {
                    let err = StormError::Dependency {
                        job: job.name.clone(),
                        needs: needs.to_string(),
                    };
                    eprintln!("[Storm] {}. Skipping its steps.", err);
                    warn!(job = %job.name, needs, "dependency not satisfied");
                    JobResult::NOT_RUN
                }
                _ => self.run_job(&base, job).await,
            };

            let elapsed = started.elapsed();
            println!("Took {:.2}s to run.\n", elapsed.as_secs_f64());
            info!(
                job = %job.name,
                completed = result.completed,
                success = result.success,
                elapsed_ms = elapsed.as_millis() as u64,
                "job finished"
            );
            results.record(&job.name, result);
        }

        results
    }

    async fn run_job(&self, base: &Path, job: &Job) -> JobResult {
        for (i, step) in job.steps.iter().enumerate() {
            println!("-> {}", step.label());
            println!("$ {}", step.run);

            let directory = match step.directory.as_deref() {
                Some(directory) if !directory.is_empty() => base.join(directory),
                _ => base.to_path_buf(),
            };
            let executor = match step.timeout() {
                Some(timeout) => self.executor.clone().with_timeout(Some(timeout)),
                None => self.executor.clone(),
            };

            if let Err(err) = executor.execute(&directory, &step.run, self.sink).await {
                eprintln!(
                    "[Storm] Job '{}' failed at step {} ({}): {}",
                    job.name,
                    i + 1,
                    step.label(),
                    err
                );
                return JobResult::FAILED;
            }
        }
        JobResult::SUCCEEDED
    }
}
