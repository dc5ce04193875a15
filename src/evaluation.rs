use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::create_timestamp;
use crate::language::UnsupportedLanguage;
use crate::sandbox::{ExecutionConstraint, ExecutionEngine, ExecutionOutcome, SandboxError};
use crate::submission::Submission;

/// Longest slice of program output written to the log
const OUTPUT_PREVIEW_BYTES: usize = 4096;

/// Decides which constraint applies to a submission
///
/// Problems listed in `overrides` get their own limits; everything else runs
/// under `default`.
#[derive(Debug, Clone)]
pub struct LimitPolicy {
    default: ExecutionConstraint,
    overrides: HashMap<String, ExecutionConstraint>,
}

impl LimitPolicy {
    pub fn new(default: ExecutionConstraint) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_problem(mut self, problem_id: impl Into<String>, constraint: ExecutionConstraint) -> Self {
        self.overrides.insert(problem_id.into(), constraint);
        self
    }

    pub fn constraint_for(&self, submission: &Submission) -> &ExecutionConstraint {
        self.overrides
            .get(&submission.problem_id)
            .unwrap_or(&self.default)
    }
}

/// Definitive result of one submission
#[derive(Debug)]
pub struct EvaluationResult {
    pub submission_id: String,
    pub problem_id: String,
    /// Never [`ExecutionOutcome::Failed`]; those become [`EvaluationError`]
    pub outcome: ExecutionOutcome,
    pub elapsed: Duration,
    pub finished_at: String,
}

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error(transparent)]
    UnsupportedLanguage(#[from] UnsupportedLanguage),
    #[error("evaluation of submission {submission_id} failed: {cause}")]
    Execution {
        submission_id: String,
        #[source]
        cause: SandboxError,
    },
}

impl EvaluationError {
    /// Whether running the same submission again could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, EvaluationError::Execution { .. })
    }
}

pub struct EvaluationService {
    engine: ExecutionEngine,
    limits: LimitPolicy,
}

impl EvaluationService {
    pub fn new(engine: ExecutionEngine, limits: LimitPolicy) -> Self {
        Self { engine, limits }
    }

    pub async fn evaluate(&self, submission: &Submission) -> Result<EvaluationResult, EvaluationError> {
        let constraint = self.limits.constraint_for(submission);
        log::debug!(
            "Evaluating submission {} with {:?}",
            submission.id,
            constraint
        );

        let start_time = Instant::now();
        let outcome = self
            .engine
            .run(submission.language, &submission.code, constraint)
            .await
            .inspect_err(|e| {
                log::warn!(
                    target: "evaluation",
                    "submission={} problem={} language={} rejected: {e}",
                    submission.id,
                    submission.problem_id,
                    submission.language
                )
            })?;
        let elapsed = start_time.elapsed();

        let outcome = match outcome {
            ExecutionOutcome::Failed { error } => {
                log::error!(
                    target: "evaluation",
                    "submission={} problem={} language={} verdict=System Error: {error}",
                    submission.id,
                    submission.problem_id,
                    submission.language
                );
                return Err(EvaluationError::Execution {
                    submission_id: submission.id.clone(),
                    cause: error,
                });
            }
            outcome => outcome,
        };

        log_outcome(submission, &outcome, elapsed);

        Ok(EvaluationResult {
            submission_id: submission.id.clone(),
            problem_id: submission.problem_id.clone(),
            outcome,
            elapsed,
            finished_at: create_timestamp(),
        })
    }
}

fn log_outcome(submission: &Submission, outcome: &ExecutionOutcome, elapsed: Duration) {
    let exit_code = match outcome {
        ExecutionOutcome::Completed { exit_code, .. } => exit_code.to_string(),
        _ => "-".to_string(),
    };
    log::info!(
        target: "evaluation",
        "submission={} problem={} language={} verdict={} exit_code={} elapsed_ms={}",
        submission.id,
        submission.problem_id,
        submission.language,
        outcome.verdict(),
        exit_code,
        elapsed.as_millis()
    );

    if let ExecutionOutcome::Completed { output, .. } = outcome {
        let preview = &output[..output.len().min(OUTPUT_PREVIEW_BYTES)];
        log::debug!(
            target: "evaluation",
            "submission={} output={:?}",
            submission.id,
            String::from_utf8_lossy(preview)
        );
    }
}
