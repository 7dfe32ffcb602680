//! Failure detection and classification.
//!
//! Every terminal step failure is classified before it is recorded:
//! Environmental failures (the dependency blipped or is down) may be retried,
//! Logic failures (the request itself is wrong) never are. Anything the
//! classifier cannot place is Unknown, which callers treat like Logic.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratus_abstraction::AgentError;
use stratus_resilience::ResilienceError;
use thiserror::Error;

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClassification {
    /// The request is wrong; retrying cannot help.
    Logic,
    /// The environment failed (timeouts, outages, throttling); retrying may help.
    Environmental,
    /// No rule matched.
    Unknown,
}

impl FailureClassification {
    /// Only environmental failures are retried. Unknown fails closed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Environmental)
    }
}

impl fmt::Display for FailureClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logic => write!(f, "logic"),
            Self::Environmental => write!(f, "environmental"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Why a single step execution failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// The agent returned an error.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// A resilience guard refused the call.
    #[error(transparent)]
    Rejected(#[from] ResilienceError),

    /// The run was cancelled while the step was in flight.
    #[error("Step cancelled")]
    Cancelled,
}

/// Decides how a step failure is classified.
pub trait FailureClassifier: Send + Sync + fmt::Debug {
    /// Classifies `error`.
    fn classify(&self, error: &StepError) -> FailureClassification;
}

type Rule = Arc<dyn Fn(&StepError) -> Option<FailureClassification> + Send + Sync>;

const ENVIRONMENTAL_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "unavailable",
    "temporary",
    "retry",
    "rate limit",
    "quota",
    "throttle",
    "503",
    "502",
    "504",
];

const LOGIC_KEYWORDS: &[&str] = &[
    "validation",
    "invalid",
    "malformed",
    "not found",
    "missing",
    "syntax error",
    "parse error",
    "type error",
    "not implemented",
    "unsupported",
    "permission",
    "forbidden",
    "unauthorized",
    "401",
    "403",
    "404",
    "400",
];

/// Pattern and predicate based classifier.
///
/// Explicit rules are consulted first, in the order they were added. Typed
/// errors are classified next, then the error message is matched against
/// keyword lists.
#[derive(Clone, Default)]
pub struct PatternClassifier {
    rules: Vec<Rule>,
}

impl fmt::Debug for PatternClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternClassifier").field("rules", &self.rules.len()).finish()
    }
}

impl PatternClassifier {
    /// Creates a classifier with only the built-in keyword lists.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies any error whose message contains `pattern` (case-insensitive).
    #[must_use]
    pub fn with_pattern(
        mut self,
        pattern: impl Into<String>,
        classification: FailureClassification,
    ) -> Self {
        let pattern = pattern.into().to_lowercase();
        self.rules.push(Arc::new(move |error: &StepError| {
            error.to_string().to_lowercase().contains(&pattern).then_some(classification)
        }));
        self
    }

    /// Adds a predicate rule; returning `Some` decides the classification.
    #[must_use]
    pub fn with_rule(
        mut self,
        rule: impl Fn(&StepError) -> Option<FailureClassification> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    /// Classifies a bare error message by keyword.
    ///
    /// Logic keywords are checked before environmental ones.
    pub fn classify_message(message: &str) -> FailureClassification {
        let lower = message.to_lowercase();
        if LOGIC_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
            FailureClassification::Logic
        } else if ENVIRONMENTAL_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
            FailureClassification::Environmental
        } else {
            FailureClassification::Unknown
        }
    }
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, error: &StepError) -> FailureClassification {
        if let Some(classification) = self.rules.iter().find_map(|rule| rule(error)) {
            return classification;
        }

        match error {
            StepError::Rejected(ResilienceError::Cancelled) | StepError::Cancelled => {
                FailureClassification::Logic
            }
            StepError::Rejected(ResilienceError::Serialization(_)) => FailureClassification::Logic,
            StepError::Rejected(_) => FailureClassification::Environmental,
            StepError::Agent(
                AgentError::Timeout(_) | AgentError::Unavailable(_) | AgentError::Throttled(_),
            ) => FailureClassification::Environmental,
            StepError::Agent(
                AgentError::InvalidInput(_)
                | AgentError::PermissionDenied(_)
                | AgentError::UnknownTarget(_)
                | AgentError::Cancelled,
            ) => FailureClassification::Logic,
            StepError::Agent(AgentError::Other(message)) => Self::classify_message(message),
        }
    }
}

/// A classified failure of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// Failure classification.
    pub classification: FailureClassification,
    /// Error message.
    pub message: String,
}

/// One pass of a step through the executor.
///
/// `invocations` counts the agent calls made by the base retry tier inside
/// this attempt; it is zero when a guard rejected the attempt or an
/// idempotency record answered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Escalated-tier attempt number, starting at 1.
    pub attempt: u32,
    /// Agent the attempt targeted.
    pub target: String,
    /// Agent calls made during the attempt.
    pub invocations: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub finished_at: DateTime<Utc>,
    /// Set when the attempt failed.
    pub failure: Option<AttemptFailure>,
}

impl AttemptRecord {
    /// Returns true if the attempt succeeded.
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Terminal failure of a step, with everything needed to reconstruct why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Failed step.
    pub step_id: String,
    /// Classification of the final failure.
    pub classification: FailureClassification,
    /// Message of the final failure.
    pub message: String,
    /// Attempts made before giving up.
    pub attempt_count: u32,
    /// When the last attempt finished.
    pub last_attempt_at: DateTime<Utc>,
    /// Every attempt, oldest first.
    pub attempts: Vec<AttemptRecord>,
}

impl FailureRecord {
    /// Builds a record from the attempt history and the final failure.
    pub fn new(
        step_id: impl Into<String>,
        failure: AttemptFailure,
        attempts: Vec<AttemptRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        let last_attempt_at = attempts.last().map_or(now, |a| a.finished_at);
        Self {
            step_id: step_id.into(),
            classification: failure.classification,
            message: failure.message,
            attempt_count: attempts.len() as u32,
            last_attempt_at,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_agent_errors() {
        let classifier = PatternClassifier::new();
        assert_eq!(
            classifier.classify(&AgentError::Timeout("30s".into()).into()),
            FailureClassification::Environmental
        );
        assert_eq!(
            classifier.classify(&AgentError::InvalidInput("no body".into()).into()),
            FailureClassification::Logic
        );
        assert_eq!(
            classifier.classify(&AgentError::PermissionDenied("scope".into()).into()),
            FailureClassification::Logic
        );
    }

    #[test]
    fn test_guard_rejections_are_environmental() {
        let classifier = PatternClassifier::new();
        let open = StepError::Rejected(ResilienceError::CircuitOpen { dependency: "db".into() });
        assert_eq!(classifier.classify(&open), FailureClassification::Environmental);
        assert_eq!(classifier.classify(&StepError::Cancelled), FailureClassification::Logic);
    }

    #[test]
    fn test_message_keywords() {
        let classifier = PatternClassifier::new();
        let classify =
            |msg: &str| classifier.classify(&StepError::Agent(AgentError::Other(msg.into())));

        assert_eq!(classify("Network connection refused"), FailureClassification::Environmental);
        assert_eq!(classify("upstream returned 503"), FailureClassification::Environmental);
        assert_eq!(classify("Validation failed: malformed json"), FailureClassification::Logic);
        assert_eq!(classify("the model hallucinated"), FailureClassification::Unknown);
        assert!(!FailureClassification::Unknown.is_retryable());
    }

    #[test]
    fn test_logic_keywords_win_over_environmental() {
        assert_eq!(
            PatternClassifier::classify_message("invalid retry configuration"),
            FailureClassification::Logic
        );
        assert_eq!(
            PatternClassifier::classify_message("connection rejected: forbidden"),
            FailureClassification::Logic
        );
        assert_eq!(
            PatternClassifier::classify_message("connection reset, retry later"),
            FailureClassification::Environmental
        );
    }

    #[test]
    fn test_explicit_rules_win() {
        let classifier = PatternClassifier::new()
            .with_pattern("hallucinated", FailureClassification::Environmental)
            .with_rule(|error| {
                matches!(error, StepError::Agent(AgentError::Throttled(_)))
                    .then_some(FailureClassification::Logic)
            });

        let other = StepError::Agent(AgentError::Other("model HALLUCINATED".into()));
        assert_eq!(classifier.classify(&other), FailureClassification::Environmental);
        let throttled = StepError::Agent(AgentError::Throttled("slow down".into()));
        assert_eq!(classifier.classify(&throttled), FailureClassification::Logic);
    }

    #[test]
    fn test_failure_record_summarises_attempts() {
        let now = Utc::now();
        let attempt = |n: u32| AttemptRecord {
            attempt: n,
            target: "agent".into(),
            invocations: 2,
            started_at: now,
            finished_at: now + chrono::Duration::seconds(i64::from(n)),
            failure: Some(AttemptFailure {
                classification: FailureClassification::Environmental,
                message: "timeout".into(),
            }),
        };

        let record = FailureRecord::new(
            "fetch",
            AttemptFailure {
                classification: FailureClassification::Environmental,
                message: "timeout".into(),
            },
            vec![attempt(1), attempt(2)],
            now,
        );
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.last_attempt_at, now + chrono::Duration::seconds(2));
    }
}
