//! Step executor.
//!
//! Runs a single step against its target through the resilience guards:
//! backpressure admission for the target's compartment, the idempotency
//! record when the step has a key, the target's circuit breaker, and the
//! base retry tier around the invocation itself. Terminal failures are
//! classified before they are returned. The executor never touches run state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use stratus_abstraction::{AgentError, AgentInvoker, Clock, InvocationContext};
use stratus_resilience::{
    BackpressureLimiter, CircuitBreakerRegistry, GuardError, IdempotencyManager, Priority,
    RetryConfig, RetryPolicy,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::failure::{
    AttemptFailure, AttemptRecord, FailureClassification, FailureClassifier, PatternClassifier,
    StepError,
};

/// Default limit for a single agent invocation.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything the executor needs to run one attempt of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    /// Run the step belongs to.
    pub run_id: String,
    /// Step (or coordination branch) ID.
    pub step_id: String,
    /// Agent to invoke.
    pub target: String,
    /// Payload sent to the agent.
    pub payload: Value,
    /// Run variables visible to the agent.
    pub variables: HashMap<String, Value>,
    /// Idempotency key, if the step declares one.
    pub idempotency_key: Option<String>,
    /// Load shedding priority.
    pub priority: Priority,
    /// Escalated-tier attempt number, starting at 1.
    pub attempt: u32,
}

impl StepRequest {
    /// Creates a first-attempt request with no key and normal priority.
    pub fn new(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        target: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step_id: step_id.into(),
            target: target.into(),
            payload,
            variables: HashMap::new(),
            idempotency_key: None,
            priority: Priority::default(),
            attempt: 1,
        }
    }
}

/// A classified terminal failure of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    /// Classification of `error`.
    pub classification: FailureClassification,
    /// The error itself.
    pub error: StepError,
}

impl StepFailure {
    /// Serializable form for attempt and failure records.
    pub fn to_attempt_failure(&self) -> AttemptFailure {
        AttemptFailure { classification: self.classification, message: self.error.to_string() }
    }
}

/// Outcome of one attempt plus its record.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Agent output, or the classified failure.
    pub result: Result<Value, StepFailure>,
    /// Record of the attempt.
    pub attempt: AttemptRecord,
}

/// Tracks an execution in the in-flight counter while alive.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Executes steps against agents through the resilience guards.
pub struct StepExecutor {
    invoker: Arc<dyn AgentInvoker>,
    breakers: Arc<CircuitBreakerRegistry>,
    idempotency: Arc<IdempotencyManager>,
    backpressure: Option<Arc<BackpressureLimiter>>,
    classifier: Arc<dyn FailureClassifier>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    step_timeout: Duration,
    load_capacity: usize,
    in_flight: AtomicUsize,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("classifier", &self.classifier)
            .field("retry", self.retry.config())
            .field("step_timeout", &self.step_timeout)
            .field("backpressure", &self.backpressure.is_some())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl StepExecutor {
    /// Creates an executor with the pattern classifier, the base retry tier,
    /// the default invocation timeout, and no backpressure.
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        breakers: Arc<CircuitBreakerRegistry>,
        idempotency: Arc<IdempotencyManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            invoker,
            breakers,
            idempotency,
            backpressure: None,
            classifier: Arc::new(PatternClassifier::new()),
            retry: RetryPolicy::new(RetryConfig::base_tier(), Arc::clone(&clock)),
            clock,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            load_capacity: 64,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Replaces the failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replaces the base retry tier.
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config, Arc::clone(&self.clock));
        self
    }

    /// Admits every execution through `limiter` first.
    ///
    /// Load for shedding is the in-flight count over `load_capacity`.
    #[must_use]
    pub fn with_backpressure(mut self, limiter: Arc<BackpressureLimiter>, load_capacity: usize) -> Self {
        self.backpressure = Some(limiter);
        self.load_capacity = load_capacity.max(1);
        self
    }

    /// Sets the per-invocation timeout.
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// The failure classifier.
    pub fn classifier(&self) -> &Arc<dyn FailureClassifier> {
        &self.classifier
    }

    /// The circuit breaker registry.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// The idempotency manager.
    pub fn idempotency(&self) -> &Arc<IdempotencyManager> {
        &self.idempotency
    }

    /// The clock used for timestamps and backoff.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether the invoker knows `target`.
    pub fn has_target(&self, target: &str) -> bool {
        self.invoker.has_target(target)
    }

    /// Executions currently past admission.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn load(&self) -> f64 {
        self.in_flight() as f64 / self.load_capacity as f64
    }

    /// Runs one attempt of `request`.
    ///
    /// Never fails as a call; the report carries the classified outcome.
    pub async fn execute(&self, request: StepRequest, cancel: &CancellationToken) -> ExecutionReport {
        let started_at = self.clock.now();
        let invocations = AtomicU32::new(0);

        let result = self.run_guarded(&request, &invocations, cancel).await.map_err(|error| {
            let classification = self.classifier.classify(&error);
            StepFailure { classification, error }
        });

        if let Err(failure) = &result {
            warn!(
                run_id = %request.run_id,
                step_id = %request.step_id,
                target = %request.target,
                classification = %failure.classification,
                error = %failure.error,
                "Step attempt failed"
            );
        }

        let attempt = AttemptRecord {
            attempt: request.attempt,
            target: request.target.clone(),
            invocations: invocations.load(Ordering::SeqCst),
            started_at,
            finished_at: self.clock.now(),
            failure: result.as_ref().err().map(StepFailure::to_attempt_failure),
        };
        ExecutionReport { result, attempt }
    }

    async fn run_guarded(
        &self,
        request: &StepRequest,
        invocations: &AtomicU32,
        cancel: &CancellationToken,
    ) -> Result<Value, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let _permit = match &self.backpressure {
            Some(limiter) => {
                Some(limiter.admit(&request.target, request.priority, self.load(), cancel).await?)
            }
            None => None,
        };
        let _in_flight = InFlight::enter(&self.in_flight);

        match &request.idempotency_key {
            Some(key) => self
                .idempotency
                .ensure_once(key, || self.call_through_breaker(request, invocations, cancel))
                .await
                .map_err(flatten),
            None => self.call_through_breaker(request, invocations, cancel).await,
        }
    }

    async fn call_through_breaker(
        &self,
        request: &StepRequest,
        invocations: &AtomicU32,
        cancel: &CancellationToken,
    ) -> Result<Value, StepError> {
        let breaker = self.breakers.get(&request.target);
        breaker
            .call_filtered(
                || async {
                    self.retry
                        .execute(
                            |attempt| self.invoke_once(request, attempt, invocations, cancel),
                            |error: &StepError| self.classifier.classify(error).is_retryable(),
                            cancel,
                        )
                        .await
                        .into_result()
                },
                |error: &StepError| {
                    self.classifier.classify(error) == FailureClassification::Environmental
                },
            )
            .await
            .map_err(flatten)
    }

    async fn invoke_once(
        &self,
        request: &StepRequest,
        attempt: u32,
        invocations: &AtomicU32,
        cancel: &CancellationToken,
    ) -> Result<Value, StepError> {
        invocations.fetch_add(1, Ordering::SeqCst);
        let context = InvocationContext {
            run_id: request.run_id.clone(),
            step_id: request.step_id.clone(),
            attempt,
            variables: request.variables.clone(),
        };
        debug!(
            run_id = %request.run_id,
            step_id = %request.step_id,
            target = %request.target,
            attempt = attempt,
            "Invoking agent"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StepError::Cancelled),
            outcome = tokio::time::timeout(
                self.step_timeout,
                self.invoker.invoke(&request.target, &request.payload, &context),
            ) => match outcome {
                Ok(result) => result.map_err(StepError::from),
                Err(_) => Err(StepError::Agent(AgentError::Timeout(format!(
                    "'{}' did not answer within {}ms",
                    request.target,
                    self.step_timeout.as_millis()
                )))),
            },
        }
    }
}

fn flatten(error: GuardError<StepError>) -> StepError {
    match error {
        GuardError::Rejected(rejection) => StepError::Rejected(rejection),
        GuardError::Failed(error) => error,
    }
}
