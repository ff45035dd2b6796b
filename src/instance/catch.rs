//! Error catching and retry scheduling.
//!
//! When a node raises, the raising position walks up the tree; the first
//! enclosing Try whose catch accepts the error becomes the handler. A
//! handler either schedules a retry (the instance is parked in the retry
//! outbox and the try branch re-executes on redelivery), hands control to
//! its catch body, or — for a bare catch — swallows the error. An error
//! nothing accepts faults the instance.

use super::WorkflowInstance;
use crate::error::WorkflowError;
use crate::expressions::{self, Scope};
use crate::model::{BackoffKind, CatchDefinition, RetryPolicy, RetryPolicyOrRef};
use crate::position::JsonPointer;
use crate::tree::NodeKind;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// How a raised error was resolved.
#[derive(Debug)]
pub enum RaisedOutcome {
    /// A Try caught the error and computed a positive retry delay; the
    /// instance must be parked in the retry outbox.
    Retry {
        try_pos: JsonPointer,
        delay: Duration,
    },
    /// Execution continues at the given cursor (catch body entered, or the
    /// error was swallowed and flow moved on). `None` means the workflow
    /// completed while unwinding.
    Resume(Option<JsonPointer>),
    /// Nothing caught the error.
    Faulted(WorkflowError),
}

impl WorkflowInstance {
    /// Resolve a raised error against the enclosing Try chain.
    pub(crate) async fn handle_raised(
        &mut self,
        error: WorkflowError,
    ) -> Result<RaisedOutcome, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let origin = error
            .instance
            .clone()
            .unwrap_or_else(|| self.current.clone());
        let mut cursor = origin.clone();

        loop {
            let Some(try_pos) = enclosing_try(&workflow, &cursor) else {
                return Ok(RaisedOutcome::Faulted(error));
            };
            let node = workflow.tree.node(&try_pos).ok_or_else(|| {
                WorkflowError::runtime("Unknown try position").at(&try_pos)
            })?;
            let NodeKind::Try(try_task) = &node.kind else {
                return Err(WorkflowError::runtime("Enclosing node is not a Try").at(&try_pos));
            };

            // Only errors raised inside the try branch are catchable here;
            // an error escaping the catch body keeps propagating upward.
            let catchable = node
                .children
                .first()
                .is_some_and(|try_seq| origin.is_within(try_seq));
            let Some(catch) = try_task.catch.as_ref() else {
                cursor = try_pos;
                continue;
            };
            if !catchable || !catch_accepts(catch, &error) {
                cursor = try_pos;
                continue;
            }

            // Caught: bind the error and account the attempt.
            let error_name = catch.as_.clone().unwrap_or_else(|| "error".to_string());
            let state = self.state_mut(&try_pos);
            state.attempt_index += 1;
            let attempt = state.attempt_index;
            state.variables.insert(error_name, error.to_value());

            let policy = resolve_policy(&workflow.definition, catch, &try_pos)?;
            let delay = match policy.as_ref() {
                Some(policy) => retry_delay(policy, attempt, &error),
                None => None,
            };

            if let Some(delay) = delay.filter(|delay| !delay.is_zero()) {
                // Park for retry: the try branch re-executes on redelivery,
                // attempt accounting and the bound error survive on the Try.
                let try_seq = node.children.first().cloned().ok_or_else(|| {
                    WorkflowError::runtime("Try node has no branch").at(&try_pos)
                })?;
                self.reset_subtree(&try_seq);
                let state = self.state_mut(&try_pos);
                state.child_index = -1;
                state.raw_output = None;
                tracing::debug!(position = %try_pos, attempt, ?delay, "retry scheduled");
                return Ok(RaisedOutcome::Retry { try_pos, delay });
            }

            if let Some(catch_seq) = node.children.get(1).cloned() {
                let transformed = self.transformed_input(&try_pos)?;
                self.state_mut(&try_pos).child_index = 1;
                self.seed(&catch_seq, transformed);
                tracing::debug!(position = %try_pos, "error caught, entering catch body");
                return Ok(RaisedOutcome::Resume(Some(catch_seq)));
            }

            if policy.is_some() {
                // Retry policy exhausted and no catch body: not handled
                // here, keep unwinding.
                cursor = try_pos;
                continue;
            }

            // Bare catch: swallow the error, the Try completes with its
            // transformed input.
            let transformed = self.transformed_input(&try_pos)?;
            let output = self.complete(&try_pos, transformed).await?;
            let next = self.advance_after(try_pos, output).await?;
            return Ok(RaisedOutcome::Resume(next));
        }
    }
}

/// Nearest Try strictly above `pos`.
fn enclosing_try(
    workflow: &crate::definitions::CompiledWorkflow,
    pos: &JsonPointer,
) -> Option<JsonPointer> {
    let mut cursor = pos.parent();
    while let Some(candidate) = cursor {
        cursor = candidate.parent();
        if workflow
            .tree
            .node(&candidate)
            .is_some_and(|node| node.kind.is_try())
        {
            return Some(candidate);
        }
    }
    None
}

/// The catch decision: declared filter fields must match exactly, `when`
/// must hold and `exceptWhen` must not.
pub(crate) fn catch_accepts(catch: &CatchDefinition, error: &WorkflowError) -> bool {
    if let Some(with) = catch.errors.as_ref().and_then(|filter| filter.with.as_ref()) {
        if let Some(expected) = with.error_type.as_ref() {
            if expected != &error.error_type {
                return false;
            }
        }
        if let Some(expected) = with.status {
            if expected != error.status {
                return false;
            }
        }
        if let Some(expected) = with.instance.as_ref() {
            if Some(expected.as_str()) != error.instance.as_ref().map(JsonPointer::as_str) {
                return false;
            }
        }
        if let Some(expected) = with.title.as_ref() {
            if expected != &error.title {
                return false;
            }
        }
        if let Some(expected) = with.details.as_ref() {
            if Some(expected) != error.details.as_ref() {
                return false;
            }
        }
    }

    let scope = error_scope(catch.as_.as_deref(), error);
    if let Some(when) = catch.when.as_ref() {
        if !eval_gate(when, error, &scope) {
            return false;
        }
    }
    if let Some(except_when) = catch.except_when.as_ref() {
        if eval_gate(except_when, error, &scope) {
            return false;
        }
    }
    true
}

/// Evaluate a `when`/`exceptWhen` gate; an evaluation failure counts as not
/// matching rather than masking the original error.
fn eval_gate(expression: &str, error: &WorkflowError, scope: &Scope) -> bool {
    match expressions::evaluate_bool(expression, &error.to_value(), scope) {
        Ok(holds) => holds,
        Err(eval_error) => {
            tracing::warn!(expression, error = %eval_error, "catch gate evaluation failed");
            false
        }
    }
}

fn error_scope(error_name: Option<&str>, error: &WorkflowError) -> Scope {
    let mut scope = Scope::new();
    scope.insert(
        error_name.unwrap_or("error").to_string(),
        error.to_value(),
    );
    scope
}

/// Resolve an inline or named retry policy.
fn resolve_policy(
    definition: &crate::model::WorkflowDefinition,
    catch: &CatchDefinition,
    try_pos: &JsonPointer,
) -> Result<Option<RetryPolicy>, WorkflowError> {
    match catch.retry.as_ref() {
        None => Ok(None),
        Some(RetryPolicyOrRef::Policy(policy)) => Ok(Some(policy.clone())),
        Some(RetryPolicyOrRef::Reference(name)) => definition
            .use_
            .retries
            .get(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                WorkflowError::configuration("Unknown named retry policy")
                    .with_details(format!("'{name}' is not declared in use.retries"))
                    .at(try_pos)
            }),
    }
}

/// Compute the delay before attempt `attempt + 1`, or `None` when the
/// policy does not grant another attempt.
///
/// `attempt` counts failures so far (1-based). With `limit.attempt.count`
/// set to N the guarded branch runs at most N times; backoff grows with the
/// failure count (linear: `base × n`, exponential: `baseSeconds ^ n`).
pub(crate) fn retry_delay(
    policy: &RetryPolicy,
    attempt: u32,
    error: &WorkflowError,
) -> Option<Duration> {
    if let Some(count) = policy.limit.as_ref().and_then(|l| l.attempt.as_ref()).and_then(|a| a.count)
    {
        if attempt >= count {
            return None;
        }
    }

    let scope = error_scope(None, error);
    if let Some(when) = policy.when.as_ref() {
        if !eval_gate(when, error, &scope) {
            return None;
        }
    }
    if let Some(except_when) = policy.except_when.as_ref() {
        if eval_gate(except_when, error, &scope) {
            return None;
        }
    }

    let base = policy
        .delay
        .as_ref()
        .and_then(|delay| delay.to_duration().ok())
        .unwrap_or(Duration::ZERO);
    let kind = policy
        .backoff
        .as_ref()
        .map(crate::model::BackoffDefinition::kind)
        .unwrap_or_default();
    let scaled = match kind {
        BackoffKind::Constant => base,
        BackoffKind::Linear => base.saturating_mul(attempt),
        BackoffKind::Exponential => {
            Duration::from_secs_f64(base.as_secs_f64().powi(attempt as i32))
        }
    };

    let jittered = match policy.jitter.as_ref() {
        Some(jitter) => {
            let from = jitter.from.to_duration().ok()?.as_secs_f64();
            let to = jitter.to.to_duration().ok()?.as_secs_f64();
            let (low, high) = if from <= to { (from, to) } else { (to, from) };
            let extra = if (high - low).abs() < f64::EPSILON {
                low
            } else {
                rand::thread_rng().gen_range(low..=high)
            };
            scaled + Duration::from_secs_f64(extra)
        }
        None => scaled,
    };

    if jittered.is_zero() {
        None
    } else {
        Some(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{
        AttemptLimit, DurationFields, DurationSpec, ErrorFilter, ErrorFilterWith,
        JitterDefinition, RetryLimit,
    };

    fn communication_error() -> WorkflowError {
        WorkflowError::communication("HTTP 503")
            .with_status(503)
            .at(&JsonPointer::from("/do/0/fetch"))
    }

    fn policy(yaml: &str) -> RetryPolicy {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_filter_type_must_match_exactly() {
        let catch = CatchDefinition {
            errors: Some(ErrorFilter {
                with: Some(ErrorFilterWith {
                    error_type: Some(ErrorKind::Communication.uri()),
                    ..ErrorFilterWith::default()
                }),
            }),
            ..CatchDefinition::default()
        };
        assert!(catch_accepts(&catch, &communication_error()));
        assert!(!catch_accepts(&catch, &WorkflowError::validation("bad")));
    }

    #[test]
    fn test_filter_all_present_fields_must_match() {
        let catch = CatchDefinition {
            errors: Some(ErrorFilter {
                with: Some(ErrorFilterWith {
                    error_type: Some(ErrorKind::Communication.uri()),
                    status: Some(500),
                    ..ErrorFilterWith::default()
                }),
            }),
            ..CatchDefinition::default()
        };
        // Type matches but status does not.
        assert!(!catch_accepts(&catch, &communication_error()));
    }

    #[test]
    fn test_empty_catch_accepts_everything() {
        let catch = CatchDefinition::default();
        assert!(catch_accepts(&catch, &communication_error()));
        assert!(catch_accepts(&catch, &WorkflowError::runtime("boom")));
    }

    #[test]
    fn test_when_gate_binds_error() {
        let catch = CatchDefinition {
            when: Some("$error.status == 503".to_string()),
            ..CatchDefinition::default()
        };
        assert!(catch_accepts(&catch, &communication_error()));

        let catch = CatchDefinition {
            when: Some("$error.status == 404".to_string()),
            ..CatchDefinition::default()
        };
        assert!(!catch_accepts(&catch, &communication_error()));
    }

    #[test]
    fn test_except_when_gate() {
        let catch = CatchDefinition {
            except_when: Some(".status == 503".to_string()),
            ..CatchDefinition::default()
        };
        assert!(!catch_accepts(&catch, &communication_error()));
    }

    #[test]
    fn test_attempt_limit_bounds_retries() {
        let policy = policy("{delay: {seconds: 1}, limit: {attempt: {count: 3}}}");
        assert!(retry_delay(&policy, 1, &communication_error()).is_some());
        assert!(retry_delay(&policy, 2, &communication_error()).is_some());
        assert!(retry_delay(&policy, 3, &communication_error()).is_none());
    }

    #[test]
    fn test_constant_backoff() {
        let policy = policy("{delay: {seconds: 2}, backoff: {constant: {}}}");
        assert_eq!(
            retry_delay(&policy, 5, &communication_error()).unwrap(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_linear_backoff() {
        let policy = policy("{delay: {seconds: 2}, backoff: {linear: {}}}");
        assert_eq!(
            retry_delay(&policy, 1, &communication_error()).unwrap(),
            Duration::from_secs(2)
        );
        assert_eq!(
            retry_delay(&policy, 3, &communication_error()).unwrap(),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = policy("{delay: {seconds: 2}, backoff: {exponential: {}}}");
        assert_eq!(
            retry_delay(&policy, 1, &communication_error()).unwrap(),
            Duration::from_secs(2)
        );
        assert_eq!(
            retry_delay(&policy, 2, &communication_error()).unwrap(),
            Duration::from_secs(4)
        );
        assert_eq!(
            retry_delay(&policy, 3, &communication_error()).unwrap(),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            delay: Some(DurationSpec::from_seconds(1)),
            jitter: Some(JitterDefinition {
                from: DurationSpec::Inline(DurationFields {
                    milliseconds: Some(100.0),
                    ..DurationFields::default()
                }),
                to: DurationSpec::Inline(DurationFields {
                    milliseconds: Some(500.0),
                    ..DurationFields::default()
                }),
            }),
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = retry_delay(&policy, 1, &communication_error()).unwrap();
            assert!(delay >= Duration::from_millis(1100), "{delay:?}");
            assert!(delay <= Duration::from_millis(1500), "{delay:?}");
        }
    }

    #[test]
    fn test_zero_delay_means_no_retry() {
        let policy = RetryPolicy {
            limit: Some(RetryLimit {
                attempt: Some(AttemptLimit {
                    count: Some(5),
                    duration: None,
                }),
                duration: None,
            }),
            ..RetryPolicy::default()
        };
        assert!(retry_delay(&policy, 1, &communication_error()).is_none());
    }

    #[test]
    fn test_policy_when_gate() {
        let policy1 = policy("{delay: {seconds: 1}, when: '$error.status == 503'}");
        assert!(retry_delay(&policy1, 1, &communication_error()).is_some());
        let policy2 = policy("{delay: {seconds: 1}, when: '$error.status == 404'}");
        assert!(retry_delay(&policy2, 1, &communication_error()).is_none());
    }
}
