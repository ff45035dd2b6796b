//! The workflow instance: a node-state overlay over a compiled tree and the
//! drive loop that advances it from one activity boundary to the next.
//!
//! An instance lives for exactly one broker message. It is rebuilt from the
//! envelope, driven until it either needs external I/O to finish (an
//! activity just ran → emit the next message), must sleep (wait/retry → a
//! delayed outbox row), or reaches a terminal status. There is no long-lived
//! in-memory workflow process.

use crate::activities::ActivityRunners;
use crate::definitions::CompiledWorkflow;
use crate::error::WorkflowError;
use crate::position::JsonPointer;
use crate::schema::SchemaRegistry;
use crate::state::{Envelope, NodeState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

mod catch;
mod node;

pub use catch::RaisedOutcome;

/// Transient, in-process status of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Faulted,
    Cancelled,
}

/// Where one drive step ended and what the consumer must do about it.
#[derive(Debug)]
pub enum StepOutcome {
    /// An activity completed; publish the next message.
    Continue(Envelope),
    /// A Wait executed; persist the envelope to the wait outbox.
    Wait(Envelope, Duration),
    /// A caught error scheduled a retry; persist to the retry outbox.
    Retry(Envelope, Duration),
    /// The workflow completed; the value is the transformed workflow output.
    Completed(Option<serde_json::Value>),
    /// Uncaught error; archive the envelope as a FAILED retry row.
    Faulted(Envelope, WorkflowError),
}

/// One in-flight workflow instance.
pub struct WorkflowInstance {
    pub(crate) workflow: Arc<CompiledWorkflow>,
    pub(crate) secrets: serde_json::Map<String, serde_json::Value>,
    pub(crate) states: HashMap<JsonPointer, NodeState>,
    pub(crate) current: JsonPointer,
    pub status: WorkflowStatus,
    pub(crate) runners: Arc<ActivityRunners>,
    pub(crate) schemas: Arc<SchemaRegistry>,
    /// Directive chosen by a Switch, consumed when its node advances.
    pub(crate) pending_directive: Option<(JsonPointer, crate::model::FlowDirective)>,
    pub(crate) wait_delay: Option<Duration>,
}

impl std::fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("workflow", &self.workflow.definition.document.name)
            .field("current", &self.current)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl WorkflowInstance {
    #[must_use]
    pub fn from_envelope(
        workflow: Arc<CompiledWorkflow>,
        envelope: Envelope,
        secrets: serde_json::Map<String, serde_json::Value>,
        runners: Arc<ActivityRunners>,
        schemas: Arc<SchemaRegistry>,
    ) -> Self {
        Self {
            workflow,
            secrets,
            states: envelope.states.into_iter().collect(),
            current: envelope.position,
            status: WorkflowStatus::Pending,
            runners,
            schemas,
            pending_directive: None,
            wait_delay: None,
        }
    }

    /// Snapshot the instance back into its wire form.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            name: self.workflow.definition.document.name.clone(),
            version: self.workflow.definition.document.version.clone(),
            states: self
                .states
                .iter()
                .filter(|(_, state)| !state.is_default())
                .map(|(position, state)| (position.clone(), state.clone()))
                .collect(),
            position: self.current.clone(),
        }
    }

    /// The transformed workflow output, available once the root completed.
    #[must_use]
    pub fn final_output(&self) -> Option<serde_json::Value> {
        self.states
            .get(&JsonPointer::root())
            .and_then(|state| state.raw_output.clone())
    }

    /// Advance until the next blocking point and report how the step ended.
    pub async fn drive(&mut self) -> StepOutcome {
        self.status = WorkflowStatus::Running;
        let mut cursor_override: Option<Option<JsonPointer>> = None;

        loop {
            let stepped = match cursor_override.take() {
                Some(cursor) => self.run_loop(cursor).await,
                None => self.try_run().await,
            };

            let raised = match stepped {
                Ok(None) => {
                    self.status = WorkflowStatus::Completed;
                    return StepOutcome::Completed(self.final_output());
                }
                Ok(Some(activity_pos)) => match self.execute_activity(&activity_pos).await {
                    Ok(()) => {
                        self.current = activity_pos;
                        if self.status == WorkflowStatus::Waiting {
                            let delay = self.wait_delay.take().unwrap_or_default();
                            return StepOutcome::Wait(self.to_envelope(), delay);
                        }
                        return StepOutcome::Continue(self.to_envelope());
                    }
                    Err(raised) => raised,
                },
                Err(raised) => raised,
            };

            match self.handle_raised(raised).await {
                Ok(RaisedOutcome::Retry { try_pos, delay }) => {
                    self.current = try_pos;
                    return StepOutcome::Retry(self.to_envelope(), delay);
                }
                Ok(RaisedOutcome::Resume(cursor)) => {
                    cursor_override = Some(cursor);
                }
                Ok(RaisedOutcome::Faulted(error)) => return self.fault(error),
                Err(error) => return self.fault(error),
            }
        }
    }

    fn fault(&mut self, error: WorkflowError) -> StepOutcome {
        self.status = WorkflowStatus::Faulted;
        if let Some(instance) = &error.instance {
            self.current = instance.clone();
        }
        tracing::warn!(
            workflow = %self.workflow.definition.document.name,
            position = %self.current,
            error = %error,
            "workflow faulted"
        );
        StepOutcome::Faulted(self.to_envelope(), error)
    }

    /// One pass of the §4.7 loop: pick up at `current`, run flow nodes until
    /// an activity boundary (`Some(position)`) or completion (`None`).
    pub(crate) async fn try_run(&mut self) -> Result<Option<JsonPointer>, WorkflowError> {
        let current = self.current.clone();
        let workflow = Arc::clone(&self.workflow);
        let node = workflow.tree.node(&current).ok_or_else(|| {
            WorkflowError::runtime("Unknown position")
                .with_details(format!("'{current}' is not a node of this workflow"))
                .at(&current)
        })?;

        // A root with output is a completed instance; re-driving a terminal
        // snapshot produces nothing.
        if current.is_root()
            && self
                .states
                .get(&current)
                .is_some_and(|state| state.raw_output.is_some())
        {
            return Ok(None);
        }

        // A node with output already produced was the previous step's
        // boundary: advance past it. A Try is kept so a scheduled retry
        // re-enters its branch.
        let keep = node.kind.is_try()
            || self
                .states
                .get(&current)
                .is_none_or(|state| state.raw_output.is_none());

        let cursor = if keep {
            Some(current)
        } else {
            let output = self.node_output(&current)?;
            self.advance_after(current, output).await?
        };
        self.run_loop(cursor).await
    }

    pub(crate) async fn run_loop(
        &mut self,
        mut cursor: Option<JsonPointer>,
    ) -> Result<Option<JsonPointer>, WorkflowError> {
        while let Some(pos) = cursor {
            if self.should_start(&pos)? {
                if self.is_activity_at(&pos)? {
                    return Ok(Some(pos));
                }
                cursor = self.enter_flow(&pos).await?;
            } else {
                cursor = self.resume_started(&pos).await?;
            }
        }
        Ok(None)
    }

    fn is_activity_at(&self, pos: &JsonPointer) -> Result<bool, WorkflowError> {
        self.workflow
            .tree
            .node(pos)
            .map(|node| node.kind.is_activity())
            .ok_or_else(|| {
                WorkflowError::runtime("Unknown position")
                    .with_details(format!("'{pos}' is not a node of this workflow"))
                    .at(pos)
            })
    }
}
