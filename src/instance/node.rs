//! Position-addressed node operations: the transformation pipeline, flow
//! node execution, cursor advancement and flow-directive resolution.
//!
//! All transformations are pure, so transformed values are recomputed from
//! the persisted raw values on re-entry instead of being carried on the
//! wire.

use super::{WorkflowInstance, WorkflowStatus};
use crate::activities::ActivityContext;
use crate::error::WorkflowError;
use crate::expressions::{self, Scope};
use crate::model::{
    ExportDefinition, FlowDirective, InputDefinition, OutputDefinition, SwitchTaskDefinition,
};
use crate::position::JsonPointer;
use crate::state::NodeState;
use crate::tree::{Node, NodeKind};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// Result of the entry half of the pipeline (steps 1–3).
pub(crate) enum Entered {
    /// `if` was absent or true; run the body with the transformed input.
    Run(Value),
    /// `if` was false; the node returns its transformed input untouched.
    Skipped(Value),
}

impl WorkflowInstance {
    pub(crate) fn state_mut(&mut self, pos: &JsonPointer) -> &mut NodeState {
        self.states.entry(pos.clone()).or_default()
    }

    fn require_node<'a>(
        workflow: &'a crate::definitions::CompiledWorkflow,
        pos: &JsonPointer,
    ) -> Result<&'a Node, WorkflowError> {
        workflow.tree.node(pos).ok_or_else(|| {
            WorkflowError::runtime("Unknown position")
                .with_details(format!("'{pos}' is not a node of this workflow"))
                .at(pos)
        })
    }

    /// True when the node's entry side effects have not run for this
    /// attempt.
    pub(crate) fn should_start(&self, pos: &JsonPointer) -> Result<bool, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;
        let Some(state) = self.states.get(pos) else {
            return Ok(true);
        };
        Ok(match &node.kind {
            NodeKind::Root
            | NodeKind::Sequence
            | NodeKind::Do(_)
            | NodeKind::Try(_)
            | NodeKind::Fork(_) => state.child_index < 0,
            NodeKind::For(_) => state.for_index.is_none(),
            NodeKind::Raise(_)
            | NodeKind::Set(_)
            | NodeKind::Switch(_)
            | NodeKind::CallHttp(_)
            | NodeKind::CallGrpc(_)
            | NodeKind::CallOpenApi(_)
            | NodeKind::CallAsyncApi(_)
            | NodeKind::Emit(_)
            | NodeKind::Listen(_)
            | NodeKind::Run(_)
            | NodeKind::Wait(_) => state.raw_output.is_none(),
        })
    }

    /// Reset every state at or underneath `pos` (fresh re-execution).
    pub(crate) fn reset_subtree(&mut self, pos: &JsonPointer) {
        let positions: Vec<JsonPointer> = self
            .workflow
            .tree
            .positions_within(pos)
            .cloned()
            .collect();
        for position in positions {
            self.states.remove(&position);
        }
        if let Some((directive_pos, _)) = &self.pending_directive {
            if directive_pos.is_within(pos) {
                self.pending_directive = None;
            }
        }
    }

    /// Reset a subtree and hand it its raw input.
    pub(crate) fn seed(&mut self, pos: &JsonPointer, input: Value) {
        self.reset_subtree(pos);
        self.state_mut(pos).raw_input = Some(input);
    }

    /// Build the expression scope for a node: the fixed keys plus the local
    /// variables of every ancestor, inner bindings shadowing outer ones.
    pub(crate) fn scope_for(
        &self,
        pos: &JsonPointer,
        input: &Value,
        output: Option<&Value>,
    ) -> Result<Scope, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;
        let root_state = self.states.get(&JsonPointer::root());

        let mut scope = Scope::new();
        scope.insert(
            "context".to_string(),
            Value::Object(root_state.map(|s| s.context.clone()).unwrap_or_default()),
        );
        scope.insert("input".to_string(), input.clone());
        scope.insert(
            "output".to_string(),
            output.cloned().unwrap_or(Value::Null),
        );
        scope.insert("secrets".to_string(), Value::Object(self.secrets.clone()));
        scope.insert(
            "task".to_string(),
            serde_json::json!({"name": node.name, "input": input}),
        );
        let document = &workflow.definition.document;
        scope.insert(
            "workflow".to_string(),
            serde_json::json!({
                "id": root_state.and_then(|s| s.workflow_id.clone()),
                "name": document.name,
                "version": document.version,
                "input": root_state.and_then(|s| s.raw_input.clone()),
                "startedAt": root_state.and_then(|s| s.started_at),
            }),
        );
        scope.insert(
            "runtime".to_string(),
            serde_json::json!({"name": "lemline", "version": env!("CARGO_PKG_VERSION")}),
        );

        // Ancestor-local variables, outermost first so inner bindings win.
        let mut chain = Vec::new();
        let mut cursor = Some(pos.clone());
        while let Some(p) = cursor {
            cursor = p.parent();
            chain.push(p);
        }
        for ancestor in chain.into_iter().rev() {
            if let Some(state) = self.states.get(&ancestor) {
                for (name, value) in &state.variables {
                    scope.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(scope)
    }

    fn expression_error(&self, error: &expressions::Error, pos: &JsonPointer) -> WorkflowError {
        WorkflowError::expression("Expression evaluation failed")
            .with_details(error.to_string())
            .at(pos)
    }

    /// Pipeline steps 1–3: input schema, `input.from`, `if`.
    pub(crate) async fn begin(&mut self, pos: &JsonPointer) -> Result<Entered, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;

        if pos.is_root() {
            self.ensure_root_state();
        }
        let raw_input = self
            .states
            .get(pos)
            .and_then(|state| state.raw_input.clone())
            .unwrap_or(Value::Null);
        self.state_mut(pos).raw_input = Some(raw_input.clone());

        let input_def: Option<&InputDefinition> = if pos.is_root() {
            workflow.definition.input.as_ref()
        } else {
            node.common().and_then(|common| common.input.as_ref())
        };

        if let Some(schema) = input_def.and_then(|input| input.schema.as_ref()) {
            self.schemas
                .validate(&raw_input, schema)
                .await
                .map_err(|e| {
                    WorkflowError::validation("Input schema validation failed")
                        .with_details(e.to_string())
                        .at(pos)
                })?;
        }

        let transformed = match input_def.and_then(|input| input.from.as_ref()) {
            Some(from) => {
                let scope = self.scope_for(pos, &raw_input, None)?;
                expressions::evaluate_transform(from, &raw_input, &scope)
                    .map_err(|e| self.expression_error(&e, pos))?
            }
            None => raw_input,
        };

        if let Some(condition) = node.common().and_then(|common| common.if_.as_ref()) {
            let scope = self.scope_for(pos, &transformed, None)?;
            let applies = expressions::evaluate_bool(condition, &transformed, &scope)
                .map_err(|e| self.expression_error(&e, pos))?;
            if !applies {
                return Ok(Entered::Skipped(transformed));
            }
        }
        Ok(Entered::Run(transformed))
    }

    fn ensure_root_state(&mut self) {
        let state = self.state_mut(&JsonPointer::root());
        if state.workflow_id.is_none() {
            state.workflow_id = Some(uuid::Uuid::new_v4().to_string());
        }
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
    }

    /// The node's transformed input, recomputed from its persisted raw
    /// input.
    pub(crate) fn transformed_input(&self, pos: &JsonPointer) -> Result<Value, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;
        let raw_input = self
            .states
            .get(pos)
            .and_then(|state| state.raw_input.clone())
            .unwrap_or(Value::Null);
        let from = if pos.is_root() {
            workflow.definition.input.as_ref().and_then(|i| i.from.as_ref())
        } else {
            node.common()
                .and_then(|common| common.input.as_ref())
                .and_then(|input| input.from.as_ref())
        };
        match from {
            Some(from) => {
                let scope = self.scope_for(pos, &raw_input, None)?;
                expressions::evaluate_transform(from, &raw_input, &scope)
                    .map_err(|e| self.expression_error(&e, pos))
            }
            None => Ok(raw_input),
        }
    }

    fn output_def<'a>(
        workflow: &'a crate::definitions::CompiledWorkflow,
        node: &'a Node,
        pos: &JsonPointer,
    ) -> Option<&'a OutputDefinition> {
        if pos.is_root() {
            workflow.definition.output.as_ref()
        } else {
            node.common().and_then(|common| common.output.as_ref())
        }
    }

    /// Pipeline steps 4–7 around a produced raw output: `output.as`, output
    /// schema, `export.as`, context schema. Returns the transformed output.
    pub(crate) async fn complete(
        &mut self,
        pos: &JsonPointer,
        raw_output: Value,
    ) -> Result<Value, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;

        let transformed = match Self::output_def(&workflow, node, pos).and_then(|o| o.as_.as_ref())
        {
            Some(as_) => {
                let scope = self.scope_for(pos, &raw_output, Some(&raw_output))?;
                expressions::evaluate_transform(as_, &raw_output, &scope)
                    .map_err(|e| self.expression_error(&e, pos))?
            }
            None => raw_output.clone(),
        };
        if let Some(schema) = Self::output_def(&workflow, node, pos).and_then(|o| o.schema.as_ref())
        {
            self.schemas
                .validate(&transformed, schema)
                .await
                .map_err(|e| {
                    WorkflowError::validation("Output schema validation failed")
                        .with_details(e.to_string())
                        .at(pos)
                })?;
        }

        let export: Option<&ExportDefinition> =
            node.common().and_then(|common| common.export.as_ref());
        if let Some(export) = export {
            if let Some(as_) = export.as_.as_ref() {
                let scope = self.scope_for(pos, &transformed, Some(&transformed))?;
                let exported = expressions::evaluate_transform(as_, &transformed, &scope)
                    .map_err(|e| self.expression_error(&e, pos))?;
                let Value::Object(exported) = exported else {
                    return Err(WorkflowError::expression("Exported context must be an object")
                        .with_details(format!("export.as produced {exported}"))
                        .at(pos));
                };
                if let Some(schema) = export.schema.as_ref() {
                    self.schemas
                        .validate(&Value::Object(exported.clone()), schema)
                        .await
                        .map_err(|e| {
                            WorkflowError::validation("Context schema validation failed")
                                .with_details(e.to_string())
                                .at(pos)
                        })?;
                }
                self.state_mut(&JsonPointer::root()).context = exported;
            }
        }

        self.state_mut(pos).raw_output = Some(raw_output);
        Ok(transformed)
    }

    /// `if == false`: record the transformed input as the node's output and
    /// skip the output/export stages.
    pub(crate) fn complete_skipped(&mut self, pos: &JsonPointer, transformed: Value) -> Value {
        self.state_mut(pos).raw_output = Some(transformed.clone());
        transformed
    }

    /// Recompute the transformed output of an already-completed node.
    pub(crate) fn node_output(&self, pos: &JsonPointer) -> Result<Value, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;
        let raw_output = self
            .states
            .get(pos)
            .and_then(|state| state.raw_output.clone())
            .ok_or_else(|| {
                WorkflowError::runtime("Node has not produced output")
                    .with_details(pos.to_string())
                    .at(pos)
            })?;
        match Self::output_def(&workflow, node, pos).and_then(|o| o.as_.as_ref()) {
            Some(as_) => {
                let scope = self.scope_for(pos, &raw_output, Some(&raw_output))?;
                expressions::evaluate_transform(as_, &raw_output, &scope)
                    .map_err(|e| self.expression_error(&e, pos))
            }
            None => Ok(raw_output),
        }
    }

    /// Run a flow node's entry and body; returns the next cursor position.
    pub(crate) async fn enter_flow(
        &mut self,
        pos: &JsonPointer,
    ) -> Result<Option<JsonPointer>, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;

        let transformed = match self.begin(pos).await? {
            Entered::Skipped(transformed) => {
                let output = self.complete_skipped(pos, transformed);
                return self.advance_after(pos.clone(), output).await;
            }
            Entered::Run(transformed) => transformed,
        };

        match &node.kind {
            NodeKind::Root | NodeKind::Do(_) | NodeKind::Try(_) => {
                let Some(child) = node.children.first().cloned() else {
                    let output = self.complete(pos, transformed).await?;
                    return self.advance_after(pos.clone(), output).await;
                };
                self.state_mut(pos).child_index = 0;
                self.seed(&child, transformed);
                Ok(Some(child))
            }
            NodeKind::Sequence => {
                let Some(child) = node.children.first().cloned() else {
                    let output = self.complete(pos, transformed).await?;
                    return self.advance_after(pos.clone(), output).await;
                };
                self.state_mut(pos).child_index = 0;
                self.seed(&child, transformed);
                Ok(Some(child))
            }
            NodeKind::For(_) => self.begin_for(pos, transformed).await,
            NodeKind::Set(set_task) => {
                let scope = self.scope_for(pos, &transformed, None)?;
                let value = expressions::evaluate_transform(&set_task.set, &transformed, &scope)
                    .map_err(|e| self.expression_error(&e, pos))?;
                let output = self.complete(pos, value).await?;
                self.advance_after(pos.clone(), output).await
            }
            NodeKind::Switch(switch_task) => {
                let directive = self.eval_switch(pos, switch_task, &transformed)?;
                self.pending_directive = Some((pos.clone(), directive));
                let output = self.complete(pos, transformed).await?;
                self.advance_after(pos.clone(), output).await
            }
            NodeKind::Raise(raise_task) => Err(self.resolve_raise(pos, raise_task)?),
            NodeKind::Fork(_) => Err(WorkflowError::runtime("Fork branches are not executed")
                .with_details("branch concurrency is unspecified; fork tasks are declarative only")
                .at(pos)),
            NodeKind::CallHttp(_)
            | NodeKind::CallGrpc(_)
            | NodeKind::CallOpenApi(_)
            | NodeKind::CallAsyncApi(_)
            | NodeKind::Emit(_)
            | NodeKind::Listen(_)
            | NodeKind::Run(_)
            | NodeKind::Wait(_) => Err(WorkflowError::runtime(
                "Activity reached the flow execution path",
            )
            .at(pos)),
        }
    }

    fn eval_switch(
        &self,
        pos: &JsonPointer,
        task: &SwitchTaskDefinition,
        input: &Value,
    ) -> Result<FlowDirective, WorkflowError> {
        let scope = self.scope_for(pos, input, None)?;
        for case in task.switch.iter() {
            let matched = match case.value.when.as_ref() {
                Some(when) => expressions::evaluate_bool(when, input, &scope)
                    .map_err(|e| self.expression_error(&e, pos))?,
                None => true,
            };
            if matched {
                return Ok(case.value.then.clone().unwrap_or(FlowDirective::Continue));
            }
        }
        if let Some(default) = task.common.then.clone() {
            return Ok(default);
        }
        Err(WorkflowError::expression("No matching case")
            .with_details("every switch case evaluated to false and no default is declared")
            .at(pos))
    }

    fn resolve_raise(
        &self,
        pos: &JsonPointer,
        task: &crate::model::RaiseTaskDefinition,
    ) -> Result<WorkflowError, WorkflowError> {
        use crate::error::ErrorKind;
        use crate::model::RaiseErrorOrRef;

        let definition = match &task.raise.error {
            RaiseErrorOrRef::Definition(definition) => definition.clone(),
            RaiseErrorOrRef::Reference(name) => self
                .workflow
                .definition
                .use_
                .errors
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    WorkflowError::configuration("Unknown named error")
                        .with_details(format!("'{name}' is not declared in use.errors"))
                        .at(pos)
                })?,
        };

        let error_type = definition
            .error_type
            .unwrap_or_else(|| ErrorKind::Runtime.uri());
        let status = definition.status.unwrap_or_else(|| {
            // Recover the default status from a well-known type URI.
            [
                ErrorKind::Configuration,
                ErrorKind::Validation,
                ErrorKind::Expression,
                ErrorKind::Authentication,
                ErrorKind::Authorization,
                ErrorKind::Timeout,
                ErrorKind::Communication,
                ErrorKind::Runtime,
            ]
            .into_iter()
            .find(|kind| kind.uri() == error_type)
            .map_or(500, ErrorKind::default_status)
        });

        let mut raised = WorkflowError {
            error_type,
            status,
            instance: None,
            title: definition.title.unwrap_or_else(|| "Workflow error".to_string()),
            details: definition.details,
        };
        raised = raised.at(pos);
        Ok(raised)
    }

    async fn begin_for(
        &mut self,
        pos: &JsonPointer,
        transformed: Value,
    ) -> Result<Option<JsonPointer>, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;
        let NodeKind::For(for_task) = &node.kind else {
            return Err(WorkflowError::runtime("begin_for on a non-For node").at(pos));
        };
        let body = node.children.first().cloned().ok_or_else(|| {
            WorkflowError::runtime("For node has no body").at(pos)
        })?;

        let scope = self.scope_for(pos, &transformed, None)?;
        let items = expressions::evaluate_list(&for_task.for_.in_, &transformed, &scope)
            .map_err(|e| self.expression_error(&e, pos))?;

        self.state_mut(pos).for_index = Some(0);
        let Some(first) = items.first().cloned() else {
            let output = self.complete(pos, transformed).await?;
            return self.advance_after(pos.clone(), output).await;
        };

        self.bind_iteration(pos, for_task, first, 0);
        if !self.while_holds(pos, for_task, &transformed)? {
            let output = self.complete(pos, transformed).await?;
            return self.advance_after(pos.clone(), output).await;
        }
        self.seed(&body, transformed);
        Ok(Some(body))
    }

    /// Move a For node to its next iteration; `None` when exhausted (caller
    /// then completes the For with the last body output).
    pub(crate) async fn next_iteration(
        &mut self,
        pos: &JsonPointer,
        last_output: Value,
    ) -> Result<Option<JsonPointer>, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;
        let NodeKind::For(for_task) = node.kind.clone() else {
            return Err(WorkflowError::runtime("next_iteration on a non-For node").at(pos));
        };
        let body = node.children.first().cloned().ok_or_else(|| {
            WorkflowError::runtime("For node has no body").at(pos)
        })?;

        let index = self
            .states
            .get(pos)
            .and_then(|state| state.for_index)
            .unwrap_or(0)
            + 1;

        let transformed = self.transformed_input(pos)?;
        let scope = self.scope_for(pos, &transformed, None)?;
        let items = expressions::evaluate_list(&for_task.for_.in_, &transformed, &scope)
            .map_err(|e| self.expression_error(&e, pos))?;

        let Some(item) = items.get(index as usize).cloned() else {
            return Ok(None);
        };
        self.state_mut(pos).for_index = Some(index);
        self.bind_iteration(pos, &for_task, item, index);
        if !self.while_holds(pos, &for_task, &last_output)? {
            return Ok(None);
        }
        self.seed(&body, last_output);
        Ok(Some(body))
    }

    fn bind_iteration(
        &mut self,
        pos: &JsonPointer,
        for_task: &crate::model::ForTaskDefinition,
        item: Value,
        index: u64,
    ) {
        let each = for_task.for_.each.clone().unwrap_or_else(|| "item".to_string());
        let at = for_task.for_.at.clone().unwrap_or_else(|| "index".to_string());
        let state = self.state_mut(pos);
        state.variables.insert(each, item);
        state.variables.insert(at, Value::from(index));
    }

    fn while_holds(
        &self,
        pos: &JsonPointer,
        for_task: &crate::model::ForTaskDefinition,
        input: &Value,
    ) -> Result<bool, WorkflowError> {
        let Some(while_) = for_task.while_.as_ref() else {
            return Ok(true);
        };
        let scope = self.scope_for(pos, input, None)?;
        expressions::evaluate_bool(while_, input, &scope)
            .map_err(|e| self.expression_error(&e, pos))
    }

    /// The directive attached to a completed node: a Switch decision if one
    /// is pending for it, otherwise its declared `then`.
    fn take_directive(&mut self, pos: &JsonPointer) -> FlowDirective {
        if let Some((directive_pos, _)) = &self.pending_directive {
            if directive_pos == pos {
                if let Some((_, directive)) = self.pending_directive.take() {
                    return directive;
                }
            }
        }
        self.workflow
            .tree
            .node(pos)
            .and_then(Node::common)
            .and_then(|common| common.then.clone())
            .unwrap_or(FlowDirective::Continue)
    }

    /// Nearest ancestor sequence of `pos` (the "enclosing Do").
    fn enclosing_sequence(&self, pos: &JsonPointer) -> Result<JsonPointer, WorkflowError> {
        let mut cursor = pos.parent();
        while let Some(candidate) = cursor {
            if let Some(node) = self.workflow.tree.node(&candidate) {
                if matches!(node.kind, NodeKind::Sequence) {
                    return Ok(candidate);
                }
            }
            cursor = candidate.parent();
        }
        Err(WorkflowError::runtime("No enclosing sequence")
            .with_details(pos.to_string())
            .at(pos))
    }

    /// A node at `pos` completed with `output`: resolve its directive and
    /// walk upward until the next position to visit is found (`None` when
    /// the workflow completed).
    pub(crate) async fn advance_after(
        &mut self,
        mut pos: JsonPointer,
        mut output: Value,
    ) -> Result<Option<JsonPointer>, WorkflowError> {
        loop {
            let workflow = Arc::clone(&self.workflow);
            match self.take_directive(&pos) {
                FlowDirective::End => return self.finish_workflow(output).await,
                FlowDirective::Exit => {
                    let sequence = self.enclosing_sequence(&pos)?;
                    self.state_mut(&sequence).raw_output = Some(output.clone());
                    pos = sequence;
                }
                FlowDirective::Named(name) => {
                    return self.jump_to_sibling(&pos, &name, output).map(Some);
                }
                FlowDirective::Continue => {}
            }

            let node = Self::require_node(&workflow, &pos)?;
            let Some(parent_pos) = node.parent.clone() else {
                return self.finish_workflow(output).await;
            };
            let parent = Self::require_node(&workflow, &parent_pos)?;

            match &parent.kind {
                NodeKind::Root => return self.finish_workflow(output).await,
                NodeKind::Sequence => {
                    let index = parent.child_index_of(&pos).ok_or_else(|| {
                        WorkflowError::runtime("Node is not a child of its parent")
                            .with_details(pos.to_string())
                            .at(&pos)
                    })?;
                    if let Some(next_pos) = parent.children.get(index + 1).cloned() {
                        self.state_mut(&parent_pos).child_index = (index + 1) as i32;
                        self.seed(&next_pos, output);
                        return Ok(Some(next_pos));
                    }
                    self.state_mut(&parent_pos).raw_output = Some(output.clone());
                    pos = parent_pos;
                }
                NodeKind::Do(_) | NodeKind::Try(_) | NodeKind::Fork(_) => {
                    output = self.complete(&parent_pos, output).await?;
                    pos = parent_pos;
                }
                NodeKind::For(_) => match self.next_iteration(&parent_pos, output.clone()).await? {
                    Some(body) => return Ok(Some(body)),
                    None => {
                        output = self.complete(&parent_pos, output).await?;
                        pos = parent_pos;
                    }
                },
                NodeKind::Raise(_)
                | NodeKind::Set(_)
                | NodeKind::Switch(_)
                | NodeKind::CallHttp(_)
                | NodeKind::CallGrpc(_)
                | NodeKind::CallOpenApi(_)
                | NodeKind::CallAsyncApi(_)
                | NodeKind::Emit(_)
                | NodeKind::Listen(_)
                | NodeKind::Run(_)
                | NodeKind::Wait(_) => {
                    return Err(WorkflowError::runtime("Leaf node cannot own children")
                        .with_details(parent_pos.to_string())
                        .at(&parent_pos));
                }
            }
        }
    }

    fn jump_to_sibling(
        &mut self,
        pos: &JsonPointer,
        name: &str,
        output: Value,
    ) -> Result<JsonPointer, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let sequence_pos = self.enclosing_sequence(pos)?;
        let sequence = Self::require_node(&workflow, &sequence_pos)?;
        let target = sequence
            .children
            .iter()
            .enumerate()
            .find(|(_, child)| {
                workflow
                    .tree
                    .node(child)
                    .is_some_and(|node| node.name == name)
            })
            .map(|(index, child)| (index, child.clone()));
        let Some((index, target_pos)) = target else {
            return Err(WorkflowError::configuration("Unknown flow target")
                .with_details(format!(
                    "no task named '{name}' in the sequence at '{sequence_pos}'"
                ))
                .at(pos));
        };
        self.state_mut(&sequence_pos).child_index = index as i32;
        self.seed(&target_pos, output);
        Ok(target_pos)
    }

    /// Workflow-level completion: apply the workflow output transformation
    /// and pin the result on the root state.
    async fn finish_workflow(
        &mut self,
        output: Value,
    ) -> Result<Option<JsonPointer>, WorkflowError> {
        let root = JsonPointer::root();
        let transformed = self.complete(&root, output).await?;
        // The root records the transformed workflow output; it is what a
        // completed instance reports.
        self.state_mut(&root).raw_output = Some(transformed);
        Ok(None)
    }

    /// Defensive resume path for a node that was started but not completed
    /// (redelivered message): descend to the child in flight, or advance
    /// past it once it has produced output.
    pub(crate) async fn resume_started(
        &mut self,
        pos: &JsonPointer,
    ) -> Result<Option<JsonPointer>, WorkflowError> {
        if self
            .states
            .get(pos)
            .is_some_and(|state| state.raw_output.is_some())
        {
            let output = self.node_output(pos)?;
            return self.advance_after(pos.clone(), output).await;
        }

        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;
        let child = match &node.kind {
            NodeKind::Root
            | NodeKind::Sequence
            | NodeKind::Do(_)
            | NodeKind::Try(_)
            | NodeKind::Fork(_) => {
                let index = self
                    .states
                    .get(pos)
                    .map(|state| state.child_index)
                    .unwrap_or(-1);
                usize::try_from(index)
                    .ok()
                    .and_then(|index| node.children.get(index).cloned())
            }
            NodeKind::For(_) => node.children.first().cloned(),
            NodeKind::Raise(_)
            | NodeKind::Set(_)
            | NodeKind::Switch(_)
            | NodeKind::CallHttp(_)
            | NodeKind::CallGrpc(_)
            | NodeKind::CallOpenApi(_)
            | NodeKind::CallAsyncApi(_)
            | NodeKind::Emit(_)
            | NodeKind::Listen(_)
            | NodeKind::Run(_)
            | NodeKind::Wait(_) => None,
        };
        child.map(Some).ok_or_else(|| {
            WorkflowError::runtime("Cannot resume node")
                .with_details(format!("'{pos}' is started but has no child in flight"))
                .at(pos)
        })
    }

    /// Execute the activity at `pos` (the caller broke out of the flow loop
    /// here). On success the node is completed; Wait additionally parks the
    /// instance.
    pub(crate) async fn execute_activity(
        &mut self,
        pos: &JsonPointer,
    ) -> Result<(), WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = Self::require_node(&workflow, pos)?;

        let transformed = match self.begin(pos).await? {
            Entered::Skipped(transformed) => {
                self.complete_skipped(pos, transformed);
                return Ok(());
            }
            Entered::Run(transformed) => transformed,
        };

        match &node.kind {
            NodeKind::Wait(wait_task) => {
                let delay = wait_task.wait.to_duration().map_err(|e| {
                    WorkflowError::configuration("Invalid wait duration")
                        .with_details(e.to_string())
                        .at(pos)
                })?;
                // A wait produces no output of its own; the transformed
                // input passes through so re-entry resumes after the wait.
                self.complete(pos, transformed).await?;
                self.status = WorkflowStatus::Waiting;
                self.wait_delay = Some(delay);
                Ok(())
            }
            NodeKind::CallHttp(call) => {
                let arguments = call
                    .with
                    .clone()
                    .map_or(Value::Null, Value::Object);
                self.run_activity(pos, &node.name, "http", arguments, transformed)
                    .await
            }
            NodeKind::CallGrpc(call) => {
                let arguments = call.with.clone().map_or(Value::Null, Value::Object);
                self.run_activity(pos, &node.name, "grpc", arguments, transformed)
                    .await
            }
            NodeKind::CallOpenApi(call) => {
                let arguments = call.with.clone().map_or(Value::Null, Value::Object);
                self.run_activity(pos, &node.name, "openapi", arguments, transformed)
                    .await
            }
            NodeKind::CallAsyncApi(call) => {
                let arguments = call.with.clone().map_or(Value::Null, Value::Object);
                self.run_activity(pos, &node.name, "asyncapi", arguments, transformed)
                    .await
            }
            NodeKind::Emit(emit_task) => {
                let arguments = Value::Object(emit_task.emit.event.with.clone());
                self.run_activity(pos, &node.name, "emit", arguments, transformed)
                    .await
            }
            NodeKind::Run(run_task) => {
                let arguments = serde_json::to_value(&run_task.run).map_err(|e| {
                    WorkflowError::runtime("Run task serialization failed")
                        .with_details(e.to_string())
                        .at(pos)
                })?;
                self.run_activity(pos, &node.name, "run", arguments, transformed)
                    .await
            }
            NodeKind::Listen(_) => {
                self.run_activity(pos, &node.name, "listen", Value::Null, transformed)
                    .await
            }
            NodeKind::Root
            | NodeKind::Sequence
            | NodeKind::Do(_)
            | NodeKind::For(_)
            | NodeKind::Try(_)
            | NodeKind::Fork(_)
            | NodeKind::Raise(_)
            | NodeKind::Set(_)
            | NodeKind::Switch(_) => {
                Err(WorkflowError::runtime("Flow node reached the activity path").at(pos))
            }
        }
    }

    async fn run_activity(
        &mut self,
        pos: &JsonPointer,
        task_name: &str,
        kind: &str,
        raw_arguments: Value,
        transformed: Value,
    ) -> Result<(), WorkflowError> {
        let scope = self.scope_for(pos, &transformed, None)?;
        let arguments = expressions::evaluate_template(&raw_arguments, &transformed, &scope)
            .map_err(|e| self.expression_error(&e, pos))?;

        let runners = Arc::clone(&self.runners);
        let runner = runners.get(kind).ok_or_else(|| {
            WorkflowError::configuration("No activity runner registered")
                .with_details(format!("activity kind '{kind}' has no runner"))
                .at(pos)
        })?;

        let context = ActivityContext {
            position: pos.clone(),
            task_name: task_name.to_string(),
            input: transformed,
            arguments,
            scope,
            workflow: Arc::clone(&self.workflow),
            secrets: self.secrets.clone(),
        };
        let output = runner.execute(context).await.map_err(|e| e.at(pos))?;
        self.complete(pos, output).await?;
        Ok(())
    }
}
