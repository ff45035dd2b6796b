//! The compiled node tree.
//!
//! A workflow document is materialized once into an arena of immutable
//! [`Node`]s keyed by their JSON-pointer position. Parent and children are
//! position references only; all mutable state lives in the per-instance
//! state overlay, never in the tree.
//!
//! Position grammar:
//! - the root node is `""`, its single child is the sequence `/do`;
//! - tasks inside a sequence at `S` sit at `S/<i>/<name>`;
//! - a nested Do task, a For body and a Fork's branch list introduce the
//!   segments `/do`, `/do` and `/fork/branches` respectively;
//! - Try introduces `/try` and, when a catch body exists, `/catch/do`;
//! - Listen bodies sit under `/foreach/do`, AsyncAPI subscription bodies
//!   under `/with/subscription/foreach/do`.

use crate::model::{
    CallTaskDefinition, EmitTaskDefinition, ForTaskDefinition, ForkTaskDefinition,
    ListenTaskDefinition, RaiseTaskDefinition, RunTaskDefinition, SetTaskDefinition,
    SwitchTaskDefinition, TaskCommon, TaskDefinition, TaskList, TryTaskDefinition,
    WaitTaskDefinition, WorkflowDefinition,
};
use crate::position::JsonPointer;
use snafu::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid task name '{name}' at {position}: {reason}"))]
    InvalidTaskName {
        name: String,
        position: String,
        reason: &'static str,
    },

    #[snafu(display("Duplicate task name '{name}' in the sequence at {position}"))]
    DuplicateTaskName { name: String, position: String },

    #[snafu(display("Invalid asyncapi subscription body at {position}: {message}"))]
    InvalidSubscriptionBody { position: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Task names that collide with structural position segments or flow
/// directives are rejected at compile time.
const RESERVED_NAMES: &[&str] = &[
    "do", "try", "catch", "fork", "branches", "foreach", "with", "subscription", "continue",
    "exit", "end",
];

/// The kind of a node, carrying its typed task definition.
///
/// `Sequence` is the synthetic container for every task list (`/do`,
/// `…/try`, `…/catch/do`, For bodies, Fork branches): a Do in the DSL's
/// terms, but with no task properties of its own. An explicit Do task keeps
/// its `TaskCommon` and owns exactly one `Sequence` child.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Root,
    Sequence,
    Do(TaskCommon),
    For(ForTaskDefinition),
    Try(TryTaskDefinition),
    Fork(ForkTaskDefinition),
    Raise(RaiseTaskDefinition),
    Set(SetTaskDefinition),
    Switch(SwitchTaskDefinition),
    CallHttp(CallTaskDefinition),
    CallGrpc(CallTaskDefinition),
    CallOpenApi(CallTaskDefinition),
    CallAsyncApi(CallTaskDefinition),
    Emit(EmitTaskDefinition),
    Listen(ListenTaskDefinition),
    Run(RunTaskDefinition),
    Wait(WaitTaskDefinition),
}

impl NodeKind {
    /// Activities cross the message boundary; flow nodes run synchronously
    /// within one message.
    #[must_use]
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            NodeKind::CallHttp(_)
                | NodeKind::CallGrpc(_)
                | NodeKind::CallOpenApi(_)
                | NodeKind::CallAsyncApi(_)
                | NodeKind::Emit(_)
                | NodeKind::Listen(_)
                | NodeKind::Run(_)
                | NodeKind::Wait(_)
        )
    }

    #[must_use]
    pub fn is_try(&self) -> bool {
        matches!(self, NodeKind::Try(_))
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Sequence => "sequence",
            NodeKind::Do(_) => "do",
            NodeKind::For(_) => "for",
            NodeKind::Try(_) => "try",
            NodeKind::Fork(_) => "fork",
            NodeKind::Raise(_) => "raise",
            NodeKind::Set(_) => "set",
            NodeKind::Switch(_) => "switch",
            NodeKind::CallHttp(_) => "call:http",
            NodeKind::CallGrpc(_) => "call:grpc",
            NodeKind::CallOpenApi(_) => "call:openapi",
            NodeKind::CallAsyncApi(_) => "call:asyncapi",
            NodeKind::Emit(_) => "emit",
            NodeKind::Listen(_) => "listen",
            NodeKind::Run(_) => "run",
            NodeKind::Wait(_) => "wait",
        }
    }
}

/// An immutable node of the compiled tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub position: JsonPointer,
    pub name: String,
    pub kind: NodeKind,
    pub parent: Option<JsonPointer>,
    pub children: Vec<JsonPointer>,
}

impl Node {
    /// The shared task properties, when the node has any (the root and the
    /// synthetic sequence containers report `None` or an empty common).
    #[must_use]
    pub fn common(&self) -> Option<&TaskCommon> {
        match &self.kind {
            NodeKind::Root | NodeKind::Sequence => None,
            NodeKind::Do(common) => Some(common),
            NodeKind::For(t) => Some(&t.common),
            NodeKind::Try(t) => Some(&t.common),
            NodeKind::Fork(t) => Some(&t.common),
            NodeKind::Raise(t) => Some(&t.common),
            NodeKind::Set(t) => Some(&t.common),
            NodeKind::Switch(t) => Some(&t.common),
            NodeKind::CallHttp(t)
            | NodeKind::CallGrpc(t)
            | NodeKind::CallOpenApi(t)
            | NodeKind::CallAsyncApi(t) => Some(&t.common),
            NodeKind::Emit(t) => Some(&t.common),
            NodeKind::Listen(t) => Some(&t.common),
            NodeKind::Run(t) => Some(&t.common),
            NodeKind::Wait(t) => Some(&t.common),
        }
    }

    /// Index of a direct child position, by position equality.
    #[must_use]
    pub fn child_index_of(&self, position: &JsonPointer) -> Option<usize> {
        self.children.iter().position(|child| child == position)
    }
}

/// The arena of compiled nodes for one workflow definition.
#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: HashMap<JsonPointer, Node>,
}

impl NodeTree {
    /// Compile a workflow document into its node tree.
    pub fn build(workflow: &WorkflowDefinition) -> Result<Self> {
        let mut builder = TreeBuilder {
            nodes: HashMap::new(),
        };
        let root_pos = JsonPointer::root();
        let sequence_pos = root_pos.child("do");

        builder.insert(Node {
            position: root_pos.clone(),
            name: workflow.document.name.clone(),
            kind: NodeKind::Root,
            parent: None,
            children: vec![sequence_pos.clone()],
        });
        builder.add_sequence(sequence_pos, root_pos, "do", &workflow.do_)?;

        Ok(Self {
            nodes: builder.nodes,
        })
    }

    #[must_use]
    pub fn node(&self, position: &JsonPointer) -> Option<&Node> {
        self.nodes.get(position)
    }

    #[must_use]
    pub fn contains(&self, position: &JsonPointer) -> bool {
        self.nodes.contains_key(position)
    }

    #[must_use]
    pub fn root(&self) -> &Node {
        self.nodes
            .get(&JsonPointer::root())
            .expect("a compiled tree always has a root node")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = &JsonPointer> {
        self.nodes.keys()
    }

    /// All positions at or underneath `ancestor`.
    pub fn positions_within<'a>(
        &'a self,
        ancestor: &'a JsonPointer,
    ) -> impl Iterator<Item = &'a JsonPointer> {
        self.nodes
            .keys()
            .filter(move |position| position.is_within(ancestor))
    }
}

struct TreeBuilder {
    nodes: HashMap<JsonPointer, Node>,
}

impl TreeBuilder {
    fn insert(&mut self, node: Node) {
        self.nodes.insert(node.position.clone(), node);
    }

    /// Add a synthetic sequence container and, depth-first, its tasks.
    fn add_sequence(
        &mut self,
        position: JsonPointer,
        parent: JsonPointer,
        name: &str,
        tasks: &TaskList,
    ) -> Result<()> {
        let mut children = Vec::with_capacity(tasks.len());
        let mut seen = Vec::with_capacity(tasks.len());
        for (index, item) in tasks.iter().enumerate() {
            validate_name(&item.name, &position)?;
            if seen.contains(&&item.name) {
                return Err(Error::DuplicateTaskName {
                    name: item.name.clone(),
                    position: position.to_string(),
                });
            }
            seen.push(&item.name);
            children.push(position.indexed(index).child(&item.name));
        }

        self.insert(Node {
            position: position.clone(),
            name: name.to_string(),
            kind: NodeKind::Sequence,
            parent: Some(parent),
            children: children.clone(),
        });

        for (child_pos, item) in children.into_iter().zip(tasks.iter()) {
            self.add_task(child_pos, position.clone(), &item.name, &item.value)?;
        }
        Ok(())
    }

    fn add_task(
        &mut self,
        position: JsonPointer,
        parent: JsonPointer,
        name: &str,
        task: &TaskDefinition,
    ) -> Result<()> {
        let mut children = Vec::new();
        let kind = match task {
            TaskDefinition::Do(do_task) => {
                let sequence_pos = position.child("do");
                children.push(sequence_pos.clone());
                self.add_sequence(sequence_pos, position.clone(), "do", &do_task.do_)?;
                NodeKind::Do(do_task.common.clone())
            }
            TaskDefinition::For(for_task) => {
                let body_pos = position.child("do");
                children.push(body_pos.clone());
                self.add_sequence(body_pos, position.clone(), "do", &for_task.do_)?;
                NodeKind::For(for_task.clone())
            }
            TaskDefinition::Try(try_task) => {
                let try_pos = position.child("try");
                children.push(try_pos.clone());
                self.add_sequence(try_pos, position.clone(), "try", &try_task.try_)?;
                if let Some(catch_do) = try_task.catch.as_ref().and_then(|c| c.do_.as_ref()) {
                    let catch_pos = position.child("catch").child("do");
                    children.push(catch_pos.clone());
                    self.add_sequence(catch_pos, position.clone(), "do", catch_do)?;
                }
                NodeKind::Try(try_task.clone())
            }
            TaskDefinition::Fork(fork_task) => {
                let branches_pos = position.child("fork").child("branches");
                children.push(branches_pos.clone());
                self.add_sequence(
                    branches_pos,
                    position.clone(),
                    "branches",
                    &fork_task.fork.branches,
                )?;
                NodeKind::Fork(fork_task.clone())
            }
            TaskDefinition::Listen(listen_task) => {
                if let Some(body) = listen_task.foreach.as_ref().and_then(|f| f.do_.as_ref()) {
                    let body_pos = position.child("foreach").child("do");
                    children.push(body_pos.clone());
                    self.add_sequence(body_pos, position.clone(), "do", body)?;
                }
                NodeKind::Listen(listen_task.clone())
            }
            TaskDefinition::Call(call_task) => {
                let kind = match call_task.call.as_str() {
                    "grpc" => NodeKind::CallGrpc(call_task.clone()),
                    "openapi" => NodeKind::CallOpenApi(call_task.clone()),
                    "asyncapi" => {
                        if let Some(body) = asyncapi_subscription_body(call_task, &position)? {
                            let body_pos = position
                                .child("with")
                                .child("subscription")
                                .child("foreach")
                                .child("do");
                            children.push(body_pos.clone());
                            self.add_sequence(body_pos, position.clone(), "do", &body)?;
                        }
                        NodeKind::CallAsyncApi(call_task.clone())
                    }
                    // "http" and unqualified custom functions resolve to the
                    // HTTP runner's argument shape.
                    _ => NodeKind::CallHttp(call_task.clone()),
                };
                kind
            }
            TaskDefinition::Raise(raise_task) => NodeKind::Raise(raise_task.clone()),
            TaskDefinition::Set(set_task) => NodeKind::Set(set_task.clone()),
            TaskDefinition::Switch(switch_task) => NodeKind::Switch(switch_task.clone()),
            TaskDefinition::Emit(emit_task) => NodeKind::Emit(emit_task.clone()),
            TaskDefinition::Run(run_task) => NodeKind::Run(run_task.clone()),
            TaskDefinition::Wait(wait_task) => NodeKind::Wait(wait_task.clone()),
        };

        self.insert(Node {
            position,
            name: name.to_string(),
            kind,
            parent: Some(parent),
            children,
        });
        Ok(())
    }
}

/// The `do` list nested in an asyncapi subscription, when present.
fn asyncapi_subscription_body(
    call_task: &CallTaskDefinition,
    position: &JsonPointer,
) -> Result<Option<TaskList>> {
    let Some(body) = call_task
        .with
        .as_ref()
        .and_then(|with| with.get("subscription"))
        .and_then(|subscription| subscription.get("foreach"))
        .and_then(|foreach| foreach.get("do"))
    else {
        return Ok(None);
    };
    serde_json::from_value(body.clone())
        .map(Some)
        .map_err(|e| Error::InvalidSubscriptionBody {
            position: position.to_string(),
            message: e.to_string(),
        })
}

fn validate_name(name: &str, position: &JsonPointer) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidTaskName {
            name: name.to_string(),
            position: position.to_string(),
            reason: "task names must not be empty",
        });
    }
    if name.contains('/') {
        return Err(Error::InvalidTaskName {
            name: name.to_string(),
            position: position.to_string(),
            reason: "task names must not contain '/'",
        });
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidTaskName {
            name: name.to_string(),
            position: position.to_string(),
            reason: "task names must not be numeric",
        });
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(Error::InvalidTaskName {
            name: name.to_string(),
            position: position.to_string(),
            reason: "task name is a reserved DSL token",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_document;

    fn tree_for(yaml: &str) -> NodeTree {
        NodeTree::build(&parse_document(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_positions_for_flat_do() {
        let tree = tree_for(
            r"
document: {dsl: '1.0.0', namespace: t, name: flat, version: '1.0.0'}
do:
  - first:
      set: {a: 1}
  - second:
      set: {b: 2}
",
        );
        assert!(tree.contains(&JsonPointer::root()));
        assert!(tree.contains(&JsonPointer::from("/do")));
        assert!(tree.contains(&JsonPointer::from("/do/0/first")));
        assert!(tree.contains(&JsonPointer::from("/do/1/second")));
        assert_eq!(tree.len(), 4);

        let sequence = tree.node(&JsonPointer::from("/do")).unwrap();
        assert_eq!(sequence.children.len(), 2);
        assert_eq!(
            sequence.child_index_of(&JsonPointer::from("/do/1/second")),
            Some(1)
        );
    }

    #[test]
    fn test_positions_for_try_catch() {
        let tree = tree_for(
            r"
document: {dsl: '1.0.0', namespace: t, name: guarded, version: '1.0.0'}
do:
  - guard:
      try:
        - risky:
            set: {x: 1}
      catch:
        do:
          - recover:
              set: {ok: true}
",
        );
        assert!(tree.contains(&JsonPointer::from("/do/0/guard/try")));
        assert!(tree.contains(&JsonPointer::from("/do/0/guard/try/0/risky")));
        assert!(tree.contains(&JsonPointer::from("/do/0/guard/catch/do")));
        assert!(tree.contains(&JsonPointer::from("/do/0/guard/catch/do/0/recover")));

        let guard = tree.node(&JsonPointer::from("/do/0/guard")).unwrap();
        assert!(guard.kind.is_try());
        assert_eq!(guard.children.len(), 2);
    }

    #[test]
    fn test_positions_for_nested_do_and_for() {
        let tree = tree_for(
            r"
document: {dsl: '1.0.0', namespace: t, name: nested, version: '1.0.0'}
do:
  - outer:
      do:
        - inner:
            set: {x: 1}
  - loop:
      for:
        in: '${ .items }'
      do:
        - body:
            set: {y: 2}
",
        );
        assert!(tree.contains(&JsonPointer::from("/do/0/outer/do/0/inner")));
        assert!(tree.contains(&JsonPointer::from("/do/1/loop/do/0/body")));
    }

    #[test]
    fn test_positions_for_fork_branches() {
        let tree = tree_for(
            r"
document: {dsl: '1.0.0', namespace: t, name: forked, version: '1.0.0'}
do:
  - split:
      fork:
        branches:
          - left:
              set: {l: 1}
          - right:
              set: {r: 1}
",
        );
        assert!(tree.contains(&JsonPointer::from("/do/0/split/fork/branches/0/left")));
        assert!(tree.contains(&JsonPointer::from("/do/0/split/fork/branches/1/right")));
    }

    #[test]
    fn test_activity_partition() {
        let tree = tree_for(
            r"
document: {dsl: '1.0.0', namespace: t, name: mixed, version: '1.0.0'}
do:
  - fetch:
      call: http
      with: {method: GET, endpoint: 'https://example/ok'}
  - pause:
      wait: {seconds: 1}
  - project:
      set: {done: true}
",
        );
        assert!(
            tree.node(&JsonPointer::from("/do/0/fetch"))
                .unwrap()
                .kind
                .is_activity()
        );
        assert!(
            tree.node(&JsonPointer::from("/do/1/pause"))
                .unwrap()
                .kind
                .is_activity()
        );
        assert!(
            !tree
                .node(&JsonPointer::from("/do/2/project"))
                .unwrap()
                .kind
                .is_activity()
        );
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["a/b", "42", "try", "end"] {
            let yaml = format!(
                r"
document: {{dsl: '1.0.0', namespace: t, name: bad, version: '1.0.0'}}
do:
  - '{name}':
      set: {{x: 1}}
"
            );
            let workflow = parse_document(&yaml).unwrap();
            assert!(NodeTree::build(&workflow).is_err(), "name {name:?}");
        }
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let workflow = parse_document(
            r"
document: {dsl: '1.0.0', namespace: t, name: dup, version: '1.0.0'}
do:
  - same:
      set: {x: 1}
  - same:
      set: {y: 2}
",
        )
        .unwrap();
        assert!(matches!(
            NodeTree::build(&workflow),
            Err(Error::DuplicateTaskName { .. })
        ));
    }

    #[test]
    fn test_parent_back_references() {
        let tree = tree_for(
            r"
document: {dsl: '1.0.0', namespace: t, name: parents, version: '1.0.0'}
do:
  - only:
      set: {x: 1}
",
        );
        let task = tree.node(&JsonPointer::from("/do/0/only")).unwrap();
        assert_eq!(task.parent.as_ref().unwrap().as_str(), "/do");
        let sequence = tree.node(&JsonPointer::from("/do")).unwrap();
        assert_eq!(sequence.parent.as_ref().unwrap(), &JsonPointer::root());
        assert!(tree.root().parent.is_none());
    }
}
