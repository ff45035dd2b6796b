use super::retry::{CatchDefinition, ErrorDefinition};
use super::{
    DurationSpec, Endpoint, ExportDefinition, FlowDirective, InputDefinition, NamedList,
    OutputDefinition, TaskList,
};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Properties shared by every task kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCommon {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportDefinition>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A task definition, discriminated by which DSL key the entry carries.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskDefinition {
    Call(CallTaskDefinition),
    Do(DoTaskDefinition),
    Emit(EmitTaskDefinition),
    For(ForTaskDefinition),
    Fork(ForkTaskDefinition),
    Listen(ListenTaskDefinition),
    Raise(RaiseTaskDefinition),
    Run(RunTaskDefinition),
    Set(SetTaskDefinition),
    Switch(SwitchTaskDefinition),
    Try(TryTaskDefinition),
    Wait(WaitTaskDefinition),
}

impl TaskDefinition {
    #[must_use]
    pub fn common(&self) -> &TaskCommon {
        match self {
            TaskDefinition::Call(t) => &t.common,
            TaskDefinition::Do(t) => &t.common,
            TaskDefinition::Emit(t) => &t.common,
            TaskDefinition::For(t) => &t.common,
            TaskDefinition::Fork(t) => &t.common,
            TaskDefinition::Listen(t) => &t.common,
            TaskDefinition::Raise(t) => &t.common,
            TaskDefinition::Run(t) => &t.common,
            TaskDefinition::Set(t) => &t.common,
            TaskDefinition::Switch(t) => &t.common,
            TaskDefinition::Try(t) => &t.common,
            TaskDefinition::Wait(t) => &t.common,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            TaskDefinition::Call(_) => "call",
            TaskDefinition::Do(_) => "do",
            TaskDefinition::Emit(_) => "emit",
            TaskDefinition::For(_) => "for",
            TaskDefinition::Fork(_) => "fork",
            TaskDefinition::Listen(_) => "listen",
            TaskDefinition::Raise(_) => "raise",
            TaskDefinition::Run(_) => "run",
            TaskDefinition::Set(_) => "set",
            TaskDefinition::Switch(_) => "switch",
            TaskDefinition::Try(_) => "try",
            TaskDefinition::Wait(_) => "wait",
        }
    }
}

// The DSL discriminates tasks by key (`call`, `for`, `try`, …), with `do`
// doubling as both the Do task's own key and a sub-list key of For. Dispatch
// explicitly so the error for an unknown shape names the offending entry
// instead of an untagged-enum mismatch soup.
impl<'de> Deserialize<'de> for TaskDefinition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let Some(object) = value.as_object() else {
            return Err(D::Error::custom("a task must be a mapping"));
        };

        fn parse<'de, D: Deserializer<'de>, T: serde::de::DeserializeOwned>(
            value: serde_json::Value,
        ) -> Result<T, D::Error> {
            serde_json::from_value(value).map_err(D::Error::custom)
        }

        if object.contains_key("call") {
            Ok(TaskDefinition::Call(parse::<D, _>(value)?))
        } else if object.contains_key("emit") {
            Ok(TaskDefinition::Emit(parse::<D, _>(value)?))
        } else if object.contains_key("for") {
            Ok(TaskDefinition::For(parse::<D, _>(value)?))
        } else if object.contains_key("fork") {
            Ok(TaskDefinition::Fork(parse::<D, _>(value)?))
        } else if object.contains_key("listen") {
            Ok(TaskDefinition::Listen(parse::<D, _>(value)?))
        } else if object.contains_key("raise") {
            Ok(TaskDefinition::Raise(parse::<D, _>(value)?))
        } else if object.contains_key("run") {
            Ok(TaskDefinition::Run(parse::<D, _>(value)?))
        } else if object.contains_key("set") {
            Ok(TaskDefinition::Set(parse::<D, _>(value)?))
        } else if object.contains_key("switch") {
            Ok(TaskDefinition::Switch(parse::<D, _>(value)?))
        } else if object.contains_key("try") {
            Ok(TaskDefinition::Try(parse::<D, _>(value)?))
        } else if object.contains_key("wait") {
            Ok(TaskDefinition::Wait(parse::<D, _>(value)?))
        } else if object.contains_key("do") {
            Ok(TaskDefinition::Do(parse::<D, _>(value)?))
        } else {
            Err(D::Error::custom(
                "task carries none of the known DSL keys (call/do/emit/for/fork/listen/raise/run/set/switch/try/wait)",
            ))
        }
    }
}

impl Serialize for TaskDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TaskDefinition::Call(t) => t.serialize(serializer),
            TaskDefinition::Do(t) => t.serialize(serializer),
            TaskDefinition::Emit(t) => t.serialize(serializer),
            TaskDefinition::For(t) => t.serialize(serializer),
            TaskDefinition::Fork(t) => t.serialize(serializer),
            TaskDefinition::Listen(t) => t.serialize(serializer),
            TaskDefinition::Raise(t) => t.serialize(serializer),
            TaskDefinition::Run(t) => t.serialize(serializer),
            TaskDefinition::Set(t) => t.serialize(serializer),
            TaskDefinition::Switch(t) => t.serialize(serializer),
            TaskDefinition::Try(t) => t.serialize(serializer),
            TaskDefinition::Wait(t) => t.serialize(serializer),
        }
    }
}

/// `call: http|grpc|openapi|asyncapi` with free-form arguments; the
/// arguments are expression-templated at runtime before they are typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTaskDefinition {
    pub call: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoTaskDefinition {
    #[serde(rename = "do")]
    pub do_: TaskList,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitTaskDefinition {
    pub emit: EmitDefinition,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitDefinition {
    pub event: EventDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub with: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForTaskDefinition {
    #[serde(rename = "for")]
    pub for_: ForDefinition,
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_: Option<String>,
    #[serde(rename = "do")]
    pub do_: TaskList,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForDefinition {
    /// Variable name bound to the current element (default `item`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub each: Option<String>,
    /// Expression producing the collection to iterate.
    #[serde(rename = "in")]
    pub in_: String,
    /// Variable name bound to the current index (default `index`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkTaskDefinition {
    pub fork: ForkDefinition,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkDefinition {
    pub branches: TaskList,
    #[serde(default)]
    pub compete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenTaskDefinition {
    /// Event consumption strategy; opaque to this runtime (event correlation
    /// is not implemented).
    pub listen: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<SubscriptionIterator>,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionIterator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub do_: Option<TaskList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseTaskDefinition {
    pub raise: RaiseDefinition,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseDefinition {
    pub error: RaiseErrorOrRef,
}

/// The raised error: inline definition or a name from `use.errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RaiseErrorOrRef {
    Reference(String),
    Definition(ErrorDefinition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTaskDefinition {
    pub run: RunSpec,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<ShellSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<serde_json::Value>,
    /// Await process completion (default true). `false` returns the task's
    /// transformed input immediately.
    #[serde(rename = "await", default, skip_serializing_if = "Option::is_none")]
    pub await_: Option<bool>,
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub return_: Option<RunReturnMode>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunReturnMode {
    #[default]
    Stdout,
    Stderr,
    Code,
    All,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTaskDefinition {
    /// A literal/templated object, or a single expression string.
    pub set: serde_json::Value,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchTaskDefinition {
    pub switch: NamedList<SwitchCase>,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryTaskDefinition {
    #[serde(rename = "try")]
    pub try_: TaskList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<CatchDefinition>,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTaskDefinition {
    pub wait: DurationSpec,
    #[serde(flatten)]
    pub common: TaskCommon,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_task(yaml: &str) -> TaskDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_dispatch_by_key() {
        assert!(matches!(
            parse_task("set: {x: 1}"),
            TaskDefinition::Set(_)
        ));
        assert!(matches!(
            parse_task("wait: {seconds: 30}"),
            TaskDefinition::Wait(_)
        ));
        assert!(matches!(
            parse_task("do: [{inner: {set: {x: 1}}}]"),
            TaskDefinition::Do(_)
        ));
    }

    #[test]
    fn test_for_wins_over_do() {
        let task = parse_task(
            r"
for:
  each: color
  in: '${ .colors }'
do:
  - paint:
      set:
        painted: '${ $color }'
",
        );
        let TaskDefinition::For(for_task) = task else {
            panic!("expected a For task");
        };
        assert_eq!(for_task.for_.each.as_deref(), Some("color"));
        assert_eq!(for_task.do_.len(), 1);
    }

    #[test]
    fn test_call_http() {
        let task = parse_task(
            r"
call: http
with:
  method: GET
  endpoint: https://example.com/ok
then: end
",
        );
        let TaskDefinition::Call(call) = task else {
            panic!("expected a Call task");
        };
        assert_eq!(call.call, "http");
        assert_eq!(call.common.then, Some(FlowDirective::End));
    }

    #[test]
    fn test_try_with_catch() {
        let task = parse_task(
            r"
try:
  - risky:
      call: http
      with:
        method: GET
        endpoint: https://example.com/flaky
catch:
  errors:
    with:
      status: 500
  retry:
    delay: {seconds: 1}
    limit: {attempt: {count: 2}}
",
        );
        let TaskDefinition::Try(try_task) = task else {
            panic!("expected a Try task");
        };
        assert_eq!(try_task.try_.len(), 1);
        assert!(try_task.catch.unwrap().retry.is_some());
    }

    #[test]
    fn test_unknown_task_shape_is_rejected() {
        let result: Result<TaskDefinition, _> = serde_yaml::from_str("frobnicate: {x: 1}");
        assert!(result.is_err());
    }

    #[test]
    fn test_switch_cases_keep_order() {
        let task = parse_task(
            r#"
switch:
  - caseA:
      when: '. == "a"'
      then: aTask
  - caseB:
      then: end
"#,
        );
        let TaskDefinition::Switch(switch) = task else {
            panic!("expected a Switch task");
        };
        assert_eq!(switch.switch.get(0).unwrap().name, "caseA");
        assert_eq!(switch.switch.get(1).unwrap().name, "caseB");
        assert!(switch.switch.get(1).unwrap().value.when.is_none());
    }

    #[test]
    fn test_raise_forms() {
        let inline = parse_task(
            r"
raise:
  error:
    type: https://serverlessworkflow.io/spec/1.0.0/errors/validation
    status: 400
    title: Bad input
",
        );
        assert!(matches!(inline, TaskDefinition::Raise(_)));

        let by_ref = parse_task("raise: {error: notFound}");
        let TaskDefinition::Raise(raise) = by_ref else {
            panic!("expected a Raise task");
        };
        assert_eq!(
            raise.raise.error,
            RaiseErrorOrRef::Reference("notFound".to_string())
        );
    }
}
