//! Runtime expression evaluation (jq dialect, via jaq).
//!
//! A string is an expression iff it is wrapped as `${ … }`. Fields the DSL
//! defines as runtime expressions (`input.from`, `output.as`, `if`, `when`,
//! `while`, …) also accept a bare jq program; callers opt into that with
//! `force`. Scope entries are exposed to programs as `$` variables
//! (`$context`, `$input`, `$secrets`, `$item`, `$error`, …).

use jaq_json::Val;
use serde_json::Value;
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("JQ load errors in '{expression}': {errors}"))]
    JqLoad { expression: String, errors: String },

    #[snafu(display("JQ compile errors in '{expression}': {errors}"))]
    JqCompile { expression: String, errors: String },

    #[snafu(display("JQ evaluation error in '{expression}': {message}"))]
    JqEvaluation {
        expression: String,
        message: String,
    },

    #[snafu(display("Expression '{expression}' returned {actual}, expected {expected}"))]
    TypeMismatch {
        expression: String,
        expected: &'static str,
        actual: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The `$`-variable bindings visible to a program.
pub type Scope = serde_json::Map<String, Value>;

/// True when the string is syntactically an interpolated expression.
#[must_use]
pub fn is_expression(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with("${") && trimmed.ends_with('}')
}

fn strip_wrapper(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map_or(trimmed, str::trim)
}

/// Evaluate a string against `input` and `scope`.
///
/// Without `force`, a non-`${…}` string is returned verbatim; with `force`
/// it is compiled as a bare jq program.
pub fn evaluate(expression: &str, input: &Value, scope: &Scope, force: bool) -> Result<Value> {
    if is_expression(expression) {
        run_program(strip_wrapper(expression), input, scope)
    } else if force {
        run_program(expression.trim(), input, scope)
    } else {
        Ok(Value::String(expression.to_string()))
    }
}

/// Recursively evaluate every string leaf of a templated JSON value,
/// preserving structure. Only `${…}` strings are evaluated.
pub fn evaluate_template(value: &Value, input: &Value, scope: &Scope) -> Result<Value> {
    match value {
        Value::String(text) => evaluate(text, input, scope, false),
        Value::Object(map) => {
            let mut result = serde_json::Map::new();
            for (key, entry) in map {
                result.insert(key.clone(), evaluate_template(entry, input, scope)?);
            }
            Ok(Value::Object(result))
        }
        Value::Array(items) => {
            let mut result = Vec::with_capacity(items.len());
            for item in items {
                result.push(evaluate_template(item, input, scope)?);
            }
            Ok(Value::Array(result))
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(value.clone()),
    }
}

/// Evaluate a transformation field that may be an expression string or a
/// templated object (`input.from`, `output.as`, `export.as`, `set`).
pub fn evaluate_transform(value: &Value, input: &Value, scope: &Scope) -> Result<Value> {
    match value {
        Value::String(text) => evaluate(text, input, scope, true),
        other => evaluate_template(other, input, scope),
    }
}

/// Evaluate an expression expected to produce a boolean (`if`, `when`,
/// `while`, `exceptWhen`).
pub fn evaluate_bool(expression: &str, input: &Value, scope: &Scope) -> Result<bool> {
    match evaluate(expression, input, scope, true)? {
        Value::Bool(flag) => Ok(flag),
        other => Err(Error::TypeMismatch {
            expression: expression.to_string(),
            expected: "boolean",
            actual: type_name(&other),
        }),
    }
}

/// Evaluate an expression expected to produce a string.
pub fn evaluate_string(expression: &str, input: &Value, scope: &Scope) -> Result<String> {
    match evaluate(expression, input, scope, false)? {
        Value::String(text) => Ok(text),
        other => Err(Error::TypeMismatch {
            expression: expression.to_string(),
            expected: "string",
            actual: type_name(&other),
        }),
    }
}

/// Evaluate an expression expected to produce a list (`for.in`).
pub fn evaluate_list(expression: &str, input: &Value, scope: &Scope) -> Result<Vec<Value>> {
    match evaluate(expression, input, scope, true)? {
        Value::Array(items) => Ok(items),
        other => Err(Error::TypeMismatch {
            expression: expression.to_string(),
            expected: "array",
            actual: type_name(&other),
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Compile and run one jq program. Scope keys become global `$` variables.
fn run_program(program: &str, input: &Value, scope: &Scope) -> Result<Value> {
    use jaq_core::{
        compile::Compiler,
        load::{Arena, File, Loader},
        Ctx, RcIter,
    };

    let arena = Arena::default();
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let file: File<_, ()> = File {
        path: (),
        code: program,
    };

    let modules = loader.load(&arena, file).map_err(|errs| Error::JqLoad {
        expression: program.to_string(),
        errors: format!("{errs:?}"),
    })?;

    let var_names: Vec<String> = scope.keys().map(|key| format!("${key}")).collect();
    let compiler = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .with_global_vars(var_names.iter().map(String::as_str));
    let filter = compiler.compile(modules).map_err(|errs| Error::JqCompile {
        expression: program.to_string(),
        errors: format!("{errs:?}"),
    })?;

    let var_values: Vec<Val> = scope.values().map(|value| Val::from(value.clone())).collect();
    let inputs = RcIter::new(core::iter::empty());
    let mut results: Vec<_> = filter
        .run((Ctx::new(var_values, &inputs), Val::from(input.clone())))
        .collect();

    if results.is_empty() {
        return Ok(Value::Null);
    }
    match results.remove(0) {
        Ok(val) => Ok(val.into()),
        Err(e) => Err(Error::JqEvaluation {
            expression: program.to_string(),
            message: format!("{e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope_with(entries: &[(&str, Value)]) -> Scope {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_literal_string_passes_through() {
        let result = evaluate("plain text", &json!({}), &Scope::new(), false).unwrap();
        assert_eq!(result, json!("plain text"));
    }

    #[test]
    fn test_wrapped_expression_field_access() {
        let result = evaluate(
            "${ .user.name }",
            &json!({"user": {"name": "ada"}}),
            &Scope::new(),
            false,
        )
        .unwrap();
        assert_eq!(result, json!("ada"));
    }

    #[test]
    fn test_force_accepts_bare_program() {
        let result = evaluate(".count + 1", &json!({"count": 2}), &Scope::new(), true).unwrap();
        assert_eq!(result, json!(3));
    }

    #[test]
    fn test_scope_variables() {
        let scope = scope_with(&[
            ("context", json!({"tenant": "acme"})),
            ("item", json!("blue")),
        ]);
        let result = evaluate(
            "${ {tenant: $context.tenant, color: $item} }",
            &json!(null),
            &scope,
            false,
        )
        .unwrap();
        assert_eq!(result, json!({"tenant": "acme", "color": "blue"}));
    }

    #[test]
    fn test_pipeline_and_map() {
        let result = evaluate(
            "${ .items | map(. * 2) }",
            &json!({"items": [1, 2, 3]}),
            &Scope::new(),
            false,
        )
        .unwrap();
        assert_eq!(result, json!([2, 4, 6]));
    }

    #[test]
    fn test_string_concatenation() {
        let result = evaluate(
            r#"${ "Hello, " + .name }"#,
            &json!({"name": "world"}),
            &Scope::new(),
            false,
        )
        .unwrap();
        assert_eq!(result, json!("Hello, world"));
    }

    #[test]
    fn test_template_preserves_structure() {
        let template = json!({
            "greeting": "${ \"hi \" + .name }",
            "fixed": "not an expression",
            "nested": {"n": "${ .count }"},
            "list": ["${ .name }", 42]
        });
        let result = evaluate_template(
            &template,
            &json!({"name": "ada", "count": 7}),
            &Scope::new(),
        )
        .unwrap();
        assert_eq!(
            result,
            json!({
                "greeting": "hi ada",
                "fixed": "not an expression",
                "nested": {"n": 7},
                "list": ["ada", 42]
            })
        );
    }

    #[test]
    fn test_evaluate_bool_rejects_non_boolean() {
        let err = evaluate_bool(".name", &json!({"name": "x"}), &Scope::new()).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        assert!(evaluate_bool(". == \"task\"", &json!("task"), &Scope::new()).unwrap());
    }

    #[test]
    fn test_evaluate_list() {
        let items = evaluate_list("${ .colors }", &json!({"colors": ["r", "g"]}), &Scope::new())
            .unwrap();
        assert_eq!(items, vec![json!("r"), json!("g")]);
        assert!(evaluate_list("${ .colors }", &json!({}), &Scope::new()).is_err());
    }

    #[test]
    fn test_invalid_program_is_reported() {
        let err = evaluate("${ .[[ }", &json!({}), &Scope::new(), false).unwrap_err();
        assert!(matches!(err, Error::JqLoad { .. } | Error::JqCompile { .. }));
    }
}
