//! Variable resolution and `{{ name }}` template injection.
//!
//! Everything here is a pure function of its inputs and an execution context
//! snapshot (built-in time/uuid variables aside). Path syntax is dotted:
//! `<root>.<field>.<nested>`, where `<root>` is looked up in `step_io_data`
//! first and in the handler's `input_data` second.

use std::collections::BTreeMap;

use chrono::{Datelike, Utc};
use serde_json::{Map, Value};
use stepwise_types::workflow::VariableDefinition;
use uuid::Uuid;

use super::context::ExecutionContext;

/// Names resolved without any data source.
pub const BUILTIN_VARIABLES: &[&str] = &[
    "current_time",
    "current_date",
    "current_timestamp",
    "current_year",
    "current_month",
    "current_day",
    "uuid",
    "execution_id",
];

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Walk `segments` through nested objects. Absent if a segment is missing or
/// an intermediate value is not an object.
pub fn lookup_path<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |current, segment| current.as_object()?.get(*segment))
}

/// Resolve a dotted `source_path` against the context and the handler input.
///
/// The first segment names a step output (or the reserved trigger key); when
/// no such output exists it is looked up in `input_data`. A bare name returns
/// the whole value.
pub fn resolve(
    source_path: &str,
    ctx: &ExecutionContext,
    input_data: &Map<String, Value>,
) -> Option<Value> {
    let mut segments = source_path.split('.');
    let head = segments.next().filter(|s| !s.is_empty())?;
    let rest: Vec<&str> = segments.collect();

    let root = ctx
        .get_step_output(head)
        .or_else(|| input_data.get(head))?;
    lookup_path(root, &rest).cloned()
}

/// Resolve a dotted path inside a plain JSON map.
fn resolve_in_map(path: &str, map: &Map<String, Value>) -> Option<Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let rest: Vec<&str> = segments.collect();
    lookup_path(map.get(head)?, &rest).cloned()
}

/// Resolve every entry of an input/output mapping. Absent sources are omitted.
pub fn resolve_mapping(
    mapping: &BTreeMap<String, String>,
    ctx: &ExecutionContext,
    input_data: &Map<String, Value>,
) -> Map<String, Value> {
    mapping
        .iter()
        .filter_map(|(key, source)| match resolve(source, ctx, input_data) {
            Some(value) => Some((key.clone(), value)),
            None => {
                tracing::debug!(
                    execution_id = %ctx.execution_id(),
                    key = key.as_str(),
                    source = source.as_str(),
                    "mapping source not found, omitting"
                );
                None
            }
        })
        .collect()
}

/// Resolve a list of variable definitions into a name -> value map.
///
/// A definition whose source is absent (or missing) falls back to its
/// default; with no default the name is left out.
pub fn resolve_variable_definitions(
    definitions: &[VariableDefinition],
    ctx: &ExecutionContext,
    input_data: &Map<String, Value>,
) -> Map<String, Value> {
    let mut resolved = Map::new();
    for def in definitions {
        let value = def
            .source
            .as_deref()
            .and_then(|source| resolve(source, ctx, input_data))
            .or_else(|| def.default_value.clone());
        if let Some(value) = value {
            resolved.insert(def.name.clone(), value);
        }
    }
    resolved
}

// ---------------------------------------------------------------------------
// Template injection
// ---------------------------------------------------------------------------

/// Controls what happens to placeholders nothing resolves.
#[derive(Debug, Clone)]
pub struct InjectOptions {
    /// Keep `{{ name }}` intact so a later stage can resolve it.
    pub preserve_unresolved: bool,
    /// Substituted for unresolved names; takes precedence over preserving.
    pub default: Option<String>,
}

impl Default for InjectOptions {
    fn default() -> Self {
        Self {
            preserve_unresolved: true,
            default: None,
        }
    }
}

impl InjectOptions {
    /// Replace unresolved placeholders with an empty string.
    pub fn strict() -> Self {
        Self {
            preserve_unresolved: false,
            default: None,
        }
    }
}

/// A placeholder located in a template.
struct Placeholder<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

fn is_variable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Scan a template for well-formed `{{ name }}` placeholders, in order.
fn placeholders(template: &str) -> Vec<Placeholder<'_>> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some(open) = template[cursor..].find("{{") {
        let start = cursor + open;
        let Some(close) = template[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        let name = template[start + 2..end - 2].trim();
        if is_variable_name(name) {
            found.push(Placeholder { start, end, name });
            cursor = end;
        } else {
            cursor = start + 2;
        }
    }
    found
}

/// Placeholder names in order of appearance, duplicates kept.
pub fn extract_variables(template: &str) -> Vec<String> {
    placeholders(template)
        .into_iter()
        .map(|p| p.name.to_string())
        .collect()
}

/// Replace `{{ name }}` placeholders in `template`.
///
/// Each name resolves, in order, from: `variables`, the execution context
/// (step outputs and trigger data), workflow-global variables, built-ins.
/// Substituted text is not re-scanned.
pub fn inject(
    template: &str,
    variables: &Map<String, Value>,
    ctx: Option<&ExecutionContext>,
    options: &InjectOptions,
) -> String {
    let found = placeholders(template);
    if found.is_empty() {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for placeholder in found {
        out.push_str(&template[last..placeholder.start]);
        match lookup_variable(placeholder.name, variables, ctx) {
            Some(value) => out.push_str(&value_to_string(&value)),
            None => {
                if let Some(default) = &options.default {
                    out.push_str(default);
                } else if options.preserve_unresolved {
                    out.push_str(&template[placeholder.start..placeholder.end]);
                }
            }
        }
        last = placeholder.end;
    }
    out.push_str(&template[last..]);
    out
}

/// `inject` over an optional template; `None` stays `None`.
pub fn inject_opt(
    template: Option<&str>,
    variables: &Map<String, Value>,
    ctx: Option<&ExecutionContext>,
    options: &InjectOptions,
) -> Option<String> {
    template.map(|t| inject(t, variables, ctx, options))
}

/// Inject into every string nested inside a JSON value.
pub fn inject_json(
    value: &Value,
    variables: &Map<String, Value>,
    ctx: Option<&ExecutionContext>,
    options: &InjectOptions,
) -> Value {
    match value {
        Value::String(s) => Value::String(inject(s, variables, ctx, options)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| inject_json(v, variables, ctx, options))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), inject_json(v, variables, ctx, options)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup_variable(
    name: &str,
    variables: &Map<String, Value>,
    ctx: Option<&ExecutionContext>,
) -> Option<Value> {
    if let Some(value) = resolve_in_map(name, variables) {
        return Some(value);
    }
    if let Some(ctx) = ctx {
        if let Some(value) = resolve(name, ctx, &Map::new()) {
            return Some(value);
        }
        if let Some(value) = resolve_in_map(name, ctx.variables()) {
            return Some(value);
        }
    }
    builtin_variable(name, ctx)
}

fn builtin_variable(name: &str, ctx: Option<&ExecutionContext>) -> Option<Value> {
    let now = Utc::now();
    let value = match name {
        "current_time" => Value::String(now.to_rfc3339()),
        "current_date" => Value::String(now.format("%Y-%m-%d").to_string()),
        "current_timestamp" => Value::from(now.timestamp()),
        "current_year" => Value::from(now.year()),
        "current_month" => Value::from(now.month()),
        "current_day" => Value::from(now.day()),
        "uuid" => Value::String(Uuid::now_v7().to_string()),
        "execution_id" => Value::String(ctx?.execution_id().to_string()),
        _ => return None,
    };
    Some(value)
}

/// Convert a JSON value to its template form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use stepwise_types::workflow::{StepDefinition, UserContext, WorkflowDefinition};

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn test_context() -> ExecutionContext {
        let mut def = WorkflowDefinition::new("vars", vec![StepDefinition::new("a", "noop")]);
        def.variables = obj(json!({"team": "platform", "limits": {"max": 3}}));
        let mut ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Arc::new(def),
            json!({"user": {"name": "Ada"}, "current_message": "hello"}),
            UserContext::default(),
        );
        ctx.set_step_output("fetch", obj(json!({"body": {"items": [1, 2]}, "count": 2})))
            .unwrap();
        ctx
    }

    // -----------------------------------------------------------------------
    // resolve
    // -----------------------------------------------------------------------

    #[test]
    fn test_resolve_dotted_step_path() {
        let ctx = test_context();
        let input = Map::new();
        assert_eq!(resolve("fetch.count", &ctx, &input), Some(json!(2)));
        assert_eq!(resolve("fetch.body.items", &ctx, &input), Some(json!([1, 2])));
        assert_eq!(resolve("trigger_data.user.name", &ctx, &input), Some(json!("Ada")));
    }

    #[test]
    fn test_resolve_missing_segment_or_non_map_is_absent() {
        let ctx = test_context();
        let input = Map::new();
        assert_eq!(resolve("fetch.missing", &ctx, &input), None);
        assert_eq!(resolve("fetch.count.deeper", &ctx, &input), None);
        assert_eq!(resolve("ghost.field", &ctx, &input), None);
        assert_eq!(resolve("", &ctx, &input), None);
    }

    #[test]
    fn test_resolve_bare_name_prefers_step_output_then_input() {
        let ctx = test_context();
        let input = obj(json!({"fetch": "shadowed", "local": 7}));
        assert_eq!(resolve("fetch", &ctx, &input).unwrap()["count"], 2);
        assert_eq!(resolve("local", &ctx, &input), Some(json!(7)));
        assert_eq!(resolve("nowhere", &ctx, &input), None);
    }

    #[test]
    fn test_resolve_dotted_falls_back_to_input_data() {
        let ctx = test_context();
        let input = obj(json!({"messages": {"current_message": "hi there"}}));
        assert_eq!(
            resolve("messages.current_message", &ctx, &input),
            Some(json!("hi there"))
        );
    }

    #[test]
    fn test_resolve_mapping_omits_missing_sources() {
        let ctx = test_context();
        let mapping = BTreeMap::from([
            ("count".to_string(), "fetch.count".to_string()),
            ("missing".to_string(), "fetch.nope".to_string()),
        ]);
        let resolved = resolve_mapping(&mapping, &ctx, &Map::new());
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["count"], 2);
    }

    #[test]
    fn test_variable_definitions_use_defaults() {
        let ctx = test_context();
        let defs = vec![
            VariableDefinition {
                name: "who".to_string(),
                source: Some("trigger_data.user.name".to_string()),
                default_value: Some(json!("anonymous")),
            },
            VariableDefinition {
                name: "lang".to_string(),
                source: Some("trigger_data.lang".to_string()),
                default_value: Some(json!("en")),
            },
            VariableDefinition {
                name: "dropped".to_string(),
                source: Some("trigger_data.nothing".to_string()),
                default_value: None,
            },
        ];
        let resolved = resolve_variable_definitions(&defs, &ctx, &Map::new());
        assert_eq!(resolved["who"], "Ada");
        assert_eq!(resolved["lang"], "en");
        assert!(!resolved.contains_key("dropped"));
    }

    // -----------------------------------------------------------------------
    // extract_variables / inject
    // -----------------------------------------------------------------------

    #[test]
    fn test_extract_variables_in_order_with_duplicates() {
        let names = extract_variables("{{a}} and {{ b.c }} then {{a}} {{ not valid }}");
        assert_eq!(names, vec!["a", "b.c", "a"]);
        assert!(extract_variables("no placeholders").is_empty());
    }

    #[test]
    fn test_inject_custom_variables_and_spacing() {
        let vars = obj(json!({"name": "Ada", "n": 3, "ok": true}));
        let out = inject(
            "Hi {{name}}, {{ n }} items, ok={{ok}}",
            &vars,
            None,
            &InjectOptions::default(),
        );
        assert_eq!(out, "Hi Ada, 3 items, ok=true");
    }

    #[test]
    fn test_inject_preserve_vs_strict() {
        let vars = Map::new();
        let template = "Hello {{ missing }}!";
        assert_eq!(
            inject(template, &vars, None, &InjectOptions::default()),
            "Hello {{ missing }}!"
        );
        assert_eq!(inject(template, &vars, None, &InjectOptions::strict()), "Hello !");
        let with_default = InjectOptions {
            preserve_unresolved: true,
            default: Some("friend".to_string()),
        };
        assert_eq!(inject(template, &vars, None, &with_default), "Hello friend!");
    }

    #[test]
    fn test_inject_resolution_precedence() {
        let ctx = test_context();
        let vars = obj(json!({"team": "override"}));
        let out = inject(
            "{{team}}/{{ fetch.count }}/{{ trigger_data.current_message }}/{{ limits.max }}",
            &vars,
            Some(&ctx),
            &InjectOptions::default(),
        );
        assert_eq!(out, "override/2/hello/3");
    }

    #[test]
    fn test_inject_builtins() {
        let ctx = test_context();
        let out = inject(
            "{{execution_id}}|{{current_date}}|{{current_year}}",
            &Map::new(),
            Some(&ctx),
            &InjectOptions::default(),
        );
        let parts: Vec<&str> = out.split('|').collect();
        assert_eq!(parts[0], ctx.execution_id().to_string());
        assert_eq!(parts[1].len(), 10);
        assert_eq!(parts[2], Utc::now().year().to_string());

        // execution_id needs a context
        let out = inject("{{execution_id}}", &Map::new(), None, &InjectOptions::default());
        assert_eq!(out, "{{execution_id}}");
    }

    #[test]
    fn test_inject_objects_render_as_json_and_are_not_rescanned() {
        let vars = obj(json!({"obj": {"k": 1}, "sneaky": "{{obj}}"}));
        let out = inject("{{obj}} {{sneaky}}", &vars, None, &InjectOptions::default());
        assert_eq!(out, r#"{"k":1} {{obj}}"#);
    }

    #[test]
    fn test_inject_leaves_no_placeholders_when_all_names_known() {
        let ctx = test_context();
        let template = "{{ a }} {{b}} {{ fetch.count }} {{ trigger_data.user.name }}";
        let vars = obj(json!({"a": 1, "b": "two"}));
        let out = inject(template, &vars, Some(&ctx), &InjectOptions::default());
        assert!(extract_variables(&out).is_empty(), "left: {out}");
    }

    #[test]
    fn test_inject_opt_and_json() {
        let vars = obj(json!({"x": "y"}));
        assert_eq!(inject_opt(None, &vars, None, &InjectOptions::default()), None);
        let value = inject_json(
            &json!({"a": "{{x}}", "b": ["{{x}}", 1], "c": null}),
            &vars,
            None,
            &InjectOptions::default(),
        );
        assert_eq!(value, json!({"a": "y", "b": ["y", 1], "c": null}));
    }

    #[test]
    fn test_unclosed_braces_left_alone() {
        let out = inject("{{ open", &Map::new(), None, &InjectOptions::strict());
        assert_eq!(out, "{{ open");
    }
}
