//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts JSON/YAML documents into `WorkflowDefinition`, validates
//! structural constraints (unique step IDs, known dependencies, trigger rules,
//! acyclic graph), and provides discovery for definition files on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use stepwise_types::workflow::{TRIGGER_DATA_KEY, TRIGGER_STEP_TYPE, WorkflowDefinition};
use thiserror::Error;

use super::condition::ConditionEvaluator;
use super::dag::validate_dag;
use super::registry::{RESUME_SIGNAL_KEY, StepRegistry};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// A step uses a type with no registered handler.
    #[error("step '{step_id}' uses unregistered step type '{step_type}'")]
    UnknownStepType { step_id: String, step_type: String },

    /// A second write to a step's output slot.
    #[error("output for step '{0}' is already recorded")]
    OutputAlreadyRecorded(String),

    /// Execution context serialization or size failure.
    #[error("context error: {0}")]
    ContextError(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - ID is non-empty and at least one step exists
/// - All step IDs are non-empty, unique, and not the reserved trigger key
/// - All dependencies point to existing step IDs
/// - At most one `trigger` step, and it has no dependencies
/// - Timeouts > 0 if set
/// - The dependency graph is acyclic
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.step_id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step_id must not be empty".to_string(),
            ));
        }
        if step.step_id == TRIGGER_DATA_KEY {
            return Err(WorkflowError::ValidationError(format!(
                "step_id '{TRIGGER_DATA_KEY}' is reserved for the trigger payload"
            )));
        }
        if step.input_mapping.contains_key(RESUME_SIGNAL_KEY) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' maps input '{RESUME_SIGNAL_KEY}', which is reserved for resume signals",
                step.step_id
            )));
        }
        if !seen_ids.insert(step.step_id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.step_id
            )));
        }
    }

    for step in &def.steps {
        for dep in &step.dependencies {
            if !seen_ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.step_id, dep
                )));
            }
        }
    }

    let triggers: Vec<_> = def
        .steps
        .iter()
        .filter(|s| s.step_type == TRIGGER_STEP_TYPE)
        .collect();
    if triggers.len() > 1 {
        return Err(WorkflowError::ValidationError(
            "workflow must not include more than one 'trigger' step".to_string(),
        ));
    }
    if let Some(trigger) = triggers.first() {
        if !trigger.dependencies.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "trigger step '{}' must not have dependencies",
                trigger.step_id
            )));
        }
    }

    if def.timeout_secs == Some(0) {
        return Err(WorkflowError::ValidationError(
            "timeout must be > 0".to_string(),
        ));
    }
    if let Some(step) = def.steps.iter().find(|s| s.timeout_secs == Some(0)) {
        return Err(WorkflowError::ValidationError(format!(
            "step '{}' timeout must be > 0",
            step.step_id
        )));
    }

    validate_dag(&def.steps)
}

/// Reject steps whose type has no registered handler.
pub fn validate_step_types(
    def: &WorkflowDefinition,
    registry: &StepRegistry,
) -> Result<(), WorkflowError> {
    for step in &def.steps {
        if !registry.contains(&step.step_type) {
            return Err(WorkflowError::UnknownStepType {
                step_id: step.step_id.clone(),
                step_type: step.step_type.clone(),
            });
        }
    }
    Ok(())
}

/// Conditions that will not parse. They evaluate to `false` at runtime, so
/// these are warnings rather than errors.
pub fn condition_warnings(def: &WorkflowDefinition) -> Vec<String> {
    def.steps
        .iter()
        .filter_map(|step| {
            let condition = step.condition.as_deref()?;
            ConditionEvaluator::parse(condition)
                .err()
                .map(|e| format!("step '{}': {e}", step.step_id))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a `.json`, `.yaml` or `.yml` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Save a workflow definition as YAML.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow definition files under `base_dir`.
///
/// Scans recursively for `.json`, `.yaml` and `.yml` files. Files that fail
/// to parse are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if matches!(ext, "json" | "yaml" | "yml") {
                match load_workflow_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(err) => {
                        tracing::warn!(?path, error = %err, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_types::workflow::StepDefinition;

    fn step(id: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition::new(id, "noop").depends_on(deps.iter().copied())
    }

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition::new("test-flow", steps)
    }

    #[test]
    fn test_valid_definition_passes() {
        let def = workflow(vec![
            StepDefinition::new("trigger", "trigger"),
            step("a", &["trigger"]),
            step("b", &["a"]),
        ]);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_empty_steps_rejected() {
        let err = validate_definition(&workflow(vec![])).unwrap_err();
        assert!(matches!(err, WorkflowError::ValidationError(_)));
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let def = workflow(vec![step("a", &[]), step("a", &[])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn test_reserved_step_id_rejected() {
        let def = workflow(vec![step(TRIGGER_DATA_KEY, &[])]);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_reserved_input_key_rejected() {
        let def = workflow(vec![
            StepDefinition::new("approval", "human_approval").map_input(RESUME_SIGNAL_KEY, "trigger.verdict"),
        ]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("reserved for resume signals"), "{err}");
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let def = workflow(vec![step("a", &["ghost"])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency(_)));
    }

    #[test]
    fn test_cycle_rejected() {
        let def = workflow(vec![step("a", &["b"]), step("b", &["a"])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn test_two_triggers_rejected() {
        let def = workflow(vec![
            StepDefinition::new("t1", "trigger"),
            StepDefinition::new("t2", "trigger"),
        ]);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_trigger_with_dependencies_rejected() {
        let def = workflow(vec![
            step("a", &[]),
            StepDefinition::new("trigger", "trigger").depends_on(["a"]),
        ]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("must not have dependencies"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut def = workflow(vec![step("a", &[])]);
        def.timeout_secs = Some(0);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_parse_json_and_yaml_agree() {
        let json = r#"{
            "id": "greet",
            "steps": [
                {"step_id": "trigger", "step_type": "trigger"},
                {"step_id": "hello", "step_type": "prompt_template",
                 "dependencies": ["trigger"],
                 "parameters": {"template": "Hello {{ name }}"}}
            ]
        }"#;
        let yaml = r#"
id: greet
steps:
  - step_id: trigger
    step_type: trigger
  - step_id: hello
    step_type: prompt_template
    dependencies: [trigger]
    parameters:
      template: "Hello {{ name }}"
"#;
        let from_json = parse_workflow_json(json).unwrap();
        let from_yaml = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(from_json, from_yaml);
    }

    #[test]
    fn test_parse_rejects_invalid_document() {
        let err = parse_workflow_yaml("id: [unterminated").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn test_condition_warnings_reports_malformed_only() {
        let def = workflow(vec![
            step("a", &[]).when("a.output.ok == true"),
            step("b", &["a"]).when("a.output.ok ==="),
        ]);
        let warnings = condition_warnings(&def);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("step 'b'"));
    }

    #[test]
    fn test_save_load_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        let def = workflow(vec![StepDefinition::new("trigger", "trigger"), step("a", &["trigger"])]);

        let path = dir.path().join("nested").join("flow.yaml");
        save_workflow_file(&path, &def).unwrap();
        std::fs::write(dir.path().join("broken.yml"), "steps: 12").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a workflow").unwrap();

        let loaded = load_workflow_file(&path).unwrap();
        assert_eq!(loaded, def);

        let found = discover_workflows(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.id, "test-flow");
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let found = discover_workflows(Path::new("/definitely/not/here")).unwrap();
        assert!(found.is_empty());
    }
}
