//! Built-in step handlers and their registration.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use stepwise_types::config::EngineConfig;
use stepwise_types::workflow::{StepDefinition, TRIGGER_STEP_TYPE, VariableDefinition};

use crate::repository::approval::ApprovalRepository;

use super::approval::{ApprovalService, HumanApprovalHandler};
use super::context::ExecutionContext;
use super::registry::{
    RegistryError, StepCharacteristics, StepError, StepHandler, StepOutcome, StepRegistry,
};
use super::subflow::SubflowHandler;
use super::variables::{InjectOptions, inject, lookup_path, resolve_variable_definitions};

/// Register every built-in step type.
pub fn register_builtin_steps<A: ApprovalRepository + 'static>(
    registry: &mut StepRegistry,
    approvals: Arc<ApprovalService<A>>,
    config: &EngineConfig,
) -> Result<(), RegistryError> {
    registry.register(
        TRIGGER_STEP_TYPE,
        TriggerStep,
        StepCharacteristics::synchronous("Expose the trigger payload to downstream steps"),
    )?;
    registry.register(
        "data_input",
        DataInputStep,
        StepCharacteristics::synchronous("Emit static data and resolved variables"),
    )?;
    registry.register(
        "data_merge",
        DataMergeStep,
        StepCharacteristics::synchronous("Shallow-merge the objects in the step input"),
    )?;
    registry.register(
        "prompt_template",
        PromptTemplateStep,
        StepCharacteristics::synchronous("Render a text template"),
    )?;
    registry.register(
        "delay",
        DelayStep,
        StepCharacteristics::long_running("Sleep for a fixed duration"),
    )?;
    registry.register(
        "human_approval",
        HumanApprovalHandler::new(approvals, config.approval_timeout_policy),
        StepCharacteristics::suspendable("Wait for a human decision"),
    )?;
    registry.register(
        "subflow",
        SubflowHandler::new(config.max_subflow_depth),
        StepCharacteristics::suspendable("Run another workflow as one step"),
    )?;
    Ok(())
}

fn variable_definitions(step: &StepDefinition) -> Result<Vec<VariableDefinition>, StepError> {
    match step.parameters.get("variables") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| StepError::InvalidParameters(format!("'variables': {e}"))),
    }
}

// ---------------------------------------------------------------------------
// trigger
// ---------------------------------------------------------------------------

/// Object payloads pass through as-is; scalars land under `value`.
pub struct TriggerStep;

impl StepHandler for TriggerStep {
    async fn execute(
        &self,
        _step: &StepDefinition,
        _input: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let output = match ctx.trigger_data() {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other.clone());
                wrapped
            }
        };
        Ok(StepOutcome::completed(output))
    }
}

// ---------------------------------------------------------------------------
// data_input
// ---------------------------------------------------------------------------

pub struct DataInputStep;

impl StepHandler for DataInputStep {
    async fn execute(
        &self,
        step: &StepDefinition,
        input: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let mut output = match step.parameters.get("data") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(data)) => data.clone(),
            Some(_) => {
                return Err(StepError::InvalidParameters(
                    "'data' must be an object".to_string(),
                ));
            }
        };
        output.extend(resolve_variable_definitions(
            &variable_definitions(step)?,
            ctx,
            &input,
        ));
        Ok(StepOutcome::completed(output))
    }
}

// ---------------------------------------------------------------------------
// data_merge
// ---------------------------------------------------------------------------

/// Later keys win. Non-object inputs are kept under their own key.
pub struct DataMergeStep;

impl StepHandler for DataMergeStep {
    async fn execute(
        &self,
        _step: &StepDefinition,
        input: Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let mut merged = Map::new();
        for (key, value) in input {
            match value {
                Value::Object(fields) => merged.extend(fields),
                other => {
                    merged.insert(key, other);
                }
            }
        }
        Ok(StepOutcome::completed(merged))
    }
}

// ---------------------------------------------------------------------------
// prompt_template
// ---------------------------------------------------------------------------

pub struct PromptTemplateStep;

impl StepHandler for PromptTemplateStep {
    async fn execute(
        &self,
        step: &StepDefinition,
        input: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let template = step
            .parameters
            .get("template")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::InvalidParameters("'template' is required".to_string()))?;

        let mut variables = input.clone();
        variables.extend(resolve_variable_definitions(
            &variable_definitions(step)?,
            ctx,
            &input,
        ));
        let text = inject(template, &variables, Some(ctx), &InjectOptions::default());

        let mut rendered = Map::new();
        rendered.insert("text".to_string(), json!(text));
        let output = match &step.output_mapping {
            Some(mapping) => {
                let root = Value::Object(rendered);
                mapping
                    .iter()
                    .filter_map(|(key, path)| {
                        let segments: Vec<&str> = path.split('.').collect();
                        lookup_path(&root, &segments).map(|v| (key.clone(), v.clone()))
                    })
                    .collect()
            }
            None => rendered,
        };
        Ok(StepOutcome::completed(output))
    }
}

// ---------------------------------------------------------------------------
// delay
// ---------------------------------------------------------------------------

pub struct DelayStep;

impl StepHandler for DelayStep {
    async fn execute(
        &self,
        step: &StepDefinition,
        _input: Map<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let duration_ms = match step.parameters.get("duration_ms") {
            None => 0,
            Some(value) => value.as_u64().ok_or_else(|| {
                StepError::InvalidParameters("'duration_ms' must be a non-negative integer".to_string())
            })?,
        };
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        let mut output = Map::new();
        output.insert("delayed_ms".to_string(), json!(duration_ms));
        Ok(StepOutcome::completed(output))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryApprovalRepository;
    use stepwise_types::workflow::{StepStatus, UserContext, WorkflowDefinition};
    use uuid::Uuid;

    fn context(trigger: Value) -> ExecutionContext {
        let def = WorkflowDefinition::new("w", vec![StepDefinition::new("t", "trigger")]);
        ExecutionContext::new(Uuid::now_v7(), Arc::new(def), trigger, UserContext::default())
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_register_builtin_steps() {
        let mut registry = StepRegistry::new();
        let approvals = Arc::new(ApprovalService::new(Arc::new(InMemoryApprovalRepository::new())));
        register_builtin_steps(&mut registry, approvals, &EngineConfig::default()).unwrap();

        let names: Vec<&str> = registry.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "data_input",
                "data_merge",
                "delay",
                "human_approval",
                "prompt_template",
                "subflow",
                "trigger"
            ]
        );
    }

    #[tokio::test]
    async fn test_trigger_wraps_scalars() {
        let step = StepDefinition::new("t", "trigger");
        let outcome = TriggerStep
            .execute(&step, Map::new(), &context(json!("hello")))
            .await
            .unwrap();
        assert_eq!(Value::Object(outcome.output_data), json!({"value": "hello"}));

        let outcome = TriggerStep
            .execute(&step, Map::new(), &context(json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(Value::Object(outcome.output_data), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_data_input_merges_variables() {
        let step = StepDefinition::new("d", "data_input")
            .param("data", json!({"static": true}))
            .param(
                "variables",
                json!([
                    {"name": "who", "source": "trigger_data.user"},
                    {"name": "lang", "source": "trigger_data.lang", "default_value": "en"}
                ]),
            );
        let outcome = DataInputStep
            .execute(&step, Map::new(), &context(json!({"user": "ana"})))
            .await
            .unwrap();
        assert_eq!(
            Value::Object(outcome.output_data),
            json!({"static": true, "who": "ana", "lang": "en"})
        );
    }

    #[tokio::test]
    async fn test_data_merge_later_keys_win() {
        let step = StepDefinition::new("m", "data_merge");
        let input = object(json!({
            "a": {"x": 1, "y": 1},
            "b": {"y": 2},
            "c": 3
        }));
        let outcome = DataMergeStep
            .execute(&step, input, &context(json!({})))
            .await
            .unwrap();
        assert_eq!(
            Value::Object(outcome.output_data),
            json!({"x": 1, "y": 2, "c": 3})
        );
    }

    #[tokio::test]
    async fn test_prompt_template_renders_input_and_context() {
        let step = StepDefinition::new("p", "prompt_template")
            .param("template", json!("Hi {{ name }}, re: {{ trigger_data.subject }}"));
        let outcome = PromptTemplateStep
            .execute(
                &step,
                object(json!({"name": "Ana"})),
                &context(json!({"subject": "invoice"})),
            )
            .await
            .unwrap();
        assert_eq!(outcome.output_data["text"], "Hi Ana, re: invoice");
    }

    #[tokio::test]
    async fn test_prompt_template_output_mapping() {
        let step = StepDefinition::new("p", "prompt_template")
            .param("template", json!("{{ word }}"))
            .map_output("greeting", "text");
        let outcome = PromptTemplateStep
            .execute(&step, object(json!({"word": "hey"})), &context(json!({})))
            .await
            .unwrap();
        assert_eq!(Value::Object(outcome.output_data), json!({"greeting": "hey"}));
    }

    #[tokio::test]
    async fn test_prompt_template_requires_template() {
        let step = StepDefinition::new("p", "prompt_template");
        let err = PromptTemplateStep
            .execute(&step, Map::new(), &context(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_delay_reports_duration() {
        let step = StepDefinition::new("d", "delay").param("duration_ms", json!(5));
        let outcome = DelayStep
            .execute(&step, Map::new(), &context(json!({})))
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Completed);
        assert_eq!(outcome.output_data["delayed_ms"], 5);
    }
}
