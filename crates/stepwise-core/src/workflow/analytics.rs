//! Aggregate view over stored executions.

use std::collections::BTreeMap;

use serde::Serialize;
use stepwise_types::workflow::{Execution, ExecutionStatus, StepStatus};

/// Status distribution and timings for a set of executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionAnalytics {
    pub total: usize,
    /// Count per status name; every status appears, zero or not.
    pub by_status: BTreeMap<String, usize>,
    /// Pending, running or waiting.
    pub active: usize,
    pub completed: usize,
    /// Failed or timed out.
    pub failed: usize,
    /// Mean wall-clock time of completed executions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_duration_secs: Option<f64>,
    /// Failed step results per step id.
    pub failed_steps: BTreeMap<String, usize>,
}

const ALL_STATUSES: [ExecutionStatus; 7] = [
    ExecutionStatus::Pending,
    ExecutionStatus::Running,
    ExecutionStatus::Waiting,
    ExecutionStatus::Completed,
    ExecutionStatus::Failed,
    ExecutionStatus::Cancelled,
    ExecutionStatus::Timeout,
];

pub fn summarize<'a>(executions: impl IntoIterator<Item = &'a Execution>) -> ExecutionAnalytics {
    let mut analytics = ExecutionAnalytics {
        by_status: ALL_STATUSES
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect(),
        ..ExecutionAnalytics::default()
    };
    let mut durations = Vec::new();

    for execution in executions {
        analytics.total += 1;
        *analytics
            .by_status
            .entry(execution.status.as_str().to_string())
            .or_default() += 1;
        match execution.status {
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Waiting => {
                analytics.active += 1;
            }
            ExecutionStatus::Completed => {
                analytics.completed += 1;
                if let (Some(started), Some(finished)) = (execution.started_at, execution.completed_at) {
                    durations.push((finished - started).num_milliseconds() as f64 / 1000.0);
                }
            }
            ExecutionStatus::Failed | ExecutionStatus::Timeout => analytics.failed += 1,
            ExecutionStatus::Cancelled => {}
        }
        for result in execution.step_results.values() {
            if result.status == StepStatus::Failed {
                *analytics.failed_steps.entry(result.step_id.clone()).or_default() += 1;
            }
        }
    }

    if !durations.is_empty() {
        analytics.average_duration_secs = Some(durations.iter().sum::<f64>() / durations.len() as f64);
    }
    analytics
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use stepwise_types::workflow::{StepDefinition, StepResult, UserContext, WorkflowDefinition};

    fn execution(status: ExecutionStatus) -> Execution {
        let def = WorkflowDefinition::new("wf", vec![StepDefinition::new("a", "trigger")]);
        let mut execution = Execution::pending(def, json!({}), UserContext::default(), None);
        execution.status = status;
        execution
    }

    #[test]
    fn test_empty_set() {
        let analytics = summarize(&Vec::<Execution>::new());
        assert_eq!(analytics.total, 0);
        assert_eq!(analytics.by_status.len(), 7);
        assert!(analytics.by_status.values().all(|n| *n == 0));
        assert_eq!(analytics.average_duration_secs, None);
    }

    #[test]
    fn test_counts_and_average_duration() {
        let now = Utc::now();
        let mut fast = execution(ExecutionStatus::Completed);
        fast.started_at = Some(now);
        fast.completed_at = Some(now + Duration::seconds(2));
        let mut slow = execution(ExecutionStatus::Completed);
        slow.started_at = Some(now);
        slow.completed_at = Some(now + Duration::seconds(4));

        let mut failed = execution(ExecutionStatus::Failed);
        let mut broken = StepResult::running("a");
        broken.status = StepStatus::Failed;
        broken.error = Some("boom".to_string());
        failed.step_results.insert("a".to_string(), broken);

        let executions = vec![
            fast,
            slow,
            failed,
            execution(ExecutionStatus::Timeout),
            execution(ExecutionStatus::Waiting),
            execution(ExecutionStatus::Cancelled),
        ];
        let analytics = summarize(&executions);

        assert_eq!(analytics.total, 6);
        assert_eq!(analytics.completed, 2);
        assert_eq!(analytics.failed, 2);
        assert_eq!(analytics.active, 1);
        assert_eq!(analytics.by_status["cancelled"], 1);
        assert_eq!(analytics.by_status["timeout"], 1);
        assert_eq!(analytics.average_duration_secs, Some(3.0));
        assert_eq!(analytics.failed_steps["a"], 1);
    }
}
