//! Cron-scheduled trigger node.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{NodeExecuteError, NodeInitError, NodeOutcome, WorkflowNode};
use crate::context::WorkflowContext;
use crate::definition::NodeDefinition;
use crate::message::ExecutionScope;

/// Parses its cron `Schedule` at initialize. Execution never sleeps: it
/// either triggers immediately (`TriggerOnStart`) or computes the next
/// occurrence relative to the last trigger and reports whether it fired.
/// The last trigger time lives in workflow variables so it survives
/// checkpoints.
#[derive(Default)]
pub struct TimerNode {
    node_id: String,
    schedule: Option<Schedule>,
    trigger_on_start: bool,
}

impl TimerNode {
    fn last_trigger_key(&self) -> String {
        format!("{}.lastTrigger", self.node_id)
    }
}

#[async_trait]
impl WorkflowNode for TimerNode {
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeInitError> {
        self.node_id = definition.node_id.clone();
        let expression =
            definition
                .config_str("Schedule")
                .ok_or_else(|| NodeInitError::MissingOption {
                    node_id: definition.node_id.clone(),
                    option: "Schedule".into(),
                })?;
        let schedule = Schedule::from_str(expression).map_err(|e| NodeInitError::BadOption {
            node_id: definition.node_id.clone(),
            option: "Schedule".into(),
            detail: e.to_string(),
        })?;
        self.schedule = Some(schedule);
        self.trigger_on_start = definition.config_bool("TriggerOnStart").unwrap_or(false);
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        _cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        let Some(schedule) = &self.schedule else {
            return Err(NodeExecuteError::Failed(
                "timer node was not initialized".into(),
            ));
        };

        let now = Utc::now();
        let key = self.last_trigger_key();

        if self.trigger_on_start && ctx.variable(&key).is_none() {
            ctx.set_variable(&key, Value::String(now.to_rfc3339()));
            scope.set_output("triggered", Value::Bool(true));
            scope.set_output("firedAt", Value::String(now.to_rfc3339()));
            return Ok(NodeOutcome::complete());
        }

        let last = ctx
            .variable(&key)
            .and_then(|v| v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| ctx.started_at());

        let next = schedule.after(&last).next();
        let triggered = next.is_some_and(|occurrence| occurrence <= now);
        if triggered {
            ctx.set_variable(&key, Value::String(now.to_rfc3339()));
        }
        scope.set_output("triggered", Value::Bool(triggered));
        if let Some(next) = next {
            scope.set_output("nextOccurrence", Value::String(next.to_rfc3339()));
        }
        Ok(NodeOutcome::complete())
    }
}
