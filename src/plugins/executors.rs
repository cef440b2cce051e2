//! Built-in executors
//!
//! **YAML Format:**
//! ```yaml
//! path: /restart-nginx
//! implementation: Shell
//! interval: 30s
//! fields:
//!   command: systemctl restart nginx
//!   conditions: /r/nginx/status.Active == false && tags.role == "web"
//!   low_threshold: 2
//!   high_threshold: 4
//! ```
//!
//! With the thresholds above the command runs on the 3rd and 4th consecutive
//! tick where the conditions hold, and not again until they fail once.

use super::command::{CommandOutput, CommandSpec};
use super::{Task, TaskContext};
use crate::error::Result;
use crate::query;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ShellFields {
    #[serde(flatten)]
    pub command: CommandSpec,
    /// Query gating the command; empty means always met
    #[serde(default)]
    pub conditions: String,
    /// The counter must exceed this before the command runs
    #[serde(default)]
    pub low_threshold: i64,
    /// The command stops running once the counter exceeds this; 0 disables the cap
    #[serde(default)]
    pub high_threshold: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ShellReport {
    conditions: String,
    counter: i64,
    executed: bool,
    #[serde(flatten)]
    result: Option<CommandOutput>,
}

/// Runs a command when its conditions have held long enough
pub struct Shell {
    fields: ShellFields,
    context: Option<TaskContext>,
    report: Option<ShellReport>,
}

impl Shell {
    pub fn new(fields: ShellFields) -> Self {
        Self {
            fields,
            context: None,
            report: None,
        }
    }

    fn within_thresholds(&self, counter: i64) -> bool {
        counter > self.fields.low_threshold
            && (self.fields.high_threshold == 0 || counter <= self.fields.high_threshold)
    }
}

#[async_trait]
impl Task for Shell {
    async fn run(&mut self) -> anyhow::Result<()> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("executor ran without context"))?;

        let conditions = self.fields.conditions.trim();
        let met = conditions.is_empty()
            || query::evaluate(conditions, &context.data, &context.tags, &context.host.name)?;

        let counter = if met {
            context.counters.incr(&context.path, 1)
        } else {
            context.counters.reset(&context.path);
            0
        };

        let executed = met && self.within_thresholds(counter);
        let result = if executed {
            Some(self.fields.command.run().await?)
        } else {
            None
        };

        self.report = Some(ShellReport {
            conditions: self.fields.conditions.clone(),
            counter,
            executed,
            result,
        });
        Ok(())
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        match &self.report {
            Some(report) => Ok(serde_json::to_vec(report)?),
            None => Ok(Vec::new()),
        }
    }

    fn set_context(&mut self, context: TaskContext) {
        self.context = Some(context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::statsd::StatsdRegistry;
    use crate::store::CounterStore;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn context(counters: Arc<CounterStore>, load: f64) -> TaskContext {
        let mut data = crate::plugins::DependencyData::new();
        data.insert(
            "/r/load".to_string(),
            json!({"Path": "/r/load", "Data": {"LoadAvg1m": load}}),
        );
        TaskContext {
            data,
            tags: Default::default(),
            counters,
            host: Host {
                name: "web1".to_string(),
                tags: Default::default(),
            },
            endpoint_url: String::new(),
            credential: String::new(),
            statsd: Arc::new(StatsdRegistry::default()),
            path: "/x/restart".to_string(),
        }
    }

    fn fields(low: i64, high: i64) -> ShellFields {
        serde_json::from_value(json!({
            "command": "echo restarted",
            "conditions": "/r/load.LoadAvg1m > 1",
            "low_threshold": low,
            "high_threshold": high,
        }))
        .unwrap()
    }

    async fn tick(counters: &Arc<CounterStore>, load: f64, low: i64, high: i64) -> Value {
        let mut task = Shell::new(fields(low, high));
        task.set_context(context(Arc::clone(counters), load));
        task.run().await.unwrap();
        serde_json::from_slice(&task.to_json().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_thresholds_gate_execution() {
        let counters = Arc::new(CounterStore::new());

        let first = tick(&counters, 2.0, 1, 2).await;
        assert_eq!(first["Counter"], 1);
        assert_eq!(first["Executed"], false);
        assert!(first.get("Output").is_none());

        let second = tick(&counters, 2.0, 1, 2).await;
        assert_eq!(second["Counter"], 2);
        assert_eq!(second["Executed"], true);
        assert_eq!(second["Output"], "restarted\n");
        assert_eq!(second["ExitStatus"], 0);

        let third = tick(&counters, 2.0, 1, 2).await;
        assert_eq!(third["Counter"], 3);
        assert_eq!(third["Executed"], false);
    }

    #[tokio::test]
    async fn test_unmet_conditions_reset_counter() {
        let counters = Arc::new(CounterStore::new());
        tick(&counters, 2.0, 0, 0).await;
        tick(&counters, 2.0, 0, 0).await;
        assert_eq!(counters.get("/x/restart"), 2);

        let report = tick(&counters, 0.5, 0, 0).await;
        assert_eq!(report["Counter"], 0);
        assert_eq!(report["Executed"], false);
        assert_eq!(counters.get("/x/restart"), 0);
    }

    #[tokio::test]
    async fn test_bad_conditions_fail_the_run() {
        let mut task = Shell::new(
            serde_json::from_value(json!({"command": "true", "conditions": "/r/nope.X > 1"}))
                .unwrap(),
        );
        task.set_context(context(Arc::new(CounterStore::new()), 1.0));
        assert!(task.run().await.is_err());
    }

    #[test]
    fn test_fields_flatten_command_spec() {
        let fields = fields(0, 0);
        assert_eq!(fields.command.command, "echo restarted");
        assert!(fields.command.shell);
    }
}
