//! Built-in collectors
//!
//! **YAML Format:**
//! ```yaml
//! path: /uptime
//! implementation: Shell
//! interval: 30s
//! fields:
//!   command: uptime
//! ```
//!
//! **Output (`Data`):**
//! ```json
//! {"Output": " 10:01:02 up 3 days, ...\n", "ExitStatus": 0}
//! ```

use super::command::{CommandOutput, CommandSpec};
use super::Task;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use sysinfo::System;

/// Runs a command and reports its combined output and exit status
pub struct Shell {
    spec: CommandSpec,
    result: Option<CommandOutput>,
}

impl Shell {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec, result: None }
    }
}

#[async_trait]
impl Task for Shell {
    async fn run(&mut self) -> anyhow::Result<()> {
        self.result = Some(self.spec.run().await?);
        Ok(())
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        match &self.result {
            Some(result) => Ok(serde_json::to_vec(result)?),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LoadAvgData {
    load_avg1m: f64,
    load_avg5m: f64,
    load_avg15m: f64,
}

/// System load averages
#[derive(Default)]
pub struct LoadAvg {
    data: Option<LoadAvgData>,
}

#[async_trait]
impl Task for LoadAvg {
    async fn run(&mut self) -> anyhow::Result<()> {
        let load = System::load_average();
        self.data = Some(LoadAvgData {
            load_avg1m: load.one,
            load_avg5m: load.five,
            load_avg15m: load.fifteen,
        });
        Ok(())
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        match &self.data {
            Some(data) => Ok(serde_json::to_vec(data)?),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MemoryData {
    total: u64,
    used: u64,
    free: u64,
    available: u64,
    used_percent: f64,
    swap_total: u64,
    swap_used: u64,
}

/// Memory and swap usage in bytes
#[derive(Default)]
pub struct Memory {
    data: Option<MemoryData>,
}

#[async_trait]
impl Task for Memory {
    async fn run(&mut self) -> anyhow::Result<()> {
        let mut system = System::new();
        system.refresh_memory();

        let total = system.total_memory();
        let used = system.used_memory();
        let used_percent = if total > 0 {
            (used as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        self.data = Some(MemoryData {
            total,
            used,
            free: system.free_memory(),
            available: system.available_memory(),
            used_percent,
            swap_total: system.total_swap(),
            swap_used: system.used_swap(),
        });
        Ok(())
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        match &self.data {
            Some(data) => Ok(serde_json::to_vec(data)?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn test_shell_collector() {
        let mut task = Shell::new(CommandSpec::new("echo collected"));
        assert!(task.to_json().unwrap().is_empty());

        task.run().await.unwrap();
        let data: Value = serde_json::from_slice(&task.to_json().unwrap()).unwrap();
        assert_eq!(data["Output"], "collected\n");
        assert_eq!(data["ExitStatus"], 0);
    }

    #[tokio::test]
    async fn test_load_avg_collector() {
        let mut task = LoadAvg::default();
        task.run().await.unwrap();
        let data: Value = serde_json::from_slice(&task.to_json().unwrap()).unwrap();
        assert!(data["LoadAvg1m"].is_number());
        assert!(data["LoadAvg15m"].is_number());
    }

    #[tokio::test]
    async fn test_memory_collector() {
        let mut task = Memory::default();
        task.run().await.unwrap();
        let data: Value = serde_json::from_slice(&task.to_json().unwrap()).unwrap();
        assert!(data["Total"].as_u64().unwrap() >= data["Used"].as_u64().unwrap());
    }
}
