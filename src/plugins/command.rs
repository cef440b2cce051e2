//! Command execution shared by the shell collector and the shell executor

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command;

/// Settings common to every command-running plugin
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommandSpec {
    /// Command line to run
    pub command: String,
    /// Run through `sh -c` (default) instead of splitting the command into argv
    #[serde(default = "default_true")]
    pub shell: bool,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Combined output and exit status of one command run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandOutput {
    pub output: String,
    pub exit_status: i32,
}

impl CommandSpec {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            shell: true,
            ..Default::default()
        }
    }

    /// Run the command to completion, capturing stdout followed by stderr.
    ///
    /// A non-zero exit is reported in `exit_status`, not as an error.
    pub async fn run(&self) -> Result<CommandOutput> {
        let mut cmd = if self.shell {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd
        } else {
            let (program, args) = parse_command(&self.command)?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        };

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute command: {}", self.command))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            output: combined,
            exit_status: output.status.code().unwrap_or(-1),
        })
    }
}

fn parse_command(command: &str) -> Result<(String, Vec<String>)> {
    let parts = shlex::split(command)
        .ok_or_else(|| anyhow::anyhow!("Failed to parse command: {}", command))?;

    match parts.split_first() {
        Some((program, args)) => Ok((program.clone(), args.to_vec())),
        None => Err(anyhow::anyhow!("Empty command")),
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_command() {
        let out = CommandSpec::new("echo hello && exit 3").run().await.unwrap();
        assert_eq!(out.output, "hello\n");
        assert_eq!(out.exit_status, 3);
    }

    #[tokio::test]
    async fn test_argv_command() {
        let spec = CommandSpec {
            shell: false,
            ..CommandSpec::new("echo 'two words'")
        };
        let out = spec.run().await.unwrap();
        assert_eq!(out.output, "two words\n");
        assert_eq!(out.exit_status, 0);
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let mut spec = CommandSpec::new("printf \"$GREETING\"");
        spec.env.insert("GREETING".to_string(), "hi".to_string());
        assert_eq!(spec.run().await.unwrap().output, "hi");
    }

    #[test]
    fn test_parse_command_rejects_empty() {
        assert!(parse_command("").is_err());
        assert!(parse_command("'unterminated").is_err());
    }
}
