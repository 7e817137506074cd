use crate::config::OpenclawConfig;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Runs the `openclaw` binary directly; arguments never pass through a shell.
#[derive(Debug, Clone)]
pub struct OpenclawCli {
    binary: String,
    timeout: Duration,
}

impl OpenclawCli {
    pub fn new(cfg: &OpenclawConfig) -> Self {
        Self {
            binary: cfg.binary.clone(),
            timeout: cfg.timeout(),
        }
    }

    pub async fn run(&self, args: &[&str]) -> Result<String, CliError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %command, "running openclaw");

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|source| CliError::Spawn {
                binary: self.binary.clone(),
                source,
            })?,
            Err(_) => {
                return Err(CliError::Timeout {
                    command,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(CliError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs `args --json`; if that fails, runs `args` alone. Output that is
    /// not JSON comes back as `{"raw": <stdout>}`.
    pub async fn run_json(&self, args: &[&str]) -> Result<serde_json::Value, CliError> {
        let mut with_flag = args.to_vec();
        with_flag.push("--json");
        if let Ok(stdout) = self.run(&with_flag).await {
            if let Ok(value) = serde_json::from_str(&stdout) {
                return Ok(value);
            }
        }
        let stdout = self.run(args).await?;
        Ok(serde_json::from_str(&stdout).unwrap_or_else(|_| serde_json::json!({ "raw": stdout })))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn cli(binary: &str, timeout_secs: u64) -> OpenclawCli {
        OpenclawCli::new(&OpenclawConfig {
            binary: binary.to_string(),
            timeout_secs,
        })
    }

    #[tokio::test]
    async fn arguments_are_not_interpreted_by_a_shell() {
        let out = cli("echo", 5).run(&["$(whoami)", "; rm -rf /"]).await.unwrap();
        assert_eq!(out.trim(), "$(whoami) ; rm -rf /");
    }

    #[tokio::test]
    async fn non_json_output_is_wrapped_as_raw() {
        let value = cli("echo", 5).run_json(&["hello"]).await.unwrap();
        assert_eq!(value["raw"].as_str().map(str::trim), Some("hello"));
    }

    #[tokio::test]
    async fn json_output_is_parsed() {
        let value = cli("echo", 5).run_json(&["[1,2]"]).await.unwrap();
        assert_eq!(value, serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn missing_binary_and_failures_are_errors() {
        let err = cli("/nonexistent/openclaw", 5).run(&["x"]).await.unwrap_err();
        assert!(matches!(err, CliError::Spawn { .. }));
        let err = cli("false", 5).run(&[]).await.unwrap_err();
        assert!(matches!(err, CliError::Failed { .. }));
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let err = cli("sleep", 1).run(&["5"]).await.unwrap_err();
        assert!(matches!(err, CliError::Timeout { .. }));
    }
}
