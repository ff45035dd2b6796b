//! The Run activity runner: shell commands and scripts as child processes.

use super::{value_as_string, ActivityContext, ActivityRunner};
use crate::error::WorkflowError;
use crate::model::{RunReturnMode, RunSpec, ScriptSpec, ShellSpec};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActivityRunner for ProcessRunner {
    async fn execute(&self, context: ActivityContext) -> Result<Value, WorkflowError> {
        let spec: RunSpec = serde_json::from_value(context.arguments.clone()).map_err(|e| {
            WorkflowError::configuration("Invalid run task arguments").with_details(e.to_string())
        })?;

        let await_completion = spec.await_.unwrap_or(true);
        let return_mode = spec.return_.unwrap_or_default();

        let mut command = if let Some(shell) = &spec.shell {
            shell_command(shell)
        } else if let Some(script) = &spec.script {
            script_command(script).await?
        } else if spec.container.is_some() {
            return Err(WorkflowError::configuration(
                "Container execution is not supported by this runtime",
            ));
        } else if spec.workflow.is_some() {
            return Err(WorkflowError::configuration(
                "Nested workflow execution is not supported by this runtime",
            ));
        } else {
            return Err(WorkflowError::configuration(
                "Run task declares nothing to run",
            ));
        };

        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        if !await_completion {
            command.spawn().map_err(|e| {
                WorkflowError::communication("Failed to spawn process")
                    .with_details(e.to_string())
            })?;
            // Fire-and-forget: the task's transformed input passes through.
            return Ok(context.input);
        }

        let output = command.output().await.map_err(|e| {
            WorkflowError::communication("Failed to run process").with_details(e.to_string())
        })?;

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout)
            .trim_end_matches('\n')
            .to_string();
        let stderr = String::from_utf8_lossy(&output.stderr)
            .trim_end_matches('\n')
            .to_string();

        if !output.status.success() {
            return Err(WorkflowError::communication("Process exited with failure")
                .with_details(format!("exit code {code}: {stderr}")));
        }

        Ok(match return_mode {
            RunReturnMode::Stdout => Value::String(stdout),
            RunReturnMode::Stderr => Value::String(stderr),
            RunReturnMode::Code => Value::from(code),
            RunReturnMode::All => serde_json::json!({
                "code": code,
                "stdout": stdout,
                "stderr": stderr,
            }),
            RunReturnMode::None => Value::Null,
        })
    }
}

fn shell_command(shell: &ShellSpec) -> Command {
    let mut line = shell.command.clone();
    if let Some(arguments) = &shell.arguments {
        for (name, value) in arguments {
            line.push(' ');
            line.push_str(name);
            let text = value_as_string(value);
            if !text.is_empty() {
                line.push(' ');
                line.push_str(&text);
            }
        }
    }
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    if let Some(environment) = &shell.environment {
        command.envs(environment);
    }
    command
}

async fn script_command(script: &ScriptSpec) -> Result<Command, WorkflowError> {
    let interpreter = match script.language.to_lowercase().as_str() {
        "python" => "python3",
        "javascript" | "js" | "node" => "node",
        "bash" => "bash",
        "sh" | "shell" => "sh",
        other => {
            return Err(WorkflowError::configuration("Unsupported script language")
                .with_details(format!("no interpreter registered for '{other}'")));
        }
    };

    let code = match (&script.code, &script.source) {
        (Some(code), _) => code.clone(),
        (None, Some(source)) => fetch_script(source.uri()).await?,
        (None, None) => {
            return Err(WorkflowError::configuration(
                "Script declares neither code nor source",
            ));
        }
    };

    // The file must outlive the child process; leak the handle into a path
    // and let the OS temp dir reclaim it.
    let file = tempfile::Builder::new()
        .prefix("lemline-script-")
        .tempfile()
        .map_err(|e| {
            WorkflowError::runtime("Failed to create script file").with_details(e.to_string())
        })?;
    let (file, path) = file.keep().map_err(|e| {
        WorkflowError::runtime("Failed to persist script file").with_details(e.to_string())
    })?;
    let mut file = tokio::fs::File::from_std(file);
    file.write_all(code.as_bytes()).await.map_err(|e| {
        WorkflowError::runtime("Failed to write script file").with_details(e.to_string())
    })?;
    file.flush().await.map_err(|e| {
        WorkflowError::runtime("Failed to write script file").with_details(e.to_string())
    })?;

    let mut command = Command::new(interpreter);
    command.arg(&path);
    if let Some(arguments) = &script.arguments {
        for (name, value) in arguments {
            command.arg(format!("--{name}"));
            command.arg(value_as_string(value));
        }
    }
    if let Some(environment) = &script.environment {
        command.envs(environment);
    }
    Ok(command)
}

async fn fetch_script(uri: &str) -> Result<String, WorkflowError> {
    reqwest::get(uri)
        .await
        .map_err(|e| {
            WorkflowError::communication("Failed to fetch script source")
                .with_details(format!("{uri}: {e}"))
        })?
        .text()
        .await
        .map_err(|e| {
            WorkflowError::communication("Failed to read script source")
                .with_details(format!("{uri}: {e}"))
        })
}
