//! External command stage.
//!
//! Wraps a long-running external engine invocation (transcoder,
//! speech-to-text, synthesis) as a stage operation. Argument templates
//! are rendered per execution; `{job_id}` in the argv is what the
//! recovery scanner's process probe matches on after a restart, so stage
//! commands should always carry it.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::orchestrator::errors::{StageError, StageResult};
use crate::orchestrator::stage::{StageContext, StageOperation};

/// How many trailing stderr lines go into the failure message.
const STDERR_EXCERPT_LINES: usize = 5;

/// Stage operation that runs an external program.
///
/// Supported argument placeholders:
/// - `{job_id}` - the job's id
/// - `{work_dir}` - the job's working directory
/// - `{output_dir}` - the configured output directory
/// - `{step}` - the step name being executed
///
/// The program's stdout is streamed into the job logger's tail buffer; if
/// the last JSON object line on stdout parses, it becomes the step's
/// details. A non-zero exit maps to a command-failed error carrying the
/// exit code and a stderr excerpt.
pub struct CommandStage {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandStage {
    /// Create a stage running `program` with no arguments.
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument template.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append argument templates.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Render argument templates against the execution context.
    fn render_args(&self, ctx: &StageContext) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{job_id}", &ctx.job.id)
                    .replace("{work_dir}", &ctx.work_dir.to_string_lossy())
                    .replace("{output_dir}", &ctx.output_dir.to_string_lossy())
                    .replace("{step}", ctx.step_name())
            })
            .collect()
    }
}

#[async_trait]
impl StageOperation for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> StageResult<serde_json::Value> {
        let args = self.render_args(ctx);

        ctx.logger
            .command(&format!("{} {}", self.program, args.join(" ")));
        tracing::debug!("Running: {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StageError::io(format!("spawning {}", self.program), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StageError::other("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StageError::other("Failed to capture stderr"))?;

        // Drain stderr concurrently so a chatty tool cannot deadlock on a
        // full pipe while we read stdout.
        let stderr_logger = std::sync::Arc::clone(&ctx.logger);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_logger.output_line(&line, true);
                collected.push(line);
            }
            collected
        });

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut last_json: Option<serde_json::Value> = None;

        while let Ok(Some(line)) = stdout_lines.next_line().await {
            ctx.logger.output_line(&line, false);
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                if value.is_object() {
                    last_json = Some(value);
                }
            }
        }

        let stderr_lines = stderr_task.await.unwrap_or_default();

        let status = child
            .wait()
            .await
            .map_err(|e| StageError::io(format!("waiting for {}", self.program), e))?;

        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            let excerpt: Vec<&str> = stderr_lines
                .iter()
                .rev()
                .take(STDERR_EXCERPT_LINES)
                .map(|s| s.as_str())
                .collect();
            let message = if excerpt.is_empty() {
                "no stderr output".to_string()
            } else {
                excerpt.into_iter().rev().collect::<Vec<_>>().join("; ")
            };
            return Err(StageError::command_failed(&self.program, exit_code, message));
        }

        Ok(last_json.unwrap_or_else(|| {
            serde_json::json!({
                "tool": self.program,
                "exit_code": 0,
            })
        }))
    }
}
