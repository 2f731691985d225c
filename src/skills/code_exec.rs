use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::sandbox::{ExecutionOptions, SandboxCoordinator};
use crate::skills::{Skill, SkillContext};
use crate::task::{ExecutionResult, TaskSpec};

/// Skill that runs code or a command in the sandbox.
///
/// Parameters follow [`TaskSpec`]. Validation rejections, timeouts and
/// non-zero exits are returned to the model as text so it can react; only
/// infrastructure failures surface as errors.
pub struct CodeExecSkill {
    sandbox: Arc<SandboxCoordinator>,
    options: ExecutionOptions,
}

impl CodeExecSkill {
    pub fn new(sandbox: Arc<SandboxCoordinator>, options: ExecutionOptions) -> Self {
        Self { sandbox, options }
    }
}

#[async_trait]
impl Skill for CodeExecSkill {
    fn name(&self) -> &str {
        "code_exec"
    }

    fn description(&self) -> &str {
        "Run a JavaScript snippet or a single shell command in an isolated sandbox and \
         return its output. Commands must be a single allowlisted program: no pipes, \
         chaining, substitution or redirection (except to /dev/null). Scripts can use \
         console.log, emit(value), now() and the read-only `inputs` object; they have no \
         filesystem, network or process access."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "kind": {
                    "type": "string",
                    "enum": ["script", "shell_command"],
                    "description": "Whether `body` is script source or a command line"
                },
                "body": {
                    "type": "string",
                    "description": "Script source, or the command line (e.g. 'ls -la')"
                },
                "args": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Extra arguments appended to the command"
                },
                "language": {
                    "type": "string",
                    "enum": ["javascript", "typescript"],
                    "description": "Script language (default javascript)"
                },
                "environment": {
                    "type": "object",
                    "additionalProperties": {"type": "string"},
                    "description": "Environment for commands, `inputs` for scripts"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Wall-clock limit in milliseconds"
                }
            },
            "required": ["kind", "body"]
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["process:sandboxed".to_string()]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let spec: TaskSpec = serde_json::from_value(params)
            .map_err(|e| anyhow::anyhow!("Invalid code_exec parameters: {e}"))?;
        let task = spec.into_task(self.sandbox.policy().snapshot().default_timeout_ms);

        let mut options = self.options.clone();
        if let Some(session) = &context.session {
            options.session = Some(session.clone());
        }

        info!(
            "code_exec for {}: task {} ({:?})",
            context.caller,
            task.id(),
            task.kind()
        );
        let result = self.sandbox.execute(&task, &options).await?;
        Ok(render(&result))
    }
}

/// Formats a result for the model.
fn render(result: &ExecutionResult) -> String {
    let mut text = match (result.success(), result.failure()) {
        (true, _) => "Status: success".to_string(),
        (false, Some(kind)) => format!("Status: failed ({kind:?})"),
        (false, None) => "Status: failed".to_string(),
    };
    if let Some(code) = result.exit_code() {
        text.push_str(&format!("\nExit code: {code}"));
    }
    text.push_str(&format!(
        "\nTier: {:?}, {}ms",
        result.isolation_tier(),
        result.duration_ms()
    ));
    if !result.stdout().is_empty() {
        text.push_str("\n\nstdout:\n");
        text.push_str(result.stdout());
    }
    if !result.stderr().is_empty() {
        text.push_str("\n\nstderr:\n");
        text.push_str(result.stderr());
    }
    text
}
