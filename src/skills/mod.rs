//! Tool boundary between the agent's LLM loop and the sandbox.
//!
//! The model requests a tool by name with JSON parameters; the matching
//! skill turns them into sandbox calls and renders a text result that goes
//! back to the model as the `tool_result`.

pub mod code_exec;
pub mod registry;

use async_trait::async_trait;

/// Runtime context passed to skill execution.
pub struct SkillContext {
    /// Bare JID (or other id) of the conversation partner, used in logs.
    pub caller: String,
    /// Persistent container session for this conversation, if the agent
    /// keeps one. `None` runs every call in a fresh container.
    pub session: Option<String>,
}

/// A skill that the LLM can invoke via tool_use.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Unique identifier used in the `tools[]` array.
    /// Must be lowercase alphanumeric + underscores (e.g. "code_exec").
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM so it knows
    /// when to invoke this skill.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters this skill accepts.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Declared capabilities, e.g. "process:container".
    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    /// Execute the skill with the given parameters and return a text result.
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &SkillContext,
    ) -> anyhow::Result<String>;
}

pub use code_exec::CodeExecSkill;
pub use registry::SkillRegistry;
