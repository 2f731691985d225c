use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use super::{Skill, SkillContext};

/// Skills available to the model, keyed by tool name.
#[derive(Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a skill, replacing any previous one with the same name.
    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        self.skills.insert(skill.name().to_string(), skill);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Skill>> {
        self.skills.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    /// Tool definitions in the shape LLM APIs expect
    /// (`name`, `description`, `input_schema`).
    pub fn tool_definitions(&self) -> Vec<Value> {
        self.skills
            .values()
            .map(|skill| {
                json!({
                    "name": skill.name(),
                    "description": skill.description(),
                    "input_schema": skill.parameters_schema(),
                })
            })
            .collect()
    }

    /// Dispatches a tool call by name.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        context: &SkillContext,
    ) -> anyhow::Result<String> {
        let skill = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown skill: {name}"))?;
        skill.execute(params, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoSkill;

    #[async_trait]
    impl Skill for EchoSkill {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the text parameter"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn execute(&self, params: Value, _context: &SkillContext) -> anyhow::Result<String> {
            Ok(params["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn context() -> SkillContext {
        SkillContext {
            caller: "user@example.com".to_string(),
            session: None,
        }
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = SkillRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.tool_definitions().is_empty());
    }

    #[test]
    fn test_tool_definitions() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(EchoSkill));
        assert_eq!(registry.len(), 1);

        let tools = registry.tool_definitions();
        assert_eq!(tools[0]["name"], "echo");
        assert_eq!(tools[0]["input_schema"]["type"], "object");
    }

    #[tokio::test]
    async fn test_dispatch_by_name() {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(EchoSkill));

        let out = registry
            .execute("echo", json!({"text": "hi"}), &context())
            .await
            .unwrap();
        assert_eq!(out, "hi");

        let err = registry
            .execute("missing", json!({}), &context())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown skill"));
    }
}
