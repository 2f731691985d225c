//! Process-wide command policy.
//!
//! A [`CommandPolicy`] is immutable. Enabling or disabling a command builds a
//! new policy, and [`PolicyStore`] publishes it as a whole, so a validation
//! that already holds a snapshot never observes a half-updated set.

pub mod validator;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tracing::info;

pub use validator::{split_command, BlockReason, CommandValidator, ParsedCommand, Verdict};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommandPolicy {
    /// Program names that may run when `enforce_allowlist` is set.
    pub allowed_commands: BTreeSet<String>,
    /// Program names that never run, whatever the allowlist says.
    pub blocked_commands: BTreeSet<String>,
    /// Default-deny: anything not in `allowed_commands` is blocked.
    pub enforce_allowlist: bool,
    /// Reject shell metacharacters used for chaining and substitution.
    pub block_chaining: bool,
    /// Per-stream output ceiling; longer output is truncated.
    pub max_output_bytes: u32,
    /// Timeout applied to tasks that do not carry their own.
    pub default_timeout_ms: u32,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            // Nothing that runs another program: env, find, xargs, interpreters
            allowed_commands: [
                "ls", "cat", "head", "tail", "wc", "grep", "echo", "pwd", "date", "sort",
                "uniq", "cut", "tr", "diff", "stat", "file", "du", "df", "which",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            blocked_commands: [
                "rm", "sudo", "su", "dd", "mkfs", "shutdown", "reboot", "halt", "poweroff",
                "kill", "killall", "chmod", "chown", "mount", "umount", "curl", "wget", "nc",
                "ssh", "scp",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            enforce_allowlist: true,
            block_chaining: true,
            max_output_bytes: 1024 * 1024,
            default_timeout_ms: 30_000,
        }
    }
}

impl CommandPolicy {
    /// Returns a copy of this policy in which `command` is allowed and no
    /// longer blocked.
    pub fn enable(&self, command: &str) -> Self {
        let mut next = self.clone();
        next.blocked_commands.remove(command);
        next.allowed_commands.insert(command.to_string());
        next
    }

    /// Returns a copy of this policy in which `command` is blocked and no
    /// longer allowed.
    pub fn disable(&self, command: &str) -> Self {
        let mut next = self.clone();
        next.allowed_commands.remove(command);
        next.blocked_commands.insert(command.to_string());
        next
    }

    pub fn max_output_bytes(&self) -> usize {
        usize::try_from(self.max_output_bytes).unwrap_or(usize::MAX)
    }

    /// Deadline for work that does not carry its own timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.default_timeout_ms))
    }
}

/// Publishes policy snapshots to concurrent validators.
#[derive(Debug)]
pub struct PolicyStore {
    current: ArcSwap<CommandPolicy>,
}

impl PolicyStore {
    pub fn new(policy: CommandPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(policy),
        }
    }

    /// The policy in effect right now. Holders keep this exact snapshot
    /// even if the store is updated afterwards.
    pub fn snapshot(&self) -> Arc<CommandPolicy> {
        self.current.load_full()
    }

    /// A validator bound to the current snapshot.
    pub fn validator(&self) -> CommandValidator {
        CommandValidator::new(self.snapshot())
    }

    pub fn enable(&self, command: &str) {
        self.current.rcu(|policy| policy.enable(command));
        info!("Command policy: enabled '{command}'");
    }

    pub fn disable(&self, command: &str) {
        self.current.rcu(|policy| policy.disable(command));
        info!("Command policy: disabled '{command}'");
    }

    pub fn replace(&self, policy: CommandPolicy) {
        self.current.store(Arc::new(policy));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_default_deny() {
        let policy = CommandPolicy::default();
        assert!(policy.enforce_allowlist);
        assert!(policy.block_chaining);
        assert!(policy.allowed_commands.contains("ls"));
        assert!(policy.blocked_commands.contains("rm"));
        assert_eq!(policy.default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_default_policy_blocks_launcher_wrappers() {
        let validator = CommandValidator::new(Arc::new(CommandPolicy::default()));
        for command in [
            "env rm -rf /",
            "find / -exec rm {} +",
            "node -e 1",
            "python3 -c 1",
            "git -c core.pager=rm log",
            "xargs rm",
        ] {
            assert!(
                !validator.validate(command, &[]).is_allowed(),
                "{command} should be blocked"
            );
        }
    }

    #[test]
    fn test_enable_returns_new_policy() {
        let policy = CommandPolicy::default();
        let next = policy.enable("rm");
        assert!(next.allowed_commands.contains("rm"));
        assert!(!next.blocked_commands.contains("rm"));
        // Original untouched
        assert!(policy.blocked_commands.contains("rm"));
        assert!(!policy.allowed_commands.contains("rm"));
    }

    #[test]
    fn test_disable_returns_new_policy() {
        let policy = CommandPolicy::default();
        let next = policy.disable("ls");
        assert!(!next.allowed_commands.contains("ls"));
        assert!(next.blocked_commands.contains("ls"));
        assert!(policy.allowed_commands.contains("ls"));
    }

    #[test]
    fn test_store_snapshot_is_stable_across_updates() {
        let store = PolicyStore::new(CommandPolicy::default());
        let before = store.snapshot();
        store.disable("ls");
        let after = store.snapshot();

        assert!(before.allowed_commands.contains("ls"));
        assert!(!after.allowed_commands.contains("ls"));
    }

    #[test]
    fn test_store_replace() {
        let store = PolicyStore::new(CommandPolicy::default());
        let custom = CommandPolicy {
            enforce_allowlist: false,
            ..CommandPolicy::default()
        };
        store.replace(custom.clone());
        assert_eq!(*store.snapshot(), custom);
    }

    #[test]
    fn test_policy_deserializes_partial_toml() {
        let policy: CommandPolicy = toml::from_str(
            r#"
            allowed_commands = ["ls"]
            block_chaining = false
            "#,
        )
        .unwrap();
        assert_eq!(policy.allowed_commands.len(), 1);
        assert!(!policy.block_chaining);
        // Unset fields keep their defaults
        assert!(policy.enforce_allowlist);
        assert_eq!(policy.default_timeout_ms, 30_000);
    }
}
