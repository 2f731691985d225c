//! Command validation.
//!
//! Pure and synchronous: the verdict depends only on the policy snapshot and
//! the input. Nothing here touches the filesystem or spawns anything.
//!
//! The chaining scan runs on the raw command text before any parsing, since a
//! chained command can carry a second program past a program-name check.
//! Quoting is not interpreted during that scan: `echo "a;b"` is rejected too.

use std::path::Path;
use std::sync::Arc;

use super::CommandPolicy;

/// Redirections that are accepted even when chaining is blocked.
/// Longest forms first so that `2>/dev/null` is not half-consumed by `>/dev/null`.
const ALLOWED_REDIRECTS: &[&str] = &[
    "2> /dev/null",
    "&>/dev/null",
    "2>/dev/null",
    "1>/dev/null",
    "> /dev/null",
    ">/dev/null",
    "2>&1",
];

/// Metacharacters that chain, substitute, redirect or background.
/// Two-character operators come first so they are reported as such.
const CHAINING_TOKENS: &[&str] = &[
    "&&", "||", "$(", ">>", ";", "|", "`", ">", "<", "&", "\n", "\r",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Allowlist enforced and the program is not on it.
    NotAllowlisted(String),
    /// The program is on the block list.
    ExplicitlyBlocked(String),
    /// The raw command contains the given chaining/substitution token.
    ChainingDetected(String),
    /// Argument at `index` contains the given metacharacter.
    ArgInjection { index: usize, token: String },
    /// Empty command or unbalanced quoting.
    Malformed(String),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::NotAllowlisted(program) => {
                write!(f, "'{program}' is not in the allowed command list")
            }
            BlockReason::ExplicitlyBlocked(program) => write!(f, "'{program}' is blocked"),
            BlockReason::ChainingDetected(token) => {
                write!(f, "command chaining or substitution detected ({})", printable(token))
            }
            BlockReason::ArgInjection { index, token } => write!(
                f,
                "argument {index} contains shell metacharacter ({})",
                printable(token)
            ),
            BlockReason::Malformed(detail) => write!(f, "malformed command: {detail}"),
        }
    }
}

fn printable(token: &str) -> String {
    token.escape_debug().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked(BlockReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Validates commands against one policy snapshot.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    policy: Arc<CommandPolicy>,
}

impl CommandValidator {
    pub fn new(policy: Arc<CommandPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn validate(&self, raw_command: &str, args: &[String]) -> Verdict {
        match self.check(raw_command, args) {
            Ok(()) => Verdict::Allowed,
            Err(reason) => Verdict::Blocked(reason),
        }
    }

    fn check(&self, raw_command: &str, args: &[String]) -> Result<(), BlockReason> {
        if self.policy.block_chaining {
            if let Some(token) = find_chaining_token(&strip_allowed_redirects(raw_command)) {
                return Err(BlockReason::ChainingDetected(token.to_string()));
            }
        }

        let parsed = split_command(raw_command)?;
        let program = parsed
            .argv
            .first()
            .ok_or_else(|| BlockReason::Malformed("empty command".to_string()))?;

        let basename = Path::new(program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(program);

        if self.policy.blocked_commands.contains(program.as_str())
            || self.policy.blocked_commands.contains(basename)
        {
            return Err(BlockReason::ExplicitlyBlocked(program.clone()));
        }

        // Exact match only: allowing "ls" must not allow "/tmp/x/ls"
        if self.policy.enforce_allowlist && !self.policy.allowed_commands.contains(program.as_str())
        {
            return Err(BlockReason::NotAllowlisted(program.clone()));
        }

        for (index, arg) in args.iter().enumerate() {
            if let Some(token) = find_chaining_token(arg) {
                return Err(BlockReason::ArgInjection {
                    index,
                    token: token.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// A validated command line, ready to be executed without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub argv: Vec<String>,
    /// `>/dev/null` (or `&>/dev/null`) was present.
    pub discard_stdout: bool,
    /// `2>/dev/null` (or `&>/dev/null`) was present.
    pub discard_stderr: bool,
}

/// Splits a raw command line into words using POSIX shell quoting rules and
/// lifts the accepted `/dev/null` redirections out of the argv.
///
/// Both the host and the container tiers run the result as a plain argv, so
/// the program that was validated is the program that runs.
pub fn split_command(raw_command: &str) -> Result<ParsedCommand, BlockReason> {
    let words = shell_words::split(raw_command)
        .map_err(|e| BlockReason::Malformed(e.to_string()))?;

    let mut parsed = ParsedCommand {
        argv: Vec::with_capacity(words.len()),
        discard_stdout: false,
        discard_stderr: false,
    };
    let mut words = words.into_iter().peekable();
    while let Some(word) = words.next() {
        match word.as_str() {
            ">/dev/null" | "1>/dev/null" => parsed.discard_stdout = true,
            "2>/dev/null" => parsed.discard_stderr = true,
            "&>/dev/null" => {
                parsed.discard_stdout = true;
                parsed.discard_stderr = true;
            }
            // Both streams are captured separately anyway
            "2>&1" => {}
            ">" | "1>" | "2>" if words.peek().map(String::as_str) == Some("/dev/null") => {
                words.next();
                if word == "2>" {
                    parsed.discard_stderr = true;
                } else {
                    parsed.discard_stdout = true;
                }
            }
            _ => parsed.argv.push(word),
        }
    }

    if parsed.argv.is_empty() {
        return Err(BlockReason::Malformed("empty command".to_string()));
    }
    Ok(parsed)
}

fn strip_allowed_redirects(raw: &str) -> String {
    let mut text = raw.to_string();
    for form in ALLOWED_REDIRECTS {
        text = text.replace(form, " ");
    }
    text
}

fn find_chaining_token(text: &str) -> Option<&'static str> {
    CHAINING_TOKENS
        .iter()
        .copied()
        .find(|token| text.contains(token))
}
