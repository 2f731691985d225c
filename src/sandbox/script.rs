//! Isolated script tier: one fresh interpreter process per task.
//!
//! The child runs a small harness that evaluates the task body inside a new
//! `vm` context. The context starts empty apart from the language builtins
//! and gets exactly four globals: `console`, `emit`, `now` and a frozen
//! `inputs` object. No `require`, no `process`, no string code generation.
//! The globals are defined from inside the context and every call into the
//! harness goes through a context-side wrapper that swallows host
//! exceptions, so nothing reachable from script code belongs to the harness
//! realm. Returned promises are settled inside the context as well.
//!
//! The `vm` context is backed by the interpreter's permission model: the
//! child runs with `--permission` and no grants, so even code that reached
//! the harness realm could not touch the filesystem, spawn processes or load
//! addons.
//!
//! The harness talks back over stdout, one JSON message per line. The child
//! itself gets a cleared environment, an empty scratch directory as cwd, and
//! a heap ceiling taken from the task's memory limit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ScriptConfig;
use crate::error::{Result, SandboxError};
use crate::sandbox::process::run_with_deadline;
use crate::task::{
    truncate_output, ExecutionResult, ExecutionTask, FailureKind, IsolationTier, Outcome,
    TaskKind, MEMORY_MARKER, TIMEOUT_MARKER,
};

/// Evaluated with `node -e`. Reads `{code, inputs}` from stdin.
const HARNESS: &str = r#"'use strict';
const vm = require('vm');
const send = (message) => process.stdout.write(JSON.stringify(message) + '\n');
const bridge = (type, payload) => {
  try {
    const text = String(payload);
    if (type === 'stdout' || type === 'stderr') {
      send({ type: 'log', stream: type, text });
    } else if (type === 'error') {
      send({ type: 'error', message: text });
      process.exitCode = 1;
    } else {
      let value = null;
      try { value = JSON.parse(text); } catch (_) { value = text; }
      send({ type, value });
    }
  } catch (_) {}
};
const INSTALL = `(function (bridge, inputs) {
  'use strict';
  const post = (type, payload) => {
    try { bridge(type, String(payload)); } catch (_) {}
  };
  const show = (v) => {
    if (typeof v === 'string') return v;
    try { const s = JSON.stringify(v); return s === undefined ? String(v) : s; }
    catch (_) { return String(v); }
  };
  const encode = (v) => {
    try { const s = JSON.stringify(v); return s === undefined ? 'null' : s; }
    catch (_) { return JSON.stringify(String(v)); }
  };
  const describe = (e) => {
    try { return e && e.stack ? String(e.stack) : String(e); }
    catch (_) { return 'script threw'; }
  };
  const fail = (e) => { post('error', describe(e)); };
  const line = (stream) => (...args) => { post(stream, args.map(show).join(' ')); };
  globalThis.console = Object.freeze({
    log: line('stdout'), info: line('stdout'), debug: line('stdout'),
    warn: line('stderr'), error: line('stderr'),
  });
  globalThis.emit = (value) => { post('output', encode(value)); };
  globalThis.now = () => Date.now();
  globalThis.inputs = Object.freeze(JSON.parse(inputs));
  const finish = (value) => {
    const thenable = value !== null
      && (typeof value === 'object' || typeof value === 'function')
      && typeof value.then === 'function';
    if (thenable) {
      Promise.resolve(value).then((settled) => { post('result', encode(settled)); }, fail);
    } else {
      post('result', encode(value));
    }
  };
  return Object.freeze({ finish, fail });
})`;
let raw = '';
process.stdin.setEncoding('utf8');
process.stdin.on('data', (chunk) => { raw += chunk; });
process.stdin.on('end', () => {
  const task = JSON.parse(raw);
  const context = vm.createContext(Object.create(null), {
    codeGeneration: { strings: false, wasm: false },
  });
  const harness = vm.runInContext(INSTALL, context)(bridge, JSON.stringify(task.inputs || {}));
  try {
    harness.finish(vm.runInContext(task.code, context, { filename: 'task.js' }));
  } catch (e) {
    harness.fail(e);
  }
});
"#;

/// Permission model switches, current spelling first.
const PERMISSION_FLAGS: [&str; 2] = ["--permission", "--experimental-permission"];

/// Deadline for checking which permission switch the interpreter accepts.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Permission switch per interpreter binary, probed once per process.
static PERMISSION_SUPPORT: OnceLock<Mutex<HashMap<PathBuf, Option<&'static str>>>> =
    OnceLock::new();

/// Node's fatal heap exhaustion messages.
const OOM_SIGNATURES: [&str; 2] = ["heap out of memory", "Reached heap limit"];

/// Exit code of a child that aborted (128 + SIGABRT), as node does on OOM.
const ABORT_EXIT: i32 = 134;

/// One line of harness output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ScriptMessage {
    Log { stream: LogStream, text: String },
    Output { value: Value },
    Result { value: Value },
    Error { message: String },
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum LogStream {
    Stdout,
    Stderr,
}

pub struct IsolatedScriptRunner {
    interpreter: String,
    interpreter_args: Vec<String>,
    require_permission_model: bool,
    max_output: usize,
}

impl IsolatedScriptRunner {
    pub fn new(config: &ScriptConfig, max_output: usize) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            interpreter_args: config.interpreter_args.clone(),
            require_permission_model: config.require_permission_model,
            max_output,
        }
    }

    /// Whether the interpreter can be found.
    pub fn is_available(&self) -> bool {
        self.resolve().is_ok()
    }

    /// Whether scripts can run: the interpreter exists and, when required,
    /// supports the permission model.
    pub async fn is_ready(&self) -> bool {
        match self.resolve() {
            Ok(interpreter) => {
                !self.require_permission_model || permission_flag(&interpreter).await.is_some()
            }
            Err(_) => false,
        }
    }

    fn resolve(&self) -> Result<PathBuf> {
        which::which(&self.interpreter).map_err(|e| {
            SandboxError::InfrastructureUnavailable(format!(
                "script interpreter '{}' not found: {e}",
                self.interpreter
            ))
        })
    }

    /// Runs a `Script` task in a fresh interpreter.
    ///
    /// Errors only when the interpreter cannot be started; everything the
    /// script itself does ends up in the result.
    pub async fn run(&self, task: &ExecutionTask) -> Result<ExecutionResult> {
        if task.kind() != TaskKind::Script {
            return Err(SandboxError::Config(format!(
                "task {} is not a script",
                task.id()
            )));
        }
        let interpreter = self.resolve()?;
        let permission = match permission_flag(&interpreter).await {
            Some(flag) => Some(flag),
            None if self.require_permission_model => {
                return Err(SandboxError::InfrastructureUnavailable(format!(
                    "{} has no permission model (Node 20 or newer is required)",
                    interpreter.display()
                )));
            }
            None => {
                warn!(
                    "{} has no permission model, running scripts without it",
                    interpreter.display()
                );
                None
            }
        };
        let started = Instant::now();
        let scratch = tempfile::Builder::new().prefix("fluux-script-").tempdir()?;
        let command = self.command(&interpreter, permission, task, scratch.path());

        let payload = serde_json::to_vec(&serde_json::json!({
            "code": task.body(),
            "inputs": task.environment(),
        }))
        .map_err(|e| SandboxError::Runtime(format!("encoding script payload: {e}")))?;

        debug!(
            "Task {}: running {} script ({} bytes, heap {}MB)",
            task.id(),
            task.language(),
            task.body().len(),
            task.memory_limit_mb()
        );

        // Room for the JSON framing around the script's own output
        let pipe_cap = self.max_output.saturating_mul(2).saturating_add(64 * 1024);
        let output = run_with_deadline(command, Some(payload), task.timeout(), pipe_cap)
            .await
            .map_err(|e| {
                SandboxError::InfrastructureUnavailable(format!(
                    "cannot start {}: {e}",
                    interpreter.display()
                ))
            })?;

        let mut decoded = decode(&output.stdout_lossy());
        let raw_stderr = output.stderr_lossy();
        let mut outcome = Outcome {
            truncated: output.truncated,
            ..Outcome::default()
        };

        // A script whose last expression is `undefined` reports null
        if let Some(result) = decoded.result.take().filter(|value| !value.is_null()) {
            push_line(&mut decoded.stdout, &render(&result));
        }
        outcome.stdout = decoded.stdout;
        outcome.stderr = decoded.stderr;
        if !raw_stderr.trim().is_empty() {
            push_line(&mut outcome.stderr, raw_stderr.trim_end());
        }

        if output.timed_out {
            warn!("Task {}: script killed after {}ms", task.id(), task.timeout_ms());
            outcome.failure = Some(FailureKind::Timeout);
            push_line(
                &mut outcome.stderr,
                &format!("{TIMEOUT_MARKER} after {}ms", task.timeout_ms()),
            );
        } else if is_out_of_memory(&raw_stderr, output.exit_code) {
            warn!(
                "Task {}: script exceeded {}MB heap",
                task.id(),
                task.memory_limit_mb()
            );
            outcome.failure = Some(FailureKind::ResourceExceeded);
            push_line(&mut outcome.stderr, MEMORY_MARKER);
        } else if let Some(message) = decoded.error {
            outcome.failure = Some(FailureKind::RuntimeFailure);
            push_line(&mut outcome.stderr, &message);
        } else if output.exit_code != Some(0) {
            outcome.failure = Some(FailureKind::RuntimeFailure);
        }

        outcome.truncated |= truncate_output(&mut outcome.stdout, self.max_output);
        outcome.truncated |= truncate_output(&mut outcome.stderr, self.max_output);

        Ok(ExecutionResult::from_outcome(
            task.id(),
            IsolationTier::InProcess,
            outcome,
            started,
        ))
    }

    fn command(
        &self,
        interpreter: &Path,
        permission: Option<&str>,
        task: &ExecutionTask,
        scratch: &Path,
    ) -> Command {
        let mut command = Command::new(interpreter);
        command
            .args(&self.interpreter_args)
            .args(permission)
            .arg(format!("--max-old-space-size={}", task.memory_limit_mb()))
            .arg("-e")
            .arg(HARNESS)
            .env_clear()
            .current_dir(scratch);
        command
    }
}

/// The permission switch `interpreter` accepts, if any. Grants nothing: with
/// the switch alone the child cannot read or write files, spawn processes,
/// start workers or load addons.
async fn permission_flag(interpreter: &Path) -> Option<&'static str> {
    let cache = PERMISSION_SUPPORT.get_or_init(Default::default);
    let known = lock_cache(cache).get(interpreter).copied();
    if let Some(flag) = known {
        return flag;
    }

    let mut found = None;
    for flag in PERMISSION_FLAGS {
        let mut probe = Command::new(interpreter);
        probe.arg(flag).arg("-e").arg("0").env_clear();
        match run_with_deadline(probe, None, PROBE_TIMEOUT, 4096).await {
            Ok(output) if output.exit_code == Some(0) => {
                found = Some(flag);
                break;
            }
            Ok(_) => debug!("{} rejects {flag}", interpreter.display()),
            Err(e) => {
                debug!("Probing {} failed: {e}", interpreter.display());
                break;
            }
        }
    }
    lock_cache(cache).insert(interpreter.to_path_buf(), found);
    found
}

fn lock_cache<'a>(
    cache: &'a Mutex<HashMap<PathBuf, Option<&'static str>>>,
) -> std::sync::MutexGuard<'a, HashMap<PathBuf, Option<&'static str>>> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct Decoded {
    stdout: String,
    stderr: String,
    result: Option<Value>,
    error: Option<String>,
}

fn decode(raw: &str) -> Decoded {
    let mut decoded = Decoded::default();
    for line in raw.lines() {
        match serde_json::from_str::<ScriptMessage>(line) {
            Ok(ScriptMessage::Log { stream: LogStream::Stdout, text }) => {
                push_line(&mut decoded.stdout, &text)
            }
            Ok(ScriptMessage::Log { stream: LogStream::Stderr, text }) => {
                push_line(&mut decoded.stderr, &text)
            }
            Ok(ScriptMessage::Output { value }) => push_line(&mut decoded.stdout, &render(&value)),
            Ok(ScriptMessage::Result { value }) => decoded.result = Some(value),
            Ok(ScriptMessage::Error { message }) => decoded.error = Some(message),
            // Anything else the child printed is kept verbatim
            Err(_) => push_line(&mut decoded.stdout, line),
        }
    }
    decoded
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_out_of_memory(stderr: &str, exit_code: Option<i32>) -> bool {
    OOM_SIGNATURES.iter().any(|sig| stderr.contains(sig)) || exit_code == Some(ABORT_EXIT)
}

/// Appends `text` as a new line.
fn push_line(buffer: &mut String, text: &str) {
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn runner() -> Option<IsolatedScriptRunner> {
        let runner = IsolatedScriptRunner::new(&ScriptConfig::default(), 64 * 1024);
        if runner.is_ready().await {
            Some(runner)
        } else {
            eprintln!("node with a permission model not found on PATH, skipping");
            None
        }
    }

    // ── Decoding ────────────────────────────────────────

    #[test]
    fn test_decode_routes_messages() {
        let raw = concat!(
            r#"{"type":"log","stream":"stdout","text":"hello"}"#, "\n",
            r#"{"type":"log","stream":"stderr","text":"careful"}"#, "\n",
            r#"{"type":"output","value":{"n":1}}"#, "\n",
            "stray text\n",
            r#"{"type":"result","value":42}"#, "\n",
        );
        let decoded = decode(raw);
        assert_eq!(decoded.stdout, "hello\n{\"n\":1}\nstray text");
        assert_eq!(decoded.stderr, "careful");
        assert_eq!(decoded.result, Some(serde_json::json!(42)));
        assert!(decoded.error.is_none());
    }

    #[test]
    fn test_decode_error_message() {
        let decoded = decode(r#"{"type":"error","message":"ReferenceError: x is not defined"}"#);
        assert_eq!(decoded.error.as_deref(), Some("ReferenceError: x is not defined"));
    }

    #[test]
    fn test_render_strings_unquoted() {
        assert_eq!(render(&Value::String("hi".into())), "hi");
        assert_eq!(render(&serde_json::json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_oom_detection() {
        assert!(is_out_of_memory(
            "FATAL ERROR: Reached heap limit Allocation failed - JavaScript heap out of memory",
            Some(134)
        ));
        assert!(is_out_of_memory("", Some(134)));
        assert!(!is_out_of_memory("TypeError", Some(1)));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_infrastructure_error() {
        let config = ScriptConfig {
            interpreter: "fluux-no-such-interpreter".into(),
            interpreter_args: vec![],
            ..ScriptConfig::default()
        };
        let runner = IsolatedScriptRunner::new(&config, 1024);
        assert!(!runner.is_available());
        assert!(!runner.is_ready().await);
        let err = runner
            .run(&ExecutionTask::script("1").build())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InfrastructureUnavailable(_)));
    }

    #[tokio::test]
    async fn test_rejects_command_task() {
        let runner = IsolatedScriptRunner::new(&ScriptConfig::default(), 1024);
        let err = runner
            .run(&ExecutionTask::command("ls").build())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn test_command_runs_harness_under_permission_model() {
        let runner = IsolatedScriptRunner::new(&ScriptConfig::default(), 1024);
        let task = ExecutionTask::script("1").memory_limit_mb(48).build();
        let command = runner.command(
            Path::new("/usr/bin/node"),
            Some("--permission"),
            &task,
            Path::new("/tmp"),
        );
        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            &args[..4],
            ["--no-warnings", "--permission", "--max-old-space-size=48", "-e"]
        );
        // No grants of any kind
        assert!(args.iter().all(|arg| !arg.starts_with("--allow-")));
    }

    // ── Execution (needs node) ──────────────────────────

    #[tokio::test]
    async fn test_permission_model_denies_filesystem() {
        let Some(runner) = runner().await else { return };
        let interpreter = runner.resolve().unwrap();
        let flag = permission_flag(&interpreter).await.unwrap();

        let mut command = Command::new(&interpreter);
        command
            .arg(flag)
            .arg("-e")
            .arg("require('fs').readFileSync('/etc/hostname')");
        let output = run_with_deadline(command, None, Duration::from_secs(10), 64 * 1024)
            .await
            .unwrap();
        assert_ne!(output.exit_code, Some(0));
        assert!(output.stderr_lossy().contains("ERR_ACCESS_DENIED"));
    }

    #[tokio::test]
    async fn test_host_errors_never_reach_the_script() {
        let Some(runner) = runner().await else { return };
        // Overflow the stack, then log: the overflow may happen inside the
        // output channel, and whatever the script catches must stay in its realm
        let task = ExecutionTask::script(
            r#"
            let verdict = 'contained';
            const grab = (e) => {
                try {
                    const proc = e.constructor.constructor('return process')();
                    verdict = 'ESCAPED ' + proc.getBuiltinModule('fs').readFileSync('/etc/hostname', 'utf8');
                } catch (_) {}
            };
            const dive = (depth) => {
                try { dive(depth + 1); } catch (_) {
                    try { console.log('deep'); } catch (e) { grab(e); }
                }
            };
            dive(0);
            verdict
            "#,
        )
        .build();
        let result = runner.run(&task).await.unwrap();
        assert!(!result.stdout().contains("ESCAPED"), "stdout: {}", result.stdout());
        assert!(result.stdout().ends_with("contained"), "stdout: {}", result.stdout());
    }

    #[tokio::test]
    async fn test_thenable_result_settles_inside_the_context() {
        let Some(runner) = runner().await else { return };
        let task = ExecutionTask::script(
            "({ then(resolve) { \
                let verdict = 'contained'; \
                try { resolve.constructor.constructor('return process')(); verdict = 'ESCAPED'; } catch (_) {} \
                resolve(verdict); } })",
        )
        .build();
        let result = runner.run(&task).await.unwrap();
        assert!(result.success(), "stderr: {}", result.stderr());
        assert_eq!(result.stdout(), "contained");
    }

    #[tokio::test]
    async fn test_console_emit_and_result() {
        let Some(runner) = runner().await else { return };
        let task = ExecutionTask::script(
            "console.log('hello', 1 + 1); console.error('oops'); emit({ ok: true }); 'done'",
        )
        .build();
        let result = runner.run(&task).await.unwrap();
        assert!(result.success(), "stderr: {}", result.stderr());
        assert_eq!(result.id(), task.id());
        assert_eq!(result.stdout(), "hello 2\n{\"ok\":true}\ndone");
        assert!(result.stderr().contains("oops"));
        assert!(result.exit_code().is_none());
        assert_eq!(result.isolation_tier(), IsolationTier::InProcess);
    }

    #[tokio::test]
    async fn test_inputs_are_exposed_and_frozen() {
        let Some(runner) = runner().await else { return };
        let task = ExecutionTask::script(
            "'use strict'; try { inputs.name = 'x' } catch (e) { console.log('frozen') }; `hi ${inputs.name}`",
        )
        .env("name", "fluux")
        .build();
        let result = runner.run(&task).await.unwrap();
        assert!(result.success(), "stderr: {}", result.stderr());
        assert_eq!(result.stdout(), "frozen\nhi fluux");
    }

    #[tokio::test]
    async fn test_no_host_capabilities() {
        let Some(runner) = runner().await else { return };
        let task = ExecutionTask::script(
            "[typeof require, typeof process, typeof module, typeof Buffer].join(',')",
        )
        .build();
        let result = runner.run(&task).await.unwrap();
        assert_eq!(result.stdout(), "undefined,undefined,undefined,undefined");
    }

    #[tokio::test]
    async fn test_constructor_escape_is_blocked() {
        let Some(runner) = runner().await else { return };
        let task = ExecutionTask::script("console.log.constructor('return process')().pid").build();
        let result = runner.run(&task).await.unwrap();
        assert!(!result.success());
        assert_eq!(result.failure(), Some(FailureKind::RuntimeFailure));
        assert!(result.stderr().contains("EvalError"));
    }

    #[tokio::test]
    async fn test_syntax_error_is_runtime_failure() {
        let Some(runner) = runner().await else { return };
        let result = runner
            .run(&ExecutionTask::script("function (").build())
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.failure(), Some(FailureKind::RuntimeFailure));
        assert!(result.stderr().contains("SyntaxError"));
    }

    #[tokio::test]
    async fn test_thrown_error_is_runtime_failure() {
        let Some(runner) = runner().await else { return };
        let result = runner
            .run(&ExecutionTask::script("console.log('before'); throw new Error('boom')").build())
            .await
            .unwrap();
        assert_eq!(result.failure(), Some(FailureKind::RuntimeFailure));
        assert_eq!(result.stdout(), "before");
        assert!(result.stderr().contains("boom"));
    }

    #[tokio::test]
    async fn test_busy_loop_times_out() {
        let Some(runner) = runner().await else { return };
        let started = Instant::now();
        let task = ExecutionTask::script("while (true) {}").timeout_ms(500).build();
        let result = runner.run(&task).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(500) + Duration::from_secs(3));
        assert!(!result.success());
        assert_eq!(result.failure(), Some(FailureKind::Timeout));
        assert!(result.exit_code().is_none());
        assert!(result.stderr().contains(TIMEOUT_MARKER));
        assert_eq!(result.isolation_tier(), IsolationTier::InProcess);
    }

    #[tokio::test]
    async fn test_heap_limit_is_resource_exceeded() {
        let Some(runner) = runner().await else { return };
        let task = ExecutionTask::script(
            "const hog = []; while (true) { hog.push(new Array(1e6).fill(1.5)); }",
        )
        .memory_limit_mb(32)
        .timeout_ms(20_000)
        .build();
        let result = runner.run(&task).await.unwrap();
        assert!(!result.success());
        assert_eq!(result.failure(), Some(FailureKind::ResourceExceeded));
        assert!(result.stderr().contains(MEMORY_MARKER));
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let Some(runner) = runner().await else { return };
        let a = ExecutionTask::script(
            "var shared = 'a'; globalThis.tag = 'a'; const t = now(); while (now() - t < 200) {}; shared + tag",
        )
        .build();
        let b = ExecutionTask::script(
            "var shared = 'b'; globalThis.tag = 'b'; const t = now(); while (now() - t < 200) {}; shared + tag",
        )
        .build();

        let (ra, rb) = tokio::join!(runner.run(&a), runner.run(&b));
        assert_eq!(ra.unwrap().stdout(), "aa");
        assert_eq!(rb.unwrap().stdout(), "bb");
    }

    #[tokio::test]
    async fn test_async_result_is_awaited() {
        let Some(runner) = runner().await else { return };
        let result = runner
            .run(&ExecutionTask::script("(async () => 6 * 7)()").build())
            .await
            .unwrap();
        assert!(result.success(), "stderr: {}", result.stderr());
        assert_eq!(result.stdout(), "42");
    }

    #[tokio::test]
    async fn test_environment_not_inherited() {
        let Some(runner) = runner().await else { return };
        // Script code cannot read env at all; the child itself starts with none
        let result = runner
            .run(&ExecutionTask::script("typeof process === 'undefined' && typeof inputs.HOME").build())
            .await
            .unwrap();
        assert_eq!(result.stdout(), "undefined");
    }
}
