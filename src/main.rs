use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fluux_sandbox::config::Config;
use fluux_sandbox::skills::{CodeExecSkill, SkillRegistry};
use fluux_sandbox::{ExecutionOptions, SandboxCoordinator, TaskSpec};

const DEFAULT_CONFIG_PATH: &str = "config/sandbox.toml";

fn print_help() {
    println!(
        "\
fluux-sandbox v{}

Runs one task (script or shell command) in the execution sandbox.
The task is read as JSON from stdin; the result is printed as JSON.

USAGE:
    fluux-sandbox [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
                   Built-in defaults are used when the default file is absent.

OPTIONS:
    --container            Prefer the container tier (overrides [defaults])
    --no-container         Skip the container tier
    --insecure-fallback    Allow the script context / host subprocess tiers
    --session <KEY>        Run inside the named persistent container session
    --tools                Print the tool definitions exposed to the model and exit
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

TASK FORMAT:
    {{\"kind\": \"shell_command\", \"body\": \"ls -la\", \"timeout_ms\": 5000}}
    {{\"kind\": \"script\", \"body\": \"console.log(inputs.name)\", \"environment\": {{\"name\": \"x\"}}}}

EXIT STATUS:
    0    task succeeded
    1    task ran but failed (rejected, timed out, non-zero exit...)
    2    no isolation tier could run the task, or bad input

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, fluux_sandbox=debug,warn)

EXAMPLES:
    echo '{{\"kind\":\"shell_command\",\"body\":\"ls\"}}' | fluux-sandbox
    fluux-sandbox --insecure-fallback /etc/fluux/sandbox.toml < task.json
    RUST_LOG=debug fluux-sandbox --session build-1 < task.json",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Command-line arguments after `--help` / `--version` handling.
#[derive(Debug, Default)]
struct Args {
    config_path: Option<String>,
    use_container: Option<bool>,
    insecure_fallback: bool,
    session: Option<String>,
    tools: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--container" => parsed.use_container = Some(true),
            "--no-container" => parsed.use_container = Some(false),
            "--insecure-fallback" => parsed.insecure_fallback = true,
            "--tools" => parsed.tools = true,
            "--session" => {
                let key = args
                    .next()
                    .ok_or_else(|| anyhow!("--session requires a value"))?;
                parsed.session = Some(key);
            }
            flag if flag.starts_with('-') => return Err(anyhow!("Unknown option: {flag}")),
            path => {
                if parsed.config_path.is_some() {
                    return Err(anyhow!("Unexpected argument: {path}"));
                }
                parsed.config_path = Some(path.to_string());
            }
        }
    }
    Ok(parsed)
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("Failed to load configuration from {path}"))
        }
        None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::load(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("Failed to load {DEFAULT_CONFIG_PATH}"))
        }
        None => {
            info!("No configuration file, using built-in defaults");
            Ok(Config::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fluux-sandbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr; stdout carries the JSON result only
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluux_sandbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {e}\nRun with --help for usage.");
            std::process::exit(2);
        }
    };

    let config = load_config(args.config_path.as_deref())?;
    let sandbox = Arc::new(SandboxCoordinator::new(&config));

    let mut options = ExecutionOptions::from_defaults(&config.defaults);
    if let Some(use_container) = args.use_container {
        options.use_container = use_container;
    }
    options.allow_insecure_fallback |= args.insecure_fallback;
    options.session = args.session.clone();

    if args.tools {
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(CodeExecSkill::new(sandbox.clone(), options)));
        println!("{}", serde_json::to_string_pretty(&registry.tool_definitions())?);
        return Ok(());
    }

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read task from stdin")?;
    let spec: TaskSpec = match serde_json::from_str(&input) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("Error: invalid task JSON: {e}");
            std::process::exit(2);
        }
    };
    let task = spec.into_task(config.policy.default_timeout_ms);

    info!(
        "Task {} ({:?}), container: {}, insecure fallback: {}",
        task.id(),
        task.kind(),
        options.use_container,
        options.allow_insecure_fallback
    );

    let outcome = tokio::select! {
        outcome = sandbox.execute(&task, &options) => Some(outcome),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, cancelling task {}", task.id());
            None
        }
    };

    // The session only lives as long as this process
    sandbox.shutdown().await;

    let result = match outcome {
        Some(Ok(result)) => result,
        Some(Err(e)) => {
            warn!("Task {} could not run: {e}", task.id());
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
        None => std::process::exit(130),
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success() {
        std::process::exit(1);
    }
    Ok(())
}
