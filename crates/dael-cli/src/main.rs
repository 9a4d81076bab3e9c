//! `dael`: the CLI surface over the workflow engine and MCP frontend.
//!
//! `RUST_LOG`-driven tracing init, with one async fn per subcommand group.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dael_engine::{Engine, WorkflowRegistry};
use dael_mcp::{load_config, DaelConfig, McpClientManager, McpToolInvoker, ServerMode, ToolRegistry};
use dael_types::DaelError;
use serde_json::Value;
use tracing::Level;

#[derive(Parser)]
#[command(name = "dael", about = "Deterministic Agent Execution Layer")]
struct Cli {
    /// Path to the configuration file. Overrides discovery order.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP frontend over stdio.
    Serve {
        #[arg(long, value_enum, default_value = "running")]
        mode: CliServerMode,
    },
    /// Inspect the tool registry.
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },
    /// Inspect the workflow registry.
    Workflows {
        #[command(subcommand)]
        action: WorkflowsAction,
    },
    /// Validate a workflow file without running it.
    Validate { file: PathBuf },
    /// Inspect or change the active configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a single workflow to completion and print its result.
    Test {
        workflow: String,
        #[arg(long = "input", value_parser = parse_key_value)]
        inputs: Vec<(String, String)>,
    },
}

#[derive(Subcommand)]
enum ToolsAction {
    List,
    Show { name: String },
    Refresh,
}

#[derive(Subcommand)]
enum WorkflowsAction {
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Clone, clap::ValueEnum)]
enum CliServerMode {
    Configuration,
    Running,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| format!("expected key=value, found '{raw}'"))
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        let object = serde_json::json!({
            "code": error.code,
            "category": error.category,
            "message": error.message,
            "detail": error.detail,
            "suggestion": error.suggestion,
            "retryable": error.retryable,
        });
        eprintln!("{}", serde_json::to_string_pretty(&object).unwrap_or(error.to_string()));
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_max_level(Level::INFO).try_init();
}

async fn run(cli: Cli) -> Result<(), DaelError> {
    match cli.command {
        Command::Serve { mode } => serve(cli.config.as_deref(), mode).await,
        Command::Tools { action } => tools(cli.config.as_deref(), action).await,
        Command::Workflows { action } => workflows(cli.config.as_deref(), action).await,
        Command::Validate { file } => validate(&file),
        Command::Config { action } => config(cli.config.as_deref(), action),
        Command::Test { workflow, inputs } => test(cli.config.as_deref(), &workflow, inputs).await,
    }
}

async fn load(explicit_config: Option<&std::path::Path>) -> Result<(Option<DaelConfig>, Arc<WorkflowRegistry>), DaelError> {
    let config = load_config(explicit_config)?;
    let registry = match &config {
        Some(cfg) => match &cfg.workflows.dir {
            Some(dir) => {
                let mut merged = HashMap::new();
                if let Ok(entries) = std::fs::read_dir(dir) {
                    for entry in entries.flatten() {
                        if let Ok(source) = std::fs::read_to_string(entry.path()) {
                            if let Ok(specs) = dael_engine::parse_workflow_document(&source) {
                                merged.extend(specs);
                            }
                        }
                    }
                }
                Arc::new(WorkflowRegistry::from_specs(merged)?)
            }
            None => Arc::new(WorkflowRegistry::new()),
        },
        None => Arc::new(WorkflowRegistry::new()),
    };
    Ok((config, registry))
}

fn build_invoker(config: &Option<DaelConfig>, registry: Arc<WorkflowRegistry>, mode: ServerMode) -> (Arc<ToolRegistry>, Arc<McpToolInvoker>) {
    let backends = config.as_ref().and_then(|c| c.mcp.clone()).map(|m| m.servers).unwrap_or_default();
    let backend_order: Vec<String> = backends.keys().cloned().collect();
    let client_manager = Arc::new(McpClientManager::new(backends));
    let tool_registry = Arc::new(ToolRegistry::new(mode, registry, client_manager.clone(), backend_order));
    let invoker = Arc::new(McpToolInvoker::new(tool_registry.clone(), client_manager));
    (tool_registry, invoker)
}

async fn serve(explicit_config: Option<&std::path::Path>, mode: CliServerMode) -> Result<(), DaelError> {
    let (config, workflow_registry) = load(explicit_config).await?;
    let server_mode = match mode {
        CliServerMode::Configuration => ServerMode::Configuration,
        CliServerMode::Running => ServerMode::Running,
    };
    let (tool_registry, invoker) = build_invoker(&config, workflow_registry.clone(), server_mode);
    tool_registry.refresh().await?;

    let max_concurrent = config.as_ref().map(|c| c.execution.max_concurrent).unwrap_or(10);
    let config_value = config.as_ref().and_then(|c| serde_json::to_value(c).ok()).unwrap_or(Value::Null);
    let engine = Arc::new(Engine::with_max_concurrent(workflow_registry, invoker.clone(), max_concurrent).with_runtime_config(config_value));
    invoker.set_engine(engine);

    dael_mcp::serve_stdio(tool_registry, invoker)
        .await
        .map_err(|e| DaelError::new(dael_types::ErrorCode::InternalError, e.to_string()))
}

async fn tools(explicit_config: Option<&std::path::Path>, action: ToolsAction) -> Result<(), DaelError> {
    let (config, workflow_registry) = load(explicit_config).await?;
    let (tool_registry, _invoker) = build_invoker(&config, workflow_registry, ServerMode::Running);
    tool_registry.refresh().await?;

    match action {
        ToolsAction::List | ToolsAction::Refresh => {
            let names: Vec<String> = tool_registry.list().into_iter().map(|t| t.name).collect();
            println!("{}", serde_json::to_string_pretty(&names).unwrap());
        }
        ToolsAction::Show { name } => match tool_registry.find(&name) {
            Some(tool) => println!("{}", serde_json::to_string_pretty(&tool).unwrap()),
            None => return Err(DaelError::new(dael_types::ErrorCode::ToolUnavailable, format!("no tool named '{name}'"))),
        },
    }
    Ok(())
}

async fn workflows(explicit_config: Option<&std::path::Path>, action: WorkflowsAction) -> Result<(), DaelError> {
    let (_config, registry) = load(explicit_config).await?;
    match action {
        WorkflowsAction::List => {
            println!("{}", serde_json::to_string_pretty(&registry.list()).unwrap());
        }
    }
    Ok(())
}

fn validate(file: &std::path::Path) -> Result<(), DaelError> {
    let source = std::fs::read_to_string(file).map_err(|e| DaelError::new(dael_types::ErrorCode::ConfigPathInvalid, format!("could not read '{}': {e}", file.display())))?;
    let specs = dael_engine::parse_workflow_document(&source)?;
    println!("{}", serde_json::to_string_pretty(&specs.keys().collect::<Vec<_>>()).unwrap());
    Ok(())
}

fn config(explicit_config: Option<&std::path::Path>, action: ConfigAction) -> Result<(), DaelError> {
    let loaded = load_config(explicit_config)?;
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(&loaded).unwrap());
        }
        ConfigAction::Get { key } => {
            let value = loaded.as_ref().and_then(|c| serde_json::to_value(c).ok()).and_then(|v| v.get(&key).cloned()).unwrap_or(Value::Null);
            println!("{}", serde_json::to_string_pretty(&value).unwrap());
        }
        ConfigAction::Set { key, value } => {
            return Err(DaelError::new(
                dael_types::ErrorCode::ConfigInvalid,
                format!("config set is not supported from the CLI; edit the configuration file directly to change '{key}' to '{value}'"),
            ));
        }
    }
    Ok(())
}

async fn test(explicit_config: Option<&std::path::Path>, workflow: &str, inputs: Vec<(String, String)>) -> Result<(), DaelError> {
    let (config, workflow_registry) = load(explicit_config).await?;
    let (tool_registry, invoker) = build_invoker(&config, workflow_registry.clone(), ServerMode::Running);
    tool_registry.refresh().await?;

    let config_value = config.as_ref().and_then(|c| serde_json::to_value(c).ok()).unwrap_or(Value::Null);
    let engine = Arc::new(Engine::new(workflow_registry, invoker.clone()).with_runtime_config(config_value));
    invoker.set_engine(engine.clone());

    let mut input_map = serde_json::Map::new();
    for (key, raw) in inputs {
        let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        input_map.insert(key, value);
    }

    let result = engine.execute(workflow, input_map).await?;
    println!("{}", serde_json::to_string_pretty(&result).unwrap());
    Ok(())
}
