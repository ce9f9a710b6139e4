//! CLI entry point: parses global flags and subcommands, initializes
//! telemetry, wires an `orchestrator::Application`, dispatches to the
//! matching subcommand handler, and maps workflow outcomes to process
//! exit codes before shutting telemetry back down.

mod collaborators;
mod command;
mod dag;
mod dispatcher;
mod domain;
mod engine;
mod errors;
mod generator;
mod limits;
mod loader;
mod orchestrator;
mod recovery;
mod rollback;
mod safety;
mod telemetry;
mod validation;
mod variables;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "shellforge")]
#[command(about = "Natural-language-driven shell automation with DAG scheduling and rollback", long_about = None)]
struct Cli {
    /// Plan every step but don't actually run anything.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Skip approval prompts for low-risk steps.
    #[arg(long, global = true)]
    yes: bool,

    /// Named profile; selects an alternate state directory.
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Execution limits preset (overridden by SHELLFORGE_MAX_* env vars).
    #[arg(long, global = true, value_enum, default_value = "default")]
    limits: limits::LimitsPreset,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// File-level operations.
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },
    /// Manage saved workflows.
    Workflows {
        #[command(subcommand)]
        action: WorkflowsAction,
    },
    /// Generate a plan from a natural-language request.
    Generate {
        /// The request text, e.g. "clone the repo and run its tests".
        request: String,
        /// Save the generated plan under this workflow name.
        #[arg(long)]
        save_as: Option<String>,
    },
    /// Docker wrappers (out of core; thin passthrough).
    Docker {
        /// Arguments forwarded verbatim to `docker`.
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Inspect the rollback log.
    Rollback {
        #[command(subcommand)]
        action: RollbackAction,
    },
}

#[derive(Subcommand)]
enum FilesAction {
    /// List files the current workflow state directory knows about.
    List,
}

#[derive(Subcommand)]
enum WorkflowsAction {
    /// List saved workflows.
    List,
    /// Create a new (empty, or file-seeded) workflow.
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print a saved workflow's plan as JSON.
    Show { name: String },
    /// Run a saved workflow.
    Run {
        name: String,
        #[arg(long = "var", value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete a saved workflow.
    Delete {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Export a workflow to a package file.
    Export {
        name: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Import a workflow package.
    Import {
        path: PathBuf,
        #[arg(long)]
        rename: Option<String>,
        #[arg(long)]
        replace: bool,
    },
}

#[derive(Subcommand)]
enum RollbackAction {
    /// List known transactions, most recent first.
    List,
    /// Show the most recent transaction.
    Last,
    /// Show one transaction by id prefix.
    Transaction { id: String },
    /// Show one operation by id.
    Operation { id: String },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    if init_telemetry(telemetry_config).is_err() {
        let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
    }

    let code = run(&cli).await;
    shutdown_telemetry();
    std::process::exit(code);
}

async fn run(cli: &Cli) -> i32 {
    if let Some(profile) = &cli.profile {
        if std::env::var("SHELLFORGE_STATE_DIR").is_err() {
            std::env::set_var("SHELLFORGE_STATE_DIR", orchestrator::state_dir().join("profiles").join(profile));
        }
    }
    let app = orchestrator::Application::new(cli.dry_run, cli.yes, cli.limits);

    let result = match &cli.command {
        Commands::Files { action } => run_files(action),
        Commands::Workflows { action } => run_workflows(&app, action).await,
        Commands::Generate { request, save_as } => run_generate(&app, request, save_as.as_deref()).await,
        Commands::Docker { args } => run_docker(args).await,
        Commands::Rollback { action } => run_rollback(action),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            1
        }
    }
}

fn run_files(action: &FilesAction) -> anyhow::Result<i32> {
    match action {
        FilesAction::List => {
            for name in orchestrator::list_workflow_names()? {
                println!("{name}");
            }
            Ok(0)
        }
    }
}

async fn run_workflows(app: &orchestrator::Application, action: &WorkflowsAction) -> anyhow::Result<i32> {
    match action {
        WorkflowsAction::List => {
            for name in orchestrator::list_workflow_names()? {
                println!("{name}");
            }
            Ok(0)
        }
        WorkflowsAction::Create { name, description, file } => {
            orchestrator::create_workflow(name, description.clone(), file.as_deref())?;
            info!(workflow = %name, "workflow created");
            Ok(0)
        }
        WorkflowsAction::Show { name } => {
            let plan = orchestrator::load_workflow(name)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(0)
        }
        WorkflowsAction::Run { name, vars, dry_run } => run_and_report(app, name, vars, *dry_run).await,
        WorkflowsAction::Delete { name, force } => {
            if !force {
                print!("delete workflow '{name}'? [y/N] ");
                use std::io::Write;
                let _ = std::io::stdout().flush();
                let mut line = String::new();
                std::io::stdin().read_line(&mut line)?;
                if !line.trim().eq_ignore_ascii_case("y") {
                    println!("aborted");
                    return Ok(1);
                }
            }
            orchestrator::delete_workflow(name)?;
            Ok(0)
        }
        WorkflowsAction::Export { name, output } => {
            let plan = orchestrator::load_workflow(name)?;
            let output = output.clone().unwrap_or_else(|| PathBuf::from(format!("{name}.shellforge-package.json")));
            loader::export_package(&plan, name, std::env::var("USER").ok(), &output)?;
            println!("exported to {}", output.display());
            Ok(0)
        }
        WorkflowsAction::Import { path, rename, replace } => {
            let package = loader::import_package(path)?;
            let name = rename.clone().unwrap_or_else(|| package.manifest.name.clone());
            let target = orchestrator::workflows_dir().join(format!("{name}.json"));
            if target.exists() && !replace {
                anyhow::bail!("workflow '{name}' already exists; pass --replace to overwrite");
            }
            std::fs::create_dir_all(orchestrator::workflows_dir())?;
            loader::save_plan_to_file(&package.plan, target)?;
            println!("imported workflow '{name}'");
            Ok(0)
        }
    }
}

async fn run_and_report(app: &orchestrator::Application, name: &str, vars: &[(String, serde_json::Value)], dry_run: bool) -> anyhow::Result<i32> {
    let outcome = app.run_workflow(name, vars, dry_run).await?;
    println!("{}", serde_json::to_string_pretty(&outcome.state)?);
    if !outcome.rollback_failures.is_empty() {
        for failure in &outcome.rollback_failures {
            error!(failure = %failure, "rollback failure");
        }
    }
    Ok(orchestrator::outcome_exit_code(&outcome))
}

async fn run_generate(app: &orchestrator::Application, request: &str, save_as: Option<&str>) -> anyhow::Result<i32> {
    let context = domain::SourceContextSnapshot {
        cwd: std::env::current_dir().map(|p| p.to_string_lossy().to_string()).unwrap_or_default(),
        project_root: None,
        project_type: None,
    };

    let plan = match &app.ai {
        Some(ai) => generator::generate_plan(ai.as_ref(), request, context).await,
        None => {
            error!("no AI collaborator configured (set SHELLFORGE_AI_ENDPOINT); falling back");
            generator::generate_plan(&NoAi, request, context).await
        }
    };

    if let Some(name) = save_as {
        std::fs::create_dir_all(orchestrator::workflows_dir())?;
        loader::save_plan_to_file(&plan, orchestrator::workflows_dir().join(format!("{name}.json")))?;
        println!("saved generated plan as workflow '{name}'");
    } else {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    }
    Ok(0)
}

struct NoAi;

#[async_trait::async_trait]
impl collaborators::AiCollaborator for NoAi {
    async fn generate(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<String, collaborators::AiError> {
        Err(collaborators::AiError::Unavailable("no AI collaborator configured".to_string()))
    }
}

async fn run_docker(args: &[String]) -> anyhow::Result<i32> {
    let status = tokio::process::Command::new("docker").args(args).status().await?;
    Ok(status.code().unwrap_or(1))
}

fn run_rollback(action: &RollbackAction) -> anyhow::Result<i32> {
    match action {
        RollbackAction::List => {
            for meta in rollback::list_transactions(orchestrator::rollback_dir())? {
                println!("{} [{:?}] {} - {}", meta.id, meta.status, meta.start.to_rfc3339(), meta.description);
            }
            Ok(0)
        }
        RollbackAction::Last => {
            let transactions = rollback::list_transactions(orchestrator::rollback_dir())?;
            match transactions.first() {
                Some(meta) => {
                    println!("{}", serde_json::to_string_pretty(meta)?);
                    Ok(0)
                }
                None => {
                    println!("no transactions recorded");
                    Ok(1)
                }
            }
        }
        RollbackAction::Transaction { id } => match rollback::load_by_prefix(orchestrator::rollback_dir(), id)? {
            Some(txn) => {
                println!("{}", serde_json::to_string_pretty(txn.meta())?);
                for record in txn.records() {
                    println!("{}", serde_json::to_string_pretty(record)?);
                }
                Ok(0)
            }
            None => {
                error!(id = %id, "transaction not found");
                Ok(1)
            }
        },
        RollbackAction::Operation { id } => match rollback::find_operation(orchestrator::rollback_dir(), id)? {
            Some((meta, record)) => {
                println!("transaction {}: {}", meta.id, serde_json::to_string_pretty(&record)?);
                Ok(0)
            }
            None => {
                error!(id = %id, "operation not found");
                Ok(1)
            }
        },
    }
}
