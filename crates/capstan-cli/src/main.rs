//! CLI binary for running Capstan workflow pipelines.

mod console;
mod pipelines;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use capstan_engine::{
    BackoffPolicy, CheckpointStore, Engine, EngineConfig, ErrorPolicy, FileCheckpointStore,
    RunOutcome,
};
use capstan_graph::Graph;
use capstan_llm::{CompletionClient, HttpCompletionClient, LlmConfig, ScriptedClient};
use capstan_types::{State, ThreadId};

#[derive(Parser)]
#[command(name = "capstan", version, about = "Checkpointed workflow pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the document analysis pipeline over a markdown file
    Document {
        /// Input markdown file
        input: PathBuf,

        /// Thread id (default: derived from the input file name)
        #[arg(short, long)]
        thread: Option<String>,

        /// Checkpoint directory (default: .capstan/state)
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Use canned model responses instead of calling an endpoint
        #[arg(long)]
        scripted: bool,

        /// Attempts per step before the run fails
        #[arg(long, default_value = "3")]
        retry_limit: u32,

        /// Roll back to the last successful checkpoint on failure instead of
        /// retrying in place
        #[arg(long)]
        rollback: bool,
    },

    /// Run the requirements transformation pipeline with review gates
    Requirements {
        /// Input requirements file, one requirement per line
        input: PathBuf,

        /// Thread id (default: derived from the input file name)
        #[arg(short, long)]
        thread: Option<String>,

        /// Checkpoint directory (default: .capstan/state)
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Use canned model responses instead of calling an endpoint
        #[arg(long)]
        scripted: bool,

        /// Approve every gate without prompting
        #[arg(long)]
        approve: bool,
    },

    /// Show run status and checkpoint history for a thread
    Status {
        /// Thread id
        thread: String,

        /// Checkpoint directory (default: .capstan/state)
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Document {
            input,
            thread,
            state_dir,
            scripted,
            retry_limit,
            rollback,
        } => {
            let client = make_client(scripted, &document_script());
            let graph = Arc::new(pipelines::document_pipeline(client)?);
            let config = EngineConfig {
                retry_limit,
                error_policy: if rollback {
                    ErrorPolicy::Rollback
                } else {
                    ErrorPolicy::RetryInPlace
                },
                backoff: BackoffPolicy::standard(),
                ..Default::default()
            };
            cmd_run(&input, thread, state_dir, graph, config, false).await?;
        }
        Commands::Requirements {
            input,
            thread,
            state_dir,
            scripted,
            approve,
        } => {
            let client = make_client(scripted, &requirements_script());
            let graph = Arc::new(pipelines::requirements_pipeline(client)?);
            let config = EngineConfig {
                backoff: BackoffPolicy::standard(),
                ..Default::default()
            };
            cmd_run(&input, thread, state_dir, graph, config, approve).await?;
        }
        Commands::Status { thread, state_dir } => {
            cmd_status(&thread, state_dir).await?;
        }
    }

    Ok(())
}

fn make_client(scripted: bool, script: &[&str]) -> Arc<dyn CompletionClient> {
    if scripted {
        Arc::new(ScriptedClient::new(script.iter().copied()))
    } else {
        Arc::new(HttpCompletionClient::new(LlmConfig::from_env()))
    }
}

/// Canned responses for `--scripted` demo runs, enough for one pass plus a
/// couple of revise loops.
fn document_script() -> Vec<&'static str> {
    vec!["The document is a technical overview. Structure is clear; the goals section could name owners."]
}

fn requirements_script() -> Vec<&'static str> {
    vec![
        "R1 -> upload API\nR2 -> quota enforcement",
        "## Upload API\n\nGiven a valid file, the upload completes.\n\n## Quota Enforcement\n\nGiven an exhausted quota, the upload is refused.\n",
        "R1 -> upload API (revised)\nR2 -> quota enforcement (revised)",
        "## Upload API\n\nRevised criteria.\n",
    ]
}

fn default_state_dir(dir: Option<PathBuf>) -> PathBuf {
    dir.unwrap_or_else(|| PathBuf::from(".capstan/state"))
}

fn thread_for(input: &std::path::Path, explicit: Option<String>) -> ThreadId {
    match explicit {
        Some(id) => ThreadId::new(id),
        None => ThreadId::new(input.file_stem().unwrap_or_default().to_string_lossy()),
    }
}

async fn cmd_run(
    input: &std::path::Path,
    thread: Option<String>,
    state_dir: Option<PathBuf>,
    graph: Arc<Graph>,
    config: EngineConfig,
    auto_approve: bool,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(input)?;
    let thread = thread_for(input, thread);
    let store = Arc::new(FileCheckpointStore::new(default_state_dir(state_dir)));
    let engine = Engine::new(graph, store).with_config(config);

    println!("Thread: {thread}");
    let initial = State::new()
        .with("raw", serde_json::json!(raw))
        .with("source", serde_json::json!(input.display().to_string()));

    let mut outcome = engine.start(thread.clone(), initial).await?;
    loop {
        match outcome {
            RunOutcome::Suspended(pending) => {
                let decision = if auto_approve {
                    console::show_pending(&pending);
                    println!("\n(auto-approved)");
                    capstan_types::Decision::approve()
                } else {
                    console::ask(&pending)?
                };
                outcome = engine.resume(&thread, decision).await?;
            }
            RunOutcome::Completed { state, trace } => {
                if !trace.is_empty() {
                    println!("\nRecovered failures:");
                    for err in &trace {
                        println!("  {} (attempt {}): {}", err.step, err.attempt, err.message);
                    }
                }
                let output = state
                    .get_str("final_doc")
                    .or_else(|| state.get_str("report"));
                match output {
                    Some(text) => println!("\n{text}"),
                    None => println!("\nRun completed (no report field)."),
                }
                return Ok(());
            }
            RunOutcome::Failed(report) => {
                eprintln!("\nRun failed: {}", report.cause);
                for err in &report.trace {
                    eprintln!("  {} (attempt {}): {}", err.step, err.attempt, err.message);
                }
                std::process::exit(1);
            }
        }
    }
}

async fn cmd_status(thread: &str, state_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let store = FileCheckpointStore::new(default_state_dir(state_dir));
    let thread = ThreadId::new(thread);

    let history = store.history(&thread).await?;
    let Some(latest) = history.last() else {
        anyhow::bail!("no checkpoints recorded for thread '{thread}'");
    };

    println!("Thread: {thread}");
    println!("Status: {}", latest.status);
    println!("Position: {}", latest.position);
    println!("Seq: {}", latest.seq);
    println!("Checkpoints: {}", history.len());
    if !latest.error_trace.is_empty() {
        println!("Recorded failures: {}", latest.error_trace.len());
    }

    let fields: Vec<&str> = latest.state.values().keys().map(String::as_str).collect();
    println!("State fields: {}", fields.join(", "));
    Ok(())
}
