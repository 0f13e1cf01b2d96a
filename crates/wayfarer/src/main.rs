//! Offline tooling for wayfarer runs.
//!
//! The browser driver lives in the host application, so this binary works on
//! what a run leaves behind: checkpoints and message logs.
//!
//! # Examples
//!
//! ```sh
//! # Summarize the latest checkpoint of a run
//! wayfarer inspect checkpoints/run-18c3f0a2b-0000/step-012.json
//!
//! # Query the retrieval memory stored in a checkpoint
//! wayfarer recall checkpoints/run-18c3f0a2b-0000/step-012.json --query "shipping cost"
//!
//! # Estimate the prompt cost of a message log, with the full tool catalog
//! wayfarer estimate messages.json --with-tools
//!
//! # Print the tool catalog as JSON
//! wayfarer tools
//! ```

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use wayfarer::Message;
use wayfarer::agent::checkpoint::CheckpointStore;
use wayfarer::context::retrieval::format_hits;
use wayfarer::context::tokens::{estimate_message_tokens, estimate_tool_schema_tokens};
use wayfarer::tools::ToolCatalog;

#[derive(Parser)]
#[command(name = "wayfarer", version, about = "Inspect wayfarer checkpoints and message logs")]
struct Cli {
    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Describe a checkpoint file
    Inspect {
        checkpoint: PathBuf,
        /// Also print the window messages
        #[arg(long)]
        messages: bool,
    },
    /// Search the retrieval memory stored in a checkpoint
    Recall {
        checkpoint: PathBuf,
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Character budget for the printed hits
        #[arg(long, default_value_t = 2_000)]
        max_chars: usize,
    },
    /// Estimate the token cost of a JSON array of messages
    Estimate {
        messages: PathBuf,
        /// Include the schemas of the full tool catalog
        #[arg(long)]
        with_tools: bool,
    },
    /// Print the tool catalog
    Tools {
        /// Names only
        #[arg(long)]
        names: bool,
    },
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn inspect(path: &Path, show_messages: bool) -> Result<String, String> {
    let checkpoint = CheckpointStore::load(path).map_err(|e| e.to_string())?;
    let mut out = checkpoint.describe();
    if show_messages {
        for message in checkpoint.window.to_messages() {
            let text = message.text();
            out.push_str(&format!(
                "\n\n[{:?}] {}",
                message.role,
                wayfarer::truncate_chars(&text, 500)
            ));
        }
    }
    Ok(out)
}

fn recall(path: &Path, query: &str, limit: usize, max_chars: usize) -> Result<String, String> {
    let checkpoint = CheckpointStore::load(path).map_err(|e| e.to_string())?;
    debug!(entries = checkpoint.retrieval.len(), "searching retrieval memory");
    let hits = checkpoint.retrieval.search(query, limit);
    if hits.is_empty() {
        return Ok("no matching entries".to_string());
    }
    Ok(format_hits(&hits, max_chars))
}

fn estimate(path: &Path, with_tools: bool) -> Result<String, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let messages: Vec<Message> =
        serde_json::from_str(&raw).map_err(|e| format!("{} is not a message array: {e}", path.display()))?;
    let message_tokens = estimate_message_tokens(&messages);
    let mut out = format!("{} message(s), ~{message_tokens} tokens", messages.len());
    if with_tools {
        let catalog = ToolCatalog::new();
        let schema_tokens = estimate_tool_schema_tokens(catalog.definitions());
        out.push_str(&format!(
            "\n{} tool schema(s), ~{schema_tokens} tokens\ntotal ~{} tokens",
            catalog.len(),
            message_tokens + schema_tokens
        ));
    }
    Ok(out)
}

fn tools(names_only: bool) -> Result<String, String> {
    let catalog = ToolCatalog::new();
    if names_only {
        return Ok(catalog.names().join("\n"));
    }
    serde_json::to_string_pretty(catalog.definitions()).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match &cli.command {
        Command::Inspect { checkpoint, messages } => inspect(checkpoint, *messages),
        Command::Recall {
            checkpoint,
            query,
            limit,
            max_chars,
        } => recall(checkpoint, query, *limit, *max_chars),
        Command::Estimate { messages, with_tools } => estimate(messages, *with_tools),
        Command::Tools { names } => tools(*names),
    };

    match result {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
