//! Trellis CLI - Command-line interface for the Trellis runtime
//!
//! Provides subcommands for initializing a store, starting the sample
//! workflows, resuming their bookmarks and inspecting persisted instances.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use trellis::activities::samples;
use trellis::runtime::executor::UnhandledExceptionAction;
use trellis::runtime::{Control, Runtime, RuntimeConfig, Value};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Cooperative activity execution runtime", long_about = None)]
struct Cli {
    /// Root directory for runtime storage
    #[arg(short, long, default_value = ".trellis")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new instance store
    Init {
        /// Upper bound on host waits, in milliseconds
        #[arg(long, default_value = "30000")]
        lock_timeout_ms: u64,

        /// What to do with unhandled faults: terminate, cancel or abort
        #[arg(long, default_value = "terminate")]
        on_unhandled: String,

        /// Refuse to persist while a fault is propagating
        #[arg(long)]
        no_persist_exceptions: bool,
    },

    /// Show runtime status
    Status,

    /// List the sample definitions
    Definitions,

    /// Start a new workflow instance
    Start {
        /// Definition name
        definition: String,

        /// Root input as NAME=JSON (repeatable)
        #[arg(short, long)]
        input: Vec<String>,
    },

    /// List persisted instances
    List,

    /// Show one instance
    Inspect {
        /// Instance id (UUID)
        id: String,
    },

    /// Show the bookmarks an instance waits on
    Bookmarks {
        /// Instance id (UUID)
        id: String,
    },

    /// Resume a bookmark
    Resume {
        /// Instance id (UUID)
        id: String,

        /// Bookmark name
        bookmark: String,

        /// Resumption value (JSON)
        #[arg(default_value = "null")]
        value: String,
    },

    /// Cancel an instance
    Cancel {
        /// Instance id (UUID)
        id: String,
    },
}

fn control(root: PathBuf) -> anyhow::Result<Control> {
    let runtime = Runtime::load(root)?;
    let mut control = Control::new(runtime);
    for (name, definition) in samples::catalog() {
        control.register(name, definition)?;
    }
    Ok(control)
}

fn parse_id(id: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("invalid instance id: {}", id))
}

fn parse_value(text: &str) -> anyhow::Result<Value> {
    serde_json::from_str(text).with_context(|| format!("invalid JSON value: {}", text))
}

fn parse_inputs(inputs: &[String]) -> anyhow::Result<BTreeMap<String, Value>> {
    inputs
        .iter()
        .map(|input| {
            let (name, value) = input
                .split_once('=')
                .with_context(|| format!("expected NAME=JSON, got {}", input))?;
            Ok((name.to_string(), parse_value(value)?))
        })
        .collect()
}

fn parse_action(action: &str) -> anyhow::Result<UnhandledExceptionAction> {
    match action {
        "terminate" => Ok(UnhandledExceptionAction::Terminate),
        "cancel" => Ok(UnhandledExceptionAction::Cancel),
        "abort" => Ok(UnhandledExceptionAction::Abort),
        other => anyhow::bail!("unknown unhandled-exception action: {}", other),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            lock_timeout_ms,
            on_unhandled,
            no_persist_exceptions,
        } => {
            let root = cli.root.clone();
            let config = RuntimeConfig {
                root: cli.root,
                acquire_lock_timeout: Duration::from_millis(lock_timeout_ms),
                persist_exceptions: !no_persist_exceptions,
                unhandled_exception_action: parse_action(&on_unhandled)?,
                ..RuntimeConfig::default()
            };

            Runtime::init(config)?;
            println!("Initialized Trellis store at {:?}", root);
        }

        Commands::Status => {
            let control = control(cli.root)?;
            print_json(&control.status())?;
        }

        Commands::Definitions => {
            for (name, definition) in samples::catalog() {
                println!("{}  ({})", name, definition.name());
            }
        }

        Commands::Start { definition, input } => {
            let mut control = control(cli.root)?;
            let summary = control.start(&definition, parse_inputs(&input)?)?;
            print_json(&summary)?;
        }

        Commands::List => {
            let control = control(cli.root)?;
            let entries = control.list();
            if entries.is_empty() {
                println!("No persisted instances");
            }
            for entry in entries {
                println!(
                    "{}  {:<10} {}  {}  [{}]",
                    entry.instance_id,
                    entry.status.to_string(),
                    entry.persisted_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.root_activity,
                    entry.bookmarks.join(", ")
                );
            }
        }

        Commands::Inspect { id } => {
            let control = control(cli.root)?;
            print_json(&control.inspect(&parse_id(&id)?)?)?;
        }

        Commands::Bookmarks { id } => {
            let control = control(cli.root)?;
            let bookmarks = control.bookmarks(&parse_id(&id)?)?;
            if bookmarks.is_empty() {
                println!("No bookmarks");
            }
            for bookmark in bookmarks {
                println!("  {}", bookmark);
            }
        }

        Commands::Resume { id, bookmark, value } => {
            let mut control = control(cli.root)?;
            let (result, summary) = control.resume(&parse_id(&id)?, &bookmark, parse_value(&value)?)?;
            println!("Resumption: {:?}", result);
            print_json(&summary)?;
        }

        Commands::Cancel { id } => {
            let mut control = control(cli.root)?;
            print_json(&control.cancel(&parse_id(&id)?)?)?;
        }
    }

    Ok(())
}
