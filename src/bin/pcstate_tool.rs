use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use rustmemodb_orm::state::{self, StateError};
use rustmemodb_orm::{Event, KernelConfig, PcState, TransitionFlags};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "pcstate-tool")]
#[command(about = "Developer tooling for the persistence-context state machine")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the outcome of every event in every state
    Table {
        #[arg(long)]
        json: bool,
    },
    /// Resolve a single event against a state
    Explain {
        #[arg(long)]
        state: String,
        #[arg(long)]
        event: String,
        #[arg(long)]
        flushed: bool,
        #[arg(long)]
        flushed_dirty: bool,
        #[arg(long)]
        dirty: bool,
        #[arg(long)]
        auto_clear_all: bool,
        #[arg(long)]
        active: bool,
        /// Sets `mutate` on write events
        #[arg(long)]
        mutate: bool,
        /// Sets `logical` on flush events
        #[arg(long)]
        logical: bool,
    },
    /// Parse and validate a JSON kernel configuration
    CheckConfig {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Serialize)]
struct TableRow {
    state: &'static str,
    event: String,
    next: Option<&'static str>,
    effects: Vec<String>,
    error: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Table { json } => print_table(json),
        Command::Explain {
            state,
            event,
            flushed,
            flushed_dirty,
            dirty,
            auto_clear_all,
            active,
            mutate,
            logical,
        } => {
            let flags = TransitionFlags {
                flushed,
                flushed_dirty,
                has_dirty_fields: dirty,
                auto_clear_all,
                active,
            };
            explain(&state, &event, mutate || logical, flags)
        }
        Command::CheckConfig { file } => check_config(&file),
    }
}

fn event_label(event: Event) -> String {
    match event {
        Event::BeforeWrite { mutate }
        | Event::BeforeOptimisticWrite { mutate }
        | Event::BeforeNontransactionalWrite { mutate } => {
            format!("{}(mutate={})", event.name(), mutate)
        }
        Event::BeforeFlush { logical } | Event::Nonprovisional { logical } => {
            format!("{}(logical={})", event.name(), logical)
        }
        _ => event.name().to_string(),
    }
}

fn table_rows() -> Vec<TableRow> {
    let mut rows = Vec::new();
    for from in PcState::ALL {
        for event in Event::samples() {
            let row = match state::transition(from, event, TransitionFlags::default()) {
                Ok(transition) => TableRow {
                    state: from.name(),
                    event: event_label(event),
                    next: Some(transition.next.name()),
                    effects: transition.effects.iter().map(|e| e.to_string()).collect(),
                    error: None,
                },
                Err(err) => TableRow {
                    state: from.name(),
                    event: event_label(event),
                    next: None,
                    effects: Vec::new(),
                    error: Some(reason(&err)),
                },
            };
            rows.push(row);
        }
    }
    rows
}

fn reason(err: &StateError) -> String {
    match err {
        StateError::IllegalTransition { reason, .. } => reason.to_string(),
    }
}

fn print_table(json: bool) -> Result<()> {
    let rows = table_rows();
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in rows {
        match (row.next, row.error) {
            (Some(next), _) => println!(
                "{:<28} {:<40} -> {:<28} [{}]",
                row.state,
                row.event,
                next,
                row.effects.join(", ")
            ),
            (None, Some(error)) => {
                println!("{:<28} {:<40} !! {}", row.state, row.event, error)
            }
            (None, None) => {}
        }
    }
    Ok(())
}

fn explain(state_name: &str, event_name: &str, flag: bool, flags: TransitionFlags) -> Result<()> {
    let from = PcState::from_name(state_name)
        .ok_or_else(|| anyhow!("Unknown state '{}'", state_name))?;
    let event = Event::from_name(event_name, flag)
        .ok_or_else(|| anyhow!("Unknown event '{}'", event_name))?;

    match state::transition(from, event, flags) {
        Ok(transition) => {
            println!("{} --{}--> {}", from, event_label(event), transition.next);
            for effect in &transition.effects {
                println!("  effect: {}", effect);
            }
            if !transition.changes_state(from) {
                println!("  (state unchanged)");
            }
            Ok(())
        }
        Err(err) => Err(anyhow!("{}", err)),
    }
}

fn check_config(path: &Path) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config '{}'", path.display()))?;
    let config = KernelConfig::from_json(&text)
        .with_context(|| format!("Invalid config '{}'", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
