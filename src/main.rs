mod badge;
mod cli;
mod daily;
mod event;
mod ingest;
mod metrics;
mod server;
mod snapshot;
mod state;
mod store;
mod window;

use std::path::Path;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::badge::{format_bytes, format_rate};
use crate::cli::{Cli, Commands, OutputFormat};
use crate::daily::{read_persisted, today_utc};
use crate::server::run_events;
use crate::snapshot::Snapshot;
use crate::store::{JsonFileStore, StoreError};

fn print_snapshot(snap: &Snapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(snap).context("Encoding snapshot")?);
        }
        OutputFormat::Text => {
            if snap.tabs.is_empty() {
                println!("<no tabs>");
            }
            for tab in &snap.tabs {
                let label = if tab.title.is_empty() { tab.url.as_str() } else { tab.title.as_str() };
                println!(
                    "{}\t{}\t{}\t{}",
                    tab.tab_id,
                    format_rate(tab.current_speed),
                    format_bytes(tab.total_bytes),
                    label
                );
            }
            println!("today\t{}", format_bytes(snap.daily_total));
        }
    }
    Ok(())
}

fn print_daily(store_path: &Path, format: OutputFormat) -> Result<()> {
    let store = JsonFileStore::open(store_path)
        .with_context(|| format!("Opening state store {}", store_path.display()))?;
    let state = read_persisted(&store, today_utc())
        .with_context(|| format!("Reading daily counter from {}", store_path.display()))?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&state).context("Encoding daily counter")?),
        OutputFormat::Text => println!("{}\t{}\t{} bytes", state.date, format_bytes(state.total_bytes), state.total_bytes),
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let cli = Cli::parse();
    let result: Result<()> = match cli.command {
        Some(Commands::Run(run)) => run_events(&cli.store, &run).and_then(|snap| print_snapshot(&snap, run.format)),
        Some(Commands::Daily { format }) => print_daily(&cli.store, format),
        None => {
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(err) = result {
        let code = exit_code_for_error(&err);
        eprintln!("error: {err:?}");
        std::process::exit(code);
    }
}

pub(crate) fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    // 2: event input unreadable, 3: state store unusable, 1: other
    for cause in err.chain() {
        if cause.is::<StoreError>() {
            return 3;
        }
        if let Some(ioe) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            return match ioe.kind() {
                NotFound | PermissionDenied => 2,
                _ => 1,
            };
        }
    }
    1
}
