mod cli;

use anyhow::{bail, Result};
use clap::Parser;
use colored::*;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reconflow::adapters::SHODAN_KEY;
use reconflow::config::Config;
use reconflow::output::{print_summary, Progress};
use reconflow::pipeline::{plan, run_graph, RunMode, RunOptions};
use reconflow::store::ResultStore;
use reconflow::target::classify;
use reconflow::AdapterRegistry;

use crate::cli::{Cli, Command, RunArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reconflow=info"));
    tracing_subscriber::fmt()
        .with_env_filter(with_verbosity(filter, cli.verbose))
        .with_writer(std::io::stderr)
        .init();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;

    match cli.command {
        Command::Aim { target, output_dir } => {
            let target = target.trim();
            let kind = classify(target);
            let store = ResultStore::new(output_dir.unwrap_or_else(|| config.storage.output_dir.clone()));
            store.reset(target).await?;

            info!(target, %kind, path = %store.path().display(), "result document reset");
            println!(
                "{} {} {}",
                "⟦AIMED⟧".truecolor(0, 255, 65).bold(),
                target.truecolor(255, 255, 255).bold(),
                format!("({})", kind).truecolor(128, 128, 128)
            );
            if !kind.is_scannable() {
                println!(
                    "{} {}",
                    "[!]".truecolor(255, 140, 0).bold(),
                    "scan and probe only accept an IP address or a domain".truecolor(255, 140, 0)
                );
            }
        }
        Command::Scan { target, run } => {
            execute(RunMode::Scan, &target, config.credentials(), &config, run).await?;
        }
        Command::Probe { target, shodan, run } => {
            let mut credentials = config.credentials();
            if let Some(key) = shodan.filter(|k| !k.trim().is_empty()) {
                credentials.insert(SHODAN_KEY.to_string(), key);
            }
            execute(RunMode::Probe, &target, credentials, &config, run).await?;
        }
        Command::Tools => list_tools(&config),
    }

    Ok(())
}

/// `-v` raises the crate to debug on top of whatever `RUST_LOG` selected.
fn with_verbosity(filter: EnvFilter, verbose: bool) -> EnvFilter {
    if !verbose {
        return filter;
    }
    match "reconflow=debug".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

async fn execute(
    mode: RunMode,
    target: &str,
    credentials: HashMap<String, String>,
    config: &Config,
    args: RunArgs,
) -> Result<()> {
    let mut scheduler = config.scheduler_options();
    if let Some(workers) = args.workers {
        if workers == 0 {
            bail!("--workers must be greater than 0");
        }
        scheduler.workers = workers;
    }
    if let Some(secs) = args.timeout {
        if secs == 0 {
            bail!("--timeout must be greater than 0");
        }
        scheduler.task_timeout = Duration::from_secs(secs);
    }

    let options = RunOptions {
        scheduler,
        output_dir: args.output_dir.unwrap_or_else(|| config.storage.output_dir.clone()),
        tool_paths: config.tool_paths(),
        progress: if args.quiet {
            Progress::Lines
        } else {
            Progress::Bar
        },
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping run");
            trigger.cancel();
        }
    });

    let summary = run_graph(mode, target, credentials, &options, cancel).await?;
    let results = ResultStore::new(&options.output_dir);
    print_summary(&summary, results.path());
    Ok(())
}

fn list_tools(config: &Config) {
    let registry = AdapterRegistry::with_builtin(&config.tool_paths());

    println!("{}", "⟦TOOLS⟧".truecolor(191, 64, 191).bold());
    for name in registry.list() {
        if let Some(adapter) = registry.get(&name) {
            println!(
                "  {:<10} {:<22} {}",
                name.truecolor(255, 255, 255).bold(),
                adapter.kind().to_string().truecolor(0, 212, 255),
                adapter.description().truecolor(128, 128, 128)
            );
        }
    }

    for mode in [RunMode::Scan, RunMode::Probe] {
        println!("\n{}", format!("⟦{}⟧", mode.to_string().to_uppercase()).truecolor(255, 140, 0).bold());
        for (tool, dependencies) in plan(mode, true) {
            let after = if dependencies.is_empty() {
                "-".to_string()
            } else {
                dependencies.join(", ")
            };
            println!(
                "  {:<10} {} {}",
                tool.truecolor(255, 255, 255),
                "after".truecolor(128, 128, 128),
                after.truecolor(0, 212, 255)
            );
        }
    }
    println!(
        "\n{}",
        "uncover only runs in probe mode when a shodan key is configured".truecolor(128, 128, 128)
    );
}
