use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "reconflow")]
#[command(version)]
#[command(about = "Dependency-aware orchestration of ProjectDiscovery recon tools", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long, global = true, help = "Config file path (defaults to the user config directory)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a fresh result document for a target
    Aim {
        target: String,

        #[arg(short = 'o', long, help = "Directory holding results.json")]
        output_dir: Option<PathBuf>,
    },

    /// Broad run: discovery, HTTP probing and crawling
    Scan {
        target: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Precise run: discovery, HTTP probing and template matching
    Probe {
        target: String,

        #[arg(long, value_name = "KEY", help = "Shodan API key, enables passive search")]
        shodan: Option<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// List the available tools and the stages of each mode
    Tools,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[arg(short, long, help = "Number of tools run concurrently")]
    pub workers: Option<usize>,

    #[arg(long, value_name = "SECS", help = "Per-tool timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(short = 'o', long, help = "Directory holding results.json")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, help = "Hide the progress bar, keep per-tool status lines")]
    pub quiet: bool,
}
