use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding config.json (defaults to ~/.artxfer)
    #[clap(long = "config-dir", global = true, hide = true)]
    pub config_dir: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(
        about = "Transfer every repository under SOURCE_ROOT into TARGET_ROOT, resuming an interrupted run",
        name = "transfer",
        display_order = 1
    )]
    Transfer {
        #[clap(help = "Directory whose sub-directories are the repositories to transfer")]
        source_root: PathBuf,
        #[clap(help = "Directory receiving one sub-directory per repository")]
        target_root: PathBuf,
        #[clap(short = 't', long = "threads", help = "Number of worker threads (default 3)")]
        threads: Option<usize>,
        #[clap(long = "ignore-state", help = "Start from scratch instead of resuming the previous run")]
        ignore_state: bool,
        #[clap(long = "include-repos", help = "Only these repositories, ';'-separated, '*' and '?' allowed")]
        include_repos: Option<String>,
        #[clap(long = "exclude-repos", help = "Skip these repositories, ';'-separated, '*' and '?' allowed")]
        exclude_repos: Option<String>,
        #[clap(short, long, help = "Print verbose diagnostic logs for debugging")]
        verbose: bool,
        #[clap(long, help = "Emit a one-line JSON summary when done")]
        json: bool,
        #[clap(short, long, help = "No progress display and no human summary")]
        quiet: bool,
    },
    #[clap(about = "Show the persisted state of the last transfer", name = "status", display_order = 2)]
    Status {
        #[clap(long, help = "Print the state as JSON")]
        json: bool,
    },
    #[clap(about = "Ask a running transfer to stop gracefully", name = "stop", display_order = 3)]
    Stop {},
    #[clap(about = "Change the worker count of a running transfer", name = "threads", display_order = 4)]
    Threads { count: usize },
}
