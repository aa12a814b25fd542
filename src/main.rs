use anyhow::Result;
use clap::Parser;

use artxfer::cli::{Cli, Commands};
use artxfer::commands::{self, RunOptions, TransferArgs, parse_patterns};
use artxfer::config::Config;
use artxfer::logging::init_logging;
use artxfer::util::try_enable_ansi_on_windows;

fn main() -> Result<()> {
    try_enable_ansi_on_windows();
    let cli = Cli::parse();
    let config = match &cli.config_dir {
        Some(dir) => Config::load_from(dir)?,
        None => Config::init()?,
    };

    match cli.command {
        Commands::Transfer {
            source_root,
            target_root,
            threads,
            ignore_state,
            include_repos,
            exclude_repos,
            verbose,
            json,
            quiet,
        } => {
            // the progress display owns the terminal, so the run logs to a file
            let session_log = init_logging(verbose, Some(&config.log_dir()))?;
            let args = TransferArgs {
                source_root,
                target_root,
                threads,
                run: RunOptions {
                    ignore_state,
                    include_repos: parse_patterns(include_repos.as_deref()),
                    exclude_repos: parse_patterns(exclude_repos.as_deref()),
                },
                json,
                quiet,
            };
            commands::handle_transfer(&config, args, session_log)
        }
        Commands::Status { json } => {
            init_logging(false, None)?;
            commands::handle_status(&config, json)
        }
        Commands::Stop {} => {
            init_logging(false, None)?;
            commands::handle_stop(&config)
        }
        Commands::Threads { count } => {
            init_logging(false, None)?;
            commands::handle_threads(&config, count)
        }
    }
}
