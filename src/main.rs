mod cli;
mod commands;
mod config;
mod engine;
mod progress;
mod provider;
mod state;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command, StateCommand};
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: cli.config,
    };

    match cli.command {
        Command::Validate => commands::plan::validate(&ctx),
        Command::Graph(args) => commands::plan::graph(&ctx, args.format),
        Command::Plan(args) => commands::plan::plan(&ctx, args.target.as_deref(), args.destroy),
        Command::Apply(args) => commands::apply::apply(&ctx, &args),
        Command::Destroy(args) => commands::apply::destroy(&ctx, &args),
        Command::Refresh(args) => commands::apply::refresh(&ctx, args.jobs),
        Command::Output(args) => {
            commands::output::run(&ctx, args.name.as_deref(), args.reveal, args.json)
        }
        Command::State(cmd) => match cmd {
            StateCommand::List => commands::state::list(&ctx),
            StateCommand::Show { id } => commands::state::show(&ctx, &id),
            StateCommand::Rm { id } => commands::state::rm(&ctx, &id),
        },
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "stratum", &mut io::stdout());
            Ok(())
        }
    }
}
