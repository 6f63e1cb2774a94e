//! buildstash CLI
//!
//! Runs tasks declared in a TOML task file through the task output cache.

// CLI binary needs to output to stdout/stderr - this is intentional
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod cli;
mod commands;
mod errors;
mod task_file;
mod tracing;

use crate::cli::parse;
use crate::commands::{Command, Context};
use crate::errors::{EXIT_CLI, EXIT_OK, exit_code_for};
use crate::tracing::{LOG_FORMAT_ENV, TracingConfig, TracingFormat};

fn main() {
    // NOTE: Using eprintln! in panic hook is intentional - tracing infrastructure
    // may be corrupted during a panic, so we use the most reliable output method.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    std::process::exit(run_main());
}

fn run_main() -> i32 {
    let cli::Cli {
        command,
        level,
        json,
        project,
        tasks,
        config,
    } = parse();

    let tracing_config = TracingConfig {
        format: if json {
            TracingFormat::Json
        } else {
            std::env::var(LOG_FORMAT_ENV)
                .ok()
                .and_then(|f| f.parse().ok())
                .unwrap_or(TracingFormat::Compact)
        },
        level: level.into(),
        ..Default::default()
    };
    if let Err(e) = crate::tracing::init_tracing(tracing_config) {
        eprintln!("{e:?}");
        return EXIT_CLI;
    }

    let command: Command = command.into();
    let _span = crate::command_span!(command_name(&command)).entered();
    let load = || Context::load(&project, tasks.as_deref(), config.as_deref());
    let result = match command {
        Command::Version => Ok(commands::version::get_version_info()),
        Command::Key { task } => load().and_then(|ctx| commands::key::execute_key(&ctx, &task)),
        Command::Diff { task } => {
            load().and_then(|ctx| commands::diff::execute_diff(&ctx, &task))
        }
        Command::Run { task } => load().and_then(|ctx| commands::run::execute_run(&ctx, &task)),
    };

    match result {
        Ok(output) => {
            println!("{output}");
            EXIT_OK
        }
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("{:?}", miette::Report::new(e));
            code
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Version => "version",
        Command::Key { .. } => "key",
        Command::Diff { .. } => "diff",
        Command::Run { .. } => "run",
    }
}
