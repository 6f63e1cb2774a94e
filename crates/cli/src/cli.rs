use crate::commands::Command;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "buildstash")]
#[command(about = "Run tasks from a task file, restoring their outputs from a local cache")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: crate::tracing::LogLevel,

    #[arg(long, global = true, help = "Output logs in JSON format")]
    pub json: bool,

    #[arg(
        long,
        short = 'p',
        global = true,
        help = "Project directory; task and output paths are relative to it",
        default_value = "."
    )]
    pub project: PathBuf,

    #[arg(
        long,
        global = true,
        help = "Task file, relative to the project directory [default: buildstash.tasks.toml]"
    )]
    pub tasks: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        help = "Cache configuration file, relative to the project directory [default: buildstash.toml]"
    )]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Show version information")]
    Version,
    #[command(about = "Print the cache key of a task")]
    Key {
        #[arg(help = "Name of the task in the task file")]
        task: String,
    },
    #[command(about = "Explain how a task differs from its last recorded run")]
    Diff {
        #[arg(help = "Name of the task in the task file")]
        task: String,
    },
    #[command(about = "Run a task, skipping it when its outputs are cached")]
    Run {
        #[arg(help = "Name of the task in the task file")]
        task: String,
    },
}

impl From<Commands> for Command {
    fn from(cmd: Commands) -> Self {
        match cmd {
            Commands::Version => Self::Version,
            Commands::Key { task } => Self::Key { task },
            Commands::Diff { task } => Self::Diff { task },
            Commands::Run { task } => Self::Run { task },
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
