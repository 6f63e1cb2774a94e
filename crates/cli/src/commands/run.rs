//! `buildstash run`: run a task unless its outputs are cached

use super::Context;
use crate::errors::{CliError, CliResult};
use buildstash_cache::{CacheOutcome, TaskExecution, TaskFailure};
use std::fmt;
use std::path::Path;
use std::process::Command;

/// Run `task`, restoring its outputs from the cache when possible.
///
/// Returns a summary of what happened; a failing command is an error.
pub fn execute_run(ctx: &Context, task: &str) -> CliResult<String> {
    let (definition, declaration) = ctx.declaration(task)?;
    let executor = ctx.executor()?;
    let mut execution = executor.execute(&declaration, || {
        run_command(&definition.command, &ctx.project_dir)
    });
    if let Some(source) = execution.failure.take() {
        return Err(CliError::TaskFailed {
            task: task.to_string(),
            source,
        });
    }
    Ok(RunSummary {
        task,
        execution: &execution,
    }
    .to_string())
}

fn run_command(command: &[String], dir: &Path) -> Result<(), TaskFailure> {
    let (program, args) = command.split_first().ok_or("command is empty")?;
    tracing::debug!(program, ?args, dir = %dir.display(), "Spawning task command");
    let status = Command::new(program).args(args).current_dir(dir).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("command exited with {status}").into())
    }
}

/// Outcome line, then the key and any differences that forced a run
struct RunSummary<'a> {
    task: &'a str,
    execution: &'a TaskExecution,
}

impl fmt::Display for RunSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task = self.task;
        match &self.execution.outcome {
            CacheOutcome::SkippedEmptySources => write!(f, "{task}: NO-SOURCE")?,
            CacheOutcome::Hit => write!(f, "{task}: FROM-CACHE")?,
            CacheOutcome::Stored => write!(f, "{task}: executed, outputs cached")?,
            CacheOutcome::Executed => write!(f, "{task}: executed")?,
            CacheOutcome::NotCacheable { reason } => {
                write!(f, "{task}: executed without cache ({reason})")?;
            }
            CacheOutcome::StoreFailed { reason } => {
                write!(f, "{task}: executed, outputs not cached ({reason})")?;
            }
            CacheOutcome::StoreAbandoned => write!(f, "{task}: executed, cancelled before caching")?,
        }
        if let Some(key) = &self.execution.cache_key {
            write!(f, "\nkey: {key}")?;
        }
        for difference in &self.execution.differences {
            write!(f, "\n  {difference}")?;
        }
        Ok(())
    }
}
