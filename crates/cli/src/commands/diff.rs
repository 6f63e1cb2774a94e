//! `buildstash diff`: explain why a task would run

use super::Context;
use crate::errors::CliResult;

/// Describe how `task` differs from its last recorded execution.
pub fn execute_diff(ctx: &Context, task: &str) -> CliResult<String> {
    let (_, declaration) = ctx.declaration(task)?;
    let explanation = ctx.executor()?.explain(&declaration)?;
    Ok(match explanation {
        None => format!("No history is available for task '{task}'"),
        Some(differences) if differences.is_empty() => {
            format!("Task '{task}' matches its last recorded state")
        }
        Some(differences) => differences.join("\n"),
    })
}
