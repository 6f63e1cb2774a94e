//! `buildstash key`: print a task's cache key

use super::Context;
use crate::errors::CliResult;

/// Compute the cache key of `task` without running it.
pub fn execute_key(ctx: &Context, task: &str) -> CliResult<String> {
    let (_, declaration) = ctx.declaration(task)?;
    let key = ctx.executor()?.cache_key(&declaration)?;
    tracing::debug!(task, key = %key, "Computed cache key");
    Ok(key.to_hex())
}
