//! Command implementations

pub mod diff;
pub mod key;
pub mod run;
pub mod version;

use crate::errors::{CliError, CliResult};
use crate::task_file::{DEFAULT_TASK_FILE, TaskDefinition, TaskFile};
use buildstash_cache::{CacheConfig, SkipCachedExecutor, TaskDeclaration};
use std::path::{Path, PathBuf};

/// Default cache configuration file name, looked up in the project directory
pub const DEFAULT_CONFIG_FILE: &str = "buildstash.toml";

#[derive(Debug, Clone)]
pub enum Command {
    Version,
    Key { task: String },
    Diff { task: String },
    Run { task: String },
}

/// Everything a command needs to know about the project it runs in.
#[derive(Debug, Clone)]
pub struct Context {
    pub project_dir: PathBuf,
    pub task_file: PathBuf,
    pub config: CacheConfig,
}

impl Context {
    /// Resolve the project directory and load its configuration. Relative
    /// `task_file` and `config` paths are taken from the project directory.
    pub fn load(
        project_dir: &Path,
        task_file: Option<&Path>,
        config: Option<&Path>,
    ) -> CliResult<Self> {
        let project_dir = std::fs::canonicalize(project_dir)
            .map_err(|e| CliError::file_error("canonicalize", project_dir, e))?;
        let task_file = project_dir.join(task_file.unwrap_or(Path::new(DEFAULT_TASK_FILE)));
        let config_path = project_dir.join(config.unwrap_or(Path::new(DEFAULT_CONFIG_FILE)));
        let config = CacheConfig::load(&config_path)?;
        tracing::debug!(
            project_dir = %project_dir.display(),
            task_file = %task_file.display(),
            "Loaded project context"
        );
        Ok(Self {
            project_dir,
            task_file,
            config,
        })
    }

    /// Parse the task file and declare `task`.
    pub fn declaration(&self, task: &str) -> CliResult<(TaskDefinition, TaskDeclaration)> {
        let file = TaskFile::load(&self.task_file)?;
        let definition = file.task(task, &self.task_file)?.clone();
        let declaration = definition.declaration(task)?;
        Ok((definition, declaration))
    }

    /// Cache executor for this project.
    pub fn executor(&self) -> CliResult<SkipCachedExecutor> {
        Ok(SkipCachedExecutor::from_config(
            &self.config,
            &self.project_dir,
        )?)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::project;
    use super::*;

    #[test]
    fn context_reads_config_from_project() {
        let (dir, ctx) = project();
        assert_eq!(ctx.config.store_dir, Some(dir.path().join("store")));
        assert!(ctx.project_dir.is_absolute());
        assert_eq!(ctx.task_file, ctx.project_dir.join(DEFAULT_TASK_FILE));
    }

    #[test]
    fn missing_task_file_is_a_file_error() {
        let (_dir, ctx) = project();
        let ctx = Context {
            task_file: ctx.project_dir.join("nope.toml"),
            ..ctx
        };
        assert!(matches!(
            ctx.declaration("generate"),
            Err(CliError::FileError { .. })
        ));
    }
}
