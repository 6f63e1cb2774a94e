//! Task definitions read from `buildstash.tasks.toml`
//!
//! ```toml
//! [tasks.generate]
//! command = ["sh", "-c", "mkdir -p out && cp a.txt out/result.txt"]
//!
//! [tasks.generate.properties]
//! target = "x86_64"
//!
//! [tasks.generate.inputs.sources]
//! paths = ["a.txt"]
//! path = "hierarchy_relative"
//!
//! [tasks.generate.outputs.result]
//! dir = "out"
//! ```

use crate::errors::{CliError, CliResult};
use buildstash_cache::{ContentHash, InputModes, TaskDeclaration, Value};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default task file name, looked up in the project directory
pub const DEFAULT_TASK_FILE: &str = "buildstash.tasks.toml";

/// A parsed task file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskDefinition>,
}

/// One task definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDefinition {
    /// Program and arguments, run from the project directory
    pub command: Vec<String>,
    /// Extra text identifying the task implementation, e.g. a tool version
    #[serde(default)]
    pub implementation: Option<String>,
    /// Whether the task may be cached
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDefinition>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputDefinition>,
}

const fn default_true() -> bool {
    true
}

/// An input file property.
#[derive(Debug, Clone, Deserialize)]
pub struct InputDefinition {
    pub paths: Vec<PathBuf>,
    #[serde(flatten)]
    pub modes: InputModes,
}

/// An output property; exactly one of the fields must be set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDefinition {
    pub file: Option<PathBuf>,
    pub dir: Option<PathBuf>,
    pub files: Option<Vec<PathBuf>>,
}

impl TaskFile {
    /// Read and parse `path`.
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CliError::file_error("read", path, e))?;
        Self::parse(&path.display().to_string(), &content)
    }

    /// Parse task file text; `name` is used in diagnostics.
    pub fn parse(name: &str, content: &str) -> CliResult<Self> {
        let file: Self = toml::from_str(content).map_err(|e| {
            CliError::task_file_parse(
                name,
                content,
                e.span().map(Into::into),
                e.message().to_string(),
            )
        })?;
        tracing::debug!(task_file = name, tasks = file.tasks.len(), "Parsed task file");
        Ok(file)
    }

    /// Look up a task by name.
    pub fn task(&self, name: &str, task_file: &Path) -> CliResult<&TaskDefinition> {
        self.tasks.get(name).ok_or_else(|| CliError::UnknownTask {
            task: name.to_string(),
            task_file: task_file.display().to_string(),
            available: if self.tasks.is_empty() {
                "none".to_string()
            } else {
                self.tasks.keys().cloned().collect::<Vec<_>>().join(", ")
            },
        })
    }
}

impl TaskDefinition {
    /// Hash identifying what the task runs: the command line and the
    /// optional implementation text.
    pub fn implementation_hash(&self) -> ContentHash {
        let mut text = self.implementation.clone().unwrap_or_default();
        for arg in &self.command {
            text.push('\0');
            text.push_str(arg);
        }
        ContentHash::of_bytes(text.as_bytes())
    }

    /// Build the cache declaration for task `name`.
    pub fn declaration(&self, name: &str) -> CliResult<TaskDeclaration> {
        if self.command.is_empty() {
            return Err(CliError::invalid_task(name, "command must not be empty"));
        }
        let mut task = TaskDeclaration::new(name, self.implementation_hash());
        task.cache_enabled = self.cache;

        for (property, value) in &self.properties {
            task.inputs.property(property.clone(), to_value(value))?;
        }
        for (property, input) in &self.inputs {
            task.inputs
                .files(property.clone(), input.paths.iter().cloned(), input.modes)?;
        }
        for (property, output) in &self.outputs {
            match (&output.file, &output.dir, &output.files) {
                (Some(file), None, None) => {
                    task.outputs.file(property.clone(), file.clone())?;
                }
                (None, Some(dir), None) => {
                    task.outputs.dir(property.clone(), dir.clone())?;
                }
                (None, None, Some(files)) => {
                    task.outputs.files(property.clone(), files.iter().cloned())?;
                }
                _ => {
                    return Err(CliError::invalid_task(
                        name,
                        format!("output '{property}' must set exactly one of file, dir or files"),
                    ));
                }
            }
        }
        Ok(task)
    }
}

/// Convert a TOML value into a fingerprintable value.
fn to_value(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::Str(s.clone()),
        toml::Value::Integer(i) => Value::I64(*i),
        toml::Value::Float(f) => Value::F64(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(d) => Value::Str(d.to_string()),
        toml::Value::Array(items) => Value::List(items.iter().map(to_value).collect()),
        toml::Value::Table(table) => {
            Value::sorted_map(table.iter().map(|(k, v)| (k.clone(), to_value(v))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildstash_cache::{OrderMode, OutputKind, PathMode};

    const SAMPLE: &str = r#"
[tasks.generate]
command = ["sh", "-c", "true"]

[tasks.generate.properties]
target = "x86_64"
opt = 3

[tasks.generate.inputs.sources]
paths = ["src"]
order = "ordered"
path = "hierarchy_relative"
skip_when_empty = true

[tasks.generate.outputs.result]
dir = "out"

[tasks.generate.outputs.log]
file = "gen.log"
"#;

    #[test]
    fn parses_full_task() {
        let file = TaskFile::parse("sample", SAMPLE).unwrap();
        let definition = file.task("generate", Path::new("sample")).unwrap();
        assert!(definition.cache);

        let task = definition.declaration("generate").unwrap();
        assert_eq!(task.path, "generate");
        assert_eq!(task.properties().len(), 2);

        let sources = &task.inputs.file_properties()["sources"];
        assert_eq!(sources.modes.order, OrderMode::Ordered);
        assert_eq!(sources.modes.path, PathMode::HierarchyRelative);
        assert!(sources.modes.skip_when_empty);

        let outputs = task.outputs.entries();
        assert_eq!(outputs["result"].kind, OutputKind::Directory);
        assert_eq!(outputs["log"].kind, OutputKind::File);
    }

    #[test]
    fn command_and_implementation_feed_the_hash() {
        let file = TaskFile::parse("sample", SAMPLE).unwrap();
        let definition = file.tasks["generate"].clone();
        let mut other = definition.clone();
        other.command.push("--verbose".into());
        assert_ne!(definition.implementation_hash(), other.implementation_hash());

        let mut versioned = definition.clone();
        versioned.implementation = Some("gen 2.0".into());
        assert_ne!(definition.implementation_hash(), versioned.implementation_hash());
    }

    #[test]
    fn unknown_task_lists_available() {
        let file = TaskFile::parse("sample", SAMPLE).unwrap();
        let err = file.task("deploy", Path::new("sample")).unwrap_err();
        match err {
            CliError::UnknownTask { available, .. } => assert_eq!(available, "generate"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn syntax_errors_carry_a_span() {
        let err = TaskFile::parse("broken", "[tasks.x]\ncommand = 3\n").unwrap_err();
        assert!(matches!(
            err,
            CliError::TaskFileParse {
                error_span: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn ambiguous_output_is_rejected() {
        let content = r#"
[tasks.x]
command = ["true"]
[tasks.x.outputs.both]
file = "a"
dir = "b"
"#;
        let file = TaskFile::parse("x", content).unwrap();
        let err = file.tasks["x"].declaration("x").unwrap_err();
        assert!(matches!(err, CliError::InvalidTask { .. }));
    }

    #[test]
    fn contradictory_modes_are_configuration_errors() {
        let content = r#"
[tasks.x]
command = ["true"]
[tasks.x.inputs.libs]
paths = ["lib"]
order = "ordered"
path = "ignore_path"
"#;
        let file = TaskFile::parse("x", content).unwrap();
        let err = file.tasks["x"].declaration("x").unwrap_err();
        match err {
            CliError::Cache(inner) => assert!(inner.is_configuration()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn nested_properties_are_sorted_maps() {
        let value: toml::Value = toml::from_str::<toml::Table>("t = { b = 1, a = [true, 2.5] }")
            .unwrap()
            .remove("t")
            .unwrap();
        match to_value(&value) {
            Value::Map(pairs) => {
                assert!(matches!(&pairs[0].0, Value::Str(k) if k == "a"));
                assert!(matches!(&pairs[1].0, Value::Str(k) if k == "b"));
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
