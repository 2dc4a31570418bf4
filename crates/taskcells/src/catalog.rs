//! Task catalog retrieval and ordering.
//!
//! The catalog is produced kernel-side as a JSON object mapping task label to
//! task fields. The loader submits a fixed retrieval program, parses the first
//! output, and returns the tasks grouped by library.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channel::{ChannelError, ExecuteMode, ExecutionChannel, OutputEvent};

/// Kernel-side program that prints the compiled catalog as JSON.
pub const CATALOG_PROGRAM: &str = "from tasklib import compile_tasks\nprint(compile_tasks())";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog response is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Catalog program failed: {ename}: {evalue}")]
    Remote { ename: String, evalue: String },

    #[error("Catalog program produced no output")]
    NoOutput,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// One argument or return value of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireArg", into = "WireArg")]
pub struct ArgSpec {
    pub name: String,
    pub type_tag: String,
    pub default_value: Option<Value>,
    pub label: Option<String>,
    pub description: Option<String>,
}

/// Argument shape as produced by the library compiler.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireArg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arg_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    type_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl From<WireArg> for ArgSpec {
    fn from(wire: WireArg) -> Self {
        // Return values carry only a label
        let name = wire
            .arg_name
            .clone()
            .or_else(|| wire.label.clone())
            .unwrap_or_default();
        let default_value = match wire.value {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(v) => Some(v),
        };
        ArgSpec {
            name,
            type_tag: wire.type_tag.unwrap_or_else(|| "str".to_string()),
            default_value,
            label: wire.label,
            description: wire.description,
        }
    }
}

impl From<ArgSpec> for WireArg {
    fn from(arg: ArgSpec) -> Self {
        WireArg {
            arg_name: Some(arg.name),
            label: arg.label,
            type_tag: Some(arg.type_tag),
            value: arg.default_value,
            description: arg.description,
        }
    }
}

/// A cataloged operation. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique catalog key, shown as the task's label
    #[serde(rename = "label", default)]
    pub name: String,
    #[serde(default)]
    pub library_name: String,
    #[serde(default)]
    pub library_path: String,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub affiliation: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_args: Vec<ArgSpec>,
    #[serde(default)]
    pub optional_args: Vec<ArgSpec>,
    #[serde(default)]
    pub default_args: Vec<ArgSpec>,
    #[serde(default)]
    pub returns: Vec<ArgSpec>,
    /// Fields exactly as the catalog sent them. The typed view above is
    /// normalized for display; the widget program gets these instead.
    #[serde(skip)]
    pub raw: Option<Map<String, Value>>,
}

impl Task {
    /// Minimal task, mostly useful for building catalogs in code.
    pub fn new(name: impl Into<String>, library_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            library_name: library_name.into(),
            library_path: String::new(),
            function_name: String::new(),
            author: String::new(),
            affiliation: String::new(),
            description: String::new(),
            required_args: Vec::new(),
            optional_args: Vec::new(),
            default_args: Vec::new(),
            returns: Vec::new(),
            raw: None,
        }
    }

    /// The task as the kernel-side task manager expects it: the catalog's own
    /// fields with the label set to the catalog key. Tasks built in code fall
    /// back to the typed fields.
    pub fn to_wire(&self) -> Result<Value, serde_json::Error> {
        match &self.raw {
            Some(fields) => {
                let mut fields = fields.clone();
                fields.insert("label".to_string(), Value::String(self.name.clone()));
                Ok(Value::Object(fields))
            }
            None => serde_json::to_value(self),
        }
    }
}

/// Parse a catalog response (`label -> fields`) into sorted tasks.
pub fn parse_catalog(text: &str) -> Result<Vec<Task>, CatalogError> {
    let map: Map<String, Value> = serde_json::from_str(text.trim())?;
    let mut tasks = Vec::with_capacity(map.len());
    for (name, fields) in map {
        let mut task = Task::deserialize(&fields)?;
        task.name = name;
        if let Value::Object(fields) = fields {
            task.raw = Some(fields);
        }
        tasks.push(task);
    }
    sort_tasks(&mut tasks);
    Ok(tasks)
}

/// Stable sort by lower-cased library name, then lower-cased label.
///
/// Tasks of one library end up adjacent; ties keep their input order.
pub fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.library_name
            .to_lowercase()
            .cmp(&b.library_name.to_lowercase())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

/// Fetches the catalog from the kernel.
#[derive(Debug, Clone)]
pub struct CatalogLoader {
    program: String,
}

impl Default for CatalogLoader {
    fn default() -> Self {
        Self::new(CATALOG_PROGRAM)
    }
}

impl CatalogLoader {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Wait for the channel to be free, run the retrieval program, and parse
    /// its first output. No retry on failure.
    pub async fn load<C: ExecutionChannel>(&self, channel: &C) -> Result<Vec<Task>, CatalogError> {
        let submission = channel
            .submit_when_idle(&self.program, ExecuteMode::Background)
            .await?;

        let first = submission.first_output().await.ok_or(CatalogError::NoOutput)?;
        let text = match first {
            OutputEvent::Error { ename, evalue, .. } => {
                warn!("[catalog] Retrieval program raised {}: {}", ename, evalue);
                return Err(CatalogError::Remote { ename, evalue });
            }
            other => other.text().ok_or(CatalogError::NoOutput)?,
        };

        let tasks = parse_catalog(&text).inspect_err(|e| {
            warn!("[catalog] {}", e);
        })?;
        debug!("[catalog] Loaded {} tasks", tasks.len());
        Ok(tasks)
    }
}
