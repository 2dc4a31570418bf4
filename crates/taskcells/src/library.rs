//! Offline compilation of task library files into a catalog.
//!
//! A library file describes the tasks one Python package exposes:
//!
//! ```json
//! {
//!   "library_path": "libs/imgproc/",
//!   "author": "...",
//!   "tasks": [
//!     { "function_path": "imgproc.ops.crop", "label": "Crop", "required_args": [...] }
//!   ]
//! }
//! ```
//!
//! Compiling a directory yields the same `label -> fields` mapping the kernel
//! returns to [`crate::catalog::CatalogLoader`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::catalog::{sort_tasks, ArgSpec, Task};

/// File name prefix for compiled output, skipped when compiling.
pub const COMPILED_PREFIX: &str = "COMPILED";

/// Where [`write_record`] puts the compiled catalog.
pub const RECORD_FILE_NAME: &str = "COMPILED_TASKS.json";

const NO_INFO: &str = "No info.";

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid library file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("'library_path' is not specified in {0}")]
    MissingLibraryPath(PathBuf),

    #[error("Function path must look like 'module.function_name', got '{0}'")]
    BadFunctionPath(String),
}

#[derive(Debug, Deserialize)]
struct LibraryFile {
    library_path: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    affiliation: Option<String>,
    #[serde(default)]
    tasks: Vec<TaskEntry>,
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    function_path: String,
    label: Option<String>,
    description: Option<String>,
    author: Option<String>,
    affiliation: Option<String>,
    #[serde(default)]
    required_args: Vec<ArgEntry>,
    #[serde(default)]
    optional_args: Vec<ArgEntry>,
    #[serde(default)]
    default_args: Vec<ArgEntry>,
    #[serde(default)]
    returns: Vec<ReturnEntry>,
}

#[derive(Debug, Deserialize)]
struct ArgEntry {
    arg_name: String,
    #[serde(rename = "type")]
    type_tag: Option<String>,
    value: Option<Value>,
    label: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReturnEntry {
    label: String,
    description: Option<String>,
}

/// `snake_case_name` -> `Snake Case Name`.
pub fn title_str(s: &str) -> String {
    s.split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split `a.b.fn` into (`a.b`, `fn`).
fn split_function_path(function_path: &str) -> Result<(String, String), LibraryError> {
    match function_path.rsplit_once('.') {
        Some((library, function)) if !library.is_empty() && !function.is_empty() => {
            Ok((library.to_string(), function.to_string()))
        }
        _ => Err(LibraryError::BadFunctionPath(function_path.to_string())),
    }
}

fn normalize_library_path(library_path: &str) -> String {
    let mut path = library_path.to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    if Path::new(&path).is_dir() {
        return path;
    }
    // Relative paths are taken from $HOME
    match dirs::home_dir() {
        Some(home) => {
            let mut joined = home.join(&path).to_string_lossy().into_owned();
            if !joined.ends_with('/') {
                joined.push('/');
            }
            joined
        }
        None => path,
    }
}

fn unique_label(label: String, taken: &HashSet<String>) -> String {
    if !taken.contains(&label) {
        return label;
    }
    warn!("[catalog] Task label '{}' is duplicated, renaming", label);
    let mut version = 2;
    loop {
        let candidate = format!("{} (v{})", label, version);
        if !taken.contains(&candidate) {
            return candidate;
        }
        version += 1;
    }
}

fn convert_arg(arg: ArgEntry) -> ArgSpec {
    let default_value = match arg.value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(v) => Some(v),
    };
    ArgSpec {
        label: Some(arg.label.unwrap_or_else(|| title_str(&arg.arg_name))),
        name: arg.arg_name,
        type_tag: arg.type_tag.unwrap_or_else(|| "str".to_string()),
        default_value,
        description: Some(arg.description.unwrap_or_else(|| NO_INFO.to_string())),
    }
}

fn convert_return(ret: ReturnEntry) -> ArgSpec {
    ArgSpec {
        name: ret.label.clone(),
        type_tag: "str".to_string(),
        default_value: None,
        label: Some(ret.label),
        description: Some(ret.description.unwrap_or_else(|| NO_INFO.to_string())),
    }
}

/// Compile a single library file. Labels already in `taken` get a version suffix.
pub fn load_library(path: &Path, taken: &mut HashSet<String>) -> Result<Vec<Task>, LibraryError> {
    let content = std::fs::read_to_string(path).map_err(|source| LibraryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let library: LibraryFile =
        serde_json::from_str(&content).map_err(|source| LibraryError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    let library_path = library
        .library_path
        .as_deref()
        .map(normalize_library_path)
        .ok_or_else(|| LibraryError::MissingLibraryPath(path.to_path_buf()))?;

    let mut tasks = Vec::with_capacity(library.tasks.len());
    for entry in library.tasks {
        let (library_name, function_name) = split_function_path(&entry.function_path)?;
        let label = entry
            .label
            .unwrap_or_else(|| format!("{} (no label)", function_name));
        let label = unique_label(label, taken);
        taken.insert(label.clone());

        tasks.push(Task {
            name: label,
            library_name,
            library_path: library_path.clone(),
            function_name,
            author: entry
                .author
                .or_else(|| library.author.clone())
                .unwrap_or_default(),
            affiliation: entry
                .affiliation
                .or_else(|| library.affiliation.clone())
                .unwrap_or_default(),
            description: entry.description.unwrap_or_else(|| NO_INFO.to_string()),
            required_args: entry.required_args.into_iter().map(convert_arg).collect(),
            optional_args: entry.optional_args.into_iter().map(convert_arg).collect(),
            default_args: entry.default_args.into_iter().map(convert_arg).collect(),
            returns: entry.returns.into_iter().map(convert_return).collect(),
            raw: None,
        });
    }
    Ok(tasks)
}

/// Compile every library file in `dir` into a sorted catalog.
///
/// Files named `COMPILED*` are skipped, as are files that fail to load.
pub fn compile_dir(dir: &Path) -> Result<Vec<Task>, LibraryError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LibraryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with(COMPILED_PREFIX))
        })
        .collect();
    // read_dir order is platform dependent
    paths.sort();

    let mut taken = HashSet::new();
    let mut tasks = Vec::new();
    for path in paths {
        match load_library(&path, &mut taken) {
            Ok(loaded) => tasks.extend(loaded),
            Err(e) => warn!("[catalog] Skipping {}: {}", path.display(), e),
        }
    }

    sort_tasks(&mut tasks);
    info!(
        "[catalog] Compiled {} tasks from {}",
        tasks.len(),
        dir.display()
    );
    Ok(tasks)
}

/// Render tasks in the kernel's `label -> fields` catalog format.
pub fn to_catalog_json(tasks: &[Task]) -> Value {
    let mut map = Map::new();
    for task in tasks {
        let mut fields = match serde_json::to_value(task) {
            Ok(Value::Object(fields)) => fields,
            _ => continue,
        };
        fields.remove("label");
        map.insert(task.name.clone(), Value::Object(fields));
    }
    Value::Object(map)
}

/// Write the compiled catalog to `<dir>/COMPILED_TASKS.json`.
pub fn write_record(dir: &Path, tasks: &[Task]) -> Result<PathBuf, LibraryError> {
    let path = dir.join(RECORD_FILE_NAME);
    let json = serde_json::to_string_pretty(&to_catalog_json(tasks)).map_err(|source| {
        LibraryError::Json {
            path: path.clone(),
            source,
        }
    })?;
    std::fs::write(&path, json).map_err(|source| LibraryError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}
