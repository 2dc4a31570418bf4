//! Cell handles and classification.
//!
//! Widget cells are recognised by a structured tag in cell metadata, with the
//! literal sentinel markers in cell source as a fallback for notebooks written
//! by older frontends. All of that lives behind [`classify`].

use serde::{Deserialize, Serialize};

/// Source marker for cells that re-execute on load.
pub const AUTO_EXEC_MARKER: &str = "!AUTO_EXEC";

/// Source marker for cells whose prompt is hidden on load without execution.
pub const AUTO_HIDE_MARKER: &str = "!AUTO_OUT";

/// Call emitted by the widget renderer; its presence marks an untouched widget cell.
pub const TASK_VIEW_CALL: &str = "task_manager.create_task_view(";

/// Key under which [`CellTag`] is stored in cell metadata.
pub const METADATA_KEY: &str = "taskcells";

/// Handle to a host-owned cell.
///
/// The id is authoritative; the index is only a hint and may be stale after
/// the user inserts or deletes cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub id: String,
    pub index: usize,
}

impl CellRef {
    pub fn new(id: impl Into<String>, index: usize) -> Self {
        Self {
            id: id.into(),
            index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellType::Code => write!(f, "code"),
            CellType::Markdown => write!(f, "markdown"),
            CellType::Raw => write!(f, "raw"),
        }
    }
}

/// Managed-cell behavior recorded in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellMode {
    AutoExec,
    AutoHide,
}

/// Structured tag stored at `metadata.taskcells`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellTag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<CellMode>,
    /// Name of the task the widget is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub input_hidden: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prompt_hidden: bool,
}

impl CellTag {
    pub fn is_empty(&self) -> bool {
        self == &CellTag::default()
    }
}

/// Read-only snapshot of a cell, taken under the host lock.
#[derive(Debug, Clone, PartialEq)]
pub struct CellView {
    pub id: String,
    pub index: usize,
    pub cell_type: CellType,
    pub source: String,
    pub tag: CellTag,
}

impl CellView {
    pub fn cell_ref(&self) -> CellRef {
        CellRef::new(self.id.clone(), self.index)
    }
}

/// Sentinel strings scanned in cell source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub auto_exec: String,
    pub auto_hide: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            auto_exec: AUTO_EXEC_MARKER.to_string(),
            auto_hide: AUTO_HIDE_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellClass {
    /// Whitespace only
    Empty,
    /// A widget cell that re-executes on load
    AutoExec,
    /// A cell whose prompt is hidden on load
    AutoHide,
    /// Hand-written content
    UserAuthored,
}

impl CellClass {
    /// Whether the cell may be overwritten without asking.
    pub fn is_overwrite_safe(self) -> bool {
        matches!(self, CellClass::Empty | CellClass::AutoExec)
    }
}

impl std::fmt::Display for CellClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellClass::Empty => write!(f, "empty"),
            CellClass::AutoExec => write!(f, "auto-exec"),
            CellClass::AutoHide => write!(f, "auto-hide"),
            CellClass::UserAuthored => write!(f, "user"),
        }
    }
}

/// Classify a cell from its metadata tag, falling back to sentinel markers.
///
/// An auto-exec tag only counts while the source still looks like a widget
/// program. Metadata survives hand edits, so a tagged cell whose code was
/// rewritten classifies by its source like any other cell.
pub fn classify(source: &str, tag: Option<&CellTag>, markers: &Markers) -> CellClass {
    let has_exec_marker = !markers.auto_exec.is_empty() && source.contains(&markers.auto_exec);
    match tag.and_then(|t| t.mode) {
        Some(CellMode::AutoExec) if has_exec_marker || source.contains(TASK_VIEW_CALL) => {
            return CellClass::AutoExec
        }
        Some(CellMode::AutoHide) => return CellClass::AutoHide,
        _ => {}
    }

    if source.trim().is_empty() {
        CellClass::Empty
    } else if has_exec_marker {
        CellClass::AutoExec
    } else if !markers.auto_hide.is_empty() && source.contains(&markers.auto_hide) {
        CellClass::AutoHide
    } else {
        CellClass::UserAuthored
    }
}
