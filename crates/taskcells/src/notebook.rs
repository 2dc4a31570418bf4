//! Host notebook contract and its nbformat implementation.
//!
//! The host owns cell identity and lifetime. Everything the conversion state
//! machine does to a cell goes through [`NotebookHost`], addressed by cell id
//! so that concurrent inserts and deletes can't redirect a mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::warn;
use nbformat::v4::{Cell, CellId, CellMetadata, JupyterCellMetadata, Notebook, Output};
use uuid::Uuid;

use crate::cell::{CellRef, CellTag, CellType, CellView, METADATA_KEY};
use crate::channel::OutputEvent;

/// Which parts of a cell to hide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HideScope {
    /// Execution-count prompt only
    Prompt,
    /// Code input and prompt
    InputAndPrompt,
}

/// Cell-sequence operations the core needs from the host notebook.
pub trait NotebookHost: Send {
    fn cell_count(&self) -> usize;

    fn cell_at(&self, index: usize) -> Option<CellView>;

    fn find_cell_index(&self, cell_id: &str) -> Option<usize>;

    fn selected_index(&self) -> Option<usize>;

    fn select(&mut self, index: usize) -> bool;

    fn set_cell_type(&mut self, cell_id: &str, cell_type: CellType) -> bool;

    fn set_cell_source(&mut self, cell_id: &str, source: &str) -> bool;

    fn set_cell_tag(&mut self, cell_id: &str, tag: &CellTag) -> bool;

    fn clear_outputs(&mut self, cell_id: &str);

    fn append_output(&mut self, cell_id: &str, event: &OutputEvent);

    /// Insert an empty code cell after `index` and return its handle.
    fn insert_cell_below(&mut self, index: usize) -> CellRef;

    /// Restore the most recently deleted cells; returns their handles.
    fn undelete(&mut self) -> Vec<CellRef>;

    /// Look up a cell by id, re-resolving its current index.
    fn cell(&self, cell_id: &str) -> Option<CellView> {
        self.find_cell_index(cell_id)
            .and_then(|index| self.cell_at(index))
    }

    fn cells(&self) -> Vec<CellView> {
        (0..self.cell_count())
            .filter_map(|index| self.cell_at(index))
            .collect()
    }

    /// Mark parts of a cell hidden. The source is left untouched.
    fn hide(&mut self, cell_id: &str, scope: HideScope) -> bool {
        let Some(view) = self.cell(cell_id) else {
            return false;
        };
        let mut tag = view.tag;
        tag.prompt_hidden = true;
        if scope == HideScope::InputAndPrompt {
            tag.input_hidden = true;
        }
        self.set_cell_tag(cell_id, &tag)
    }

    /// Reverse [`NotebookHost::hide`].
    fn unhide(&mut self, cell_id: &str) -> bool {
        let Some(view) = self.cell(cell_id) else {
            return false;
        };
        let mut tag = view.tag;
        tag.input_hidden = false;
        tag.prompt_hidden = false;
        self.set_cell_tag(cell_id, &tag)
    }
}

/// Convert source string back to nbformat's Vec<String> (lines with newlines).
fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

fn empty_cell_metadata() -> CellMetadata {
    CellMetadata {
        id: None,
        collapsed: None,
        scrolled: None,
        deletable: None,
        editable: None,
        format: None,
        name: None,
        tags: None,
        jupyter: None,
        execution: None,
        additional: HashMap::new(),
    }
}

fn empty_code_cell() -> Cell {
    Cell::Code {
        id: CellId::from(Uuid::new_v4()),
        metadata: empty_cell_metadata(),
        execution_count: None,
        source: Vec::new(),
        outputs: Vec::new(),
    }
}

fn cell_metadata(cell: &Cell) -> &CellMetadata {
    match cell {
        Cell::Code { metadata, .. } => metadata,
        Cell::Markdown { metadata, .. } => metadata,
        Cell::Raw { metadata, .. } => metadata,
    }
}

fn cell_metadata_mut(cell: &mut Cell) -> &mut CellMetadata {
    match cell {
        Cell::Code { metadata, .. } => metadata,
        Cell::Markdown { metadata, .. } => metadata,
        Cell::Raw { metadata, .. } => metadata,
    }
}

/// Mirror the input-hidden flag into `metadata.jupyter.source_hidden`, which
/// standard frontends honor.
fn set_source_hidden(metadata: &mut CellMetadata, hidden: bool) {
    if hidden {
        metadata
            .jupyter
            .get_or_insert_with(|| JupyterCellMetadata {
                source_hidden: None,
                outputs_hidden: None,
                additional: HashMap::new(),
            })
            .source_hidden = Some(true);
        return;
    }
    if let Some(jupyter) = metadata.jupyter.as_mut() {
        jupyter.source_hidden = None;
        if jupyter.outputs_hidden.is_none() && jupyter.additional.is_empty() {
            metadata.jupyter = None;
        }
    }
}

fn cell_type_of(cell: &Cell) -> CellType {
    match cell {
        Cell::Code { .. } => CellType::Code,
        Cell::Markdown { .. } => CellType::Markdown,
        Cell::Raw { .. } => CellType::Raw,
    }
}

fn read_tag(cell: &Cell) -> CellTag {
    cell_metadata(cell)
        .additional
        .get(METADATA_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// An nbformat v4 notebook acting as the host.
pub struct NotebookDocument {
    pub notebook: Notebook,
    pub path: Option<PathBuf>,
    pub dirty: bool,
    selected: Option<usize>,
    /// Last deleted run of cells and the index they were removed from
    undelete_backup: Option<(usize, Vec<Cell>)>,
}

impl NotebookDocument {
    pub fn new_empty() -> Self {
        Self::from_notebook(
            Notebook {
                metadata: nbformat::v4::Metadata {
                    kernelspec: None,
                    language_info: None,
                    authors: None,
                    additional: HashMap::new(),
                },
                nbformat: 4,
                nbformat_minor: 5,
                cells: vec![empty_code_cell()],
            },
            None,
        )
    }

    pub fn from_notebook(notebook: Notebook, path: Option<PathBuf>) -> Self {
        let selected = if notebook.cells.is_empty() {
            None
        } else {
            Some(0)
        };
        Self {
            notebook,
            path,
            dirty: false,
            selected,
            undelete_backup: None,
        }
    }

    /// Parse notebook JSON, upgrading legacy formats to v4.
    pub fn parse(content: &str, path: Option<PathBuf>) -> Result<Self> {
        let nb = nbformat::parse_notebook(content).map_err(|e| anyhow::anyhow!("{}", e))?;
        let nb_v4 = match nb {
            nbformat::Notebook::V4(nb) => nb,
            nbformat::Notebook::Legacy(legacy) => nbformat::upgrade_legacy_notebook(legacy)?,
        };
        Ok(Self::from_notebook(nb_v4, path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, Some(path.to_path_buf()))
    }

    pub fn serialize(&self) -> Result<String> {
        let nb = nbformat::Notebook::V4(self.notebook.clone());
        nbformat::serialize_notebook(&nb).map_err(|e| anyhow::anyhow!("{}", e))
    }

    /// Write back to `path`, or to the path the notebook was loaded from.
    pub fn save(&mut self, path: Option<&Path>) -> Result<()> {
        let target = path
            .map(Path::to_path_buf)
            .or_else(|| self.path.clone())
            .ok_or_else(|| anyhow::anyhow!("Notebook has no path to save to"))?;
        std::fs::write(&target, self.serialize()?)?;
        self.path = Some(target);
        self.dirty = false;
        Ok(())
    }

    /// Add a code cell with the given source at the end.
    pub fn push_code_cell(&mut self, source: &str) -> CellRef {
        let mut cell = empty_code_cell();
        if let Cell::Code { source: s, .. } = &mut cell {
            *s = source_to_lines(source);
        }
        let id = cell.id().to_string();
        self.notebook.cells.push(cell);
        self.dirty = true;
        CellRef::new(id, self.notebook.cells.len() - 1)
    }

    /// Delete a cell, keeping it as the undo backup.
    pub fn delete_cell(&mut self, cell_id: &str) -> bool {
        self.delete_cells(&[cell_id])
    }

    /// Delete a run of cells. The backup restores them at the first removed index.
    pub fn delete_cells(&mut self, cell_ids: &[&str]) -> bool {
        let mut indices: Vec<usize> = cell_ids
            .iter()
            .filter_map(|id| self.find_cell_index(id))
            .collect();
        // Don't delete the last cell
        if indices.is_empty() || indices.len() >= self.notebook.cells.len() {
            return false;
        }
        indices.sort_unstable();
        indices.dedup();

        let start = indices[0];
        let removed: Vec<Cell> = indices
            .iter()
            .rev()
            .map(|&i| self.notebook.cells.remove(i))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        self.undelete_backup = Some((start, removed));
        if let Some(selected) = self.selected {
            if selected >= self.notebook.cells.len() {
                self.selected = Some(self.notebook.cells.len() - 1);
            }
        }
        self.dirty = true;
        true
    }

    fn find_cell_mut(&mut self, cell_id: &str) -> Option<&mut Cell> {
        let idx = self.find_cell_index(cell_id)?;
        self.notebook.cells.get_mut(idx)
    }
}

impl NotebookHost for NotebookDocument {
    fn cell_count(&self) -> usize {
        self.notebook.cells.len()
    }

    fn cell_at(&self, index: usize) -> Option<CellView> {
        let cell = self.notebook.cells.get(index)?;
        Some(CellView {
            id: cell.id().to_string(),
            index,
            cell_type: cell_type_of(cell),
            source: cell.source().join(""),
            tag: read_tag(cell),
        })
    }

    fn find_cell_index(&self, cell_id: &str) -> Option<usize> {
        self.notebook
            .cells
            .iter()
            .position(|c| c.id().as_str() == cell_id)
    }

    fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    fn select(&mut self, index: usize) -> bool {
        if index < self.notebook.cells.len() {
            self.selected = Some(index);
            true
        } else {
            false
        }
    }

    fn set_cell_type(&mut self, cell_id: &str, cell_type: CellType) -> bool {
        let Some(cell) = self.find_cell_mut(cell_id) else {
            return false;
        };
        if cell_type_of(cell) == cell_type {
            return true;
        }

        let id = cell.id().clone();
        let metadata = cell_metadata(cell).clone();
        let source = cell.source().to_vec();
        *cell = match cell_type {
            CellType::Code => Cell::Code {
                id,
                metadata,
                execution_count: None,
                source,
                outputs: Vec::new(),
            },
            CellType::Markdown => Cell::Markdown {
                id,
                metadata,
                source,
                attachments: None,
            },
            CellType::Raw => Cell::Raw {
                id,
                metadata,
                source,
            },
        };
        self.dirty = true;
        true
    }

    fn set_cell_source(&mut self, cell_id: &str, source: &str) -> bool {
        let Some(cell) = self.find_cell_mut(cell_id) else {
            return false;
        };
        let lines = source_to_lines(source);
        match cell {
            Cell::Code { source: s, .. } => *s = lines,
            Cell::Markdown { source: s, .. } => *s = lines,
            Cell::Raw { source: s, .. } => *s = lines,
        }
        self.dirty = true;
        true
    }

    fn set_cell_tag(&mut self, cell_id: &str, tag: &CellTag) -> bool {
        let Some(cell) = self.find_cell_mut(cell_id) else {
            return false;
        };
        // Leave a source_hidden set by some other frontend alone
        let was_hidden = read_tag(cell).input_hidden;
        let metadata = cell_metadata_mut(cell);
        if tag.input_hidden || was_hidden {
            set_source_hidden(metadata, tag.input_hidden);
        }
        let additional = &mut metadata.additional;
        if tag.is_empty() {
            additional.remove(METADATA_KEY);
        } else {
            match serde_json::to_value(tag) {
                Ok(value) => {
                    additional.insert(METADATA_KEY.to_string(), value);
                }
                Err(e) => {
                    warn!("[notebook] Failed to serialize cell tag: {}", e);
                    return false;
                }
            }
        }
        self.dirty = true;
        true
    }

    fn clear_outputs(&mut self, cell_id: &str) {
        if let Some(Cell::Code {
            outputs,
            execution_count,
            ..
        }) = self.find_cell_mut(cell_id)
        {
            outputs.clear();
            *execution_count = None;
        }
    }

    fn append_output(&mut self, cell_id: &str, event: &OutputEvent) {
        let Some(Cell::Code {
            outputs,
            execution_count,
            ..
        }) = self.find_cell_mut(cell_id)
        else {
            return;
        };

        if let OutputEvent::Data {
            execution_count: Some(count),
            ..
        } = event
        {
            *execution_count = Some(*count as i32);
        }

        match serde_json::from_value::<Output>(event.to_nbformat()) {
            Ok(output) => outputs.push(output),
            Err(e) => warn!("[notebook] Dropping output that isn't valid nbformat: {}", e),
        }
        self.dirty = true;
    }

    fn insert_cell_below(&mut self, index: usize) -> CellRef {
        let cell = empty_code_cell();
        let id = cell.id().to_string();
        let insert_at = (index + 1).min(self.notebook.cells.len());
        self.notebook.cells.insert(insert_at, cell);
        self.dirty = true;
        CellRef::new(id, insert_at)
    }

    fn undelete(&mut self) -> Vec<CellRef> {
        let Some((start, cells)) = self.undelete_backup.take() else {
            return Vec::new();
        };
        let start = start.min(self.notebook.cells.len());
        let mut restored = Vec::with_capacity(cells.len());
        for (offset, cell) in cells.into_iter().enumerate() {
            restored.push(CellRef::new(cell.id().to_string(), start + offset));
            self.notebook.cells.insert(start + offset, cell);
        }
        self.dirty = true;
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellMode;

    fn doc_with(sources: &[&str]) -> NotebookDocument {
        let mut doc = NotebookDocument::new_empty();
        doc.notebook.cells.clear();
        for source in sources {
            doc.push_code_cell(source);
        }
        doc.dirty = false;
        doc
    }

    fn id_at(doc: &NotebookDocument, index: usize) -> String {
        doc.cell_at(index).unwrap().id
    }

    #[test]
    fn test_new_empty_has_one_selected_code_cell() {
        let doc = NotebookDocument::new_empty();
        assert_eq!(doc.cell_count(), 1);
        assert_eq!(doc.selected_index(), Some(0));
        assert_eq!(doc.cell_at(0).unwrap().cell_type, CellType::Code);
    }

    #[test]
    fn test_cell_lookup_survives_index_shift() {
        let mut doc = doc_with(&["a", "b"]);
        let b = id_at(&doc, 1);

        doc.insert_cell_below(0);

        let view = doc.cell(&b).unwrap();
        assert_eq!(view.index, 2);
        assert_eq!(view.source, "b");
    }

    #[test]
    fn test_set_cell_type_keeps_source_and_metadata() {
        let mut doc = doc_with(&["# Title"]);
        let id = id_at(&doc, 0);
        doc.set_cell_type(&id, CellType::Markdown);
        let tag = CellTag {
            mode: Some(CellMode::AutoExec),
            ..Default::default()
        };
        doc.set_cell_tag(&id, &tag);

        assert!(doc.set_cell_type(&id, CellType::Code));

        let view = doc.cell(&id).unwrap();
        assert_eq!(view.cell_type, CellType::Code);
        assert_eq!(view.source, "# Title");
        assert_eq!(view.tag, tag);
    }

    #[test]
    fn test_set_cell_type_missing_cell() {
        let mut doc = doc_with(&["x"]);
        assert!(!doc.set_cell_type("missing", CellType::Raw));
    }

    #[test]
    fn test_hide_keeps_source() {
        let mut doc = doc_with(&["widget()"]);
        let id = id_at(&doc, 0);

        assert!(doc.hide(&id, HideScope::InputAndPrompt));

        let view = doc.cell(&id).unwrap();
        assert!(view.tag.input_hidden);
        assert!(view.tag.prompt_hidden);
        assert_eq!(view.source, "widget()");

        assert!(doc.unhide(&id));
        assert!(doc.cell(&id).unwrap().tag.is_empty());
    }

    #[test]
    fn test_hide_prompt_only() {
        let mut doc = doc_with(&["x"]);
        let id = id_at(&doc, 0);
        doc.hide(&id, HideScope::Prompt);
        let tag = doc.cell(&id).unwrap().tag;
        assert!(tag.prompt_hidden);
        assert!(!tag.input_hidden);
    }

    fn saved_cell_metadata(doc: &NotebookDocument, index: usize) -> serde_json::Value {
        let saved: serde_json::Value = serde_json::from_str(&doc.serialize().unwrap()).unwrap();
        saved["cells"][index]["metadata"].clone()
    }

    #[test]
    fn test_hide_sets_standard_source_hidden() {
        let mut doc = doc_with(&["widget()"]);
        let id = id_at(&doc, 0);

        doc.hide(&id, HideScope::InputAndPrompt);
        let metadata = saved_cell_metadata(&doc, 0);
        assert_eq!(metadata["jupyter"]["source_hidden"], true);
        assert_eq!(metadata["taskcells"]["input_hidden"], true);

        doc.unhide(&id);
        let metadata = saved_cell_metadata(&doc, 0);
        assert!(metadata.get("jupyter").map_or(true, |j| j.is_null()));
    }

    #[test]
    fn test_prompt_only_hide_leaves_source_visible() {
        let mut doc = doc_with(&["x"]);
        let id = id_at(&doc, 0);
        doc.hide(&id, HideScope::Prompt);
        let metadata = saved_cell_metadata(&doc, 0);
        assert!(metadata
            .get("jupyter")
            .and_then(|j| j.get("source_hidden"))
            .is_none());
    }

    #[test]
    fn test_tag_update_keeps_foreign_source_hidden() {
        let mut doc = doc_with(&["x"]);
        let id = id_at(&doc, 0);
        if let Cell::Code { metadata, .. } = &mut doc.notebook.cells[0] {
            set_source_hidden(metadata, true);
        }

        let tag = CellTag {
            task: Some("crop".into()),
            ..Default::default()
        };
        doc.set_cell_tag(&id, &tag);

        assert_eq!(saved_cell_metadata(&doc, 0)["jupyter"]["source_hidden"], true);
    }

    #[test]
    fn test_append_output_records_execution_count() {
        let mut doc = doc_with(&["1 + 1"]);
        let id = id_at(&doc, 0);
        let mut data = serde_json::Map::new();
        data.insert("text/plain".into(), serde_json::json!("2"));

        doc.append_output(
            &id,
            &OutputEvent::Data {
                data,
                execution_count: Some(7),
            },
        );

        match &doc.notebook.cells[0] {
            Cell::Code {
                outputs,
                execution_count,
                ..
            } => {
                assert_eq!(outputs.len(), 1);
                assert_eq!(*execution_count, Some(7));
            }
            _ => panic!("Expected code cell"),
        }

        doc.clear_outputs(&id);
        match &doc.notebook.cells[0] {
            Cell::Code {
                outputs,
                execution_count,
                ..
            } => {
                assert!(outputs.is_empty());
                assert!(execution_count.is_none());
            }
            _ => panic!("Expected code cell"),
        }
    }

    #[test]
    fn test_insert_cell_below_clamps_to_end() {
        let mut doc = doc_with(&["a"]);
        let cell = doc.insert_cell_below(10);
        assert_eq!(cell.index, 1);
        assert_eq!(doc.cell_count(), 2);
    }

    #[test]
    fn test_delete_then_undelete_restores_position() {
        let mut doc = doc_with(&["a", "b", "c", "d"]);
        let b = id_at(&doc, 1);
        let c = id_at(&doc, 2);

        assert!(doc.delete_cells(&[c.as_str(), b.as_str()]));
        assert_eq!(doc.cell_count(), 2);

        let restored = doc.undelete();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].id, b);
        assert_eq!(restored[1].id, c);
        let sources: Vec<String> = doc.cells().into_iter().map(|c| c.source).collect();
        assert_eq!(sources, vec!["a", "b", "c", "d"]);

        // Backup is consumed
        assert!(doc.undelete().is_empty());
    }

    #[test]
    fn test_delete_refuses_to_empty_notebook() {
        let mut doc = doc_with(&["only"]);
        let id = id_at(&doc, 0);
        assert!(!doc.delete_cell(&id));
        assert_eq!(doc.cell_count(), 1);
    }

    #[test]
    fn test_serialize_and_parse_keep_tag() {
        let mut doc = doc_with(&["print(1)"]);
        let id = id_at(&doc, 0);
        doc.set_cell_tag(
            &id,
            &CellTag {
                mode: Some(CellMode::AutoExec),
                task: Some("crop".into()),
                input_hidden: true,
                prompt_hidden: true,
            },
        );

        let json = doc.serialize().unwrap();
        let parsed = NotebookDocument::parse(&json, None).unwrap();

        let view = parsed.cell(&id).unwrap();
        assert_eq!(view.tag.mode, Some(CellMode::AutoExec));
        assert_eq!(view.tag.task.as_deref(), Some("crop"));
        assert_eq!(view.source, "print(1)");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("roundtrip.ipynb");
        let mut doc = doc_with(&["x = 1\n", "y = 2"]);

        doc.save(Some(&path)).unwrap();
        assert!(!doc.dirty);

        let loaded = NotebookDocument::load(&path).unwrap();
        assert_eq!(loaded.cell_count(), 2);
        assert_eq!(loaded.cell_at(0).unwrap().source, "x = 1\n");
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_save_without_path_fails() {
        let mut doc = NotebookDocument::new_empty();
        assert!(doc.save(None).is_err());
    }

    #[test]
    fn test_source_to_lines_roundtrip() {
        for original in &["line1\nline2", "line1\nline2\n", "single", "single\n", ""] {
            let lines = source_to_lines(original);
            let rejoined: String = lines.join("");
            assert_eq!(&rejoined, original, "roundtrip failed for {:?}", original);
        }
    }
}
