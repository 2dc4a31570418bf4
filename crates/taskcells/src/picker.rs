//! Task picker session state.
//!
//! One [`TaskPicker`] exists per picker-open lifecycle. It owns the catalog
//! snapshot and the selection; the visual layer renders [`TaskPicker::sections`]
//! and [`TaskPicker::detail`] and feeds user input back as [`PickerInput`].

use serde::Serialize;

use crate::catalog::Task;

/// Stable element identifiers shared with the visual layer.
pub mod ids {
    pub const PARENT: &str = "library-parent";
    pub const TASK_HEADING: &str = "library-task-heading";
    pub const TASK_PACKAGE: &str = "library-task-package";
    pub const TASK_AUTHOR: &str = "library-task-author";
    pub const TASK_AFFILIATION: &str = "library-task-affiliation";
    pub const TASK_DESCRIPTION: &str = "library-task-description";
    pub const SELECT_BUTTON: &str = "library-select-btn";
    pub const CANCEL_BUTTON: &str = "library-cancel-btn";
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PickerError {
    #[error("No task selected")]
    NoSelection,
}

/// Descriptive fields of the selected task, rebuilt on every selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetailPane {
    pub heading: String,
    pub package: String,
    pub author: String,
    pub affiliation: String,
    pub description: String,
}

impl DetailPane {
    pub fn for_task(task: &Task) -> Self {
        Self {
            heading: task.name.clone(),
            package: task.library_name.clone(),
            author: task.author.clone(),
            affiliation: task.affiliation.clone(),
            description: task.description.clone(),
        }
    }

    /// `(element id, text)` pairs in display order.
    pub fn fields(&self) -> [(&'static str, &str); 5] {
        [
            (ids::TASK_HEADING, self.heading.as_str()),
            (ids::TASK_PACKAGE, self.package.as_str()),
            (ids::TASK_AUTHOR, self.author.as_str()),
            (ids::TASK_AFFILIATION, self.affiliation.as_str()),
            (ids::TASK_DESCRIPTION, self.description.as_str()),
        ]
    }
}

/// A card in the task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCard {
    /// Flat index into the catalog, as accepted by [`TaskPicker::select`]
    pub index: usize,
    pub label: String,
}

/// Tasks of one library under an upper-cased header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibrarySection {
    pub header: String,
    pub cards: Vec<TaskCard>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickerInput {
    Click(usize),
    DoubleClick(usize),
    Enter,
    Escape,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PickerAction {
    /// Keep the picker open
    None,
    /// Close the picker and convert with this task
    Confirm(Task),
    /// Close the picker without converting
    Cancel,
}

/// Selection state for one picker session.
#[derive(Debug, Clone)]
pub struct TaskPicker {
    tasks: Vec<Task>,
    selected: Option<usize>,
    detail: DetailPane,
}

impl TaskPicker {
    /// Open a session over a sorted catalog. Nothing is selected.
    pub fn open(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            selected: None,
            detail: DetailPane::default(),
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    /// Select a task and re-render the detail pane. Out of range is a no-op.
    pub fn select(&mut self, index: usize) -> bool {
        let Some(task) = self.tasks.get(index) else {
            return false;
        };
        self.detail = DetailPane::for_task(task);
        self.selected = Some(index);
        true
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.selected.and_then(|i| self.tasks.get(i))
    }

    pub fn detail(&self) -> &DetailPane {
        &self.detail
    }

    pub fn confirm(&self) -> Result<Task, PickerError> {
        self.current_task().cloned().ok_or(PickerError::NoSelection)
    }

    /// Group consecutive tasks of the same library.
    ///
    /// Relies on the catalog being sorted so each library appears once.
    pub fn sections(&self) -> Vec<LibrarySection> {
        let mut sections: Vec<LibrarySection> = Vec::new();
        let mut current_key: Option<String> = None;
        for (index, task) in self.tasks.iter().enumerate() {
            // Same key the catalog sorts by, so groups match the sort's adjacency
            let key = task.library_name.to_lowercase();
            let card = TaskCard {
                index,
                label: task.name.clone(),
            };
            match sections.last_mut() {
                Some(section) if current_key.as_deref() == Some(key.as_str()) => {
                    section.cards.push(card)
                }
                _ => {
                    sections.push(LibrarySection {
                        header: key.to_uppercase(),
                        cards: vec![card],
                    });
                    current_key = Some(key);
                }
            }
        }
        sections
    }

    pub fn handle(&mut self, input: PickerInput) -> PickerAction {
        match input {
            PickerInput::Click(index) => {
                self.select(index);
                PickerAction::None
            }
            PickerInput::DoubleClick(index) => {
                if self.select(index) {
                    self.confirm_action()
                } else {
                    PickerAction::None
                }
            }
            PickerInput::Enter => self.confirm_action(),
            PickerInput::Escape => PickerAction::Cancel,
        }
    }

    fn confirm_action(&self) -> PickerAction {
        // Confirming with nothing selected leaves the picker open
        match self.confirm() {
            Ok(task) => PickerAction::Confirm(task),
            Err(PickerError::NoSelection) => PickerAction::None,
        }
    }
}
