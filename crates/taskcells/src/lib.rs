//! taskcells - Task library picker and widget-cell conversion for Jupyter notebooks.
//!
//! A task is a cataloged Python function with typed inputs and outputs. This
//! crate loads the task catalog from a kernel, lets a picker choose one, and
//! converts notebook cells into auto-executing widget cells bound to it, while
//! keeping the kernel's globals and the kernel-side task manager in sync.
//!
//! All kernel traffic goes through an [`ExecutionChannel`]; the notebook itself
//! is reached through [`NotebookHost`].

pub mod catalog;
pub mod cell;
pub mod channel;
pub mod config;
pub mod conversion;
pub mod extension;
pub mod kernel;
pub mod library;
pub mod notebook;
pub mod picker;
pub mod registry_sync;
pub mod scanner;

pub use catalog::{ArgSpec, CatalogError, CatalogLoader, Task};
pub use cell::{classify, CellClass, CellRef, CellTag, Markers};
pub use channel::{ChannelError, ExecuteMode, ExecutionChannel, OutputEvent, Submission};
pub use config::Settings;
pub use conversion::{
    AbortReason, AutoAnswer, CellConverter, ConversionOutcome, ConversionReport, ConversionState,
    OverwritePrompt,
};
pub use extension::{Extension, ExtensionError};
pub use kernel::KernelChannel;
pub use notebook::{NotebookDocument, NotebookHost};
pub use picker::{PickerError, TaskPicker};
pub use registry_sync::{NamespaceSnapshot, RegistrySync, SyncOutcome};
pub use scanner::ScanReport;
