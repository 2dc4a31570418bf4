//! Session wiring for one notebook.
//!
//! An [`Extension`] owns everything the notebook's task cells need: the
//! channel, the host, the converter, and the registry sync. Nothing is global;
//! each notebook gets its own session.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{info, warn};

use crate::catalog::{CatalogError, CatalogLoader};
use crate::cell::CellRef;
use crate::channel::{ChannelError, ExecutionChannel};
use crate::config::Settings;
use crate::conversion::{CellConverter, ConversionReport, OverwritePrompt};
use crate::notebook::NotebookHost;
use crate::picker::{PickerError, TaskPicker};
use crate::registry_sync::{RegistrySync, SyncOutcome};
use crate::scanner::{autorun, restore_cells, ScanReport};

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("Kernel was not connected and idle within {0:?}")]
    KernelNotReady(Duration),

    #[error("No cell selected")]
    NoTargetCell,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Picker(#[from] PickerError),
}

pub struct Extension<C, H> {
    settings: Settings,
    channel: Arc<C>,
    converter: CellConverter<C, H>,
    registry: RegistrySync,
    catalog: CatalogLoader,
}

impl<C: ExecutionChannel, H: NotebookHost> Extension<C, H> {
    pub fn new(
        channel: Arc<C>,
        host: Arc<StdMutex<H>>,
        prompt: Arc<dyn OverwritePrompt>,
        settings: Settings,
    ) -> Self {
        let converter =
            CellConverter::new(channel.clone(), host, prompt).with_markers(settings.markers());
        let registry = RegistrySync::new(settings.import_statements());
        Self {
            settings,
            channel,
            converter,
            registry,
            catalog: CatalogLoader::default(),
        }
    }

    pub fn with_catalog_loader(mut self, catalog: CatalogLoader) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn converter(&self) -> &CellConverter<C, H> {
        &self.converter
    }

    pub fn registry(&self) -> &RegistrySync {
        &self.registry
    }

    /// Wait for the kernel, bootstrap the task manager, then restore widget cells.
    pub async fn initialize(&self) -> Result<ScanReport, ExtensionError> {
        let timeout = self.settings.kernel_ready_timeout();
        let ready = async {
            self.channel.wait_connected().await;
            self.channel.wait_idle().await;
        };
        if tokio::time::timeout(timeout, ready).await.is_err() {
            return Err(ExtensionError::KernelNotReady(timeout));
        }

        if !self.registry.initialize(&*self.channel).await? {
            // Widget cells still restore; their sync catches up once bootstrap succeeds
            warn!("[sync] Continuing without an initialized task manager");
        }

        let report = autorun(&self.converter).await;
        info!("[scan] Initialization complete");
        Ok(report)
    }

    /// Load the catalog into a fresh picker session.
    pub async fn open_picker(&self) -> Result<TaskPicker, ExtensionError> {
        let tasks = self.catalog.load(&*self.channel).await?;
        Ok(TaskPicker::open(tasks))
    }

    /// Convert `target` (or the selected cell) with the picker's confirmed task.
    pub async fn apply_picker_choice(
        &self,
        picker: &TaskPicker,
        target: Option<CellRef>,
    ) -> Result<ConversionReport, ExtensionError> {
        let task = picker.confirm()?;
        let cell = match target {
            Some(cell) => cell,
            None => self
                .converter
                .with_host(|h| {
                    h.selected_index()
                        .and_then(|i| h.cell_at(i))
                        .map(|v| v.cell_ref())
                })
                .ok_or(ExtensionError::NoTargetCell)?,
        };
        Ok(self.converter.convert(&cell, Some(&task)).await)
    }

    /// Insert an empty cell below the selection and select it.
    pub fn insert_task_cell(&self) -> CellRef {
        self.converter.with_host(|h| {
            let below = h
                .selected_index()
                .unwrap_or_else(|| h.cell_count().saturating_sub(1));
            let cell = h.insert_cell_below(below);
            h.select(cell.index);
            cell
        })
    }

    /// Restore the last deleted cells and re-run the widget cells among them.
    pub async fn undo_delete(&self) -> ScanReport {
        let restored = self.converter.with_host(|h| h.undelete());
        if restored.is_empty() {
            return ScanReport::default();
        }
        restore_cells(&self.converter, &restored).await
    }

    /// Explicitly sync the namespaces. Skipped before initialization.
    pub async fn refresh_namespace(&self) -> Result<SyncOutcome, ExtensionError> {
        Ok(self.registry.sync(&*self.channel).await?)
    }
}
