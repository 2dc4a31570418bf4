//! Restores widget cells after a notebook is opened.
//!
//! Outputs aren't assumed to survive a reload, so auto-exec cells are
//! re-executed through the converter and auto-hide cells are hidden again.

use log::{debug, info};
use serde::Serialize;

use crate::cell::{classify, CellClass, CellRef};
use crate::channel::ExecutionChannel;
use crate::conversion::CellConverter;
use crate::notebook::{HideScope, NotebookHost};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Auto-exec cells that were re-executed and hidden
    pub converted: usize,
    /// Auto-hide cells hidden without execution
    pub hidden: usize,
    /// Conversions that aborted
    pub aborted: usize,
    pub untouched: usize,
}

impl ScanReport {
    fn add(&mut self, other: ScanReport) {
        self.converted += other.converted;
        self.hidden += other.hidden;
        self.aborted += other.aborted;
        self.untouched += other.untouched;
    }
}

/// Scan every cell once, in order.
pub async fn autorun<C: ExecutionChannel, H: NotebookHost>(
    converter: &CellConverter<C, H>,
) -> ScanReport {
    // Snapshot ids first; conversions re-resolve each cell by id
    let cells: Vec<CellRef> =
        converter.with_host(|h| h.cells().iter().map(|c| c.cell_ref()).collect());
    let report = restore_cells(converter, &cells).await;
    info!(
        "[scan] {} converted, {} hidden, {} aborted, {} untouched",
        report.converted, report.hidden, report.aborted, report.untouched
    );
    report
}

/// Restore the given cells: re-run auto-exec cells, hide auto-hide cells.
pub async fn restore_cells<C: ExecutionChannel, H: NotebookHost>(
    converter: &CellConverter<C, H>,
    cells: &[CellRef],
) -> ScanReport {
    let mut report = ScanReport::default();
    for cell in cells {
        report.add(restore_cell(converter, cell).await);
    }
    report
}

async fn restore_cell<C: ExecutionChannel, H: NotebookHost>(
    converter: &CellConverter<C, H>,
    cell: &CellRef,
) -> ScanReport {
    let mut report = ScanReport::default();
    let Some(class) = converter.with_host(|h| {
        h.cell(&cell.id)
            .map(|view| classify(&view.source, Some(&view.tag), converter.markers()))
    }) else {
        debug!("[scan] {} disappeared before it was scanned", cell.id);
        report.aborted += 1;
        return report;
    };

    match class {
        CellClass::AutoExec => {
            if converter.convert(cell, None).await.is_hidden() {
                report.converted += 1;
            } else {
                report.aborted += 1;
            }
        }
        CellClass::AutoHide => {
            if converter.with_host(|h| h.hide(&cell.id, HideScope::InputAndPrompt)) {
                report.hidden += 1;
            } else {
                report.aborted += 1;
            }
        }
        CellClass::Empty | CellClass::UserAuthored => report.untouched += 1,
    }
    report
}
