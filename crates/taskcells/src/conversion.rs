//! Cell-to-widget conversion.
//!
//! The state machine itself is the pure [`transition`] function. [`CellConverter`]
//! drives it: it performs the side effect each state calls for, then feeds the
//! result back in as a [`ConversionEvent`].
//!
//! ```text
//! Idle ──safe──────────────────────────▶ AwaitingKernelFree ─▶ Converting
//!   └──user authored─▶ ConfirmOverwrite ──accept──┘                │
//!                            └─decline─▶ Aborted                   ▼
//!                         Hidden ◀── kernel free ── AwaitingRenderComplete
//! ```
//!
//! Every remote step waits for the channel to be free first, and every
//! mutation re-resolves the cell by id.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use log::{debug, info, warn};

use crate::catalog::Task;
use crate::cell::{classify, CellClass, CellMode, CellRef, CellType, CellView, Markers};
use crate::channel::{ChannelError, ExecuteMode, ExecutionChannel};
use crate::notebook::{HideScope, NotebookHost};

/// Why a conversion stopped without reaching [`ConversionState::Hidden`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbortReason {
    #[error("User declined to overwrite the cell")]
    OverwriteDeclined,

    #[error("Cell no longer exists")]
    StaleCell,

    #[error("Cell is already being converted")]
    AlreadyConverting,

    #[error("Failed to render task widget: {0}")]
    Render(String),

    #[error("Channel unavailable: {0}")]
    Channel(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionState {
    Idle,
    ConfirmOverwrite,
    AwaitingKernelFree,
    Converting,
    AwaitingRenderComplete,
    Hidden,
    Aborted(AbortReason),
}

impl ConversionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversionState::Hidden | ConversionState::Aborted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionEvent {
    /// The target cell was read and classified
    Classified(CellClass),
    OverwriteAccepted,
    OverwriteDeclined,
    /// The channel reported free
    KernelFree,
    /// The cell's code was handed to the channel
    Submitted,
    Failed(AbortReason),
}

/// Pure transition function. Events that don't apply to a state leave it
/// unchanged, and terminal states absorb everything.
pub fn transition(state: ConversionState, event: ConversionEvent) -> ConversionState {
    use ConversionEvent as E;
    use ConversionState as S;

    match (state, event) {
        (state, _) if state.is_terminal() => state,
        (_, E::Failed(reason)) => S::Aborted(reason),

        (S::Idle, E::Classified(class)) if class.is_overwrite_safe() => S::AwaitingKernelFree,
        (S::Idle, E::Classified(_)) => S::ConfirmOverwrite,

        (S::ConfirmOverwrite, E::OverwriteAccepted) => S::AwaitingKernelFree,
        (S::ConfirmOverwrite, E::OverwriteDeclined) => S::Aborted(AbortReason::OverwriteDeclined),

        (S::AwaitingKernelFree, E::KernelFree) => S::Converting,
        (S::Converting, E::Submitted) => S::AwaitingRenderComplete,
        (S::AwaitingRenderComplete, E::KernelFree) => S::Hidden,

        (state, _) => state,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutcome {
    Hidden,
    Aborted(AbortReason),
}

/// Result of one conversion, with every state it passed through.
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub outcome: ConversionOutcome,
    pub trace: Vec<ConversionState>,
}

impl ConversionReport {
    pub fn is_hidden(&self) -> bool {
        self.outcome == ConversionOutcome::Hidden
    }

    pub fn visited(&self, state: &ConversionState) -> bool {
        self.trace.contains(state)
    }
}

/// Modal dialog shown before overwriting user-authored content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmDialog {
    pub title: String,
    pub body: String,
    pub cancel_label: String,
    pub accept_label: String,
}

impl ConfirmDialog {
    pub fn overwrite() -> Self {
        Self {
            title: "Change to Task Cell?".to_string(),
            body: "Are you sure you want to change this to a task cell? This will cause you \
                   to lose any code or other information already entered into the cell."
                .to_string(),
            cancel_label: "Cancel".to_string(),
            accept_label: "Change Cell Type".to_string(),
        }
    }
}

/// Yes/no confirmation supplied by the host UI.
pub trait OverwritePrompt: Send + Sync {
    /// Resolve to true to accept. Closing the dialog counts as cancel.
    fn confirm_overwrite<'a>(&'a self, dialog: &'a ConfirmDialog) -> BoxFuture<'a, bool>;
}

/// Prompt that always gives the same answer.
#[derive(Debug, Clone, Copy)]
pub struct AutoAnswer(pub bool);

impl OverwritePrompt for AutoAnswer {
    fn confirm_overwrite<'a>(&'a self, _dialog: &'a ConfirmDialog) -> BoxFuture<'a, bool> {
        let answer = self.0;
        Box::pin(async move { answer })
    }
}

/// Produces the cell source that displays a task's widget.
pub trait WidgetRenderer: Send + Sync {
    fn render(&self, task: &Task) -> Result<String, serde_json::Error>;
}

/// Renders a `task_manager.create_task_view(...)` call headed by the
/// auto-exec marker, so reloads re-run it.
#[derive(Debug, Clone)]
pub struct TaskViewRenderer {
    marker: String,
}

impl TaskViewRenderer {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl Default for TaskViewRenderer {
    fn default() -> Self {
        Self::new(Markers::default().auto_exec)
    }
}

impl WidgetRenderer for TaskViewRenderer {
    fn render(&self, task: &Task) -> Result<String, serde_json::Error> {
        let task_json = serde_json::to_string(&task.to_wire()?)?;
        // A JSON string literal is also a valid Python string literal
        let literal = serde_json::to_string(&task_json)?;
        Ok(format!(
            "# {}\nimport json\ntask_manager.create_task_view(json.loads({}))",
            self.marker, literal
        ))
    }
}

/// Ids of cells with a conversion in flight.
#[derive(Debug, Clone, Default)]
pub struct ActiveCells {
    inner: Arc<StdMutex<HashSet<String>>>,
}

impl ActiveCells {
    /// Claim a cell; `None` if another conversion already holds it.
    pub fn try_claim(&self, cell_id: &str) -> Option<ActiveCellGuard> {
        let mut active = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if active.insert(cell_id.to_string()) {
            Some(ActiveCellGuard {
                cells: self.inner.clone(),
                cell_id: cell_id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_active(&self, cell_id: &str) -> bool {
        let active = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        active.contains(cell_id)
    }
}

/// Releases the claim on drop.
#[derive(Debug)]
pub struct ActiveCellGuard {
    cells: Arc<StdMutex<HashSet<String>>>,
    cell_id: String,
}

impl Drop for ActiveCellGuard {
    fn drop(&mut self) {
        let mut active = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.cell_id);
    }
}

struct Run {
    cell_id: String,
    state: ConversionState,
    trace: Vec<ConversionState>,
}

impl Run {
    fn new(cell_id: &str) -> Self {
        Self {
            cell_id: cell_id.to_string(),
            state: ConversionState::Idle,
            trace: vec![ConversionState::Idle],
        }
    }

    fn step(&mut self, event: ConversionEvent) -> &ConversionState {
        let next = transition(self.state.clone(), event);
        if next != self.state {
            debug!("[convert] {}: {:?} -> {:?}", self.cell_id, self.state, next);
            self.state = next.clone();
            self.trace.push(next);
        }
        &self.state
    }

    fn fail(mut self, reason: AbortReason) -> ConversionReport {
        warn!("[convert] Aborted conversion of {}: {}", self.cell_id, reason);
        self.step(ConversionEvent::Failed(reason));
        self.finish()
    }

    fn finish(self) -> ConversionReport {
        let outcome = match &self.state {
            ConversionState::Hidden => ConversionOutcome::Hidden,
            ConversionState::Aborted(reason) => ConversionOutcome::Aborted(reason.clone()),
            other => {
                // Only reachable if the driver stops early; report it as stale
                warn!("[convert] Conversion of {} stopped in {:?}", self.cell_id, other);
                ConversionOutcome::Aborted(AbortReason::StaleCell)
            }
        };
        ConversionReport {
            outcome,
            trace: self.trace,
        }
    }
}

/// Drives conversions against a host notebook and an execution channel.
pub struct CellConverter<C, H> {
    channel: Arc<C>,
    host: Arc<StdMutex<H>>,
    prompt: Arc<dyn OverwritePrompt>,
    renderer: Arc<dyn WidgetRenderer>,
    markers: Markers,
    active: ActiveCells,
}

impl<C, H> Clone for CellConverter<C, H> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            host: self.host.clone(),
            prompt: self.prompt.clone(),
            renderer: self.renderer.clone(),
            markers: self.markers.clone(),
            active: self.active.clone(),
        }
    }
}

impl<C: ExecutionChannel, H: NotebookHost> CellConverter<C, H> {
    pub fn new(channel: Arc<C>, host: Arc<StdMutex<H>>, prompt: Arc<dyn OverwritePrompt>) -> Self {
        Self {
            channel,
            host,
            prompt,
            renderer: Arc::new(TaskViewRenderer::default()),
            markers: Markers::default(),
            active: ActiveCells::default(),
        }
    }

    /// Use custom markers. The default renderer follows the auto-exec marker.
    pub fn with_markers(mut self, markers: Markers) -> Self {
        self.renderer = Arc::new(TaskViewRenderer::new(markers.auto_exec.clone()));
        self.markers = markers;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn WidgetRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    pub fn active_cells(&self) -> &ActiveCells {
        &self.active
    }

    pub fn host(&self) -> &Arc<StdMutex<H>> {
        &self.host
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// Run `f` with the host locked. Never held across an await.
    pub fn with_host<T>(&self, f: impl FnOnce(&mut H) -> T) -> T {
        let mut host = self.host.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut host)
    }

    /// Convert `cell` into a widget cell for `task`, or re-execute its
    /// existing code when `task` is `None`.
    pub async fn convert(&self, cell: &CellRef, task: Option<&Task>) -> ConversionReport {
        let mut run = Run::new(&cell.id);

        let Some(_claim) = self.active.try_claim(&cell.id) else {
            debug!("[convert] {} is already converting, ignoring request", cell.id);
            run.step(ConversionEvent::Failed(AbortReason::AlreadyConverting));
            return run.finish();
        };

        // Idle: read and classify
        let Some(view) = self.with_host(|h| h.cell(&cell.id)) else {
            return run.fail(AbortReason::StaleCell);
        };
        let class = classify(&view.source, Some(&view.tag), &self.markers);
        run.step(ConversionEvent::Classified(class));

        if run.state == ConversionState::ConfirmOverwrite {
            let accepted = self
                .prompt
                .confirm_overwrite(&ConfirmDialog::overwrite())
                .await;
            let event = if accepted {
                ConversionEvent::OverwriteAccepted
            } else {
                ConversionEvent::OverwriteDeclined
            };
            if run.step(event).is_terminal() {
                info!("[convert] Overwrite of {} declined", cell.id);
                return run.finish();
            }
        }

        // AwaitingKernelFree. wait_idle also resolves on disconnect, so check
        // before touching the cell.
        self.channel.wait_idle().await;
        if !self.channel.is_connected() {
            return run.fail(AbortReason::Channel(ChannelError::NotConnected.to_string()));
        }
        let forced = self.with_host(|h| h.set_cell_type(&cell.id, CellType::Code));
        if !forced {
            return run.fail(AbortReason::StaleCell);
        }
        run.step(ConversionEvent::KernelFree);

        // Converting
        if let Some(task) = task {
            let source = match self.renderer.render(task) {
                Ok(source) => source,
                Err(e) => return run.fail(AbortReason::Render(e.to_string())),
            };
            let written = self.with_host(|h| {
                let Some(current) = h.cell(&cell.id) else {
                    return false;
                };
                let mut tag = current.tag;
                tag.mode = Some(CellMode::AutoExec);
                tag.task = Some(task.name.clone());
                h.set_cell_source(&cell.id, &source) && h.set_cell_tag(&cell.id, &tag)
            });
            if !written {
                return run.fail(AbortReason::StaleCell);
            }
        }

        let Some(code) = self.with_host(|h| h.cell(&cell.id).map(|v| v.source)) else {
            return run.fail(AbortReason::StaleCell);
        };

        let mut submission = match self
            .channel
            .submit_when_idle(&code, ExecuteMode::User)
            .await
        {
            Ok(submission) => submission,
            Err(e) => {
                // Nothing ran, so put the cell back the way it was found
                self.with_host(|h| restore_view(h, &view));
                return run.fail(AbortReason::Channel(e.to_string()));
            }
        };
        run.step(ConversionEvent::Submitted);
        self.with_host(|h| h.clear_outputs(&cell.id));

        // AwaitingRenderComplete
        while let Some(event) = submission.next().await {
            self.with_host(|h| h.append_output(&cell.id, &event));
        }
        self.channel.wait_idle().await;

        if !self.with_host(|h| h.hide(&cell.id, HideScope::InputAndPrompt)) {
            return run.fail(AbortReason::StaleCell);
        }
        run.step(ConversionEvent::KernelFree);
        info!("[convert] Converted {}", cell.id);
        run.finish()
    }
}

/// Undo the type, source and tag changes made before a failed submission.
fn restore_view<H: NotebookHost>(host: &mut H, view: &CellView) {
    host.set_cell_type(&view.id, view.cell_type);
    host.set_cell_source(&view.id, &view.source);
    host.set_cell_tag(&view.id, &view.tag);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConversionEvent as E;
    use ConversionState as S;

    #[test]
    fn test_safe_cells_skip_confirmation() {
        assert_eq!(
            transition(S::Idle, E::Classified(CellClass::Empty)),
            S::AwaitingKernelFree
        );
        assert_eq!(
            transition(S::Idle, E::Classified(CellClass::AutoExec)),
            S::AwaitingKernelFree
        );
    }

    #[test]
    fn test_user_content_requires_confirmation() {
        assert_eq!(
            transition(S::Idle, E::Classified(CellClass::UserAuthored)),
            S::ConfirmOverwrite
        );
        assert_eq!(
            transition(S::Idle, E::Classified(CellClass::AutoHide)),
            S::ConfirmOverwrite
        );
    }

    #[test]
    fn test_confirmation_answers() {
        assert_eq!(
            transition(S::ConfirmOverwrite, E::OverwriteAccepted),
            S::AwaitingKernelFree
        );
        assert_eq!(
            transition(S::ConfirmOverwrite, E::OverwriteDeclined),
            S::Aborted(AbortReason::OverwriteDeclined)
        );
    }

    #[test]
    fn test_happy_path() {
        let mut state = S::Idle;
        for event in [
            E::Classified(CellClass::Empty),
            E::KernelFree,
            E::Submitted,
            E::KernelFree,
        ] {
            state = transition(state, event);
        }
        assert_eq!(state, S::Hidden);
    }

    #[test]
    fn test_kernel_free_before_submit_does_not_hide() {
        assert_eq!(transition(S::Converting, E::KernelFree), S::Converting);
    }

    #[test]
    fn test_terminal_states_absorb() {
        assert_eq!(
            transition(S::Hidden, E::Failed(AbortReason::StaleCell)),
            S::Hidden
        );
        let aborted = S::Aborted(AbortReason::OverwriteDeclined);
        assert_eq!(transition(aborted.clone(), E::OverwriteAccepted), aborted);
    }

    #[test]
    fn test_failure_aborts_from_any_live_state() {
        for state in [
            S::Idle,
            S::ConfirmOverwrite,
            S::AwaitingKernelFree,
            S::Converting,
            S::AwaitingRenderComplete,
        ] {
            assert_eq!(
                transition(state, E::Failed(AbortReason::StaleCell)),
                S::Aborted(AbortReason::StaleCell)
            );
        }
    }

    #[test]
    fn test_active_cells_guard_releases_on_drop() {
        let active = ActiveCells::default();
        let guard = active.try_claim("a").unwrap();
        assert!(active.try_claim("a").is_none());
        assert!(active.try_claim("b").is_some());
        assert!(active.is_active("a"));
        drop(guard);
        assert!(!active.is_active("a"));
        assert!(active.try_claim("a").is_some());
    }

    #[test]
    fn test_renderer_embeds_task_json() {
        let mut task = Task::new("crop", "imgproc");
        task.description = "Crop \"tight\"\nimages".into();

        let source = TaskViewRenderer::default().render(&task).unwrap();

        assert!(source.starts_with("# !AUTO_EXEC\n"));
        assert!(source.contains("task_manager.create_task_view(json.loads(\""));
        let literal = source
            .split("json.loads(")
            .nth(1)
            .and_then(|s| s.strip_suffix("))"))
            .unwrap();
        let inner: String = serde_json::from_str(literal).unwrap();
        let value: serde_json::Value = serde_json::from_str(&inner).unwrap();
        assert_eq!(value["label"], "crop");
        assert_eq!(value["description"], "Crop \"tight\"\nimages");
    }

    #[test]
    fn test_renderer_passes_catalog_fields_through() {
        let text = serde_json::json!({
            "crop": {
                "label": "crop",
                "library_name": "imgproc",
                "required_args": [{"arg_name": "x", "label": "X", "value": ""}],
                "returns": [{"label": "out"}]
            }
        })
        .to_string();
        let task = crate::catalog::parse_catalog(&text).unwrap().remove(0);

        let source = TaskViewRenderer::default().render(&task).unwrap();

        let literal = source
            .split("json.loads(")
            .nth(1)
            .and_then(|s| s.strip_suffix("))"))
            .unwrap();
        let inner: String = serde_json::from_str(literal).unwrap();
        let value: serde_json::Value = serde_json::from_str(&inner).unwrap();
        assert_eq!(value["required_args"][0]["value"], "");
        assert!(value["required_args"][0].get("type").is_none());
        assert!(value["returns"][0].get("arg_name").is_none());
    }

    #[test]
    fn test_rendered_source_classifies_as_auto_exec() {
        let source = TaskViewRenderer::default()
            .render(&Task::new("sum", "stats"))
            .unwrap();
        assert_eq!(
            classify(&source, None, &Markers::default()),
            CellClass::AutoExec
        );
    }

    #[test]
    fn test_dialog_text() {
        let dialog = ConfirmDialog::overwrite();
        assert_eq!(dialog.title, "Change to Task Cell?");
        assert_eq!(dialog.cancel_label, "Cancel");
        assert_eq!(dialog.accept_label, "Change Cell Type");
    }

    #[tokio::test]
    async fn test_auto_answer() {
        let dialog = ConfirmDialog::overwrite();
        assert!(AutoAnswer(true).confirm_overwrite(&dialog).await);
        assert!(!AutoAnswer(false).confirm_overwrite(&dialog).await);
    }
}
