//! Execution channel abstraction over a remote, stateful kernel.
//!
//! The kernel is a single shared FIFO resource: every component that submits
//! code (catalog loading, namespace sync, cell conversion) competes for it.
//! Instead of polling a busy flag, implementations expose a completion
//! notification through [`ActivityTracker`]: `wait_idle()` resolves once the
//! kernel reports idle *and* every request this client submitted has
//! finished, so callers never overlap submissions.

use std::future::Future;

use jupyter_protocol::JupyterMessageContent;
use log::warn;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch, Mutex};

/// Kernel status as observed on iopub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// No connection established yet
    Starting,
    /// Kernel is ready and idle
    Idle,
    /// Kernel is executing code
    Busy,
    /// Kernel went away
    Dead,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

/// A single output produced by submitted code.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// stdout / stderr text
    Stream { name: String, text: String },
    /// display_data or execute_result, keyed by mime type
    Data {
        data: Map<String, Value>,
        execution_count: Option<i64>,
    },
    /// Code raised; failures never surface as local errors
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl OutputEvent {
    /// Translate an iopub message into an output event, if it carries one.
    pub fn from_content(content: &JupyterMessageContent) -> Option<Self> {
        match content {
            JupyterMessageContent::StreamContent(stream) => {
                let name = match stream.name {
                    jupyter_protocol::Stdio::Stdout => "stdout",
                    jupyter_protocol::Stdio::Stderr => "stderr",
                };
                Some(OutputEvent::Stream {
                    name: name.to_string(),
                    text: stream.text.clone(),
                })
            }
            JupyterMessageContent::DisplayData(display) => Some(OutputEvent::Data {
                data: media_to_map(&display.data),
                execution_count: None,
            }),
            JupyterMessageContent::ExecuteResult(result) => Some(OutputEvent::Data {
                data: media_to_map(&result.data),
                execution_count: Some(result.execution_count.0 as i64),
            }),
            JupyterMessageContent::ErrorOutput(error) => Some(OutputEvent::Error {
                ename: error.ename.clone(),
                evalue: error.evalue.clone(),
                traceback: error.traceback.clone(),
            }),
            _ => None,
        }
    }

    /// Plain text carried by the event: stream text or the `text/plain` bundle entry.
    pub fn text(&self) -> Option<String> {
        match self {
            OutputEvent::Stream { text, .. } => Some(text.clone()),
            OutputEvent::Data { data, .. } => match data.get("text/plain") {
                Some(Value::String(s)) => Some(s.clone()),
                // nbformat allows multiline strings as arrays of lines
                Some(Value::Array(lines)) => Some(
                    lines
                        .iter()
                        .filter_map(|l| l.as_str())
                        .collect::<Vec<_>>()
                        .join(""),
                ),
                _ => None,
            },
            OutputEvent::Error { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OutputEvent::Error { .. })
    }

    /// nbformat v4 JSON for storing the event as a cell output.
    pub fn to_nbformat(&self) -> Value {
        match self {
            OutputEvent::Stream { name, text } => json!({
                "output_type": "stream",
                "name": name,
                "text": text
            }),
            OutputEvent::Data {
                data,
                execution_count: Some(count),
            } => json!({
                "output_type": "execute_result",
                "data": data,
                "metadata": {},
                "execution_count": count
            }),
            OutputEvent::Data {
                data,
                execution_count: None,
            } => json!({
                "output_type": "display_data",
                "data": data,
                "metadata": {}
            }),
            OutputEvent::Error {
                ename,
                evalue,
                traceback,
            } => json!({
                "output_type": "error",
                "ename": ename,
                "evalue": evalue,
                "traceback": traceback
            }),
        }
    }
}

fn media_to_map(media: &jupyter_protocol::Media) -> Map<String, Value> {
    match serde_json::to_value(media) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => {
            warn!("[channel] Failed to serialize media bundle: {}", e);
            Map::new()
        }
    }
}

/// How a request is recorded by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
    /// A user-visible cell execution: stored in history, bumps the execution count.
    User,
    /// Extension plumbing (catalog retrieval, bootstrap, sync): not stored in history.
    Background,
}

impl ExecuteMode {
    pub fn store_history(self) -> bool {
        matches!(self, ExecuteMode::User)
    }
}

/// Error type for channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Kernel is not connected")]
    NotConnected,

    #[error("Channel closed")]
    Closed,

    #[error("Failed to send request: {0}")]
    Send(String),
}

/// Stream of outputs for one submitted request.
///
/// The stream ends when the kernel reports idle for the request.
#[derive(Debug)]
pub struct Submission {
    msg_id: String,
    events: mpsc::UnboundedReceiver<OutputEvent>,
}

impl Submission {
    pub fn new(msg_id: String, events: mpsc::UnboundedReceiver<OutputEvent>) -> Self {
        Self { msg_id, events }
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub async fn next(&mut self) -> Option<OutputEvent> {
        self.events.recv().await
    }

    /// Wait for the first output event, discarding the rest.
    pub async fn first_output(mut self) -> Option<OutputEvent> {
        self.events.recv().await
    }

    /// Collect every output until the request completes.
    pub async fn collect(mut self) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }
}

/// A remote, stateful, asynchronously busy execution environment.
pub trait ExecutionChannel: Send + Sync {
    /// Send code to the kernel. Callers must have observed the channel idle;
    /// prefer [`ExecutionChannel::submit_when_idle`].
    fn submit(
        &self,
        code: &str,
        mode: ExecuteMode,
    ) -> impl Future<Output = Result<Submission, ChannelError>> + Send;

    fn is_busy(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Resolves once nothing is outstanding and the kernel is idle.
    fn wait_idle(&self) -> impl Future<Output = ()> + Send;

    /// Resolves once the channel is connected.
    fn wait_connected(&self) -> impl Future<Output = ()> + Send;

    /// Serializes submissions from this client.
    fn submit_gate(&self) -> &Mutex<()>;

    /// Wait for the channel to be free, re-check under the gate, then submit.
    ///
    /// The busy flag is re-read immediately before issuing, so two callers
    /// that both observed idle can never overlap.
    fn submit_when_idle(
        &self,
        code: &str,
        mode: ExecuteMode,
    ) -> impl Future<Output = Result<Submission, ChannelError>> + Send {
        async move {
            loop {
                self.wait_idle().await;
                let _gate = self.submit_gate().lock().await;
                if !self.is_connected() {
                    return Err(ChannelError::NotConnected);
                }
                if self.is_busy() {
                    continue;
                }
                return self.submit(code, mode).await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Activity {
    connected: bool,
    status: KernelStatus,
    outstanding: usize,
}

impl Activity {
    fn busy(&self) -> bool {
        self.status == KernelStatus::Busy || self.outstanding > 0
    }
}

/// Busy/connected bookkeeping shared by channel implementations.
///
/// Tracks the kernel's reported status plus the number of requests this
/// client submitted that have not yet reported idle.
#[derive(Debug)]
pub struct ActivityTracker {
    tx: watch::Sender<Activity>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Activity {
            connected: false,
            status: KernelStatus::Starting,
            outstanding: 0,
        });
        Self { tx }
    }

    pub fn set_connected(&self, connected: bool) {
        self.tx.send_modify(|a| {
            a.connected = connected;
            if !connected {
                a.status = KernelStatus::Dead;
                a.outstanding = 0;
            }
        });
    }

    pub fn set_status(&self, status: KernelStatus) {
        self.tx.send_modify(|a| a.status = status);
    }

    /// A request was sent.
    pub fn begin(&self) {
        self.tx.send_modify(|a| a.outstanding += 1);
    }

    /// A request this client sent reported idle (or failed to send).
    pub fn finish(&self) {
        self.tx
            .send_modify(|a| a.outstanding = a.outstanding.saturating_sub(1));
    }

    pub fn status(&self) -> KernelStatus {
        self.tx.borrow().status
    }

    pub fn outstanding(&self) -> usize {
        self.tx.borrow().outstanding
    }

    pub fn is_busy(&self) -> bool {
        self.tx.borrow().busy()
    }

    pub fn is_connected(&self) -> bool {
        self.tx.borrow().connected
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        // A disconnected kernel never becomes busy again; don't hang on it
        if rx.wait_for(|a| !a.busy() || !a.connected).await.is_err() {
            warn!("[channel] Activity tracker dropped while waiting for idle");
        }
    }

    pub async fn wait_connected(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|a| a.connected).await.is_err() {
            warn!("[channel] Activity tracker dropped while waiting for connection");
        }
    }
}
