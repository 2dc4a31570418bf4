//! Shared test support: a scripted in-memory channel and notebook helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use taskcells::channel::{ActivityTracker, KernelStatus};
use taskcells::notebook::{NotebookDocument, NotebookHost};
use taskcells::{ChannelError, ExecuteMode, ExecutionChannel, OutputEvent, Submission};
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub code: String,
    pub mode: ExecuteMode,
    /// Whether the channel reported busy at the moment of submission
    pub busy_at_submit: bool,
}

/// Channel that answers submissions from a script after a fixed latency.
pub struct ScriptedChannel {
    activity: Arc<ActivityTracker>,
    gate: Mutex<()>,
    replies: StdMutex<Vec<(String, Vec<OutputEvent>)>>,
    submitted: StdMutex<Vec<SubmitRecord>>,
    latency: Duration,
    /// Connected, but every send fails
    refuse_sends: AtomicBool,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        let activity = Arc::new(ActivityTracker::new());
        activity.set_connected(true);
        activity.set_status(KernelStatus::Idle);
        Self {
            activity,
            gate: Mutex::new(()),
            replies: StdMutex::new(Vec::new()),
            submitted: StdMutex::new(Vec::new()),
            latency: Duration::from_millis(20),
            refuse_sends: AtomicBool::new(false),
        }
    }

    pub fn refusing_sends() -> Self {
        let channel = Self::new();
        channel.refuse_sends.store(true, Ordering::SeqCst);
        channel
    }

    pub fn disconnected() -> Self {
        let channel = Self::new();
        channel.activity.set_connected(false);
        channel
    }

    /// Reply with `events` to any code containing `needle`. First match wins.
    pub fn reply(self, needle: &str, events: Vec<OutputEvent>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push((needle.to_string(), events));
        self
    }

    pub fn reply_text(self, needle: &str, text: &str) -> Self {
        self.reply(
            needle,
            vec![OutputEvent::Stream {
                name: "stdout".into(),
                text: text.to_string(),
            }],
        )
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn submitted_codes(&self) -> Vec<String> {
        self.submissions().into_iter().map(|r| r.code).collect()
    }

    /// Keep the kernel busy with someone else's work for `duration`.
    pub fn hold_busy(&self, duration: Duration) {
        self.activity.set_status(KernelStatus::Busy);
        let activity = self.activity.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            activity.set_status(KernelStatus::Idle);
        });
    }

    fn script_for(&self, code: &str) -> Vec<OutputEvent> {
        self.replies
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| code.contains(needle.as_str()))
            .map(|(_, events)| events.clone())
            .unwrap_or_default()
    }
}

impl ExecutionChannel for ScriptedChannel {
    async fn submit(&self, code: &str, mode: ExecuteMode) -> Result<Submission, ChannelError> {
        if !self.activity.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        if self.refuse_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::Send("shell socket closed".into()));
        }
        self.submitted.lock().unwrap().push(SubmitRecord {
            code: code.to_string(),
            mode,
            busy_at_submit: self.activity.is_busy(),
        });

        let events = self.script_for(code);
        let (tx, rx) = mpsc::unbounded_channel();
        self.activity.begin();
        self.activity.set_status(KernelStatus::Busy);

        let activity = self.activity.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            for event in events {
                let _ = tx.send(event);
            }
            drop(tx);
            activity.set_status(KernelStatus::Idle);
            activity.finish();
        });

        Ok(Submission::new(uuid::Uuid::new_v4().to_string(), rx))
    }

    fn is_busy(&self) -> bool {
        self.activity.is_busy()
    }

    fn is_connected(&self) -> bool {
        self.activity.is_connected()
    }

    async fn wait_idle(&self) {
        self.activity.wait_idle().await
    }

    async fn wait_connected(&self) {
        self.activity.wait_connected().await
    }

    fn submit_gate(&self) -> &Mutex<()> {
        &self.gate
    }
}

pub fn notebook(sources: &[&str]) -> Arc<StdMutex<NotebookDocument>> {
    let mut doc = NotebookDocument::new_empty();
    doc.notebook.cells.clear();
    for source in sources {
        doc.push_code_cell(source);
    }
    Arc::new(StdMutex::new(doc))
}

pub fn cell_ref(host: &Arc<StdMutex<NotebookDocument>>, index: usize) -> taskcells::CellRef {
    host.lock().unwrap().cell_at(index).unwrap().cell_ref()
}

pub fn catalog_json() -> String {
    serde_json::json!({
        "resize": {"library_name": "imgproc", "author": "Ann", "description": "Resize"},
        "crop": {"library_name": "imgproc", "author": "Ann", "description": "Crop"},
        "sum": {"library_name": "stats", "author": "Bo", "description": "Sum"}
    })
    .to_string()
}
