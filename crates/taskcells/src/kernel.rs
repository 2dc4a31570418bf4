//! Jupyter kernel implementation of [`ExecutionChannel`].
//!
//! Connects to a running kernel through its connection file (or launches one
//! from a kernelspec), keeps a persistent shell writer, and routes iopub
//! traffic back to the submission that caused it via `parent_header.msg_id`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, ExecutionState, InterruptRequest, JupyterMessage,
    JupyterMessageContent, KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::channel::{
    ActivityTracker, ChannelError, ExecuteMode, ExecutionChannel, KernelStatus, OutputEvent,
    Submission,
};

/// msg_id → sender for the submission that owns it.
type Routes = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<OutputEvent>>>>;

pub struct KernelChannel {
    connection_info: ConnectionInfo,
    /// Only set when this channel launched the kernel and owns the file
    connection_file: Option<PathBuf>,
    session_id: String,
    shell_writer: Mutex<Option<runtimelib::DealerSendConnection>>,
    gate: Mutex<()>,
    routes: Routes,
    activity: Arc<ActivityTracker>,
    iopub_task: Option<tokio::task::JoinHandle<()>>,
    shell_reader_task: Option<tokio::task::JoinHandle<()>>,
    process: Option<tokio::process::Child>,
}

impl KernelChannel {
    /// Connect to a kernel described by a Jupyter connection file.
    pub async fn from_connection_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let connection_info: ConnectionInfo = serde_json::from_str(&content)?;
        info!("[channel] Connecting to kernel via {:?}", path);
        Self::connect(connection_info).await
    }

    /// Launch a new kernel from an installed kernelspec and connect to it.
    pub async fn launch(kernelspec_name: &str) -> Result<Self> {
        let kernelspec = runtimelib::find_kernelspec(kernelspec_name).await?;

        let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(kernelspec_name.to_string()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file_path = runtime_dir.join(format!("taskcells-kernel-{}.json", kernel_id));

        tokio::fs::write(
            &connection_file_path,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        info!(
            "[channel] Starting kernel {} at {:?}",
            kernelspec_name, connection_file_path
        );

        let process = kernelspec
            .command(
                &connection_file_path,
                Some(Stdio::null()),
                Some(Stdio::null()),
            )?
            .kill_on_drop(true)
            .spawn()?;

        // Small delay to let the kernel bind its sockets
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut channel = match Self::connect(connection_info).await {
            Ok(channel) => channel,
            Err(e) => {
                tokio::fs::remove_file(&connection_file_path).await.ok();
                return Err(e);
            }
        };
        channel.connection_file = Some(connection_file_path);
        channel.process = Some(process);

        info!("[channel] Kernel started: {}", kernel_id);
        Ok(channel)
    }

    /// Connect to an already running kernel.
    pub async fn connect(connection_info: ConnectionInfo) -> Result<Self> {
        let session_id = Uuid::new_v4().to_string();
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let activity = Arc::new(ActivityTracker::new());

        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &session_id).await?;

        let iopub_routes = routes.clone();
        let iopub_activity = activity.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => route_iopub(message, &iopub_routes, &iopub_activity),
                    Err(e) => {
                        error!("[channel] iopub read error: {}", e);
                        iopub_activity.set_connected(false);
                        break;
                    }
                }
            }
        });

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await?;

        // Verify kernel is alive with kernel_info handshake
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await?;

        match tokio::time::timeout(Duration::from_secs(30), shell.read()).await {
            Ok(Ok(msg)) => {
                info!("[channel] Kernel alive: got {} reply", msg.header.msg_type);
            }
            Ok(Err(e)) => {
                iopub_task.abort();
                return Err(anyhow::anyhow!("Kernel did not respond: {}", e));
            }
            Err(_) => {
                iopub_task.abort();
                return Err(anyhow::anyhow!("Kernel did not respond within 30s"));
            }
        }

        let (shell_writer, mut shell_reader) = shell.split();

        // Replies carry nothing we need beyond iopub; drain them so the socket never backs up
        let shell_reader_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => debug!("[channel] shell reply: type={}", msg.header.msg_type),
                    Err(e) => {
                        error!("[channel] shell read error: {}", e);
                        break;
                    }
                }
            }
        });

        activity.set_connected(true);
        if activity.status() == KernelStatus::Starting {
            activity.set_status(KernelStatus::Idle);
        }

        Ok(Self {
            connection_info,
            connection_file: None,
            session_id,
            shell_writer: Mutex::new(Some(shell_writer)),
            gate: Mutex::new(()),
            routes,
            activity,
            iopub_task: Some(iopub_task),
            shell_reader_task: Some(shell_reader_task),
            process: None,
        })
    }

    pub fn status(&self) -> KernelStatus {
        self.activity.status()
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.connection_info
    }

    pub async fn interrupt(&self) -> Result<()> {
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await?;

        let request: JupyterMessage = InterruptRequest {}.into();
        control.send(request).await?;
        info!("[channel] Sent interrupt_request");

        Ok(())
    }

    /// Stop listening and, if this channel launched the kernel, shut it down.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }
        if let Some(task) = self.shell_reader_task.take() {
            task.abort();
        }
        self.shell_writer.lock().await.take();
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.activity.set_connected(false);

        if self.process.is_some() {
            let mut control = runtimelib::create_client_control_connection(
                &self.connection_info,
                &self.session_id,
            )
            .await?;
            let request: JupyterMessage = ShutdownRequest { restart: false }.into();
            control.send(request).await.ok();
        }

        if let Some(path) = self.connection_file.take() {
            tokio::fs::remove_file(path).await.ok();
        }
        self.process = None;

        info!("[channel] Kernel channel shut down");
        Ok(())
    }
}

/// Apply one iopub message to the routing table and activity state.
fn route_iopub(message: JupyterMessage, routes: &Routes, activity: &ActivityTracker) {
    let parent_msg_id = message.parent_header.as_ref().map(|h| h.msg_id.clone());

    debug!(
        "[channel] iopub: type={} parent_msg_id={:?}",
        message.header.msg_type, parent_msg_id
    );

    match &message.content {
        JupyterMessageContent::Status(status) => match status.execution_state {
            ExecutionState::Busy => activity.set_status(KernelStatus::Busy),
            ExecutionState::Idle => {
                // Close the submission's stream before reporting idle so
                // waiters see every output of the finished request
                let finished = parent_msg_id.and_then(|id| {
                    routes
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id)
                });
                if finished.is_some() {
                    activity.finish();
                }
                activity.set_status(KernelStatus::Idle);
            }
            ExecutionState::Starting => activity.set_status(KernelStatus::Starting),
            ExecutionState::Dead | ExecutionState::Terminating => {
                warn!("[channel] Kernel reported shutdown");
                routes.lock().unwrap_or_else(|e| e.into_inner()).clear();
                activity.set_connected(false);
            }
            _ => {}
        },
        content => {
            let Some(event) = OutputEvent::from_content(content) else {
                return;
            };
            let Some(msg_id) = parent_msg_id else {
                return;
            };
            let routes = routes.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(sender) = routes.get(&msg_id) {
                // Receiver may have been dropped after its first output
                let _ = sender.send(event);
            }
        }
    }
}

impl ExecutionChannel for KernelChannel {
    async fn submit(&self, code: &str, mode: ExecuteMode) -> Result<Submission, ChannelError> {
        let mut writer = self.shell_writer.lock().await;
        let shell = writer.as_mut().ok_or(ChannelError::NotConnected)?;

        let mut request = ExecuteRequest::new(code.to_string());
        request.store_history = mode.store_history();
        let message: JupyterMessage = request.into();
        let msg_id = message.header.msg_id.clone();

        // Register the route BEFORE sending so the iopub listener can resolve it
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(msg_id.clone(), tx);
        self.activity.begin();

        if let Err(e) = shell.send(message).await {
            self.routes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&msg_id);
            self.activity.finish();
            return Err(ChannelError::Send(e.to_string()));
        }

        info!("[channel] Sent execute_request: msg_id={} mode={:?}", msg_id, mode);
        Ok(Submission::new(msg_id, rx))
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

impl Drop for KernelChannel {
    fn drop(&mut self) {
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }
        if let Some(task) = self.shell_reader_task.take() {
            task.abort();
        }
        if let Some(ref path) = self.connection_file {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_protocol::{Status, StreamContent};

    fn status(state: ExecutionState) -> JupyterMessageContent {
        JupyterMessageContent::Status(Status {
            execution_state: state,
        })
    }

    fn tracked(
        routes: &Routes,
        activity: &ActivityTracker,
    ) -> (JupyterMessage, mpsc::UnboundedReceiver<OutputEvent>) {
        let request: JupyterMessage = ExecuteRequest::new("print(1)".to_string()).into();
        let (tx, rx) = mpsc::unbounded_channel();
        routes
            .lock()
            .unwrap()
            .insert(request.header.msg_id.clone(), tx);
        activity.begin();
        (request, rx)
    }

    #[test]
    fn test_stream_output_routed_to_owner() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let activity = ActivityTracker::new();
        activity.set_connected(true);
        let (request, mut rx) = tracked(&routes, &activity);

        let stream = JupyterMessage::new(
            JupyterMessageContent::StreamContent(StreamContent {
                name: jupyter_protocol::Stdio::Stdout,
                text: "1\n".to_string(),
            }),
            Some(&request),
        );
        route_iopub(stream, &routes, &activity);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.text().as_deref(), Some("1\n"));
    }

    #[test]
    fn test_idle_closes_submission_and_frees_channel() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let activity = ActivityTracker::new();
        activity.set_connected(true);
        let (request, mut rx) = tracked(&routes, &activity);

        route_iopub(
            JupyterMessage::new(status(ExecutionState::Busy), Some(&request)),
            &routes,
            &activity,
        );
        assert!(activity.is_busy());

        route_iopub(
            JupyterMessage::new(status(ExecutionState::Idle), Some(&request)),
            &routes,
            &activity,
        );
        assert!(!activity.is_busy());
        assert!(routes.lock().unwrap().is_empty());
        // Sender dropped with the route
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_foreign_idle_does_not_finish_tracked_request() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let activity = ActivityTracker::new();
        activity.set_connected(true);
        let (_request, _rx) = tracked(&routes, &activity);

        let foreign: JupyterMessage = ExecuteRequest::new("1 + 1".to_string()).into();
        route_iopub(
            JupyterMessage::new(status(ExecutionState::Idle), Some(&foreign)),
            &routes,
            &activity,
        );

        assert_eq!(activity.outstanding(), 1);
        assert!(activity.is_busy());
    }

    #[test]
    fn test_dead_kernel_disconnects() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let activity = ActivityTracker::new();
        activity.set_connected(true);
        let (request, _rx) = tracked(&routes, &activity);

        route_iopub(
            JupyterMessage::new(status(ExecutionState::Dead), Some(&request)),
            &routes,
            &activity,
        );

        assert!(!activity.is_connected());
        assert!(!activity.is_busy());
        assert!(routes.lock().unwrap().is_empty());
    }
}
