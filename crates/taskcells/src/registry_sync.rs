//! Two-way sync between the kernel's globals and the task manager namespace.
//!
//! The kernel side does the actual work: [`RegistrySync::initialize`] submits a
//! bootstrap program that creates the task manager and registers
//! `sync_namespaces` on IPython's `post_execute` event, so every user execution
//! syncs without a round trip. [`RegistrySync::sync`] is the explicit trigger
//! used after initialization and by the CLI.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::{ChannelError, ExecuteMode, ExecutionChannel, OutputEvent};

/// Kernel-side package providing `TaskManager` and `compile_tasks`.
pub const REMOTE_PACKAGE: &str = "tasklib";

/// Reports the task manager namespace as `{name: type name}`, or `null`
/// when the task manager doesn't exist yet.
pub const SYNC_PROGRAM: &str = r#"import json as _taskcells_json
_taskcells_tm = globals().get('task_manager')
if _taskcells_tm is None:
    print(_taskcells_json.dumps(None))
else:
    sync_namespaces()
    print(_taskcells_json.dumps({k: type(v).__name__ for k, v in _taskcells_tm.namespace.items() if not k.startswith('_')}))
del _taskcells_tm
"#;

/// IPython events the sync attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncHook {
    /// After every cell execution
    PostExecute,
    /// Once when the shell (re)starts
    ShellInitialized,
}

impl SyncHook {
    pub fn event_name(self) -> &'static str {
        match self {
            SyncHook::PostExecute => "post_execute",
            SyncHook::ShellInitialized => "shell_initialized",
        }
    }

    /// Kernel-side function bound to the event.
    pub fn callback(self) -> &'static str {
        match self {
            SyncHook::PostExecute => "sync_namespaces",
            SyncHook::ShellInitialized => "init_libs",
        }
    }
}

/// Variable name to value, exchanged between the two namespaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceSnapshot {
    vars: HashMap<String, Value>,
}

impl NamespaceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.vars.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Sorted variable names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.vars.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Copy every entry of `other` into `self`; `other` wins on conflicts.
    pub fn merge(&mut self, other: &NamespaceSnapshot) {
        for (name, value) in &other.vars {
            self.vars.insert(name.clone(), value.clone());
        }
    }
}

impl FromIterator<(String, Value)> for NamespaceSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Local model of one kernel-side sync: task manager -> globals, then
/// globals -> task manager. Afterwards both hold the same entries.
pub fn sync_two_way(task: &mut NamespaceSnapshot, host: &mut NamespaceSnapshot) {
    host.merge(task);
    task.merge(host);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The namespaces were synced; the snapshot describes the task manager side
    Synced(NamespaceSnapshot),
    /// The task manager wasn't initialized yet. The next trigger catches up.
    Skipped,
}

/// Owns the registration state of the kernel-side sync hooks.
#[derive(Debug, Default)]
pub struct RegistrySync {
    extra_imports: Vec<String>,
    initialized: AtomicBool,
    hooks: StdMutex<BTreeSet<SyncHook>>,
}

impl RegistrySync {
    /// `extra_imports` are Python statements run when the task manager is created.
    pub fn new(extra_imports: Vec<String>) -> Self {
        Self {
            extra_imports,
            ..Default::default()
        }
    }

    /// Register a hook. Returns false if it was already registered.
    pub fn register(&self, hook: SyncHook) -> bool {
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        hooks.insert(hook)
    }

    pub fn registered_hooks(&self) -> Vec<SyncHook> {
        let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        hooks.iter().copied().collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Forget initialization, e.g. after a kernel restart.
    pub fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// The fixed initialization program.
    ///
    /// Safe to run repeatedly: the task manager is only created once, and each
    /// hook registration is guarded by callback name since re-running the
    /// program defines fresh function objects.
    pub fn bootstrap_program(&self) -> String {
        let mut code = String::new();
        code.push_str("global task_manager\n\n");

        code.push_str("def init_libs():\n");
        code.push_str("    global json\n    import json\n");
        code.push_str(&format!(
            "    global TaskManager\n    from {} import TaskManager\n",
            REMOTE_PACKAGE
        ));
        for statement in &self.extra_imports {
            // JSON string literals are valid Python string literals
            let literal = serde_json::to_string(statement).unwrap_or_else(|_| "''".to_string());
            code.push_str(&format!("    exec({}, globals())\n", literal));
        }
        code.push_str("    global task_manager\n");
        code.push_str("    if globals().get('task_manager') is None:\n");
        code.push_str("        task_manager = TaskManager()\n\n");

        code.push_str("def sync_namespaces():\n");
        code.push_str("    tm = globals().get('task_manager')\n");
        code.push_str("    if tm is None:\n        return\n");
        code.push_str("    for name, value in tm.namespace.items():\n");
        code.push_str("        globals()[name] = value\n");
        code.push_str("    tm.update_namespace(globals())\n\n");

        code.push_str("def _taskcells_registered(event, fn):\n");
        code.push_str("    return any(getattr(cb, '__name__', None) == fn.__name__\n");
        code.push_str("               for cb in get_ipython().events.callbacks[event])\n\n");

        for hook in self.registered_hooks() {
            code.push_str(&format!(
                "if not _taskcells_registered('{event}', {cb}):\n    get_ipython().events.register('{event}', {cb})\n",
                event = hook.event_name(),
                cb = hook.callback()
            ));
        }

        code.push_str("\ninit_libs()\nsync_namespaces()\n");
        code
    }

    /// Run the bootstrap program. Returns whether the kernel accepted it.
    ///
    /// A failure leaves the sync uninitialized; calling again retries.
    pub async fn initialize<C: ExecutionChannel>(&self, channel: &C) -> Result<bool, ChannelError> {
        self.register(SyncHook::PostExecute);
        self.register(SyncHook::ShellInitialized);

        let events = channel
            .submit_when_idle(&self.bootstrap_program(), ExecuteMode::Background)
            .await?
            .collect()
            .await;

        if let Some(OutputEvent::Error { ename, evalue, .. }) = events.iter().find(|e| e.is_error())
        {
            warn!("[sync] Bootstrap failed: {}: {}", ename, evalue);
            return Ok(false);
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!("[sync] Task manager initialized");
        Ok(true)
    }

    /// Sync both namespaces once.
    ///
    /// Before initialization this is a no-op. Missed syncs aren't replayed;
    /// the kernel-side post-execute hook covers every later execution.
    pub async fn sync<C: ExecutionChannel>(&self, channel: &C) -> Result<SyncOutcome, ChannelError> {
        if !self.is_initialized() {
            debug!("[sync] Task manager not initialized, skipping sync");
            return Ok(SyncOutcome::Skipped);
        }

        let events = channel
            .submit_when_idle(SYNC_PROGRAM, ExecuteMode::Background)
            .await?
            .collect()
            .await;

        let mut text = String::new();
        for event in &events {
            match event {
                OutputEvent::Error { ename, evalue, .. } => {
                    warn!("[sync] Namespace sync failed: {}: {}", ename, evalue);
                    return Ok(SyncOutcome::Skipped);
                }
                other => {
                    if let Some(t) = other.text() {
                        text.push_str(&t);
                    }
                }
            }
        }

        match serde_json::from_str::<Option<NamespaceSnapshot>>(text.trim()) {
            Ok(Some(snapshot)) => {
                debug!("[sync] Synced {} names", snapshot.len());
                Ok(SyncOutcome::Synced(snapshot))
            }
            Ok(None) => {
                debug!("[sync] Kernel has no task manager yet, skipping sync");
                Ok(SyncOutcome::Skipped)
            }
            Err(e) => {
                warn!("[sync] Unreadable sync response: {}", e);
                Ok(SyncOutcome::Skipped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(entries: &[(&str, Value)]) -> NamespaceSnapshot {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_register_is_idempotent() {
        let sync = RegistrySync::default();
        assert!(sync.register(SyncHook::PostExecute));
        assert!(!sync.register(SyncHook::PostExecute));
        assert!(sync.register(SyncHook::ShellInitialized));
        assert_eq!(
            sync.registered_hooks(),
            vec![SyncHook::PostExecute, SyncHook::ShellInitialized]
        );
    }

    #[test]
    fn test_bootstrap_registers_each_hook_once() {
        let sync = RegistrySync::default();
        sync.register(SyncHook::PostExecute);
        sync.register(SyncHook::PostExecute);
        let program = sync.bootstrap_program();

        assert_eq!(
            program
                .matches("get_ipython().events.register('post_execute', sync_namespaces)")
                .count(),
            1
        );
        assert!(program.contains("if not _taskcells_registered('post_execute', sync_namespaces)"));
        assert!(!program.contains("'shell_initialized'"));
        assert!(program.ends_with("init_libs()\nsync_namespaces()\n"));
    }

    #[test]
    fn test_bootstrap_guards_task_manager_creation() {
        let program = RegistrySync::default().bootstrap_program();
        assert!(program.contains("from tasklib import TaskManager"));
        assert!(program.contains("if globals().get('task_manager') is None:"));
    }

    #[test]
    fn test_bootstrap_quotes_extra_imports() {
        let sync = RegistrySync::new(vec!["import numpy as np".into(), "x = 'a\"b'".into()]);
        let program = sync.bootstrap_program();
        assert!(program.contains("    exec(\"import numpy as np\", globals())\n"));
        assert!(program.contains(r#"    exec("x = 'a\"b'", globals())"#));
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(SyncHook::PostExecute.event_name(), "post_execute");
        assert_eq!(SyncHook::ShellInitialized.callback(), "init_libs");
    }

    #[test]
    fn test_merge_later_wins() {
        let mut a = snapshot(&[("x", json!(1)), ("y", json!(2))]);
        let b = snapshot(&[("y", json!(3)), ("z", json!(4))]);
        a.merge(&b);
        assert_eq!(a.get("y"), Some(&json!(3)));
        assert_eq!(a.names(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_sync_two_way_converges() {
        let mut task = snapshot(&[("result", json!("DataFrame")), ("shared", json!("task"))]);
        let mut host = snapshot(&[("df", json!("DataFrame")), ("shared", json!("host"))]);

        sync_two_way(&mut task, &mut host);

        assert_eq!(task, host);
        // Task manager state is pushed first, so it wins conflicts
        assert_eq!(host.get("shared"), Some(&json!("task")));
        assert_eq!(host.len(), 3);
    }

    #[test]
    fn test_sync_two_way_is_idempotent() {
        let mut task = snapshot(&[("a", json!(1))]);
        let mut host = snapshot(&[("b", json!(2))]);
        sync_two_way(&mut task, &mut host);
        let (task_once, host_once) = (task.clone(), host.clone());

        sync_two_way(&mut task, &mut host);

        assert_eq!(task, task_once);
        assert_eq!(host, host_once);
    }

    #[test]
    fn test_snapshot_deserializes_from_object() {
        let snap: NamespaceSnapshot = serde_json::from_str(r#"{"df": "DataFrame"}"#).unwrap();
        assert_eq!(snap.get("df"), Some(&json!("DataFrame")));
    }

    #[test]
    fn test_reset_clears_initialized() {
        let sync = RegistrySync::default();
        sync.initialized.store(true, Ordering::SeqCst);
        sync.reset();
        assert!(!sync.is_initialized());
    }
}
