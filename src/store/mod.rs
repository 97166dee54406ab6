//! Conversation state collaborator.
//!
//! The orchestrator keeps per-conversation settings, the active-run row and
//! the trusted-prefix table here. Only identifiers and an opaque pending
//! action live in the store; live run objects never do.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::events::{ApprovalRequest, RateLimitWindow, TokenUsageSnapshot};
use crate::ids::{ConversationId, RunId, ThreadId};

/// On-disk schema version for [`FileStore`].
const STATE_FILE_VERSION: u32 = 1;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Settings a new conversation starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationDefaults {
    pub machine: String,
    pub workdir: String,
    pub approval_policy: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub id: ConversationId,
    pub machine: String,
    pub workdir: String,
    pub thread_id: Option<ThreadId>,
    pub thread_title: Option<String>,
    pub approval_policy: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub last_input_tokens: Option<i64>,
    #[serde(default)]
    pub last_output_tokens: Option<i64>,
    #[serde(default)]
    pub last_cached_tokens: Option<i64>,
    #[serde(default)]
    pub last_total_tokens: Option<i64>,
    #[serde(default)]
    pub last_context_window: Option<i64>,
    #[serde(default)]
    pub last_context_remaining: Option<i64>,
    #[serde(default)]
    pub rate_primary: Option<RateLimitWindow>,
    #[serde(default)]
    pub rate_secondary: Option<RateLimitWindow>,
    pub updated_at: i64,
}

impl ConversationState {
    fn new(id: &ConversationId, defaults: &ConversationDefaults) -> Self {
        Self {
            id: id.clone(),
            machine: defaults.machine.clone(),
            workdir: defaults.workdir.clone(),
            thread_id: None,
            thread_title: None,
            approval_policy: defaults.approval_policy.clone(),
            model: defaults.model.clone(),
            reasoning_effort: defaults.reasoning_effort.clone(),
            last_input_tokens: None,
            last_output_tokens: None,
            last_cached_tokens: None,
            last_total_tokens: None,
            last_context_window: None,
            last_context_remaining: None,
            rate_primary: None,
            rate_secondary: None,
            updated_at: now_unix(),
        }
    }

    /// Forget the thread and every per-thread telemetry field.
    fn clear_thread_fields(&mut self) {
        self.thread_id = None;
        self.thread_title = None;
        self.last_input_tokens = None;
        self.last_output_tokens = None;
        self.last_cached_tokens = None;
        self.last_total_tokens = None;
        self.last_context_window = None;
        self.last_context_remaining = None;
        self.rate_primary = None;
        self.rate_secondary = None;
    }

    /// Merge whatever fields `usage` carries; absent fields keep old values.
    fn apply_usage(&mut self, usage: &TokenUsageSnapshot) {
        if let Some(total) = usage.total_tokens {
            self.last_total_tokens = Some(total);
        }
        if let Some(window) = usage.model_context_window {
            self.last_context_window = Some(window);
        }
        if let Some(remaining) = usage.context_remaining() {
            self.last_context_remaining = Some(remaining);
        }
        if let Some(input) = usage.input_tokens {
            self.last_input_tokens = Some(input);
        }
        if let Some(output) = usage.output_tokens {
            self.last_output_tokens = Some(output);
        }
        if let Some(cached) = usage.cached_input_tokens {
            self.last_cached_tokens = Some(cached);
        }
        merge_window(&mut self.rate_primary, usage.rate_limits.primary.as_ref());
        merge_window(&mut self.rate_secondary, usage.rate_limits.secondary.as_ref());
    }
}

fn merge_window(slot: &mut Option<RateLimitWindow>, update: Option<&RateLimitWindow>) {
    let Some(update) = update.filter(|w| !w.is_empty()) else {
        return;
    };
    let current = slot.get_or_insert_with(RateLimitWindow::default);
    if update.used_percent.is_some() {
        current.used_percent = update.used_percent;
    }
    if update.window_minutes.is_some() {
        current.window_minutes = update.window_minutes;
    }
    if update.resets_at.is_some() {
        current.resets_at = update.resets_at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    WaitingApproval,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
        }
    }
}

/// What a paused run is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingAction {
    /// The backend asked for a decision.
    ExecApproval {
        request: ApprovalRequest,
        prefix: String,
        thread_id: Option<ThreadId>,
    },
    /// The relay intercepted a write-like tool start and will run it itself.
    ProxyExec {
        command: String,
        cwd: String,
        reason: Option<String>,
    },
}

impl PendingAction {
    pub fn command(&self) -> &str {
        match self {
            Self::ExecApproval { request, .. } => &request.command,
            Self::ProxyExec { command, .. } => command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRun {
    pub run_id: RunId,
    pub status: RunStatus,
    pub pending: Option<PendingAction>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrustedPrefix {
    machine: String,
    thread: String,
    prefix: String,
}

pub trait StateStore: Send + Sync {
    fn ensure_conversation(
        &self,
        id: &ConversationId,
        defaults: &ConversationDefaults,
    ) -> Result<ConversationState, StoreError>;

    fn get_conversation(&self, id: &ConversationId)
        -> Result<Option<ConversationState>, StoreError>;

    /// Switch machine and workdir; clears the thread.
    fn set_machine(&self, id: &ConversationId, machine: &str, workdir: &str)
        -> Result<(), StoreError>;

    fn set_thread(
        &self,
        id: &ConversationId,
        thread_id: &ThreadId,
        title: Option<&str>,
    ) -> Result<(), StoreError>;

    fn clear_thread(&self, id: &ConversationId) -> Result<(), StoreError>;

    fn set_approval_policy(&self, id: &ConversationId, policy: &str) -> Result<(), StoreError>;

    fn update_token_telemetry(
        &self,
        id: &ConversationId,
        usage: &TokenUsageSnapshot,
    ) -> Result<(), StoreError>;

    fn get_active_run(&self, id: &ConversationId) -> Result<Option<ActiveRun>, StoreError>;

    fn set_active_run(
        &self,
        id: &ConversationId,
        run_id: &RunId,
        status: RunStatus,
        pending: Option<PendingAction>,
    ) -> Result<(), StoreError>;

    fn clear_active_run(&self, id: &ConversationId) -> Result<(), StoreError>;

    /// Sorted prefixes trusted for `(machine, thread)`.
    fn list_trusted_prefixes(&self, machine: &str, thread: &str)
        -> Result<BTreeSet<String>, StoreError>;

    /// Returns `false` when the prefix was already trusted.
    fn add_trusted_prefix(&self, machine: &str, thread: &str, prefix: &str)
        -> Result<bool, StoreError>;
}

/// Full store contents; also the on-disk format of [`FileStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    version: u32,
    conversations: BTreeMap<ConversationId, ConversationState>,
    active_runs: BTreeMap<ConversationId, ActiveRun>,
    trusted_prefixes: BTreeSet<TrustedPrefix>,
}

impl Snapshot {
    fn new() -> Self {
        Self {
            version: STATE_FILE_VERSION,
            ..Self::default()
        }
    }

    fn update_conversation(
        &mut self,
        id: &ConversationId,
        update: impl FnOnce(&mut ConversationState),
    ) {
        if let Some(state) = self.conversations.get_mut(id) {
            update(state);
            state.updated_at = now_unix();
        }
    }
}

/// Both stores keep a [`Snapshot`] behind a mutex; they differ only in
/// whether mutations are persisted.
pub trait SnapshotBacked: Send + Sync {
    fn snapshot(&self) -> &Mutex<Snapshot>;

    fn persist(&self, _snapshot: &Snapshot) -> Result<(), StoreError> {
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> Result<R, StoreError> {
        let guard = self.snapshot().lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&guard))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> Result<R, StoreError> {
        let mut guard = self.snapshot().lock().map_err(|_| StoreError::Poisoned)?;
        let out = f(&mut guard);
        self.persist(&guard)?;
        Ok(out)
    }
}

impl<T: SnapshotBacked> StateStore for T {
    fn ensure_conversation(
        &self,
        id: &ConversationId,
        defaults: &ConversationDefaults,
    ) -> Result<ConversationState, StoreError> {
        if let Some(existing) = self.read(|s| s.conversations.get(id).cloned())? {
            return Ok(existing);
        }
        self.write(|s| {
            s.conversations
                .entry(id.clone())
                .or_insert_with(|| ConversationState::new(id, defaults))
                .clone()
        })
    }

    fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationState>, StoreError> {
        self.read(|s| s.conversations.get(id).cloned())
    }

    fn set_machine(&self, id: &ConversationId, machine: &str, workdir: &str) -> Result<(), StoreError> {
        self.write(|s| {
            s.update_conversation(id, |state| {
                state.machine = machine.to_string();
                state.workdir = workdir.to_string();
                state.clear_thread_fields();
            })
        })
    }

    fn set_thread(
        &self,
        id: &ConversationId,
        thread_id: &ThreadId,
        title: Option<&str>,
    ) -> Result<(), StoreError> {
        self.write(|s| {
            s.update_conversation(id, |state| {
                state.thread_id = Some(thread_id.clone());
                if let Some(title) = title {
                    state.thread_title = Some(title.to_string());
                }
            })
        })
    }

    fn clear_thread(&self, id: &ConversationId) -> Result<(), StoreError> {
        self.write(|s| s.update_conversation(id, ConversationState::clear_thread_fields))
    }

    fn set_approval_policy(&self, id: &ConversationId, policy: &str) -> Result<(), StoreError> {
        self.write(|s| {
            s.update_conversation(id, |state| state.approval_policy = policy.to_string())
        })
    }

    fn update_token_telemetry(
        &self,
        id: &ConversationId,
        usage: &TokenUsageSnapshot,
    ) -> Result<(), StoreError> {
        self.write(|s| s.update_conversation(id, |state| state.apply_usage(usage)))
    }

    fn get_active_run(&self, id: &ConversationId) -> Result<Option<ActiveRun>, StoreError> {
        self.read(|s| s.active_runs.get(id).cloned())
    }

    fn set_active_run(
        &self,
        id: &ConversationId,
        run_id: &RunId,
        status: RunStatus,
        pending: Option<PendingAction>,
    ) -> Result<(), StoreError> {
        debug!(conversation = %id, %run_id, status = status.as_str(), "set active run");
        self.write(|s| {
            s.active_runs.insert(
                id.clone(),
                ActiveRun {
                    run_id: run_id.clone(),
                    status,
                    pending,
                    updated_at: now_unix(),
                },
            );
        })
    }

    fn clear_active_run(&self, id: &ConversationId) -> Result<(), StoreError> {
        debug!(conversation = %id, "clear active run");
        self.write(|s| {
            s.active_runs.remove(id);
        })
    }

    fn list_trusted_prefixes(
        &self,
        machine: &str,
        thread: &str,
    ) -> Result<BTreeSet<String>, StoreError> {
        self.read(|s| {
            s.trusted_prefixes
                .iter()
                .filter(|row| row.machine == machine && row.thread == thread)
                .map(|row| row.prefix.clone())
                .collect()
        })
    }

    fn add_trusted_prefix(&self, machine: &str, thread: &str, prefix: &str) -> Result<bool, StoreError> {
        self.write(|s| {
            s.trusted_prefixes.insert(TrustedPrefix {
                machine: machine.to_string(),
                thread: thread.to_string(),
                prefix: prefix.to_string(),
            })
        })
    }
}

/// Process-local store; everything is lost on exit.
#[derive(Debug)]
pub struct MemoryStore {
    snapshot: Mutex<Snapshot>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(Snapshot::new()),
        }
    }
}

impl SnapshotBacked for MemoryStore {
    fn snapshot(&self) -> &Mutex<Snapshot> {
        &self.snapshot
    }
}

/// JSON-file store. Every mutation rewrites the whole file atomically.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl FileStore {
    /// Open `path`, creating parent directories; a missing file starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let snapshot = match fs::read_to_string(&path) {
            Ok(raw) => {
                let snapshot: Snapshot = serde_json::from_str(&raw)?;
                if snapshot.version != STATE_FILE_VERSION {
                    return Err(StoreError::UnsupportedVersion(snapshot.version));
                }
                snapshot
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Snapshot::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotBacked for FileStore {
    fn snapshot(&self) -> &Mutex<Snapshot> {
        &self.snapshot
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        // Write a sibling temp file first so a crash never leaves a torn file.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
