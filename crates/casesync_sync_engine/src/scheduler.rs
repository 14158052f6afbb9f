//! Background scheduling of sync cycles and attachment work.
//!
//! Two tokio tasks own the timers. Callers talk to them through
//! [`SchedulerHandle`] over `mpsc` queues; blocking engine calls run on
//! the blocking pool.

use crate::attachments::{AttachmentManager, SweepReport, Transition};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::state::{SyncEngine, SyncOutcome};
use casesync_model::DocumentState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

const QUEUE_DEPTH: usize = 64;

/// A change notification for a remote row.
///
/// Treated as a trigger only; the payload is never applied directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Remote table name.
    pub table: String,
    /// `INSERT`, `UPDATE` or `DELETE`.
    pub event_type: String,
    /// The changed row as delivered.
    #[serde(default)]
    pub record: serde_json::Value,
}

/// Commands for the sync task.
#[derive(Debug)]
pub enum SyncCommand {
    /// The caller edited the snapshot.
    LocalChanged,
    /// Another client changed remote data.
    RemoteChanged(ChangeEvent),
    /// Run a full sync now.
    SyncNow,
    /// Authentication finished resolving.
    AuthResolved,
    /// Connectivity came back.
    Reconnected,
    /// Stop the task.
    Shutdown,
}

enum AttachmentCommand {
    Fetch(String, oneshot::Sender<SyncResult<Option<Transition>>>),
    Sweep,
    Shutdown,
}

/// Builder for the background tasks.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    auth_pending: bool,
}

impl Scheduler {
    /// Creates a scheduler over `engine`.
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            auth_pending: false,
        }
    }

    /// Holds automatic syncs back until [`SchedulerHandle::auth_resolved`].
    #[must_use]
    pub fn with_auth_pending(mut self, pending: bool) -> Self {
        self.auth_pending = pending;
        self
    }

    /// Spawns the tasks on the current tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let (sync_tx, sync_rx) = mpsc::channel(QUEUE_DEPTH);
        let (attachment_tx, attachment_rx) = mpsc::channel(QUEUE_DEPTH);

        let sync_task = tokio::spawn(sync_loop(
            Arc::clone(&self.engine),
            sync_rx,
            attachment_tx.downgrade(),
            self.auth_pending,
        ));
        let attachment_task = tokio::spawn(attachment_loop(
            Arc::clone(self.engine.attachments()),
            self.engine.config().clone(),
            attachment_rx,
            sync_tx.downgrade(),
        ));

        SchedulerHandle {
            sync_tx,
            attachment_tx,
            tasks: vec![sync_task, attachment_task],
        }
    }
}

/// Handle to the running background tasks.
pub struct SchedulerHandle {
    sync_tx: mpsc::Sender<SyncCommand>,
    attachment_tx: mpsc::Sender<AttachmentCommand>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Sends a raw command to the sync task.
    pub async fn send(&self, command: SyncCommand) -> SyncResult<()> {
        self.sync_tx
            .send(command)
            .await
            .map_err(|_| SyncError::SchedulerStopped)
    }

    /// Reports a local edit; an automatic sync follows after the debounce.
    pub async fn local_changed(&self) -> SyncResult<()> {
        self.send(SyncCommand::LocalChanged).await
    }

    /// Reports a remote change notification.
    pub async fn remote_changed(&self, event: ChangeEvent) -> SyncResult<()> {
        self.send(SyncCommand::RemoteChanged(event)).await
    }

    /// Requests a full sync now.
    pub async fn sync_now(&self) -> SyncResult<()> {
        self.send(SyncCommand::SyncNow).await
    }

    /// Releases automatic syncs held back at start.
    pub async fn auth_resolved(&self) -> SyncResult<()> {
        self.send(SyncCommand::AuthResolved).await
    }

    /// Reports restored connectivity.
    pub async fn reconnected(&self) -> SyncResult<()> {
        self.send(SyncCommand::Reconnected).await
    }

    /// Downloads one document now, queued behind any running transfer.
    pub async fn fetch_document(&self, id: impl Into<String>) -> SyncResult<Option<Transition>> {
        let (tx, rx) = oneshot::channel();
        self.attachment_tx
            .send(AttachmentCommand::Fetch(id.into(), tx))
            .await
            .map_err(|_| SyncError::SchedulerStopped)?;
        rx.await.map_err(|_| SyncError::SchedulerStopped)?
    }

    /// Requests a retention sweep.
    pub async fn sweep(&self) -> SyncResult<()> {
        self.attachment_tx
            .send(AttachmentCommand::Sweep)
            .await
            .map_err(|_| SyncError::SchedulerStopped)
    }

    /// Stops both tasks and waits for them. Work in flight completes first.
    pub async fn shutdown(self) {
        let _ = self.sync_tx.send(SyncCommand::Shutdown).await;
        let _ = self.attachment_tx.send(AttachmentCommand::Shutdown).await;
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        tracing::debug!("scheduler stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn blocking<S, T, F>(subject: &Arc<S>, f: F) -> SyncResult<T>
where
    S: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> SyncResult<T> + Send + 'static,
{
    let subject = Arc::clone(subject);
    tokio::task::spawn_blocking(move || f(&subject))
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "blocking task failed");
            SyncError::SchedulerStopped
        })?
}

fn auto_sync_allowed(engine: &SyncEngine, auth_pending: bool) -> bool {
    if auth_pending || !engine.state().accepts_auto_trigger() {
        return false;
    }
    match engine.settings() {
        Ok(settings) => settings.auto_sync,
        Err(e) => {
            tracing::warn!(error = %e, "could not read settings; auto-sync off");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Auto,
    Manual,
    Refresh,
}

impl Cycle {
    fn is_full(self) -> bool {
        self != Cycle::Refresh
    }

    fn as_str(self) -> &'static str {
        match self {
            Cycle::Auto => "auto",
            Cycle::Manual => "manual",
            Cycle::Refresh => "refresh",
        }
    }
}

struct Running {
    cycle: Cycle,
    task: JoinHandle<SyncResult<SyncOutcome>>,
}

fn spawn_cycle(engine: &Arc<SyncEngine>, cycle: Cycle) -> Running {
    let engine = Arc::clone(engine);
    let task = tokio::task::spawn_blocking(move || match cycle {
        Cycle::Auto => engine.sync(),
        Cycle::Manual => engine.sync_with_retry(),
        Cycle::Refresh => engine.fetch_and_refresh(),
    });
    tracing::debug!(cycle = cycle.as_str(), "cycle started");
    Running { cycle, task }
}

async fn finished(running: &mut Option<Running>) -> (Cycle, SyncResult<SyncOutcome>) {
    match running {
        Some(run) => {
            let result = (&mut run.task).await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "sync task failed");
                Err(SyncError::SchedulerStopped)
            });
            (run.cycle, result)
        }
        None => std::future::pending().await,
    }
}

fn report(cycle: Cycle, result: &SyncResult<SyncOutcome>) {
    let kind = cycle.as_str();
    match result {
        Ok(_) => {}
        Err(SyncError::AlreadySyncing) => tracing::debug!(kind, "sync already running; skipped"),
        Err(e) => tracing::warn!(kind, error = %e, "background sync failed"),
    }
}

async fn sync_loop(
    engine: Arc<SyncEngine>,
    mut commands: mpsc::Receiver<SyncCommand>,
    attachments: mpsc::WeakSender<AttachmentCommand>,
    mut auth_pending: bool,
) {
    let debounce = engine.config().auto_sync_debounce;
    let change_debounce = engine.config().change_debounce;
    let retry = engine.config().retry.clone();
    let mut sync_due: Option<Instant> = None;
    let mut refresh_due: Option<Instant> = None;
    let mut manual_requested = false;
    let mut failures: u32 = 0;
    let mut running: Option<Running> = None;

    loop {
        if manual_requested && running.is_none() {
            manual_requested = false;
            sync_due = None;
            running = Some(spawn_cycle(&engine, Cycle::Manual));
        }

        tokio::select! {
            command = commands.recv() => match command {
                None | Some(SyncCommand::Shutdown) => break,
                Some(SyncCommand::LocalChanged) => {
                    sync_due = Some(Instant::now() + debounce);
                }
                Some(SyncCommand::RemoteChanged(event)) => {
                    if running.as_ref().is_some_and(|run| run.cycle.is_full()) {
                        tracing::debug!(table = %event.table, "remote change during full sync; ignored");
                    } else {
                        tracing::debug!(table = %event.table, event = %event.event_type, "remote change");
                        refresh_due.get_or_insert(Instant::now() + change_debounce);
                    }
                }
                Some(SyncCommand::SyncNow) => {
                    manual_requested = true;
                }
                Some(SyncCommand::AuthResolved) => {
                    auth_pending = false;
                    if engine.snapshot().is_dirty() {
                        sync_due = Some(Instant::now() + debounce);
                    }
                }
                Some(SyncCommand::Reconnected) => {
                    if let Some(tx) = attachments.upgrade() {
                        let _ = tx.send(AttachmentCommand::Sweep).await;
                    }
                    if engine.snapshot().is_dirty() {
                        sync_due.get_or_insert(Instant::now() + debounce);
                    }
                }
            },
            (cycle, result) = finished(&mut running) => {
                running = None;
                report(cycle, &result);
                if !cycle.is_full() {
                    continue;
                }
                // a full cycle covers every change announced before it finished
                refresh_due = None;
                let dirty = engine.snapshot().is_dirty();
                match &result {
                    Ok(_) => {
                        failures = 0;
                        // a stale publish leaves the snapshot dirty
                        if dirty {
                            sync_due.get_or_insert(Instant::now() + debounce);
                        }
                    }
                    Err(e) if e.is_retryable() && dirty => {
                        failures = failures.saturating_add(1);
                        let delay = retry.delay_for_attempt(failures).max(debounce);
                        tracing::debug!(failures, ?delay, "auto-sync retry scheduled");
                        sync_due.get_or_insert(Instant::now() + delay);
                    }
                    Err(_) => {}
                }
            }
            () = sleep_until(sync_due), if running.is_none() => {
                sync_due = None;
                if !auto_sync_allowed(&engine, auth_pending) {
                    tracing::debug!(state = %engine.state(), "auto-sync suppressed");
                    continue;
                }
                running = Some(spawn_cycle(&engine, Cycle::Auto));
            }
            () = sleep_until(refresh_due), if running.is_none() => {
                refresh_due = None;
                if auth_pending || !engine.state().accepts_auto_trigger() {
                    continue;
                }
                running = Some(spawn_cycle(&engine, Cycle::Refresh));
            }
        }
    }

    if let Some(run) = running {
        let result = run.task.await.unwrap_or(Err(SyncError::SchedulerStopped));
        report(run.cycle, &result);
    }
    tracing::debug!("sync task stopped");
}

fn log_step<T: std::fmt::Debug>(kind: &str, result: &SyncResult<Option<T>>) {
    match result {
        Ok(Some(done)) => tracing::debug!(kind, ?done, "attachment step"),
        Ok(None) => {}
        Err(e) => tracing::warn!(kind, error = %e, "attachment step failed"),
    }
}

fn log_sweep(result: SyncResult<SweepReport>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "retention sweep failed");
    }
}

async fn attachment_loop(
    manager: Arc<AttachmentManager>,
    config: SyncConfig,
    mut commands: mpsc::Receiver<AttachmentCommand>,
    sync: mpsc::WeakSender<SyncCommand>,
) {
    if let Err(e) = blocking(&manager, AttachmentManager::recover_interrupted).await {
        tracing::warn!(error = %e, "could not reset interrupted downloads");
    }

    let mut upload = time::interval(config.upload_interval);
    let mut download = time::interval(config.download_interval);
    let mut sweep = time::interval(config.sweep_interval);
    for timer in [&mut upload, &mut download, &mut sweep] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(AttachmentCommand::Shutdown) => break,
                Some(AttachmentCommand::Fetch(id, reply)) => {
                    let result = blocking(&manager, move |m| m.fetch_now(&id)).await;
                    let _ = reply.send(result);
                }
                Some(AttachmentCommand::Sweep) => {
                    log_sweep(blocking(&manager, AttachmentManager::retention_sweep).await);
                }
            },
            _ = upload.tick() => {
                let result = blocking(&manager, AttachmentManager::upload_next).await;
                log_step("upload", &result);
                if matches!(&result, Ok(Some(t)) if t.to == DocumentState::Synced) {
                    // the document's metadata can be pushed now
                    if let Some(tx) = sync.upgrade() {
                        let _ = tx.send(SyncCommand::LocalChanged).await;
                    }
                }
            }
            _ = download.tick() => {
                log_step("download", &blocking(&manager, AttachmentManager::download_next).await);
            }
            _ = sweep.tick() => {
                log_sweep(blocking(&manager, AttachmentManager::retention_sweep).await);
            }
        }
    }
    tracing::debug!("attachment task stopped");
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("auth_pending", &self.auth_pending)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}
