//! Background sync orchestrator.
//!
//! A single actor task owns all orchestration state and is driven by one
//! event loop over control commands, pass terminations, the bookmark timer
//! and the wake-up timer. Callers talk to it through a
//! [`BackgroundSyncHandle`].
//!
//! The actor is either `Sleeping` or `Streaming`. While streaming, one pass
//! task runs the reconciler and publishes its progress; every quiet period
//! the actor persists the bookmark candidate of that progress. While
//! sleeping, bookmark ticks and terminations of abandoned passes are
//! discarded.

use std::sync::Arc;

use index_sync_types::{BackgroundSyncSettings, Bookmark};
use index_sync_updater::RepairSink;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use crate::pass::{Pass, PassOutcome, StreamTerminated};
use crate::progress::ProgressReport;
use crate::reconciler::Reconciler;
use crate::source::{BookmarkStore, MetadataSource};
use crate::status::{EventHistory, EventKind, StatusEvent, SyncState, SyncStatus};

/// External systems background sync depends on.
#[derive(Clone)]
pub struct SyncCollaborators {
    /// Authoritative store scan
    pub persisted: Arc<dyn MetadataSource>,
    /// Search index scan
    pub indexed: Arc<dyn MetadataSource>,
    pub bookmarks: Arc<dyn BookmarkStore>,
    pub repair: Arc<dyn RepairSink>,
}

enum Command {
    Start,
    Stop,
    Status(oneshot::Sender<SyncStatus>),
}

/// Control surface of a running [`BackgroundSync`] actor.
#[derive(Clone)]
pub struct BackgroundSyncHandle {
    commands: mpsc::Sender<Command>,
}

impl BackgroundSyncHandle {
    /// Enable automatic passes and start one now unless one is running.
    pub async fn start(&self) -> Result<(), ReconcileError> {
        self.send(Command::Start).await
    }

    /// Abort the running pass, if any, and disable automatic passes.
    pub async fn stop(&self) -> Result<(), ReconcileError> {
        self.send(Command::Stop).await
    }

    pub async fn status(&self) -> Result<SyncStatus, ReconcileError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Status(reply)).await?;
        response.await.map_err(|_| ReconcileError::Stopped)
    }

    async fn send(&self, command: Command) -> Result<(), ReconcileError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ReconcileError::Stopped)
    }
}

enum State {
    Sleeping,
    Streaming {
        pass_id: u64,
        kill: CancellationToken,
        progress: watch::Receiver<ProgressReport>,
    },
}

/// Background reconciliation actor.
pub struct BackgroundSync {
    settings: BackgroundSyncSettings,
    collaborators: SyncCollaborators,
    reconciler: Reconciler,
    state: State,
    enabled: bool,
    wake_at: Option<Instant>,
    bookmark: Bookmark,
    stall_ticks: u32,
    pass_id: u64,
    passes_completed: u64,
    history: EventHistory,
    terminated_tx: mpsc::Sender<StreamTerminated>,
    shutdown: CancellationToken,
}

impl BackgroundSync {
    /// Spawn the actor. It runs until `shutdown` fires or every handle is
    /// dropped; a running pass is aborted either way.
    pub fn spawn(
        settings: BackgroundSyncSettings,
        collaborators: SyncCollaborators,
        shutdown: CancellationToken,
    ) -> (BackgroundSyncHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (terminated_tx, terminated_rx) = mpsc::channel(4);

        let actor = Self {
            reconciler: Reconciler::new(settings.tolerance_window()),
            history: EventHistory::new(settings.keep_events),
            enabled: settings.enabled,
            settings,
            collaborators,
            state: State::Sleeping,
            wake_at: None,
            bookmark: Bookmark::empty(),
            stall_ticks: 0,
            pass_id: 0,
            passes_completed: 0,
            terminated_tx,
            shutdown,
        };

        let task = tokio::spawn(actor.run(commands_rx, terminated_rx));
        (
            BackgroundSyncHandle {
                commands: commands_tx,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut terminated: mpsc::Receiver<StreamTerminated>,
    ) {
        self.bookmark = self.load_bookmark().await;
        self.schedule_wake();
        info!(
            enabled = self.enabled,
            bookmark = %self.bookmark.last_key,
            "Background sync started"
        );

        let period = self.settings.quiet_period();
        let mut bookmark_ticker = tokio::time::interval_at(Instant::now() + period, period);
        bookmark_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();

        loop {
            let wake_at = self.wake_at;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(message) = terminated.recv() => self.on_terminated(message).await,
                _ = bookmark_ticker.tick() => self.on_bookmark_tick().await,
                _ = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {
                    self.start_pass().await;
                }
            }
        }

        self.abandon_pass();
        info!("Background sync shut down");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start => {
                self.enabled = true;
                self.start_pass().await;
            }
            Command::Stop => {
                self.enabled = false;
                self.wake_at = None;
                if self.abandon_pass() {
                    self.history
                        .push(StatusEvent::info(EventKind::Stopped, "Stopped while streaming"));
                }
                info!("Background sync stopped");
            }
            Command::Status(reply) => {
                // the caller may have given up waiting
                let _ = reply.send(self.status());
            }
        }
    }

    async fn start_pass(&mut self) {
        self.wake_at = None;
        if matches!(self.state, State::Streaming { .. }) {
            debug!("Pass already running");
            return;
        }

        self.bookmark = self.load_bookmark().await;
        self.pass_id += 1;
        self.stall_ticks = 0;

        let kill = self.shutdown.child_token();
        let (progress_tx, progress_rx) = watch::channel(ProgressReport::new());
        let pass = Pass {
            id: self.pass_id,
            start_after: self.bookmark.start_after(),
            persisted: Arc::clone(&self.collaborators.persisted),
            indexed: Arc::clone(&self.collaborators.indexed),
            repair: Arc::clone(&self.collaborators.repair),
            reconciler: self.reconciler.clone(),
            backoff: self.settings.backoff.clone(),
            kill: kill.clone(),
            progress: progress_tx,
            terminated: self.terminated_tx.clone(),
        };

        info!(pass = self.pass_id, start_after = %self.bookmark.last_key, "Starting reconciliation pass");
        self.history.push(StatusEvent::info(
            EventKind::PassStarted,
            format!("Pass {} started after '{}'", self.pass_id, self.bookmark.last_key),
        ));
        tokio::spawn(pass.run());

        self.state = State::Streaming {
            pass_id: self.pass_id,
            kill,
            progress: progress_rx,
        };
    }

    async fn on_terminated(&mut self, message: StreamTerminated) {
        match &self.state {
            State::Streaming { pass_id, .. } if *pass_id == message.pass_id => {}
            _ => {
                debug!(pass = message.pass_id, "Discarding termination of abandoned pass");
                return;
            }
        }
        self.state = State::Sleeping;
        self.stall_ticks = 0;

        match message.outcome {
            PassOutcome::Completed => {
                self.passes_completed += 1;
                info!(
                    pass = message.pass_id,
                    inconsistencies = message.inconsistencies,
                    "Reconciliation pass completed"
                );
                self.history.push(StatusEvent::info(
                    EventKind::StreamTerminated,
                    format!(
                        "Pass {} completed with {} inconsistencies",
                        message.pass_id, message.inconsistencies
                    ),
                ));
                // next pass sweeps from the beginning
                self.persist_bookmark(Bookmark::empty()).await;
            }
            PassOutcome::Failed(reason) => {
                error!(pass = message.pass_id, error = %reason, "Reconciliation pass failed");
                self.history.push(StatusEvent::error(
                    EventKind::StreamTerminated,
                    format!("Pass {} failed: {reason}", message.pass_id),
                ));
            }
            PassOutcome::Cancelled => {
                info!(pass = message.pass_id, "Reconciliation pass cancelled");
                self.history.push(StatusEvent::info(
                    EventKind::StreamTerminated,
                    format!("Pass {} cancelled", message.pass_id),
                ));
            }
        }

        self.schedule_wake();
    }

    async fn on_bookmark_tick(&mut self) {
        let report = match &self.state {
            State::Streaming { progress, .. } => progress.borrow().clone(),
            State::Sleeping => {
                debug!("Discarding bookmark tick while sleeping");
                return;
            }
        };

        match report.bookmark_candidate() {
            Some(candidate) if candidate > self.bookmark.last_key => {
                self.stall_ticks = 0;
                self.persist_bookmark(Bookmark::new(candidate)).await;
            }
            candidate => {
                self.stall_ticks += 1;
                debug!(
                    candidate = ?candidate,
                    bookmark = %self.bookmark.last_key,
                    ticks = self.stall_ticks,
                    "Bookmark did not advance"
                );
                if self.stall_ticks == self.settings.bookmark_stall_ticks {
                    warn!(
                        bookmark = %self.bookmark.last_key,
                        persisted = %report.persisted,
                        indexed = %report.indexed,
                        ticks = self.stall_ticks,
                        "Bookmark stalled"
                    );
                    self.history.push(StatusEvent::warn(
                        EventKind::BookmarkStalled,
                        format!(
                            "Bookmark stuck at '{}' for {} ticks (persisted '{}', indexed '{}')",
                            self.bookmark.last_key, self.stall_ticks, report.persisted, report.indexed
                        ),
                    ));
                }
            }
        }
    }

    async fn persist_bookmark(&mut self, bookmark: Bookmark) {
        match self.collaborators.bookmarks.set(&bookmark).await {
            Ok(()) => {
                debug!(bookmark = %bookmark.last_key, "Bookmark persisted");
                self.bookmark = bookmark;
            }
            Err(e) => {
                warn!(bookmark = %bookmark.last_key, error = %e, "Failed to persist bookmark");
                self.history.push(StatusEvent::warn(
                    EventKind::BookmarkWriteFailed,
                    format!("Failed to persist bookmark '{}': {e}", bookmark.last_key),
                ));
            }
        }
    }

    async fn load_bookmark(&self) -> Bookmark {
        match self.collaborators.bookmarks.get().await {
            Ok(bookmark) => bookmark.unwrap_or_else(Bookmark::empty),
            Err(e) => {
                warn!(error = %e, "Failed to read bookmark, starting from the beginning");
                Bookmark::empty()
            }
        }
    }

    /// Cancel the running pass without persisting anything. Returns whether
    /// a pass was running.
    fn abandon_pass(&mut self) -> bool {
        match std::mem::replace(&mut self.state, State::Sleeping) {
            State::Streaming { pass_id, kill, .. } => {
                debug!(pass = pass_id, "Abandoning reconciliation pass");
                kill.cancel();
                self.stall_ticks = 0;
                true
            }
            State::Sleeping => false,
        }
    }

    fn schedule_wake(&mut self) {
        self.wake_at = self
            .enabled
            .then(|| Instant::now() + self.settings.quiet_period());
    }

    fn status(&self) -> SyncStatus {
        let (state, report) = match &self.state {
            State::Sleeping => (SyncState::Sleeping, ProgressReport::new()),
            State::Streaming { progress, .. } => (SyncState::Streaming, progress.borrow().clone()),
        };
        SyncStatus {
            state,
            enabled: self.enabled,
            bookmark: self.bookmark.clone(),
            progress_persisted: report.persisted,
            progress_indexed: report.indexed,
            inconsistencies: report.inconsistencies,
            passes_completed: self.passes_completed,
            level: self.history.most_severe(),
            events: self.history.events(),
        }
    }
}
