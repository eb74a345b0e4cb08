//! Sync bus: keeps the local tables and the replicated store in step.
//!
//! [`SyncBus::start_data_sync`] spawns one session task per call and hands
//! back a [`SyncHandle`]. The session connects to the relay, loads the local
//! tables into the replicated store once the initial exchange with peers is
//! done, mirrors user writes outward, reconciles merged changes inward, and
//! reconnects with backoff when the transport fails.

mod backoff;
mod bulk_load;
mod reconcile;
mod session;

pub use backoff::ReconnectPolicy;
pub use bulk_load::{bulk_load, prune_deleted, BULK_LOAD_CHUNK_SIZE};
pub use reconcile::reconcile_batch;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::db::TableStore;
use crate::document::ReplicatedStore;
use crate::error::SyncError;
use crate::models::{PresenceRecord, SyncChannel, SyncEvent, SyncStatus, SyncUser};
use crate::transport::Connector;
use session::{Command, Session};

/// Relay used when neither the call nor the configuration names one.
///
/// This is the bundled `chatsync-relay` on its default port, not a public
/// rendezvous service. Deployments set `sync.signaling` to their own relay.
pub const DEFAULT_SIGNALING: &str = "ws://127.0.0.1:4444";

/// Parameters for [`SyncBus::start_data_sync`].
#[derive(Debug, Clone)]
pub struct StartDataSyncParams {
    pub channel: SyncChannel,
    pub user: SyncUser,
    /// Relay URL; falls back to [`SyncOptions::signaling`].
    pub signaling: Option<String>,
}

/// What the session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    Status(SyncStatus),
    Awareness(Vec<PresenceRecord>),
    Event(SyncEvent),
}

/// Lifecycle state of the session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Idle,
    Connecting,
    /// Joined the room, initial exchange with peers not finished.
    Connected,
    /// Bulk load or reconciliation in progress.
    Syncing,
    Synced,
    /// Transport lost; a reconnect is scheduled.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub signaling: String,
    pub reconnect: ReconnectPolicy,
    /// How long to wait for the relay to welcome us.
    pub handshake_timeout: Duration,
    /// How long the initial exchange with peers may take.
    pub sync_timeout: Duration,
    pub bulk_chunk_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            signaling: DEFAULT_SIGNALING.to_string(),
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(30),
            bulk_chunk_size: BULK_LOAD_CHUNK_SIZE,
        }
    }
}

struct ActiveSession {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<BusState>,
}

/// Owns at most one running sync session.
///
/// The replicated store outlives sessions, so a restarted session resumes
/// from the merged state of the previous one.
pub struct SyncBus {
    tables: TableStore,
    connector: Arc<dyn Connector>,
    options: SyncOptions,
    store: Arc<Mutex<ReplicatedStore>>,
    active: Option<ActiveSession>,
}

impl SyncBus {
    pub fn new(tables: TableStore, connector: Arc<dyn Connector>) -> Self {
        Self {
            tables,
            connector,
            options: SyncOptions::default(),
            store: Arc::new(Mutex::new(ReplicatedStore::new())),
            active: None,
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn tables(&self) -> &TableStore {
        &self.tables
    }

    pub fn store(&self) -> Arc<Mutex<ReplicatedStore>> {
        self.store.clone()
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Starts a session, stopping any previous one first.
    ///
    /// Returns once the transport has been constructed; synchronization
    /// continues in the background and is reported through the handle. Only a
    /// missing channel name is an error; transport failures are retried.
    pub async fn start_data_sync(
        &mut self,
        params: StartDataSyncParams,
    ) -> Result<SyncHandle, SyncError> {
        if params.channel.name.trim().is_empty() {
            return Err(SyncError::NotConfigured);
        }

        self.stop_data_sync().await;

        let endpoint = params
            .signaling
            .unwrap_or_else(|| self.options.signaling.clone());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(BusState::Idle);

        let mut session = Session::new(
            self.tables.clone(),
            self.store.clone(),
            self.connector.clone(),
            self.options.clone(),
            endpoint,
            params.channel,
            params.user,
            notification_tx,
            state_tx,
        );
        session.connect().await;
        let task = tokio::spawn(session.run(command_rx));

        self.active = Some(ActiveSession {
            commands: command_tx.clone(),
            state: state_rx.clone(),
        });

        Ok(SyncHandle {
            notifications: notification_rx,
            commands: command_tx,
            state: state_rx,
            task,
        })
    }

    /// Stops the running session, if any, and waits for it to wind down.
    pub async fn stop_data_sync(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        if active.commands.send(Command::Stop).is_ok() {
            // Err means the session task is already gone
            let _ = active.state.wait_for(|state| *state == BusState::Idle).await;
            info!("Previous sync session stopped");
        } else {
            debug!("Previous sync session already finished");
        }
    }
}

/// Handle to a running session.
pub struct SyncHandle {
    notifications: mpsc::UnboundedReceiver<SyncNotification>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<BusState>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Waits for the next notification. `None` once the session has ended.
    pub async fn next_notification(&mut self) -> Option<SyncNotification> {
        self.notifications.recv().await
    }

    pub fn try_next_notification(&mut self) -> Option<SyncNotification> {
        self.notifications.try_recv().ok()
    }

    pub fn state(&self) -> BusState {
        *self.state.borrow()
    }

    /// Waits until the session reaches `target`. Returns `false` if the
    /// session ended first.
    pub async fn wait_for_state(&mut self, target: BusState) -> bool {
        self.state.wait_for(|state| *state == target).await.is_ok()
    }

    /// Drops the current transport and connects again right away.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Stops the session and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.commands.send(Command::Stop);
        let _ = self.task.await;
    }
}
