//! The session task: one dispatcher for every event source of a sync session.
//!
//! Transport messages, document change batches, table hook events, control
//! commands and the session timer all arrive in the same `select!` loop, so
//! handlers never run concurrently with each other.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::bulk_load::{bulk_load, prune_deleted};
use super::reconcile::reconcile_batch;
use super::{BusState, SyncNotification, SyncOptions};
use crate::db::{TableChange, TableHook, TableStore, WriteSource};
use crate::document::{ChangeBatch, Origin, ReplicatedStore};
use crate::models::{SyncChannel, SyncStatus, SyncUser, TableKey};
use crate::provider::{ProviderEvent, SyncProvider};
use crate::transport::{Connector, ProtocolMessage};

#[derive(Debug)]
pub(crate) enum Command {
    Reconnect,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Handshake,
    InitialSync,
    Reconnect,
}

pub(crate) struct Session {
    tables: TableStore,
    store: Arc<Mutex<ReplicatedStore>>,
    connector: Arc<dyn Connector>,
    options: SyncOptions,
    endpoint: String,
    channel: SyncChannel,
    user: SyncUser,
    notifications: mpsc::UnboundedSender<SyncNotification>,
    state: watch::Sender<BusState>,
    provider: Option<SyncProvider>,
    hooks: broadcast::Receiver<TableChange>,
    hooks_open: bool,
    batches_tx: mpsc::UnboundedSender<ChangeBatch>,
    batches_rx: mpsc::UnboundedReceiver<ChangeBatch>,
    timer: Option<(Timer, Instant)>,
    attempt: u32,
    observing: bool,
    bulk_loaded: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tables: TableStore,
        store: Arc<Mutex<ReplicatedStore>>,
        connector: Arc<dyn Connector>,
        options: SyncOptions,
        endpoint: String,
        channel: SyncChannel,
        user: SyncUser,
        notifications: mpsc::UnboundedSender<SyncNotification>,
        state: watch::Sender<BusState>,
    ) -> Self {
        let hooks = tables.subscribe();
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();
        Self {
            tables,
            store,
            connector,
            options,
            endpoint,
            channel,
            user,
            notifications,
            state,
            provider: None,
            hooks,
            hooks_open: true,
            batches_tx,
            batches_rx,
            timer: None,
            attempt: 0,
            observing: false,
            bulk_loaded: false,
        }
    }

    /// Opens a transport session. On failure a reconnect is scheduled.
    pub(crate) async fn connect(&mut self) {
        self.set_state(BusState::Connecting);

        match SyncProvider::connect(
            self.connector.as_ref(),
            &self.endpoint,
            &self.channel,
            self.user.clone(),
        )
        .await
        {
            Ok(provider) => {
                info!(endpoint = %self.endpoint, peer = %provider.peer_id(), "Connecting to relay");
                self.notify(SyncNotification::Awareness(provider.awareness().records()));
                self.provider = Some(provider);
                self.arm(Timer::Handshake, self.options.handshake_timeout);
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Failed to reach relay");
                self.fail("connect failed");
            }
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.timer.map(|(_, at)| at);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Reconnect) => self.reconnect_now().await,
                    Some(Command::Stop) | None => break,
                },
                msg = next_message(&mut self.provider) => match msg {
                    Some(msg) => self.on_message(msg).await,
                    None => self.on_link_closed().await,
                },
                hook = self.hooks.recv(), if self.hooks_open => self.on_hook(hook).await,
                Some(batch) = self.batches_rx.recv() => self.on_batch(batch).await,
                _ = wait_until(deadline) => self.on_timer().await,
            }
        }

        self.shutdown();
    }

    async fn on_message(&mut self, msg: ProtocolMessage) {
        let events = {
            let Some(provider) = self.provider.as_mut() else {
                return;
            };
            let mut store = self.store.lock().await;
            provider.handle(msg, &mut store)
        };

        for event in events {
            self.on_provider_event(event).await;
        }
    }

    async fn on_link_closed(&mut self) {
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        for event in provider.handle_closed() {
            self.on_provider_event(event).await;
        }
    }

    async fn on_provider_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::Status { connected: true } => self.on_connected().await,
            ProviderEvent::Status { connected: false } => self.fail("relay link closed"),
            ProviderEvent::Synced { synced: true } => self.on_synced().await,
            ProviderEvent::Synced { synced: false } => self.fail("sync failed"),
            ProviderEvent::AwarenessChanged(records) => {
                self.notify(SyncNotification::Awareness(records));
            }
        }
    }

    async fn on_connected(&mut self) {
        self.set_state(BusState::Connected);

        if !self.observing {
            let mut store = self.store.lock().await;
            for table in TableKey::ALL {
                store.observe(table, self.batches_tx.clone());
            }
            self.observing = true;
        }

        self.notify(SyncNotification::Status(SyncStatus::Ready));
        self.arm(Timer::InitialSync, self.options.sync_timeout);
    }

    async fn on_synced(&mut self) {
        self.timer = None;
        self.set_state(BusState::Syncing);
        self.notify(SyncNotification::Status(SyncStatus::Syncing));

        // Apply what peers sent during the initial exchange first, so stale
        // local rows cannot overwrite newer merged values.
        while let Ok(batch) = self.batches_rx.try_recv() {
            self.reconcile(batch).await;
        }

        if !self.bulk_loaded {
            self.bulk_loaded = self.load_tables().await;
        }

        self.broadcast_all().await;
        self.attempt = 0;
        self.set_state(BusState::Synced);
        self.notify(SyncNotification::Status(SyncStatus::Synced));
    }

    /// Returns `false` when the load failed and should be retried.
    async fn load_tables(&mut self) -> bool {
        match bulk_load(&self.tables, &self.store, self.options.bulk_chunk_size).await {
            Ok(rows) => {
                info!(rows, "Local tables loaded into replicated store");
                true
            }
            Err(e) => {
                warn!(error = %e, "Bulk load failed");
                false
            }
        }
    }

    /// Brings the store back in line with the tables after hook events were lost.
    async fn recover_from_lag(&mut self) {
        // Merged remote values win over stale local rows, as in the initial sync
        while let Ok(batch) = self.batches_rx.try_recv() {
            self.reconcile(batch).await;
        }

        self.bulk_loaded = self.load_tables().await;
        match prune_deleted(&self.tables, &self.store).await {
            Ok(0) => {}
            Ok(rows) => info!(rows, "Local deletes restored after hook lag"),
            Err(e) => warn!(error = %e, "Failed to restore local deletes"),
        }
        self.broadcast_all().await;
    }

    async fn on_hook(&mut self, hook: Result<TableChange, broadcast::error::RecvError>) {
        let change = match hook {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Table hook events dropped, reloading tables");
                if self.bulk_loaded {
                    self.recover_from_lag().await;
                }
                return;
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.hooks_open = false;
                return;
            }
        };

        if change.source == WriteSource::Sync {
            return;
        }

        let mut store = self.store.lock().await;
        let result = match &change.hook {
            TableHook::Creating(row) | TableHook::Replacing(row) => {
                store.set(change.table, &change.id, row, Origin::LocalUserWrite)
            }
            TableHook::Updating { changes, .. } if store.contains(change.table, &change.id) => {
                store.merge(change.table, &change.id, changes, Origin::LocalUserWrite)
            }
            TableHook::Updating { row, .. } => {
                store.set(change.table, &change.id, row, Origin::LocalUserWrite)
            }
            TableHook::Deleting => store.delete(change.table, &change.id, Origin::LocalUserWrite),
        };

        match result {
            Ok(true) => {
                debug!(table = %change.table, id = %change.id, "Local write mirrored");
                if let Some(provider) = self.provider.as_mut() {
                    provider.broadcast_changes(&mut store, change.table);
                }
            }
            Ok(false) => {}
            Err(e) => warn!(table = %change.table, id = %change.id, error = %e, "Failed to mirror local write"),
        }
    }

    async fn on_batch(&mut self, batch: ChangeBatch) {
        let bracket = self.current_state() == BusState::Synced && !batch.origin.is_local();
        if bracket {
            self.set_state(BusState::Syncing);
            self.notify(SyncNotification::Status(SyncStatus::Syncing));
        }

        self.reconcile(batch).await;

        if bracket {
            self.set_state(BusState::Synced);
            self.notify(SyncNotification::Status(SyncStatus::Synced));
        }
    }

    async fn reconcile(&mut self, batch: ChangeBatch) {
        if let Some(event) = reconcile_batch(&self.tables, &self.store, &batch).await {
            debug!(table = %event.table_key, rows = event.changes.len(), "Remote changes applied");
            self.notify(SyncNotification::Event(event));
        }
    }

    async fn on_timer(&mut self) {
        let Some((timer, _)) = self.timer.take() else {
            return;
        };

        match timer {
            Timer::Handshake => self.fail("handshake timed out"),
            Timer::InitialSync => self.fail("initial sync timed out"),
            Timer::Reconnect => self.connect().await,
        }
    }

    async fn reconnect_now(&mut self) {
        info!("Reconnect requested");
        if let Some(provider) = self.provider.take() {
            provider.destroy();
        }
        self.attempt = 0;
        self.connect().await;
    }

    async fn broadcast_all(&mut self) {
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        let mut store = self.store.lock().await;
        for table in TableKey::ALL {
            provider.broadcast_changes(&mut store, table);
        }
    }

    /// Tears down the transport and schedules the next attempt.
    fn fail(&mut self, reason: &str) {
        if let Some(provider) = self.provider.take() {
            provider.destroy();
        }
        self.set_state(BusState::Disconnected);

        let delay = self.options.reconnect.delay(self.attempt);
        warn!(reason, attempt = self.attempt, delay_ms = delay.as_millis() as u64, "Sync interrupted, reconnecting");
        self.attempt = self.attempt.saturating_add(1);
        self.arm(Timer::Reconnect, delay);
    }

    fn shutdown(&mut self) {
        if let Some(provider) = self.provider.take() {
            provider.destroy();
        }
        self.timer = None;
        // The next session on this bus must be able to take over the observers
        self.batches_rx.close();
        self.set_state(BusState::Idle);
        info!("Sync session stopped");
    }

    fn arm(&mut self, timer: Timer, after: Duration) {
        self.timer = Some((timer, Instant::now() + after));
    }

    fn current_state(&self) -> BusState {
        *self.state.borrow()
    }

    fn set_state(&self, state: BusState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Bus state changed");
        }
    }

    fn notify(&self, notification: SyncNotification) {
        // Ignore send errors (handle dropped)
        let _ = self.notifications.send(notification);
    }
}

async fn next_message(provider: &mut Option<SyncProvider>) -> Option<ProtocolMessage> {
    match provider {
        Some(provider) => provider.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
