//! Subscription coordinator: owns the live `users` and `conversations`
//! queries and publishes the resolved [`ChatState`].
//!
//! ```text
//!  users subscription ──► users worker ──────────────┐ send_modify
//!                              │ Reproject            ▼
//!                              ▼                 ┌──────────┐
//!  conversations sub ──► conversations worker ──►│  watch   │──► observers
//!                              ▲                 └──────────┘
//!  refresh_conversations() ────┘ Refresh(ack)
//! ```
//!
//! Each query has exactly one worker task, so snapshots for a query are
//! processed one at a time in arrival order while the two queries proceed
//! independently. Each worker is the only writer of its half of the
//! published state, and every update goes through `watch::Sender::send_modify`
//! so readers only ever see whole snapshots.
//!
//! A users snapshot cascades: after publishing the user lists the users
//! worker asks the conversations worker to re-project its last batch, since
//! participant names and summaries depend on the user set.

use futures_util::future::join_all;
use parley_core::{project_conversations, reconcile_users, Document, DocumentBatch, User};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::state::{ChatState, QueryKind, SubscriptionState};
use crate::store::{
    bounded, Query, RemoteStore, SnapshotEvent, StoreError, Subscription, SubscriptionHandle,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("coordinator is not started")]
    NotStarted,
    #[error("coordinator is already started")]
    AlreadyStarted,
    #[error("{0} worker has stopped")]
    WorkerGone(QueryKind),
}

/// Requests handled by the conversations worker, in order with its
/// snapshots.
enum ConversationCommand {
    /// Re-run the projection over the last batch (user set changed)
    Reproject,
    /// Fetch the query now and publish the result
    Refresh(oneshot::Sender<Result<(), SyncError>>),
}

/// State shared by the coordinator and its workers.
#[derive(Clone)]
struct WorkerContext {
    store: Arc<dyn RemoteStore>,
    actor: User,
    config: SyncConfig,
    published: Arc<watch::Sender<ChatState>>,
    states: Arc<RwLock<HashMap<QueryKind, SubscriptionState>>>,
}

impl WorkerContext {
    async fn set_state(&self, kind: QueryKind, state: SubscriptionState) {
        let mut states = self.states.write().await;
        let previous = states.insert(kind, state);
        if previous != Some(state) {
            log::info!("{kind} subscription: {previous:?} -> {state:?}");
        }
    }

    async fn fetch(&self, query: &Query) -> Result<DocumentBatch, StoreError> {
        bounded(self.config.remote_timeout, self.store.query(query)).await
    }

    fn publish_users(&self, batch: &[Document]) {
        let directory = reconcile_users(batch, &self.actor);
        log::debug!(
            "Publishing {} users from {} documents",
            directory.all.len(),
            batch.len()
        );
        self.published.send_modify(|state| {
            state.users = Arc::new(directory.others);
            state.all_users = Arc::new(directory.all);
            state.version += 1;
        });
    }

    fn publish_conversations(&self, batch: &[Document]) {
        // Clone the Arc so the watch read lock is released before send_modify
        let all_users = self.published.borrow().all_users.clone();
        let conversations = project_conversations(&all_users, batch);
        log::debug!(
            "Publishing {} conversations from {} documents",
            conversations.len(),
            batch.len()
        );
        self.published.send_modify(|state| {
            state.conversations = Arc::new(conversations);
            state.version += 1;
        });
    }
}

/// Handles of a started coordinator.
struct Running {
    subscriptions: Vec<(QueryKind, SubscriptionHandle)>,
    commands: mpsc::Sender<ConversationCommand>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the live queries and the published [`ChatState`].
///
/// Construct one per signed-in actor, call [`start`](Self::start), hand
/// [`subscribe`](Self::subscribe) receivers to observers, and call
/// [`shutdown`](Self::shutdown) on sign-out.
pub struct SyncCoordinator {
    ctx: WorkerContext,
    running: Mutex<Option<Running>>,
}

impl SyncCoordinator {
    /// `actor` comes from the identity provider; it is the only user ever
    /// flagged as current.
    pub fn new(store: Arc<dyn RemoteStore>, actor: User, config: SyncConfig) -> Self {
        let (published, _) = watch::channel(ChatState::initial(&actor));
        let states = HashMap::from([
            (QueryKind::Users, SubscriptionState::Unsubscribed),
            (QueryKind::Conversations, SubscriptionState::Unsubscribed),
        ]);
        Self {
            ctx: WorkerContext {
                store,
                actor,
                config,
                published: Arc::new(published),
                states: Arc::new(RwLock::new(states)),
            },
            running: Mutex::new(None),
        }
    }

    /// Subscribe both queries and spawn their workers.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SyncError::AlreadyStarted);
        }

        let users = self.open(QueryKind::Users, &Query::users()).await?;
        let conversations_query = Query::conversations_of(&self.ctx.actor.id);
        let conversations = match self.open(QueryKind::Conversations, &conversations_query).await {
            Ok(sub) => sub,
            Err(e) => {
                self.close(QueryKind::Users, users.handle).await;
                return Err(e);
            }
        };

        let (commands, command_rx) = mpsc::channel(self.ctx.config.command_capacity);
        let subscriptions = vec![
            (QueryKind::Users, users.handle),
            (QueryKind::Conversations, conversations.handle),
        ];
        let tasks = vec![
            tokio::spawn(run_conversations_worker(
                self.ctx.clone(),
                conversations_query,
                conversations,
                command_rx,
            )),
            tokio::spawn(run_users_worker(self.ctx.clone(), users, commands.clone())),
        ];

        *running = Some(Running {
            subscriptions,
            commands,
            tasks,
        });
        log::info!("Sync started for {}", self.ctx.actor.id);
        Ok(())
    }

    /// Unsubscribe both queries and wait for the workers to drain.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(SyncError::NotStarted);
        };
        let Running {
            subscriptions,
            commands,
            tasks,
        } = running;
        drop(commands);

        for (kind, handle) in subscriptions {
            self.close(kind, handle).await;
        }

        // Workers exit once their snapshot channels close
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(self.ctx.config.remote_timeout, join_all(tasks))
            .await
            .is_err()
        {
            log::warn!("Sync workers did not stop in time; aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        self.ctx.set_state(QueryKind::Users, SubscriptionState::Unsubscribed).await;
        self.ctx
            .set_state(QueryKind::Conversations, SubscriptionState::Unsubscribed)
            .await;
        log::info!("Sync stopped for {}", self.ctx.actor.id);
        Ok(())
    }

    /// Fetch the conversations query now and publish the result, serialized
    /// with pushed snapshots. Resolves once published or failed.
    pub async fn refresh_conversations(&self) -> Result<(), SyncError> {
        let commands = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .map(|r| r.commands.clone())
                .ok_or(SyncError::NotStarted)?
        };

        let (ack, done) = oneshot::channel();
        commands
            .send(ConversationCommand::Refresh(ack))
            .await
            .map_err(|_| SyncError::WorkerGone(QueryKind::Conversations))?;
        done.await
            .map_err(|_| SyncError::WorkerGone(QueryKind::Conversations))?
    }

    /// A receiver that observes every republished state.
    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.ctx.published.subscribe()
    }

    /// The currently published state.
    pub fn snapshot(&self) -> ChatState {
        self.ctx.published.borrow().clone()
    }

    pub async fn state(&self, kind: QueryKind) -> SubscriptionState {
        self.ctx
            .states
            .read()
            .await
            .get(&kind)
            .copied()
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn actor(&self) -> &User {
        &self.ctx.actor
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.ctx.store
    }

    async fn open(&self, kind: QueryKind, query: &Query) -> Result<Subscription, SyncError> {
        self.ctx.set_state(kind, SubscriptionState::Subscribing).await;
        match bounded(self.ctx.config.remote_timeout, self.ctx.store.subscribe(query)).await {
            Ok(subscription) => {
                self.ctx.set_state(kind, SubscriptionState::Active).await;
                Ok(subscription)
            }
            Err(e) => {
                log::error!("Failed to subscribe to {kind}: {e}");
                self.ctx.set_state(kind, SubscriptionState::Error).await;
                Err(e.into())
            }
        }
    }

    async fn close(&self, kind: QueryKind, handle: SubscriptionHandle) {
        if let Err(e) = bounded(self.ctx.config.remote_timeout, self.ctx.store.unsubscribe(handle)).await {
            log::warn!("Failed to unsubscribe from {kind}: {e}");
        }
        self.ctx.set_state(kind, SubscriptionState::Unsubscribed).await;
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            for task in &running.tasks {
                task.abort();
            }
        }
    }
}

async fn run_users_worker(
    ctx: WorkerContext,
    mut subscription: Subscription,
    commands: mpsc::Sender<ConversationCommand>,
) {
    while let Some(event) = subscription.snapshots.recv().await {
        match event {
            SnapshotEvent::Snapshot(batch) => {
                ctx.publish_users(&batch);
                ctx.set_state(QueryKind::Users, SubscriptionState::Active).await;
                if commands.send(ConversationCommand::Reproject).await.is_err() {
                    log::warn!("Conversations worker gone; skipping re-projection");
                }
            }
            SnapshotEvent::Error(e) => {
                log::error!("Users subscription failed, keeping previous projection: {e}");
                ctx.set_state(QueryKind::Users, SubscriptionState::Error).await;
            }
        }
    }
    ctx.set_state(QueryKind::Users, SubscriptionState::Unsubscribed).await;
}

async fn run_conversations_worker(
    ctx: WorkerContext,
    query: Query,
    mut subscription: Subscription,
    mut commands: mpsc::Receiver<ConversationCommand>,
) {
    let mut last_batch: Option<DocumentBatch> = None;

    loop {
        tokio::select! {
            event = subscription.snapshots.recv() => match event {
                Some(SnapshotEvent::Snapshot(batch)) => {
                    ctx.publish_conversations(&batch);
                    last_batch = Some(batch);
                    ctx.set_state(QueryKind::Conversations, SubscriptionState::Active).await;
                }
                Some(SnapshotEvent::Error(e)) => {
                    log::error!("Conversations subscription failed, keeping previous projection: {e}");
                    ctx.set_state(QueryKind::Conversations, SubscriptionState::Error).await;
                }
                None => break,
            },
            command = commands.recv() => match command {
                Some(ConversationCommand::Reproject) => match &last_batch {
                    Some(batch) => ctx.publish_conversations(batch),
                    None => match ctx.fetch(&query).await {
                        Ok(batch) => {
                            ctx.publish_conversations(&batch);
                            last_batch = Some(batch);
                        }
                        Err(e) => {
                            log::warn!("Re-projection fetch failed: {e}");
                            ctx.set_state(QueryKind::Conversations, SubscriptionState::Error).await;
                        }
                    },
                },
                Some(ConversationCommand::Refresh(ack)) => {
                    let result = match ctx.fetch(&query).await {
                        Ok(batch) => {
                            ctx.publish_conversations(&batch);
                            last_batch = Some(batch);
                            ctx.set_state(QueryKind::Conversations, SubscriptionState::Active).await;
                            Ok(())
                        }
                        Err(e) => {
                            log::warn!("Conversations refresh failed: {e}");
                            ctx.set_state(QueryKind::Conversations, SubscriptionState::Error).await;
                            Err(SyncError::from(e))
                        }
                    };
                    // The caller may have given up waiting
                    let _ = ack.send(result);
                }
                None => break,
            },
        }
    }
    ctx.set_state(QueryKind::Conversations, SubscriptionState::Unsubscribed).await;
}
