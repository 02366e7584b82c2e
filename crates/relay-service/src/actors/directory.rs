//! `RoomDirectoryActor` - singleton supervisor for room actors.
//!
//! The directory is the top-level actor:
//!
//! - Singleton per relay instance
//! - Creates a `RoomActor` the first time a room name is resolved
//! - Retires rooms that have been empty for the idle period
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! # Graceful Shutdown
//!
//! On SIGTERM, the directory:
//! 1. Stops resolving new rooms
//! 2. Cancels every room (each closes its connections with 1001)
//! 3. Waits for room tasks to finish, up to the deadline

use crate::errors::RelayError;
use crate::observability::metrics;
use crate::session::RoomPolicy;

use super::messages::{DirectoryMessage, DirectoryStatus, RoomInfo};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the directory mailbox.
const DIRECTORY_CHANNEL_BUFFER: usize = 1000;

/// How often empty rooms are swept.
pub const ROOM_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait for a removed room's task to finish.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings applied to every room the directory creates.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub policy: RoomPolicy,
    /// Idle period before a room hibernates, and before an empty room is removed.
    pub room_idle_timeout: Duration,
    pub max_rooms: usize,
}

/// Handle to the `RoomDirectoryActor`.
#[derive(Clone, Debug)]
pub struct RoomDirectoryHandle {
    sender: mpsc::Sender<DirectoryMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomDirectoryHandle {
    /// Spawn the directory actor and return a handle to it.
    #[must_use]
    pub fn new(relay_id: String, config: DirectoryConfig, metrics: Arc<ActorMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(DIRECTORY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Directory, &relay_id));

        let actor = RoomDirectoryActor::new(
            relay_id,
            receiver,
            cancel_token.clone(),
            config,
            metrics,
            Arc::clone(&mailbox),
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    /// Get the room with this name, creating it if needed.
    pub async fn resolve(&self, room: String) -> Result<RoomActorHandle, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(DirectoryMessage::Resolve {
            room,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get information about an existing room.
    pub async fn get_room(&self, room: String) -> Result<RoomInfo, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(DirectoryMessage::GetRoom {
            room,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Stop a room and forget it.
    pub async fn remove_room(&self, room: String) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(DirectoryMessage::RemoveRoom {
            room,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_status(&self) -> Result<DirectoryStatus, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(DirectoryMessage::GetStatus { respond_to: tx }).await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Shut down every room and wait for them, up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(DirectoryMessage::Shutdown {
            deadline,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Mailbox monitor shared with the actor.
    #[must_use]
    pub fn mailbox(&self) -> &MailboxMonitor {
        &self.mailbox
    }

    async fn send(&self, message: DirectoryMessage) -> Result<(), RelayError> {
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|e| {
            self.mailbox.record_enqueue_failed();
            RelayError::Internal(format!("channel send failed: {e}"))
        })
    }

    /// Cancel the directory and every room (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    /// Unix timestamp (seconds).
    created_at: i64,
    /// When the room was last seen empty; `None` while occupied.
    empty_since: Option<Instant>,
}

/// The `RoomDirectoryActor` implementation.
pub struct RoomDirectoryActor {
    relay_id: String,
    receiver: mpsc::Receiver<DirectoryMessage>,
    /// Root cancellation token.
    cancel_token: CancellationToken,
    config: DirectoryConfig,
    rooms: HashMap<String, ManagedRoom>,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomDirectoryActor {
    fn new(
        relay_id: String,
        receiver: mpsc::Receiver<DirectoryMessage>,
        cancel_token: CancellationToken,
        config: DirectoryConfig,
        metrics: Arc<ActorMetrics>,
        mailbox: Arc<MailboxMonitor>,
    ) -> Self {
        Self {
            relay_id,
            receiver,
            cancel_token,
            config,
            rooms: HashMap::new(),
            accepting_new: true,
            metrics,
            mailbox,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "relay.actor.directory", fields(relay_id = %self.relay_id))]
    async fn run(mut self) {
        info!(
            target: "relay.actor.directory",
            relay_id = %self.relay_id,
            max_rooms = self.config.max_rooms,
            "RoomDirectoryActor started"
        );

        let mut sweep = tokio::time::interval(ROOM_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor.directory",
                        relay_id = %self.relay_id,
                        "RoomDirectoryActor received cancellation signal"
                    );
                    self.graceful_shutdown(ROOM_STOP_TIMEOUT).await;
                    break;
                }

                _ = sweep.tick() => {
                    self.sweep_empty_rooms();
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message).await;
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "relay.actor.directory",
                                relay_id = %self.relay_id,
                                "RoomDirectoryActor channel closed, exiting"
                            );
                            self.graceful_shutdown(ROOM_STOP_TIMEOUT).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor.directory",
            relay_id = %self.relay_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomDirectoryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: DirectoryMessage) {
        match message {
            DirectoryMessage::Resolve { room, respond_to } => {
                let result = self.resolve(room);
                let _ = respond_to.send(result);
            }

            DirectoryMessage::GetRoom { room, respond_to } => {
                let result = self.get_room(&room).await;
                let _ = respond_to.send(result);
            }

            DirectoryMessage::RemoveRoom { room, respond_to } => {
                let result = if self.stop_room(&room) {
                    Ok(())
                } else {
                    Err(RelayError::RoomNotFound(room))
                };
                let _ = respond_to.send(result);
            }

            DirectoryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            DirectoryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.graceful_shutdown(deadline).await;
                let _ = respond_to.send(Ok(()));
                self.cancel_token.cancel();
            }
        }
    }

    fn resolve(&mut self, room: String) -> Result<RoomActorHandle, RelayError> {
        if !self.accepting_new {
            return Err(RelayError::Draining);
        }

        if let Some(managed) = self.rooms.get(&room) {
            if !managed.task_handle.is_finished() && !managed.handle.is_cancelled() {
                return Ok(managed.handle.clone());
            }
            // Stale entry; replace it below
            self.rooms.remove(&room);
            self.metrics.room_removed();
        }

        if self.rooms.len() >= self.config.max_rooms {
            warn!(
                target: "relay.actor.directory",
                relay_id = %self.relay_id,
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(RelayError::DirectoryFull);
        }

        let (handle, task_handle) = RoomActor::spawn(
            room.clone(),
            self.config.policy.clone(),
            self.config.room_idle_timeout,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
                empty_since: Some(Instant::now()),
            },
        );
        self.metrics.room_created();
        metrics::set_rooms_active(self.rooms.len());

        debug!(
            target: "relay.actor.directory",
            relay_id = %self.relay_id,
            room = %room,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    async fn get_room(&self, room: &str) -> Result<RoomInfo, RelayError> {
        let managed = self
            .rooms
            .get(room)
            .ok_or_else(|| RelayError::RoomNotFound(room.to_string()))?;

        match managed.handle.get_state().await {
            Ok(state) => Ok(RoomInfo {
                room: room.to_string(),
                connection_count: state.connection_count,
                created_at: managed.created_at,
                is_hibernated: state.is_hibernated,
            }),
            Err(_) => {
                warn!(
                    target: "relay.actor.directory",
                    relay_id = %self.relay_id,
                    room = %room,
                    "Failed to query room actor state, returning cached info"
                );
                Ok(RoomInfo {
                    room: room.to_string(),
                    connection_count: managed.handle.occupancy(),
                    created_at: managed.created_at,
                    is_hibernated: false,
                })
            }
        }
    }

    /// Cancel and forget a room. Returns whether it existed.
    ///
    /// Waiting for the room task happens in the background so the
    /// directory loop is never blocked.
    fn stop_room(&mut self, room: &str) -> bool {
        let Some(managed) = self.rooms.remove(room) else {
            return false;
        };

        managed.handle.cancel();

        let room_owned = room.to_string();
        let relay_id = self.relay_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "relay.actor.directory",
                        relay_id = %relay_id,
                        room = %room_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "relay.actor.directory",
                        relay_id = %relay_id,
                        room = %room_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "relay.actor.directory",
                        relay_id = %relay_id,
                        room = %room_owned,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });

        self.metrics.room_removed();
        metrics::set_rooms_active(self.rooms.len());

        debug!(
            target: "relay.actor.directory",
            relay_id = %self.relay_id,
            room = %room,
            total_rooms = self.rooms.len(),
            "Room actor removed"
        );

        true
    }

    /// Ask rooms that have had no members for the idle period to retire.
    ///
    /// The room makes the final emptiness check itself, so an admission
    /// racing the sweep is either served by a live room or refused with
    /// `RoomClosed`. Retired rooms are dropped by `check_room_health` once
    /// their task ends.
    fn sweep_empty_rooms(&mut self) {
        let now = Instant::now();
        let idle = self.config.room_idle_timeout;

        let expired: Vec<String> = self
            .rooms
            .iter_mut()
            .filter_map(|(name, managed)| {
                if managed.handle.occupancy() > 0 {
                    managed.empty_since = None;
                    return None;
                }
                let since = *managed.empty_since.get_or_insert(now);
                (now.duration_since(since) >= idle).then(|| name.clone())
            })
            .collect();

        for room in expired {
            let Some(managed) = self.rooms.get(&room) else {
                continue;
            };
            if managed.handle.is_cancelled() {
                continue;
            }
            let queued = managed.handle.retire_if_empty();
            debug!(
                target: "relay.actor.directory",
                relay_id = %self.relay_id,
                room = %room,
                queued,
                "Asked empty room to retire"
            );
        }
    }

    fn get_status(&self) -> DirectoryStatus {
        DirectoryStatus {
            room_count: self.rooms.len(),
            connection_count: self.rooms.values().map(|m| m.handle.occupancy()).sum(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self, deadline: Duration) {
        info!(
            target: "relay.actor.directory",
            relay_id = %self.relay_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room, managed) in self.rooms.drain() {
            match tokio::time::timeout(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "relay.actor.directory",
                        relay_id = %self.relay_id,
                        room = %room,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "relay.actor.directory",
                        relay_id = %self.relay_id,
                        room = %room,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "relay.actor.directory",
                        relay_id = %self.relay_id,
                        room = %room,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }
        metrics::set_rooms_active(0);

        info!(
            target: "relay.actor.directory",
            relay_id = %self.relay_id,
            "Graceful shutdown complete"
        );
    }

    /// Check health of managed room actors.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room, _)| room.clone())
            .collect();

        for room in finished {
            let Some(managed) = self.rooms.remove(&room) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "relay.actor.directory",
                        relay_id = %self.relay_id,
                        room = %room,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "relay.actor.directory",
                            relay_id = %self.relay_id,
                            room = %room,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }

            self.metrics.room_removed();
            metrics::set_rooms_active(self.rooms.len());
        }
    }
}
