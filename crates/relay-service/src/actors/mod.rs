//! Actor model for the relay.
//!
//! ```text
//! RoomDirectoryActor (singleton per relay instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per named room)
//!         ├── owns the room's RoomSession (or its hibernated form)
//!         └── serves N ConnectionActors
//!             └── ConnectionActor (one per WebSocket)
//! ```
//!
//! Every actor owns its state exclusively and is reached through a cloneable
//! handle wrapping an `mpsc::Sender`. Requests that need an answer carry a
//! `oneshot::Sender`. Cancellation flows down a `CancellationToken` tree:
//! directory, then room, then connection.

pub mod connection;
pub mod directory;
pub mod messages;
pub mod metrics;
pub mod room;

pub use connection::{ConnectionActor, ConnectionHandle, Outbound, OUTBOUND_CHANNEL_BUFFER};
pub use directory::{DirectoryConfig, RoomDirectoryHandle};
pub use messages::{DirectoryStatus, RoomInfo, RoomState};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
pub use room::RoomActorHandle;
