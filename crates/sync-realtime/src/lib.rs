//! Tokio runtime for the realtime chat sync engine.
//!
//! This crate wires the runtime-free core to a [`ChatBackend`]: per-scope
//! subscription tasks with reconnect, read-receipt debouncing, and the engine
//! actor that owns every cache behind a [`SyncHandle`].

/// Environment-backed engine tuning.
pub mod config;
/// Cancellable read-receipt timers.
pub mod debounce;
/// Engine actor, `SyncHandle` and `RoomSession`.
pub mod engine;
/// In-memory backend for tests and demos.
pub mod memory;
/// Subscription tasks and their registry.
pub mod subscription;
/// Backend collaborator boundary.
pub mod transport;

pub use config::{ConfigError, SyncConfig};
pub use debounce::{DebounceFired, ReadReceiptDebouncer};
pub use engine::{RoomSession, SyncHandle, spawn_engine};
pub use memory::InMemoryBackend;
pub use subscription::{SignalKind, SubscriptionId, SubscriptionManager, SubscriptionSignal};
pub use transport::{ChannelFeed, ChatBackend, FeedItem};
