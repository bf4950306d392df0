//! Lobby Sync Library
//!
//! This crate keeps a game client in sync with a remote matchmaking
//! session ("lobby").
//!
//! # Overview
//!
//! - **Session Manager** - Create, join, leave and kick, with one active
//!   session per client. Runs a heartbeat while hosting and a refresh poll
//!   that keeps the cached snapshot current and detects host migration.
//!
//! - **Session Data Model** - Immutable snapshots of a session, its
//!   participants and their visibility-scoped key/value data.
//!
//! - **Event Bus** - Synchronous, in-order notifications for every
//!   observable change, plus a broadcast channel for async consumers.
//!
//! - **Operation Results** - Every operation returns an [`Outcome`] with a
//!   status, a machine-readable [`ErrorCode`] and, for remote failures, a
//!   retry action.
//!
//! - **Session Service** - The async trait the manager talks to, and an
//!   in-process [`LoopbackService`] for local play and tests.
//!
//! # Design Principles
//!
//! 1. **State machines validate transitions** - Invalid membership changes
//!    are rejected with an [`InvalidTransition`] error, never a panic.
//!
//! 2. **Snapshots are replaced whole** - Readers hold an `Arc<Session>` and
//!    never see a half-applied update.
//!
//! 3. **Stale results never land** - Every async result is tagged with the
//!    epoch it started in and dropped once the client has moved on.
//!
//! 4. **Transport-agnostic** - All I/O goes through [`SessionService`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use lobby_sync::{DataMap, LoopbackService, SessionManager, SyncConfig, Visibility};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let service = Arc::new(LoopbackService::new());
//! let manager = SessionManager::new(service, "alice", SyncConfig::default());
//!
//! let created = manager
//!     .create_session(
//!         "Arena",
//!         4,
//!         false,
//!         DataMap::new().with("name", "Alice", Visibility::Public),
//!         DataMap::new(),
//!     )
//!     .await;
//! assert!(created.is_success());
//! assert!(manager.is_local_host());
//!
//! // Once per frame
//! manager.tick();
//!
//! manager.leave_session().await;
//! assert_eq!(manager.running_tasks(), 0);
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod outcome;
pub mod service;
pub mod state;

pub use config::{ConfigError, SyncConfig};
pub use error::{ErrorCode, ServiceError, ServiceResult};
pub use events::{EventBus, SessionEvent, Subscription, SubscriptionId};
pub use manager::SessionManager;
pub use outcome::{Outcome, Retry, Status};
pub use service::{CreateSessionRequest, LoopbackService, ServiceOp, SessionService};
pub use state::*;
