//! Session state types.
//!
//! - `session` - Session snapshot, participants and their key/value data
//! - `membership` - Membership state machine (where is the local client?)
//! - `diff` - Snapshot comparison that drives change events
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          SessionManager                             │
//! │                                                                     │
//! │  ┌───────────────────┐  ┌──────────────────┐  ┌─────────────────┐   │
//! │  │  MembershipState  │  │  Arc<Session>    │  │  Polling        │   │
//! │  │                   │  │                  │  │                 │   │
//! │  │ Idle ─▶ Pending   │  │ host_id          │  │ heartbeat task  │   │
//! │  │   ▲       │       │  │ version          │  │ (host only)     │   │
//! │  │   │       ▼       │  │ shared_data      │  │                 │   │
//! │  │ Leaving ◀ Active  │  │ participants[]   │  │ refresh task    │   │
//! │  │          ▲   │    │  │   └─ data        │  │   │             │   │
//! │  │  HostMigrating    │  │                  │  │   ▼ PollUpdate  │   │
//! │  └───────────────────┘  └──────────────────┘  └─────────────────┘   │
//! │                                  ▲                   │              │
//! │                                  │   SnapshotDiff    │ tick()       │
//! │                                  └───────────────────┘              │
//! │                                          │                          │
//! │                                          ▼                          │
//! │                                      EventBus                       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use lobby_sync::state::{Membership, MembershipEvent, MembershipState, PendingOp};
//!
//! let mut state = MembershipState::new();
//! state.apply_mut(MembershipEvent::BeginJoin).unwrap();
//! assert_eq!(state.current(), Membership::Pending(PendingOp::Join));
//!
//! state.apply_mut(MembershipEvent::Established).unwrap();
//! assert!(state.is_active());
//! ```

pub mod diff;
pub mod membership;
pub mod session;

// Re-export commonly used types
pub use diff::SnapshotDiff;
pub use membership::{InvalidTransition, Membership, MembershipEvent, MembershipState, PendingOp};
pub use session::{
    DataEntry, DataMap, DataPatch, Participant, ParticipantId, Session, SessionId, SessionQuery,
    Visibility, WireData,
};
