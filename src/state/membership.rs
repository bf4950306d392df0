//! Session membership state machine.
//!
//! Tracks where the local client is in the session lifecycle and validates
//! transitions.
//!
//! # State Diagram
//!
//! ```text
//! ┌──────────┐  begin_create / begin_join   ┌─────────────────┐
//! │   Idle   │─────────────────────────────▶│     Pending     │
//! └──────────┘                              │ (Create | Join) │
//!    ▲  ▲  ▲         fail / abandon         └────────┬────────┘
//!    │  │  └─────────────────────────────────────────┤
//!    │  │                                            │ established
//!    │  │  kicked / lost                             ▼
//!    │  │                ┌──────────────────┐  ┌──────────┐
//!    │  └────────────────│  HostMigrating   │◀▶│  Active  │
//!    │                   └──────────────────┘  └────┬─────┘
//!    │                                              │ begin_leave
//!    │  left           ┌──────────┐                 │
//!    └─────────────────│ Leaving  │◀────────────────┘
//!                      └──────────┘
//! ```

use std::fmt;

use thiserror::Error;

/// Which operation put the client into `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    Create,
    Join,
}

/// Membership states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Membership {
    /// Not in any session
    #[default]
    Idle,

    /// Create or join request in flight
    Pending(PendingOp),

    /// In a session, polling running
    Active,

    /// A refresh reported a new host; cleared right after `HostMigrated`
    /// is published
    HostMigrating,

    /// Leave or self-kick in progress
    Leaving,
}

impl Membership {
    /// Check if a session is established (including mid-migration).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::HostMigrating)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn is_leaving(&self) -> bool {
        matches!(self, Self::Leaving)
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Pending(op) => write!(f, "Pending({:?})", op),
            Self::Active => write!(f, "Active"),
            Self::HostMigrating => write!(f, "HostMigrating"),
            Self::Leaving => write!(f, "Leaving"),
        }
    }
}

/// State transition events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    BeginCreate,
    BeginJoin,
    /// The pending request returned a session
    Established,
    /// The pending request failed
    Failed,
    /// A leave arrived while a request was pending
    Abandon,
    BeginLeave,
    Left,
    /// A refresh no longer lists the local participant
    Kicked,
    /// A refresh failed
    Lost,
    BeginHostMigration,
    EndHostMigration,
}

/// Error when a membership transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition from {from} via {event:?}: {reason}")]
pub struct InvalidTransition {
    pub from: Membership,
    pub event: MembershipEvent,
    pub reason: &'static str,
}

/// Membership state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipState {
    current: Membership,
}

impl MembershipState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state at a specific point (for tests and restores).
    pub fn at(current: Membership) -> Self {
        Self { current }
    }

    pub fn current(&self) -> Membership {
        self.current
    }

    /// Apply an event, returning the new state or an error.
    pub fn apply(&self, event: MembershipEvent) -> Result<Self, InvalidTransition> {
        Ok(Self {
            current: self.transition(event)?,
        })
    }

    /// Apply an event in place, returning error if invalid.
    pub fn apply_mut(&mut self, event: MembershipEvent) -> Result<(), InvalidTransition> {
        self.current = self.transition(event)?;
        Ok(())
    }

    fn transition(&self, event: MembershipEvent) -> Result<Membership, InvalidTransition> {
        use Membership::*;
        use MembershipEvent::*;

        let invalid = |reason: &'static str| InvalidTransition {
            from: self.current,
            event,
            reason,
        };

        match (self.current, event) {
            (Idle, BeginCreate) => Ok(Pending(PendingOp::Create)),
            (Idle, BeginJoin) => Ok(Pending(PendingOp::Join)),
            (_, BeginCreate | BeginJoin) => Err(invalid("Already in a session")),

            (Pending(_), Established) => Ok(Active),
            (Pending(_), Failed | Abandon) => Ok(Idle),
            (_, Established | Failed | Abandon) => Err(invalid("No request pending")),

            (Active, BeginLeave) => Ok(Leaving),
            (HostMigrating, BeginLeave) => Ok(Leaving),
            (Leaving, BeginLeave) => Err(invalid("Already leaving")),
            (_, BeginLeave) => Err(invalid("Not in a session")),

            (Leaving, Left) => Ok(Idle),
            (_, Left) => Err(invalid("Not leaving")),

            (Active | HostMigrating, Kicked | Lost) => Ok(Idle),
            (_, Kicked | Lost) => Err(invalid("Not in a session")),

            (Active, BeginHostMigration) => Ok(HostMigrating),
            (HostMigrating, BeginHostMigration) => Err(invalid("Already migrating")),
            (_, BeginHostMigration) => Err(invalid("Not in a session")),

            (HostMigrating, EndHostMigration) => Ok(Active),
            (_, EndHostMigration) => Err(invalid("Not migrating")),
        }
    }

    // Convenience methods for common checks

    pub fn is_idle(&self) -> bool {
        self.current.is_idle()
    }

    pub fn is_pending(&self) -> bool {
        self.current.is_pending()
    }

    pub fn is_active(&self) -> bool {
        self.current.is_active()
    }

    pub fn is_leaving(&self) -> bool {
        self.current.is_leaving()
    }
}
