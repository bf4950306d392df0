//! Remote session service interface.
//!
//! The session manager performs all I/O through [`SessionService`]. An
//! implementation wraps whatever matchmaking backend the game uses; the
//! manager never interprets error codes beyond passing them through.

mod loopback;

pub use loopback::{LoopbackService, ServiceOp};

use async_trait::async_trait;

use crate::error::ServiceResult;
use crate::state::session::{DataMap, DataPatch, Participant, ParticipantId, Session, SessionId, SessionQuery};

/// Parameters for creating a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub name: String,
    pub max_participants: usize,
    pub is_private: bool,
    /// The creating participant; becomes host
    pub host: Participant,
    pub shared_data: DataMap,
}

/// An abstract matchmaking backend.
///
/// Every call is expected to be idempotent from the caller's point of view
/// and every successful mutation returns a snapshot with a bumped version.
/// Timeouts, if any, are the implementation's concern and surface as
/// ordinary errors.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Creates a session hosted by `request.host`.
    async fn create(&self, request: CreateSessionRequest) -> ServiceResult<Session>;

    /// Joins a session by its shareable code.
    async fn join_by_code(&self, code: &str, participant: Participant) -> ServiceResult<Session>;

    /// Joins a session by id.
    async fn join_by_id(&self, id: &SessionId, participant: Participant) -> ServiceResult<Session>;

    /// Fetches the current snapshot.
    async fn get(&self, id: &SessionId) -> ServiceResult<Session>;

    /// Removes a participant (leave or kick).
    async fn remove_participant(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
    ) -> ServiceResult<()>;

    /// Merges a patch into a participant's data.
    async fn update_participant(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        patch: &DataPatch,
    ) -> ServiceResult<Session>;

    /// Merges a patch into the session's shared data.
    async fn update_shared(&self, session_id: &SessionId, patch: &DataPatch) -> ServiceResult<Session>;

    /// Keeps the session alive.
    async fn heartbeat(&self, session_id: &SessionId) -> ServiceResult<()>;

    /// Lists sessions matching a filter.
    async fn query(&self, query: &SessionQuery, max_results: usize) -> ServiceResult<Vec<Session>>;
}
