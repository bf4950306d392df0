//! Loopback session service.
//!
//! Keeps sessions in process memory so several clients in one process can
//! share lobbies without touching the network. Used for offline play and
//! tests. Supports one-shot failure injection per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use strum::Display;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{CreateSessionRequest, SessionService};
use crate::config::DEFAULT_SESSION_TTL;
use crate::error::{ErrorCode, ServiceError, ServiceResult};
use crate::state::session::{
    DataPatch, Participant, ParticipantId, Session, SessionId, SessionQuery,
};

/// Join code length.
const JOIN_CODE_LEN: usize = 6;

/// Join code alphabet, without look-alike characters.
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Service operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ServiceOp {
    Create,
    JoinByCode,
    JoinById,
    Get,
    RemoveParticipant,
    UpdateParticipant,
    UpdateShared,
    Heartbeat,
    Query,
}

/// A hosted session plus liveness bookkeeping.
#[derive(Debug)]
struct Hosted {
    session: Session,
    last_heartbeat: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    /// Sessions by id
    sessions: HashMap<SessionId, Hosted>,

    /// Join code to session id mapping
    codes: HashMap<String, SessionId>,

    /// Queued one-shot failures per operation
    failures: HashMap<ServiceOp, VecDeque<ServiceError>>,

    /// Calls seen per operation
    calls: HashMap<ServiceOp, usize>,
}

impl Inner {
    /// Count the call and pop an injected failure, if any.
    fn enter(&mut self, op: ServiceOp) -> ServiceResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(%op, code = err.wire_code(), "loopback: injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn hosted_mut(&mut self, id: &SessionId) -> ServiceResult<&mut Hosted> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("session {} not found", id)))
    }

    fn unique_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..JOIN_CODE_LEN)
                .map(|_| JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())] as char)
                .collect();
            if !self.codes.contains_key(&code) {
                return code;
            }
        }
    }

    fn remove_session(&mut self, id: &SessionId) -> Option<Session> {
        let hosted = self.sessions.remove(id)?;
        self.codes.remove(&hosted.session.join_code);
        Some(hosted.session)
    }

    /// Drop sessions whose host stopped sending heartbeats.
    fn expire_stale(&mut self, ttl: Duration) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, h)| h.last_heartbeat.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            debug!(session_id = %id, "loopback: session expired");
            self.remove_session(id);
        }

        expired
    }

    fn join(&mut self, id: &SessionId, mut participant: Participant) -> ServiceResult<Session> {
        let hosted = self.hosted_mut(id)?;
        let session = &mut hosted.session;

        // Joining twice is a no-op.
        if session.contains(&participant.id) {
            return Ok(session.clone());
        }
        if session.is_full() {
            return Err(ServiceError::forbidden(format!("session {} is full", id)));
        }

        participant.joined_at = Utc::now();
        session.participants.push(participant);
        bump(session);
        Ok(session.clone())
    }
}

fn bump(session: &mut Session) {
    session.version += 1;
    session.updated_at = Utc::now();
}

/// In-process [`SessionService`]. Clones share the same sessions.
#[derive(Debug, Clone)]
pub struct LoopbackService {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl Default for LoopbackService {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackService {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }

    /// Sessions without a heartbeat for longer than `ttl` are dropped.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, expire stale sessions, pop an injected failure.
    fn enter(&self, op: ServiceOp) -> ServiceResult<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.expire_stale(self.ttl);
        inner.enter(op)?;
        Ok(inner)
    }

    /// Make the next call of `op` fail with `error`. Failures queue up.
    pub fn fail_next(&self, op: ServiceOp, error: ServiceError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// How many times `op` has been called.
    pub fn calls(&self, op: ServiceOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Inspect a hosted session without counting a call.
    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.lock().sessions.get(id).map(|h| h.session.clone())
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Drop sessions past their TTL. Returns the expired ids.
    pub fn expire_stale(&self) -> Vec<SessionId> {
        self.lock().expire_stale(self.ttl)
    }
}

#[async_trait]
impl SessionService for LoopbackService {
    async fn create(&self, request: CreateSessionRequest) -> ServiceResult<Session> {
        let mut inner = self.enter(ServiceOp::Create)?;

        if request.max_participants == 0 {
            return Err(ServiceError::forbidden(
                "max_participants must be at least 1",
            ));
        }

        let now = Utc::now();
        let id = SessionId::new(Uuid::new_v4().to_string());
        let join_code = inner.unique_code();
        let mut host = request.host;
        host.joined_at = now;

        let session = Session {
            id: id.clone(),
            join_code: join_code.clone(),
            host_id: host.id.clone(),
            version: 1,
            name: request.name,
            max_participants: request.max_participants,
            is_private: request.is_private,
            shared_data: request.shared_data,
            participants: vec![host],
            created_at: now,
            updated_at: now,
        };

        debug!(session_id = %id, %join_code, "loopback: session created");
        inner.codes.insert(join_code, id.clone());
        inner.sessions.insert(
            id,
            Hosted {
                session: session.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        Ok(session)
    }

    async fn join_by_code(&self, code: &str, participant: Participant) -> ServiceResult<Session> {
        let mut inner = self.enter(ServiceOp::JoinByCode)?;
        let id = inner
            .codes
            .get(&code.to_uppercase())
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("no session with code {}", code)))?;
        inner.join(&id, participant)
    }

    async fn join_by_id(&self, id: &SessionId, participant: Participant) -> ServiceResult<Session> {
        let mut inner = self.enter(ServiceOp::JoinById)?;
        inner.join(id, participant)
    }

    async fn get(&self, id: &SessionId) -> ServiceResult<Session> {
        let mut inner = self.enter(ServiceOp::Get)?;
        Ok(inner.hosted_mut(id)?.session.clone())
    }

    async fn remove_participant(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
    ) -> ServiceResult<()> {
        let mut inner = self.enter(ServiceOp::RemoveParticipant)?;
        let session = &mut inner.hosted_mut(session_id)?.session;

        // Removing a non-member is a no-op.
        let Some(index) = session.participants.iter().position(|p| &p.id == participant_id)
        else {
            return Ok(());
        };
        session.participants.remove(index);

        if session.participants.is_empty() {
            debug!(%session_id, "loopback: last participant left, closing session");
            inner.remove_session(session_id);
            return Ok(());
        }

        // Host left: the earliest remaining member takes over.
        if &session.host_id == participant_id {
            session.host_id = session.participants[0].id.clone();
            debug!(%session_id, new_host = %session.host_id, "loopback: host migrated");
        }
        bump(session);
        Ok(())
    }

    async fn update_participant(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        patch: &DataPatch,
    ) -> ServiceResult<Session> {
        let mut inner = self.enter(ServiceOp::UpdateParticipant)?;
        let session = &mut inner.hosted_mut(session_id)?.session;

        let participant = session
            .participants
            .iter_mut()
            .find(|p| &p.id == participant_id)
            .ok_or_else(|| {
                ServiceError::new(
                    ErrorCode::NotFound,
                    format!("participant {} not in session {}", participant_id, session_id),
                )
            })?;
        participant.data.apply_patch(patch);
        bump(session);
        Ok(session.clone())
    }

    async fn update_shared(&self, session_id: &SessionId, patch: &DataPatch) -> ServiceResult<Session> {
        let mut inner = self.enter(ServiceOp::UpdateShared)?;
        let session = &mut inner.hosted_mut(session_id)?.session;
        session.shared_data.apply_patch(patch);
        bump(session);
        Ok(session.clone())
    }

    async fn heartbeat(&self, session_id: &SessionId) -> ServiceResult<()> {
        let mut inner = self.enter(ServiceOp::Heartbeat)?;
        inner.hosted_mut(session_id)?.last_heartbeat = Instant::now();
        Ok(())
    }

    async fn query(&self, query: &SessionQuery, max_results: usize) -> ServiceResult<Vec<Session>> {
        let inner = self.enter(ServiceOp::Query)?;
        let mut found: Vec<Session> = inner
            .sessions
            .values()
            .map(|h| &h.session)
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        found.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        found.truncate(max_results);
        Ok(found)
    }
}
