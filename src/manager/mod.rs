//! Session lifecycle and background synchronization.
//!
//! [`SessionManager`] owns the one active session of a client. It runs the
//! create/join/leave/kick lifecycle through a [`SessionService`], keeps a
//! cached snapshot current with a refresh task, keeps the session alive with
//! a heartbeat task while the local participant hosts, and publishes every
//! observable change on its [`EventBus`].
//!
//! Polling tasks never touch manager state. They report over a channel and
//! the owner applies the results from [`SessionManager::tick`] or
//! [`SessionManager::process_next`]. Every async result carries the epoch
//! it started in and is dropped if the epoch has moved on since.

mod tasks;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{ErrorCode, ServiceError, ServiceResult};
use crate::events::{EventBus, SessionEvent};
use crate::outcome::{Outcome, Retry};
use crate::service::{CreateSessionRequest, SessionService};
use crate::state::diff::SnapshotDiff;
use crate::state::membership::{Membership, MembershipEvent, MembershipState, PendingOp};
use crate::state::session::{
    DataMap, DataPatch, Participant, ParticipantId, Session, SessionId, SessionQuery,
};

use tasks::{PollUpdate, Polling, TaskHandle};

/// Mutable manager state. Guarded by a std mutex that is never held
/// across an await.
#[derive(Debug, Default)]
struct Core {
    membership: MembershipState,
    session: Option<Arc<Session>>,
    epoch: u64,
    polling: Polling,
    /// Runtime the polling tasks are spawned on, captured by the first
    /// create/join.
    runtime: Option<Handle>,
}

impl Core {
    /// Drop the session locally: new epoch, polling cancelled, no snapshot.
    fn clear(&mut self) {
        self.epoch += 1;
        self.polling.cancel_all();
        self.session = None;
    }
}

struct Shared {
    service: Arc<dyn SessionService>,
    local_id: ParticipantId,
    config: SyncConfig,
    events: EventBus,
    core: Mutex<Core>,
    updates_tx: mpsc::UnboundedSender<PollUpdate>,
    updates_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PollUpdate>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        core.polling.cancel_all();
    }
}

/// How the local participant is leaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    Leave,
    KickSelf,
}

/// Arguments of a create call, kept for retries.
#[derive(Debug, Clone)]
struct CreateArgs {
    name: String,
    max_participants: usize,
    is_private: bool,
    local_data: DataMap,
    shared_data: DataMap,
}

#[derive(Debug, Clone)]
enum JoinTarget {
    Code(String),
    Id(SessionId),
}

/// Client-side session engine.
///
/// Cheap to clone; clones share the same session, tasks and event bus.
/// Must be driven from inside a Tokio runtime.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("SessionManager")
            .field("local_id", &self.shared.local_id)
            .field("membership", &core.membership.current())
            .field("epoch", &core.epoch)
            .field("session", &core.session.as_ref().map(|s| &s.id))
            .finish()
    }
}

impl SessionManager {
    /// Create a manager for `local_id`. A config that fails
    /// [`SyncConfig::validate`] is normalized rather than rejected.
    pub fn new(
        service: Arc<dyn SessionService>,
        local_id: impl Into<ParticipantId>,
        config: SyncConfig,
    ) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(err) => {
                let normalized = config.normalized();
                warn!(?normalized, "invalid sync config ({err}), using normalized values");
                normalized
            }
        };
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let events = EventBus::new(config.event_channel_capacity);

        Self {
            shared: Arc::new(Shared {
                service,
                local_id: local_id.into(),
                config,
                events,
                core: Mutex::new(Core::default()),
                updates_tx,
                updates_rx: tokio::sync::Mutex::new(updates_rx),
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.shared
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Read-only accessors

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.shared.local_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// The cached snapshot, if in a session.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.core().session.clone()
    }

    /// The local participant as listed in the cached snapshot.
    pub fn local_participant(&self) -> Option<Participant> {
        self.session()?.participant(&self.shared.local_id).cloned()
    }

    pub fn membership(&self) -> Membership {
        self.core().membership.current()
    }

    pub fn is_local_host(&self) -> bool {
        self.core()
            .session
            .as_ref()
            .is_some_and(|s| s.is_host(&self.shared.local_id))
    }

    pub fn epoch(&self) -> u64 {
        self.core().epoch
    }

    /// Polling tasks that have not exited yet.
    pub fn running_tasks(&self) -> usize {
        self.core().polling.running()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.core().polling.heartbeat_running()
    }

    pub fn refresh_running(&self) -> bool {
        self.core().polling.refresh_running()
    }

    // Lifecycle

    /// Create a session hosted by the local participant.
    pub async fn create_session(
        &self,
        name: impl Into<String>,
        max_participants: usize,
        is_private: bool,
        local_data: DataMap,
        shared_data: DataMap,
    ) -> Outcome<Arc<Session>> {
        self.create_with(CreateArgs {
            name: name.into(),
            max_participants,
            is_private,
            local_data,
            shared_data,
        })
        .await
    }

    async fn create_with(&self, args: CreateArgs) -> Outcome<Arc<Session>> {
        let request = CreateSessionRequest {
            name: args.name.clone(),
            max_participants: args.max_participants,
            is_private: args.is_private,
            host: self.local_with(args.local_data.clone()),
            shared_data: args.shared_data.clone(),
        };
        let outcome = self
            .establish(PendingOp::Create, self.shared.service.create(request))
            .await;
        self.offer_retry(outcome, move |manager| manager.retry_create(args))
    }

    fn retry_create(self, args: CreateArgs) -> BoxFuture<'static, Outcome<Arc<Session>>> {
        Box::pin(async move { self.create_with(args).await })
    }

    /// Join a session by its shareable code.
    pub async fn join_by_code(
        &self,
        code: impl Into<String>,
        local_data: DataMap,
    ) -> Outcome<Arc<Session>> {
        self.join_with(JoinTarget::Code(code.into()), local_data)
            .await
    }

    /// Join a session by id, e.g. one picked from [`Self::query_sessions`].
    pub async fn join_by_id(
        &self,
        session_id: impl Into<SessionId>,
        local_data: DataMap,
    ) -> Outcome<Arc<Session>> {
        self.join_with(JoinTarget::Id(session_id.into()), local_data)
            .await
    }

    async fn join_with(&self, target: JoinTarget, local_data: DataMap) -> Outcome<Arc<Session>> {
        let participant = self.local_with(local_data.clone());
        let service = &self.shared.service;
        let outcome = match &target {
            JoinTarget::Code(code) => {
                self.establish(PendingOp::Join, service.join_by_code(code, participant))
                    .await
            }
            JoinTarget::Id(id) => {
                self.establish(PendingOp::Join, service.join_by_id(id, participant))
                    .await
            }
        };
        self.offer_retry(outcome, move |manager| {
            manager.retry_join(target, local_data)
        })
    }

    fn retry_join(
        self,
        target: JoinTarget,
        local_data: DataMap,
    ) -> BoxFuture<'static, Outcome<Arc<Session>>> {
        Box::pin(async move { self.join_with(target, local_data).await })
    }

    /// Leave the current session.
    ///
    /// While a create/join is still in flight this abandons it instead and
    /// returns a warning. A failed remote removal is also a warning: local
    /// state is cleared and polling stopped either way.
    pub async fn leave_session(&self) -> Outcome<()> {
        self.depart(Departure::Leave).await
    }

    /// Remove a participant. Host only.
    ///
    /// Kicking yourself leaves the session, publishing `SessionKicked`
    /// instead of `SessionLeft`.
    pub async fn kick_participant(&self, participant_id: impl Into<ParticipantId>) -> Outcome<()> {
        self.kick_with(participant_id.into()).await
    }

    async fn kick_with(&self, target: ParticipantId) -> Outcome<()> {
        let (session, epoch) = match self.active_session(true) {
            Ok(active) => active,
            Err(outcome) => return outcome,
        };
        if target == self.shared.local_id {
            return self.depart(Departure::KickSelf).await;
        }

        let outcome = match self
            .shared
            .service
            .remove_participant(&session.id, &target)
            .await
        {
            Ok(()) => {
                info!(session_id = %session.id, participant_id = %target, "participant kicked");
                if self.epoch() == epoch {
                    self.shared
                        .events
                        .publish(SessionEvent::SessionKicked(target.clone()));
                }
                Outcome::success(())
            }
            Err(err) => Outcome::from_service(err),
        };
        self.offer_retry(outcome, move |manager| manager.retry_kick(target))
    }

    fn retry_kick(self, target: ParticipantId) -> BoxFuture<'static, Outcome<()>> {
        Box::pin(async move { self.kick_with(target).await })
    }

    // Data

    /// Merge a patch into a participant's data. The returned snapshot is
    /// authoritative and replaces the cache like a refresh would.
    pub async fn update_participant_data(
        &self,
        participant_id: impl Into<ParticipantId>,
        patch: DataPatch,
    ) -> Outcome<Arc<Session>> {
        self.update_participant_with(participant_id.into(), patch)
            .await
    }

    async fn update_participant_with(
        &self,
        participant_id: ParticipantId,
        patch: DataPatch,
    ) -> Outcome<Arc<Session>> {
        let (session, epoch) = match self.active_session(false) {
            Ok(active) => active,
            Err(outcome) => return outcome,
        };
        let result = self
            .shared
            .service
            .update_participant(&session.id, &participant_id, &patch)
            .await;
        let outcome = self.adopt(epoch, result);
        self.offer_retry(outcome, move |manager| {
            manager.retry_update_participant(participant_id, patch)
        })
    }

    fn retry_update_participant(
        self,
        participant_id: ParticipantId,
        patch: DataPatch,
    ) -> BoxFuture<'static, Outcome<Arc<Session>>> {
        Box::pin(async move { self.update_participant_with(participant_id, patch).await })
    }

    /// Merge a patch into the session's shared data.
    pub async fn update_shared_data(&self, patch: DataPatch) -> Outcome<Arc<Session>> {
        let (session, epoch) = match self.active_session(false) {
            Ok(active) => active,
            Err(outcome) => return outcome,
        };
        let result = self.shared.service.update_shared(&session.id, &patch).await;
        let outcome = self.adopt(epoch, result);
        self.offer_retry(outcome, move |manager| manager.retry_update_shared(patch))
    }

    fn retry_update_shared(self, patch: DataPatch) -> BoxFuture<'static, Outcome<Arc<Session>>> {
        Box::pin(async move { self.update_shared_data(patch).await })
    }

    /// Browse sessions. Works whether or not a session is active.
    pub async fn query_sessions(
        &self,
        query: SessionQuery,
        max_results: usize,
    ) -> Outcome<Vec<Session>> {
        let outcome = match self.shared.service.query(&query, max_results).await {
            Ok(sessions) => Outcome::success(sessions),
            Err(err) => Outcome::from_service(err),
        };
        self.offer_retry(outcome, move |manager| {
            manager.retry_query(query, max_results)
        })
    }

    fn retry_query(
        self,
        query: SessionQuery,
        max_results: usize,
    ) -> BoxFuture<'static, Outcome<Vec<Session>>> {
        Box::pin(async move { self.query_sessions(query, max_results).await })
    }

    // Polling results

    /// Apply every polling result received so far. Call once per frame.
    ///
    /// Returns how many results were processed, including discarded ones.
    /// Reentrant calls from inside an event handler return 0.
    pub fn tick(&self) -> usize {
        let Ok(mut updates) = self.shared.updates_rx.try_lock() else {
            return 0;
        };

        let mut processed = 0;
        while let Ok(update) = updates.try_recv() {
            self.apply_update(update);
            processed += 1;
        }
        drop(updates);

        self.core().polling.reap();
        processed
    }

    /// Wait for the next polling result and apply it.
    ///
    /// Waits indefinitely while no session is active.
    pub async fn process_next(&self) -> bool {
        // Held while applying so a handler's `tick()` cannot interleave.
        let mut updates = self.shared.updates_rx.lock().await;
        let Some(update) = updates.recv().await else {
            return false;
        };

        self.apply_update(update);
        drop(updates);

        self.core().polling.reap();
        true
    }

    fn apply_update(&self, update: PollUpdate) {
        match update {
            PollUpdate::Refreshed { epoch, session } => {
                self.apply_snapshot(epoch, session);
            }
            PollUpdate::RefreshFailed { epoch, error } => self.apply_failure(epoch, error),
        }
    }

    // Internals

    fn local_with(&self, data: DataMap) -> Participant {
        Participant::new(self.shared.local_id.clone(), data)
    }

    /// The cached snapshot and current epoch, if a session is established.
    fn active_session<T>(&self, host_only: bool) -> Result<(Arc<Session>, u64), Outcome<T>> {
        let core = self.core();
        let session = match &core.session {
            Some(session) if core.membership.is_active() => Arc::clone(session),
            _ => {
                return Err(Outcome::error(
                    ErrorCode::NotInSession,
                    format!("not in a session ({})", core.membership.current()),
                ))
            }
        };
        if host_only && !session.is_host(&self.shared.local_id) {
            return Err(Outcome::error(
                ErrorCode::NotHost,
                "only the host can do this",
            ));
        }
        Ok((session, core.epoch))
    }

    /// Attach a retry to remote failures. Local precondition failures
    /// would fail the same way again.
    fn offer_retry<T, F>(&self, outcome: Outcome<T>, redo: F) -> Outcome<T>
    where
        T: Send + 'static,
        F: FnOnce(SessionManager) -> BoxFuture<'static, Outcome<T>> + Send + Sync + 'static,
    {
        let retryable = outcome.is_error() && outcome.code.is_some_and(|code| !code.is_local());
        if !retryable {
            return outcome;
        }
        let manager = self.clone();
        outcome.with_retry(Retry::new(move || redo(manager)))
    }

    /// Run a create/join request under the pending state.
    async fn establish<F>(&self, op: PendingOp, request: F) -> Outcome<Arc<Session>>
    where
        F: Future<Output = ServiceResult<Session>>,
    {
        let (epoch, previous) = match self.begin_pending(op) {
            Ok(started) => started,
            Err(outcome) => return outcome,
        };
        tasks::stop_all(previous).await;

        let result = request.await;
        self.finish_pending(op, epoch, result)
    }

    fn begin_pending(
        &self,
        op: PendingOp,
    ) -> Result<(u64, Vec<TaskHandle>), Outcome<Arc<Session>>> {
        let runtime = Handle::try_current().map_err(|_| {
            Outcome::error(
                ErrorCode::Unknown,
                "session manager must run inside a Tokio runtime",
            )
        })?;

        let mut core = self.core();
        let event = match op {
            PendingOp::Create => MembershipEvent::BeginCreate,
            PendingOp::Join => MembershipEvent::BeginJoin,
        };
        if let Err(err) = core.membership.apply_mut(event) {
            debug!(?op, state = %err.from, "rejected: {}", err.reason);
            return Err(Outcome::error(ErrorCode::AlreadyInSession, err.to_string()));
        }

        core.epoch += 1;
        core.runtime = Some(runtime);
        debug!(?op, epoch = core.epoch, "request pending");
        Ok((core.epoch, core.polling.take_draining()))
    }

    fn finish_pending(
        &self,
        op: PendingOp,
        epoch: u64,
        result: ServiceResult<Session>,
    ) -> Outcome<Arc<Session>> {
        let mut core = self.core();

        if core.epoch != epoch {
            let runtime = core.runtime.clone();
            drop(core);
            return self.discard_stale(op, epoch, result, runtime);
        }

        let session = match result {
            Ok(session) => Arc::new(session),
            Err(err) => {
                if let Err(invalid) = core.membership.apply_mut(MembershipEvent::Failed) {
                    warn!("{invalid}");
                }
                warn!(?op, code = err.wire_code(), "request failed: {}", err.message);
                return Outcome::from_service(err);
            }
        };

        if let Err(invalid) = core.membership.apply_mut(MembershipEvent::Established) {
            warn!("{invalid}");
        }
        core.session = Some(Arc::clone(&session));
        if session.is_host(&self.shared.local_id) {
            self.start_heartbeat(&mut core, &session.id);
        }
        self.start_refresh(&mut core, &session.id);
        drop(core);

        let event = match op {
            PendingOp::Create => {
                info!(session_id = %session.id, join_code = %session.join_code, epoch, "session created");
                SessionEvent::SessionCreated(Arc::clone(&session))
            }
            PendingOp::Join => {
                info!(session_id = %session.id, host_id = %session.host_id, epoch, "session joined");
                SessionEvent::SessionJoined(Arc::clone(&session))
            }
        };
        self.shared.events.publish(event);

        Outcome::success(session)
    }

    /// A create/join finished after a leave abandoned it. Never resurrect
    /// the session; if the service did add us, take us back out.
    fn discard_stale(
        &self,
        op: PendingOp,
        epoch: u64,
        result: ServiceResult<Session>,
        runtime: Option<Handle>,
    ) -> Outcome<Arc<Session>> {
        if let Ok(session) = result {
            warn!(?op, session_id = %session.id, epoch, "abandoned request completed, removing orphaned membership");
            let service = Arc::clone(&self.shared.service);
            let local_id = self.shared.local_id.clone();
            let cleanup = async move {
                if let Err(err) = service.remove_participant(&session.id, &local_id).await {
                    warn!(session_id = %session.id, code = err.wire_code(), "orphan cleanup failed: {}", err.message);
                }
            };
            match runtime {
                Some(runtime) => {
                    runtime.spawn(cleanup);
                }
                None => warn!("no runtime to clean up orphaned membership"),
            }
        } else {
            debug!(?op, epoch, "abandoned request failed");
        }

        Outcome::error(
            ErrorCode::Abandoned,
            "request was abandoned before it completed",
        )
    }

    fn start_heartbeat(&self, core: &mut Core, session_id: &SessionId) {
        let Some(runtime) = core.runtime.as_ref() else {
            warn!(%session_id, "no runtime, heartbeat not started");
            return;
        };
        let task = tasks::spawn_heartbeat(
            runtime,
            Arc::clone(&self.shared.service),
            session_id.clone(),
            self.shared.config.heartbeat_interval,
        );
        core.polling.set_heartbeat(task);
    }

    fn start_refresh(&self, core: &mut Core, session_id: &SessionId) {
        let Some(runtime) = core.runtime.as_ref() else {
            warn!(%session_id, "no runtime, refresh not started");
            return;
        };
        let task = tasks::spawn_refresh(
            runtime,
            Arc::clone(&self.shared.service),
            session_id.clone(),
            core.epoch,
            self.shared.config.refresh_interval,
            self.shared.updates_tx.clone(),
        );
        core.polling.set_refresh(task);
    }

    async fn depart(&self, how: Departure) -> Outcome<()> {
        let (session_id, running) = match self.begin_leave(how) {
            Ok(leaving) => leaving,
            Err(outcome) => return outcome,
        };

        let removed = self
            .shared
            .service
            .remove_participant(&session_id, &self.shared.local_id)
            .await;
        tasks::stop_all(running).await;

        self.finish_leave(how, &session_id, removed)
    }

    fn begin_leave(&self, how: Departure) -> Result<(SessionId, Vec<TaskHandle>), Outcome<()>> {
        let mut core = self.core();

        if let Membership::Pending(op) = core.membership.current() {
            if let Err(invalid) = core.membership.apply_mut(MembershipEvent::Abandon) {
                warn!("{invalid}");
            }
            core.epoch += 1;
            info!(?op, epoch = core.epoch, "pending request abandoned");
            return Err(Outcome::warning(
                (),
                ErrorCode::Abandoned,
                format!("pending {op:?} abandoned"),
            ));
        }

        let session_id = match &core.session {
            Some(session) if core.membership.is_active() => session.id.clone(),
            _ => {
                return Err(Outcome::error(
                    ErrorCode::NotInSession,
                    format!("not in a session ({})", core.membership.current()),
                ))
            }
        };
        if let Err(invalid) = core.membership.apply_mut(MembershipEvent::BeginLeave) {
            return Err(Outcome::error(ErrorCode::NotInSession, invalid.to_string()));
        }

        core.epoch += 1;
        debug!(%session_id, ?how, epoch = core.epoch, "leaving");
        Ok((session_id, core.polling.take_all()))
    }

    fn finish_leave(
        &self,
        how: Departure,
        session_id: &SessionId,
        removed: ServiceResult<()>,
    ) -> Outcome<()> {
        {
            let mut core = self.core();
            if let Err(invalid) = core.membership.apply_mut(MembershipEvent::Left) {
                warn!("{invalid}");
            }
            core.session = None;
        }

        let event = match how {
            Departure::Leave => SessionEvent::SessionLeft,
            Departure::KickSelf => SessionEvent::SessionKicked(self.shared.local_id.clone()),
        };
        info!(%session_id, ?how, "left session");
        self.shared.events.publish(event);

        match removed {
            Ok(()) => Outcome::success(()),
            Err(err) => {
                warn!(%session_id, code = err.wire_code(), "remote removal failed: {}", err.message);
                Outcome::warning((), err.code, err.message).with_raw_code(err.raw_code)
            }
        }
    }

    /// Adopt the snapshot returned by a data update.
    fn adopt(&self, epoch: u64, result: ServiceResult<Session>) -> Outcome<Arc<Session>> {
        match result {
            Ok(snapshot) => Outcome::success(self.apply_snapshot(epoch, snapshot)),
            Err(err) => Outcome::from_service(err),
        }
    }

    /// Replace the cached snapshot and publish what changed. Returns the
    /// snapshot whether or not it was applied.
    fn apply_snapshot(&self, epoch: u64, snapshot: Session) -> Arc<Session> {
        let snapshot = Arc::new(snapshot);
        let mut events = {
            let mut core = self.core();
            match self.reconcile(&mut core, epoch, &snapshot) {
                Some(events) => events,
                None => return snapshot,
            }
        };

        // Migration settles right after `HostMigrated`, before the rest.
        let split = events
            .iter()
            .position(|e| matches!(e, SessionEvent::HostMigrated(_)))
            .map(|i| i + 1);
        let rest = split.map(|at| events.split_off(at));

        self.shared.events.publish_all(events);
        if let Some(rest) = rest {
            self.end_host_migration(epoch);
            self.shared.events.publish_all(rest);
        }
        snapshot
    }

    fn reconcile(
        &self,
        core: &mut Core,
        epoch: u64,
        snapshot: &Arc<Session>,
    ) -> Option<Vec<SessionEvent>> {
        if core.epoch != epoch || !core.membership.is_active() {
            debug!(epoch, current = core.epoch, "discarding snapshot from a previous session");
            return None;
        }
        let cached = Arc::clone(core.session.as_ref()?);
        if !cached.is_superseded_by(snapshot) {
            debug!(
                session_id = %snapshot.id,
                version = snapshot.version,
                cached = cached.version,
                "ignoring snapshot of another session or older version"
            );
            return None;
        }

        let local_id = &self.shared.local_id;
        if !snapshot.contains(local_id) {
            if let Err(invalid) = core.membership.apply_mut(MembershipEvent::Kicked) {
                warn!("{invalid}");
            }
            core.clear();
            info!(session_id = %snapshot.id, epoch = core.epoch, "removed from session");
            return Some(vec![SessionEvent::SessionKicked(local_id.clone())]);
        }

        let diff = SnapshotDiff::between(&cached, snapshot);
        core.session = Some(Arc::clone(snapshot));

        if let Some(new_host) = &diff.new_host {
            if let Err(invalid) = core.membership.apply_mut(MembershipEvent::BeginHostMigration) {
                warn!("{invalid}");
            }
            let was_host = cached.is_host(local_id);
            let is_host = snapshot.is_host(local_id);
            if was_host && !is_host {
                core.polling.stop_heartbeat();
            } else if is_host && !was_host {
                self.start_heartbeat(core, &snapshot.id);
            }
            info!(session_id = %snapshot.id, %new_host, local = is_host, "host migrated");
        }

        let mut events = diff.into_events();
        events.push(SessionEvent::SessionRefreshed(Arc::clone(snapshot)));
        Some(events)
    }

    fn end_host_migration(&self, epoch: u64) {
        let mut core = self.core();
        if core.epoch == epoch && core.membership.current() == Membership::HostMigrating {
            if let Err(invalid) = core.membership.apply_mut(MembershipEvent::EndHostMigration) {
                warn!("{invalid}");
            }
        }
    }

    fn apply_failure(&self, epoch: u64, error: ServiceError) {
        {
            let mut core = self.core();
            if core.epoch != epoch || !core.membership.is_active() {
                debug!(epoch, current = core.epoch, "discarding refresh failure from a previous session");
                return;
            }
            if let Err(invalid) = core.membership.apply_mut(MembershipEvent::Lost) {
                warn!("{invalid}");
            }
            core.clear();
            warn!(epoch, code = error.wire_code(), "session lost: {}", error.message);
        }
        self.shared.events.publish(SessionEvent::SessionLost(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_REFRESH_INTERVAL;
    use crate::service::{LoopbackService, ServiceOp};
    use crate::state::session::Visibility;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::{broadcast, Notify};

    fn config() -> SyncConfig {
        SyncConfig::from_ttl(Duration::from_secs(10)).with_refresh_interval(Duration::from_secs(1))
    }

    fn manager(service: &LoopbackService, id: &str) -> SessionManager {
        SessionManager::new(Arc::new(service.clone()), id, config())
    }

    fn named(name: &str) -> DataMap {
        DataMap::new().with("name", name, Visibility::Public)
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(events: &[SessionEvent]) -> Vec<&'static str> {
        events.iter().map(SessionEvent::name).collect()
    }

    /// Let cancelled tasks observe their token.
    async fn settle() {
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
    }

    async fn hosting(service: &LoopbackService) -> SessionManager {
        let manager = manager(service, "a");
        let created = manager
            .create_session("Arena", 4, false, named("A"), DataMap::new())
            .await;
        assert!(created.is_success());
        manager
    }

    /// Send a hand-made refresh result to the manager.
    fn inject(manager: &SessionManager, epoch: u64, session: Session) {
        manager
            .shared
            .updates_tx
            .send(PollUpdate::Refreshed { epoch, session })
            .unwrap();
    }

    /// Holds calls of the chosen operations until released. A held `get`
    /// reaches the inner service first, so it shows up in the call counts.
    #[derive(Clone)]
    struct GatedService {
        inner: LoopbackService,
        held: Arc<Mutex<Vec<ServiceOp>>>,
        gate: Arc<Notify>,
    }

    impl GatedService {
        fn holding(ops: &[ServiceOp]) -> Self {
            Self {
                inner: LoopbackService::new(),
                held: Arc::new(Mutex::new(ops.to_vec())),
                gate: Arc::new(Notify::new()),
            }
        }

        fn hold(&self, op: ServiceOp) {
            self.held.lock().unwrap().push(op);
        }

        fn release(&self) {
            self.held.lock().unwrap().clear();
            self.gate.notify_one();
        }

        async fn pass(&self, op: ServiceOp) {
            let held = self.held.lock().unwrap().contains(&op);
            if held {
                self.gate.notified().await;
            }
        }
    }

    #[async_trait]
    impl SessionService for GatedService {
        async fn create(&self, request: CreateSessionRequest) -> ServiceResult<Session> {
            self.pass(ServiceOp::Create).await;
            self.inner.create(request).await
        }

        async fn join_by_code(&self, code: &str, participant: Participant) -> ServiceResult<Session> {
            self.inner.join_by_code(code, participant).await
        }

        async fn join_by_id(&self, id: &SessionId, participant: Participant) -> ServiceResult<Session> {
            self.inner.join_by_id(id, participant).await
        }

        async fn get(&self, id: &SessionId) -> ServiceResult<Session> {
            let result = self.inner.get(id).await;
            self.pass(ServiceOp::Get).await;
            result
        }

        async fn remove_participant(
            &self,
            session_id: &SessionId,
            participant_id: &ParticipantId,
        ) -> ServiceResult<()> {
            self.inner.remove_participant(session_id, participant_id).await
        }

        async fn update_participant(
            &self,
            session_id: &SessionId,
            participant_id: &ParticipantId,
            patch: &DataPatch,
        ) -> ServiceResult<Session> {
            self.inner
                .update_participant(session_id, participant_id, patch)
                .await
        }

        async fn update_shared(&self, session_id: &SessionId, patch: &DataPatch) -> ServiceResult<Session> {
            self.inner.update_shared(session_id, patch).await
        }

        async fn heartbeat(&self, session_id: &SessionId) -> ServiceResult<()> {
            self.inner.heartbeat(session_id).await
        }

        async fn query(&self, query: &SessionQuery, max_results: usize) -> ServiceResult<Vec<Session>> {
            self.inner.query(query, max_results).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_starts_polling() {
        let service = LoopbackService::new();
        let manager = manager(&service, "a");
        let mut events = manager.events().subscribe_channel();

        let outcome = manager
            .create_session("Arena", 4, false, named("A"), DataMap::new())
            .await;
        let session = outcome.value().cloned().unwrap();

        assert_eq!(manager.membership(), Membership::Active);
        assert!(manager.is_local_host());
        assert!(manager.heartbeat_running());
        assert!(manager.refresh_running());
        assert_eq!(manager.running_tasks(), 2);
        assert_eq!(manager.epoch(), 1);
        assert_eq!(
            manager.local_participant().unwrap().display_name(),
            Some("A")
        );
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::SessionCreated(session)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_preconditions_skip_the_service() {
        let service = LoopbackService::new();
        let manager = manager(&service, "a");

        let left = manager.leave_session().await;
        assert_eq!(left.code(), Some(ErrorCode::NotInSession));
        let kicked = manager.kick_participant("b").await;
        assert_eq!(kicked.code(), Some(ErrorCode::NotInSession));
        let updated = manager.update_shared_data(DataPatch::new()).await;
        assert_eq!(updated.code(), Some(ErrorCode::NotInSession));
        assert!(updated.retry.is_none());

        assert_eq!(service.calls(ServiceOp::RemoveParticipant), 0);
        assert_eq!(service.calls(ServiceOp::UpdateShared), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_create_rejected_while_active() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;

        let again = manager
            .create_session("Other", 2, false, DataMap::new(), DataMap::new())
            .await;
        assert!(again.is_error());
        assert_eq!(again.code(), Some(ErrorCode::AlreadyInSession));
        assert_eq!(service.calls(ServiceOp::Create), 1);
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_offers_retry() {
        let service = LoopbackService::new();
        let manager = manager(&service, "a");
        service.fail_next(
            ServiceOp::Create,
            ServiceError::new(ErrorCode::RateLimited, "slow down"),
        );

        let mut failed = manager
            .create_session("Arena", 4, false, named("A"), DataMap::new())
            .await;
        assert_eq!(failed.code(), Some(ErrorCode::RateLimited));
        assert_eq!(failed.message, "slow down");
        assert_eq!(manager.membership(), Membership::Idle);
        assert_eq!(manager.running_tasks(), 0);

        let retried = failed.take_retry().unwrap().invoke().await;
        assert!(retried.is_success());
        assert_eq!(retried.value().unwrap().name, "Arena");
        assert_eq!(manager.membership(), Membership::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_create_is_discarded() {
        let gated = GatedService::holding(&[ServiceOp::Create]);
        let manager = SessionManager::new(Arc::new(gated.clone()), "a", config());
        let mut events = manager.events().subscribe_channel();

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .create_session("Arena", 4, false, DataMap::new(), DataMap::new())
                    .await
            }
        });
        while !manager.membership().is_pending() {
            tokio::task::yield_now().await;
        }

        let joined = manager.join_by_code("ABC123", DataMap::new()).await;
        assert_eq!(joined.code(), Some(ErrorCode::AlreadyInSession));
        assert_eq!(gated.inner.calls(ServiceOp::JoinByCode), 0);

        let left = manager.leave_session().await;
        assert!(left.is_warning());
        assert_eq!(left.code(), Some(ErrorCode::Abandoned));
        assert_eq!(manager.membership(), Membership::Idle);

        gated.release();
        let created = pending.await.unwrap();
        assert!(created.is_error());
        assert_eq!(created.code(), Some(ErrorCode::Abandoned));
        assert!(created.retry.is_none());

        assert!(manager.session().is_none());
        assert_eq!(manager.membership(), Membership::Idle);
        assert_eq!(manager.running_tasks(), 0);

        settle().await;
        assert_eq!(gated.inner.calls(ServiceOp::RemoveParticipant), 1);
        assert_eq!(gated.inner.session_count(), 0);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_stops_everything() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;
        let mut events = manager.events().subscribe_channel();

        let left = manager.leave_session().await;
        assert!(left.is_success());
        assert_eq!(manager.membership(), Membership::Idle);
        assert!(manager.session().is_none());
        assert_eq!(manager.running_tasks(), 0);
        assert_eq!(manager.epoch(), 2);
        assert_eq!(service.session_count(), 0);
        assert_eq!(names(&drain(&mut events)), vec!["SessionLeft"]);

        let again = manager.leave_session().await;
        assert_eq!(again.code(), Some(ErrorCode::NotInSession));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_with_failed_removal_still_clears() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;
        let mut events = manager.events().subscribe_channel();
        service.fail_next(ServiceOp::RemoveParticipant, ServiceError::network("offline"));

        let left = manager.leave_session().await;
        assert!(left.is_warning());
        assert_eq!(left.code(), Some(ErrorCode::NetworkUnavailable));
        assert_eq!(manager.membership(), Membership::Idle);
        assert_eq!(manager.running_tasks(), 0);
        assert_eq!(names(&drain(&mut events)), vec!["SessionLeft"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_self_leaves_with_kicked_event() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;
        let mut events = manager.events().subscribe_channel();

        let kicked = manager.kick_participant("a").await;
        assert!(kicked.is_success());
        assert_eq!(manager.membership(), Membership::Idle);
        assert_eq!(manager.running_tasks(), 0);
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::SessionKicked(ParticipantId::from("a"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_refresh_is_discarded() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;
        let mut events = manager.events().subscribe_channel();

        let mut snapshot = (*manager.session().unwrap()).clone();
        snapshot.version += 5;
        snapshot.name = "Hijacked".to_string();
        inject(&manager, manager.epoch() - 1, snapshot);

        assert_eq!(manager.tick(), 1);
        assert_eq!(manager.session().unwrap().name, "Arena");
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outdated_version_is_ignored() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;

        let mut snapshot = (*manager.session().unwrap()).clone();
        snapshot.version -= 1;
        snapshot.name = "Old".to_string();
        inject(&manager, manager.epoch(), snapshot);

        manager.tick();
        assert_eq!(manager.session().unwrap().name, "Arena");
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_of_another_session_is_ignored() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;
        let mut events = manager.events().subscribe_channel();
        let cached = manager.session().unwrap();

        let mut snapshot = (*cached).clone();
        snapshot.id = SessionId::new("elsewhere");
        snapshot.version += 5;
        inject(&manager, manager.epoch(), snapshot);

        assert_eq!(manager.tick(), 1);
        assert_eq!(manager.session().unwrap().id, cached.id);
        assert_eq!(manager.session().unwrap().version, cached.version);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_without_local_participant_is_a_kick() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;
        let mut events = manager.events().subscribe_channel();

        let mut snapshot = (*manager.session().unwrap()).clone();
        snapshot.version += 1;
        snapshot.participants.retain(|p| p.id.as_str() != "a");
        inject(&manager, manager.epoch(), snapshot);

        manager.tick();
        assert_eq!(manager.membership(), Membership::Idle);
        assert!(manager.session().is_none());
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::SessionKicked(ParticipantId::from("a"))]
        );

        settle().await;
        assert_eq!(manager.running_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_migration_away_stops_heartbeat() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;
        let mut events = manager.events().subscribe_channel();

        let mut snapshot = (*manager.session().unwrap()).clone();
        snapshot.version += 1;
        snapshot.participants.push(Participant::new("b".into(), named("B")));
        snapshot.host_id = ParticipantId::from("b");
        inject(&manager, manager.epoch(), snapshot);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = manager.events().subscribe({
            let seen = Arc::clone(&seen);
            let manager = manager.clone();
            move |event| {
                if matches!(event, SessionEvent::HostMigrated(_)) {
                    seen.lock().unwrap().push(manager.membership());
                }
            }
        });

        manager.tick();
        assert_eq!(
            names(&drain(&mut events)),
            vec!["ParticipantJoined", "HostMigrated", "SessionRefreshed"]
        );
        assert_eq!(*seen.lock().unwrap(), vec![Membership::HostMigrating]);
        assert_eq!(manager.membership(), Membership::Active);
        assert!(!manager.is_local_host());
        assert!(!manager.heartbeat_running());
        assert!(manager.refresh_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_loses_session() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;
        let mut events = manager.events().subscribe_channel();
        service.fail_next(ServiceOp::Get, ServiceError::not_found("gone"));

        assert!(manager.process_next().await);
        assert_eq!(manager.membership(), Membership::Idle);
        assert!(manager.session().is_none());
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::SessionLost(ServiceError::not_found("gone"))]
        );

        settle().await;
        assert_eq!(manager.running_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_shared_applies_returned_snapshot() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;
        let mut events = manager.events().subscribe_channel();

        let outcome = manager
            .update_shared_data(DataPatch::new().set("map", "docks", Visibility::Public))
            .await;
        let session = outcome.value().cloned().unwrap();
        assert_eq!(session.version, 2);
        assert_eq!(session.shared_data.value("map"), Some("docks"));
        assert_eq!(manager.session().unwrap().version, 2);
        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::SharedDataChanged {
                    key: "map".to_string(),
                    old_value: None,
                    new_value: Some("docks".to_string()),
                },
                SessionEvent::SessionRefreshed(session),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_participant_failure_keeps_cache() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;
        service.fail_next(
            ServiceOp::UpdateParticipant,
            ServiceError::new(ErrorCode::VersionConflict, "stale"),
        );

        let mut outcome = manager
            .update_participant_data("a", DataPatch::new().set("ready", "true", Visibility::Member))
            .await;
        assert_eq!(outcome.code(), Some(ErrorCode::VersionConflict));
        assert_eq!(manager.session().unwrap().version, 1);

        let retried = outcome.take_retry().unwrap().invoke().await;
        assert!(retried.is_success());
        assert_eq!(
            manager
                .local_participant()
                .unwrap()
                .data
                .flag("ready"),
            Some(true)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_needs_no_session() {
        let service = LoopbackService::new();
        let _host = hosting(&service).await;
        let browser = manager(&service, "z");

        let found = browser
            .query_sessions(SessionQuery::new().name_contains("arena"), 10)
            .await;
        assert_eq!(found.value().unwrap().len(), 1);
        assert_eq!(browser.membership(), Membership::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_refresh_interval_is_normalized() {
        let service = LoopbackService::new();
        let config = SyncConfig::default().with_refresh_interval(Duration::ZERO);
        let manager = SessionManager::new(Arc::new(service.clone()), "a", config);
        assert_eq!(manager.config().refresh_interval, DEFAULT_REFRESH_INTERVAL);

        let created = manager
            .create_session("Arena", 4, false, named("A"), DataMap::new())
            .await;
        assert!(created.is_success());
        assert!(manager.refresh_running());

        assert!(manager.process_next().await);
        assert_eq!(manager.membership(), Membership::Active);
        assert!(manager.refresh_running());
        assert_eq!(manager.running_tasks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_waits_for_previous_refresh() {
        let gated = GatedService::holding(&[]);
        let manager = SessionManager::new(Arc::new(gated.clone()), "a", config());
        let created = manager
            .create_session("Arena", 4, false, named("A"), DataMap::new())
            .await;
        assert!(created.is_success());

        // Park the refresh task inside its next `get`.
        gated.hold(ServiceOp::Get);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        while gated.inner.calls(ServiceOp::Get) == 0 {
            tokio::task::yield_now().await;
        }

        let mut snapshot = (*manager.session().unwrap()).clone();
        snapshot.version += 1;
        snapshot.participants.retain(|p| p.id.as_str() != "a");
        inject(&manager, manager.epoch(), snapshot);
        assert_eq!(manager.tick(), 1);
        assert_eq!(manager.membership(), Membership::Idle);
        assert!(manager.running_tasks() >= 1);

        let again = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .create_session("Arena II", 4, false, named("A"), DataMap::new())
                    .await
            }
        });
        settle().await;
        assert!(!again.is_finished());
        assert!(manager.membership().is_pending());
        assert_eq!(gated.inner.calls(ServiceOp::Create), 1);
        assert!(!manager.refresh_running());

        gated.release();
        let again = again.await.unwrap();
        assert!(again.is_success());
        assert_eq!(gated.inner.calls(ServiceOp::Create), 2);
        assert_eq!(manager.membership(), Membership::Active);
        assert_eq!(manager.running_tasks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_inside_process_next_waits_its_turn() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;

        let inner = Arc::new(Mutex::new(Vec::new()));
        let _subscription = manager.events().subscribe({
            let inner = Arc::clone(&inner);
            let manager = manager.clone();
            move |event| {
                if matches!(event, SessionEvent::SessionRefreshed(_)) {
                    inner.lock().unwrap().push(manager.tick());
                }
            }
        });

        let snapshot = (*manager.session().unwrap()).clone();
        inject(&manager, manager.epoch(), snapshot.clone());
        inject(&manager, manager.epoch(), snapshot);

        assert!(manager.process_next().await);
        assert_eq!(*inner.lock().unwrap(), vec![0]);

        assert_eq!(manager.tick(), 1);
        assert_eq!(*inner.lock().unwrap(), vec![0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentrant_tick_is_a_no_op() {
        let service = LoopbackService::new();
        let manager = hosting(&service).await;

        let inner = Arc::new(Mutex::new(None));
        let _subscription = manager.events().subscribe({
            let inner = Arc::clone(&inner);
            let manager = manager.clone();
            move |event| {
                if matches!(event, SessionEvent::SessionRefreshed(_)) {
                    *inner.lock().unwrap() = Some(manager.tick());
                }
            }
        });

        let snapshot = (*manager.session().unwrap()).clone();
        inject(&manager, manager.epoch(), snapshot);
        assert_eq!(manager.tick(), 1);
        assert_eq!(*inner.lock().unwrap(), Some(0));
    }
}
