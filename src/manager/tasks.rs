//! Heartbeat and refresh polling tasks.
//!
//! Both loops only read: the heartbeat pings the service, the refresh loop
//! forwards snapshots to the owning manager over a channel. Neither touches
//! manager state. Cancellation is cooperative and checked while waiting for
//! the next tick; an in-flight service call always runs to completion.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MIN_POLL_PERIOD;
use crate::error::ServiceError;
use crate::service::SessionService;
use crate::state::session::{Session, SessionId};

/// Result of one refresh tick, tagged with the epoch the task started in.
#[derive(Debug)]
pub(crate) enum PollUpdate {
    Refreshed { epoch: u64, session: Session },
    RefreshFailed { epoch: u64, error: ServiceError },
}

/// A spawned polling loop and its stop signal.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    name: &'static str,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the loop and wait until it has fully exited.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            warn!(task = self.name, "polling task ended abnormally: {err}");
        }
    }
}

/// The heartbeat/refresh pair for the active session, plus cancelled tasks
/// that have not been awaited yet.
#[derive(Debug, Default)]
pub(crate) struct Polling {
    heartbeat: Option<TaskHandle>,
    refresh: Option<TaskHandle>,
    draining: Vec<TaskHandle>,
}

impl Polling {
    pub(crate) fn heartbeat_running(&self) -> bool {
        self.heartbeat.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub(crate) fn refresh_running(&self) -> bool {
        self.refresh.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Tasks that have not exited yet, cancelled or not.
    pub(crate) fn running(&self) -> usize {
        self.heartbeat
            .iter()
            .chain(self.refresh.iter())
            .chain(self.draining.iter())
            .filter(|t| !t.is_finished())
            .count()
    }

    pub(crate) fn set_heartbeat(&mut self, task: TaskHandle) {
        self.stop_heartbeat();
        self.heartbeat = Some(task);
    }

    pub(crate) fn set_refresh(&mut self, task: TaskHandle) {
        if let Some(old) = self.refresh.replace(task) {
            old.cancel();
            self.draining.push(old);
        }
    }

    /// Cancel the heartbeat without waiting for it.
    pub(crate) fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.cancel();
            self.draining.push(task);
        }
    }

    /// Cancel everything without waiting. The handles stay in `draining`
    /// until someone awaits them.
    pub(crate) fn cancel_all(&mut self) {
        self.stop_heartbeat();
        if let Some(task) = self.refresh.take() {
            task.cancel();
            self.draining.push(task);
        }
    }

    /// Cancel everything and hand the handles over for awaiting.
    pub(crate) fn take_all(&mut self) -> Vec<TaskHandle> {
        self.cancel_all();
        std::mem::take(&mut self.draining)
    }

    /// Hand over cancelled handles for awaiting.
    pub(crate) fn take_draining(&mut self) -> Vec<TaskHandle> {
        std::mem::take(&mut self.draining)
    }

    /// Forget cancelled tasks that already exited.
    pub(crate) fn reap(&mut self) {
        self.draining.retain(|t| !t.is_finished());
    }
}

/// Wait until every handle has exited.
pub(crate) async fn stop_all(tasks: Vec<TaskHandle>) {
    for task in tasks {
        task.stop().await;
    }
}

/// Periods below [`MIN_POLL_PERIOD`] are raised to it.
fn ticker(period: Duration) -> time::Interval {
    let period = period.max(MIN_POLL_PERIOD);
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub(crate) fn spawn_heartbeat(
    runtime: &Handle,
    service: Arc<dyn SessionService>,
    session_id: SessionId,
    period: Duration,
) -> TaskHandle {
    let cancel = CancellationToken::new();
    let join = runtime.spawn(heartbeat_loop(service, session_id, period, cancel.clone()));
    TaskHandle {
        name: "heartbeat",
        cancel,
        join,
    }
}

pub(crate) fn spawn_refresh(
    runtime: &Handle,
    service: Arc<dyn SessionService>,
    session_id: SessionId,
    epoch: u64,
    period: Duration,
    updates: mpsc::UnboundedSender<PollUpdate>,
) -> TaskHandle {
    let cancel = CancellationToken::new();
    let join = runtime.spawn(refresh_loop(
        service,
        session_id,
        epoch,
        period,
        updates,
        cancel.clone(),
    ));
    TaskHandle {
        name: "refresh",
        cancel,
        join,
    }
}

/// Ping the service every `period`. Failures are logged; the session's
/// fate is decided by the refresh loop.
async fn heartbeat_loop(
    service: Arc<dyn SessionService>,
    session_id: SessionId,
    period: Duration,
    cancel: CancellationToken,
) {
    debug!(%session_id, ?period, "heartbeat started");
    let mut ticker = ticker(period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(err) = service.heartbeat(&session_id).await {
            warn!(%session_id, code = err.wire_code(), "heartbeat failed: {}", err.message);
        }
    }

    debug!(%session_id, "heartbeat stopped");
}

/// Pull the snapshot every `period` and forward it. Stops after the first
/// failure; the owner turns that into session loss.
async fn refresh_loop(
    service: Arc<dyn SessionService>,
    session_id: SessionId,
    epoch: u64,
    period: Duration,
    updates: mpsc::UnboundedSender<PollUpdate>,
    cancel: CancellationToken,
) {
    debug!(%session_id, epoch, ?period, "refresh started");
    let mut ticker = ticker(period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let update = match service.get(&session_id).await {
            Ok(session) => PollUpdate::Refreshed { epoch, session },
            Err(error) => PollUpdate::RefreshFailed { epoch, error },
        };
        let failed = matches!(update, PollUpdate::RefreshFailed { .. });

        if cancel.is_cancelled() {
            debug!(%session_id, epoch, "refresh cancelled mid-call, discarding result");
            break;
        }
        // The receiver lives as long as the manager.
        if updates.send(update).is_err() || failed {
            break;
        }
    }

    debug!(%session_id, epoch, "refresh stopped");
}
