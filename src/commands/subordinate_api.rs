use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::{Orchestrator, Shared};
use crate::error::{SessionError, SessionResult};
use crate::peer::types::{ConnectionSnapshot, PeerId, Role};
use crate::session::SessionNegotiator;
use crate::signaling::{Envelope, Signal, SignalHandler, SignalSink};

const REJECTED_REASON: &str = "connection rejected";

impl Orchestrator {
    /// Ученик: offer учителю. Живая сессия или незавершённый `connect`
    /// дают `AlreadyActive`, завершённая (failed/closed) сессия заменяется новой.
    /// `disconnect` во время создания движка отменяет попытку: `NoSession`.
    pub async fn connect(&self, coordinator: &PeerId) -> SessionResult<()> {
        let shared = &self.shared;
        shared.ensure_role(Role::Subordinate)?;
        let attempt = {
            let mut slot = shared.local.lock();
            let busy = slot.connecting.is_some()
                || slot
                    .session
                    .as_ref()
                    .is_some_and(|current| !current.state().is_terminal());
            if busy {
                return Err(SessionError::AlreadyActive);
            }
            slot.attempts += 1;
            slot.connecting = Some(slot.attempts);
            slot.attempts
        };

        let local = shared.local_id().clone();
        let engine = match shared.factory.create(&local, true).await {
            Ok(engine) => engine,
            Err(err) => {
                let mut slot = shared.local.lock();
                if slot.connecting == Some(attempt) {
                    slot.connecting = None;
                }
                return Err(err.into());
            }
        };
        let sink = SignalSink::new(shared.bus.clone(), local.clone(), coordinator.clone());
        let negotiator = Arc::new(SessionNegotiator::new(
            local,
            Role::Subordinate,
            engine,
            sink,
        ));

        let installed = {
            let mut slot = shared.local.lock();
            if slot.connecting == Some(attempt) {
                slot.connecting = None;
                Some(slot.session.replace(negotiator.clone()))
            } else {
                None
            }
        };
        let Some(previous) = installed else {
            info!(coordinator = %coordinator, "disconnected while the engine was created");
            negotiator.close().await;
            return Err(SessionError::NoSession);
        };
        if let Some(previous) = previous {
            previous.close().await;
        }
        *shared.last_rejection.lock() = None;
        let early = shared.early.lock().take(coordinator);
        negotiator.seed_candidates(early);

        info!(coordinator = %coordinator, connection = negotiator.connection_id(), "connecting to coordinator");
        if let Err(err) = negotiator.initiate().await {
            warn!(coordinator = %coordinator, error = %err, "failed to start negotiation");
            release_if_current(shared, &negotiator).await;
            return Err(err);
        }
        Ok(())
    }

    /// Закрывает локальную сессию. Без сессии ничего не делает.
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.shared.ensure_role(Role::Subordinate)?;
        drop_local(&self.shared).await;
        Ok(())
    }

    pub fn local_session(&self) -> SessionResult<ConnectionSnapshot> {
        self.shared
            .local_session()
            .map(|negotiator| negotiator.snapshot())
            .ok_or(SessionError::NoSession)
    }
}

/// Закрывает сессию ученика и отменяет `connect`, ждущий движок
pub(super) async fn drop_local(shared: &Shared) {
    let taken = {
        let mut slot = shared.local.lock();
        if slot.connecting.take().is_some() {
            debug!("pending connect cancelled");
        }
        slot.session.take()
    };
    shared.early.lock().clear();
    if let Some(negotiator) = taken {
        info!(coordinator = %negotiator.counterpart(), "disconnecting from coordinator");
        negotiator.close().await;
    }
}

async fn release_if_current(shared: &Shared, negotiator: &Arc<SessionNegotiator>) {
    let removed = {
        let mut slot = shared.local.lock();
        if slot
            .session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, negotiator))
        {
            slot.session.take()
        } else {
            None
        }
    };
    if let Some(removed) = removed {
        removed.close().await;
    }
}

/// Локальная сессия, если она ведётся именно с этим собеседником
fn session_with(shared: &Shared, peer: &PeerId) -> Option<Arc<SessionNegotiator>> {
    shared
        .local_session()
        .filter(|negotiator| negotiator.counterpart() == peer)
}

/// Входящие сообщения ученика (от учителя)
pub(super) struct SubordinateHandler {
    pub(super) shared: Weak<Shared>,
}

#[async_trait]
impl SignalHandler for SubordinateHandler {
    async fn on_signal(&self, envelope: Envelope) -> SessionResult<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let from = envelope.from;
        let signal = Signal::from_message(&envelope.message)?;
        debug!(from = %from, action = signal.action(), "subordinate received signal");

        match signal {
            Signal::Answer(answer) => {
                let Some(negotiator) = session_with(&shared, &from) else {
                    debug!(from = %from, "answer without matching session, ignoring");
                    return Ok(());
                };
                match negotiator.accept_answer(answer).await {
                    Err(SessionError::InvalidState { op, state }) => {
                        warn!(from = %from, op, state = %state, "out of order answer ignored");
                        Ok(())
                    }
                    other => other,
                }
            }
            Signal::Candidate(candidate) => match session_with(&shared, &from) {
                Some(negotiator) => negotiator.submit_remote_candidate(candidate).await,
                None => {
                    debug!(from = %from, "candidate before local session, holding it back");
                    shared.early.lock().push(&from, candidate);
                    Ok(())
                }
            },
            Signal::ServerStarted { message } => {
                info!(from = %from, message = ?message, "coordinator announced start");
                *shared.server_notice.lock() =
                    Some(message.unwrap_or_else(|| from.to_string()));
                Ok(())
            }
            Signal::ServerStopped { message } => {
                info!(from = %from, message = ?message, "coordinator stopped serving");
                if session_with(&shared, &from).is_some() {
                    drop_local(&shared).await;
                }
                Ok(())
            }
            Signal::ConnectionRejected { message } => {
                let reason = message.unwrap_or_else(|| REJECTED_REASON.to_string());
                warn!(from = %from, reason = %reason, "connection rejected by coordinator");
                if session_with(&shared, &from).is_some() {
                    *shared.last_rejection.lock() = Some(reason);
                    drop_local(&shared).await;
                }
                Ok(())
            }
            Signal::Offer(_) => {
                debug!(from = %from, "offer is not for subordinate, ignoring");
                Ok(())
            }
            Signal::Unknown(action) => {
                warn!(from = %from, action = %action, "unrecognized action");
                Ok(())
            }
        }
    }
}
