use async_trait::async_trait;
use std::sync::Weak;
use tracing::{debug, info, warn};

use super::{Orchestrator, Shared};
use crate::error::{SessionError, SessionResult};
use crate::peer::types::{ConnectionSnapshot, Role, SessionId};
use crate::signaling::{Delivery, Envelope, Signal, SignalHandler};

const SERVER_STARTED_NOTICE: &str = "server started";
const SERVER_STOPPED_NOTICE: &str = "server stopped";
const NOT_SERVING_REASON: &str = "server not started";

impl Orchestrator {
    /// Учитель начинает принимать offer. Повторный вызов ничего не делает.
    pub async fn start_serving(&self) -> SessionResult<()> {
        let shared = &self.shared;
        shared.ensure_role(Role::Coordinator)?;
        if !shared.registry.open() {
            debug!("already serving");
            return Ok(());
        }
        let notified = shared.bus.broadcast(
            shared.coordinator_id(),
            Role::Subordinate,
            &Signal::ServerStarted {
                message: Some(SERVER_STARTED_NOTICE.into()),
            },
        );
        info!(coordinator = %shared.coordinator_id(), notified, "server started");
        Ok(())
    }

    /// Закрывает все сессии и сообщает ученикам. Идемпотентно.
    pub async fn stop_serving(&self) -> SessionResult<()> {
        self.shared.ensure_role(Role::Coordinator)?;
        stop(&self.shared).await;
        Ok(())
    }

    pub async fn close_session(&self, session: &SessionId) -> SessionResult<bool> {
        self.shared.ensure_role(Role::Coordinator)?;
        Ok(self.shared.registry.close_one(session).await)
    }

    /// Все сессии учителя, включая ещё не соединённые
    pub fn list_sessions(&self) -> Vec<ConnectionSnapshot> {
        self.shared.registry.list_all()
    }
}

pub(super) async fn stop(shared: &Shared) {
    if shared.registry.close_all().await {
        let notified = shared.bus.broadcast(
            shared.coordinator_id(),
            Role::Subordinate,
            &Signal::ServerStopped {
                message: Some(SERVER_STOPPED_NOTICE.into()),
            },
        );
        info!(coordinator = %shared.coordinator_id(), notified, "server stopped");
    }
}

/// Входящие сообщения учителя (от учеников)
pub(super) struct CoordinatorHandler {
    pub(super) shared: Weak<Shared>,
}

#[async_trait]
impl SignalHandler for CoordinatorHandler {
    async fn on_signal(&self, envelope: Envelope) -> SessionResult<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let from = envelope.from;
        let signal = Signal::from_message(&envelope.message)?;
        debug!(from = %from, action = signal.action(), "coordinator received signal");

        match signal {
            Signal::Offer(offer) => {
                match shared.registry.handle_inbound_offer(from.clone(), offer).await {
                    Err(SessionError::NotServing) => {
                        warn!(from = %from, "offer while not serving, rejecting");
                        let reply = Signal::ConnectionRejected {
                            message: Some(NOT_SERVING_REASON.into()),
                        };
                        if shared.bus.send_signal(shared.coordinator_id(), &from, &reply)
                            == Delivery::Discarded
                        {
                            debug!(to = %from, "rejection discarded");
                        }
                        Ok(())
                    }
                    other => other,
                }
            }
            Signal::Candidate(candidate) => {
                shared
                    .registry
                    .handle_inbound_candidate(&from, candidate)
                    .await
            }
            Signal::Answer(_)
            | Signal::ServerStarted { .. }
            | Signal::ServerStopped { .. }
            | Signal::ConnectionRejected { .. } => {
                debug!(from = %from, action = %envelope.message.action, "not for coordinator, ignoring");
                Ok(())
            }
            Signal::Unknown(action) => {
                warn!(from = %from, action = %action, "unrecognized action");
                Ok(())
            }
        }
    }
}
