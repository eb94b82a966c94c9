use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::peer::engine::EngineFactory;
use crate::peer::ice::OrphanCandidates;
use crate::peer::state::NegotiationState;
use crate::peer::types::{ConnectionSnapshot, IceCandidate, PeerId, Role, SessionDescription, SessionId};
use crate::session::SessionNegotiator;
use crate::signaling::{SignalSink, SignalingBus};

#[derive(Default)]
struct Entries {
    sessions: HashMap<SessionId, Arc<SessionNegotiator>>,
    /// Офферы, чей движок ещё создаётся: сессия и номер попытки
    pending: HashMap<SessionId, u64>,
    attempts: u64,
    open: bool,
}

impl Entries {
    /// Снимает попытку с ожидания; false, если её уже отменили или вытеснили
    fn finish_attempt(&mut self, session: &SessionId, attempt: u64) -> bool {
        if self.pending.get(session) == Some(&attempt) {
            self.pending.remove(session);
            true
        } else {
            false
        }
    }
}

/// Реестр сессий учителя: по одному переговорщику на ученика.
/// Единственный владелец записей; карта никогда не блокируется через `.await`.
/// Offer принимается только между `open` и `close_all`.
pub struct SessionRegistry {
    local: PeerId,
    bus: SignalingBus,
    factory: Arc<dyn EngineFactory>,
    entries: Mutex<Entries>,
    orphans: Mutex<OrphanCandidates>,
}

impl SessionRegistry {
    /// Реестр создаётся закрытым
    pub fn new(
        local: PeerId,
        bus: SignalingBus,
        factory: Arc<dyn EngineFactory>,
        orphan_ttl: Duration,
    ) -> Self {
        Self {
            local,
            bus,
            factory,
            entries: Mutex::new(Entries::default()),
            orphans: Mutex::new(OrphanCandidates::new(orphan_ttl)),
        }
    }

    /// true, если реестр был закрыт и теперь открыт
    pub fn open(&self) -> bool {
        let mut entries = self.entries.lock();
        !std::mem::replace(&mut entries.open, true)
    }

    pub fn is_open(&self) -> bool {
        self.entries.lock().open
    }

    /// Новый offer заменяет существующую сессию: старая закрывается первой.
    /// Попытка, отменённая пока создавался движок, закрывает свой переговорщик
    /// и в реестр не попадает.
    pub async fn handle_inbound_offer(
        &self,
        session: SessionId,
        offer: SessionDescription,
    ) -> SessionResult<()> {
        let (attempt, previous) = {
            let mut entries = self.entries.lock();
            if !entries.open {
                return Err(SessionError::NotServing);
            }
            entries.attempts += 1;
            let attempt = entries.attempts;
            entries.pending.insert(session.clone(), attempt);
            (attempt, entries.sessions.remove(&session))
        };
        if let Some(previous) = previous {
            info!(session = %session, connection = previous.connection_id(), "replacing existing session");
            previous.close().await;
        }

        let engine = match self.factory.create(&session, false).await {
            Ok(engine) => engine,
            Err(err) => {
                self.entries.lock().finish_attempt(&session, attempt);
                return Err(err.into());
            }
        };
        let sink = SignalSink::new(self.bus.clone(), self.local.clone(), session.clone());
        let negotiator = Arc::new(SessionNegotiator::new(
            session.clone(),
            Role::Coordinator,
            engine,
            sink,
        ));
        let early = self.orphans.lock().take(&session);
        negotiator.seed_candidates(early);

        let admitted = {
            let mut entries = self.entries.lock();
            if entries.finish_attempt(&session, attempt) && entries.open {
                Some(entries.sessions.insert(session.clone(), negotiator.clone()))
            } else {
                None
            }
        };
        let Some(stale) = admitted else {
            info!(session = %session, "session torn down while its engine was created");
            negotiator.close().await;
            return Ok(());
        };
        if let Some(stale) = stale {
            stale.close().await;
        }

        match negotiator.accept_offer(offer).await {
            Ok(()) => {
                info!(session = %session, "offer accepted, answer sent");
                Ok(())
            }
            Err(err) => {
                warn!(session = %session, error = %err, "failed to accept offer");
                let removed = {
                    let mut entries = self.entries.lock();
                    let current = entries
                        .sessions
                        .get(&session)
                        .is_some_and(|entry| Arc::ptr_eq(entry, &negotiator));
                    if current {
                        entries.sessions.remove(&session)
                    } else {
                        None
                    }
                };
                if let Some(removed) = removed {
                    removed.close().await;
                }
                Err(err)
            }
        }
    }

    /// Без сессии кандидат не ошибка: он откладывается на случай позднего offer.
    /// Закрытый реестр кандидаты не копит.
    pub async fn handle_inbound_candidate(
        &self,
        session: &SessionId,
        candidate: IceCandidate,
    ) -> SessionResult<()> {
        let negotiator = {
            let entries = self.entries.lock();
            if !entries.open {
                debug!(session = %session, "candidate while closed, ignoring");
                return Ok(());
            }
            entries.sessions.get(session).cloned()
        };
        match negotiator {
            Some(negotiator) => negotiator.submit_remote_candidate(candidate).await,
            None => {
                debug!(session = %session, "candidate for unknown session, holding it back");
                self.orphans.lock().push(session, candidate);
                Ok(())
            }
        }
    }

    /// Сессии с рабочим ICE (connected/completed)
    pub fn list_active(&self) -> Vec<ConnectionSnapshot> {
        self.list_all()
            .into_iter()
            .filter(ConnectionSnapshot::is_active)
            .collect()
    }

    pub fn list_all(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .entries
            .lock()
            .sessions
            .values()
            .map(|negotiator| negotiator.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    pub fn get(&self, session: &SessionId) -> Option<ConnectionSnapshot> {
        self.entries
            .lock()
            .sessions
            .get(session)
            .map(|negotiator| negotiator.snapshot())
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.entries.lock().sessions.contains_key(session)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().sessions.is_empty()
    }

    /// Возвращает true, если сессия была (в том числе ещё без движка)
    pub async fn close_one(&self, session: &SessionId) -> bool {
        let (removed, cancelled) = {
            let mut entries = self.entries.lock();
            (
                entries.sessions.remove(session),
                entries.pending.remove(session).is_some(),
            )
        };
        if cancelled {
            debug!(session = %session, "pending offer cancelled");
        }
        match removed {
            Some(negotiator) => {
                negotiator.close().await;
                true
            }
            None => cancelled,
        }
    }

    /// Закрывает реестр и всё, что в нём есть: следующий `open` начинается
    /// с чистого листа. Возвращает true, если реестр был открыт.
    pub async fn close_all(&self) -> bool {
        let (was_open, drained) = {
            let mut entries = self.entries.lock();
            let was_open = std::mem::replace(&mut entries.open, false);
            entries.pending.clear();
            let drained: Vec<Arc<SessionNegotiator>> = entries
                .sessions
                .drain()
                .map(|(_, negotiator)| negotiator)
                .collect();
            (was_open, drained)
        };
        self.orphans.lock().clear();
        if !drained.is_empty() {
            info!(count = drained.len(), "closing all sessions");
        }
        for negotiator in drained {
            negotiator.close().await;
        }
        was_open
    }

    /// Перечитывает движки и убирает сессии в failed. Возвращает число убранных.
    pub async fn refresh(&self) -> usize {
        let negotiators: Vec<Arc<SessionNegotiator>> =
            self.entries.lock().sessions.values().cloned().collect();
        for negotiator in &negotiators {
            negotiator.refresh();
        }

        let failed: Vec<Arc<SessionNegotiator>> = {
            let mut entries = self.entries.lock();
            let ids: Vec<SessionId> = entries
                .sessions
                .iter()
                .filter(|(_, n)| n.state() == NegotiationState::Failed)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.sessions.remove(id)).collect()
        };
        for negotiator in &failed {
            warn!(session = %negotiator.session_id(), "reaping failed session");
            negotiator.close().await;
        }
        self.orphans.lock().prune();
        failed.len()
    }
}
