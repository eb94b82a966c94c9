use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::peer::engine::{EngineError, EngineEvent, EngineEvents, TransportEngine};
use crate::peer::ice::PendingCandidates;
use crate::peer::state::NegotiationState;
use crate::peer::types::{
    ConnectionSnapshot, DataChannelState, IceCandidate, Role, SessionDescription, SessionId,
    TransportStatus,
};
use crate::signaling::{Delivery, Signal, SignalSink};
use crate::utils::random_id;

struct NegotiatorInner {
    state: NegotiationState,
    history: Vec<NegotiationState>,
    /// Идёт шаг, который ждёт движок; второй параллельный шаг отклоняется
    step_in_flight: bool,
    remote_applied: bool,
    pending: PendingCandidates,
    transport: TransportStatus,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    failure: Option<String>,
}

impl NegotiatorInner {
    fn advance(&mut self, session: &SessionId, next: NegotiationState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!(session = %session, from = %self.state, to = %next, "transition refused");
            return false;
        }
        debug!(session = %session, from = %self.state, to = %next, "negotiation transition");
        self.state = next;
        self.history.push(next);
        if next == NegotiationState::Connected {
            self.connected_at = Some(Utc::now());
        }
        true
    }

    fn fail(&mut self, session: &SessionId, reason: String) {
        if self.advance(session, NegotiationState::Failed) {
            warn!(session = %session, reason = %reason, "negotiation failed");
            self.failure = Some(reason);
            self.pending.clear();
        }
    }

    /// Выводы из состояния транспорта: терминальный отказ и установленное соединение
    fn settle(&mut self, session: &SessionId) {
        if self.state.is_terminal() {
            return;
        }
        if self.transport.is_failed() {
            self.fail(session, "transport reported failure".into());
            return;
        }
        if self.state == NegotiationState::Connecting && self.transport.connectivity.is_connected()
        {
            self.advance(session, NegotiationState::Connected);
            info!(session = %session, "session connected");
        }
    }

    fn apply_event(&mut self, session: &SessionId, event: &EngineEvent) {
        match event {
            EngineEvent::ConnectionStateChanged(state) => self.transport.connection = *state,
            EngineEvent::ConnectivityStateChanged(state) => self.transport.connectivity = *state,
            EngineEvent::DataChannelStateChanged(state) => {
                self.transport.data_channel = Some(*state)
            }
            EngineEvent::LocalCandidate(_) => return,
        }
        self.settle(session);
    }
}

/// Ведёт одну сессию через offer/answer против своего движка.
/// Владеет движком целиком; события движка читает отдельная задача,
/// которую `close()` снимает синхронно.
pub struct SessionNegotiator {
    session_id: SessionId,
    role: Role,
    connection_id: String,
    engine: Arc<dyn TransportEngine>,
    outbound: SignalSink,
    inner: Arc<Mutex<NegotiatorInner>>,
    events: Mutex<Option<JoinHandle<()>>>,
}

impl SessionNegotiator {
    /// Подписывается на события движка сразу; требует рантайм tokio
    pub fn new(
        session_id: SessionId,
        role: Role,
        engine: Arc<dyn TransportEngine>,
        outbound: SignalSink,
    ) -> Self {
        let inner = Arc::new(Mutex::new(NegotiatorInner {
            state: NegotiationState::New,
            history: vec![NegotiationState::New],
            step_in_flight: false,
            remote_applied: false,
            pending: PendingCandidates::default(),
            transport: engine.status(),
            created_at: Utc::now(),
            connected_at: None,
            failure: None,
        }));
        let events = engine.subscribe();
        let task = tokio::spawn(pump_events(
            session_id.clone(),
            events,
            inner.clone(),
            outbound.clone(),
        ));
        let connection_id = format!("{}-{}-{}", role, session_id, random_id());
        debug!(session = %session_id, role = %role, connection = %connection_id, "negotiator created");

        Self {
            session_id,
            role,
            connection_id,
            engine,
            outbound,
            inner,
            events: Mutex::new(Some(task)),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn counterpart(&self) -> &SessionId {
        self.outbound.counterpart()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> NegotiationState {
        self.inner.lock().state
    }

    /// Пройденные состояния по порядку, начиная с `new`
    pub fn transitions(&self) -> Vec<NegotiationState> {
        self.inner.lock().history.clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Кладёт кандидаты в очередь до применения remote description
    pub fn seed_candidates(&self, candidates: Vec<IceCandidate>) {
        if candidates.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() || inner.remote_applied {
            return;
        }
        debug!(session = %self.session_id, count = candidates.len(), "seeding early candidates");
        inner.pending.extend(candidates);
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.lock();
        ConnectionSnapshot {
            session_id: self.session_id.clone(),
            role: self.role,
            connection_id: self.connection_id.clone(),
            connection_state: inner.transport.connection,
            connectivity_state: inner.transport.connectivity,
            negotiation_state: inner.state,
            data_channel_state: inner.transport.data_channel,
            created_at: inner.created_at,
            connected_at: inner.connected_at,
            failure: inner.failure.clone(),
        }
    }

    /// Перечитывает живое состояние движка. Компенсирует пропущенные события.
    pub fn refresh(&self) {
        let status = self.engine.status();
        let mut inner = self.inner.lock();
        if inner.state == NegotiationState::Closed {
            return;
        }
        inner.transport = status;
        inner.settle(&self.session_id);
    }

    /// Инициатор: создаём offer и отправляем собеседнику
    pub async fn initiate(&self) -> SessionResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return Err(SessionError::InvalidState {
                    op: "initiate",
                    state: inner.state,
                });
            }
            if inner.state != NegotiationState::New || inner.step_in_flight {
                return Err(SessionError::AlreadyActive);
            }
            inner.step_in_flight = true;
        }

        let offer = match self.engine_step(self.create_and_apply_offer()).await? {
            Some(offer) => offer,
            None => return Ok(()),
        };
        if !self.advance(NegotiationState::OfferCreated) {
            return self.finish_step(Ok(()));
        }

        let delivery = self.outbound.send(&Signal::Offer(offer));
        if delivery == Delivery::Discarded {
            warn!(session = %self.session_id, to = %self.counterpart(), "offer discarded, counterpart offline");
        }
        self.advance(NegotiationState::OfferSent);
        info!(session = %self.session_id, to = %self.counterpart(), "offer sent, waiting for answer");
        self.finish_step(Ok(()))
    }

    async fn create_and_apply_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.engine.create_local_offer().await?;
        self.engine.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Отвечающий: применяем offer, создаём и отправляем answer
    pub async fn accept_offer(&self, offer: SessionDescription) -> SessionResult<()> {
        self.begin_step("accept_offer", NegotiationState::New)?;

        if self
            .engine_step(self.engine.set_remote_description(offer))
            .await?
            .is_none()
        {
            return Ok(());
        }
        if !self.advance(NegotiationState::OfferReceived) {
            return self.finish_step(Ok(()));
        }
        if let Err(err) = self.flush_pending().await {
            return self.finish_step(Err(err));
        }

        let answer = match self.engine_step(self.create_and_apply_answer()).await? {
            Some(answer) => answer,
            None => return Ok(()),
        };
        if !self.advance(NegotiationState::AnswerCreated) {
            return self.finish_step(Ok(()));
        }

        let delivery = self.outbound.send(&Signal::Answer(answer));
        if delivery == Delivery::Discarded {
            warn!(session = %self.session_id, to = %self.counterpart(), "answer discarded, counterpart offline");
        }
        self.advance(NegotiationState::AnswerSent);
        self.enter_connecting();
        self.finish_step(Ok(()))
    }

    async fn create_and_apply_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.engine.create_local_answer().await?;
        self.engine.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Инициатор: применяем answer. Повторный или поздний answer отклоняется.
    pub async fn accept_answer(&self, answer: SessionDescription) -> SessionResult<()> {
        self.begin_step("accept_answer", NegotiationState::OfferSent)?;

        if self
            .engine_step(self.engine.set_remote_description(answer))
            .await?
            .is_none()
        {
            return Ok(());
        }
        if !self.advance(NegotiationState::AnswerReceived) {
            return self.finish_step(Ok(()));
        }
        if let Err(err) = self.flush_pending().await {
            return self.finish_step(Err(err));
        }
        self.enter_connecting();
        self.finish_step(Ok(()))
    }

    /// До remote description кандидат ставится в очередь, после failed/closed игнорируется
    pub async fn submit_remote_candidate(&self, candidate: IceCandidate) -> SessionResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                debug!(session = %self.session_id, state = %inner.state, "ignoring candidate for finished session");
                return Ok(());
            }
            if !inner.remote_applied {
                inner.pending.push(candidate);
                debug!(session = %self.session_id, queued = inner.pending.len(), "remote description not set yet, queuing candidate");
                return Ok(());
            }
        }

        if let Err(err) = self.engine.add_remote_candidate(candidate).await {
            warn!(session = %self.session_id, error = %err, "failed to add remote candidate");
            return Err(err.into());
        }
        Ok(())
    }

    /// Идемпотентно. Отписка от событий происходит до освобождения движка.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == NegotiationState::Closed {
                return;
            }
            inner.advance(&self.session_id, NegotiationState::Closed);
            inner.pending.clear();
            inner.step_in_flight = false;
            inner.transport = TransportStatus {
                data_channel: inner.transport.data_channel.map(|_| DataChannelState::Closed),
                ..TransportStatus::closed()
            };
        }
        if let Some(task) = self.events.lock().take() {
            task.abort();
        }
        if let Err(err) = self.engine.close().await {
            debug!(session = %self.session_id, error = %err, "engine close failed");
        }
        info!(session = %self.session_id, "session closed");
    }

    fn begin_step(&self, op: &'static str, expected: NegotiationState) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != expected || inner.step_in_flight {
            return Err(SessionError::InvalidState {
                op,
                state: inner.state,
            });
        }
        inner.step_in_flight = true;
        Ok(())
    }

    fn finish_step<T>(&self, result: SessionResult<T>) -> SessionResult<T> {
        self.inner.lock().step_in_flight = false;
        result
    }

    fn advance(&self, next: NegotiationState) -> bool {
        self.inner.lock().advance(&self.session_id, next)
    }

    fn enter_connecting(&self) {
        let mut inner = self.inner.lock();
        if inner.advance(&self.session_id, NegotiationState::Connecting) {
            // события могли прийти раньше, чем закончилось согласование
            inner.settle(&self.session_id);
        }
    }

    /// Шаг против движка. `Ok(None)`: пока ждали, сессию закрыли, результат
    /// отбрасывается. Ошибка движка переводит сессию в failed.
    async fn engine_step<T>(
        &self,
        step: impl std::future::Future<Output = Result<T, EngineError>>,
    ) -> SessionResult<Option<T>> {
        let result = step.await;
        let mut inner = self.inner.lock();
        if inner.state == NegotiationState::Closed {
            debug!(session = %self.session_id, "session closed during negotiation step");
            return Ok(None);
        }
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                inner.fail(&self.session_id, err.to_string());
                inner.step_in_flight = false;
                Err(err.into())
            }
        }
    }

    /// Применяет очередь после remote description в порядке поступления.
    /// Кандидаты, пришедшие во время сброса, встают в конец той же очереди.
    async fn flush_pending(&self) -> SessionResult<()> {
        let mut applied = 0usize;
        loop {
            let next = {
                let mut inner = self.inner.lock();
                if inner.state.is_terminal() {
                    return Ok(());
                }
                match inner.pending.pop() {
                    Some(candidate) => candidate,
                    None => {
                        inner.remote_applied = true;
                        break;
                    }
                }
            };
            if let Err(err) = self.engine.add_remote_candidate(next).await {
                // один плохой кандидат не ломает сессию
                warn!(session = %self.session_id, error = %err, "failed to apply pending candidate");
            } else {
                applied += 1;
            }
        }
        if applied > 0 {
            debug!(session = %self.session_id, applied, "pending candidates applied");
        }
        Ok(())
    }
}

impl Drop for SessionNegotiator {
    fn drop(&mut self) {
        if let Some(task) = self.events.get_mut().take() {
            task.abort();
        }
    }
}

async fn pump_events(
    session: SessionId,
    mut events: EngineEvents,
    inner: Arc<Mutex<NegotiatorInner>>,
    outbound: SignalSink,
) {
    while let Some(event) = events.recv().await {
        let mut guard = inner.lock();
        if guard.state == NegotiationState::Closed {
            break;
        }
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if guard.state == NegotiationState::Failed {
                    continue;
                }
                drop(guard);
                // trickle: каждый кандидат уходит сразу, без пачек
                outbound.send(&Signal::Candidate(candidate));
            }
            other => guard.apply_event(&session, &other),
        }
    }
    debug!(session = %session, "engine event stream ended");
}
