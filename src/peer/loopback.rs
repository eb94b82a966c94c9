//! Детерминированный движок в памяти: без сети, но с тем же контрактом,
//! что и webrtc. Соединение "устанавливается", когда применены оба описания
//! и хотя бы один удалённый кандидат.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::peer::engine::{
    EngineError, EngineEvent, EngineEvents, EngineFactory, EventEmitter, TransportEngine,
};
use crate::peer::types::{
    ConnectivityState, DataChannelState, IceCandidate, SdpKind, SessionDescription, SessionId,
    TransportState, TransportStatus,
};
use crate::utils::random_id;

struct LoopbackState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    status: TransportStatus,
    closed: bool,
    reject_remote: bool,
    hold_connectivity: bool,
    candidates_per_description: usize,
}

/// Доступ к движку снаружи, после того как его забрал переговорщик
#[derive(Clone)]
pub struct LoopbackHandle {
    id: String,
    state: Arc<Mutex<LoopbackState>>,
    events: EventEmitter,
}

impl LoopbackHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_subscribed(&self) -> bool {
        self.events.is_attached()
    }

    pub fn status(&self) -> TransportStatus {
        self.state.lock().status
    }

    pub fn reject_remote_descriptions(&self, reject: bool) {
        self.state.lock().reject_remote = reject;
    }

    /// Не переходить в connected, пока не вызван `release_connectivity`
    pub fn hold_connectivity(&self) {
        self.state.lock().hold_connectivity = true;
    }

    pub fn release_connectivity(&self) {
        let mut state = self.state.lock();
        state.hold_connectivity = false;
        self.maybe_connect(&mut state);
    }

    /// Терминальный отказ транспорта
    pub fn fail_transport(&self) {
        let mut state = self.state.lock();
        state.status.connection = TransportState::Failed;
        state.status.connectivity = ConnectivityState::Failed;
        self.events
            .emit(EngineEvent::ConnectionStateChanged(TransportState::Failed));
        self.events
            .emit(EngineEvent::ConnectivityStateChanged(ConnectivityState::Failed));
    }

    /// Меняет состояние без событий, как при потерянном уведомлении
    pub fn set_status_silently(&self, status: TransportStatus) {
        self.state.lock().status = status;
    }

    /// Событие от имени движка
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.events.emit(event)
    }

    fn maybe_connect(&self, state: &mut LoopbackState) {
        if state.closed
            || state.hold_connectivity
            || state.local.is_none()
            || state.remote.is_none()
            || state.applied.is_empty()
            || state.status.connectivity != ConnectivityState::New
        {
            return;
        }
        debug!(engine = %self.id, "loopback connectivity established");
        state.status.connection = TransportState::Connecting;
        state.status.connectivity = ConnectivityState::Checking;
        self.events
            .emit(EngineEvent::ConnectionStateChanged(TransportState::Connecting));
        self.events
            .emit(EngineEvent::ConnectivityStateChanged(ConnectivityState::Checking));

        state.status.connectivity = ConnectivityState::Connected;
        state.status.connection = TransportState::Connected;
        state.status.data_channel = Some(DataChannelState::Open);
        self.events
            .emit(EngineEvent::ConnectivityStateChanged(ConnectivityState::Connected));
        self.events
            .emit(EngineEvent::ConnectionStateChanged(TransportState::Connected));
        self.events
            .emit(EngineEvent::DataChannelStateChanged(DataChannelState::Open));
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.state.lock().closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

pub struct LoopbackEngine {
    handle: LoopbackHandle,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::with_candidates(2)
    }

    pub fn with_candidates(candidates_per_description: usize) -> Self {
        let state = LoopbackState {
            local: None,
            remote: None,
            applied: Vec::new(),
            status: TransportStatus::default(),
            closed: false,
            reject_remote: false,
            hold_connectivity: false,
            candidates_per_description,
        };
        Self {
            handle: LoopbackHandle {
                id: random_id(),
                state: Arc::new(Mutex::new(state)),
                events: EventEmitter::default(),
            },
        }
    }

    pub fn handle(&self) -> LoopbackHandle {
        self.handle.clone()
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportEngine for LoopbackEngine {
    async fn create_local_offer(&self) -> Result<SessionDescription, EngineError> {
        self.handle.ensure_open()?;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=loopback {} 1 IN IP4 127.0.0.1\r\ns=offer\r\n",
            self.handle.id
        )))
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, EngineError> {
        self.handle.ensure_open()?;
        match self.handle.state.lock().remote.as_ref().map(|d| d.kind) {
            Some(SdpKind::Offer) => Ok(SessionDescription::answer(format!(
                "v=0\r\no=loopback {} 1 IN IP4 127.0.0.1\r\ns=answer\r\n",
                self.handle.id
            ))),
            _ => Err(EngineError::Rejected("no remote offer to answer".into())),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.handle.ensure_open()?;
        // тот же порядок, что у webrtc: описание, затем кандидаты
        tokio::task::yield_now().await;
        let mut state = self.handle.state.lock();
        state.local = Some(desc);
        for n in 0..state.candidates_per_description {
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host ufrag {}",
                n + 1,
                40000 + n,
                self.handle.id
            ));
            self.handle.events.emit(EngineEvent::LocalCandidate(candidate));
        }
        self.handle.maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.handle.ensure_open()?;
        tokio::task::yield_now().await;
        let mut state = self.handle.state.lock();
        if state.reject_remote {
            return Err(EngineError::Rejected("remote description rejected".into()));
        }
        let expected = match state.local.as_ref().map(|d| d.kind) {
            Some(SdpKind::Offer) => SdpKind::Answer,
            _ => SdpKind::Offer,
        };
        if desc.kind != expected {
            return Err(EngineError::Rejected(format!(
                "unexpected remote {:?}, wanted {:?}",
                desc.kind, expected
            )));
        }
        state.remote = Some(desc);
        self.handle.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.handle.ensure_open()?;
        let mut state = self.handle.state.lock();
        if state.remote.is_none() {
            return Err(EngineError::Rejected("remote description not set".into()));
        }
        state.applied.push(candidate);
        self.handle.maybe_connect(&mut state);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.handle.events.detach();
        let mut state = self.handle.state.lock();
        state.closed = true;
        state.status = TransportStatus::closed();
        Ok(())
    }

    fn subscribe(&self) -> EngineEvents {
        self.handle.events.subscribe()
    }

    fn status(&self) -> TransportStatus {
        self.handle.status()
    }
}

/// Фабрика loopback движков; запоминает созданные по сессиям
pub struct LoopbackFactory {
    candidates_per_description: usize,
    hold_connectivity: bool,
    reject_remote: bool,
    create_delay: Option<Duration>,
    created: Mutex<HashMap<SessionId, Vec<LoopbackHandle>>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self {
            candidates_per_description: 2,
            hold_connectivity: false,
            reject_remote: false,
            create_delay: None,
            created: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_candidates(mut self, n: usize) -> Self {
        self.candidates_per_description = n;
        self
    }

    pub fn holding_connectivity(mut self) -> Self {
        self.hold_connectivity = true;
        self
    }

    pub fn rejecting_remote_descriptions(mut self) -> Self {
        self.reject_remote = true;
        self
    }

    /// Создание движка занимает `delay`, как подъём настоящего RTCPeerConnection
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Все движки, созданные для сессии, в порядке создания
    pub fn handles(&self, session: &SessionId) -> Vec<LoopbackHandle> {
        self.created.lock().get(session).cloned().unwrap_or_default()
    }

    pub fn last(&self, session: &SessionId) -> Option<LoopbackHandle> {
        self.created
            .lock()
            .get(session)
            .and_then(|handles| handles.last().cloned())
    }
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineFactory for LoopbackFactory {
    async fn create(
        &self,
        session: &SessionId,
        _initiator: bool,
    ) -> Result<Arc<dyn TransportEngine>, EngineError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let engine = LoopbackEngine::with_candidates(self.candidates_per_description);
        let handle = engine.handle();
        if self.hold_connectivity {
            handle.hold_connectivity();
        }
        handle.reject_remote_descriptions(self.reject_remote);
        self.created
            .lock()
            .entry(session.clone())
            .or_default()
            .push(handle);
        Ok(Arc::new(engine))
    }
}
