use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::peer::types::{
    ConnectivityState, DataChannelState, IceCandidate, SessionDescription, SessionId,
    TransportState, TransportStatus,
};

/// События движка, на которые подписывается переговорщик
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(TransportState),
    ConnectivityStateChanged(ConnectivityState),
    DataChannelStateChanged(DataChannelState),
}

pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("webrtc failure: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("engine rejected operation: {0}")]
    Rejected(String),
    #[error("engine already closed")]
    Closed,
}

/// Один подписчик на события движка. Повторная подписка заменяет предыдущую,
/// `detach` отключает её синхронно.
#[derive(Clone, Default)]
pub struct EventEmitter {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EventEmitter {
    pub fn subscribe(&self) -> EngineEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock() = Some(tx);
        rx
    }

    pub fn emit(&self, event: EngineEvent) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn detach(&self) {
        self.tx.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.tx.lock().is_some()
    }
}

/// Транспорт точка-точка (ICE, DTLS, data channel). Описания применяются
/// асинхронно и могут упасть; кандидаты и смены состояний приходят событиями
/// в любом порядке относительно применения описаний.
#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn create_local_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_local_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;

    fn subscribe(&self) -> EngineEvents;

    /// Текущее состояние без ожидания событий
    fn status(&self) -> TransportStatus;
}

/// Создаёт по движку на сессию. `initiator` открывает data channel сам.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        session: &SessionId,
        initiator: bool,
    ) -> Result<Arc<dyn TransportEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_drops_events_after_detach() {
        let emitter = EventEmitter::default();
        assert!(!emitter.emit(EngineEvent::ConnectionStateChanged(TransportState::Connecting)));

        let mut rx = emitter.subscribe();
        assert!(emitter.emit(EngineEvent::ConnectionStateChanged(TransportState::Connecting)));
        assert_eq!(
            rx.recv().await,
            Some(EngineEvent::ConnectionStateChanged(TransportState::Connecting))
        );

        emitter.detach();
        assert!(!emitter.is_attached());
        assert!(!emitter.emit(EngineEvent::ConnectionStateChanged(TransportState::Connected)));
        assert_eq!(rx.recv().await, None);
    }
}
