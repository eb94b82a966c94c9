use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::SessionError;
use crate::peer::types::{PeerId, Role};
use crate::signaling::message::{Envelope, Signal, SignalMessage};

/// Обработчик входящих сообщений одного участника
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn on_signal(&self, envelope: Envelope) -> Result<(), SessionError>;
}

/// Результат отправки. `Discarded` значит, что получателя нет (он офлайн).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    Discarded,
}

struct Route {
    role: Role,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Точка встречи участников. Без повторов и без хранения; для каждого
/// получателя доставки идут по одной и в порядке поступления.
#[derive(Clone, Default)]
pub struct SignalingBus {
    routes: Arc<RwLock<HashMap<PeerId, Route>>>,
}

impl SignalingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Заменяет обработчик участника; `None` снимает его.
    /// Сообщения, уже стоящие в очереди старого обработчика, дойдут до него.
    pub fn register_handler(
        &self,
        peer: PeerId,
        role: Role,
        handler: Option<Arc<dyn SignalHandler>>,
    ) {
        let mut routes = self.routes.write();
        match handler {
            Some(handler) => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(deliver_loop(peer.clone(), handler, rx));
                debug!(peer = %peer, role = %role, "signal handler registered");
                routes.insert(peer, Route { role, tx });
            }
            None => {
                if routes.remove(&peer).is_some() {
                    debug!(peer = %peer, role = %role, "signal handler cleared");
                }
            }
        }
    }

    pub fn send(&self, from: &PeerId, to: &PeerId, message: SignalMessage) -> Delivery {
        let routes = self.routes.read();
        let Some(route) = routes.get(to) else {
            debug!(from = %from, to = %to, action = %message.action, "delivery discarded, no handler");
            return Delivery::Discarded;
        };
        let envelope = Envelope {
            from: from.clone(),
            to: to.clone(),
            message,
        };
        match route.tx.send(envelope) {
            Ok(()) => Delivery::Queued,
            Err(err) => {
                debug!(from = %from, to = %to, action = %err.0.message.action, "delivery discarded, route closed");
                Delivery::Discarded
            }
        }
    }

    pub fn send_signal(&self, from: &PeerId, to: &PeerId, signal: &Signal) -> Delivery {
        match signal.to_message() {
            Ok(message) => self.send(from, to, message),
            Err(err) => {
                warn!(from = %from, to = %to, action = signal.action(), error = %err, "failed to encode signal");
                Delivery::Discarded
            }
        }
    }

    /// Отправляет всем участникам с данной ролью, возвращает число доставок
    pub fn broadcast(&self, from: &PeerId, role: Role, signal: &Signal) -> usize {
        self.peers(role)
            .iter()
            .filter(|peer| *peer != from)
            .filter(|peer| self.send_signal(from, peer, signal) == Delivery::Queued)
            .count()
    }

    pub fn is_registered(&self, peer: &PeerId) -> bool {
        self.routes.read().contains_key(peer)
    }

    pub fn peers(&self, role: Role) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .routes
            .read()
            .iter()
            .filter(|(_, route)| route.role == role)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }
}

async fn deliver_loop(
    peer: PeerId,
    handler: Arc<dyn SignalHandler>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let from = envelope.from.clone();
        let action = envelope.message.action.clone();
        match AssertUnwindSafe(handler.on_signal(envelope))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(peer = %peer, from = %from, action = %action, error = %err, "signal handler failed");
            }
            Err(_) => {
                error!(peer = %peer, from = %from, action = %action, "signal handler panicked");
            }
        }
    }
    debug!(peer = %peer, "signal route drained");
}

/// Исходящий канал одной сессии: от нас к конкретному собеседнику
#[derive(Clone)]
pub struct SignalSink {
    bus: SignalingBus,
    from: PeerId,
    to: PeerId,
}

impl SignalSink {
    pub fn new(bus: SignalingBus, from: PeerId, to: PeerId) -> Self {
        Self { bus, from, to }
    }

    pub fn send(&self, signal: &Signal) -> Delivery {
        self.bus.send_signal(&self.from, &self.to, signal)
    }

    pub fn counterpart(&self) -> &PeerId {
        &self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(PeerId, String)>>,
        notify: Notify,
    }

    #[async_trait]
    impl SignalHandler for Recorder {
        async fn on_signal(&self, envelope: Envelope) -> Result<(), SessionError> {
            // уступаем планировщику, чтобы поймать переупорядочивание
            tokio::task::yield_now().await;
            self.seen
                .lock()
                .push((envelope.from, envelope.message.action));
            self.notify.notify_one();
            Ok(())
        }
    }

    struct Exploding;

    #[async_trait]
    impl SignalHandler for Exploding {
        async fn on_signal(&self, envelope: Envelope) -> Result<(), SessionError> {
            if envelope.message.action == "panic" {
                panic!("handler blew up");
            }
            Err(SessionError::NoSession)
        }
    }

    fn message(action: &str) -> SignalMessage {
        SignalMessage {
            action: action.into(),
            payload: None,
        }
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.seen.lock().len() < count {
                recorder.notify.notified().await;
            }
        })
        .await
        .expect("deliveries in time");
    }

    #[tokio::test]
    async fn missing_handler_discards() {
        let bus = SignalingBus::new();
        let delivery = bus.send(&"teacher-1".into(), &"student-1".into(), message("offer"));
        assert_eq!(delivery, Delivery::Discarded);
    }

    #[tokio::test]
    async fn per_pair_delivery_is_fifo() {
        let bus = SignalingBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.register_handler("teacher-1".into(), Role::Coordinator, Some(recorder.clone()));

        for i in 0..20 {
            let delivery = bus.send(
                &"student-1".into(),
                &"teacher-1".into(),
                message(&format!("m{i}")),
            );
            assert_eq!(delivery, Delivery::Queued);
        }
        wait_for(&recorder, 20).await;

        let actions: Vec<String> = recorder.seen.lock().iter().map(|(_, a)| a.clone()).collect();
        let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
        assert_eq!(actions, expected);
    }

    #[tokio::test]
    async fn handler_failures_do_not_reach_sender_or_stop_the_route() {
        let bus = SignalingBus::new();
        bus.register_handler("teacher-1".into(), Role::Coordinator, Some(Arc::new(Exploding)));

        let from: PeerId = "student-1".into();
        let to: PeerId = "teacher-1".into();
        assert_eq!(bus.send(&from, &to, message("panic")), Delivery::Queued);
        assert_eq!(bus.send(&from, &to, message("error")), Delivery::Queued);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // маршрут жив, можно заменить обработчик и продолжить
        let recorder = Arc::new(Recorder::default());
        bus.register_handler(to.clone(), Role::Coordinator, Some(recorder.clone()));
        assert_eq!(bus.send(&from, &to, message("after")), Delivery::Queued);
        wait_for(&recorder, 1).await;
    }

    #[tokio::test]
    async fn clearing_handler_models_offline_peer() {
        let bus = SignalingBus::new();
        let recorder = Arc::new(Recorder::default());
        let student: PeerId = "student-1".into();
        bus.register_handler(student.clone(), Role::Subordinate, Some(recorder.clone()));
        assert!(bus.is_registered(&student));

        bus.register_handler(student.clone(), Role::Subordinate, None);
        assert!(!bus.is_registered(&student));
        assert_eq!(
            bus.send(&"teacher-1".into(), &student, message("answer")),
            Delivery::Discarded
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_only_the_role() {
        let bus = SignalingBus::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let teacher = Arc::new(Recorder::default());
        bus.register_handler("student-a".into(), Role::Subordinate, Some(a.clone()));
        bus.register_handler("student-b".into(), Role::Subordinate, Some(b.clone()));
        bus.register_handler("teacher-1".into(), Role::Coordinator, Some(teacher.clone()));

        let sent = bus.broadcast(
            &"teacher-1".into(),
            Role::Subordinate,
            &Signal::ServerStarted { message: None },
        );
        assert_eq!(sent, 2);
        wait_for(&a, 1).await;
        wait_for(&b, 1).await;
        assert!(teacher.seen.lock().is_empty());
    }
}
