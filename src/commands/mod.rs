//! Фасад оркестрации: жизненный цикл учителя и ученика поверх одной шины.
//! Обработчики шины регистрируются при создании, для каждой включённой роли.

pub mod coordinator_api;
pub mod subordinate_api;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::OrchestratorConfig;
use crate::error::{ConfigError, SessionError, SessionResult};
use crate::peer::engine::EngineFactory;
use crate::peer::ice::OrphanCandidates;
use crate::peer::types::{ConnectionSnapshot, PeerId, Role};
use crate::registry::SessionRegistry;
use crate::session::SessionNegotiator;
use crate::signaling::{SignalHandler, SignalingBus};

use coordinator_api::CoordinatorHandler;
use subordinate_api::SubordinateHandler;

/// Сводное состояние для опроса снаружи
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub is_serving: bool,
    pub active_sessions: Vec<ConnectionSnapshot>,
    /// Локальная сессия ученика: ICE connected/completed и канал открыт
    pub is_connected: bool,
    pub local_session_info: Option<ConnectionSnapshot>,
    pub last_rejection: Option<String>,
}

pub(crate) struct Shared {
    config: OrchestratorConfig,
    bus: SignalingBus,
    factory: Arc<dyn EngineFactory>,
    registry: SessionRegistry,
    local: Mutex<LocalSlot>,
    early: Mutex<OrphanCandidates>,
    last_rejection: Mutex<Option<String>>,
    server_notice: Mutex<Option<String>>,
}

impl Shared {
    fn ensure_role(&self, role: Role) -> SessionResult<()> {
        if self.config.has_role(role) {
            Ok(())
        } else {
            Err(SessionError::RoleNotEnabled(role))
        }
    }

    fn coordinator_id(&self) -> &PeerId {
        &self.config.coordinator_id
    }

    fn local_id(&self) -> &PeerId {
        &self.config.local_id
    }

    fn is_serving(&self) -> bool {
        self.registry.is_open()
    }

    fn local_session(&self) -> Option<Arc<SessionNegotiator>> {
        self.local.lock().session.clone()
    }
}

/// Слот сессии ученика. `connecting` держит номер попытки `connect`,
/// пока создаётся движок; `disconnect` её сбрасывает.
#[derive(Default)]
struct LocalSlot {
    session: Option<Arc<SessionNegotiator>>,
    connecting: Option<u64>,
    attempts: u64,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Требует рантайм tokio: обработчики шины работают в своих задачах
    pub fn new(
        bus: SignalingBus,
        factory: Arc<dyn EngineFactory>,
        config: OrchestratorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = SessionRegistry::new(
            config.coordinator_id.clone(),
            bus.clone(),
            factory.clone(),
            config.orphan_candidate_ttl(),
        );
        let shared = Arc::new(Shared {
            early: Mutex::new(OrphanCandidates::new(config.orphan_candidate_ttl())),
            config,
            bus,
            factory,
            registry,
            local: Mutex::new(LocalSlot::default()),
            last_rejection: Mutex::new(None),
            server_notice: Mutex::new(None),
        });

        if shared.config.has_role(Role::Coordinator) {
            let handler: Arc<dyn SignalHandler> = Arc::new(CoordinatorHandler {
                shared: Arc::downgrade(&shared),
            });
            shared.bus.register_handler(
                shared.coordinator_id().clone(),
                Role::Coordinator,
                Some(handler),
            );
        }
        if shared.config.has_role(Role::Subordinate) {
            let handler: Arc<dyn SignalHandler> = Arc::new(SubordinateHandler {
                shared: Arc::downgrade(&shared),
            });
            shared
                .bus
                .register_handler(shared.local_id().clone(), Role::Subordinate, Some(handler));
        }
        info!(roles = ?shared.config.roles, local = %shared.local_id(), "orchestrator ready");

        Ok(Self {
            shared,
            refresher: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn bus(&self) -> &SignalingBus {
        &self.shared.bus
    }

    /// Копия состояния; ничего не меняет
    pub fn get_state(&self) -> OrchestratorStatus {
        let shared = &self.shared;
        let local_session_info = shared.local_session().map(|n| n.snapshot());
        OrchestratorStatus {
            is_serving: shared.is_serving(),
            active_sessions: shared.registry.list_active(),
            is_connected: local_session_info
                .as_ref()
                .is_some_and(ConnectionSnapshot::is_ready),
            local_session_info,
            last_rejection: shared.last_rejection.lock().clone(),
        }
    }

    /// Последнее уведомление учителя о запуске, если было
    pub fn server_notice(&self) -> Option<String> {
        self.shared.server_notice.lock().clone()
    }

    /// Перечитывает движки во всех сессиях; упавшие сессии учителя убираются
    pub async fn refresh(&self) {
        refresh_shared(&self.shared).await;
    }

    /// Фоновый опрос раз в `refresh_interval`. Повторный вызов перезапускает задачу.
    pub fn spawn_refresh_loop(&self) {
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.config.refresh_interval();
        let task = tokio::spawn(refresh_loop(weak, period));
        if let Some(previous) = self.refresher.lock().replace(task) {
            previous.abort();
        }
        debug!(period_ms = period.as_millis() as u64, "refresh loop started");
    }

    /// Снимает обработчики и закрывает всё, что открыто
    pub async fn shutdown(&self) {
        if let Some(task) = self.refresher.lock().take() {
            task.abort();
        }
        let shared = &self.shared;
        if shared.config.has_role(Role::Coordinator) {
            shared
                .bus
                .register_handler(shared.coordinator_id().clone(), Role::Coordinator, None);
            coordinator_api::stop(shared).await;
        }
        if shared.config.has_role(Role::Subordinate) {
            shared
                .bus
                .register_handler(shared.local_id().clone(), Role::Subordinate, None);
            subordinate_api::drop_local(shared).await;
        }
        info!(local = %shared.local_id(), "orchestrator shut down");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(task) = self.refresher.get_mut().take() {
            task.abort();
        }
    }
}

async fn refresh_shared(shared: &Shared) {
    if let Some(local) = shared.local_session() {
        local.refresh();
    }
    let reaped = shared.registry.refresh().await;
    if reaped > 0 {
        info!(reaped, "failed sessions removed");
    }
    shared.early.lock().prune();
}

async fn refresh_loop(shared: Weak<Shared>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        refresh_shared(&shared).await;
    }
}
