// Конфигурация оркестратора и ICE серверов

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::peer::types::{PeerId, Role};

/// Переменная окружения с адресом TURN сервера по умолчанию
pub const TURN_ENV: &str = "SSC_WEBRTC_TURN";

pub const DEFAULT_STUN_URLS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

pub const TEACHER_ID: &str = "teacher-1";
pub const STUDENT_ID: &str = "student-1";

/// Конфигурация одного ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// TURN (необязательный) плюс список STUN серверов
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct IceConfig {
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    pub stun_urls: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            turn_url: None,
            turn_username: None,
            turn_credential: None,
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl IceConfig {
    /// Если TURN не задан явно, берём его из окружения
    pub fn with_env_fallback(mut self) -> Self {
        if self.turn_url().is_none() {
            self.turn_url = std::env::var(TURN_ENV)
                .ok()
                .filter(|value| !value.trim().is_empty());
        }
        self
    }

    fn turn_url(&self) -> Option<&str> {
        self.turn_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// TURN идёт первым, за ним STUN
    pub fn servers(&self) -> Vec<ServerConfig> {
        let mut servers = Vec::with_capacity(self.stun_urls.len() + 1);
        if let Some(url) = self.turn_url() {
            servers.push(ServerConfig {
                id: "turn".into(),
                r#type: "turn".into(),
                url: url.to_string(),
                username: self.turn_username.clone().filter(|s| !s.is_empty()),
                credential: self.turn_credential.clone().filter(|s| !s.is_empty()),
            });
        }
        for (i, url) in self.stun_urls.iter().enumerate() {
            servers.push(ServerConfig {
                id: format!("stun-{i}"),
                r#type: "stun".into(),
                url: url.clone(),
                username: None,
                credential: None,
            });
        }
        servers
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in self.servers() {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid("server URL cannot be empty".into()));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(
                    "TURN servers require username and credential".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Под этим именем нас знает шина в роли ученика
    pub local_id: PeerId,
    pub coordinator_id: PeerId,
    pub roles: Vec<Role>,
    pub ice: IceConfig,
    pub orphan_candidate_ttl_ms: u64,
    pub refresh_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            local_id: PeerId::new(STUDENT_ID),
            coordinator_id: PeerId::new(TEACHER_ID),
            roles: vec![Role::Coordinator, Role::Subordinate],
            ice: IceConfig::default(),
            orphan_candidate_ttl_ms: 10_000,
            refresh_interval_ms: 1_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn coordinator(id: impl Into<String>) -> Self {
        let id = PeerId::new(id);
        Self {
            local_id: id.clone(),
            coordinator_id: id,
            roles: vec![Role::Coordinator],
            ..Default::default()
        }
    }

    pub fn subordinate(local_id: impl Into<String>, coordinator_id: impl Into<String>) -> Self {
        Self {
            local_id: PeerId::new(local_id),
            coordinator_id: PeerId::new(coordinator_id),
            roles: vec![Role::Subordinate],
            ..Default::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.roles.is_empty() {
            return Err(ConfigError::Invalid("at least one role is required".into()));
        }
        if self.has_role(Role::Coordinator)
            && self.has_role(Role::Subordinate)
            && self.local_id == self.coordinator_id
        {
            return Err(ConfigError::Invalid(
                "local id must differ from coordinator id when both roles are enabled".into(),
            ));
        }
        self.ice.validate()
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn orphan_candidate_ttl(&self) -> Duration {
        Duration::from_millis(self.orphan_candidate_ttl_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}
