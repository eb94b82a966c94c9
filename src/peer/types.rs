use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::peer::state::NegotiationState;

/// Роль стороны в сигналинге: учитель (координатор) или ученик
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Coordinator,
    Subordinate,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => f.write_str("coordinator"),
            Role::Subordinate => f.write_str("subordinate"),
        }
    }
}

/// Идентификатор участника сигналинга
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Сессия на стороне учителя идентифицируется учеником
pub type SessionId = PeerId;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP offer/answer в том виде, в котором он ходит через сигналинг
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE кандидат, формат совпадает с RTCIceCandidate.toJSON()
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Тип кандидата из строки `... typ <kind> ...` (host, srflx, prflx, relay)
    pub fn kind(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next();
            }
        }
        None
    }
}

/// Состояние транспортного соединения (RTCPeerConnectionState)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Состояние ICE (RTCIceConnectionState)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectivityState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// connected и completed считаются рабочим соединением
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectivityState::Connected | ConnectivityState::Completed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Живое состояние движка, снимаемое в любой момент
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransportStatus {
    pub connection: TransportState,
    pub connectivity: ConnectivityState,
    pub data_channel: Option<DataChannelState>,
}

impl TransportStatus {
    pub fn closed() -> Self {
        Self {
            connection: TransportState::Closed,
            connectivity: ConnectivityState::Closed,
            data_channel: Some(DataChannelState::Closed),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.connection == TransportState::Failed
            || self.connectivity == ConnectivityState::Failed
    }
}

/// Снимок сессии для опроса снаружи. Читатель всегда получает копию.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub session_id: SessionId,
    /// Роль этой стороны в сессии
    pub role: Role,
    pub connection_id: String,
    pub connection_state: TransportState,
    pub connectivity_state: ConnectivityState,
    pub negotiation_state: NegotiationState,
    pub data_channel_state: Option<DataChannelState>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl ConnectionSnapshot {
    pub fn is_active(&self) -> bool {
        self.connectivity_state.is_connected()
    }

    /// Соединение рабочее и канал данных открыт
    pub fn is_ready(&self) -> bool {
        self.is_active() && self.data_channel_state == Some(DataChannelState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_kind_is_parsed_from_typ_field() {
        let host = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host");
        let relay = IceCandidate::new(
            "candidate:3 1 udp 41885439 203.0.113.9 3478 typ relay raddr 0.0.0.0 rport 0",
        );
        assert_eq!(host.kind(), Some("host"));
        assert_eq!(relay.kind(), Some("relay"));
        assert_eq!(IceCandidate::new("garbage").kind(), None);
    }

    #[test]
    fn candidate_uses_browser_json_shape() {
        let json = serde_json::json!({
            "candidate": "candidate:1 1 udp 1 10.0.0.2 5000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        let cand: IceCandidate = serde_json::from_value(json).expect("candidate json");
        assert_eq!(cand.sdp_mid.as_deref(), Some("0"));
        assert_eq!(cand.sdp_mline_index, Some(0));
        assert!(cand.username_fragment.is_none());
    }
}
