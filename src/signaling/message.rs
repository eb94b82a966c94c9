use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SignalError;
use crate::peer::types::{IceCandidate, PeerId, SessionDescription};

pub mod action {
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const CANDIDATE: &str = "candidate";
    pub const SERVER_STARTED: &str = "server-started";
    pub const SERVER_STOPPED: &str = "server-stopped";
    pub const CONNECTION_REJECTED: &str = "connection-rejected";
}

/// Сообщение в том виде, как оно идёт по проводу: `{ action, payload? }`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

/// Адресованное сообщение внутри шины
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: PeerId,
    pub to: PeerId,
    pub message: SignalMessage,
}

/// Типизированное представление сообщения сигналинга
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    ServerStarted { message: Option<String> },
    ServerStopped { message: Option<String> },
    ConnectionRejected { message: Option<String> },
    Unknown(String),
}

#[derive(Serialize, Deserialize)]
struct DescriptionPayload {
    description: SessionDescription,
}

#[derive(Serialize, Deserialize)]
struct CandidatePayload {
    candidate: IceCandidate,
}

#[derive(Serialize, Deserialize, Default)]
struct NoticePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl Signal {
    pub fn action(&self) -> &str {
        match self {
            Signal::Offer(_) => action::OFFER,
            Signal::Answer(_) => action::ANSWER,
            Signal::Candidate(_) => action::CANDIDATE,
            Signal::ServerStarted { .. } => action::SERVER_STARTED,
            Signal::ServerStopped { .. } => action::SERVER_STOPPED,
            Signal::ConnectionRejected { .. } => action::CONNECTION_REJECTED,
            Signal::Unknown(action) => action,
        }
    }

    pub fn to_message(&self) -> Result<SignalMessage, SignalError> {
        let payload = match self {
            Signal::Offer(description) | Signal::Answer(description) => {
                to_object(&DescriptionPayload {
                    description: description.clone(),
                })?
            }
            Signal::Candidate(candidate) => to_object(&CandidatePayload {
                candidate: candidate.clone(),
            })?,
            Signal::ServerStarted { message }
            | Signal::ServerStopped { message }
            | Signal::ConnectionRejected { message } => to_object(&NoticePayload {
                message: message.clone(),
            })?,
            Signal::Unknown(_) => None,
        };
        Ok(SignalMessage {
            action: self.action().to_string(),
            payload,
        })
    }

    /// Неизвестный action не ошибка, а `Signal::Unknown`
    pub fn from_message(msg: &SignalMessage) -> Result<Signal, SignalError> {
        let signal = match msg.action.as_str() {
            action::OFFER => Signal::Offer(payload::<DescriptionPayload>(msg)?.description),
            action::ANSWER => Signal::Answer(payload::<DescriptionPayload>(msg)?.description),
            action::CANDIDATE => Signal::Candidate(payload::<CandidatePayload>(msg)?.candidate),
            action::SERVER_STARTED => Signal::ServerStarted {
                message: payload::<NoticePayload>(msg)?.message,
            },
            action::SERVER_STOPPED => Signal::ServerStopped {
                message: payload::<NoticePayload>(msg)?.message,
            },
            action::CONNECTION_REJECTED => Signal::ConnectionRejected {
                message: payload::<NoticePayload>(msg)?.message,
            },
            other => Signal::Unknown(other.to_string()),
        };
        Ok(signal)
    }
}

fn to_object<T: Serialize>(value: &T) -> Result<Option<Map<String, Value>>, SignalError> {
    match serde_json::to_value(value)? {
        Value::Object(map) if map.is_empty() => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        _ => Ok(None),
    }
}

fn payload<T: DeserializeOwned>(msg: &SignalMessage) -> Result<T, SignalError> {
    let value = Value::Object(msg.payload.clone().unwrap_or_default());
    serde_json::from_value(value).map_err(|source| SignalError::MalformedPayload {
        action: msg.action.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_from_wire_json() {
        let msg: SignalMessage = serde_json::from_value(json!({
            "action": "offer",
            "payload": { "description": { "type": "offer", "sdp": "v=0" } }
        }))
        .expect("wire message");

        let signal = Signal::from_message(&msg).expect("offer");
        assert_eq!(signal, Signal::Offer(SessionDescription::offer("v=0")));
    }

    #[test]
    fn notice_without_payload() {
        let msg: SignalMessage =
            serde_json::from_value(json!({ "action": "server-stopped" })).expect("wire message");
        assert_eq!(
            Signal::from_message(&msg).expect("notice"),
            Signal::ServerStopped { message: None }
        );
    }

    #[test]
    fn unknown_action_is_not_an_error() {
        let msg = SignalMessage {
            action: "webrtc-ping".into(),
            payload: None,
        };
        assert_eq!(
            Signal::from_message(&msg).expect("unknown"),
            Signal::Unknown("webrtc-ping".into())
        );
    }

    #[test]
    fn candidate_without_candidate_field_is_malformed() {
        let msg: SignalMessage = serde_json::from_value(json!({
            "action": "candidate",
            "payload": { "sdpMid": "0" }
        }))
        .expect("wire message");

        match Signal::from_message(&msg) {
            Err(SignalError::MalformedPayload { action, .. }) => assert_eq!(action, "candidate"),
            other => panic!("expected malformed payload, got {other:?}"),
        }
    }

    #[test]
    fn rejection_keeps_reason_on_the_wire() {
        let msg = Signal::ConnectionRejected {
            message: Some("server not started".into()),
        }
        .to_message()
        .expect("encode");
        let wire = serde_json::to_value(&msg).expect("json");
        assert_eq!(
            wire,
            json!({ "action": "connection-rejected", "payload": { "message": "server not started" } })
        );
    }
}
