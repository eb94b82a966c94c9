use serde::{Deserialize, Serialize};
use std::fmt;

/// Состояние согласования одной сессии.
///
/// Инициатор: `new → offer-created → offer-sent → answer-received → connecting`.
/// Отвечающий: `new → offer-received → answer-created → answer-sent → connecting`.
/// Дальше `connecting → connected | failed`. `closed` достижим из любого состояния.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    New,
    OfferCreated,
    OfferSent,
    OfferReceived,
    AnswerCreated,
    AnswerSent,
    AnswerReceived,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    /// Допустим ли переход `self → next`
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            // инициатор
            (New, OfferCreated)
            | (OfferCreated, OfferSent)
            | (OfferSent, AnswerReceived)
            | (AnswerReceived, Connecting) => true,
            // отвечающий
            (New, OfferReceived)
            | (OfferReceived, AnswerCreated)
            | (AnswerCreated, AnswerSent)
            | (AnswerSent, Connecting) => true,
            (Connecting, Connected) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::New => "new",
            NegotiationState::OfferCreated => "offer-created",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::AnswerCreated => "answer-created",
            NegotiationState::AnswerSent => "answer-sent",
            NegotiationState::AnswerReceived => "answer-received",
            NegotiationState::Connecting => "connecting",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::NegotiationState::*;
    use super::*;

    #[test]
    fn initiator_path_is_linear() {
        let path = [New, OfferCreated, OfferSent, AnswerReceived, Connecting, Connected];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!New.can_transition_to(OfferSent));
        assert!(!OfferCreated.can_transition_to(AnswerReceived));
        assert!(!OfferSent.can_transition_to(Connecting));
    }

    #[test]
    fn responder_path_is_linear() {
        let path = [New, OfferReceived, AnswerCreated, AnswerSent, Connecting, Connected];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!New.can_transition_to(AnswerSent));
        assert!(!OfferReceived.can_transition_to(AnswerReceived));
    }

    #[test]
    fn terminal_states() {
        assert!(Connected.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Closed));
        assert!(!Failed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(New));
    }

    #[test]
    fn serializes_kebab_case() {
        let json = serde_json::to_string(&AnswerReceived).expect("serialize");
        assert_eq!(json, "\"answer-received\"");
        assert_eq!(OfferCreated.to_string(), "offer-created");
    }
}
