pub mod connection;
pub mod data_channel;
pub mod engine;
pub mod ice;
pub mod loopback;
pub mod state;
pub mod types;

pub use connection::{WebRtcEngine, WebRtcEngineFactory};
pub use engine::{EngineError, EngineEvent, EngineEvents, EngineFactory, TransportEngine};
pub use loopback::{LoopbackEngine, LoopbackFactory, LoopbackHandle};
pub use state::NegotiationState;
pub use types::{
    ConnectionSnapshot, ConnectivityState, DataChannelState, IceCandidate, PeerId, Role,
    SdpKind, SessionDescription, SessionId, TransportState, TransportStatus,
};
