pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod utils;

pub use commands::{Orchestrator, OrchestratorStatus};
pub use config::{IceConfig, OrchestratorConfig, ServerConfig};
pub use error::{ConfigError, SessionError, SessionResult, SignalError};
pub use logger::{init_logging, LogConfig};
pub use peer::{
    ConnectionSnapshot, EngineFactory, LoopbackFactory, NegotiationState, PeerId, Role,
    SessionId, TransportEngine, WebRtcEngineFactory,
};
pub use registry::SessionRegistry;
pub use session::SessionNegotiator;
pub use signaling::{Delivery, Signal, SignalingBus};
