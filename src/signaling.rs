pub mod bus;
pub mod message;

pub use bus::{Delivery, SignalHandler, SignalSink, SignalingBus};
pub use message::{action, Envelope, Signal, SignalMessage};
