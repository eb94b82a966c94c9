use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::peer::engine::{EngineEvent, EventEmitter};
use crate::peer::types::DataChannelState;

pub type DataChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// Канал ученика: упорядоченный, создаётся инициатором
pub const DATA_CHANNEL_LABEL: &str = "studentChannel";

impl From<RTCDataChannelState> for DataChannelState {
    fn from(state: RTCDataChannelState) -> Self {
        match state {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            _ => DataChannelState::Connecting,
        }
    }
}

/// общий обработчик data-channel: запоминаем канал и пробрасываем смену состояния в события.
/// Начальное состояние не шлётся: его видно через слот в `status()`.
pub fn attach_dc(dc: &Arc<RTCDataChannel>, events: &EventEmitter, slot: &DataChannelSlot) {
    debug!(label = dc.label(), "attach_dc called");
    *slot.lock() = Some(dc.clone());

    let on_open = events.clone();
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        debug!(label = %label, "data channel opened");
        on_open.emit(EngineEvent::DataChannelStateChanged(DataChannelState::Open));
        Box::pin(async {})
    }));

    let on_close = events.clone();
    dc.on_close(Box::new(move || {
        debug!("data channel closed");
        on_close.emit(EngineEvent::DataChannelStateChanged(DataChannelState::Closed));
        Box::pin(async {})
    }));

    dc.on_error(Box::new(move |err| {
        warn!(error = %err, "data channel error");
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg| {
        debug!(len = msg.data.len(), "data channel message");
        Box::pin(async {})
    }));
}

/// Закрывает канал и освобождает слот
pub async fn detach_dc(slot: &DataChannelSlot) {
    let dc = slot.lock().take();
    if let Some(dc) = dc {
        if let Err(err) = dc.close().await {
            debug!(error = %err, "data channel close failed");
        }
    }
}
