use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::{
    api::APIBuilder,
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

use crate::config::IceConfig;
use crate::peer::data_channel::{attach_dc, detach_dc, DataChannelSlot, DATA_CHANNEL_LABEL};
use crate::peer::engine::{
    EngineError, EngineEvent, EngineEvents, EngineFactory, EventEmitter, TransportEngine,
};
use crate::peer::types::{
    ConnectivityState, IceCandidate, SdpKind, SessionDescription, SessionId, TransportState,
    TransportStatus,
};
use crate::utils::add_ice_url_scheme;

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

impl From<RTCIceConnectionState> for ConnectivityState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => ConnectivityState::Checking,
            RTCIceConnectionState::Connected => ConnectivityState::Connected,
            RTCIceConnectionState::Completed => ConnectivityState::Completed,
            RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCIceConnectionState::Failed => ConnectivityState::Failed,
            RTCIceConnectionState::Closed => ConnectivityState::Closed,
            _ => ConnectivityState::New,
        }
    }
}

fn to_description(desc: &RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp.clone())),
        other => Err(EngineError::Rejected(format!(
            "unsupported sdp type {other}"
        ))),
    }
}

fn from_description(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

/// Конфигурация peer connection: TURN из настроек плюс STUN
pub fn rtc_config(ice: &IceConfig) -> RTCConfiguration {
    let ice_servers = ice
        .servers()
        .into_iter()
        .map(|server| RTCIceServer {
            urls: vec![add_ice_url_scheme(&server)],
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Движок на webrtc-rs: одна peer connection на сессию
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    data_channel: DataChannelSlot,
    events: EventEmitter,
}

impl WebRtcEngine {
    /// создаём Peer; если `initiator`, то сами делаем data-channel
    pub async fn new(
        ice: &IceConfig,
        session: &SessionId,
        initiator: bool,
    ) -> Result<Self, EngineError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(api.new_peer_connection(rtc_config(ice)).await?);
        let events = EventEmitter::default();
        let data_channel: DataChannelSlot = Arc::new(Mutex::new(None));

        let emitter = events.clone();
        let label = session.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        debug!(session = %label, candidate = %init.candidate, "local candidate");
                        emitter.emit(EngineEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(session = %label, error = %err, "failed to serialize local candidate"),
                },
                // cand == None означает конец сбора
                None => debug!(session = %label, "ice candidate gathering completed"),
            }
            Box::pin(async {})
        }));

        let emitter = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            emitter.emit(EngineEvent::ConnectionStateChanged(st.into()));
            Box::pin(async {})
        }));

        let emitter = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
            emitter.emit(EngineEvent::ConnectivityStateChanged(st.into()));
            Box::pin(async {})
        }));

        if initiator {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await?;
            attach_dc(&dc, &events, &data_channel);
        } else {
            let emitter = events.clone();
            let slot = data_channel.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                attach_dc(&dc, &emitter, &slot);
                // канал ответчика приходит к уже подписанному переговорщику
                emitter.emit(EngineEvent::DataChannelStateChanged(dc.ready_state().into()));
                Box::pin(async {})
            }));
        }

        Ok(Self {
            pc,
            data_channel,
            events,
        })
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn create_local_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await?;
        to_description(&offer)
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await?;
        to_description(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc.set_local_description(from_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(from_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.events.detach();
        detach_dc(&self.data_channel).await;
        self.pc.close().await?;
        Ok(())
    }

    fn subscribe(&self) -> EngineEvents {
        self.events.subscribe()
    }

    fn status(&self) -> TransportStatus {
        TransportStatus {
            connection: self.pc.connection_state().into(),
            connectivity: self.pc.ice_connection_state().into(),
            data_channel: self
                .data_channel
                .lock()
                .as_ref()
                .map(|dc| dc.ready_state().into()),
        }
    }
}

pub struct WebRtcEngineFactory {
    ice: IceConfig,
}

impl WebRtcEngineFactory {
    pub fn new(ice: IceConfig) -> Self {
        Self { ice }
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        session: &SessionId,
        initiator: bool,
    ) -> Result<Arc<dyn TransportEngine>, EngineError> {
        let engine = WebRtcEngine::new(&self.ice, session, initiator).await?;
        Ok(Arc::new(engine))
    }
}
