use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

use crate::config::ServerConfig;
use crate::peer::types::{IceCandidate, PeerId};
use crate::utils::add_ice_url_scheme;

/// Кандидаты, полученные до установки remote description.
/// Применяются строго в порядке поступления.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn extend(&mut self, candidates: impl IntoIterator<Item = IceCandidate>) {
        self.queue.extend(candidates);
    }

    pub fn pop(&mut self) -> Option<IceCandidate> {
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Кандидаты для сессий, которых ещё нет (offer не дошёл).
/// Хранятся ограниченное время и не создают записей в реестре.
#[derive(Debug)]
pub struct OrphanCandidates {
    ttl: Duration,
    buffered: HashMap<PeerId, VecDeque<(Instant, IceCandidate)>>,
}

impl OrphanCandidates {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            buffered: HashMap::new(),
        }
    }

    pub fn push(&mut self, peer: &PeerId, candidate: IceCandidate) {
        self.prune();
        self.buffered
            .entry(peer.clone())
            .or_default()
            .push_back((Instant::now(), candidate));
    }

    /// Забирает непросроченные кандидаты участника в порядке поступления
    pub fn take(&mut self, peer: &PeerId) -> Vec<IceCandidate> {
        let Some(entries) = self.buffered.remove(peer) else {
            return Vec::new();
        };
        let total = entries.len();
        let fresh: Vec<IceCandidate> = entries
            .into_iter()
            .filter(|(at, _)| at.elapsed() <= self.ttl)
            .map(|(_, candidate)| candidate)
            .collect();
        if fresh.len() < total {
            debug!(peer = %peer, expired = total - fresh.len(), "dropping expired orphan candidates");
        }
        fresh
    }

    pub fn prune(&mut self) {
        let ttl = self.ttl;
        self.buffered.retain(|_, entries| {
            entries.retain(|(at, _)| at.elapsed() <= ttl);
            !entries.is_empty()
        });
    }

    pub fn clear(&mut self) {
        self.buffered.clear();
    }

    pub fn len(&self, peer: &PeerId) -> usize {
        self.buffered.get(peer).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub prflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateStats {
    let mut stats = CandidateStats::default();
    for candidate in candidates {
        match candidate.kind() {
            Some("host") => stats.host += 1,
            Some("srflx") => stats.srflx += 1,
            Some("prflx") => stats.prflx += 1,
            Some("relay") => stats.relay += 1,
            _ => {}
        }
    }

    info!(
        host = stats.host,
        srflx = stats.srflx,
        prflx = stats.prflx,
        relay = stats.relay,
        "candidate analysis"
    );
    if stats.relay == 0 {
        warn!("no TURN relay candidates found, connection through NAT may fail");
    }
    stats
}

/// Проверка доступности STUN/TURN сервера через сбор кандидатов:
/// для STUN ждём srflx, для TURN ждём relay.
pub async fn probe_ice_server(config: &ServerConfig, wait: Duration) -> bool {
    let url = add_ice_url_scheme(config);
    debug!(url = %url, kind = %config.r#type, "probing ice server");

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    match api.new_peer_connection(rtc_config).await {
        Ok(pc) => {
            let pc = Arc::new(pc);
            let result = check_via_ice_gathering(&pc, &config.r#type, wait).await;
            if let Err(err) = pc.close().await {
                debug!(error = %err, "probe peer close failed");
            }
            result
        }
        Err(err) => {
            warn!(error = %err, "failed to create probe peer connection");
            false
        }
    }
}

async fn check_via_ice_gathering(
    pc: &Arc<RTCPeerConnection>,
    server_type: &str,
    wait: Duration,
) -> bool {
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));

    let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel();
    let wanted = if server_type == "turn" { "relay" } else { "srflx" };
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            if let Ok(init) = c.to_json() {
                let kind = IceCandidate::new(init.candidate.clone());
                if kind.kind() == Some(wanted) {
                    debug!(candidate = %init.candidate, "probe found matching candidate");
                    let _ = candidate_tx.send(true);
                }
            }
        }
        Box::pin(async {})
    }));

    // без data channel сбор кандидатов не начнётся
    if let Err(err) = pc.create_data_channel("probe", None).await {
        warn!(error = %err, "failed to create probe data channel");
        return false;
    }
    let offer = match pc.create_offer(None).await {
        Ok(offer) => offer,
        Err(err) => {
            warn!(error = %err, "failed to create probe offer");
            return false;
        }
    };
    if let Err(err) = pc.set_local_description(offer).await {
        warn!(error = %err, "failed to set probe local description");
        return false;
    }

    tokio::select! {
        result = timeout(wait, candidate_rx.recv()) => match result {
            Ok(Some(found)) => found,
            Ok(None) => false,
            Err(_) => {
                debug!(wait_ms = wait.as_millis() as u64, "probe timed out");
                false
            }
        },
        _ = async {
            while let Some(state) = state_rx.recv().await {
                if state == RTCIceGathererState::Complete {
                    break;
                }
            }
        } => {
            debug!("gathering completed without a matching candidate");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn pending_is_fifo() {
        let mut pending = PendingCandidates::default();
        pending.push(cand(1));
        pending.extend([cand(2), cand(3)]);
        assert_eq!(pending.len(), 3);
        assert_eq!(pending.pop(), Some(cand(1)));
        assert_eq!(pending.pop(), Some(cand(2)));
        assert_eq!(pending.pop(), Some(cand(3)));
        assert!(pending.is_empty());
    }

    #[test]
    fn orphans_are_taken_once_in_order() {
        let mut orphans = OrphanCandidates::new(Duration::from_secs(10));
        let peer: PeerId = "student-1".into();
        orphans.push(&peer, cand(1));
        orphans.push(&peer, cand(2));
        orphans.push(&"student-2".into(), cand(9));

        assert_eq!(orphans.len(&peer), 2);
        assert_eq!(orphans.take(&peer), vec![cand(1), cand(2)]);
        assert!(orphans.take(&peer).is_empty());
        assert_eq!(orphans.len(&"student-2".into()), 1);
    }

    #[test]
    fn expired_orphans_are_dropped() {
        let mut orphans = OrphanCandidates::new(Duration::ZERO);
        let peer: PeerId = "student-1".into();
        orphans.push(&peer, cand(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(orphans.take(&peer).is_empty());
        orphans.push(&peer, cand(2));
        std::thread::sleep(Duration::from_millis(5));
        orphans.prune();
        assert!(orphans.is_empty());
    }

    #[test]
    fn candidate_analysis_counts_types() {
        let candidates = vec![
            cand(1),
            IceCandidate::new("candidate:2 1 udp 1 198.51.100.7 6000 typ srflx raddr 10.0.0.1 rport 5000"),
            IceCandidate::new("candidate:3 1 udp 1 203.0.113.9 3478 typ relay raddr 0.0.0.0 rport 0"),
        ];
        let stats = analyze_candidates(&candidates);
        assert_eq!(
            stats,
            CandidateStats {
                host: 1,
                srflx: 1,
                prflx: 0,
                relay: 1
            }
        );
    }
}
