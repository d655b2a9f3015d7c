/**
 * p2p/hole_punch.rs
 *
 * Hole-punch coordination: a per-session state machine driven by
 * discovery messages. Both sides agree on a go moment, open a NAT
 * mapping with a UDP probe burst, then attempt a bounded TCP connect
 * to the peer's public endpoint.
 */

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::protocol::{
    DiscoveryMessage, HolePunchCoordinationData, HolePunchSignal, MessagePayload,
};
use super::registry::ReflexiveCache;
use super::types::{LocalIdentity, NatType, P2pConfig, P2pError, StunResult};

/// Marker leading every probe datagram
const PROBE_MAGIC: &[u8; 4] = b"SRHP";

/// Session lifecycle. `Connected`, `Failed` and `TimedOut` are terminal:
/// nothing transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolePunchSessionState {
    Initiated,
    Responded,
    Connecting,
    Connected,
    Failed,
    TimedOut,
}

impl HolePunchSessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HolePunchSessionState::Connected
                | HolePunchSessionState::Failed
                | HolePunchSessionState::TimedOut
        )
    }
}

/// Book-keeping for one coordination exchange with one peer
#[derive(Debug, Clone)]
pub struct HolePunchSession {
    pub session_id: u64,
    pub peer_id: String,
    pub peer_host_name: String,
    pub peer_lan_ip: Option<IpAddr>,
    pub peer_transfer_port: u16,
    pub peer_public_endpoint: Option<SocketAddr>,
    pub our_public_endpoint: Option<SocketAddr>,
    pub peer_nat_type: NatType,
    pub our_nat_type: NatType,
    pub created_at: Instant,
    /// Coordinated connect moment, Unix milliseconds
    pub go_time: Option<u64>,
    pub state: HolePunchSessionState,
}

impl HolePunchSession {
    /// Move to `next` unless a terminal state has already been reached.
    fn advance(&mut self, next: HolePunchSessionState) -> bool {
        if self.state.is_terminal() {
            debug!(
                session = self.session_id,
                "refusing transition {:?} -> {:?}", self.state, next
            );
            return false;
        }
        debug!(
            session = self.session_id,
            "session {:?} -> {:?}", self.state, next
        );
        self.state = next;
        true
    }
}

/// A connection accepted while acting as the responder side
#[derive(Debug)]
pub struct IncomingPeer {
    pub peer_id: String,
    pub remote: SocketAddr,
    pub stream: TcpStream,
}

/// What a finished punch attempt yields: the connected socket plus its
/// confirmed remote address.
pub type PunchOutcome = Result<(TcpStream, SocketAddr), P2pError>;

struct SessionEntry {
    session: HolePunchSession,
    /// Present on the initiator side only; the awaiting `punch` call
    completion: Option<oneshot::Sender<PunchOutcome>>,
}

/// Whether a hole punch is worth attempting for this NAT pairing: false
/// exactly when both sides are symmetric.
pub fn can_hole_punch(ours: NatType, theirs: NatType) -> bool {
    !(ours == NatType::Symmetric && theirs == NatType::Symmetric)
}

/// Coordinates hole-punch sessions over the discovery channel. Outbound
/// envelopes go to `outbound` (peer id, message); the external discovery
/// service owns the transport and feeds inbound envelopes back through
/// `handle_message`.
pub struct HolePunchCoordinator {
    config: P2pConfig,
    identity: LocalIdentity,
    reflexive: Arc<ReflexiveCache>,
    sessions: Arc<Mutex<HashMap<u64, SessionEntry>>>,
    outbound: mpsc::Sender<(String, DiscoveryMessage)>,
    incoming: mpsc::Sender<IncomingPeer>,
}

impl HolePunchCoordinator {
    pub fn new(
        config: P2pConfig,
        identity: LocalIdentity,
        reflexive: Arc<ReflexiveCache>,
        outbound: mpsc::Sender<(String, DiscoveryMessage)>,
    ) -> (Self, mpsc::Receiver<IncomingPeer>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(8);
        (
            Self {
                config,
                identity,
                reflexive,
                sessions: Arc::new(Mutex::new(HashMap::new())),
                outbound,
                incoming: incoming_tx,
            },
            incoming_rx,
        )
    }

    /// Number of live coordination sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Snapshot of one session, if it is still alive.
    pub async fn session(&self, session_id: u64) -> Option<HolePunchSession> {
        self.sessions
            .lock()
            .await
            .get(&session_id)
            .map(|entry| entry.session.clone())
    }

    /// Initiate a punch toward `peer_id` and wait for the outcome, bounded
    /// by the session budget.
    pub async fn punch(
        &self,
        peer_id: &str,
        peer_public: SocketAddr,
        ours: &StunResult,
    ) -> PunchOutcome {
        let our_public = ours
            .public_endpoint()
            .ok_or_else(|| P2pError::NetworkUnreachable("own public endpoint unknown".into()))?;

        let session_id: u64 = rand::random();
        let (tx, rx) = oneshot::channel();
        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                session_id,
                SessionEntry {
                    session: HolePunchSession {
                        session_id,
                        peer_id: peer_id.to_string(),
                        peer_host_name: String::new(),
                        peer_lan_ip: None,
                        peer_transfer_port: 0,
                        peer_public_endpoint: Some(peer_public),
                        our_public_endpoint: Some(our_public),
                        peer_nat_type: NatType::Unknown,
                        our_nat_type: ours.nat_type,
                        created_at: Instant::now(),
                        go_time: None,
                        state: HolePunchSessionState::Initiated,
                    },
                    completion: Some(tx),
                },
            );
        }

        let request = self.coordination(
            session_id,
            HolePunchSignal::Request,
            Some(our_public),
            ours.nat_type,
            None,
            None,
        );
        if let Err(err) = self
            .send(peer_id, MessagePayload::HolePunchRequest(request))
            .await
        {
            // Nothing went out, so no timer exists to reap the entry
            self.sessions.lock().await.remove(&session_id);
            return Err(err);
        }

        info!(session = session_id, peer = peer_id, "hole punch initiated");

        match timeout(self.config.hole_punch_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(P2pError::SessionExpired),
            Err(_) => {
                self.expire(session_id).await;
                Err(P2pError::SessionExpired)
            }
        }
    }

    /// Feed an inbound envelope into the state machine. Non-hole-punch
    /// payloads are ignored; the discovery service can forward everything.
    pub async fn handle_message(&self, message: &DiscoveryMessage) {
        let data = match &message.payload {
            MessagePayload::HolePunchRequest(data)
            | MessagePayload::HolePunchResponse(data)
            | MessagePayload::HolePunchGo(data) => data.clone(),
            _ => return,
        };

        match data.signal {
            HolePunchSignal::Request => self.on_request(message, data).await,
            HolePunchSignal::Response => self.on_response(data).await,
            HolePunchSignal::Go => self.on_go(data).await,
            HolePunchSignal::Fail => self.on_fail(data).await,
        }
    }

    /// Responder side: record the session, answer with our own mapping.
    async fn on_request(&self, message: &DiscoveryMessage, data: HolePunchCoordinationData) {
        info!(
            session = data.session_id,
            peer = %message.peer_id,
            "hole punch request received"
        );

        let ours = self.reflexive.public_endpoint().await;
        let our_public = match ours.public_endpoint() {
            Some(endpoint) => endpoint,
            None => {
                warn!(
                    session = data.session_id,
                    "cannot respond: own public endpoint unknown"
                );
                self.send_fail(&message.peer_id, data.session_id, "responder has no public endpoint")
                    .await;
                return;
            }
        };

        // Refuse early so the initiator does not sit out its full budget
        if !can_hole_punch(ours.nat_type, data.nat_type) {
            self.send_fail(
                &message.peer_id,
                data.session_id,
                "NAT types incompatible: both peers symmetric",
            )
            .await;
            return;
        }

        let session = HolePunchSession {
            session_id: data.session_id,
            peer_id: message.peer_id.clone(),
            peer_host_name: message.host_name.clone(),
            peer_lan_ip: Some(data.local_ip),
            peer_transfer_port: message.transfer_port,
            peer_public_endpoint: Some(data.public_endpoint()),
            our_public_endpoint: Some(our_public),
            peer_nat_type: data.nat_type,
            our_nat_type: ours.nat_type,
            created_at: Instant::now(),
            go_time: None,
            state: HolePunchSessionState::Responded,
        };

        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                data.session_id,
                SessionEntry {
                    session,
                    completion: None,
                },
            );
        }

        let response = self.coordination(
            data.session_id,
            HolePunchSignal::Response,
            Some(our_public),
            ours.nat_type,
            None,
            None,
        );
        if self
            .send(&message.peer_id, MessagePayload::HolePunchResponse(response))
            .await
            .is_err()
        {
            warn!(session = data.session_id, "discovery channel closed");
        }

        // Responder sessions expire too if the go signal never arrives
        let sessions = Arc::clone(&self.sessions);
        let budget = self.config.hole_punch_timeout;
        let session_id = data.session_id;
        tokio::spawn(async move {
            sleep(budget).await;
            let mut sessions = sessions.lock().await;
            if let Some(entry) = sessions.get_mut(&session_id) {
                // An attempt in flight delivers its own outcome; reaping it
                // here would drop a connection that is about to land
                if entry.session.state == HolePunchSessionState::Connecting {
                    return;
                }
                if !entry.session.state.is_terminal() {
                    entry.session.advance(HolePunchSessionState::TimedOut);
                    warn!(session = session_id, "responder session timed out");
                }
                sessions.remove(&session_id);
            }
        });
    }

    /// Initiator side: the peer answered; pick the go moment and commit.
    async fn on_response(&self, data: HolePunchCoordinationData) {
        enum Next {
            Ignore,
            Incompatible { peer_id: String },
            Go {
                peer_id: String,
                our_public: Option<SocketAddr>,
                our_nat: NatType,
                go_time: u64,
            },
        }

        let next = {
            let mut sessions = self.sessions.lock().await;
            let next = match sessions.get_mut(&data.session_id) {
                None => {
                    // A response must never outrun its recorded request
                    warn!(
                        session = data.session_id,
                        "dropping response for unknown session"
                    );
                    Next::Ignore
                }
                Some(entry) if entry.session.state != HolePunchSessionState::Initiated => {
                    debug!(
                        session = data.session_id,
                        "response out of order in state {:?}", entry.session.state
                    );
                    Next::Ignore
                }
                Some(entry) => {
                    entry.session.peer_public_endpoint = Some(data.public_endpoint());
                    entry.session.peer_nat_type = data.nat_type;

                    if !can_hole_punch(entry.session.our_nat_type, data.nat_type) {
                        let peer_id = entry.session.peer_id.clone();
                        entry.session.advance(HolePunchSessionState::Failed);
                        if let Some(tx) = entry.completion.take() {
                            let _ = tx.send(Err(P2pError::NatIncompatible));
                        }
                        Next::Incompatible { peer_id }
                    } else {
                        let go_time =
                            unix_now_millis() + self.config.sync_delay.as_millis() as u64;
                        entry.session.go_time = Some(go_time);
                        entry.session.advance(HolePunchSessionState::Connecting);
                        Next::Go {
                            peer_id: entry.session.peer_id.clone(),
                            our_public: entry.session.our_public_endpoint,
                            our_nat: entry.session.our_nat_type,
                            go_time,
                        }
                    }
                }
            };
            if matches!(next, Next::Incompatible { .. }) {
                sessions.remove(&data.session_id);
            }
            next
        };

        match next {
            Next::Ignore => {}
            Next::Incompatible { peer_id } => {
                self.send_fail(
                    &peer_id,
                    data.session_id,
                    "NAT types incompatible: both peers symmetric",
                )
                .await;
            }
            Next::Go {
                peer_id,
                our_public,
                our_nat,
                go_time,
            } => {
                let go = self.coordination(
                    data.session_id,
                    HolePunchSignal::Go,
                    our_public,
                    our_nat,
                    Some(go_time),
                    None,
                );
                if let Err(err) = self
                    .send(&peer_id, MessagePayload::HolePunchGo(go))
                    .await
                {
                    self.fail_session(data.session_id, err).await;
                    return;
                }
                self.spawn_attempt(data.session_id, data.public_endpoint(), go_time);
            }
        }
    }

    /// Responder side: the initiator fixed the go moment; commit to it.
    async fn on_go(&self, data: HolePunchCoordinationData) {
        let go_time = match data.go_time {
            Some(t) => t,
            None => {
                warn!(session = data.session_id, "go signal without go_time");
                return;
            }
        };

        let peer_public = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&data.session_id) {
                None => {
                    warn!(session = data.session_id, "dropping go for unknown session");
                    return;
                }
                Some(entry) if entry.session.state != HolePunchSessionState::Responded => {
                    debug!(
                        session = data.session_id,
                        "go out of order in state {:?}", entry.session.state
                    );
                    return;
                }
                Some(entry) => {
                    entry.session.go_time = Some(go_time);
                    entry.session.advance(HolePunchSessionState::Connecting);
                    entry.session.peer_public_endpoint
                }
            }
        };

        let Some(peer_public) = peer_public else {
            return;
        };
        self.spawn_attempt(data.session_id, peer_public, go_time);
    }

    async fn on_fail(&self, data: HolePunchCoordinationData) {
        let reason = data
            .error_message
            .clone()
            .unwrap_or_else(|| "peer aborted".to_string());
        warn!(session = data.session_id, "peer signalled failure: {}", reason);
        self.fail_session(data.session_id, P2pError::ProtocolError(reason))
            .await;
    }

    fn spawn_attempt(&self, session_id: u64, peer_public: SocketAddr, go_time: u64) {
        let sessions = Arc::clone(&self.sessions);
        let incoming = self.incoming.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let outcome = attempt_connect(&config, session_id, peer_public, go_time).await;
            complete_session(&sessions, &incoming, session_id, outcome).await;
        });
    }

    async fn expire(&self, session_id: u64) {
        let mut sessions = self.sessions.lock().await;
        if let Some(mut entry) = sessions.remove(&session_id) {
            entry.session.advance(HolePunchSessionState::TimedOut);
            warn!(session = session_id, "hole punch session timed out");
        }
    }

    async fn fail_session(&self, session_id: u64, err: P2pError) {
        let mut sessions = self.sessions.lock().await;
        if let Some(mut entry) = sessions.remove(&session_id) {
            entry.session.advance(HolePunchSessionState::Failed);
            if let Some(tx) = entry.completion.take() {
                let _ = tx.send(Err(err));
            }
        }
    }

    async fn send_fail(&self, peer_id: &str, session_id: u64, reason: &str) {
        // Carried in a response-kind envelope; the signal field is authoritative
        let fail = self.coordination(
            session_id,
            HolePunchSignal::Fail,
            None,
            NatType::Unknown,
            None,
            Some(reason.to_string()),
        );
        if self
            .send(peer_id, MessagePayload::HolePunchResponse(fail))
            .await
            .is_err()
        {
            warn!(session = session_id, "could not signal failure to {}", peer_id);
        }
    }

    async fn send(&self, peer_id: &str, payload: MessagePayload) -> Result<(), P2pError> {
        let message = DiscoveryMessage::new(
            &self.identity.host_name,
            &self.identity.peer_id,
            self.identity.transfer_port,
            payload,
        );
        self.outbound
            .send((peer_id.to_string(), message))
            .await
            .map_err(|_| P2pError::NetworkUnreachable("discovery channel closed".into()))
    }

    fn coordination(
        &self,
        session_id: u64,
        signal: HolePunchSignal,
        public: Option<SocketAddr>,
        nat_type: NatType,
        go_time: Option<u64>,
        error_message: Option<String>,
    ) -> HolePunchCoordinationData {
        HolePunchCoordinationData {
            session_id,
            signal,
            public_ip: public
                .map(|p| p.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            public_port: public.map(|p| p.port()).unwrap_or(0),
            local_ip: self.identity.lan_ip,
            local_port: self.identity.transfer_port,
            nat_type,
            go_time,
            error_message,
        }
    }
}

/// Wait for the shared go moment, open a NAT mapping with a probe burst,
/// give it a beat to settle, then try one bounded TCP connect.
async fn attempt_connect(
    config: &P2pConfig,
    session_id: u64,
    peer_public: SocketAddr,
    go_time: u64,
) -> PunchOutcome {
    sleep_until_go(go_time).await;

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| P2pError::NetworkUnreachable(e.to_string()))?;

    let probe = probe_datagram(session_id);
    for attempt in 0..config.probe_count {
        if let Err(err) = socket.send_to(&probe, peer_public).await {
            debug!(
                session = session_id,
                "probe {} to {} failed: {}", attempt, peer_public, err
            );
        }
        sleep(config.probe_interval).await;
    }

    // Let the NAT install the mapping before the SYN goes out
    sleep(config.mapping_settle).await;

    match timeout(config.connect_timeout, TcpStream::connect(peer_public)).await {
        Ok(Ok(stream)) => {
            let remote = stream
                .peer_addr()
                .map_err(|e| P2pError::NetworkUnreachable(e.to_string()))?;
            Ok((stream, remote))
        }
        Ok(Err(err)) => Err(P2pError::NetworkUnreachable(err.to_string())),
        Err(_) => Err(P2pError::Timeout(config.connect_timeout)),
    }
}

/// Deliver the outcome and destroy the session. Initiator outcomes go to
/// the awaiting `punch` call; responder successes go to the incoming
/// channel. The table lock is released before delivery: a slow consumer
/// on the incoming channel must not stall other sessions.
async fn complete_session(
    sessions: &Mutex<HashMap<u64, SessionEntry>>,
    incoming: &mpsc::Sender<IncomingPeer>,
    session_id: u64,
    outcome: PunchOutcome,
) {
    let entry = sessions.lock().await.remove(&session_id);
    let Some(mut entry) = entry else {
        // Already expired
        return;
    };

    match outcome {
        Ok((stream, remote)) => {
            entry.session.advance(HolePunchSessionState::Connected);
            info!(session = session_id, %remote, "hole punch connected");
            match entry.completion.take() {
                Some(tx) => {
                    let _ = tx.send(Ok((stream, remote)));
                }
                None => {
                    let _ = incoming
                        .send(IncomingPeer {
                            peer_id: entry.session.peer_id.clone(),
                            remote,
                            stream,
                        })
                        .await;
                }
            }
        }
        Err(err) => {
            entry.session.advance(HolePunchSessionState::Failed);
            warn!(session = session_id, "hole punch attempt failed: {}", err);
            if let Some(tx) = entry.completion.take() {
                let _ = tx.send(Err(err));
            }
        }
    }
}

fn probe_datagram(session_id: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(12);
    bytes.extend_from_slice(PROBE_MAGIC);
    bytes.extend_from_slice(&session_id.to_be_bytes());
    bytes
}

/// Sleep until the coordinated moment; a moment already in the past means
/// both sides are late together, so proceed immediately.
async fn sleep_until_go(go_time: u64) {
    let now = unix_now_millis();
    if go_time > now {
        sleep(Duration::from_millis(go_time - now)).await;
    }
}

fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::protocol::MessageType;
    use tokio::net::TcpListener;

    fn test_config() -> P2pConfig {
        P2pConfig {
            stun_servers: ["127.0.0.1:9".to_string(), "127.0.0.1:9".to_string()],
            stun_timeout: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(500),
            hole_punch_timeout: Duration::from_millis(2000),
            sync_delay: Duration::from_millis(20),
            probe_count: 2,
            probe_interval: Duration::from_millis(5),
            mapping_settle: Duration::from_millis(10),
            ..P2pConfig::default()
        }
    }

    fn identity(name: &str) -> LocalIdentity {
        LocalIdentity {
            peer_id: name.to_string(),
            host_name: format!("{}-host", name),
            lan_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            transfer_port: 47999,
        }
    }

    fn seeded_stun(port: u16, nat_type: NatType) -> StunResult {
        StunResult {
            success: true,
            nat_type,
            public_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            public_port: port,
            error: None,
        }
    }

    fn make_session(state: HolePunchSessionState) -> HolePunchSession {
        HolePunchSession {
            session_id: 1,
            peer_id: "peer".into(),
            peer_host_name: String::new(),
            peer_lan_ip: None,
            peer_transfer_port: 0,
            peer_public_endpoint: None,
            our_public_endpoint: None,
            peer_nat_type: NatType::Unknown,
            our_nat_type: NatType::Unknown,
            created_at: Instant::now(),
            go_time: None,
            state,
        }
    }

    async fn coordinator(
        config: P2pConfig,
        name: &str,
        stun: Option<StunResult>,
    ) -> (
        Arc<HolePunchCoordinator>,
        mpsc::Receiver<(String, DiscoveryMessage)>,
        mpsc::Receiver<IncomingPeer>,
        Arc<ReflexiveCache>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let reflexive = Arc::new(ReflexiveCache::new(&config));
        if let Some(stun) = stun {
            reflexive.seed(stun).await;
        }
        let (coordinator, incoming) =
            HolePunchCoordinator::new(config, identity(name), Arc::clone(&reflexive), outbound_tx);
        (Arc::new(coordinator), outbound_rx, incoming, reflexive)
    }

    #[test]
    fn can_hole_punch_is_false_iff_both_symmetric() {
        let all = [
            NatType::Open,
            NatType::FullCone,
            NatType::RestrictedCone,
            NatType::PortRestrictedCone,
            NatType::Symmetric,
            NatType::UdpBlocked,
            NatType::Unknown,
        ];
        for ours in all {
            for theirs in all {
                let expected = !(ours == NatType::Symmetric && theirs == NatType::Symmetric);
                assert_eq!(can_hole_punch(ours, theirs), expected, "{:?}/{:?}", ours, theirs);
            }
        }
    }

    #[test]
    fn symmetric_side_with_favorable_peer_can_still_punch() {
        assert!(can_hole_punch(NatType::Symmetric, NatType::FullCone));
    }

    #[test]
    fn terminal_states_are_never_left() {
        for terminal in [
            HolePunchSessionState::Connected,
            HolePunchSessionState::Failed,
            HolePunchSessionState::TimedOut,
        ] {
            let mut session = make_session(terminal);
            for next in [
                HolePunchSessionState::Initiated,
                HolePunchSessionState::Connecting,
                HolePunchSessionState::Failed,
                HolePunchSessionState::Connected,
            ] {
                assert!(!session.advance(next));
                assert_eq!(session.state, terminal);
            }
        }
    }

    #[test]
    fn non_terminal_states_advance() {
        let mut session = make_session(HolePunchSessionState::Initiated);
        assert!(session.advance(HolePunchSessionState::Connecting));
        assert!(session.advance(HolePunchSessionState::Connected));
        assert!(session.state.is_terminal());
    }

    #[tokio::test]
    async fn unanswered_session_expires_within_budget() {
        let mut config = test_config();
        config.hole_punch_timeout = Duration::from_millis(100);
        let (coordinator, mut outbound, _incoming, _reflexive) =
            coordinator(config, "alice", None).await;

        let ours = seeded_stun(40000, NatType::FullCone);
        let err = coordinator
            .punch("bob", "127.0.0.1:9".parse().unwrap(), &ours)
            .await
            .unwrap_err();

        assert!(matches!(err, P2pError::SessionExpired));
        assert_eq!(coordinator.session_count().await, 0);

        // The request did go out before the budget ran out
        let (to, message) = outbound.recv().await.unwrap();
        assert_eq!(to, "bob");
        assert_eq!(message.message_type(), MessageType::HolePunchRequest);
    }

    #[tokio::test]
    async fn response_for_unknown_session_is_dropped() {
        let (coordinator, mut outbound, _incoming, _reflexive) =
            coordinator(test_config(), "alice", None).await;

        let data = HolePunchCoordinationData {
            session_id: 42,
            signal: HolePunchSignal::Response,
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            public_port: 1,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 1,
            nat_type: NatType::FullCone,
            go_time: None,
            error_message: None,
        };
        let message = DiscoveryMessage::new(
            "bob-host",
            "bob",
            1,
            MessagePayload::HolePunchResponse(data),
        );
        coordinator.handle_message(&message).await;

        assert_eq!(coordinator.session_count().await, 0);
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn symmetric_pair_is_refused_by_the_responder() {
        let (responder, mut outbound, _incoming, _reflexive) = coordinator(
            test_config(),
            "bob",
            Some(seeded_stun(41000, NatType::Symmetric)),
        )
        .await;

        let data = HolePunchCoordinationData {
            session_id: 77,
            signal: HolePunchSignal::Request,
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            public_port: 40000,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 40000,
            nat_type: NatType::Symmetric,
            go_time: None,
            error_message: None,
        };
        let message = DiscoveryMessage::new(
            "alice-host",
            "alice",
            1,
            MessagePayload::HolePunchRequest(data),
        );
        responder.handle_message(&message).await;

        // No session recorded, only a fail signal sent back
        assert_eq!(responder.session_count().await, 0);
        let (to, reply) = outbound.recv().await.unwrap();
        assert_eq!(to, "alice");
        match reply.payload {
            MessagePayload::HolePunchResponse(data) => {
                assert_eq!(data.signal, HolePunchSignal::Fail);
                assert!(data.error_message.is_some());
            }
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_punch_flow_over_loopback() {
        let config = test_config();

        // Each side listens where its advertised public endpoint points, so
        // the peer's post-burst TCP connect lands on a live socket.
        let alice_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let alice_public_port = alice_listener.local_addr().unwrap().port();
        let bob_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bob_public_port = bob_listener.local_addr().unwrap().port();

        let (alice, mut alice_out, _alice_in, _alice_ref) = coordinator(
            config.clone(),
            "alice",
            Some(seeded_stun(alice_public_port, NatType::RestrictedCone)),
        )
        .await;
        let (bob, mut bob_out, mut bob_in, _bob_ref) = coordinator(
            config.clone(),
            "bob",
            Some(seeded_stun(bob_public_port, NatType::FullCone)),
        )
        .await;

        for listener in [alice_listener, bob_listener] {
            tokio::spawn(async move {
                let mut held = Vec::new();
                while let Ok((stream, _)) = listener.accept().await {
                    held.push(stream);
                }
            });
        }

        // Ferry discovery envelopes between the two coordinators
        let bob_ferry = Arc::clone(&bob);
        tokio::spawn(async move {
            while let Some((_, message)) = alice_out.recv().await {
                bob_ferry.handle_message(&message).await;
            }
        });
        let alice_ferry = Arc::clone(&alice);
        tokio::spawn(async move {
            while let Some((_, message)) = bob_out.recv().await {
                alice_ferry.handle_message(&message).await;
            }
        });

        let ours = seeded_stun(alice_public_port, NatType::RestrictedCone);
        let peer_public: SocketAddr = format!("127.0.0.1:{}", bob_public_port).parse().unwrap();
        let (stream, remote) = alice
            .punch("bob", peer_public, &ours)
            .await
            .expect("punch should connect");
        assert_eq!(remote.port(), bob_public_port);
        drop(stream);

        // Responder side delivered its accepted connection too
        let incoming = timeout(Duration::from_secs(2), bob_in.recv())
            .await
            .expect("responder should connect")
            .expect("incoming channel open");
        assert_eq!(incoming.peer_id, "alice");
        assert_eq!(incoming.remote.port(), alice_public_port);

        // Both session tables are empty once the outcome is delivered
        assert_eq!(alice.session_count().await, 0);
    }

    #[tokio::test]
    async fn parked_outcome_delivery_does_not_hold_the_session_table() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let sessions = Arc::new(Mutex::new(HashMap::new()));
        sessions.lock().await.insert(
            1,
            SessionEntry {
                session: make_session(HolePunchSessionState::Connecting),
                completion: None,
            },
        );

        // Capacity-one incoming channel, pre-filled and not yet consumed
        let (incoming_tx, mut incoming_rx) = mpsc::channel(1);
        let filler = TcpStream::connect(addr).await.unwrap();
        incoming_tx
            .send(IncomingPeer {
                peer_id: "filler".into(),
                remote: addr,
                stream: filler,
            })
            .await
            .unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let remote = stream.peer_addr().unwrap();
        let delivery_sessions = Arc::clone(&sessions);
        let delivery = tokio::spawn(async move {
            complete_session(&delivery_sessions, &incoming_tx, 1, Ok((stream, remote))).await;
        });

        // Let the delivery park on the full channel
        sleep(Duration::from_millis(50)).await;

        // Other sessions must still get at the table meanwhile
        let locked = timeout(Duration::from_millis(300), sessions.lock()).await;
        assert!(locked.is_ok(), "session table stuck behind a slow consumer");
        assert!(locked.unwrap().is_empty());

        // Draining the channel lets the parked delivery land
        let _ = incoming_rx.recv().await;
        let delivered = timeout(Duration::from_secs(1), incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.peer_id, "peer");
        delivery.await.unwrap();
    }

    #[tokio::test]
    async fn late_go_still_lands_after_the_session_budget() {
        let mut config = test_config();
        config.hole_punch_timeout = Duration::from_millis(100);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_public = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let (responder, mut outbound, mut incoming, _reflexive) = coordinator(
            config,
            "bob",
            Some(seeded_stun(41000, NatType::FullCone)),
        )
        .await;

        let endpoint_data = |signal, go_time| HolePunchCoordinationData {
            session_id: 9,
            signal,
            public_ip: peer_public.ip(),
            public_port: peer_public.port(),
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: peer_public.port(),
            nat_type: NatType::FullCone,
            go_time,
            error_message: None,
        };

        let request = DiscoveryMessage::new(
            "alice-host",
            "alice",
            1,
            MessagePayload::HolePunchRequest(endpoint_data(HolePunchSignal::Request, None)),
        );
        responder.handle_message(&request).await;
        let (_, reply) = outbound.recv().await.unwrap();
        assert_eq!(reply.message_type(), MessageType::HolePunchResponse);

        // The go moment lands after the session budget has already elapsed
        let go = DiscoveryMessage::new(
            "alice-host",
            "alice",
            1,
            MessagePayload::HolePunchGo(endpoint_data(
                HolePunchSignal::Go,
                Some(unix_now_millis() + 250),
            )),
        );
        responder.handle_message(&go).await;

        let peer = timeout(Duration::from_secs(2), incoming.recv())
            .await
            .expect("attempt in flight should survive the sweeper")
            .unwrap();
        assert_eq!(peer.peer_id, "alice");
    }

    #[tokio::test]
    async fn failed_request_send_leaves_no_session_behind() {
        let (coordinator, outbound, _incoming, _reflexive) =
            coordinator(test_config(), "alice", None).await;
        drop(outbound);

        let ours = seeded_stun(40000, NatType::FullCone);
        let err = coordinator
            .punch("bob", "127.0.0.1:9".parse().unwrap(), &ours)
            .await
            .unwrap_err();

        assert!(matches!(err, P2pError::NetworkUnreachable(_)));
        assert_eq!(coordinator.session_count().await, 0);
    }

    #[test]
    fn probe_datagram_carries_magic_and_session_id() {
        let probe = probe_datagram(0xDEAD_BEEF_0000_0001);
        assert_eq!(&probe[..4], PROBE_MAGIC);
        assert_eq!(probe.len(), 12);
        assert_eq!(
            u64::from_be_bytes(probe[4..12].try_into().unwrap()),
            0xDEAD_BEEF_0000_0001
        );
    }
}
