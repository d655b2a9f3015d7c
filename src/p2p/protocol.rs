/**
 * p2p/protocol.rs
 *
 * Discovery channel envelope and typed per-kind payloads.
 * The transport carrying these envelopes lives outside this crate.
 */

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{NatType, P2pError};

/// Protocol tag expected on every envelope. Anything else is rejected
/// before the message type is even looked at.
pub const DISCOVERY_MAGIC: &str = "STEAMROLL_V1";

/// Closed set of wire message kinds, plus a forward-compatibility bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Announce,
    TransferRequest,
    TransferAccept,
    TransferReject,
    GameListRequest,
    GameListResponse,
    SaveSyncOffer,
    SaveSyncRequest,
    SwarmQuery,
    SwarmResponse,
    RestorePointOffer,
    RestorePointRequest,
    GroupRestoreRequest,
    HolePunchRequest,
    HolePunchResponse,
    HolePunchGo,
    Unknown,
}

impl MessageType {
    /// Map a wire tag back to its kind; `None` for tags we do not know.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "announce" => MessageType::Announce,
            "transfer_request" => MessageType::TransferRequest,
            "transfer_accept" => MessageType::TransferAccept,
            "transfer_reject" => MessageType::TransferReject,
            "game_list_request" => MessageType::GameListRequest,
            "game_list_response" => MessageType::GameListResponse,
            "save_sync_offer" => MessageType::SaveSyncOffer,
            "save_sync_request" => MessageType::SaveSyncRequest,
            "swarm_query" => MessageType::SwarmQuery,
            "swarm_response" => MessageType::SwarmResponse,
            "restore_point_offer" => MessageType::RestorePointOffer,
            "restore_point_request" => MessageType::RestorePointRequest,
            "group_restore_request" => MessageType::GroupRestoreRequest,
            "hole_punch_request" => MessageType::HolePunchRequest,
            "hole_punch_response" => MessageType::HolePunchResponse,
            "hole_punch_go" => MessageType::HolePunchGo,
            _ => return None,
        };
        Some(kind)
    }
}

/// One installed game as advertised in a game list exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEntry {
    pub app_id: u32,
    pub name: String,
    pub size_bytes: u64,
}

/// Save-game sync advertisement for one game
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveSyncEntry {
    pub app_id: u32,
    pub game_name: String,
    /// Unix seconds of the newest save file
    pub last_modified: u64,
}

/// Metadata describing an offered restore point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePointInfo {
    pub id: String,
    /// Unix seconds
    pub created_at: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub app_ids: Vec<u32>,
}

/// Signal carried inside hole-punch coordination payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolePunchSignal {
    Request,
    Response,
    Go,
    Fail,
}

/// Coordination payload embedded in hole-punch messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolePunchCoordinationData {
    pub session_id: u64,
    pub signal: HolePunchSignal,
    pub public_ip: IpAddr,
    pub public_port: u16,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub nat_type: NatType,
    /// Coordinated connect moment, Unix milliseconds
    #[serde(default)]
    pub go_time: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl HolePunchCoordinationData {
    pub fn public_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.public_ip, self.public_port)
    }

    pub fn private_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.local_port)
    }
}

/// Typed payload, one variant per message kind. `Unknown` keeps the raw
/// document so unrecognized kinds survive a decode/inspect cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Announce,
    TransferRequest {
        app_id: u32,
        game_name: String,
        size_bytes: u64,
    },
    TransferAccept {
        app_id: u32,
    },
    TransferReject {
        app_id: u32,
        #[serde(default)]
        reason: Option<String>,
    },
    GameListRequest,
    GameListResponse {
        #[serde(default)]
        games: Vec<GameEntry>,
    },
    SaveSyncOffer {
        #[serde(default)]
        saves: Vec<SaveSyncEntry>,
    },
    SaveSyncRequest {
        #[serde(default)]
        app_ids: Vec<u32>,
    },
    SwarmQuery {
        app_id: u32,
    },
    SwarmResponse {
        app_id: u32,
        #[serde(default)]
        seeders: Vec<String>,
    },
    RestorePointOffer {
        restore_point: RestorePointInfo,
    },
    RestorePointRequest {
        restore_point_id: String,
    },
    GroupRestoreRequest {
        #[serde(default)]
        restore_point_ids: Vec<String>,
    },
    HolePunchRequest(HolePunchCoordinationData),
    HolePunchResponse(HolePunchCoordinationData),
    HolePunchGo(HolePunchCoordinationData),
    #[serde(skip)]
    Unknown { kind: String, raw: Value },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::Announce => MessageType::Announce,
            MessagePayload::TransferRequest { .. } => MessageType::TransferRequest,
            MessagePayload::TransferAccept { .. } => MessageType::TransferAccept,
            MessagePayload::TransferReject { .. } => MessageType::TransferReject,
            MessagePayload::GameListRequest => MessageType::GameListRequest,
            MessagePayload::GameListResponse { .. } => MessageType::GameListResponse,
            MessagePayload::SaveSyncOffer { .. } => MessageType::SaveSyncOffer,
            MessagePayload::SaveSyncRequest { .. } => MessageType::SaveSyncRequest,
            MessagePayload::SwarmQuery { .. } => MessageType::SwarmQuery,
            MessagePayload::SwarmResponse { .. } => MessageType::SwarmResponse,
            MessagePayload::RestorePointOffer { .. } => MessageType::RestorePointOffer,
            MessagePayload::RestorePointRequest { .. } => MessageType::RestorePointRequest,
            MessagePayload::GroupRestoreRequest { .. } => MessageType::GroupRestoreRequest,
            MessagePayload::HolePunchRequest(_) => MessageType::HolePunchRequest,
            MessagePayload::HolePunchResponse(_) => MessageType::HolePunchResponse,
            MessagePayload::HolePunchGo(_) => MessageType::HolePunchGo,
            MessagePayload::Unknown { .. } => MessageType::Unknown,
        }
    }
}

/// Versioned envelope exchanged over the discovery channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub magic: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub peer_id: String,
    #[serde(default)]
    pub transfer_port: u16,
    pub payload: MessagePayload,
}

impl DiscoveryMessage {
    pub fn new(
        host_name: &str,
        peer_id: &str,
        transfer_port: u16,
        payload: MessagePayload,
    ) -> Self {
        Self {
            magic: DISCOVERY_MAGIC.to_string(),
            host_name: host_name.to_string(),
            peer_id: peer_id.to_string(),
            transfer_port,
            payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// Header-only view used when the payload kind is unrecognized
#[derive(Deserialize)]
struct EnvelopeHeader {
    #[serde(default)]
    magic: String,
    #[serde(default)]
    host_name: String,
    #[serde(default)]
    peer_id: String,
    #[serde(default)]
    transfer_port: u16,
}

/// Encode an envelope. An `Unknown` payload re-emits its preserved raw
/// document, so unrecognized kinds survive a decode/forward cycle intact.
pub fn encode(message: &DiscoveryMessage) -> Result<Vec<u8>, P2pError> {
    if let MessagePayload::Unknown { raw, .. } = &message.payload {
        return serde_json::to_vec(raw).map_err(|e| P2pError::ProtocolError(e.to_string()));
    }
    serde_json::to_vec(message).map_err(|e| P2pError::ProtocolError(e.to_string()))
}

/// Decode an envelope. Validation order: magic tag first, then the payload
/// type tag, then the typed payload itself. Unknown types come back as
/// `MessagePayload::Unknown` rather than failing the whole message.
pub fn decode(bytes: &[u8]) -> Result<DiscoveryMessage, P2pError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| P2pError::ProtocolError(format!("invalid envelope: {}", e)))?;

    match value.get("magic").and_then(Value::as_str) {
        Some(DISCOVERY_MAGIC) => {}
        Some(other) => {
            return Err(P2pError::ProtocolError(format!(
                "unexpected protocol tag: {}",
                other
            )))
        }
        None => return Err(P2pError::ProtocolError("missing protocol tag".into())),
    }

    let kind = value
        .get("payload")
        .and_then(|p| p.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| P2pError::ProtocolError("missing payload type".into()))?
        .to_string();

    match serde_json::from_value::<DiscoveryMessage>(value.clone()) {
        Ok(message) => Ok(message),
        Err(_) if MessageType::from_tag(&kind).is_none() => {
            let header: EnvelopeHeader = serde_json::from_value(value.clone())
                .map_err(|e| P2pError::ProtocolError(e.to_string()))?;
            Ok(DiscoveryMessage {
                magic: header.magic,
                host_name: header.host_name,
                peer_id: header.peer_id,
                transfer_port: header.transfer_port,
                payload: MessagePayload::Unknown { kind, raw: value },
            })
        }
        Err(e) => Err(P2pError::ProtocolError(format!(
            "malformed {} payload: {}",
            kind, e
        ))),
    }
}
