//! Wire protocol - envelopes for daemon IPC and rendezvous signaling.
//!
//! Everything on a socket is one length-prefixed bincode frame. The IPC
//! request carries a packed kind field: service opcode in the high bits,
//! operation in the low 8 bits.

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bits reserved for the operation opcode in `ServiceRequest::kind`.
pub const OPERATION_BITS: u32 = 8;

/// Frames larger than this are rejected before the body is read.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Service opcodes. Dense small integers; `service::registry` maps each
/// to a binding factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceCode {
    Shell,
    FramebufferClient,
    FileCopy,
    Filesystem,
    Proxy,
    Status,
    FramebufferServer,
    Message,
    TransferServer,
    TransferClient,
}

impl ServiceCode {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Shell),
            1 => Some(Self::FramebufferClient),
            2 => Some(Self::FileCopy),
            3 => Some(Self::Filesystem),
            4 => Some(Self::Proxy),
            5 => Some(Self::Status),
            6 => Some(Self::FramebufferServer),
            7 => Some(Self::Message),
            8 => Some(Self::TransferServer),
            9 => Some(Self::TransferClient),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Shell => 0,
            Self::FramebufferClient => 1,
            Self::FileCopy => 2,
            Self::Filesystem => 3,
            Self::Proxy => 4,
            Self::Status => 5,
            Self::FramebufferServer => 6,
            Self::Message => 7,
            Self::TransferServer => 8,
            Self::TransferClient => 9,
        }
    }
}

/// Operation opcodes, carried in the low 8 bits of `ServiceRequest::kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Up,
    Down,
    Stat,
    Attach,
}

impl Operation {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Up),
            1 => Some(Self::Down),
            2 => Some(Self::Stat),
            3 => Some(Self::Attach),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Up => 0,
            Self::Down => 1,
            Self::Stat => 2,
            Self::Attach => 3,
        }
    }
}

/// Which end of a session initiated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Self::Outbound => Self::Inbound,
            Self::Inbound => Self::Outbound,
        }
    }

    fn digit(self) -> u8 {
        match self {
            Self::Outbound => 0,
            Self::Inbound => 1,
        }
    }
}

/// Composite session identifier. The dialer allocates `value` and the
/// responder mirrors it verbatim, so both ends converge on the same
/// `(value, service)` pair key regardless of direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId {
    pub value: i64,
    pub service: ServiceCode,
    pub direction: Direction,
}

impl SessionId {
    pub fn new(value: i64, service: ServiceCode, direction: Direction) -> Self {
        Self {
            value,
            service,
            direction,
        }
    }

    /// Key shared by both ends of a session pair.
    pub fn pair_key(&self) -> (i64, ServiceCode) {
        (self.value, self.service)
    }

    /// The same id as seen from the other end.
    pub fn mirrored(&self) -> Self {
        Self {
            direction: self.direction.flip(),
            ..*self
        }
    }

    /// Human-readable form used in logs and for attach lookups.
    pub fn pair_id(&self) -> String {
        format!(
            "conn_{}_{}_{}",
            self.service.code(),
            self.value,
            self.direction.digit()
        )
    }

    /// Parse the `conn_{service}_{value}_{direction}` form.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('_');
        if parts.next() != Some("conn") {
            bail!("not a pair id: {s:?}");
        }
        let service = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .and_then(ServiceCode::from_code)
            .ok_or_else(|| anyhow!("bad service code in pair id: {s:?}"))?;
        let value = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(|| anyhow!("bad value in pair id: {s:?}"))?;
        let direction = match parts.next() {
            Some("0") => Direction::Outbound,
            Some("1") => Direction::Inbound,
            _ => bail!("bad direction in pair id: {s:?}"),
        };
        if parts.next().is_some() {
            bail!("trailing junk in pair id: {s:?}");
        }
        Ok(Self::new(value, service, direction))
    }
}

/// Signaling message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalFlag {
    Unknown,
    Candidate,
    Answer,
    Offer,
}

/// Handshake role, mirrored on the wire. Redundant with the session
/// direction; receivers ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Dialer,
    Responder,
}

/// One signaling envelope, relayed through the rendezvous mailbox.
/// `sdp` holds a JSON session description for offers and answers;
/// `candidate` holds a JSON candidate-init for trickled candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub flag: SignalFlag,
    pub source: String,
    pub target: String,
    pub sdp: String,
    pub candidate: Vec<u8>,
    pub id: SessionId,
    pub peer_role: PeerRole,
    pub service: ServiceCode,
}

impl Signal {
    pub fn offer(source: &str, target: &str, id: SessionId, sdp: String) -> Self {
        Self {
            flag: SignalFlag::Offer,
            source: source.to_string(),
            target: target.to_string(),
            sdp,
            candidate: Vec::new(),
            id,
            peer_role: PeerRole::Dialer,
            service: id.service,
        }
    }

    pub fn answer(source: &str, target: &str, id: SessionId, sdp: String) -> Self {
        Self {
            flag: SignalFlag::Answer,
            source: source.to_string(),
            target: target.to_string(),
            sdp,
            candidate: Vec::new(),
            id,
            peer_role: PeerRole::Responder,
            service: id.service,
        }
    }

    pub fn candidate(
        source: &str,
        target: &str,
        id: SessionId,
        role: PeerRole,
        candidate: Vec<u8>,
    ) -> Self {
        Self {
            flag: SignalFlag::Candidate,
            source: source.to_string(),
            target: target.to_string(),
            sdp: String::new(),
            candidate,
            id,
            peer_role: role,
            service: id.service,
        }
    }
}

/// One IPC request/reply envelope. The reply reuses the request schema
/// with `status` filled in (0 = success).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Packed `(service << OPERATION_BITS) | operation`.
    pub kind: u32,
    /// Pair id bytes; empty on a local bring-up (the daemon allocates).
    pub pair_id: Vec<u8>,
    /// Caller does not wait for the splice to finish.
    pub detach: bool,
    /// Address of the daemon IPC endpoint the caller used.
    pub local_entry: String,
    /// Opaque service configuration, encoded by the binding.
    pub payload: Vec<u8>,
    /// Result code written by the daemon into the reply.
    pub status: i32,
}

impl ServiceRequest {
    pub fn new(service: ServiceCode, operation: Operation, payload: Vec<u8>) -> Self {
        Self {
            kind: (service.code() << OPERATION_BITS) | operation.code(),
            pair_id: Vec::new(),
            detach: false,
            local_entry: String::new(),
            payload,
            status: 0,
        }
    }

    pub fn service(&self) -> Option<ServiceCode> {
        ServiceCode::from_code(self.kind >> OPERATION_BITS)
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_code(self.kind & 0xff)
    }

    pub fn pair_id_str(&self) -> String {
        String::from_utf8_lossy(&self.pair_id).into_owned()
    }
}

/// One session pool entry, as reported by a status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub pair_id: String,
    pub remote: String,
    pub service: ServiceCode,
    pub direction: Direction,
    pub state: String,
    pub attached: bool,
}

/// Payload of a status-query reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub node_id: String,
    pub sessions: Vec<SessionInfo>,
}

/// Encode a value to its wire bytes (no frame header).
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).context("encode failed")
}

/// Decode a value from wire bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).context("decode failed")
}

/// Write one length-prefixed frame.
pub async fn write_frame<T, W>(writer: &mut W, value: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = encode(value)?;
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        bail!("frame too large: {} bytes", body.len());
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        bail!("frame too large: {len} bytes");
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode(&body)
}
