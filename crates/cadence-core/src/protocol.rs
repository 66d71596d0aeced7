//! Replication wire protocol
//!
//! Every message exchanged between sites is one variant of the closed
//! [`Message`] enum and is dispatched with an exhaustive `match`.
//!
//! Messages are serialized with bincode and validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]

use crate::engine::ExecutionResult;
use crate::repair_log::RepairLogEntry;
use crate::types::{ClientHandle, PartitionId, SiteId, TxnHandle};
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Smallest valid frame: type(1) + length(4) + crc(4)
const MIN_FRAME_LEN: usize = 9;

/// Wire message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Single-partition work
    Initiate = 0x01,
    /// Result of single-partition work
    InitiateResponse = 0x02,
    /// Multi-partition fragment
    Fragment = 0x10,
    /// Result of a fragment
    FragmentResponse = 0x11,
    /// Multi-partition commit/rollback
    Complete = 0x12,
    /// Multi-partition ordering sentinel
    MultipartSentinel = 0x13,
    /// Promotion: ask a survivor for its repair log
    RepairLogRequest = 0x20,
    /// Promotion: one page of a survivor's repair log
    RepairLogResponse = 0x21,
    /// Viable replay set marker
    LogFault = 0x22,
    /// Ask the leader to hand leadership to a target
    MigrateLeader = 0x30,
    /// Old leader has flushed everything below its checkpoint
    DrainNotice = 0x31,
    /// Abandon an in-progress migration
    MigrationReset = 0x32,
    /// Candidate took over after the drain notice
    DrainAck = 0x33,
    /// Work returned unprocessed to its sender
    Misrouted = 0x40,
    /// Force a multi-partition transaction to fail
    Poison = 0x41,
    /// Cross-partition replay reached the end of the command log
    EndOfLog = 0x42,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Initiate),
            0x02 => Ok(Self::InitiateResponse),
            0x10 => Ok(Self::Fragment),
            0x11 => Ok(Self::FragmentResponse),
            0x12 => Ok(Self::Complete),
            0x13 => Ok(Self::MultipartSentinel),
            0x20 => Ok(Self::RepairLogRequest),
            0x21 => Ok(Self::RepairLogResponse),
            0x22 => Ok(Self::LogFault),
            0x30 => Ok(Self::MigrateLeader),
            0x31 => Ok(Self::DrainNotice),
            0x32 => Ok(Self::MigrationReset),
            0x33 => Ok(Self::DrainAck),
            0x40 => Ok(Self::Misrouted),
            0x41 => Ok(Self::Poison),
            0x42 => Ok(Self::EndOfLog),
            _ => Err(Error::codec(format!("Unknown message type: {}", value))),
        }
    }
}

/// Where a copy of a piece of work came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Fresh submission; the leader assigns the handle
    Client,
    /// Leader's copy for a replica, carrying the leader's handle
    Leader,
    /// Replayed by a newly promoted leader; idempotent at the receiver
    Repair,
}

/// A unit of single-partition work as submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Procedure name, for diagnostics
    pub procedure: String,
    /// Caller's handle for the terminal response
    pub client: ClientHandle,
    /// Client-interface site awaiting the response
    pub initiator: SiteId,
    /// Read-only work is neither replicated nor counted
    pub read_only: bool,
    /// Opaque invocation payload
    pub payload: Vec<u8>,
    /// Handle recorded in the command log when this is replayed work
    pub replay_handle: Option<TxnHandle>,
}

impl WorkUnit {
    /// Read-write work
    pub fn write(
        procedure: impl Into<String>,
        client: ClientHandle,
        initiator: SiteId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            client,
            initiator,
            read_only: false,
            payload,
            replay_handle: None,
        }
    }

    /// Read-only work
    pub fn read(
        procedure: impl Into<String>,
        client: ClientHandle,
        initiator: SiteId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            read_only: true,
            ..Self::write(procedure, client, initiator, payload)
        }
    }

    /// Mark as command-log replay of `handle`
    pub fn replayed_at(mut self, handle: TxnHandle) -> Self {
        self.replay_handle = Some(handle);
        self
    }
}

/// Single-partition work in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateTask {
    /// Ordering handle; `TxnHandle::MIN` until the leader assigns one
    pub handle: TxnHandle,
    /// Sender's repair-log truncation point
    pub truncation: TxnHandle,
    /// Provenance of this copy
    pub origin: Origin,
    /// The work itself
    pub work: WorkUnit,
}

/// Result of single-partition work from one site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateResponse {
    /// Handle the work ran at
    pub handle: TxnHandle,
    /// Site that executed it
    pub site: SiteId,
    /// Client the result belongs to
    pub client: ClientHandle,
    /// Engine output
    pub result: ExecutionResult,
}

/// One fragment of a multi-partition transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentTask {
    /// Multi-partition transaction id
    pub txn_id: TxnHandle,
    /// Partition handle; `TxnHandle::MIN` until the partition leader assigns one
    pub handle: TxnHandle,
    /// Multi-partition coordinator awaiting the response
    pub coordinator: SiteId,
    /// Provenance of this copy
    pub origin: Origin,
    /// Sender's repair-log truncation point
    pub truncation: TxnHandle,
    /// Read-only fragments are neither replicated nor counted
    pub read_only: bool,
    /// Output dependency ids this fragment produces
    pub output_deps: Vec<u32>,
    /// Opaque plan payload
    pub payload: Vec<u8>,
}

/// Result of one fragment from one site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentResponse {
    /// Multi-partition transaction id
    pub txn_id: TxnHandle,
    /// Partition handle the fragment ran at
    pub handle: TxnHandle,
    /// Site reported as executor (the partition leader once deduplicated)
    pub site: SiteId,
    /// Engine output, dependencies included
    pub result: ExecutionResult,
}

/// Commit or roll back a multi-partition transaction on a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteTransaction {
    /// Multi-partition transaction id
    pub txn_id: TxnHandle,
    /// Handle of the transaction's first fragment on this partition
    pub handle: TxnHandle,
    /// Multi-partition coordinator
    pub coordinator: SiteId,
    /// Roll back instead of committing
    pub rollback: bool,
    /// Rollback caused by a fault; recorded in the command log
    pub rollback_for_fault: bool,
    /// Provenance of this copy
    pub origin: Origin,
    /// Sender's repair-log truncation point
    pub truncation: TxnHandle,
}

/// One page of a survivor's repair log, tagged for completion detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairLogPage {
    /// Promotion attempt this page answers
    pub request_id: u64,
    /// Survivor that sent the page
    pub site: SiteId,
    /// Zero-based page index
    pub sequence: u32,
    /// Total pages in this survivor's answer
    pub of_total: u32,
    /// Highest handle the survivor has seen
    pub max_handle: TxnHandle,
    /// Entries carried by this page
    pub entries: Vec<RepairLogEntry>,
}

/// Replication messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Single-partition work
    Initiate(InitiateTask),

    /// Single-partition result
    InitiateResponse(InitiateResponse),

    /// Multi-partition fragment
    Fragment(FragmentTask),

    /// Multi-partition fragment result
    FragmentResponse(FragmentResponse),

    /// Multi-partition commit/rollback
    Complete(CompleteTransaction),

    /// Multi-partition ordering sentinel
    MultipartSentinel { txn_id: TxnHandle },

    /// Promotion asks a survivor for its repair log
    RepairLogRequest { request_id: u64, requester: SiteId },

    /// Page of a survivor's repair log
    RepairLogResponse(RepairLogPage),

    /// Viable replay set marker from the leader
    LogFault { handle: TxnHandle },

    /// Hand partition leadership to `target`
    MigrateLeader {
        partition: PartitionId,
        target: SiteId,
    },

    /// Old leader drained everything at or below `checkpoint`
    DrainNotice {
        partition: PartitionId,
        checkpoint: TxnHandle,
    },

    /// Abandon the in-progress migration and reinstate the original leader
    MigrationReset { partition: PartitionId },

    /// Candidate accepted the drain notice for `checkpoint`
    DrainAck {
        partition: PartitionId,
        checkpoint: TxnHandle,
    },

    /// Work returned unprocessed for retry elsewhere
    Misrouted {
        partition: PartitionId,
        original: Box<Message>,
    },

    /// Fail a multi-partition transaction
    Poison { txn_id: TxnHandle, reason: String },

    /// Cross-partition replay reached the end of its log
    EndOfLog { partition: PartitionId },
}

impl Message {
    /// Get message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Initiate(_) => MessageType::Initiate,
            Self::InitiateResponse(_) => MessageType::InitiateResponse,
            Self::Fragment(_) => MessageType::Fragment,
            Self::FragmentResponse(_) => MessageType::FragmentResponse,
            Self::Complete(_) => MessageType::Complete,
            Self::MultipartSentinel { .. } => MessageType::MultipartSentinel,
            Self::RepairLogRequest { .. } => MessageType::RepairLogRequest,
            Self::RepairLogResponse(_) => MessageType::RepairLogResponse,
            Self::LogFault { .. } => MessageType::LogFault,
            Self::MigrateLeader { .. } => MessageType::MigrateLeader,
            Self::DrainNotice { .. } => MessageType::DrainNotice,
            Self::MigrationReset { .. } => MessageType::MigrationReset,
            Self::DrainAck { .. } => MessageType::DrainAck,
            Self::Misrouted { .. } => MessageType::Misrouted,
            Self::Poison { .. } => MessageType::Poison,
            Self::EndOfLog { .. } => MessageType::EndOfLog,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::codec(format!("Serialization failed: {}", e)))?;

        let mut buf = Vec::with_capacity(1 + 4 + payload.len() + 4);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MIN_FRAME_LEN {
            return Err(Error::codec("Message too short"));
        }

        let crc_offset = buf.len() - 4;
        let stored_crc = read_u32_le(&buf[crc_offset..])?;

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(Error::codec(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let declared = MessageType::try_from(buf[0])?;
        let length = read_u32_le(&buf[1..5])? as usize;
        if buf.len() < 5 + length + 4 {
            return Err(Error::codec("Incomplete message"));
        }

        let message: Message = bincode::deserialize(&buf[5..5 + length])
            .map_err(|e| Error::codec(format!("Deserialization failed: {}", e)))?;
        if message.message_type() != declared {
            return Err(Error::codec(format!(
                "Frame declares {:?} but carries {:?}",
                declared,
                message.message_type()
            )));
        }
        Ok(message)
    }

    /// Write message to async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read message from async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).await?;
        let length = read_u32_le(&header[1..5])? as usize;

        let mut rest = vec![0u8; length + 4];
        reader.read_exact(&mut rest).await?;

        let mut full_buf = Vec::with_capacity(5 + rest.len());
        full_buf.extend_from_slice(&header);
        full_buf.extend_from_slice(&rest);

        Self::decode(&full_buf)
    }

    /// Write message to sync stream
    pub fn write_to_sync<W: Write>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    /// Read message from sync stream
    pub fn read_from_sync<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 5];
        reader.read_exact(&mut header)?;
        let length = read_u32_le(&header[1..5])? as usize;

        let mut rest = vec![0u8; length + 4];
        reader.read_exact(&mut rest)?;

        let mut full_buf = Vec::with_capacity(5 + rest.len());
        full_buf.extend_from_slice(&header);
        full_buf.extend_from_slice(&rest);

        Self::decode(&full_buf)
    }
}

fn read_u32_le(bytes: &[u8]) -> Result<u32> {
    let array: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::codec("Truncated integer field"))?;
    Ok(u32::from_le_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionHash;

    fn sample_work() -> WorkUnit {
        WorkUnit::write(
            "Transfer",
            ClientHandle(9),
            SiteId::new(0, 1),
            b"acct=1;amt=5".to_vec(),
        )
    }

    #[test]
    fn test_initiate_encode_decode() {
        let msg = Message::Initiate(InitiateTask {
            handle: TxnHandle::compose(100, 1, 3),
            truncation: TxnHandle::compose(99, 0, 3),
            origin: Origin::Leader,
            work: sample_work(),
        });

        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[0], MessageType::Initiate as u8);
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_response_carries_hash() {
        let hash = ExecutionHash::from_statements(3, [b"row".as_slice()], 16);
        let msg = Message::InitiateResponse(InitiateResponse {
            handle: TxnHandle::compose(5, 0, 1),
            site: SiteId::new(2, 0),
            client: ClientHandle(1),
            result: ExecutionResult::committed(hash.clone(), vec![1]),
        });

        match Message::decode(&msg.encode().unwrap()).unwrap() {
            Message::InitiateResponse(resp) => {
                assert_eq!(resp.result.hash, hash);
                assert_eq!(resp.site, SiteId::new(2, 0));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_crc_validation() {
        let msg = Message::LogFault {
            handle: TxnHandle::compose(1, 2, 3),
        };
        let mut encoded = msg.encode().unwrap();

        encoded[5] ^= 0xFF;

        let result = Message::decode(&encoded);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CRC"));
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(Message::decode(&[0x01, 0, 0]).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(MessageType::try_from(0x77).is_err());
    }

    #[test]
    fn test_misrouted_wraps_original() {
        let inner = Message::Initiate(InitiateTask {
            handle: TxnHandle::MIN,
            truncation: TxnHandle::MIN,
            origin: Origin::Client,
            work: sample_work(),
        });
        let msg = Message::Misrouted {
            partition: 3,
            original: Box::new(inner.clone()),
        };
        assert_eq!(msg.message_type(), MessageType::Misrouted);
        match Message::decode(&msg.encode().unwrap()).unwrap() {
            Message::Misrouted { original, .. } => assert_eq!(*original, inner),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_sync_stream_roundtrip() {
        let msg = Message::DrainNotice {
            partition: 2,
            checkpoint: TxnHandle::compose(10, 0, 2),
        };
        let ack = Message::DrainAck {
            partition: 2,
            checkpoint: TxnHandle::compose(10, 0, 2),
        };
        let mut buf = Vec::new();
        msg.write_to_sync(&mut buf).unwrap();
        ack.write_to_sync(&mut buf).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(Message::read_from_sync(&mut cursor).unwrap(), msg);
        assert_eq!(Message::read_from_sync(&mut cursor).unwrap(), ack);
    }

    #[tokio::test]
    async fn test_async_stream_roundtrip() {
        let msg = Message::RepairLogRequest {
            request_id: 17,
            requester: SiteId::new(1, 0),
        };
        let (mut client, mut server) = tokio::io::duplex(1024);
        msg.write_to(&mut client).await.unwrap();
        let read = Message::read_from(&mut server).await.unwrap();
        assert_eq!(read, msg);
    }
}
