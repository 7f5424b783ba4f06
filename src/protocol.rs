//! CDC 서버 프로토콜 패킷 처리
//!
//! 프레임: 4 바이트 big-endian 본문 길이 + 본문
//! 본문: 패킷 타입 (1 byte) + 버전 (1 byte) + 타입별 필드

use crate::codec::{
    read_blob, read_lcb, read_string, read_string_lossy, remaining, write_blob, write_lcb, write_string,
};
use crate::entry::{BatchId, Entry, EntryHeader, EntryKind};
use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{self, Cursor};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

pub const PROTOCOL_VERSION: u8 = 1;

/// 한 프레임의 최대 크기
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub mod packet_type {
    pub const HANDSHAKE: u8 = 1;
    pub const CLIENT_AUTH: u8 = 2;
    pub const ACK: u8 = 3;
    pub const SUBSCRIPTION: u8 = 4;
    pub const UNSUBSCRIPTION: u8 = 5;
    pub const GET: u8 = 6;
    pub const MESSAGES: u8 = 7;
    pub const CLIENT_ACK: u8 = 8;
    pub const CLIENT_ROLLBACK: u8 = 9;
}

/// 프로토콜 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake {
        seed: Vec<u8>,
    },
    ClientAuth {
        username: String,
        password: Vec<u8>,
        destination: String,
        client_id: String,
        filter: String,
        net_read_timeout_ms: u32,
        idle_timeout_ms: u32,
    },
    Ack {
        error_code: u16,
        error_message: String,
    },
    Subscription {
        destination: String,
        client_id: String,
        filter: String,
    },
    Unsubscription {
        destination: String,
        client_id: String,
    },
    Get {
        destination: String,
        client_id: String,
        fetch_size: u32,
        timeout_ms: u64,
    },
    Messages {
        batch_id: BatchId,
        entries: Vec<Entry>,
    },
    ClientAck {
        destination: String,
        client_id: String,
        batch_id: BatchId,
    },
    ClientRollback {
        destination: String,
        client_id: String,
        batch_id: BatchId,
    },
}

impl Packet {
    pub fn ok() -> Self {
        Packet::Ack {
            error_code: 0,
            error_message: String::new(),
        }
    }

    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Handshake { .. } => packet_type::HANDSHAKE,
            Packet::ClientAuth { .. } => packet_type::CLIENT_AUTH,
            Packet::Ack { .. } => packet_type::ACK,
            Packet::Subscription { .. } => packet_type::SUBSCRIPTION,
            Packet::Unsubscription { .. } => packet_type::UNSUBSCRIPTION,
            Packet::Get { .. } => packet_type::GET,
            Packet::Messages { .. } => packet_type::MESSAGES,
            Packet::ClientAck { .. } => packet_type::CLIENT_ACK,
            Packet::ClientRollback { .. } => packet_type::CLIENT_ROLLBACK,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Handshake { .. } => "HANDSHAKE",
            Packet::ClientAuth { .. } => "CLIENT_AUTH",
            Packet::Ack { .. } => "ACK",
            Packet::Subscription { .. } => "SUBSCRIPTION",
            Packet::Unsubscription { .. } => "UNSUBSCRIPTION",
            Packet::Get { .. } => "GET",
            Packet::Messages { .. } => "MESSAGES",
            Packet::ClientAck { .. } => "CLIENT_ACK",
            Packet::ClientRollback { .. } => "CLIENT_ROLLBACK",
        }
    }

    /// 패킷 본문 직렬화
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.write_body(&mut buffer)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to encode {} packet: {}", self.name(), e)))?;
        Ok(buffer)
    }

    fn write_body(&self, buffer: &mut Vec<u8>) -> io::Result<()> {
        buffer.write_u8(self.packet_type())?;
        buffer.write_u8(PROTOCOL_VERSION)?;

        match self {
            Packet::Handshake { seed } => write_blob(buffer, seed)?,
            Packet::ClientAuth {
                username,
                password,
                destination,
                client_id,
                filter,
                net_read_timeout_ms,
                idle_timeout_ms,
            } => {
                write_string(buffer, username)?;
                write_blob(buffer, password)?;
                write_string(buffer, destination)?;
                write_string(buffer, client_id)?;
                write_string(buffer, filter)?;
                buffer.write_u32::<LittleEndian>(*net_read_timeout_ms)?;
                buffer.write_u32::<LittleEndian>(*idle_timeout_ms)?;
            }
            Packet::Ack {
                error_code,
                error_message,
            } => {
                buffer.write_u16::<LittleEndian>(*error_code)?;
                write_string(buffer, error_message)?;
            }
            Packet::Subscription {
                destination,
                client_id,
                filter,
            } => {
                write_string(buffer, destination)?;
                write_string(buffer, client_id)?;
                write_string(buffer, filter)?;
            }
            Packet::Unsubscription {
                destination,
                client_id,
            } => {
                write_string(buffer, destination)?;
                write_string(buffer, client_id)?;
            }
            Packet::Get {
                destination,
                client_id,
                fetch_size,
                timeout_ms,
            } => {
                write_string(buffer, destination)?;
                write_string(buffer, client_id)?;
                buffer.write_u32::<LittleEndian>(*fetch_size)?;
                buffer.write_u64::<LittleEndian>(*timeout_ms)?;
            }
            Packet::Messages { batch_id, entries } => {
                buffer.write_u64::<LittleEndian>(batch_id.0)?;
                write_lcb(buffer, entries.len() as u64)?;
                for entry in entries {
                    write_entry(buffer, entry)?;
                }
            }
            Packet::ClientAck {
                destination,
                client_id,
                batch_id,
            }
            | Packet::ClientRollback {
                destination,
                client_id,
                batch_id,
            } => {
                write_string(buffer, destination)?;
                write_string(buffer, client_id)?;
                buffer.write_u64::<LittleEndian>(batch_id.0)?;
            }
        }
        Ok(())
    }

    /// 패킷 본문 파싱
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(CdcError::ProtocolError("Packet too short".to_string()));
        }

        let mut cursor = Cursor::new(data);
        let packet = Self::read_body(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to decode packet: {}", e)))?;

        if remaining(&cursor) > 0 {
            return Err(CdcError::ProtocolError(format!(
                "{} trailing bytes after {} packet",
                remaining(&cursor),
                packet.name()
            )));
        }
        Ok(packet)
    }

    fn read_body(cursor: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let ty = cursor.read_u8()?;
        let version = cursor.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported protocol version {}", version),
            ));
        }

        let packet = match ty {
            packet_type::HANDSHAKE => Packet::Handshake {
                seed: read_blob(cursor)?,
            },
            packet_type::CLIENT_AUTH => Packet::ClientAuth {
                username: read_string(cursor)?,
                password: read_blob(cursor)?,
                destination: read_string(cursor)?,
                client_id: read_string(cursor)?,
                filter: read_string(cursor)?,
                net_read_timeout_ms: cursor.read_u32::<LittleEndian>()?,
                idle_timeout_ms: cursor.read_u32::<LittleEndian>()?,
            },
            packet_type::ACK => Packet::Ack {
                error_code: cursor.read_u16::<LittleEndian>()?,
                error_message: read_string(cursor)?,
            },
            packet_type::SUBSCRIPTION => Packet::Subscription {
                destination: read_string(cursor)?,
                client_id: read_string(cursor)?,
                filter: read_string(cursor)?,
            },
            packet_type::UNSUBSCRIPTION => Packet::Unsubscription {
                destination: read_string(cursor)?,
                client_id: read_string(cursor)?,
            },
            packet_type::GET => Packet::Get {
                destination: read_string(cursor)?,
                client_id: read_string(cursor)?,
                fetch_size: cursor.read_u32::<LittleEndian>()?,
                timeout_ms: cursor.read_u64::<LittleEndian>()?,
            },
            packet_type::MESSAGES => {
                let batch_id = BatchId(cursor.read_u64::<LittleEndian>()?);
                let count = read_lcb(cursor)?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push(read_entry(cursor)?);
                }
                Packet::Messages { batch_id, entries }
            }
            packet_type::CLIENT_ACK => Packet::ClientAck {
                destination: read_string(cursor)?,
                client_id: read_string(cursor)?,
                batch_id: BatchId(cursor.read_u64::<LittleEndian>()?),
            },
            packet_type::CLIENT_ROLLBACK => Packet::ClientRollback {
                destination: read_string(cursor)?,
                client_id: read_string(cursor)?,
                batch_id: BatchId(cursor.read_u64::<LittleEndian>()?),
            },
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown packet type {}", other),
                ))
            }
        };
        Ok(packet)
    }
}

/// 원본 엔트리 쓰기 (payload는 해석하지 않고 그대로 전달)
fn write_entry(buffer: &mut Vec<u8>, entry: &Entry) -> io::Result<()> {
    let header = &entry.header;
    buffer.write_u8(entry.kind.as_u8())?;
    write_string(buffer, &header.log_source_name)?;
    buffer.write_u64::<LittleEndian>(header.log_offset)?;
    buffer.write_i64::<LittleEndian>(header.execute_time)?;
    buffer.write_u32::<LittleEndian>(header.server_id)?;
    write_string(buffer, header.gtid.as_deref().unwrap_or(""))?;
    write_string(buffer, &header.schema_name)?;
    write_string(buffer, &header.table_name)?;
    write_blob(buffer, &entry.payload)
}

/// 원본 엔트리 읽기
///
/// 헤더 문자열의 잘못된 UTF-8은 대체 문자로 바꾼다 (해당 엔트리에만 영향).
fn read_entry(cursor: &mut Cursor<&[u8]>) -> io::Result<Entry> {
    let kind = EntryKind::from_u8(cursor.read_u8()?);
    let log_source_name = read_string_lossy(cursor)?;
    let log_offset = cursor.read_u64::<LittleEndian>()?;
    let execute_time = cursor.read_i64::<LittleEndian>()?;
    let server_id = cursor.read_u32::<LittleEndian>()?;
    let gtid = read_string_lossy(cursor)?;
    let schema_name = read_string_lossy(cursor)?;
    let table_name = read_string_lossy(cursor)?;
    let payload = read_blob(cursor)?;

    Ok(Entry {
        kind,
        header: EntryHeader {
            log_source_name,
            log_offset,
            execute_time,
            server_id,
            gtid: if gtid.is_empty() { None } else { Some(gtid) },
            schema_name,
            table_name,
        },
        payload: Bytes::from(payload),
    })
}

/// 프레임 단위 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    stream: S,
}

impl PacketChannel<TcpStream> {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to CDC server at {}", address);

        Ok(PacketChannel { stream })
    }
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        PacketChannel { stream }
    }

    /// 프레임 읽기
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        let length = match self.stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(CdcError::ConnectionError("Connection closed by peer".to_string()))
            }
            Err(e) => return Err(CdcError::IoError(format!("Failed to read frame length: {}", e))),
        };

        if length > MAX_FRAME_SIZE {
            return Err(CdcError::ProtocolError(format!(
                "Frame of {} bytes exceeds limit of {}",
                length, MAX_FRAME_SIZE
            )));
        }

        let mut buffer = vec![0u8; length];
        self.stream
            .read_exact(&mut buffer)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to read frame body: {}", e)))?;

        Ok(buffer)
    }

    /// 프레임 쓰기
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        self.stream
            .write_u32(body.len() as u32)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to write frame length: {}", e)))?;
        self.stream
            .write_all(body)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to write frame body: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to flush: {}", e)))?;
        Ok(())
    }

    pub async fn read_packet(&mut self) -> Result<Packet> {
        let frame = self.read_frame().await?;
        let packet = Packet::decode(&frame)?;
        debug!("Received {} packet ({} bytes)", packet.name(), frame.len());
        Ok(packet)
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let body = packet.encode()?;
        debug!("Sending {} packet ({} bytes)", packet.name(), body.len());
        self.write_frame(&body).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        self.stream
            .shutdown()
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to shutdown: {}", e)))
    }
}
