//! 프로세스 내 CDC 서버
//!
//! 실제 서버와 같은 커서 계약을 구현한다:
//! - ack 전까지 `get`은 같은 배치를 반환
//! - `rollback`은 처리 중인 배치를 버리고 마지막 ack 위치로 복귀
//! - 연결이 끊겨도 ack되지 않은 배치는 재연결 후 재전송
//!
//! 장애 주입 (연결/get/ack 실패)을 지원하므로 세션과 폴링 루프 테스트에 사용한다.

use crate::entry::{Batch, BatchId, Entry};
use crate::error::{CdcError, Result};
use crate::filter::SubscriptionFilter;
use crate::transport::{Credentials, Endpoint, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 서버가 받은 요청 기록
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected,
    Subscribed(String),
    Get { batch_id: BatchId, entries: usize },
    Ack(BatchId),
    Rollback(BatchId),
    Disconnected,
}

/// 처리 중인 (ack 대기) 배치
#[derive(Debug, Clone)]
struct InFlight {
    id: BatchId,
    /// 배치 다음 로그 위치
    end: usize,
    entries: Vec<Entry>,
}

#[derive(Debug, Default)]
struct ServerState {
    log: Vec<Entry>,
    /// durable 커서 (ack된 다음 로그 위치)
    acked: usize,
    in_flight: Option<InFlight>,
    last_batch_id: u64,
    last_acked: Option<BatchId>,
    connected: bool,
    filter: Option<SubscriptionFilter>,
    required_credentials: Option<Credentials>,
    fail_connects: u32,
    fail_subscribes: u32,
    fail_gets: u32,
    fail_acks: u32,
    history: Vec<ServerEvent>,
    /// get 요청 시각 (tokio 시계 기준)
    get_times: Vec<Instant>,
}

impl ServerState {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(CdcError::ConnectionError("Connection is closed".to_string()))
        }
    }
}

/// 프로세스 내 서버 핸들 (복제하면 같은 서버를 가리킨다)
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        MemoryServer::default()
    }

    /// 인증 정보를 요구하는 서버
    pub fn with_credentials(credentials: Credentials) -> Self {
        let server = MemoryServer::new();
        server.state.lock().required_credentials = Some(credentials);
        server
    }

    /// 이 서버에 연결하는 전송 계층
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            server: self.clone(),
        }
    }

    /// 로그 끝에 엔트리 추가
    pub fn append(&self, entry: Entry) {
        self.state.lock().log.push(entry);
    }

    pub fn append_all(&self, entries: impl IntoIterator<Item = Entry>) {
        self.state.lock().log.extend(entries);
    }

    /// 다음 `n`번의 연결 시도를 실패시킨다
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().fail_connects = n;
    }

    /// 다음 `n`번의 구독 요청을 거부한다
    pub fn fail_next_subscribes(&self, n: u32) {
        self.state.lock().fail_subscribes = n;
    }

    /// 다음 `n`번의 get을 실패시킨다
    pub fn fail_next_gets(&self, n: u32) {
        self.state.lock().fail_gets = n;
    }

    /// 다음 `n`번의 ack를 실패시킨다
    pub fn fail_next_acks(&self, n: u32) {
        self.state.lock().fail_acks = n;
    }

    /// 클라이언트 연결을 끊는다 (네트워크 장애 모사)
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.filter = None;
    }

    /// durable 커서 위치 (ack된 로그 엔트리 수)
    pub fn acked_position(&self) -> usize {
        self.state.lock().acked
    }

    pub fn last_acked(&self) -> Option<BatchId> {
        self.state.lock().last_acked
    }

    pub fn in_flight(&self) -> Option<BatchId> {
        self.state.lock().in_flight.as_ref().map(|b| b.id)
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn history(&self) -> Vec<ServerEvent> {
        self.state.lock().history.clone()
    }

    pub fn get_times(&self) -> Vec<Instant> {
        self.state.lock().get_times.clone()
    }

    /// 기록된 ack 목록
    pub fn acks(&self) -> Vec<BatchId> {
        self.state
            .lock()
            .history
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Ack(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

/// `MemoryServer`에 연결하는 전송 계층
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    server: MemoryServer,
}

impl MemoryTransport {
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self, endpoint: &Endpoint, credentials: &Credentials) -> Result<()> {
        let mut state = self.server.state.lock();

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(CdcError::ConnectionError(format!(
                "Failed to connect to {}: connection refused",
                endpoint.address()
            )));
        }

        if let Some(ref required) = state.required_credentials {
            if required != credentials {
                return Err(CdcError::ConnectionError(format!(
                    "Authentication rejected for user '{}'",
                    credentials.username
                )));
            }
        }

        state.connected = true;
        state.history.push(ServerEvent::Connected);
        Ok(())
    }

    async fn subscribe(&mut self, filter: &SubscriptionFilter) -> Result<()> {
        let mut state = self.server.state.lock();
        state.ensure_connected()?;

        if state.fail_subscribes > 0 {
            state.fail_subscribes -= 1;
            return Err(CdcError::ProtocolError(format!(
                "Subscription '{}' rejected",
                filter.as_str()
            )));
        }

        state.filter = Some(filter.clone());
        state.history.push(ServerEvent::Subscribed(filter.as_str().to_string()));
        Ok(())
    }

    async fn get(&mut self, max_entries: usize, _timeout: Duration) -> Result<Batch> {
        let mut state = self.server.state.lock();
        state.ensure_connected()?;
        state.get_times.push(Instant::now());

        if state.fail_gets > 0 {
            state.fail_gets -= 1;
            return Err(CdcError::ConnectionError("Connection reset during get".to_string()));
        }

        let filter = state
            .filter
            .clone()
            .ok_or_else(|| CdcError::ProtocolError("Client is not subscribed".to_string()))?;

        // ack 전까지는 같은 배치를 반환
        if let Some(ref in_flight) = state.in_flight {
            let batch = Batch {
                id: in_flight.id,
                entries: in_flight.entries.clone(),
            };
            state.history.push(ServerEvent::Get {
                batch_id: batch.id,
                entries: batch.entries.len(),
            });
            return Ok(batch);
        }

        let mut entries = Vec::new();
        let mut end = state.acked;
        while end < state.log.len() && entries.len() < max_entries {
            let entry = &state.log[end];
            if filter.matches(&entry.header.schema_name, &entry.header.table_name) {
                entries.push(entry.clone());
            }
            end += 1;
        }

        if entries.is_empty() {
            // 필터로 걸러진 엔트리만 있었다면 전달할 것이 없으므로 커서를 넘긴다
            state.acked = end;
            state.history.push(ServerEvent::Get {
                batch_id: BatchId::NONE,
                entries: 0,
            });
            return Ok(Batch::empty());
        }

        state.last_batch_id += 1;
        let id = BatchId(state.last_batch_id);
        debug!("Serving batch {} ({} entries)", id, entries.len());

        state.in_flight = Some(InFlight {
            id,
            end,
            entries: entries.clone(),
        });
        state.history.push(ServerEvent::Get {
            batch_id: id,
            entries: entries.len(),
        });

        Ok(Batch { id, entries })
    }

    async fn ack(&mut self, batch_id: BatchId) -> Result<()> {
        let mut state = self.server.state.lock();
        state.ensure_connected()?;

        if state.fail_acks > 0 {
            state.fail_acks -= 1;
            return Err(CdcError::ConnectionError("Connection reset during ack".to_string()));
        }

        match state.in_flight.take() {
            Some(in_flight) if in_flight.id == batch_id => {
                state.acked = in_flight.end;
                state.last_acked = Some(batch_id);
                state.history.push(ServerEvent::Ack(batch_id));
                Ok(())
            }
            other => {
                state.in_flight = other;
                Err(CdcError::ProtocolError(format!("Batch {} is not in flight", batch_id)))
            }
        }
    }

    async fn rollback(&mut self, batch_id: BatchId) -> Result<()> {
        let mut state = self.server.state.lock();
        state.ensure_connected()?;

        let matches = batch_id.is_none()
            || state.in_flight.as_ref().map(|b| b.id) == Some(batch_id);
        if !matches {
            return Err(CdcError::ProtocolError(format!("Batch {} is not in flight", batch_id)));
        }

        state.in_flight = None;
        state.history.push(ServerEvent::Rollback(batch_id));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.server.state.lock();
        if state.connected {
            state.connected = false;
            state.filter = None;
            state.history.push(ServerEvent::Disconnected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryHeader;

    fn begin(offset: u64) -> Entry {
        Entry::transaction_begin(EntryHeader::new("mysql-bin.000001", offset))
    }

    fn row(offset: u64, table: &str) -> Entry {
        Entry::row_mutation(
            EntryHeader::new("mysql-bin.000001", offset).with_table("shop", table),
            vec![0u8],
        )
    }

    async fn subscribed(server: &MemoryServer, filter: &str) -> MemoryTransport {
        let mut transport = server.transport();
        transport
            .connect(&Endpoint::default(), &Credentials::default())
            .await
            .unwrap();
        transport
            .subscribe(&SubscriptionFilter::parse(filter).unwrap())
            .await
            .unwrap();
        transport
    }

    #[tokio::test]
    async fn test_get_is_idempotent_until_ack() {
        let server = MemoryServer::new();
        server.append_all(vec![begin(4), row(10, "users"), row(20, "users")]);
        let mut transport = subscribed(&server, "").await;

        let first = transport.get(2, Duration::ZERO).await.unwrap();
        let second = transport.get(2, Duration::ZERO).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.entries.len(), 2);

        transport.ack(first.id).await.unwrap();
        assert_eq!(server.acked_position(), 2);

        let third = transport.get(2, Duration::ZERO).await.unwrap();
        assert_ne!(third.id, first.id);
        assert_eq!(third.entries[0].header.log_offset, 20);
    }

    #[tokio::test]
    async fn test_filter_skips_other_tables() {
        let server = MemoryServer::new();
        server.append_all(vec![row(10, "audit"), row(20, "users"), row(30, "audit")]);
        let mut transport = subscribed(&server, r"shop\.users").await;

        let batch = transport.get(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].header.table_name, "users");
    }

    #[tokio::test]
    async fn test_unknown_ack_rejected() {
        let server = MemoryServer::new();
        server.append(row(10, "users"));
        let mut transport = subscribed(&server, "").await;

        let batch = transport.get(10, Duration::ZERO).await.unwrap();
        assert!(transport.ack(BatchId(99)).await.is_err());
        // 잘못된 ack 이후에도 처리 중인 배치는 유지
        assert_eq!(server.in_flight(), Some(batch.id));
    }

    #[tokio::test]
    async fn test_unacked_batch_redelivered_after_reconnect() {
        let server = MemoryServer::new();
        server.append_all(vec![row(10, "users"), row(20, "users")]);
        let mut transport = subscribed(&server, "").await;

        let batch = transport.get(10, Duration::ZERO).await.unwrap();
        server.drop_connection();
        assert!(transport.get(10, Duration::ZERO).await.is_err());

        let mut transport = subscribed(&server, "").await;
        transport.rollback(BatchId::NONE).await.unwrap();
        let replay = transport.get(10, Duration::ZERO).await.unwrap();
        assert_eq!(replay.entries, batch.entries);
    }

    #[tokio::test]
    async fn test_credentials_checked() {
        let server = MemoryServer::with_credentials(Credentials::new("canal", "canal"));
        let mut transport = server.transport();
        assert!(transport
            .connect(&Endpoint::default(), &Credentials::new("canal", "nope"))
            .await
            .is_err());
        assert!(transport
            .connect(&Endpoint::default(), &Credentials::new("canal", "canal"))
            .await
            .is_ok());
    }
}
