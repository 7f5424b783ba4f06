//! CDC 세션 상태 머신
//!
//! Disconnected →(connect)→ Connected →(subscribe)→ Subscribed →(get/ack/rollback)→ Subscribed
//! `disconnect`는 세션을 Closed로 종료하며 이후 모든 호출은 실패한다.
//!
//! 커서 계약:
//! - `get`은 durable 커서를 움직이지 않는다.
//! - `ack`는 가장 최근에 받은, 아직 ack되지 않은 배치에 대해서만 유효하다.
//! - 전송 실패 시 커서 상태는 변하지 않으므로 재시도가 항상 안전하다.

use crate::entry::{Batch, BatchId};
use crate::error::{CdcError, Result};
use crate::filter::SubscriptionFilter;
use crate::transport::{Credentials, Endpoint, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 전송 계층 응답 대기 시 서버 측 대기 시간에 더하는 여유
const GET_GRACE: Duration = Duration::from_secs(10);

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connected,
    Subscribed,
    /// `disconnect` 이후 (종료됨)
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connected => "Connected",
            SessionState::Subscribed => "Subscribed",
            SessionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// CDC 서버 세션. 한 프로세스가 독점하며 동시 호출은 허용하지 않는다 (`&mut self`).
pub struct Session<T: Transport> {
    transport: T,
    endpoint: Endpoint,
    credentials: Credentials,
    fetch_timeout: Duration,
    state: SessionState,
    filter: Option<SubscriptionFilter>,
    /// 받았지만 아직 ack/rollback되지 않은 배치
    pending: Option<BatchId>,
    last_batch_id: Option<BatchId>,
    last_acked: Option<BatchId>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, endpoint: Endpoint, credentials: Credentials) -> Self {
        Session {
            transport,
            endpoint,
            credentials,
            fetch_timeout: Duration::from_secs(1),
            state: SessionState::Disconnected,
            filter: None,
            pending: None,
            last_batch_id: None,
            last_acked: None,
        }
    }

    /// `get` 시 서버 측 최대 대기 시간
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn filter(&self) -> Option<&SubscriptionFilter> {
        self.filter.as_ref()
    }

    /// 가장 최근에 받은 (비어 있지 않은) 배치
    pub fn last_batch_id(&self) -> Option<BatchId> {
        self.last_batch_id
    }

    pub fn last_acked(&self) -> Option<BatchId> {
        self.last_acked
    }

    /// ack 대기 중인 배치
    pub fn pending_batch(&self) -> Option<BatchId> {
        self.pending
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn require(&self, expected: SessionState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CdcError::ProtocolStateError(format!(
                "{} requires {} session, current state is {}",
                operation, expected, self.state
            )))
        }
    }

    /// 서버 연결. 이미 연결된 경우 아무것도 하지 않는다.
    pub async fn connect(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connected | SessionState::Subscribed => return Ok(()),
            SessionState::Closed => {
                return Err(CdcError::ProtocolStateError(
                    "connect on a closed session".to_string(),
                ))
            }
            SessionState::Disconnected => {}
        }

        self.transport
            .connect(&self.endpoint, &self.credentials)
            .await
            .map_err(|e| match e {
                CdcError::ProtocolError(msg) => CdcError::ConnectionError(msg),
                other => other,
            })?;

        self.state = SessionState::Connected;
        info!("Session connected to {}", self.endpoint);
        Ok(())
    }

    /// 구독 필터 등록
    pub async fn subscribe(&mut self, filter: SubscriptionFilter) -> Result<()> {
        self.require(SessionState::Connected, "subscribe")?;

        self.transport.subscribe(&filter).await?;

        info!("Subscribed to {} with filter {}", self.endpoint.destination, filter);
        self.filter = Some(filter);
        self.state = SessionState::Subscribed;
        Ok(())
    }

    /// 최대 `max_entries`개의 엔트리를 가져온다. durable 커서는 움직이지 않는다.
    ///
    /// 빈 배치는 새로운 데이터가 없다는 뜻이며 ack 대상이 아니다.
    pub async fn get(&mut self, max_entries: usize) -> Result<Batch> {
        self.require(SessionState::Subscribed, "get")?;
        if max_entries == 0 {
            return Err(CdcError::ProtocolStateError(
                "get requires max_entries > 0".to_string(),
            ));
        }

        let batch = tokio::time::timeout(
            self.fetch_timeout + GET_GRACE,
            self.transport.get(max_entries, self.fetch_timeout),
        )
        .await
        .map_err(|_| CdcError::ConnectionError("Timed out waiting for batch".to_string()))??;

        if batch.is_empty() {
            debug!("No new entries");
            return Ok(batch);
        }

        if let Some(pending) = self.pending {
            if pending != batch.id {
                warn!(
                    "Server delivered batch {} while batch {} is still un-acked",
                    batch.id, pending
                );
            }
        }

        debug!("Received batch {} with {} entries", batch.id, batch.len());
        self.pending = Some(batch.id);
        self.last_batch_id = Some(batch.id);
        Ok(batch)
    }

    /// 배치 처리 완료 확인. durable 커서를 배치 뒤로 이동시킨다.
    pub async fn ack(&mut self, batch_id: BatchId) -> Result<()> {
        self.require(SessionState::Subscribed, "ack")?;

        if batch_id.is_none() || self.pending != Some(batch_id) {
            return Err(CdcError::ProtocolStateError(format!(
                "ack of batch {} which is not the pending batch ({})",
                batch_id,
                self.pending
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "none".to_string())
            )));
        }

        // 실패 시 pending을 유지하여 ack를 재시도할 수 있다
        self.transport.ack(batch_id).await?;

        debug!("Acked batch {}", batch_id);
        self.pending = None;
        self.last_acked = Some(batch_id);
        Ok(())
    }

    /// 서버 커서를 `batch_id` 이전으로 되돌린다.
    /// `BatchId::NONE`은 마지막 ack 위치부터 재전송을 뜻한다.
    pub async fn rollback(&mut self, batch_id: BatchId) -> Result<()> {
        self.require(SessionState::Subscribed, "rollback")?;

        if !batch_id.is_none() && self.pending != Some(batch_id) {
            return Err(CdcError::ProtocolStateError(format!(
                "rollback of batch {} which is not the pending batch",
                batch_id
            )));
        }

        self.transport.rollback(batch_id).await?;

        info!("Rolled back to last ack (requested batch {})", batch_id);
        self.pending = None;
        Ok(())
    }

    /// 전송 장애 이후 연결을 버리고 Disconnected로 되돌린다.
    /// ack되지 않은 배치는 서버가 재전송한다.
    pub async fn reset(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(CdcError::ProtocolStateError(
                "reset on a closed session".to_string(),
            ));
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!("Error while dropping connection: {}", e);
        }

        self.state = SessionState::Disconnected;
        self.pending = None;
        Ok(())
    }

    /// 재연결 + 기존 필터로 재구독 + 마지막 ack 위치로 rollback
    pub async fn resume(&mut self) -> Result<()> {
        let filter = self.filter.clone().ok_or_else(|| {
            CdcError::ProtocolStateError("resume requires a prior subscription".to_string())
        })?;

        self.connect().await?;
        if self.state == SessionState::Connected {
            self.subscribe(filter).await?;
        }
        self.rollback(BatchId::NONE).await
    }

    /// 세션 종료 (이후 재사용 불가)
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        let result = self.transport.disconnect().await;
        self.state = SessionState::Closed;
        self.pending = None;
        info!("Session to {} closed", self.endpoint);
        result
    }
}
