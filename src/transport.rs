//! CDC 서버 전송 계층 인터페이스
//!
//! 세션은 이 트레이트를 통해서만 서버와 통신한다.
//! 구현체: `TcpConnector` (TCP), `MemoryTransport` (프로세스 내 서버)

use crate::entry::{Batch, BatchId};
use crate::error::Result;
use crate::filter::SubscriptionFilter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 서버 주소 및 구독 대상
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    /// 서버 측 인스턴스명
    pub destination: String,
    pub client_id: String,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            hostname: "127.0.0.1".to_string(),
            port: 11111,
            destination: "example".to_string(),
            client_id: "12349".to_string(),
        }
    }
}

impl Endpoint {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Endpoint {
            hostname: hostname.into(),
            port,
            ..Default::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{} (client {})",
            self.hostname, self.port, self.destination, self.client_id
        )
    }
}

/// 인증 정보
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 서버 전송 계층
///
/// 서버 측 커서 계약:
/// - `ack` 전까지 `get`은 같은 배치를 반환한다.
/// - `rollback(BatchId::NONE)` 후 `get`은 마지막 ack 위치부터 재전송한다.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, endpoint: &Endpoint, credentials: &Credentials) -> Result<()>;

    async fn subscribe(&mut self, filter: &SubscriptionFilter) -> Result<()>;

    /// 최대 `max_entries`개의 엔트리를 요청. 서버는 최대 `timeout`만큼 대기한다.
    async fn get(&mut self, max_entries: usize, timeout: Duration) -> Result<Batch>;

    async fn ack(&mut self, batch_id: BatchId) -> Result<()>;

    async fn rollback(&mut self, batch_id: BatchId) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_defaults() {
        let endpoint = Endpoint::default();
        assert_eq!(endpoint.address(), "127.0.0.1:11111");
        assert_eq!(endpoint.destination, "example");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials::new("canal", "secret");
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("canal"));
        assert!(!debug.contains("secret"));
    }
}
