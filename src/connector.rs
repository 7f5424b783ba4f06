//! TCP 기반 CDC 서버 커넥터
//!
//! 연결 순서: TCP 연결 → HANDSHAKE 수신 (seed) → CLIENT_AUTH 전송 → ACK 수신

use crate::auth;
use crate::entry::{Batch, BatchId};
use crate::error::{CdcError, Result};
use crate::filter::SubscriptionFilter;
use crate::protocol::{Packet, PacketChannel};
use crate::transport::{Credentials, Endpoint, Transport};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 응답 대기 시 서버 측 대기 시간에 더하는 여유
const READ_GRACE: Duration = Duration::from_secs(5);

/// TCP 커넥터 설정
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub connect_timeout: Duration,
    /// 서버가 클라이언트 응답을 기다리는 시간
    pub net_read_timeout: Duration,
    /// 서버가 유휴 연결을 끊기까지의 시간
    pub idle_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            connect_timeout: Duration::from_secs(10),
            net_read_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// TCP 커넥터
pub struct TcpConnector {
    config: ConnectorConfig,
    channel: Option<PacketChannel>,
    endpoint: Option<Endpoint>,
}

impl TcpConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        TcpConnector {
            config,
            channel: None,
            endpoint: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    fn session(&mut self) -> Result<(&mut PacketChannel, &Endpoint)> {
        match (self.channel.as_mut(), self.endpoint.as_ref()) {
            (Some(channel), Some(endpoint)) => Ok((channel, endpoint)),
            _ => Err(CdcError::ConnectionError("Not connected".to_string())),
        }
    }

    async fn handshake(
        &self,
        channel: &mut PacketChannel,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<()> {
        let seed = match channel.read_packet().await? {
            Packet::Handshake { seed } => seed,
            other => {
                return Err(CdcError::ProtocolError(format!(
                    "Expected HANDSHAKE, got {}",
                    other.name()
                )))
            }
        };

        channel
            .write_packet(&Packet::ClientAuth {
                username: credentials.username.clone(),
                password: auth::scramble_password(&credentials.password, &seed),
                destination: endpoint.destination.clone(),
                client_id: endpoint.client_id.clone(),
                filter: String::new(),
                net_read_timeout_ms: self.config.net_read_timeout.as_millis() as u32,
                idle_timeout_ms: self.config.idle_timeout.as_millis() as u32,
            })
            .await?;

        match channel.read_packet().await? {
            Packet::Ack { error_code: 0, .. } => Ok(()),
            Packet::Ack {
                error_code,
                error_message,
            } => Err(CdcError::ConnectionError(format!(
                "Authentication rejected ({}): {}",
                error_code, error_message
            ))),
            other => Err(CdcError::ProtocolError(format!(
                "Expected ACK after CLIENT_AUTH, got {}",
                other.name()
            ))),
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        TcpConnector::new(ConnectorConfig::default())
    }
}

#[async_trait]
impl Transport for TcpConnector {
    async fn connect(&mut self, endpoint: &Endpoint, credentials: &Credentials) -> Result<()> {
        if self.channel.is_some() {
            return Ok(());
        }

        let address = endpoint.address();
        let mut channel = tokio::time::timeout(self.config.connect_timeout, PacketChannel::connect(&address))
            .await
            .map_err(|_| CdcError::ConnectionError(format!("Timed out connecting to {}", address)))??;

        self.handshake(&mut channel, endpoint, credentials).await?;

        info!("Authenticated to {}", endpoint);
        self.channel = Some(channel);
        self.endpoint = Some(endpoint.clone());
        Ok(())
    }

    async fn subscribe(&mut self, filter: &SubscriptionFilter) -> Result<()> {
        let (channel, endpoint) = self.session()?;

        channel
            .write_packet(&Packet::Subscription {
                destination: endpoint.destination.clone(),
                client_id: endpoint.client_id.clone(),
                filter: filter.as_str().to_string(),
            })
            .await?;

        match channel.read_packet().await? {
            Packet::Ack { error_code: 0, .. } => Ok(()),
            Packet::Ack {
                error_code,
                error_message,
            } => Err(CdcError::ProtocolError(format!(
                "Subscription rejected ({}): {}",
                error_code, error_message
            ))),
            other => Err(CdcError::ProtocolError(format!(
                "Expected ACK after SUBSCRIPTION, got {}",
                other.name()
            ))),
        }
    }

    async fn get(&mut self, max_entries: usize, timeout: Duration) -> Result<Batch> {
        let fetch_size = u32::try_from(max_entries).map_err(|_| {
            CdcError::ConfigError(format!("Batch size {} exceeds {}", max_entries, u32::MAX))
        })?;
        let (channel, endpoint) = self.session()?;

        channel
            .write_packet(&Packet::Get {
                destination: endpoint.destination.clone(),
                client_id: endpoint.client_id.clone(),
                fetch_size,
                timeout_ms: timeout.as_millis() as u64,
            })
            .await?;

        let reply = tokio::time::timeout(timeout + READ_GRACE, channel.read_packet())
            .await
            .map_err(|_| CdcError::Timeout)??;

        match reply {
            Packet::Messages { batch_id, entries } => {
                debug!("Fetched batch {} with {} entries", batch_id, entries.len());
                Ok(Batch {
                    id: batch_id,
                    entries,
                })
            }
            Packet::Ack {
                error_code,
                error_message,
            } => Err(CdcError::ProtocolError(format!(
                "Get rejected ({}): {}",
                error_code, error_message
            ))),
            other => Err(CdcError::ProtocolError(format!(
                "Expected MESSAGES, got {}",
                other.name()
            ))),
        }
    }

    async fn ack(&mut self, batch_id: BatchId) -> Result<()> {
        let (channel, endpoint) = self.session()?;
        let packet = Packet::ClientAck {
            destination: endpoint.destination.clone(),
            client_id: endpoint.client_id.clone(),
            batch_id,
        };
        channel.write_packet(&packet).await
    }

    async fn rollback(&mut self, batch_id: BatchId) -> Result<()> {
        let (channel, endpoint) = self.session()?;
        let packet = Packet::ClientRollback {
            destination: endpoint.destination.clone(),
            client_id: endpoint.client_id.clone(),
            batch_id,
        };
        channel.write_packet(&packet).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        let endpoint = self.endpoint.take();
        if let Some(mut channel) = self.channel.take() {
            if let Some(endpoint) = endpoint {
                let unsubscribe = Packet::Unsubscription {
                    destination: endpoint.destination.clone(),
                    client_id: endpoint.client_id.clone(),
                };
                if let Err(e) = channel.write_packet(&unsubscribe).await {
                    warn!("Failed to unsubscribe from {}: {}", endpoint, e);
                }
            }
            channel.shutdown().await.ok();
            debug!("Connection closed");
        }
        Ok(())
    }
}
