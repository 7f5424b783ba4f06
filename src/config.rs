//! 클라이언트 설정
//!
//! 환경 변수 또는 JSON 파일에서 읽는다. 지정하지 않은 항목은 기본값을 사용한다.

use crate::connector::ConnectorConfig;
use crate::consumer::OutputFormat;
use crate::error::{CdcError, Result};
use crate::filter::SubscriptionFilter;
use crate::poller::PollerConfig;
use crate::transport::{Credentials, Endpoint};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// CDC 클라이언트 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub hostname: String,
    pub port: u16,
    pub destination: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// 구독 필터 (`schema\.table` 정규식 목록)
    pub filter: String,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub fetch_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub idle_backoff_max_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: Option<u32>,
    pub rollback_on_start: bool,
    pub json_output: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let endpoint = Endpoint::default();
        ClientConfig {
            hostname: endpoint.hostname,
            port: endpoint.port,
            destination: endpoint.destination,
            client_id: endpoint.client_id,
            username: String::new(),
            password: String::new(),
            filter: r".*\..*".to_string(),
            batch_size: 1024,
            poll_interval_ms: 300,
            fetch_timeout_ms: 1000,
            connect_timeout_ms: 10_000,
            idle_backoff_max_ms: 5_000,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: None,
            rollback_on_start: true,
            json_output: false,
        }
    }
}

impl ClientConfig {
    /// 환경 변수에서 설정 읽기
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 키 조회 함수로 설정 읽기
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ClientConfig::default();

        if let Some(v) = lookup("CANAL_HOST") {
            config.hostname = v;
        }
        if let Some(v) = lookup("CANAL_DESTINATION") {
            config.destination = v;
        }
        if let Some(v) = lookup("CANAL_CLIENT_ID") {
            config.client_id = v;
        }
        if let Some(v) = lookup("CANAL_USERNAME") {
            config.username = v;
        }
        if let Some(v) = lookup("CANAL_PASSWORD") {
            config.password = v;
        }
        if let Some(v) = lookup("CANAL_FILTER") {
            config.filter = v;
        }

        config.port = parse_var(&lookup, "CANAL_PORT", config.port)?;
        config.batch_size = parse_var(&lookup, "CANAL_BATCH_SIZE", config.batch_size)?;
        config.poll_interval_ms = parse_var(&lookup, "CANAL_POLL_INTERVAL_MS", config.poll_interval_ms)?;
        config.fetch_timeout_ms = parse_var(&lookup, "CANAL_FETCH_TIMEOUT_MS", config.fetch_timeout_ms)?;
        config.json_output = parse_var(&lookup, "CANAL_JSON_OUTPUT", config.json_output)?;

        config.validate()?;
        Ok(config)
    }

    /// JSON 파일에서 설정 읽기
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CdcError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(contents)
            .map_err(|e| CdcError::ConfigError(format!("Invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(CdcError::ConfigError("hostname must not be empty".to_string()));
        }
        if self.destination.is_empty() {
            return Err(CdcError::ConfigError("destination must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(CdcError::ConfigError("batch_size must be positive".to_string()));
        }
        if u32::try_from(self.batch_size).is_err() {
            return Err(CdcError::ConfigError(format!(
                "batch_size must not exceed {}",
                u32::MAX
            )));
        }
        SubscriptionFilter::parse(&self.filter)?;
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            hostname: self.hostname.clone(),
            port: self.port,
            destination: self.destination.clone(),
            client_id: self.client_id.clone(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }

    pub fn subscription_filter(&self) -> Result<SubscriptionFilter> {
        SubscriptionFilter::parse(&self.filter)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn output_format(&self) -> OutputFormat {
        if self.json_output {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..Default::default()
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            batch_size: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            idle_backoff_max: Duration::from_millis(self.idle_backoff_max_ms),
            reconnect_initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            rollback_on_start: self.rollback_on_start,
            ..Default::default()
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CdcError::ConfigError(format!("Invalid {}='{}': {}", key, raw, e))),
        None => Ok(default),
    }
}
