//! CDC 클라이언트 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("서버 연결 에러: {0}")]
    ConnectionError(String),

    #[error("세션 상태 에러: {0}")]
    ProtocolStateError(String),

    #[error(transparent)]
    DecodeError(#[from] DecodeError),

    #[error("알 수 없는 변경 타입: {0}")]
    UnknownMutationKind(u8),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("컨슈머 처리 에러: {0}")]
    HandlerError(String),

    #[error("Timeout 에러")]
    Timeout,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    /// 재연결 후 재시도로 복구 가능한 에러인지 여부
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CdcError::ConnectionError(_) | CdcError::IoError(_) | CdcError::Timeout
        )
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

/// 단일 엔트리 payload 디코딩 실패
///
/// 배치 전체가 아니라 해당 엔트리 하나에만 국한된다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("엔트리 디코딩 실패 [{position}]: {reason}")]
pub struct DecodeError {
    /// 로그 위치 (`file:offset`)
    pub position: String,
    /// 실패 사유
    pub reason: String,
}

impl DecodeError {
    pub fn new(position: impl Into<String>, reason: impl Into<String>) -> Self {
        DecodeError {
            position: position.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
