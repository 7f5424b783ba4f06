//! Canal CDC (Change Data Capture) 클라이언트 핵심 구현
//!
//! 이 라이브러리는 Canal 서버에 접속해 MySQL 행 변경 사항을 배치 단위로 가져옵니다.
//! 주요 기능:
//! - 세션 상태 관리 (connect / subscribe / get / ack / rollback)
//! - 엔트리 디코딩 및 행 변경 투영
//! - 폴링 루프, 재연결, 협조적 종료
//!
//! 배치는 ack되기 전까지 재전송될 수 있다 (at-least-once).

pub mod auth;
pub mod codec;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod decoder;
pub mod entry;
pub mod error;
pub mod filter;
pub mod memory;
pub mod poller;
pub mod projector;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use connector::TcpConnector;
pub use consumer::{BatchHandler, FnHandler, LoggingHandler, OutputFormat};
pub use decoder::{DecodedBatch, EntryDecoder};
pub use entry::{Batch, BatchId, Column, Entry, EntryHeader, EntryKind, EventType, RowChange};
pub use error::{CdcError, Result};
pub use filter::SubscriptionFilter;
pub use memory::MemoryServer;
pub use poller::{CdcPoller, PollStats, PollerConfig, StopHandle};
pub use projector::{project, ProjectedRow};
pub use session::{Session, SessionState};
pub use transport::{Credentials, Endpoint, Transport};
