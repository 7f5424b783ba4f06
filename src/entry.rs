//! CDC 서버가 전달하는 배치/엔트리 및 디코딩된 행 변경 데이터 구조 정의

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 배치 식별자 (서버 커서 토큰)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl BatchId {
    /// 빈 배치의 id. `rollback`에서는 "마지막 ack 위치부터 재전송"을 뜻한다.
    pub const NONE: BatchId = BatchId(0);

    pub fn is_none(&self) -> bool {
        *self == BatchId::NONE
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 엔트리 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// 트랜잭션 시작 마커
    TransactionBegin,
    /// 행 변경 (payload 포함)
    RowMutation,
    /// 트랜잭션 종료 마커
    TransactionEnd,
    /// 서버 heartbeat
    Heartbeat,
    /// 알 수 없는 종류 (이후 프로토콜 확장)
    Unknown(u8),
}

impl EntryKind {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => EntryKind::TransactionBegin,
            2 => EntryKind::RowMutation,
            3 => EntryKind::TransactionEnd,
            4 => EntryKind::Heartbeat,
            other => EntryKind::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            EntryKind::TransactionBegin => 1,
            EntryKind::RowMutation => 2,
            EntryKind::TransactionEnd => 3,
            EntryKind::Heartbeat => 4,
            EntryKind::Unknown(other) => *other,
        }
    }

    /// 트랜잭션 경계 마커 여부
    pub fn is_transaction_marker(&self) -> bool {
        matches!(self, EntryKind::TransactionBegin | EntryKind::TransactionEnd)
    }
}

/// 엔트리 헤더
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    /// 로그 파일명 (e.g., "mysql-bin.000001")
    pub log_source_name: String,
    /// 로그 파일 내 오프셋
    pub log_offset: u64,
    /// 원본 실행 시각 (epoch ms)
    pub execute_time: i64,
    /// 원본 DB 서버 ID
    pub server_id: u32,
    /// GTID (있는 경우)
    pub gtid: Option<String>,
    /// 스키마명
    pub schema_name: String,
    /// 테이블명
    pub table_name: String,
}

impl EntryHeader {
    pub fn new(log_source_name: impl Into<String>, log_offset: u64) -> Self {
        EntryHeader {
            log_source_name: log_source_name.into(),
            log_offset,
            ..Default::default()
        }
    }

    pub fn with_table(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.schema_name = schema.into();
        self.table_name = table.into();
        self
    }

    /// `file:offset` 형식의 로그 위치
    pub fn position(&self) -> String {
        format!("{}:{}", self.log_source_name, self.log_offset)
    }

    pub fn executed_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.execute_time).single()
    }
}

/// 서버에서 받은 원본 엔트리 (payload는 디코딩 전)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub header: EntryHeader,
    /// RowMutation 엔트리의 직렬화된 RowChange
    pub payload: Bytes,
}

impl Entry {
    pub fn transaction_begin(header: EntryHeader) -> Self {
        Entry {
            kind: EntryKind::TransactionBegin,
            header,
            payload: Bytes::new(),
        }
    }

    pub fn transaction_end(header: EntryHeader) -> Self {
        Entry {
            kind: EntryKind::TransactionEnd,
            header,
            payload: Bytes::new(),
        }
    }

    pub fn row_mutation(header: EntryHeader, payload: impl Into<Bytes>) -> Self {
        Entry {
            kind: EntryKind::RowMutation,
            header,
            payload: payload.into(),
        }
    }
}

/// `get`으로 받은 배치. 반환된 이후에는 변경되지 않는다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    /// 로그 순서를 유지하는 엔트리들
    pub entries: Vec<Entry>,
}

impl Batch {
    pub fn empty() -> Self {
        Batch {
            id: BatchId::NONE,
            entries: Vec::new(),
        }
    }

    /// 새로운 데이터가 없는 배치 여부
    pub fn is_empty(&self) -> bool {
        self.id.is_none() || self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 행 변경 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Insert,
    Update,
    Delete,
    /// 알 수 없는 타입 (원본 태그 보존)
    Unknown(u8),
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => EventType::Insert,
            2 => EventType::Update,
            3 => EventType::Delete,
            other => EventType::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            EventType::Insert => 1,
            EventType::Update => 2,
            EventType::Delete => 3,
            EventType::Unknown(other) => *other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Unknown(tag) => write!(f, "UNKNOWN({})", tag),
            known => f.write_str(known.as_str()),
        }
    }
}

/// 컬럼 값
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// 테이블 내 컬럼 위치
    pub index: u32,
    /// JDBC sql type 코드
    pub sql_type: i32,
    pub name: String,
    /// 텍스트로 표현된 값 (NULL이면 빈 문자열)
    pub value: String,
    /// 원본 컬럼 타입 (e.g., "varchar(64)")
    pub mysql_type: String,
    pub is_key: bool,
    pub is_null: bool,
    /// Update에서 변경 전 값과 달라진 컬럼
    pub changed: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Column {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn null(name: impl Into<String>) -> Self {
        Column {
            name: name.into(),
            is_null: true,
            ..Default::default()
        }
    }

    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    /// 값이 같은지 비교 (NULL 여부 포함)
    pub fn same_value(&self, other: &Column) -> bool {
        self.is_null == other.is_null && (self.is_null || self.value == other.value)
    }
}

/// 한 행의 변경 전/후 컬럼들
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowData {
    pub before_columns: Vec<Column>,
    pub after_columns: Vec<Column>,
}

/// RowMutation 엔트리 payload를 디코딩한 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChange {
    pub event_type: EventType,
    pub is_ddl: bool,
    /// 원본 SQL (DDL 또는 rows query가 있는 경우)
    pub sql: Option<String>,
    pub rows: Vec<RowData>,
}

impl RowChange {
    pub fn new(event_type: EventType) -> Self {
        RowChange {
            event_type,
            is_ddl: false,
            sql: None,
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, before: Vec<Column>, after: Vec<Column>) -> Self {
        self.rows.push(RowData {
            before_columns: before,
            after_columns: after,
        });
        self
    }
}
