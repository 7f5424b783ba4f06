//! 엔트리 디코더
//!
//! RowMutation 엔트리의 payload 형식:
//!   - Event Type (1 byte: 1 Insert, 2 Update, 3 Delete)
//!   - Flags (1 byte: bit0 DDL)
//!   - SQL (LCB string)
//!   - Row Count (LCB)
//!   - 각 행: before 컬럼 목록, after 컬럼 목록 (LCB 개수 + 컬럼들)
//!   - 각 컬럼: Index (LCB), SQL Type (i32), Name, Flags (bit0 key, bit1 updated,
//!     bit2 null), Value, MySQL Type
//!
//! 디코딩 실패는 엔트리 단위의 `DecodeError`로 변환되며 배치 처리를 중단하지 않는다.

use crate::codec::{read_lcb, read_string, remaining, write_lcb, write_string};
use crate::entry::*;
use crate::error::{DecodeError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{self, Cursor};
use tracing::{debug, error};

const FLAG_DDL: u8 = 0x01;

const COLUMN_KEY: u8 = 0x01;
const COLUMN_UPDATED: u8 = 0x02;
const COLUMN_NULL: u8 = 0x04;

/// 엔트리 하나를 디코딩한 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPayload {
    TransactionBegin,
    TransactionEnd,
    Heartbeat,
    RowChange(RowChange),
}

/// 디코딩된 엔트리 (헤더 + 엔트리별 결과)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntry {
    pub kind: EntryKind,
    pub header: EntryHeader,
    pub outcome: std::result::Result<EntryPayload, DecodeError>,
}

impl DecodedEntry {
    /// 행 변경인 경우에만 반환 (트랜잭션 마커, 실패는 제외)
    pub fn row_change(&self) -> Option<&RowChange> {
        match &self.outcome {
            Ok(EntryPayload::RowChange(change)) => Some(change),
            _ => None,
        }
    }

    pub fn decode_error(&self) -> Option<&DecodeError> {
        self.outcome.as_ref().err()
    }
}

/// 디코딩된 배치
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    pub id: BatchId,
    pub entries: Vec<DecodedEntry>,
}

impl DecodedBatch {
    /// 행 변경만 로그 순서대로 순회
    pub fn row_changes(&self) -> impl Iterator<Item = (&EntryHeader, &RowChange)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.row_change().map(|change| (&entry.header, change)))
    }

    pub fn decode_failures(&self) -> impl Iterator<Item = (&EntryHeader, &DecodeError)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.decode_error().map(|err| (&entry.header, err)))
    }

    pub fn failure_count(&self) -> usize {
        self.decode_failures().count()
    }
}

/// 엔트리 디코더
pub struct EntryDecoder;

impl EntryDecoder {
    /// 배치의 모든 엔트리를 순서대로 디코딩. 실패한 엔트리는 로그를 남기고 계속 진행한다.
    pub fn decode_batch(batch: &Batch) -> DecodedBatch {
        let entries: Vec<DecodedEntry> = batch
            .entries
            .iter()
            .map(|entry| {
                let decoded = Self::decode_entry(entry);
                if let Err(ref e) = decoded.outcome {
                    error!("Batch {}: {}", batch.id, e);
                }
                decoded
            })
            .collect();

        DecodedBatch {
            id: batch.id,
            entries,
        }
    }

    /// 엔트리 하나를 종류에 따라 디코딩
    pub fn decode_entry(entry: &Entry) -> DecodedEntry {
        let outcome = match entry.kind {
            EntryKind::TransactionBegin => Ok(EntryPayload::TransactionBegin),
            EntryKind::TransactionEnd => Ok(EntryPayload::TransactionEnd),
            EntryKind::Heartbeat => Ok(EntryPayload::Heartbeat),
            EntryKind::RowMutation => Self::parse_row_change(&entry.payload)
                .map(EntryPayload::RowChange)
                .map_err(|reason| DecodeError::new(entry.header.position(), reason)),
            EntryKind::Unknown(tag) => Err(DecodeError::new(
                entry.header.position(),
                format!("unknown entry kind {}", tag),
            )),
        };

        DecodedEntry {
            kind: entry.kind,
            header: entry.header.clone(),
            outcome,
        }
    }

    /// RowChange payload 파싱
    pub fn parse_row_change(data: &[u8]) -> std::result::Result<RowChange, String> {
        if data.len() < 2 {
            return Err("row change payload too short".to_string());
        }

        let mut cursor = Cursor::new(data);
        let change = read_row_change(&mut cursor).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => format!("truncated row change payload: {}", e),
            _ => format!("malformed row change payload: {}", e),
        })?;

        if remaining(&cursor) > 0 {
            return Err(format!(
                "{} trailing bytes after row change",
                remaining(&cursor)
            ));
        }

        let change = validate_row_change(change)?;
        debug!(
            "Decoded {} row change with {} rows",
            change.event_type,
            change.rows.len()
        );
        Ok(change)
    }

    /// RowChange를 payload 형식으로 직렬화
    pub fn encode_row_change(change: &RowChange) -> Result<Bytes> {
        let mut buffer = Vec::new();
        write_row_change(&mut buffer, change)?;
        Ok(Bytes::from(buffer))
    }
}

fn read_row_change(cursor: &mut Cursor<&[u8]>) -> io::Result<RowChange> {
    let event_type = EventType::from_u8(cursor.read_u8()?);
    let flags = cursor.read_u8()?;
    let sql = read_string(cursor)?;

    let row_count = read_lcb(cursor)?;
    let mut rows = Vec::new();
    for _ in 0..row_count {
        let before_columns = read_columns(cursor)?;
        let after_columns = read_columns(cursor)?;
        rows.push(RowData {
            before_columns,
            after_columns,
        });
    }

    Ok(RowChange {
        event_type,
        is_ddl: flags & FLAG_DDL != 0,
        sql: if sql.is_empty() { None } else { Some(sql) },
        rows,
    })
}

fn read_columns(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<Column>> {
    let count = read_lcb(cursor)?;
    let mut columns = Vec::new();
    for _ in 0..count {
        let raw_index = read_lcb(cursor)?;
        let index = u32::try_from(raw_index).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("column index {} out of range", raw_index),
            )
        })?;
        let sql_type = cursor.read_i32::<LittleEndian>()?;
        let name = read_string(cursor)?;
        let flags = cursor.read_u8()?;
        let value = read_string(cursor)?;
        let mysql_type = read_string(cursor)?;

        columns.push(Column {
            index,
            sql_type,
            name,
            value,
            mysql_type,
            is_key: flags & COLUMN_KEY != 0,
            is_null: flags & COLUMN_NULL != 0,
            changed: flags & COLUMN_UPDATED != 0,
        });
    }
    Ok(columns)
}

/// 변경 타입별 컬럼 구성 검증 및 Update의 `changed` 플래그 계산
fn validate_row_change(mut change: RowChange) -> std::result::Result<RowChange, String> {
    for (row_idx, row) in change.rows.iter_mut().enumerate() {
        match change.event_type {
            EventType::Insert => {
                if !row.before_columns.is_empty() {
                    return Err(format!("insert row {} carries before columns", row_idx));
                }
                if row.after_columns.is_empty() {
                    return Err(format!("insert row {} has no after columns", row_idx));
                }
            }
            EventType::Delete => {
                if !row.after_columns.is_empty() {
                    return Err(format!("delete row {} carries after columns", row_idx));
                }
            }
            EventType::Update => {
                if row.before_columns.is_empty() || row.after_columns.is_empty() {
                    return Err(format!(
                        "update row {} is missing before or after columns",
                        row_idx
                    ));
                }
                if row.before_columns.len() != row.after_columns.len() {
                    return Err(format!(
                        "update row {} has {} before and {} after columns",
                        row_idx,
                        row.before_columns.len(),
                        row.after_columns.len()
                    ));
                }
                for (before, after) in row.before_columns.iter_mut().zip(row.after_columns.iter_mut()) {
                    if before.name != after.name {
                        return Err(format!(
                            "update row {} column mismatch: {} vs {}",
                            row_idx, before.name, after.name
                        ));
                    }
                    before.changed = false;
                    after.changed = after.changed || !after.same_value(before);
                }
            }
            // 알 수 없는 타입은 구조만 보존하고 해석은 호출자에게 맡긴다
            EventType::Unknown(_) => {}
        }
    }
    Ok(change)
}

fn write_row_change(buffer: &mut Vec<u8>, change: &RowChange) -> io::Result<()> {
    buffer.write_u8(change.event_type.as_u8())?;
    buffer.write_u8(if change.is_ddl { FLAG_DDL } else { 0 })?;
    write_string(buffer, change.sql.as_deref().unwrap_or(""))?;
    write_lcb(buffer, change.rows.len() as u64)?;
    for row in &change.rows {
        write_columns(buffer, &row.before_columns)?;
        write_columns(buffer, &row.after_columns)?;
    }
    Ok(())
}

fn write_columns(buffer: &mut Vec<u8>, columns: &[Column]) -> io::Result<()> {
    write_lcb(buffer, columns.len() as u64)?;
    for column in columns {
        let mut flags = 0u8;
        if column.is_key {
            flags |= COLUMN_KEY;
        }
        if column.changed {
            flags |= COLUMN_UPDATED;
        }
        if column.is_null {
            flags |= COLUMN_NULL;
        }

        write_lcb(buffer, column.index as u64)?;
        buffer.write_i32::<LittleEndian>(column.sql_type)?;
        write_string(buffer, &column.name)?;
        buffer.write_u8(flags)?;
        write_string(buffer, &column.value)?;
        write_string(buffer, &column.mysql_type)?;
    }
    Ok(())
}
