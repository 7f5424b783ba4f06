//! 컨슈머 콜백 인터페이스
//!
//! 폴링 루프는 배치를 가져와 디코딩한 뒤 `BatchHandler::on_batch`를 한 번 호출하고,
//! 성공하면 ack한다. 같은 배치가 재전송될 수 있으므로 핸들러는 중복 처리를 견뎌야 한다.

use crate::decoder::DecodedBatch;
use crate::entry::{Column, EntryHeader, RowChange};
use crate::error::{CdcError, Result};
use crate::projector::{project, ProjectedRow};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

/// 디코딩된 배치 수신자
#[async_trait]
pub trait BatchHandler: Send {
    /// 에러를 반환하면 배치는 ack되지 않고 rollback되어 재전송된다.
    async fn on_batch(&mut self, batch: &DecodedBatch) -> Result<()>;
}

/// 클로저를 핸들러로 사용
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> BatchHandler for FnHandler<F>
where
    F: FnMut(&DecodedBatch) -> Result<()> + Send,
{
    async fn on_batch(&mut self, batch: &DecodedBatch) -> Result<()> {
        (self.0)(batch)
    }
}

/// 출력 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// 행 변경을 로그로 출력하는 핸들러
#[derive(Debug, Default)]
pub struct LoggingHandler {
    format: OutputFormat,
}

impl LoggingHandler {
    pub fn new(format: OutputFormat) -> Self {
        LoggingHandler { format }
    }

    fn log_text(header: &EntryHeader, change: &RowChange, rows: &[ProjectedRow<'_>]) {
        info!("----------------------->");
        info!(
            "================> binlog[{}:{}] , name[{},{}] , eventType : {}",
            header.log_source_name,
            header.log_offset,
            header.schema_name,
            header.table_name,
            change.event_type
        );

        for row in rows {
            match row {
                ProjectedRow::Deleted { before } => log_columns(before),
                ProjectedRow::Inserted { after } => log_columns(after),
                ProjectedRow::Updated { before, after } => {
                    info!("-------> before");
                    log_columns(before);
                    info!("-------> after");
                    log_columns(after);
                }
            }
        }
    }

    fn log_json(header: &EntryHeader, change: &RowChange, rows: &[ProjectedRow<'_>]) -> Result<()> {
        let record = json!({
            "position": header.position(),
            "executed_at": header.executed_at().map(|t| t.to_rfc3339()),
            "schema": header.schema_name,
            "table": header.table_name,
            "event_type": change.event_type.as_str(),
            "rows": rows,
        });
        info!("{}", serde_json::to_string(&record)?);
        Ok(())
    }
}

fn log_columns(columns: &[Column]) {
    for column in columns {
        let value = if column.is_null { "NULL" } else { column.value.as_str() };
        info!("{} : {}  update= {}", column.name, value, column.changed);
    }
}

#[async_trait]
impl BatchHandler for LoggingHandler {
    async fn on_batch(&mut self, batch: &DecodedBatch) -> Result<()> {
        for (header, change) in batch.row_changes() {
            if change.is_ddl {
                info!(
                    "DDL at {} on {}: {}",
                    header.position(),
                    header.schema_name,
                    change.sql.as_deref().unwrap_or("")
                );
                continue;
            }

            let rows = match project(change) {
                Ok(rows) => rows,
                Err(CdcError::UnknownMutationKind(tag)) => {
                    warn!(
                        "Skipping entry at {} with unsupported mutation kind {}",
                        header.position(),
                        tag
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.format {
                OutputFormat::Text => Self::log_text(header, change, &rows),
                OutputFormat::Json => Self::log_json(header, change, &rows)?,
            }
        }
        Ok(())
    }
}
