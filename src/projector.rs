//! 행 변경 투영
//!
//! 변경 타입에 따라 의미 있는 컬럼 목록만 골라낸다.
//! - Delete: 변경 전 컬럼
//! - Insert: 변경 후 컬럼
//! - Update: 변경 전/후 컬럼 (컬럼 이름 기준으로 위치 정렬)

use crate::entry::{Column, EventType, RowChange, RowData};
use crate::error::{CdcError, Result};
use serde::Serialize;

/// 투영된 행
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProjectedRow<'a> {
    Inserted { after: &'a [Column] },
    Deleted { before: &'a [Column] },
    Updated { before: &'a [Column], after: &'a [Column] },
}

/// Update 컬럼 하나의 변경 전/후 값
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnDelta<'a> {
    pub name: &'a str,
    pub before: &'a Column,
    pub after: &'a Column,
}

impl<'a> ColumnDelta<'a> {
    pub fn changed(&self) -> bool {
        self.after.changed
    }
}

impl<'a> ProjectedRow<'a> {
    fn from_row(event_type: EventType, row: &'a RowData) -> Result<Self> {
        match event_type {
            EventType::Insert => Ok(ProjectedRow::Inserted {
                after: &row.after_columns,
            }),
            EventType::Delete => Ok(ProjectedRow::Deleted {
                before: &row.before_columns,
            }),
            EventType::Update => Ok(ProjectedRow::Updated {
                before: &row.before_columns,
                after: &row.after_columns,
            }),
            EventType::Unknown(tag) => Err(CdcError::UnknownMutationKind(tag)),
        }
    }

    /// 변경 전 값 (Insert는 빈 목록)
    pub fn before(&self) -> &'a [Column] {
        match *self {
            ProjectedRow::Inserted { .. } => &[],
            ProjectedRow::Deleted { before } | ProjectedRow::Updated { before, .. } => before,
        }
    }

    /// 변경 후 값 (Delete는 빈 목록)
    pub fn after(&self) -> &'a [Column] {
        match *self {
            ProjectedRow::Deleted { .. } => &[],
            ProjectedRow::Inserted { after } | ProjectedRow::Updated { after, .. } => after,
        }
    }

    /// Update의 컬럼별 변경 전/후 쌍. 다른 타입은 빈 목록
    pub fn deltas(&self) -> Vec<ColumnDelta<'a>> {
        match *self {
            ProjectedRow::Updated { before, after } => before
                .iter()
                .zip(after.iter())
                .filter(|(b, a)| b.name == a.name)
                .map(|(b, a)| ColumnDelta {
                    name: &a.name,
                    before: b,
                    after: a,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// 실제로 값이 바뀐 컬럼만
    pub fn changed_columns(&self) -> Vec<ColumnDelta<'a>> {
        self.deltas().into_iter().filter(|d| d.changed()).collect()
    }
}

/// RowChange의 모든 행을 투영. 알 수 없는 변경 타입은 `UnknownMutationKind`
pub fn project(change: &RowChange) -> Result<Vec<ProjectedRow<'_>>> {
    if let EventType::Unknown(tag) = change.event_type {
        return Err(CdcError::UnknownMutationKind(tag));
    }

    change
        .rows
        .iter()
        .map(|row| ProjectedRow::from_row(change.event_type, row))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_projects_before_only() {
        let change = RowChange::new(EventType::Delete).with_row(
            vec![Column::new("id", "1"), Column::new("name", "a"), Column::new("age", "3")],
            vec![],
        );
        let rows = project(&change).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].before().len(), 3);
        assert!(rows[0].after().is_empty());
        assert!(rows[0].deltas().is_empty());
    }

    #[test]
    fn test_insert_projects_after_only() {
        let change = RowChange::new(EventType::Insert)
            .with_row(vec![], vec![Column::new("id", "1"), Column::new("name", "a")]);
        let rows = project(&change).unwrap();
        assert!(matches!(rows[0], ProjectedRow::Inserted { after } if after.len() == 2));
        assert!(rows[0].before().is_empty());
    }

    #[test]
    fn test_update_deltas() {
        let mut name_after = Column::new("name", "b");
        name_after.changed = true;
        let change = RowChange::new(EventType::Update).with_row(
            vec![Column::new("id", "1"), Column::new("name", "a")],
            vec![Column::new("id", "1"), name_after],
        );

        let rows = project(&change).unwrap();
        let deltas = rows[0].deltas();
        assert_eq!(deltas.len(), 2);
        assert!(!deltas[0].changed());

        let changed = rows[0].changed_columns();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].name, "name");
        assert_eq!(changed[0].before.value, "a");
        assert_eq!(changed[0].after.value, "b");
    }

    #[test]
    fn test_unknown_kind_is_surfaced() {
        let change = RowChange::new(EventType::Unknown(12))
            .with_row(vec![Column::new("id", "1")], vec![Column::new("id", "1")]);
        match project(&change) {
            Err(CdcError::UnknownMutationKind(tag)) => assert_eq!(tag, 12),
            other => panic!("expected UnknownMutationKind, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_without_rows_is_surfaced() {
        let change = RowChange::new(EventType::Unknown(4));
        assert!(matches!(project(&change), Err(CdcError::UnknownMutationKind(4))));
    }
}
