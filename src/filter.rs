//! 구독 필터
//!
//! 형식: 쉼표로 구분된 `schema\.table` 정규식 목록
//! 예: "shop\\..*,crm\\.customers"
//! 빈 문자열은 모든 테이블을 뜻한다.

use crate::error::{CdcError, Result};
use regex::Regex;
use std::fmt;

/// 테이블 구독 필터
#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    raw: String,
    patterns: Vec<Regex>,
}

impl SubscriptionFilter {
    /// 모든 스키마/테이블
    pub fn all() -> Self {
        SubscriptionFilter {
            raw: String::new(),
            patterns: Vec::new(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut patterns = Vec::new();

        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            // 전체 이름과 일치해야 한다
            let anchored = format!("^(?:{})$", part);
            let regex = Regex::new(&anchored)
                .map_err(|e| CdcError::ConfigError(format!("Invalid filter '{}': {}", part, e)))?;
            patterns.push(regex);
        }

        Ok(SubscriptionFilter {
            raw: s.trim().to_string(),
            patterns,
        })
    }

    /// 서버로 전송되는 원본 필터 문자열
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, schema: &str, table: &str) -> bool {
        // 테이블이 없는 엔트리 (트랜잭션 마커, heartbeat)는 항상 통과
        if self.patterns.is_empty() || table.is_empty() {
            return true;
        }

        let name = format!("{}.{}", schema, table);
        self.patterns.iter().any(|p| p.is_match(&name))
    }
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        SubscriptionFilter::all()
    }
}

impl fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "<all>")
        } else {
            write!(f, "{}", self.raw)
        }
    }
}
