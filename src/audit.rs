//! Audit sink: per-query provenance, idempotent on trace id

use crate::types::AuditRecord;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Durable audit capability. `write` is idempotent on `trace_id`.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: AuditRecord) -> anyhow::Result<()>;

    async fn fetch(&self, trace_id: &str) -> Option<AuditRecord>;

    /// Whether a record already exists for this trace id
    async fn seen(&self, trace_id: &str) -> bool {
        self.fetch(trace_id).await.is_some()
    }
}

/// In-memory, age-bounded audit store. Suitable for a single process;
/// the capability boundary lets a database-backed sink replace it.
pub struct MemoryAuditStore {
    records: RwLock<HashMap<String, AuditRecord>>,
    retention: Duration,
}

impl MemoryAuditStore {
    pub fn new(retention_days: i64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            retention: Duration::days(retention_days.max(1)),
        }
    }

    fn prune(&self, records: &mut HashMap<String, AuditRecord>) {
        let cutoff = Utc::now() - self.retention;
        records.retain(|_, record| record.completed_at >= cutoff);
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new(90)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditStore {
    async fn write(&self, record: AuditRecord) -> anyhow::Result<()> {
        let mut records = self.records.write().expect("audit store poisoned");
        self.prune(&mut records);
        // First write wins; replays of the same trace are no-ops.
        if records.contains_key(&record.trace_id) {
            debug!(trace_id = %record.trace_id, "duplicate audit write ignored");
            return Ok(());
        }
        records.insert(record.trace_id.clone(), record);
        Ok(())
    }

    async fn fetch(&self, trace_id: &str) -> Option<AuditRecord> {
        let records = self.records.read().expect("audit store poisoned");
        records.get(trace_id).filter(|r| r.completed_at >= Utc::now() - self.retention).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Budget, Mode};
    use std::collections::HashMap as Map;

    fn record(trace_id: &str, total_latency_ms: u64) -> AuditRecord {
        AuditRecord {
            trace_id: trace_id.to_string(),
            query: "q".to_string(),
            mode: Mode::Simple,
            budget: Budget {
                global_deadline_ms: 5000,
                per_lane: Map::new(),
                synthesis_ms: 1000,
                reserve_ms: 500,
            },
            per_lane_results: vec![],
            fused_doc_ids: vec![],
            answer_sentences: vec![],
            citations: vec![],
            bibliography: vec![],
            disagreements: vec![],
            total_latency_ms,
            answered_under_sla: true,
            ttft_ms: Some(10),
            partial: false,
            cancelled: false,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn write_is_idempotent_on_trace_id() {
        let store = MemoryAuditStore::default();
        store.write(record("t-1", 100)).await.unwrap();
        store.write(record("t-1", 999)).await.unwrap();
        let fetched = store.fetch("t-1").await.unwrap();
        assert_eq!(fetched.total_latency_ms, 100);
    }

    #[tokio::test]
    async fn unknown_trace_is_none() {
        let store = MemoryAuditStore::default();
        assert!(store.fetch("missing").await.is_none());
        assert!(!store.seen("missing").await);
    }

    #[tokio::test]
    async fn expired_records_are_dropped() {
        let store = MemoryAuditStore::new(1);
        let mut old = record("t-old", 5);
        old.completed_at = Utc::now() - Duration::days(3);
        store.write(old).await.unwrap();
        assert!(store.fetch("t-old").await.is_none());
    }
}
