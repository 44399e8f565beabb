//! Read-only DLQ inspection, ported from
//! `examples/original_source/scripts/inspect_dlq.py`. The Python script
//! re-subscribes to the bus's `dlq.>` subject; this crate's projector
//! already writes every DLQ occurrence to `events_dlq`
//! (`PersistenceStore::log_dlq`), so the equivalent "operator looks at
//! recent dead letters" surface is a plain query over that table instead
//! of a second bus subscription.

use rusqlite::params;

use super::PersistenceStore;
use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq)]
pub struct DlqRecord {
    pub id: i64,
    pub ts_logged: i64,
    pub kind: String,
    pub event_type: Option<String>,
    pub subject: String,
    pub error: String,
    pub payload_json: Option<String>,
}

impl PersistenceStore {
    /// Most recent `limit` dead-letter rows, newest first.
    pub async fn list_recent_dlq(&self, limit: usize) -> Result<Vec<DlqRecord>, PipelineError> {
        list_recent(self, limit).await
    }
}

pub async fn list_recent(store: &PersistenceStore, limit: usize) -> Result<Vec<DlqRecord>, PipelineError> {
    let limit = limit.clamp(1, 10_000) as i64;
    let conn = store.conn.lock().await;
    let mut stmt = conn
        .prepare_cached(
            "SELECT id, ts_logged, kind, event_type, subject, error, payload_json \
             FROM events_dlq ORDER BY ts_logged DESC LIMIT ?1",
        )
        .map_err(|e| PipelineError::PersistError(e.to_string()))?;

    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(DlqRecord {
                id: row.get(0)?,
                ts_logged: row.get(1)?,
                kind: row.get(2)?,
                event_type: row.get(3)?,
                subject: row.get(4)?,
                error: row.get(5)?,
                payload_json: row.get(6)?,
            })
        })
        .map_err(|e| PipelineError::PersistError(e.to_string()))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| PipelineError::PersistError(e.to_string()))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_most_recent_first() {
        let store = PersistenceStore::open_in_memory().unwrap();
        store.log_dlq(100, "parse_error", None, "dlq.invalid_event", "bad json", None).await;
        store
            .log_dlq(200, "persist_error", Some("spot_tick"), "dlq.market.spot_ticks", "constraint", Some("{}"))
            .await;

        let rows = store.list_recent_dlq(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts_logged, 200);
        assert_eq!(rows[0].kind, "persist_error");
        assert_eq!(rows[1].ts_logged, 100);
    }
}
