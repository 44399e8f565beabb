//! Persistence projector: idempotent raw-event insert plus the eight
//! latest-state projection tables, backed by SQLite rather than the
//! source system's Postgres (see DESIGN.md for why).
//!
//! Ported from `examples/original_source/src/kalshi_bot/persistence/postgres.py`
//! (schema + per-type upsert rules) and
//! `examples/original_source/scripts/run_persistence_service.py` (counters,
//! DLQ routing, periodic lag alert). Schema-qualified table names
//! (`event_store.events_raw`, ...) become a flat `event_store_`-prefixed
//! name per table, since SQLite has no schema namespaces. Follows the
//! `rusqlite` idiom established in `vault_db.rs`: `Arc<Mutex<Connection>>`
//! guarded by `tokio::sync::Mutex`, WAL + `synchronous=NORMAL` pragmas,
//! `CREATE TABLE IF NOT EXISTS`.

pub mod dlq_reader;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, Transaction};
use tokio::sync::Mutex;

use crate::error::PipelineError;
use crate::events::Event;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS event_store_events_raw (
    event_type TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL,
    ts_event INTEGER NOT NULL,
    source TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    event_json TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s','now')),
    PRIMARY KEY (event_type, idempotency_key)
);

CREATE INDEX IF NOT EXISTS idx_event_store_events_raw_ts_event
ON event_store_events_raw (ts_event DESC);

CREATE TABLE IF NOT EXISTS event_store_state_spot_latest (
    product_id TEXT PRIMARY KEY,
    ts INTEGER NOT NULL,
    price REAL NOT NULL,
    best_bid REAL,
    best_ask REAL,
    bid_qty REAL,
    ask_qty REAL,
    sequence_num INTEGER,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
);

CREATE TABLE IF NOT EXISTS event_store_state_quote_latest (
    market_id TEXT PRIMARY KEY,
    ts INTEGER NOT NULL,
    yes_bid REAL,
    yes_ask REAL,
    no_bid REAL,
    no_ask REAL,
    yes_mid REAL,
    no_mid REAL,
    p_mid REAL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
);

CREATE TABLE IF NOT EXISTS event_store_state_market_latest (
    market_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    close_ts INTEGER,
    expected_expiration_ts INTEGER,
    expiration_ts INTEGER,
    settlement_ts INTEGER,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
);

CREATE TABLE IF NOT EXISTS event_store_state_contract_latest (
    ticker TEXT PRIMARY KEY,
    lower REAL,
    upper REAL,
    strike_type TEXT,
    close_ts INTEGER,
    expected_expiration_ts INTEGER,
    expiration_ts INTEGER,
    settled_ts INTEGER,
    outcome INTEGER,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
);

CREATE TABLE IF NOT EXISTS event_store_strategy_edge_latest (
    market_id TEXT PRIMARY KEY,
    asof_ts INTEGER NOT NULL,
    prob_yes REAL NOT NULL,
    ev_take_yes REAL NOT NULL,
    ev_take_no REAL NOT NULL,
    sigma_annualized REAL NOT NULL,
    spot_price REAL NOT NULL,
    quote_ts INTEGER,
    spot_ts INTEGER,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
);

CREATE TABLE IF NOT EXISTS event_store_strategy_opportunity_latest (
    market_id TEXT PRIMARY KEY,
    ts_eval INTEGER NOT NULL,
    eligible INTEGER NOT NULL,
    would_trade INTEGER NOT NULL,
    side TEXT,
    reason_not_eligible TEXT,
    ev_raw REAL,
    ev_net REAL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
);

CREATE TABLE IF NOT EXISTS event_store_execution_order_latest (
    order_id TEXT PRIMARY KEY,
    ts_order INTEGER NOT NULL,
    market_id TEXT NOT NULL,
    side TEXT NOT NULL,
    action TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    price_cents REAL,
    status TEXT NOT NULL,
    reason TEXT,
    opportunity_idempotency_key TEXT,
    paper INTEGER NOT NULL DEFAULT 1,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
);

CREATE TABLE IF NOT EXISTS event_store_execution_fill_latest (
    fill_id TEXT PRIMARY KEY,
    ts_fill INTEGER NOT NULL,
    order_id TEXT NOT NULL,
    market_id TEXT NOT NULL,
    side TEXT NOT NULL,
    action TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    price_cents REAL,
    outcome INTEGER,
    reason TEXT,
    paper INTEGER NOT NULL DEFAULT 1,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
);

CREATE TABLE IF NOT EXISTS events_dlq (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_logged INTEGER NOT NULL,
    kind TEXT NOT NULL,
    event_type TEXT,
    subject TEXT NOT NULL,
    error TEXT NOT NULL,
    payload_json TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
);

CREATE INDEX IF NOT EXISTS idx_events_dlq_ts_logged ON events_dlq (ts_logged DESC);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted,
    Duplicate,
}

/// Matches `run_persistence_service.py::Counters` field-for-field.
/// `parse_errors` stays at zero in this architecture: events arrive
/// already typed off `InProcessBus`, so a parse failure can only happen
/// upstream of this projector (at ingest), never here — the field is
/// kept for parity with the ported counters shape.
#[derive(Debug, Clone, Default)]
pub struct PersistenceCounters {
    pub processed: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub parse_errors: u64,
    pub persist_errors: u64,
    pub dlq_published: u64,
}

/// Idempotent event store with eight latest-state projections, backed by
/// a single SQLite connection behind a `tokio::sync::Mutex`.
pub struct PersistenceStore {
    conn: Arc<Mutex<Connection>>,
}

impl PersistenceStore {
    pub fn open(db_path: &str) -> Result<Self, PipelineError> {
        let conn = Connection::open(db_path)
            .map_err(|e| PipelineError::PersistError(format!("open {db_path}: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| PipelineError::PersistError(format!("ensure_schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, PipelineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PipelineError::PersistError(e.to_string()))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| PipelineError::PersistError(format!("ensure_schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert the raw event (idempotent) and, on first occurrence, apply
    /// its latest-state projection upsert — both inside one transaction,
    /// matching the source's commit/rollback-around-the-pair semantics.
    pub async fn persist_event(&self, event: &Event) -> Result<PersistOutcome, PipelineError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| PipelineError::PersistError(e.to_string()))?;
        let outcome = insert_and_project(&tx, event).map_err(|e| PipelineError::PersistError(e.to_string()))?;
        tx.commit()
            .map_err(|e| PipelineError::PersistError(e.to_string()))?;
        Ok(outcome)
    }

    /// Record a parse/persist failure for later operator inspection via
    /// `dlq_reader::list_recent`. Best-effort: failures writing the DLQ
    /// row itself are logged and swallowed, mirroring the source's "never
    /// block the stream on one bad message" policy.
    pub async fn log_dlq(&self, ts_logged: i64, kind: &str, event_type: Option<&str>, subject: &str, error: &str, payload_json: Option<&str>) {
        let conn = self.conn.lock().await;
        if let Err(e) = conn.execute(
            "INSERT INTO events_dlq (ts_logged, kind, event_type, subject, error, payload_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![ts_logged, kind, event_type, subject, error, payload_json],
        ) {
            tracing::warn!(error = %e, "failed to write events_dlq row");
        }
    }
}

fn envelope_fields(event: &Event) -> (u32, &str, serde_json::Value) {
    macro_rules! fields {
        ($e:expr) => {
            (
                $e.schema_version,
                $e.source.as_str(),
                serde_json::to_value(&$e.payload).unwrap_or(serde_json::Value::Null),
            )
        };
    }
    match event {
        Event::SpotTick(e) => fields!(e),
        Event::QuoteUpdate(e) => fields!(e),
        Event::MarketLifecycle(e) => fields!(e),
        Event::ContractUpdate(e) => fields!(e),
        Event::EdgeSnapshot(e) => fields!(e),
        Event::OpportunityDecision(e) => fields!(e),
        Event::ExecutionOrder(e) => fields!(e),
        Event::ExecutionFill(e) => fields!(e),
    }
}

fn insert_and_project(tx: &Transaction, event: &Event) -> rusqlite::Result<PersistOutcome> {
    let event_type = event.event_type().as_str();
    let idempotency_key = event.idempotency_key();
    let ts_event = event.ts_event();
    let (schema_version, source, payload_value) = envelope_fields(event);
    let payload_json = serde_json::to_string(&payload_value).unwrap_or_default();
    let event_json = serde_json::to_string(event).unwrap_or_default();

    tx.execute(
        "INSERT OR IGNORE INTO event_store_events_raw \
         (event_type, schema_version, idempotency_key, ts_event, source, payload_json, event_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![event_type, schema_version, idempotency_key, ts_event, source, payload_json, event_json],
    )?;

    if tx.changes() == 0 {
        return Ok(PersistOutcome::Duplicate);
    }

    upsert_projection(tx, event)?;
    Ok(PersistOutcome::Inserted)
}

fn upsert_projection(tx: &Transaction, event: &Event) -> rusqlite::Result<()> {
    match event {
        Event::SpotTick(e) => {
            let p = &e.payload;
            tx.execute(
                "INSERT INTO event_store_state_spot_latest \
                 (product_id, ts, price, best_bid, best_ask, bid_qty, ask_qty, sequence_num) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(product_id) DO UPDATE SET \
                    ts = excluded.ts, price = excluded.price, best_bid = excluded.best_bid, \
                    best_ask = excluded.best_ask, bid_qty = excluded.bid_qty, \
                    ask_qty = excluded.ask_qty, sequence_num = excluded.sequence_num, \
                    updated_at = strftime('%s','now')",
                params![p.product_id, p.ts, p.price, p.best_bid, p.best_ask, p.bid_qty, p.ask_qty, p.sequence_num],
            )?;
        }
        Event::QuoteUpdate(e) => {
            let p = &e.payload;
            tx.execute(
                "INSERT INTO event_store_state_quote_latest \
                 (market_id, ts, yes_bid, yes_ask, no_bid, no_ask, yes_mid, no_mid, p_mid) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(market_id) DO UPDATE SET \
                    ts = excluded.ts, yes_bid = excluded.yes_bid, yes_ask = excluded.yes_ask, \
                    no_bid = excluded.no_bid, no_ask = excluded.no_ask, yes_mid = excluded.yes_mid, \
                    no_mid = excluded.no_mid, p_mid = excluded.p_mid, \
                    updated_at = strftime('%s','now')",
                params![p.market_id, p.ts, p.yes_bid, p.yes_ask, p.no_bid, p.no_ask, p.yes_mid, p.no_mid, p.p_mid],
            )?;
        }
        Event::MarketLifecycle(e) => {
            let p = &e.payload;
            tx.execute(
                "INSERT INTO event_store_state_market_latest \
                 (market_id, status, close_ts, expected_expiration_ts, expiration_ts, settlement_ts) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(market_id) DO UPDATE SET \
                    status = excluded.status, close_ts = excluded.close_ts, \
                    expected_expiration_ts = excluded.expected_expiration_ts, \
                    expiration_ts = excluded.expiration_ts, settlement_ts = excluded.settlement_ts, \
                    updated_at = strftime('%s','now')",
                params![p.market_id, p.status, p.close_ts, p.expected_expiration_ts, p.expiration_ts, p.settlement_ts],
            )?;
        }
        Event::ContractUpdate(e) => {
            let p = &e.payload;
            // Outcome is monotone: a same-valued update is a no-op, a
            // conflicting one is kept unless `force` is asserted, matching
            // `dao.py::update_contract_outcome`'s CASE ladder.
            tx.execute(
                "INSERT INTO event_store_state_contract_latest \
                 (ticker, lower, upper, strike_type, close_ts, expected_expiration_ts, expiration_ts, settled_ts, outcome) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(ticker) DO UPDATE SET \
                    lower = COALESCE(excluded.lower, event_store_state_contract_latest.lower), \
                    upper = COALESCE(excluded.upper, event_store_state_contract_latest.upper), \
                    strike_type = COALESCE(excluded.strike_type, event_store_state_contract_latest.strike_type), \
                    close_ts = COALESCE(excluded.close_ts, event_store_state_contract_latest.close_ts), \
                    expected_expiration_ts = COALESCE(excluded.expected_expiration_ts, event_store_state_contract_latest.expected_expiration_ts), \
                    expiration_ts = COALESCE(excluded.expiration_ts, event_store_state_contract_latest.expiration_ts), \
                    settled_ts = COALESCE(excluded.settled_ts, event_store_state_contract_latest.settled_ts), \
                    outcome = CASE \
                        WHEN excluded.outcome IS NULL THEN event_store_state_contract_latest.outcome \
                        WHEN event_store_state_contract_latest.outcome IS NULL THEN excluded.outcome \
                        WHEN ?10 = 1 THEN excluded.outcome \
                        ELSE event_store_state_contract_latest.outcome \
                    END, \
                    updated_at = strftime('%s','now')",
                params![p.ticker, p.lower, p.upper, p.strike_type, p.close_ts, p.expected_expiration_ts, p.expiration_ts, p.settled_ts, p.outcome, p.force],
            )?;
        }
        Event::EdgeSnapshot(e) => {
            let p = &e.payload;
            tx.execute(
                "INSERT INTO event_store_strategy_edge_latest \
                 (market_id, asof_ts, prob_yes, ev_take_yes, ev_take_no, sigma_annualized, spot_price, quote_ts, spot_ts) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(market_id) DO UPDATE SET \
                    asof_ts = excluded.asof_ts, prob_yes = excluded.prob_yes, \
                    ev_take_yes = excluded.ev_take_yes, ev_take_no = excluded.ev_take_no, \
                    sigma_annualized = excluded.sigma_annualized, spot_price = excluded.spot_price, \
                    quote_ts = excluded.quote_ts, spot_ts = excluded.spot_ts, \
                    updated_at = strftime('%s','now')",
                params![p.market_id, p.asof_ts, p.prob_yes, p.ev_take_yes, p.ev_take_no, p.sigma_annualized, p.spot_price, p.quote_ts, p.spot_ts],
            )?;
        }
        Event::OpportunityDecision(e) => {
            let p = &e.payload;
            tx.execute(
                "INSERT INTO event_store_strategy_opportunity_latest \
                 (market_id, ts_eval, eligible, would_trade, side, reason_not_eligible, ev_raw, ev_net) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(market_id) DO UPDATE SET \
                    ts_eval = excluded.ts_eval, eligible = excluded.eligible, \
                    would_trade = excluded.would_trade, side = excluded.side, \
                    reason_not_eligible = excluded.reason_not_eligible, ev_raw = excluded.ev_raw, \
                    ev_net = excluded.ev_net, updated_at = strftime('%s','now')",
                params![p.market_id, p.ts_eval, p.eligible, p.would_trade, p.side, p.reason_not_eligible, p.ev_raw, p.ev_net],
            )?;
        }
        Event::ExecutionOrder(e) => {
            let p = &e.payload;
            tx.execute(
                "INSERT INTO event_store_execution_order_latest \
                 (order_id, ts_order, market_id, side, action, quantity, price_cents, status, reason, opportunity_idempotency_key, paper) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(order_id) DO UPDATE SET \
                    ts_order = excluded.ts_order, market_id = excluded.market_id, side = excluded.side, \
                    action = excluded.action, quantity = excluded.quantity, price_cents = excluded.price_cents, \
                    status = excluded.status, reason = excluded.reason, \
                    opportunity_idempotency_key = excluded.opportunity_idempotency_key, paper = excluded.paper, \
                    updated_at = strftime('%s','now')",
                params![p.order_id, p.ts_order, p.market_id, p.side, p.action, p.quantity, p.price_cents, p.status, p.reason, p.opportunity_idempotency_key, p.paper],
            )?;
        }
        Event::ExecutionFill(e) => {
            let p = &e.payload;
            tx.execute(
                "INSERT INTO event_store_execution_fill_latest \
                 (fill_id, ts_fill, order_id, market_id, side, action, quantity, price_cents, outcome, reason, paper) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(fill_id) DO UPDATE SET \
                    ts_fill = excluded.ts_fill, order_id = excluded.order_id, market_id = excluded.market_id, \
                    side = excluded.side, action = excluded.action, quantity = excluded.quantity, \
                    price_cents = excluded.price_cents, outcome = excluded.outcome, reason = excluded.reason, \
                    paper = excluded.paper, updated_at = strftime('%s','now')",
                params![p.fill_id, p.ts_fill, p.order_id, p.market_id, p.side, p.action, p.quantity, p.price_cents, p.outcome, p.reason, p.paper],
            )?;
        }
    }
    Ok(())
}

/// Raw counts the orchestrator's health summary is built from. Grounded in
/// `examples/original_source/src/kalshi_bot/app/live_stack_health.py`'s
/// `_collect_live_health_postgres_sync`, adapted to this crate's table
/// names: reject counts come from `event_store_execution_order_latest`
/// rather than re-parsing `payload_json` out of the raw-event table, since
/// `order_id` is already the latest-state primary key there.
#[derive(Debug, Clone, Default)]
pub struct HealthProjectionCounts {
    pub latest_spot_ts: Option<i64>,
    pub latest_quote_ts: Option<i64>,
    pub latest_snapshot_ts: Option<i64>,
    pub snapshots_last_window: i64,
    pub opportunities_last_window: i64,
    pub execution_orders_last_window: i64,
    pub execution_rejects_last_window: i64,
}

impl PersistenceStore {
    pub async fn health_projection_counts(
        &self,
        product_id: &str,
        window_start_ts: i64,
    ) -> Result<HealthProjectionCounts, PipelineError> {
        let conn = self.conn.lock().await;

        let latest_spot_ts: Option<i64> = conn
            .query_row(
                "SELECT MAX(ts) FROM event_store_state_spot_latest WHERE product_id = ?1",
                params![product_id],
                |row| row.get(0),
            )
            .map_err(|e| PipelineError::PersistError(e.to_string()))?;
        let latest_quote_ts: Option<i64> = conn
            .query_row("SELECT MAX(ts) FROM event_store_state_quote_latest", [], |row| row.get(0))
            .map_err(|e| PipelineError::PersistError(e.to_string()))?;
        let latest_snapshot_ts: Option<i64> = conn
            .query_row(
                "SELECT MAX(asof_ts) FROM event_store_strategy_edge_latest",
                [],
                |row| row.get(0),
            )
            .map_err(|e| PipelineError::PersistError(e.to_string()))?;

        let snapshots_last_window: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event_store_strategy_edge_latest WHERE asof_ts >= ?1",
                params![window_start_ts],
                |row| row.get(0),
            )
            .map_err(|e| PipelineError::PersistError(e.to_string()))?;
        let opportunities_last_window: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event_store_strategy_opportunity_latest WHERE ts_eval >= ?1",
                params![window_start_ts],
                |row| row.get(0),
            )
            .map_err(|e| PipelineError::PersistError(e.to_string()))?;
        let execution_orders_last_window: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event_store_execution_order_latest WHERE ts_order >= ?1",
                params![window_start_ts],
                |row| row.get(0),
            )
            .map_err(|e| PipelineError::PersistError(e.to_string()))?;
        let execution_rejects_last_window: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event_store_execution_order_latest \
                 WHERE ts_order >= ?1 AND status = 'rejected'",
                params![window_start_ts],
                |row| row.get(0),
            )
            .map_err(|e| PipelineError::PersistError(e.to_string()))?;

        Ok(HealthProjectionCounts {
            latest_spot_ts,
            latest_quote_ts,
            latest_snapshot_ts,
            snapshots_last_window,
            opportunities_last_window,
            execution_orders_last_window,
            execution_rejects_last_window,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LagAlertConfig {
    pub threshold: u64,
    pub cooldown: Duration,
}

impl Default for LagAlertConfig {
    fn default() -> Self {
        Self {
            threshold: 1000,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Rate-limited consumer-lag ALERT, ported from the
/// `market_consumer_lag` warning block in `run_persistence_service.py`.
#[derive(Debug, Default)]
pub struct LagAlertGate {
    last_alert_at: Option<Instant>,
}

impl LagAlertGate {
    pub fn check(&mut self, num_pending: u64, config: &LagAlertConfig) -> bool {
        if config.threshold == 0 || num_pending <= config.threshold {
            return false;
        }
        let elapsed = self.last_alert_at.is_none_or(|t| t.elapsed() >= config.cooldown);
        if elapsed {
            self.last_alert_at = Some(Instant::now());
        }
        elapsed
    }
}
