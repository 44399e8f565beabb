//! Edge & paper-execution pipeline orchestrator.
//!
//! Wires the bus adapter, live state, and the edge/opportunity/execution/
//! persistence workers together, supervises them with restart-on-exit, and
//! runs a periodic health-summary log until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use edge_pipeline::bus::{InProcessBus, StreamPolicy};
use edge_pipeline::config::Config;
use edge_pipeline::edge::{compute_edges_from_live_state, EdgeEngineConfig};
use edge_pipeline::events::{Envelope, Event, EventType};
use edge_pipeline::execution::{
    process_contract_update, process_opportunity, ExecutionConfig, ExecutionOutcome,
    PaperExecutionState, RejectRateAlertConfig, RejectRateAlertGate,
};
use edge_pipeline::opportunity::{build_opportunities_from_snapshots, OpportunityConfig};
use edge_pipeline::orchestrator::health::{compute, StalenessThresholds};
use edge_pipeline::orchestrator::Supervisor;
use edge_pipeline::persistence::PersistenceStore;
use edge_pipeline::state::{LiveMarketState, SelectionConfig};
use edge_pipeline::volatility::{SigmaMemory, VolatilityParams};

const PRODUCT_ID: &str = "BTC-USD";

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// State-ingest worker: drains the market-events consumer and applies
/// every event into the shared live state.
async fn run_state_ingest(
    bus: Arc<InProcessBus>,
    state: Arc<Mutex<LiveMarketState>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let consumer = bus.pull_subscribe("state_ingest_market", vec!["market.>".to_string()], 10_000);

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let batch = consumer.fetch(256, Duration::from_secs(1)).await;
        if batch.is_empty() {
            continue;
        }
        let mut st = state.lock().await;
        for event in &batch {
            match event {
                Event::SpotTick(env) => st.apply_spot_tick(&env.payload),
                Event::QuoteUpdate(env) => st.apply_quote_update(&env.payload),
                Event::MarketLifecycle(env) => st.apply_market_lifecycle(&env.payload, env.ts_event),
                Event::ContractUpdate(env) => st.apply_contract_update(&env.payload, env.ts_event),
                _ => {}
            }
        }
    }
}

/// Edge engine worker: on every spot tick, recomputes edge snapshots over
/// the current universe and publishes `edge_snapshot` events.
async fn run_edge_engine(
    bus: Arc<InProcessBus>,
    state: Arc<Mutex<LiveMarketState>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let consumer = bus.pull_subscribe("edge_engine_spot", vec!["market.spot_ticks".to_string()], 10_000);
    let mut sigma_memory = SigmaMemory::default();
    let engine_config = EdgeEngineConfig {
        product_id: PRODUCT_ID.to_string(),
        volatility: VolatilityParams::default(),
        selection: SelectionConfig::default(),
        freshness_seconds: 120,
        contracts: 1,
    };

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let batch = consumer.fetch(256, Duration::from_secs(1)).await;
        let Some(latest) = batch.last() else { continue };
        let ts = latest.ts_event();

        let st = state.lock().await;
        let (outcome, rows) = compute_edges_from_live_state(&st, &mut sigma_memory, &engine_config, ts);
        drop(st);

        if let Some(err) = outcome.error {
            tracing::debug!(error = err, "edge engine pass produced no snapshots");
            continue;
        }

        for row in &rows {
            let payload = edge_pipeline::events::EdgeSnapshotPayload {
                asof_ts: row.asof_ts,
                market_id: row.market_id.clone(),
                prob_yes: row.prob_yes,
                ev_take_yes: row.ev_take_yes.unwrap_or(0.0),
                ev_take_no: row.ev_take_no.unwrap_or(0.0),
                sigma_annualized: row.sigma_annualized,
                spot_price: row.spot_price,
                quote_ts: row.quote_ts,
                spot_ts: Some(row.spot_ts),
                settlement_ts: Some(row.settlement_ts),
                horizon_seconds: Some(row.horizon_seconds),
                strike: row.strike.clone(),
                prob_yes_raw: row.prob_yes_raw,
                yes_bid: row.yes_bid,
                yes_ask: row.yes_ask,
                no_bid: row.no_bid,
                no_ask: row.no_ask,
                yes_mid: row.yes_mid,
                no_mid: row.no_mid,
                spot_age_seconds: Some(row.spot_age_seconds),
                quote_age_seconds: row.quote_age_seconds,
                raw_json: None,
            };
            match Envelope::new(EventType::EdgeSnapshot, row.asof_ts, "edge_engine", payload) {
                Ok(envelope) => {
                    bus.publish(Event::EdgeSnapshot(envelope));
                }
                Err(err) => tracing::warn!(error = %err, "failed to build edge_snapshot envelope"),
            }
        }

        if let Some(sigma) = outcome.sigma {
            if !sigma.sigma_ok {
                tracing::debug!(reason = ?sigma.reason, source = ?sigma.sigma_source, "sigma fell back this pass");
            }
        }
    }
}

/// Opportunity engine worker: batches one tick's `edge_snapshot`s (keyed
/// by `asof_ts`) into TAKE/PASS decisions.
async fn run_opportunity_engine(bus: Arc<InProcessBus>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let consumer = bus.pull_subscribe(
        "opportunity_engine_edges",
        vec!["strategy.edge_snapshots".to_string()],
        10_000,
    );
    let config = OpportunityConfig::default();
    let volatility_defaults = VolatilityParams::default();

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let batch = consumer.fetch(256, Duration::from_secs(1)).await;
        if batch.is_empty() {
            continue;
        }

        let mut snapshots = Vec::new();
        for event in &batch {
            if let Event::EdgeSnapshot(env) = event {
                snapshots.push(edge_pipeline::edge::EdgeSnapshotRow {
                    asof_ts: env.payload.asof_ts,
                    market_id: env.payload.market_id.clone(),
                    settlement_ts: env.payload.settlement_ts.unwrap_or(env.payload.asof_ts),
                    spot_ts: env.payload.spot_ts.unwrap_or(env.payload.asof_ts),
                    spot_price: env.payload.spot_price,
                    sigma_annualized: env.payload.sigma_annualized,
                    prob_yes: env.payload.prob_yes,
                    prob_yes_raw: env.payload.prob_yes_raw,
                    horizon_seconds: env.payload.horizon_seconds.unwrap_or(0),
                    strike: env.payload.strike.clone(),
                    quote_ts: env.payload.quote_ts,
                    yes_bid: env.payload.yes_bid,
                    yes_ask: env.payload.yes_ask,
                    no_bid: env.payload.no_bid,
                    no_ask: env.payload.no_ask,
                    yes_mid: env.payload.yes_mid,
                    no_mid: env.payload.no_mid,
                    ev_take_yes: Some(env.payload.ev_take_yes),
                    ev_take_no: Some(env.payload.ev_take_no),
                    spot_age_seconds: env.payload.spot_age_seconds.unwrap_or(0),
                    quote_age_seconds: env.payload.quote_age_seconds,
                });
            }
        }
        if snapshots.is_empty() {
            continue;
        }

        let sigma = edge_pipeline::volatility::SigmaEstimate {
            sigma: snapshots[0].sigma_annualized,
            sigma_ok: true,
            sigma_source: edge_pipeline::volatility::SigmaSource::Ewma,
            reason: None,
            reason_context: None,
            points_used: volatility_defaults.min_points,
            min_points: volatility_defaults.min_points,
            lookback_seconds_used: volatility_defaults.lookback_seconds,
            min_lookback_seconds: volatility_defaults.min_sigma_lookback_seconds,
        };

        let (rows, counters) = build_opportunities_from_snapshots(&snapshots, &sigma, &config);
        tracing::info!(
            takes = counters.takes,
            passes = counters.passes,
            skipped = counters.skipped,
            "opportunity pass complete"
        );

        for row in rows.iter().filter(|r| r.would_trade) {
            let payload = edge_pipeline::events::OpportunityDecisionPayload {
                ts_eval: row.ts_eval,
                market_id: row.market_id.clone(),
                eligible: row.eligible,
                would_trade: row.would_trade,
                side: Some(row.side.as_str().to_string()),
                reason_not_eligible: None,
                ev_raw: row.ev_raw,
                ev_net: row.ev_net,
                settlement_ts: row.settlement_ts,
                strike: row.strike.clone(),
                spot_price: row.spot_price,
                sigma: row.sigma,
                tau: row.tau_minutes,
                p_model: row.p_model,
                p_market: row.p_market,
                best_yes_bid: row.best_yes_bid,
                best_yes_ask: row.best_yes_ask,
                best_no_bid: row.best_no_bid,
                best_no_ask: row.best_no_ask,
                spread: row.spread,
                cost_buffer: row.cost_buffer,
                raw_json: Some(row.raw_json()),
                strategy_version: Some(row.model_version),
            };
            match Envelope::new(EventType::OpportunityDecision, row.ts_eval, "opportunity_engine", payload) {
                Ok(envelope) => {
                    bus.publish(Event::OpportunityDecision(envelope));
                }
                Err(err) => tracing::warn!(error = %err, "failed to build opportunity_decision envelope"),
            }
        }
    }
}

/// Paper execution worker: consumes `opportunity_decision` and
/// `contract_update` events, applies risk gates, and emits
/// `execution_order`/`execution_fill` events.
async fn run_paper_execution(
    bus: Arc<InProcessBus>,
    config: ExecutionConfig,
    kill_switch_path: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let consumer = bus.pull_subscribe(
        "paper_execution_all",
        vec![
            "strategy.opportunity_decisions".to_string(),
            "market.contract_updates".to_string(),
        ],
        10_000,
    );
    let mut state = PaperExecutionState::new();
    let mut counters = edge_pipeline::execution::ExecutionCounters::default();
    let mut alert_gate = RejectRateAlertGate::new();
    let alert_config = RejectRateAlertConfig::default();

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let batch = consumer.fetch(256, Duration::from_secs(1)).await;
        if batch.is_empty() {
            continue;
        }

        let kill_switch_active = std::path::Path::new(&kill_switch_path).exists();
        let ts = now_ts();

        for event in &batch {
            let outcome = match event {
                Event::OpportunityDecision(env) => process_opportunity(
                    &mut state,
                    &mut counters,
                    &env.idempotency_key,
                    &env.payload,
                    ts,
                    &config,
                    kill_switch_active,
                ),
                Event::ContractUpdate(env) => {
                    process_contract_update(&mut state, &mut counters, &env.payload, ts)
                }
                _ => ExecutionOutcome::Ignored,
            };

            match outcome {
                ExecutionOutcome::Ignored => {}
                ExecutionOutcome::Rejected { order } => {
                    if let Ok(envelope) = Envelope::new(EventType::ExecutionOrder, order.ts_order, "paper_execution", order) {
                        bus.publish(Event::ExecutionOrder(envelope));
                    }
                }
                ExecutionOutcome::Accepted { order, fill } => {
                    if let Ok(envelope) = Envelope::new(EventType::ExecutionOrder, order.ts_order, "paper_execution", order) {
                        bus.publish(Event::ExecutionOrder(envelope));
                    }
                    if let Ok(envelope) = Envelope::new(EventType::ExecutionFill, fill.ts_fill, "paper_execution", fill) {
                        bus.publish(Event::ExecutionFill(envelope));
                    }
                }
                ExecutionOutcome::Closed { fill } => {
                    if let Ok(envelope) = Envelope::new(EventType::ExecutionFill, fill.ts_fill, "paper_execution", fill) {
                        bus.publish(Event::ExecutionFill(envelope));
                    }
                }
            }
        }

        if let Some(rate) = alert_gate.check(&counters, &alert_config) {
            tracing::warn!(reject_rate = rate, "ALERT: paper execution reject rate above threshold");
        }
    }
}

/// Persistence projector worker: drains all three persistence consumers
/// and writes every event to the event store + latest-state projections.
async fn run_persistence(
    bus: Arc<InProcessBus>,
    store: Arc<PersistenceStore>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let consumers = bus.subscribe_persistence_consumers("persistence", 10_000);

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        for consumer in &consumers {
            let batch = consumer.fetch(256, Duration::from_millis(500)).await;
            for event in &batch {
                match store.persist_event(event).await {
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "persist failed, routing to DLQ");
                        let subject = edge_pipeline::bus::dlq_subject_for(event);
                        store
                            .log_dlq(now_ts(), "persist_error", Some(event.event_type().as_str()), &subject, &err.to_string(), None)
                            .await;
                    }
                }
            }
        }
    }
}

/// Health-summary worker: every 30s, queries projection counts over a
/// trailing 10-minute window and logs the rendered summary line.
async fn run_health_loop(store: Arc<PersistenceStore>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let thresholds = StalenessThresholds::default();
    let mut ticker = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
        let window_minutes = 10;
        let window_start_ts = now_ts() - window_minutes * 60;
        let counts = store
            .health_projection_counts(PRODUCT_ID, window_start_ts)
            .await
            .context("health projection query failed")?;
        let summary = compute(now_ts(), window_minutes, &counts, &thresholds);
        tracing::info!("{}", summary.render());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(err) => {
            eprintln!("config error: {err}");
            std::process::exit(err.exit_code());
        }
    };

    tracing::info!(db_path = %config.db_path, bus_url = %config.bus_url, "starting edge pipeline");

    let bus = InProcessBus::new(StreamPolicy::from_retention_hours(config.bus_stream_retention_hours));
    let state = Arc::new(Mutex::new(LiveMarketState::default()));
    let store = Arc::new(PersistenceStore::open(&config.db_path).context("failed to open persistence store")?);

    let execution_config = ExecutionConfig {
        max_open_positions: config.max_open_positions,
        ..Default::default()
    };

    let shutdown = CancellationToken::new();

    let state_ingest = {
        let bus = bus.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            Supervisor::new("state_ingest", shutdown.clone())
                .run(|| run_state_ingest(bus.clone(), state.clone(), shutdown.clone()))
                .await;
        })
    };

    let edge_engine = {
        let bus = bus.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            Supervisor::new("edge_engine", shutdown.clone())
                .run(|| run_edge_engine(bus.clone(), state.clone(), shutdown.clone()))
                .await;
        })
    };

    let opportunity_engine = {
        let bus = bus.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            Supervisor::new("opportunity_engine", shutdown.clone())
                .run(|| run_opportunity_engine(bus.clone(), shutdown.clone()))
                .await;
        })
    };

    let paper_execution = {
        let bus = bus.clone();
        let shutdown = shutdown.clone();
        let execution_config = execution_config.clone();
        let kill_switch_path = config.kill_switch_path.clone();
        tokio::spawn(async move {
            Supervisor::new("paper_execution", shutdown.clone())
                .run(|| {
                    run_paper_execution(
                        bus.clone(),
                        execution_config.clone(),
                        kill_switch_path.clone(),
                        shutdown.clone(),
                    )
                })
                .await;
        })
    };

    let persistence = {
        let bus = bus.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            Supervisor::new("persistence", shutdown.clone())
                .run(|| run_persistence(bus.clone(), store.clone(), shutdown.clone()))
                .await;
        })
    };

    let health = {
        let store = store.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            Supervisor::new("health", shutdown.clone())
                .run(|| run_health_loop(store.clone(), shutdown.clone()))
                .await;
        })
    };

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received ctrl-c");
    }

    shutdown.cancel();
    let _ = tokio::join!(
        state_ingest,
        edge_engine,
        opportunity_engine,
        paper_execution,
        persistence,
        health
    );

    tracing::info!("shutdown complete");
    Ok(())
}
