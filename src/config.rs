//! Environment-driven configuration, following the `Config::from_env`
//! convention already used for signal generation config.

use crate::error::PipelineError;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    // Bus
    pub bus_url: String,
    pub bus_stream_retention_hours: u64,
    pub bus_consumer_lag_alert_threshold: u64,

    // Relational store. `pg_dsn` is accepted for compatibility with
    // deployments that still set it; this crate's projector always
    // writes to `db_path` (see DESIGN.md, persistence projector entry).
    pub pg_dsn: Option<String>,
    pub pg_pool_min: u32,
    pub pg_pool_max: u32,
    pub pg_statement_timeout_ms: u64,
    pub db_path: String,

    // Strategy
    pub ev_min: f64,
    pub tau_max_minutes: f64,
    pub spread_max_ticks: i64,
    pub no_new_entries_last_seconds: i64,

    // Risk
    pub max_open_positions: usize,
    pub max_daily_loss_pct: f64,
    pub max_position_pct: f64,

    pub trading_enabled: bool,
    pub kill_switch_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self, PipelineError> {
        dotenv::dotenv().ok();

        let pg_pool_min: u32 = env_parsed("PG_POOL_MIN", 2);
        let pg_pool_max: u32 = env_parsed("PG_POOL_MAX", 10);
        if pg_pool_max < pg_pool_min {
            return Err(PipelineError::ConfigError(format!(
                "PG_POOL_MAX ({pg_pool_max}) must be >= PG_POOL_MIN ({pg_pool_min})"
            )));
        }

        let ev_min: f64 = env_parsed("EV_MIN", 0.03);
        if !(0.0..=1.0).contains(&ev_min) {
            return Err(PipelineError::ConfigError(format!(
                "EV_MIN must be within [0, 1], got {ev_min}"
            )));
        }

        let pg_dsn = std::env::var("PG_DSN").ok();
        if pg_dsn.is_some() {
            tracing::warn!(
                "PG_DSN is set but this build persists to a local store at DB_PATH; \
                 PG_DSN, PG_POOL_MIN/MAX and PG_STATEMENT_TIMEOUT_MS are accepted for \
                 compatibility only"
            );
        }

        Ok(Self {
            bus_url: env_string("BUS_URL", "nats://127.0.0.1:4222"),
            bus_stream_retention_hours: env_parsed("BUS_STREAM_RETENTION_HOURS", 168),
            bus_consumer_lag_alert_threshold: env_parsed(
                "BUS_CONSUMER_LAG_ALERT_THRESHOLD",
                1000,
            ),

            pg_dsn,
            pg_pool_min,
            pg_pool_max,
            pg_statement_timeout_ms: env_parsed("PG_STATEMENT_TIMEOUT_MS", 5000),
            db_path: env_string("DB_PATH", "data/pipeline.db"),

            ev_min,
            tau_max_minutes: env_parsed("TAU_MAX_MINUTES", 60.0),
            spread_max_ticks: env_parsed("SPREAD_MAX_TICKS", 6),
            no_new_entries_last_seconds: env_parsed("NO_NEW_ENTRIES_LAST_SECONDS", 120),

            max_open_positions: env_parsed("MAX_OPEN_POSITIONS", 1),
            max_daily_loss_pct: env_parsed("MAX_DAILY_LOSS_PCT", 0.03),
            max_position_pct: env_parsed("MAX_POSITION_PCT", 0.02),

            trading_enabled: env_parsed("TRADING_ENABLED", false),
            kill_switch_path: env_string("KILL_SWITCH_PATH", "data/kill_switch"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_pool_bounds() {
        std::env::set_var("PG_POOL_MIN", "10");
        std::env::set_var("PG_POOL_MAX", "2");
        let result = Config::from_env();
        std::env::remove_var("PG_POOL_MIN");
        std::env::remove_var("PG_POOL_MAX");
        assert!(result.is_err());
    }

    #[test]
    fn defaults_are_sane() {
        std::env::remove_var("EV_MIN");
        let cfg = Config::from_env().expect("default config should be valid");
        assert_eq!(cfg.max_open_positions, 1);
        assert!((cfg.ev_min - 0.03).abs() < 1e-9);
    }
}
