//! Result persistence: Postgres and JSON-file sinks for run metrics.

use std::path::PathBuf;

use eyre::{Result, WrapErr};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::{JsonOutputConfig, PostgresConfig, TestMode};
use crate::metrics::OutputMetrics;

const CREATE_METRICS_TABLE: &str = "CREATE TABLE IF NOT EXISTS metrics (
    id SERIAL PRIMARY KEY,
    test_key TEXT,
    success BOOLEAN,
    request_count INTEGER,
    wallet_count INTEGER,
    chain_count INTEGER,
    run_start TIMESTAMPTZ,
    run_end TIMESTAMPTZ,
    run_delta INTERVAL,
    metrics JSONB,
    test_type TEXT,
    comment TEXT,
    on_chain_metrics JSONB
)";

const INSERT_METRICS: &str = "INSERT INTO metrics (
    test_key, success, request_count, wallet_count, chain_count,
    run_start, run_end, run_delta, metrics, test_type, comment,
    on_chain_metrics
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8 * interval '1 millisecond', $9, $10, $11, $12)";

/// Postgres-backed metrics sink.
#[derive(Debug)]
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    /// Connects and ensures the metrics table exists. A sink that cannot
    /// initialize indicates a database config problem and is fatal.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&config.url())
            .await
            .wrap_err("failed to connect to postgres")?;
        sqlx::query(CREATE_METRICS_TABLE)
            .execute(&pool)
            .await
            .wrap_err("metrics table creation failed")?;
        info!(host = %config.host, database = %config.database, "postgres sink ready");
        Ok(Self { pool })
    }

    async fn record(
        &self,
        metrics: &OutputMetrics,
        test_type: TestMode,
        comment: Option<&str>,
    ) -> Result<()> {
        sqlx::query(INSERT_METRICS)
            .bind(&metrics.test_key)
            .bind(metrics.success)
            .bind(metrics.request_count as i32)
            .bind(metrics.wallet_count as i32)
            .bind(metrics.chain_count as i32)
            .bind(metrics.run_start)
            .bind(metrics.run_end)
            .bind(metrics.run_delta_ms)
            .bind(serde_json::to_value(&metrics.metrics)?)
            .bind(test_type.as_str())
            .bind(comment)
            .bind(serde_json::to_value(metrics.on_chain_metrics)?)
            .execute(&self.pool)
            .await
            .wrap_err("metrics insert failed")?;
        Ok(())
    }
}

/// Appends run records to a JSON array file. Needs no infrastructure, so
/// it works where a database is not worth the setup.
#[derive(Debug)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    /// Creates a sink writing to `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn record(
        &self,
        metrics: &OutputMetrics,
        test_type: TestMode,
        comment: Option<&str>,
    ) -> Result<()> {
        let existing = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => "[]".to_string(),
            Err(error) => {
                return Err(error)
                    .wrap_err_with(|| format!("failed to read {}", self.path.display()))
            }
        };
        let mut records: Vec<serde_json::Value> = serde_json::from_str(&existing)
            .wrap_err_with(|| format!("{} is not a json array", self.path.display()))?;

        let mut record = serde_json::to_value(metrics)?;
        if let Some(object) = record.as_object_mut() {
            object.insert("test_type".to_string(), test_type.as_str().into());
            if let Some(comment) = comment {
                object.insert("comment".to_string(), comment.into());
            }
        }
        records.push(record);

        std::fs::write(&self.path, serde_json::to_string(&records)?)
            .wrap_err_with(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

/// The configured set of sinks. Both may be active at once; recording is
/// best effort and never fails a run.
#[derive(Debug, Default)]
pub struct MetricsSinks {
    postgres: Option<PostgresSink>,
    json: Option<JsonFileSink>,
}

impl MetricsSinks {
    /// Builds the sinks named by the configuration. Postgres connection
    /// problems are fatal here rather than mid-run.
    pub async fn from_config(
        postgres: Option<&PostgresConfig>,
        json: &JsonOutputConfig,
    ) -> Result<Self> {
        let postgres = match postgres {
            Some(config) if config.enabled => Some(PostgresSink::connect(config).await?),
            _ => None,
        };
        let json = match (json.enabled, &json.file_path) {
            (true, Some(path)) => Some(JsonFileSink::new(path.clone())),
            _ => None,
        };
        Ok(Self { postgres, json })
    }

    /// Writes one run's metrics to every active sink.
    pub async fn record(
        &self,
        metrics: &OutputMetrics,
        test_type: TestMode,
        comment: Option<&str>,
    ) {
        if let Some(sink) = &self.json {
            if let Err(error) = sink.record(metrics, test_type, comment) {
                warn!(%error, "json metrics sink failed");
            }
        }
        if let Some(sink) = &self.postgres {
            if let Err(error) = sink.record(metrics, test_type, comment).await {
                warn!(%error, "postgres metrics sink failed");
            }
        }
    }
}
