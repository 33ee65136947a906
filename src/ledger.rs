use crate::error::AppError;
use crate::models::UsageRecord;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, types::Type, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Append-only store of completed inference calls.
///
/// `record` is telemetry and never fails the caller; `sum_cost` feeds budget
/// checks and must surface storage failures instead of reporting zero spend.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn append(&self, record: UsageRecord) -> Result<(), AppError>;

    async fn sum_cost(&self, since: DateTime<Utc>) -> Result<f64, AppError>;

    async fn record(&self, record: UsageRecord) {
        let model = record.model.clone();
        let backend = record.backend.clone();
        if let Err(err) = self.append(record).await {
            tracing::warn!(
                event_name = "ledger.record_failed",
                %backend,
                %model,
                error = %err,
                "usage record dropped"
            );
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LedgerSummary {
    pub tokens_total: u64,
    pub cost_total: f64,
    pub by_backend: Vec<(String, f64)>,
    pub by_model: Vec<(String, f64)>,
}

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AppError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY,
                timestamp_ms INTEGER NOT NULL,
                model TEXT NOT NULL,
                backend TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                tokens_total INTEGER NOT NULL,
                cost_usd REAL NOT NULL CHECK (cost_usd >= 0),
                latency_ms INTEGER,
                user_id TEXT
            );

            CREATE INDEX IF NOT EXISTS usage_records_timestamp
                ON usage_records (timestamp_ms);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, AppError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| AppError::Storage("ledger connection lock poisoned".into()))?;
            op(&mut guard)
        })
        .await
        .map_err(|err| AppError::Storage(format!("ledger task aborted: {err}")))?
    }

    pub async fn aggregate_since(&self, since: DateTime<Utc>) -> Result<LedgerSummary, AppError> {
        let since_ms = since.timestamp_millis();
        self.with_conn(move |conn| {
            let (tokens_raw, cost_total): (i64, f64) = conn.query_row(
                "SELECT COALESCE(SUM(tokens_total), 0), COALESCE(SUM(cost_usd), 0.0)
                 FROM usage_records WHERE timestamp_ms >= ?",
                [since_ms],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let mut by_backend_stmt = conn.prepare(
                "SELECT backend, COALESCE(SUM(cost_usd), 0.0) AS c
                 FROM usage_records WHERE timestamp_ms >= ?
                 GROUP BY backend ORDER BY c DESC",
            )?;
            let by_backend = by_backend_stmt
                .query_map([since_ms], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut by_model_stmt = conn.prepare(
                "SELECT model, COALESCE(SUM(cost_usd), 0.0) AS c
                 FROM usage_records WHERE timestamp_ms >= ?
                 GROUP BY model ORDER BY c DESC LIMIT 10",
            )?;
            let by_model = by_model_stmt
                .query_map([since_ms], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(LedgerSummary {
                tokens_total: tokens_raw.max(0) as u64,
                cost_total,
                by_backend,
                by_model,
            })
        })
        .await
    }

    pub async fn export_records(&self) -> Result<Vec<UsageRecord>, AppError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp_ms, model, backend, input_tokens, output_tokens, tokens_total,
                        cost_usd, latency_ms, user_id
                 FROM usage_records ORDER BY timestamp_ms DESC, id DESC",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    let ts_ms: i64 = r.get(0)?;
                    let count = |idx: usize| -> rusqlite::Result<u64> {
                        Ok(r.get::<_, i64>(idx)?.max(0) as u64)
                    };
                    Ok(UsageRecord {
                        timestamp: Utc.timestamp_millis_opt(ts_ms).single().ok_or_else(|| {
                            rusqlite::Error::FromSqlConversionFailure(
                                0,
                                Type::Integer,
                                format!("timestamp out of range: {ts_ms}").into(),
                            )
                        })?,
                        model: r.get(1)?,
                        backend: r.get(2)?,
                        input_tokens: count(3)?,
                        output_tokens: count(4)?,
                        tokens_total: count(5)?,
                        cost_usd: r.get(6)?,
                        latency_ms: r.get::<_, Option<i64>>(7)?.map(|v| v.max(0) as u64),
                        user_id: r.get(8)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn export_json(&self) -> Result<String, AppError> {
        let rows = self.export_records().await?;
        Ok(serde_json::to_string_pretty(&rows)?)
    }

    #[cfg(test)]
    pub(crate) async fn drop_table_for_test(&self) {
        self.with_conn(|conn| Ok(conn.execute_batch("DROP TABLE usage_records")?))
            .await
            .expect("drop usage table");
    }
}

#[async_trait]
impl UsageLedger for SqliteLedger {
    async fn append(&self, record: UsageRecord) -> Result<(), AppError> {
        if record.cost_usd.is_nan() || record.cost_usd < 0.0 {
            return Err(AppError::Storage(format!(
                "refusing usage record with cost {}",
                record.cost_usd
            )));
        }
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO usage_records
                    (timestamp_ms, model, backend, input_tokens, output_tokens, tokens_total,
                     cost_usd, latency_ms, user_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    record.timestamp.timestamp_millis(),
                    record.model,
                    record.backend,
                    record.input_tokens,
                    record.output_tokens,
                    record.tokens_total,
                    record.cost_usd,
                    record.latency_ms,
                    record.user_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn sum_cost(&self, since: DateTime<Utc>) -> Result<f64, AppError> {
        let since_ms = since.timestamp_millis();
        self.with_conn(move |conn| {
            let total: f64 = conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_records WHERE timestamp_ms >= ?",
                [since_ms],
                |row| row.get(0),
            )?;
            Ok(total)
        })
        .await
    }
}
