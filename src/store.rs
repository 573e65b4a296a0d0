use std::{path::Path, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{QueueError, QueueResult},
    models::{
        GenerationKind, GenerationParams, GenerationRecord, LedgerEntry, LedgerKind,
        OutputArtifact, QueueEntry, QueueStatus, RecordStatus, Tier,
    },
};

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS users (
        uuid TEXT PRIMARY KEY,
        credits INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS generation_records (
        uuid TEXT PRIMARY KEY,
        user_uuid TEXT NOT NULL,
        kind TEXT NOT NULL,
        prompt TEXT,
        params_json TEXT NOT NULL,
        credits_used INTEGER NOT NULL,
        status TEXT NOT NULL,
        cloud_job_id TEXT,
        output_json TEXT NOT NULL DEFAULT '[]',
        error_message TEXT,
        created_at TEXT NOT NULL,
        processing_started_at TEXT,
        completed_at TEXT,
        expires_at TEXT
    );
    CREATE TABLE IF NOT EXISTS queue_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_uuid TEXT NOT NULL UNIQUE,
        user_uuid TEXT NOT NULL,
        tier TEXT NOT NULL,
        status TEXT NOT NULL,
        peak_period INTEGER NOT NULL,
        estimated_seconds INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    );
    CREATE TABLE IF NOT EXISTS credit_transactions (
        uuid TEXT PRIMARY KEY,
        user_uuid TEXT NOT NULL,
        kind TEXT NOT NULL,
        amount INTEGER NOT NULL,
        reason TEXT NOT NULL,
        related_uuid TEXT,
        balance_after INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_records_status_expires ON generation_records(status, expires_at);
    CREATE INDEX IF NOT EXISTS idx_records_user ON generation_records(user_uuid);
    CREATE INDEX IF NOT EXISTS idx_queue_status_created ON queue_entries(status, created_at, id);
    CREATE INDEX IF NOT EXISTS idx_transactions_user ON credit_transactions(user_uuid, created_at);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_refund_once
        ON credit_transactions(related_uuid) WHERE kind = 'refund';
";

const RECORD_COLUMNS: &str = "uuid, user_uuid, kind, prompt, params_json, credits_used, status, \
     cloud_job_id, output_json, error_message, created_at, processing_started_at, completed_at, expires_at";

const QUEUE_COLUMNS: &str = "id, record_uuid, user_uuid, tier, status, peak_period, \
     estimated_seconds, created_at, started_at, completed_at";

/// Generation records, queue entries and the credit ledger, in one SQLite file.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> QueueResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> QueueResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> QueueResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- generation records ----

    pub async fn insert_record(&self, record: &GenerationRecord) -> QueueResult<()> {
        let conn = self.conn.lock().await;
        insert_record_row(&conn, record)
    }

    /// Inserts `record` and debits its `credits_used` from the owner in one
    /// transaction. Nothing is written when the balance is too low.
    pub async fn insert_record_charged(&self, record: &GenerationRecord) -> QueueResult<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let balance = if record.credits_used > 0 {
            apply_balance_change(
                &tx,
                &record.user_uuid,
                -record.credits_used,
                LedgerKind::Consume,
                "ai_generation",
                Some(record.uuid),
            )?
        } else {
            read_balance(&tx, &record.user_uuid)?
        };
        insert_record_row(&tx, record)?;
        tx.commit()?;
        Ok(balance)
    }

    pub async fn get_record(&self, uuid: Uuid) -> QueueResult<Option<GenerationRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {RECORD_COLUMNS} FROM generation_records WHERE uuid = ?1");
        Ok(conn
            .query_row(&sql, params![uuid.to_string()], record_from_row)
            .optional()?)
    }

    pub async fn mark_record_processing(&self, uuid: Uuid, at: DateTime<Utc>) -> QueueResult<()> {
        let conn = self.conn.lock().await;
        update_record(
            &conn,
            uuid,
            "UPDATE generation_records SET status = 'processing', processing_started_at = ?2 WHERE uuid = ?1",
            params![uuid.to_string(), ts(at)],
        )
    }

    pub async fn set_cloud_job_id(&self, uuid: Uuid, job_id: &str) -> QueueResult<()> {
        let conn = self.conn.lock().await;
        update_record(
            &conn,
            uuid,
            "UPDATE generation_records SET cloud_job_id = ?2 WHERE uuid = ?1",
            params![uuid.to_string(), job_id],
        )
    }

    pub async fn mark_record_completed(
        &self,
        uuid: Uuid,
        outputs: &[OutputArtifact],
        completed_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let output_json = serde_json::to_string(outputs)?;
        let conn = self.conn.lock().await;
        update_record(
            &conn,
            uuid,
            "UPDATE generation_records
             SET status = 'completed', output_json = ?2, error_message = NULL,
                 completed_at = ?3, expires_at = ?4
             WHERE uuid = ?1",
            params![uuid.to_string(), output_json, ts(completed_at), ts(expires_at)],
        )
    }

    pub async fn mark_record_failed(
        &self,
        uuid: Uuid,
        message: &str,
        at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let conn = self.conn.lock().await;
        update_record(
            &conn,
            uuid,
            "UPDATE generation_records
             SET status = 'failed', output_json = '[]', error_message = ?2, completed_at = ?3
             WHERE uuid = ?1",
            params![uuid.to_string(), message, ts(at)],
        )
    }

    pub async fn mark_record_expired(&self, uuid: Uuid) -> QueueResult<()> {
        let conn = self.conn.lock().await;
        update_record(
            &conn,
            uuid,
            "UPDATE generation_records SET status = 'expired', output_json = '[]' WHERE uuid = ?1",
            params![uuid.to_string()],
        )
    }

    /// Removes the record row together with its queue entry.
    pub async fn delete_record(&self, uuid: Uuid) -> QueueResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM queue_entries WHERE record_uuid = ?1",
            params![uuid.to_string()],
        )?;
        let deleted = tx.execute(
            "DELETE FROM generation_records WHERE uuid = ?1",
            params![uuid.to_string()],
        )?;
        if deleted == 0 {
            return Err(QueueError::RecordNotFound(uuid));
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn completed_records_expired_before(
        &self,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<GenerationRecord>> {
        self.query_records(
            "status = 'completed' AND expires_at IS NOT NULL AND expires_at < ?1",
            ts(now),
            None,
        )
        .await
    }

    pub async fn expired_records_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> QueueResult<Vec<GenerationRecord>> {
        self.query_records(
            "status = 'expired' AND expires_at IS NOT NULL AND expires_at < ?1",
            ts(cutoff),
            None,
        )
        .await
    }

    pub async fn records_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> QueueResult<Vec<GenerationRecord>> {
        self.query_records(
            "status = 'completed' AND expires_at > ?1 AND expires_at <= ?2",
            ts(from),
            Some(ts(to)),
        )
        .await
    }

    /// Expiry scans can walk the whole table, so they run on the blocking pool.
    async fn query_records(
        &self,
        filter: &str,
        first: String,
        second: Option<String>,
    ) -> QueueResult<Vec<GenerationRecord>> {
        let conn = self.conn.clone().lock_owned().await;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM generation_records WHERE {filter} ORDER BY expires_at ASC"
        );
        tokio::task::spawn_blocking(move || -> QueueResult<Vec<GenerationRecord>> {
            let mut stmt = conn.prepare(&sql)?;
            let rows = match second {
                Some(second) => stmt
                    .query_map(params![first, second], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?,
                None => stmt
                    .query_map(params![first], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?,
            };
            Ok(rows)
        })
        .await
        .map_err(|err| QueueError::Io(std::io::Error::other(err)))?
    }

    // ---- queue entries ----

    pub async fn insert_queue_entry(
        &self,
        record_uuid: Uuid,
        user_uuid: &str,
        tier: Tier,
        peak_period: bool,
        estimated_seconds: u64,
        created_at: DateTime<Utc>,
    ) -> QueueResult<QueueEntry> {
        let conn = self.conn.lock().await;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM queue_entries WHERE record_uuid = ?1)",
            params![record_uuid.to_string()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(QueueError::AlreadyQueued(record_uuid));
        }
        conn.execute(
            "INSERT INTO queue_entries(record_uuid, user_uuid, tier, status, peak_period, estimated_seconds, created_at)
             VALUES(?1, ?2, ?3, 'waiting', ?4, ?5, ?6)",
            params![
                record_uuid.to_string(),
                user_uuid,
                tier.as_str(),
                peak_period,
                estimated_seconds as i64,
                ts(created_at)
            ],
        )?;
        Ok(QueueEntry {
            id: conn.last_insert_rowid(),
            record_uuid,
            user_uuid: user_uuid.to_string(),
            tier,
            status: QueueStatus::Waiting,
            peak_period,
            estimated_seconds,
            created_at,
            started_at: None,
            completed_at: None,
        })
    }

    pub async fn get_queue_entry(&self, record_uuid: Uuid) -> QueueResult<Option<QueueEntry>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE record_uuid = ?1");
        Ok(conn
            .query_row(&sql, params![record_uuid.to_string()], queue_entry_from_row)
            .optional()?)
    }

    /// Oldest `waiting` entries first; equal timestamps fall back to insertion order.
    pub async fn waiting_entries(&self, limit: usize) -> QueueResult<Vec<QueueEntry>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE status = 'waiting'
             ORDER BY created_at ASC, id ASC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], queue_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn entries_with_status(&self, status: QueueStatus) -> QueueResult<Vec<QueueEntry>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE status = ?1 ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![status.as_str()], queue_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn count_waiting(&self) -> QueueResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_entries WHERE status = 'waiting'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub async fn count_waiting_before(&self, entry: &QueueEntry) -> QueueResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_entries
             WHERE status = 'waiting' AND (created_at < ?1 OR (created_at = ?1 AND id < ?2))",
            params![ts(entry.created_at), entry.id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub async fn count_processing(&self) -> QueueResult<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_entries WHERE status = 'processing'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub async fn mark_entry_processing(
        &self,
        record_uuid: Uuid,
        at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE queue_entries SET status = 'processing', started_at = ?2 WHERE record_uuid = ?1",
            params![record_uuid.to_string(), ts(at)],
        )?;
        if updated == 0 {
            return Err(QueueError::QueueEntryNotFound(record_uuid));
        }
        Ok(())
    }

    pub async fn mark_entry_finished(
        &self,
        record_uuid: Uuid,
        status: QueueStatus,
        at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE queue_entries SET status = ?2, completed_at = ?3 WHERE record_uuid = ?1",
            params![record_uuid.to_string(), status.as_str(), ts(at)],
        )?;
        if updated == 0 {
            return Err(QueueError::QueueEntryNotFound(record_uuid));
        }
        Ok(())
    }

    // ---- credit ledger ----

    pub async fn ensure_user(&self, user_uuid: &str) -> QueueResult<()> {
        let conn = self.conn.lock().await;
        ensure_user_row(&conn, user_uuid)
    }

    pub async fn balance(&self, user_uuid: &str) -> QueueResult<i64> {
        let conn = self.conn.lock().await;
        read_balance(&conn, user_uuid)
    }

    pub async fn debit(
        &self,
        user_uuid: &str,
        amount: i64,
        reason: &str,
        related_uuid: Option<Uuid>,
    ) -> QueueResult<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let balance = apply_balance_change(
            &tx,
            user_uuid,
            -amount.abs(),
            LedgerKind::Consume,
            reason,
            related_uuid,
        )?;
        tx.commit()?;
        Ok(balance)
    }

    pub async fn credit(
        &self,
        user_uuid: &str,
        amount: i64,
        kind: LedgerKind,
        reason: &str,
        related_uuid: Option<Uuid>,
    ) -> QueueResult<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let balance =
            apply_balance_change(&tx, user_uuid, amount.abs(), kind, reason, related_uuid)?;
        tx.commit()?;
        Ok(balance)
    }

    /// Credits `amount` back for a failed record. Returns `false` without
    /// writing anything if that record was already refunded.
    pub async fn refund(
        &self,
        user_uuid: &str,
        amount: i64,
        record_uuid: Uuid,
    ) -> QueueResult<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let already: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM credit_transactions WHERE kind = 'refund' AND related_uuid = ?1)",
            params![record_uuid.to_string()],
            |row| row.get(0),
        )?;
        if already {
            return Ok(false);
        }
        apply_balance_change(
            &tx,
            user_uuid,
            amount.abs(),
            LedgerKind::Refund,
            "ai_generation_failed",
            Some(record_uuid),
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub async fn transactions(&self, user_uuid: &str, limit: usize) -> QueueResult<Vec<LedgerEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT uuid, user_uuid, kind, amount, reason, related_uuid, balance_after, created_at
             FROM credit_transactions WHERE user_uuid = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_uuid, limit as i64], ledger_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_ts(idx, value)).transpose()
}

fn parse_uuid(idx: usize, raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn conversion_error(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown {what} `{raw}`").into(),
    )
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn update_record(
    conn: &Connection,
    uuid: Uuid,
    sql: &str,
    params: impl rusqlite::Params,
) -> QueueResult<()> {
    if conn.execute(sql, params)? == 0 {
        return Err(QueueError::RecordNotFound(uuid));
    }
    Ok(())
}

fn insert_record_row(conn: &Connection, record: &GenerationRecord) -> QueueResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO generation_records({RECORD_COLUMNS})
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            record.uuid.to_string(),
            record.user_uuid,
            record.kind.as_str(),
            record.prompt,
            serde_json::to_string(&record.params)?,
            record.credits_used,
            record.status.as_str(),
            record.cloud_job_id,
            serde_json::to_string(&record.output_urls)?,
            record.error_message,
            ts(record.created_at),
            record.processing_started_at.map(ts),
            record.completed_at.map(ts),
            record.expires_at.map(ts),
        ],
    )?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<GenerationRecord> {
    let kind: String = row.get(2)?;
    let params_json: String = row.get(4)?;
    let status: String = row.get(6)?;
    let output_json: String = row.get(8)?;
    Ok(GenerationRecord {
        uuid: parse_uuid(0, row.get(0)?)?,
        user_uuid: row.get(1)?,
        kind: GenerationKind::parse(&kind).ok_or_else(|| conversion_error(2, "kind", &kind))?,
        prompt: row.get(3)?,
        params: parse_json::<GenerationParams>(4, &params_json)?,
        credits_used: row.get(5)?,
        status: RecordStatus::parse(&status)
            .ok_or_else(|| conversion_error(6, "record status", &status))?,
        cloud_job_id: row.get(7)?,
        output_urls: parse_json::<Vec<OutputArtifact>>(8, &output_json)?,
        error_message: row.get(9)?,
        created_at: parse_ts(10, row.get(10)?)?,
        processing_started_at: parse_opt_ts(11, row.get(11)?)?,
        completed_at: parse_opt_ts(12, row.get(12)?)?,
        expires_at: parse_opt_ts(13, row.get(13)?)?,
    })
}

fn queue_entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let tier: String = row.get(3)?;
    let status: String = row.get(4)?;
    let estimated: i64 = row.get(6)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        record_uuid: parse_uuid(1, row.get(1)?)?,
        user_uuid: row.get(2)?,
        tier: Tier::parse(&tier).ok_or_else(|| conversion_error(3, "tier", &tier))?,
        status: QueueStatus::parse(&status)
            .ok_or_else(|| conversion_error(4, "queue status", &status))?,
        peak_period: row.get(5)?,
        estimated_seconds: estimated.max(0) as u64,
        created_at: parse_ts(7, row.get(7)?)?,
        started_at: parse_opt_ts(8, row.get(8)?)?,
        completed_at: parse_opt_ts(9, row.get(9)?)?,
    })
}

fn ledger_entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let kind: String = row.get(2)?;
    let related: Option<String> = row.get(5)?;
    Ok(LedgerEntry {
        uuid: parse_uuid(0, row.get(0)?)?,
        user_uuid: row.get(1)?,
        kind: LedgerKind::parse(&kind).ok_or_else(|| conversion_error(2, "ledger kind", &kind))?,
        amount: row.get(3)?,
        reason: row.get(4)?,
        related_uuid: related.map(|raw| parse_uuid(5, raw)).transpose()?,
        balance_after: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}

fn ensure_user_row(conn: &Connection, user_uuid: &str) -> QueueResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO users(uuid, credits, created_at) VALUES(?1, 0, ?2)",
        params![user_uuid, ts(Utc::now())],
    )?;
    Ok(())
}

fn read_balance(conn: &Connection, user_uuid: &str) -> QueueResult<i64> {
    let balance: Option<i64> = conn
        .query_row(
            "SELECT credits FROM users WHERE uuid = ?1",
            params![user_uuid],
            |row| row.get(0),
        )
        .optional()?;
    Ok(balance.unwrap_or(0))
}

/// Read-check-write of one user's balance plus its ledger row. Must run
/// inside the caller's transaction.
fn apply_balance_change(
    tx: &Transaction<'_>,
    user_uuid: &str,
    delta: i64,
    kind: LedgerKind,
    reason: &str,
    related_uuid: Option<Uuid>,
) -> QueueResult<i64> {
    ensure_user_row(tx, user_uuid)?;
    let balance = read_balance(tx, user_uuid)?;
    let next = balance + delta;
    if next < 0 {
        return Err(QueueError::InsufficientCredits {
            balance,
            required: -delta,
        });
    }
    tx.execute(
        "UPDATE users SET credits = ?2 WHERE uuid = ?1",
        params![user_uuid, next],
    )?;
    tx.execute(
        "INSERT INTO credit_transactions(uuid, user_uuid, kind, amount, reason, related_uuid, balance_after, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            Uuid::new_v4().to_string(),
            user_uuid,
            kind.as_str(),
            delta,
            reason,
            related_uuid.map(|id| id.to_string()),
            next,
            ts(Utc::now())
        ],
    )?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::StandardParams;

    fn rapid_record(user: &str, credits: i64) -> GenerationRecord {
        GenerationRecord::new(
            user,
            GenerationParams::Rapid(StandardParams {
                prompt: Some("a brass teapot".to_string()),
                ..StandardParams::default()
            }),
            credits,
        )
    }

    #[tokio::test]
    async fn record_roundtrips_through_sqlite() {
        let store = Store::open_in_memory().expect("store");
        let record = rapid_record("user-1", 10);
        store.insert_record(&record).await.expect("insert");

        let loaded = store.get_record(record.uuid).await.expect("get").expect("row");
        assert_eq!(loaded.uuid, record.uuid);
        assert_eq!(loaded.params, record.params);
        assert_eq!(loaded.status, RecordStatus::Pending);
        assert!(loaded.output_urls.is_empty());
        assert!(store.get_record(Uuid::new_v4()).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn charged_insert_is_all_or_nothing() {
        let store = Store::open_in_memory().expect("store");
        store
            .credit("user-1", 15, LedgerKind::Recharge, "top_up", None)
            .await
            .expect("top up");

        let first = rapid_record("user-1", 10);
        assert_eq!(store.insert_record_charged(&first).await.expect("charge"), 5);

        let second = rapid_record("user-1", 10);
        let err = store.insert_record_charged(&second).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InsufficientCredits {
                balance: 5,
                required: 10
            }
        ));
        assert!(store.get_record(second.uuid).await.expect("get").is_none());
        assert_eq!(store.balance("user-1").await.expect("balance"), 5);
    }

    #[tokio::test]
    async fn refund_is_written_once_per_record() {
        let store = Store::open_in_memory().expect("store");
        store
            .credit("user-1", 20, LedgerKind::Recharge, "top_up", None)
            .await
            .expect("top up");
        let record = rapid_record("user-1", 20);
        store.insert_record_charged(&record).await.expect("charge");
        assert_eq!(store.balance("user-1").await.expect("balance"), 0);

        assert!(store.refund("user-1", 20, record.uuid).await.expect("refund"));
        assert!(!store.refund("user-1", 20, record.uuid).await.expect("refund"));
        assert_eq!(store.balance("user-1").await.expect("balance"), 20);

        let refunds: Vec<_> = store
            .transactions("user-1", 10)
            .await
            .expect("transactions")
            .into_iter()
            .filter(|t| t.kind == LedgerKind::Refund)
            .collect();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, 20);
        assert_eq!(refunds[0].related_uuid, Some(record.uuid));
    }

    #[tokio::test]
    async fn waiting_entries_are_fifo_with_insertion_tiebreak() {
        let store = Store::open_in_memory().expect("store");
        let at = Utc::now();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            store
                .insert_queue_entry(*id, "user-1", Tier::Rapid, false, 60, at)
                .await
                .expect("enqueue");
        }
        let waiting = store.waiting_entries(10).await.expect("waiting");
        let order: Vec<Uuid> = waiting.iter().map(|e| e.record_uuid).collect();
        assert_eq!(order, ids);

        assert_eq!(store.count_waiting_before(&waiting[2]).await.expect("count"), 2);
        store
            .mark_entry_processing(ids[0], Utc::now())
            .await
            .expect("processing");
        assert_eq!(store.count_waiting_before(&waiting[2]).await.expect("count"), 1);
        assert_eq!(store.count_waiting().await.expect("count"), 2);
        assert_eq!(store.count_processing().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn second_entry_for_same_record_is_rejected() {
        let store = Store::open_in_memory().expect("store");
        let id = Uuid::new_v4();
        store
            .insert_queue_entry(id, "user-1", Tier::Pro, true, 270, Utc::now())
            .await
            .expect("enqueue");
        let err = store
            .insert_queue_entry(id, "user-1", Tier::Pro, true, 270, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::AlreadyQueued(found) if found == id));
    }

    #[tokio::test]
    async fn expiry_queries_respect_status_and_deadline() {
        let store = Store::open_in_memory().expect("store");
        let now = Utc::now();
        let past = rapid_record("user-1", 0);
        let future = rapid_record("user-1", 0);
        for record in [&past, &future] {
            store.insert_record(record).await.expect("insert");
        }
        store
            .mark_record_completed(past.uuid, &[], now - Duration::days(8), now - Duration::days(1))
            .await
            .expect("complete");
        store
            .mark_record_completed(future.uuid, &[], now, now + Duration::days(7))
            .await
            .expect("complete");

        let due = store.completed_records_expired_before(now).await.expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].uuid, past.uuid);

        let soon = store
            .records_expiring_between(now, now + Duration::days(8))
            .await
            .expect("soon");
        assert_eq!(soon.len(), 1);
        assert_eq!(soon[0].uuid, future.uuid);

        store.mark_record_expired(past.uuid).await.expect("expire");
        assert!(store
            .completed_records_expired_before(now)
            .await
            .expect("due")
            .is_empty());
        assert_eq!(
            store.expired_records_before(now).await.expect("expired").len(),
            1
        );
    }

    #[tokio::test]
    async fn updates_on_unknown_record_fail_with_not_found() {
        let store = Store::open_in_memory().expect("store");
        let id = Uuid::new_v4();
        assert!(matches!(
            store.mark_record_failed(id, "boom", Utc::now()).await,
            Err(QueueError::RecordNotFound(found)) if found == id
        ));
        assert!(matches!(
            store.mark_entry_processing(id, Utc::now()).await,
            Err(QueueError::QueueEntryNotFound(_))
        ));
    }
}
