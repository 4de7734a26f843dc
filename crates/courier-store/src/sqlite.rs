use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use courier_core::{Channel, CoreError, MessageId, MessageStatus, NodeId, PartyId, Timestamp};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use crate::error::StoreError;
use crate::records::{
    ClaimCandidate, ClaimChange, ClaimOutcome, ClaimState, MessageRecord, PullClaim, StatusUpdate,
};
use crate::schema::{CLAIM_COLUMNS, MESSAGE_COLUMNS, PRAGMAS, SCHEMA};

/// One node's connection to the shared message database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (and if needed creates) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Private in-memory database, for tests that need a single node only.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// How long a write waits on another connection's lock before failing
    /// with `SQLITE_BUSY`.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), StoreError> {
        self.conn()?.busy_timeout(timeout)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Writes a new message log row, plus a `WAITING` claim when
    /// `claim_available_at` is set.
    pub fn insert_message(
        &self,
        record: &MessageRecord,
        claim_available_at: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            &format!(
                "INSERT INTO message_log ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                record.message_id.as_str(),
                record.channel.as_str(),
                record.initiator.as_str(),
                record.responder.as_str(),
                record.direction.as_str(),
                record.pmode_key.as_str(),
                record.status.as_str(),
                record.send_attempts,
                record.send_attempts_max,
                sql_ts(record.retry_timeout_ms),
                record.next_attempt.map(sql_ts),
                sql_ts(record.received_at),
                record.restored_at.map(sql_ts),
                record.receipt_deadline.map(sql_ts),
                sql_ts(record.created_at),
                sql_ts(record.version),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::Duplicate(record.message_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(available_at) = claim_available_at {
            upsert_waiting_claim(&tx, record, available_at)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn message(&self, message_id: &MessageId) -> Result<Option<MessageRecord>, StoreError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM message_log WHERE message_id = ?1"),
                [message_id.as_str()],
                map_message,
            )
            .optional()?;
        Ok(record)
    }

    pub fn claim_of(&self, message_id: &MessageId) -> Result<Option<PullClaim>, StoreError> {
        let conn = self.conn()?;
        let claim = conn
            .query_row(
                &format!("SELECT {CLAIM_COLUMNS} FROM pull_claim WHERE message_id = ?1"),
                [message_id.as_str()],
                map_claim,
            )
            .optional()?;
        Ok(claim)
    }

    /// Oldest claimable message for the pair, without claiming it.
    pub fn oldest_ready(
        &self,
        channel: &Channel,
        initiator: &PartyId,
        now: Timestamp,
    ) -> Result<Option<MessageId>, StoreError> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT c.message_id FROM pull_claim c
                 JOIN message_log m ON m.message_id = c.message_id
                 WHERE c.state = 'WAITING' AND c.channel = ?1 AND c.initiator = ?2
                   AND c.available_at <= ?3
                   AND m.status IN ('READY_TO_PULL', 'WAITING_FOR_RETRY')
                 ORDER BY c.created_at, c.id
                 LIMIT 1",
                params![channel.as_str(), initiator.as_str(), sql_ts(now)],
                |row| parse_col::<MessageId>(row, 0),
            )
            .optional()?;
        Ok(id)
    }

    /// Atomically claims the oldest waiting message for `channel` and
    /// `initiator` on behalf of `node`.
    ///
    /// Runs as one `BEGIN IMMEDIATE` transaction, so concurrent callers on
    /// any connection to the same database are serialized by SQLite's write
    /// lock. Candidates whose retry budget is already spent are failed in the
    /// same transaction and reported in [`ClaimOutcome::staled`]. The claimed
    /// message moves to `WAITING_FOR_RECEIPT` before the commit.
    pub fn claim_next(
        &self,
        channel: &Channel,
        initiator: &PartyId,
        node: &NodeId,
        stale_after: Timestamp,
        now: Timestamp,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let staled = {
            let mut stmt = tx.prepare(
                "SELECT c.message_id, m.status FROM pull_claim c
                 JOIN message_log m ON m.message_id = c.message_id
                 WHERE c.state = 'WAITING' AND c.channel = ?1 AND c.initiator = ?2
                   AND c.available_at <= ?3
                   AND m.status IN ('READY_TO_PULL', 'WAITING_FOR_RETRY')
                   AND (m.send_attempts >= m.send_attempts_max
                        OR COALESCE(m.restored_at, m.received_at) + m.retry_timeout_ms <= ?3)",
            )?;
            let rows = stmt.query_map(
                params![channel.as_str(), initiator.as_str(), sql_ts(now)],
                |row| {
                    Ok(ClaimCandidate {
                        message_id: parse_col(row, 0)?,
                        previous: parse_col(row, 1)?,
                    })
                },
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for stale in &staled {
            tx.execute(
                "UPDATE pull_claim SET state = 'EXPIRED', claimed_by = NULL, stale_after = NULL
                 WHERE message_id = ?1",
                [stale.message_id.as_str()],
            )?;
            tx.execute(
                "UPDATE message_log SET status = 'SEND_FAILURE', version = version + 1
                 WHERE message_id = ?1 AND status = ?2",
                params![stale.message_id.as_str(), stale.previous.as_str()],
            )?;
            debug!(message_id = %stale.message_id, "retry budget spent before claim");
        }

        let claimed = tx
            .query_row(
                "UPDATE pull_claim SET state = 'CLAIMED', claimed_by = ?1, stale_after = ?2
                 WHERE id = (
                   SELECT c.id FROM pull_claim c
                   JOIN message_log m ON m.message_id = c.message_id
                   WHERE c.state = 'WAITING' AND c.channel = ?3 AND c.initiator = ?4
                     AND c.available_at <= ?5
                     AND m.status IN ('READY_TO_PULL', 'WAITING_FOR_RETRY')
                   ORDER BY c.created_at, c.id
                   LIMIT 1
                 ) AND state = 'WAITING'
                 RETURNING message_id",
                params![
                    node.as_str(),
                    sql_ts(stale_after),
                    channel.as_str(),
                    initiator.as_str(),
                    sql_ts(now)
                ],
                |row| parse_col::<MessageId>(row, 0),
            )
            .optional()?;
        let claimed = match claimed {
            Some(message_id) => {
                let previous = tx.query_row(
                    "SELECT status FROM message_log WHERE message_id = ?1",
                    [message_id.as_str()],
                    |row| parse_col::<MessageStatus>(row, 0),
                )?;
                tx.execute(
                    "UPDATE message_log
                     SET status = 'WAITING_FOR_RECEIPT', receipt_deadline = NULL,
                         version = version + 1
                     WHERE message_id = ?1",
                    [message_id.as_str()],
                )?;
                Some(ClaimCandidate {
                    message_id,
                    previous,
                })
            }
            None => None,
        };
        tx.commit()?;
        Ok(ClaimOutcome { claimed, staled })
    }

    /// Compare-and-set write of a message row and its claim.
    ///
    /// Returns `false`, with nothing written, when the stored status or
    /// version no longer match the snapshot, or a required claim is no longer
    /// `CLAIMED`. Claim-next bumps the version too, so a snapshot taken under
    /// one claim cannot be written back under a later one.
    pub fn apply(&self, update: &StatusUpdate) -> Result<bool, StoreError> {
        let record = &update.record;
        let id = record.message_id.as_str();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if update.require_claimed {
            let state = tx
                .query_row(
                    "SELECT state FROM pull_claim WHERE message_id = ?1",
                    [id],
                    |row| parse_col::<ClaimState>(row, 0),
                )
                .optional()?;
            if state != Some(ClaimState::Claimed) {
                return Ok(false);
            }
        }

        let changed = tx.execute(
            "UPDATE message_log
             SET status = ?2, send_attempts = ?3, send_attempts_max = ?4, retry_timeout_ms = ?5,
                 next_attempt = ?6, restored_at = ?7, receipt_deadline = ?8,
                 version = version + 1
             WHERE message_id = ?1 AND status = ?9 AND version = ?10",
            params![
                id,
                record.status.as_str(),
                record.send_attempts,
                record.send_attempts_max,
                sql_ts(record.retry_timeout_ms),
                record.next_attempt.map(sql_ts),
                record.restored_at.map(sql_ts),
                record.receipt_deadline.map(sql_ts),
                update.expected.as_str(),
                sql_ts(record.version),
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        match update.claim {
            ClaimChange::Keep => {}
            ClaimChange::Remove => {
                tx.execute("DELETE FROM pull_claim WHERE message_id = ?1", [id])?;
            }
            ClaimChange::Requeue { available_at } => {
                tx.execute(
                    "UPDATE pull_claim
                     SET state = 'WAITING', claimed_by = NULL, stale_after = NULL, available_at = ?2
                     WHERE message_id = ?1",
                    params![id, sql_ts(available_at)],
                )?;
            }
            ClaimChange::Expire => {
                tx.execute(
                    "UPDATE pull_claim SET state = 'EXPIRED', claimed_by = NULL, stale_after = NULL
                     WHERE message_id = ?1",
                    [id],
                )?;
            }
            ClaimChange::Refresh { stale_after } => {
                tx.execute(
                    "UPDATE pull_claim SET stale_after = ?2
                     WHERE message_id = ?1 AND state = 'CLAIMED'",
                    params![id, sql_ts(stale_after)],
                )?;
            }
            ClaimChange::Recreate { available_at } => {
                upsert_waiting_claim(&tx, record, available_at)?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// `CLAIMED` claims whose staleness deadline has passed, oldest first.
    pub fn stale_claims(&self, now: Timestamp, limit: usize) -> Result<Vec<PullClaim>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CLAIM_COLUMNS} FROM pull_claim
             WHERE state = 'CLAIMED' AND stale_after <= ?1
             ORDER BY stale_after, id
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![sql_ts(now), sql_limit(limit)], map_claim)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Messages whose next attempt is due.
    ///
    /// Pull messages waiting for retry, and push messages that are queued,
    /// waiting for retry, or restored but not yet re-dispatched (no receipt
    /// deadline).
    pub fn due_retries(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message_log
             WHERE next_attempt <= ?1
               AND (
                 (direction = 'pull' AND status = 'WAITING_FOR_RETRY')
                 OR (direction = 'push' AND receipt_deadline IS NULL
                     AND status IN ('SEND_ENQUEUED', 'WAITING_FOR_RETRY', 'WAITING_FOR_RECEIPT'))
               )
             ORDER BY next_attempt, created_at
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![sql_ts(now), sql_limit(limit)], map_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Push messages still waiting for a receipt after their deadline.
    pub fn overdue_receipts(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message_log
             WHERE direction = 'push'
               AND status IN ('WAITING_FOR_RECEIPT', 'WAITING_FOR_CALLBACK')
               AND receipt_deadline <= ?1
             ORDER BY receipt_deadline, created_at
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![sql_ts(now), sql_limit(limit)], map_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Number of messages per status, in status order.
    pub fn status_counts(&self) -> Result<Vec<(MessageStatus, u64)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM message_log GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((parse_col::<MessageStatus>(row, 0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = rows
            .map(|row| row.map(|(status, count)| (status, count.max(0) as u64)))
            .collect::<Result<Vec<_>, _>>()?;
        counts.sort_by_key(|(status, _)| {
            MessageStatus::ALL
                .iter()
                .position(|s| s == status)
                .unwrap_or(usize::MAX)
        });
        Ok(counts)
    }
}

fn upsert_waiting_claim(
    conn: &Connection,
    record: &MessageRecord,
    available_at: Timestamp,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO pull_claim
           (message_id, channel, initiator, state, claimed_by, stale_after, available_at, created_at)
         VALUES (?1, ?2, ?3, 'WAITING', NULL, NULL, ?4, ?5)
         ON CONFLICT(message_id) DO UPDATE
         SET state = 'WAITING', claimed_by = NULL, stale_after = NULL,
             available_at = excluded.available_at",
        params![
            record.message_id.as_str(),
            record.channel.as_str(),
            record.initiator.as_str(),
            sql_ts(available_at),
            sql_ts(record.created_at),
        ],
    )?;
    Ok(())
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        message_id: parse_col(row, 0)?,
        channel: parse_col(row, 1)?,
        initiator: parse_col(row, 2)?,
        responder: parse_col(row, 3)?,
        direction: parse_col(row, 4)?,
        pmode_key: parse_col(row, 5)?,
        status: parse_col(row, 6)?,
        send_attempts: row.get(7)?,
        send_attempts_max: row.get(8)?,
        retry_timeout_ms: ts_col(row, 9)?,
        next_attempt: opt_ts_col(row, 10)?,
        received_at: ts_col(row, 11)?,
        restored_at: opt_ts_col(row, 12)?,
        receipt_deadline: opt_ts_col(row, 13)?,
        created_at: ts_col(row, 14)?,
        version: row.get::<_, i64>(15)?.max(0) as u64,
    })
}

fn map_claim(row: &Row<'_>) -> rusqlite::Result<PullClaim> {
    let claimed_by: Option<String> = row.get(4)?;
    Ok(PullClaim {
        message_id: parse_col(row, 0)?,
        channel: parse_col(row, 1)?,
        initiator: parse_col(row, 2)?,
        state: parse_col(row, 3)?,
        claimed_by: claimed_by
            .map(|raw| NodeId::new(raw).map_err(|err| conversion_error(4, err)))
            .transpose()?,
        stale_after: opt_ts_col(row, 5)?,
        available_at: ts_col(row, 6)?,
        created_at: ts_col(row, 7)?,
    })
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = CoreError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|err| conversion_error(idx, err))
}

fn conversion_error(idx: usize, err: CoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let value: i64 = row.get(idx)?;
    Ok(value.max(0) as Timestamp)
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    let value: Option<i64> = row.get(idx)?;
    Ok(value.map(|v| v.max(0) as Timestamp))
}

fn sql_ts(ts: Timestamp) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
