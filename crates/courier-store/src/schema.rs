pub(crate) const PRAGMAS: &str = "PRAGMA busy_timeout=5000;
     PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA foreign_keys=ON;";

pub(crate) const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS message_log (
       message_id TEXT PRIMARY KEY,
       channel TEXT NOT NULL,
       initiator TEXT NOT NULL,
       responder TEXT NOT NULL,
       direction TEXT NOT NULL,
       pmode_key TEXT NOT NULL,
       status TEXT NOT NULL,
       send_attempts INTEGER NOT NULL,
       send_attempts_max INTEGER NOT NULL,
       retry_timeout_ms INTEGER NOT NULL,
       next_attempt INTEGER,
       received_at INTEGER NOT NULL,
       restored_at INTEGER,
       receipt_deadline INTEGER,
       created_at INTEGER NOT NULL,
       version INTEGER NOT NULL DEFAULT 0
     );
     CREATE INDEX IF NOT EXISTS idx_message_log_status_next
       ON message_log (status, next_attempt);
     CREATE TABLE IF NOT EXISTS pull_claim (
       id INTEGER PRIMARY KEY AUTOINCREMENT,
       message_id TEXT NOT NULL UNIQUE REFERENCES message_log (message_id),
       channel TEXT NOT NULL,
       initiator TEXT NOT NULL,
       state TEXT NOT NULL,
       claimed_by TEXT,
       stale_after INTEGER,
       available_at INTEGER NOT NULL,
       created_at INTEGER NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_pull_claim_queue
       ON pull_claim (channel, initiator, state, created_at, id);";

pub(crate) const MESSAGE_COLUMNS: &str = "message_id, channel, initiator, responder, direction, \
     pmode_key, status, send_attempts, send_attempts_max, retry_timeout_ms, next_attempt, \
     received_at, restored_at, receipt_deadline, created_at, version";

pub(crate) const CLAIM_COLUMNS: &str =
    "message_id, channel, initiator, state, claimed_by, stale_after, available_at, created_at";
