//! Table layout of a session file.

pub(crate) const SCHEMA_VERSION: &str = "1";

/// DDL for a fresh session. The `samples` primary key doubles as the
/// `(target_id, timestamp_sec)` index used by series reads, and makes a
/// second write for the same target-second replace the first.
pub(crate) const SESSION_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS session (
    key     TEXT PRIMARY KEY,
    value   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS targets (
    target_id   INTEGER PRIMARY KEY,
    kind        TEXT NOT NULL,
    pid         INTEGER,
    name        TEXT NOT NULL,
    start_time  INTEGER,
    cmd         TEXT,
    user        TEXT,
    ended_at    INTEGER
);

CREATE TABLE IF NOT EXISTS samples (
    target_id       INTEGER NOT NULL REFERENCES targets(target_id),
    timestamp_sec   INTEGER NOT NULL,
    cpu_percent     REAL,
    memory_bytes    INTEGER,
    read_bytes      INTEGER,
    write_bytes     INTEGER,
    net_bytes       INTEGER,
    thread_count    INTEGER,
    handle_count    INTEGER,
    PRIMARY KEY (target_id, timestamp_sec)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS target_events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id       INTEGER NOT NULL REFERENCES targets(target_id),
    timestamp_sec   INTEGER NOT NULL,
    kind            TEXT NOT NULL,
    detail          TEXT NOT NULL
);
";

pub(crate) const REQUIRED_TABLES: [&str; 4] = ["session", "targets", "samples", "target_events"];

/// Keys of the `session` table.
pub(crate) mod keys {
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const STARTED_AT: &str = "started_at";
    pub const STOPPED_AT: &str = "stopped_at";
    pub const PLATFORM: &str = "platform";
    pub const MEMORY_TOTAL: &str = "memory_total";
    pub const CONFIG: &str = "config";
    pub const SAMPLES_WRITTEN: &str = "samples_written";
    pub const SAMPLES_DROPPED: &str = "samples_dropped";
}

pub(crate) const INSERT_SAMPLE: &str = "INSERT OR REPLACE INTO samples \
     (target_id, timestamp_sec, cpu_percent, memory_bytes, read_bytes, \
      write_bytes, net_bytes, thread_count, handle_count) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

pub(crate) const SAMPLE_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM samples WHERE target_id = ?1 AND timestamp_sec = ?2)";

pub(crate) const INSERT_EVENT: &str =
    "INSERT INTO target_events (target_id, timestamp_sec, kind, detail) VALUES (?1, ?2, ?3, ?4)";

pub(crate) const UPSERT_SESSION_KEY: &str =
    "INSERT OR REPLACE INTO session (key, value) VALUES (?1, ?2)";
