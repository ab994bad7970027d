//! Batched, transactional writes into a session file.

use super::schema::{self, keys};
use super::{StorageError, TargetEvent, TargetEventKind};
use crate::collector::{MetricSample, Target};
use crate::config::WriterConfig;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Static session metadata written once at creation.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    /// Unix seconds.
    pub started_at: i64,
    pub platform: String,
    /// Config snapshot as JSON.
    pub config_json: String,
    /// Physical memory of the host in bytes.
    pub memory_total: Option<u64>,
}

/// Totals reported when a session is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterReport {
    pub path: PathBuf,
    pub samples_written: u64,
    pub samples_dropped: u64,
    pub events_written: u64,
    pub commits: u64,
}

/// Sole owner of a session file while a run is active.
///
/// Samples accumulate in memory and are committed in one transaction once
/// `batch_size` samples are pending or the oldest pending sample is older
/// than `flush_interval`.
pub struct SessionWriter {
    conn: Connection,
    path: PathBuf,
    batch_size: usize,
    flush_interval: Duration,
    commit_retries: u32,
    pending: Vec<MetricSample>,
    pending_events: Vec<TargetEvent>,
    pending_since: Option<Instant>,
    samples_written: u64,
    events_written: u64,
    commits: u64,
}

impl SessionWriter {
    /// Creates the session file, its schema, metadata and target rows.
    pub fn create(
        path: impl AsRef<Path>,
        meta: &SessionMeta,
        targets: &[Target],
        config: &WriterConfig,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        let mut conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(schema::SESSION_SCHEMA)?;

        let tx = conn.transaction()?;
        {
            let mut upsert = tx.prepare(schema::UPSERT_SESSION_KEY)?;
            upsert.execute(params![keys::SCHEMA_VERSION, schema::SCHEMA_VERSION])?;
            upsert.execute(params![keys::STARTED_AT, meta.started_at.to_string()])?;
            upsert.execute(params![keys::PLATFORM, meta.platform])?;
            upsert.execute(params![keys::CONFIG, meta.config_json])?;
            if let Some(total) = meta.memory_total {
                upsert.execute(params![keys::MEMORY_TOTAL, total.to_string()])?;
            }

            let mut insert = tx.prepare(
                "INSERT INTO targets (target_id, kind, pid, name, start_time, cmd, user) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for target in targets {
                insert.execute(params![
                    target.id.0,
                    target.kind.as_str(),
                    target.pid,
                    target.name,
                    target.start_time,
                    target.cmd,
                    target.user,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            "Created session store {} with {} targets",
            path.display(),
            targets.len()
        );

        Ok(Self {
            conn,
            path,
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_secs(config.flush_interval_secs),
            commit_retries: config.commit_retries,
            pending: Vec::new(),
            pending_events: Vec::new(),
            pending_since: None,
            samples_written: 0,
            events_written: 0,
            commits: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queues samples and events; commits if the batch is full.
    pub fn write(
        &mut self,
        samples: Vec<MetricSample>,
        events: Vec<TargetEvent>,
    ) -> Result<(), StorageError> {
        if samples.is_empty() && events.is_empty() {
            return Ok(());
        }

        self.pending_since.get_or_insert_with(Instant::now);
        self.pending.extend(samples);
        self.pending_events.extend(events);

        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Time left before pending data must be committed, if any is pending.
    pub fn flush_deadline(&self) -> Option<Duration> {
        self.pending_since
            .map(|since| self.flush_interval.saturating_sub(since.elapsed()))
    }

    /// Commits if the flush interval has elapsed.
    pub fn flush_if_due(&mut self) -> Result<(), StorageError> {
        match self.flush_deadline() {
            Some(left) if left.is_zero() => self.flush().map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Commits everything pending in one transaction, retrying on failure.
    ///
    /// Returns the number of rows the commit added. A sample replacing an
    /// earlier one for the same target and second adds nothing.
    pub fn flush(&mut self) -> Result<u64, StorageError> {
        if self.pending.is_empty() && self.pending_events.is_empty() {
            return Ok(0);
        }

        let mut attempt = 0;
        let added = loop {
            attempt += 1;
            match write_batch(&mut self.conn, &self.pending, &self.pending_events) {
                Ok(added) => break added,
                Err(e) if attempt <= self.commit_retries => {
                    warn!("Commit attempt {} failed, retrying: {}", attempt, e);
                    std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                }
                Err(e) => {
                    return Err(StorageError::CommitFailed {
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        };

        let replaced = self.pending.len() as u64 - added;
        self.samples_written += added;
        self.events_written += self.pending_events.len() as u64;
        self.commits += 1;
        self.pending.clear();
        self.pending_events.clear();
        self.pending_since = None;

        if replaced > 0 {
            debug!("{} samples replaced an earlier sample of the same second", replaced);
        }
        debug!("Committed {} samples to {}", added, self.path.display());
        Ok(added)
    }

    /// Flushes, records closing counters and closes the file.
    pub fn close(
        mut self,
        samples_dropped: u64,
        stopped_at: i64,
    ) -> Result<WriterReport, StorageError> {
        self.flush()?;

        let tx = self.conn.transaction()?;
        {
            let mut upsert = tx.prepare(schema::UPSERT_SESSION_KEY)?;
            upsert.execute(params![keys::STOPPED_AT, stopped_at.to_string()])?;
            upsert.execute(params![keys::SAMPLES_WRITTEN, self.samples_written.to_string()])?;
            upsert.execute(params![keys::SAMPLES_DROPPED, samples_dropped.to_string()])?;
        }
        tx.commit()?;

        let report = WriterReport {
            path: self.path.clone(),
            samples_written: self.samples_written,
            samples_dropped,
            events_written: self.events_written,
            commits: self.commits,
        };

        // Fold the WAL back in so a finished session is a single file.
        self.conn.execute_batch("PRAGMA journal_mode=DELETE;")?;
        self.conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;

        info!(
            "Closed session store {} ({} samples, {} dropped)",
            report.path.display(),
            report.samples_written,
            report.samples_dropped
        );
        Ok(report)
    }
}

/// Writes one batch in a transaction and returns how many sample rows it added.
fn write_batch(
    conn: &mut Connection,
    samples: &[MetricSample],
    events: &[TargetEvent],
) -> rusqlite::Result<u64> {
    let tx = conn.transaction()?;
    let mut added = 0;
    {
        let mut exists = tx.prepare_cached(schema::SAMPLE_EXISTS)?;
        let mut insert = tx.prepare_cached(schema::INSERT_SAMPLE)?;
        for sample in samples {
            let present: bool =
                exists.query_row(params![sample.target.0, sample.timestamp], |row| row.get(0))?;
            if !present {
                added += 1;
            }
            let v = &sample.values;
            insert.execute(params![
                sample.target.0,
                sample.timestamp,
                v.cpu_percent,
                v.memory_bytes.map(|b| b as i64),
                v.read_bytes.map(|b| b as i64),
                v.write_bytes.map(|b| b as i64),
                v.net_bytes.map(|b| b as i64),
                v.thread_count,
                v.handle_count,
            ])?;
        }

        let mut insert_event = tx.prepare_cached(schema::INSERT_EVENT)?;
        let mut mark_ended = tx.prepare_cached(
            "UPDATE targets SET ended_at = ?2 WHERE target_id = ?1 AND ended_at IS NULL",
        )?;
        for event in events {
            insert_event.execute(params![
                event.target.0,
                event.timestamp,
                event.kind.as_str(),
                event.detail,
            ])?;
            if event.kind == TargetEventKind::Ended {
                mark_ended.execute(params![event.target.0, event.timestamp])?;
            }
        }
    }
    tx.commit()?;
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{MetricValues, TargetId};
    use tempfile::tempdir;

    fn meta() -> SessionMeta {
        SessionMeta {
            started_at: 1_700_000_000,
            platform: "linux".into(),
            config_json: "{}".into(),
            memory_total: Some(16 << 30),
        }
    }

    fn sample(target: u32, timestamp: i64, cpu: f64) -> MetricSample {
        MetricSample {
            target: TargetId(target),
            timestamp,
            values: MetricValues {
                cpu_percent: Some(cpu),
                ..Default::default()
            },
        }
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_commits_when_batch_is_full() {
        let dir = tempdir().unwrap();
        let config = WriterConfig {
            batch_size: 3,
            ..Default::default()
        };
        let mut writer =
            SessionWriter::create(dir.path().join("s.db"), &meta(), &[Target::system()], &config)
                .unwrap();

        writer
            .write(vec![sample(0, 1, 1.0), sample(0, 2, 2.0)], vec![])
            .unwrap();
        assert_eq!(writer.pending(), 2);
        assert_eq!(writer.samples_written(), 0);

        writer.write(vec![sample(0, 3, 3.0)], vec![]).unwrap();
        assert_eq!(writer.pending(), 0);
        assert_eq!(writer.samples_written(), 3);
    }

    #[test]
    fn test_same_second_last_write_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        let mut writer =
            SessionWriter::create(&path, &meta(), &[Target::system()], &WriterConfig::default())
                .unwrap();

        writer.write(vec![sample(0, 10, 1.0)], vec![]).unwrap();
        writer.flush().unwrap();
        writer.write(vec![sample(0, 10, 9.0)], vec![]).unwrap();
        let report = writer.close(0, 11).unwrap();
        assert_eq!(report.samples_written, 1);

        let conn = Connection::open(&path).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM samples"), 1);
        let cpu: f64 = conn
            .query_row("SELECT cpu_percent FROM samples", [], |row| row.get(0))
            .unwrap();
        assert_eq!(cpu, 9.0);
    }

    #[test]
    fn test_close_records_counters_and_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        let process = Target {
            id: TargetId(1),
            kind: crate::collector::TargetKind::Process,
            pid: Some(1234),
            name: "worker".into(),
            start_time: Some(1_699_999_000),
            cmd: Some("worker --threads 4".into()),
            user: Some("svc".into()),
        };
        let mut writer = SessionWriter::create(
            &path,
            &meta(),
            &[Target::system(), process],
            &WriterConfig::default(),
        )
        .unwrap();

        writer
            .write(
                vec![sample(1, 5, 1.0)],
                vec![TargetEvent {
                    target: TargetId(1),
                    timestamp: 6,
                    kind: TargetEventKind::Ended,
                    detail: "process exited".into(),
                }],
            )
            .unwrap();
        let report = writer.close(7, 8).unwrap();

        assert_eq!(report.samples_written, 1);
        assert_eq!(report.samples_dropped, 7);
        assert_eq!(report.events_written, 1);

        let conn = Connection::open(&path).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM target_events"), 1);
        let user: String = conn
            .query_row("SELECT user FROM targets WHERE target_id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(user, "svc");
        assert_eq!(
            count(&conn, "SELECT ended_at FROM targets WHERE target_id = 1"),
            6
        );
        let dropped: String = conn
            .query_row(
                "SELECT value FROM session WHERE key = 'samples_dropped'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(dropped, "7");
    }

    #[test]
    fn test_flush_deadline_tracks_pending() {
        let dir = tempdir().unwrap();
        let mut writer = SessionWriter::create(
            dir.path().join("s.db"),
            &meta(),
            &[Target::system()],
            &WriterConfig::default(),
        )
        .unwrap();

        assert!(writer.flush_deadline().is_none());
        writer.write(vec![sample(0, 1, 1.0)], vec![]).unwrap();
        let left = writer.flush_deadline().unwrap();
        assert!(left <= Duration::from_secs(2));

        writer.flush_if_due().unwrap();
        assert_eq!(writer.pending(), 1);
    }

    #[test]
    fn test_collisions_within_a_batch_count_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        let mut writer =
            SessionWriter::create(&path, &meta(), &[Target::system()], &WriterConfig::default())
                .unwrap();

        writer
            .write(
                vec![sample(0, 10, 1.0), sample(0, 10, 2.0), sample(0, 11, 3.0)],
                vec![],
            )
            .unwrap();
        assert_eq!(writer.flush().unwrap(), 2);
        assert_eq!(writer.samples_written(), 2);

        let report = writer.close(0, 12).unwrap();
        let conn = Connection::open(&path).unwrap();
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM samples") as u64,
            report.samples_written
        );
        let recorded: String = conn
            .query_row(
                "SELECT value FROM session WHERE key = 'samples_written'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(recorded, "2");
    }

    #[test]
    fn test_flush_interval_commits_pending_samples() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        let config = WriterConfig {
            batch_size: 100,
            flush_interval_secs: 1,
            ..Default::default()
        };
        let mut writer =
            SessionWriter::create(&path, &meta(), &[Target::system()], &config).unwrap();

        writer.write(vec![sample(0, 1, 1.0)], vec![]).unwrap();
        writer.flush_if_due().unwrap();
        assert_eq!(writer.pending(), 1);

        std::thread::sleep(Duration::from_millis(1_100));
        assert_eq!(writer.flush_deadline(), Some(Duration::ZERO));
        writer.flush_if_due().unwrap();
        assert_eq!(writer.pending(), 0);
        assert_eq!(writer.samples_written(), 1);

        // Committed data is visible to another connection before close.
        let other = Connection::open(&path).unwrap();
        assert_eq!(count(&other, "SELECT COUNT(*) FROM samples"), 1);
    }

    #[test]
    fn test_persistent_commit_failure_is_reported_after_retries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        let config = WriterConfig {
            batch_size: 1,
            commit_retries: 2,
            ..Default::default()
        };
        let mut writer =
            SessionWriter::create(&path, &meta(), &[Target::system()], &config).unwrap();

        let other = Connection::open(&path).unwrap();
        other
            .execute_batch(
                "CREATE TRIGGER reject_samples BEFORE INSERT ON samples \
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .unwrap();
        drop(other);

        let err = writer.write(vec![sample(0, 1, 1.0)], vec![]).unwrap_err();
        assert!(
            matches!(err, StorageError::CommitFailed { attempts: 3, .. }),
            "unexpected {:?}",
            err
        );
        assert_eq!(writer.pending(), 1);
        assert_eq!(writer.samples_written(), 0);
    }
}
