//! Read-only access to a session file.

use super::schema::{self, keys};
use super::{DataError, TargetEvent, TargetEventKind};
use crate::collector::{Metric, Target, TargetId, TargetKind};
use crate::config::Config;
use crate::series::{Point, SeriesQuery};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Session metadata as recorded by the writer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub schema_version: String,
    pub started_at: Option<i64>,
    /// `None` if the run never closed cleanly.
    pub stopped_at: Option<i64>,
    pub platform: Option<String>,
    /// Physical memory of the recording host in bytes.
    pub memory_total: Option<u64>,
    pub config: Option<Config>,
    pub samples_written: Option<u64>,
    pub samples_dropped: Option<u64>,
}

impl SessionInfo {
    /// `bytes` as a percentage of the host's physical memory.
    pub fn memory_percent(&self, bytes: f64) -> Option<f64> {
        self.memory_total
            .filter(|&total| total > 0)
            .map(|total| bytes * 100.0 / total as f64)
    }
}

/// A target row plus the time it ended, if it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredTarget {
    #[serde(flatten)]
    pub target: Target,
    pub ended_at: Option<i64>,
}

pub struct StoreReader {
    conn: Connection,
    path: PathBuf,
    session: SessionInfo,
}

impl StoreReader {
    /// Opens a session file read-only and validates its layout.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DataError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| DataError::Open {
            path: path.clone(),
            source,
        };

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(open_err)?;

        // The first real read is where a non-database file is detected.
        let tables = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
                .map_err(open_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(open_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(open_err)?
        };

        for table in schema::REQUIRED_TABLES {
            if !tables.iter().any(|t| t == table) {
                return Err(DataError::MissingTable {
                    path,
                    table: table.to_string(),
                });
            }
        }

        let session = read_session(&conn, &path)?;
        debug!(
            "Opened store {} (platform {:?}, started {:?})",
            path.display(),
            session.platform,
            session.started_at
        );

        Ok(Self {
            conn,
            path,
            session,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Targets ordered by id; the system target comes first.
    pub fn list_targets(&self) -> Result<Vec<StoredTarget>, DataError> {
        let mut stmt = self.conn.prepare(
            "SELECT target_id, kind, pid, name, start_time, cmd, user, ended_at \
             FROM targets ORDER BY target_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let kind: String = row.get(1)?;
            let target = Target {
                id: TargetId(row.get(0)?),
                kind: TargetKind::Process,
                pid: row.get(2)?,
                name: row.get(3)?,
                start_time: row.get(4)?,
                cmd: row.get(5)?,
                user: row.get(6)?,
            };
            Ok((kind, target, row.get::<_, Option<i64>>(7)?))
        })?;

        let mut targets = Vec::new();
        for row in rows {
            let (kind, mut target, ended_at) = row?;
            target.kind = kind.parse().map_err(DataError::Unreadable)?;
            targets.push(StoredTarget { target, ended_at });
        }
        Ok(targets)
    }

    pub fn target(&self, id: TargetId) -> Result<Option<StoredTarget>, DataError> {
        Ok(self.list_targets()?.into_iter().find(|t| t.target.id == id))
    }

    /// Points of one metric in ascending time order. NULL values are skipped.
    pub fn read_series(&self, query: &SeriesQuery) -> Result<Vec<Point>, DataError> {
        self.ensure_target(query.target)?;

        let (from, to) = query.range.bounds();
        let column = query.metric.name();
        let sql = format!(
            "SELECT timestamp_sec, {column} FROM samples \
             WHERE target_id = ?1 AND timestamp_sec BETWEEN ?2 AND ?3 AND {column} IS NOT NULL \
             ORDER BY timestamp_sec ASC"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let points = stmt
            .query_map(params![query.target.0, from, to], |row| {
                Ok(Point::new(row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Read {} points of {} for target {} from {}",
            points.len(),
            query.metric,
            query.target,
            self.path.display()
        );
        Ok(points)
    }

    /// Metrics with at least one non-NULL value for `target`.
    pub fn available_metrics(&self, target: TargetId) -> Result<Vec<Metric>, DataError> {
        self.ensure_target(target)?;

        let counts = Metric::ALL
            .iter()
            .map(|m| format!("COUNT({})", m.name()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {counts} FROM samples WHERE target_id = ?1");

        self.conn
            .query_row(&sql, params![target.0], |row| {
                let mut metrics = Vec::new();
                for (i, metric) in Metric::ALL.into_iter().enumerate() {
                    if row.get::<_, i64>(i)? > 0 {
                        metrics.push(metric);
                    }
                }
                Ok(metrics)
            })
            .map_err(DataError::from)
    }

    pub fn sample_count(&self, target: TargetId) -> Result<u64, DataError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE target_id = ?1",
            params![target.0],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// First and last sample timestamps of `target`, if it has samples.
    pub fn time_span(&self, target: TargetId) -> Result<Option<(i64, i64)>, DataError> {
        let span: (Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT MIN(timestamp_sec), MAX(timestamp_sec) FROM samples WHERE target_id = ?1",
            params![target.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(match span {
            (Some(first), Some(last)) => Some((first, last)),
            _ => None,
        })
    }

    /// Recorded target lifecycle events in the order they were written.
    pub fn events(&self) -> Result<Vec<TargetEvent>, DataError> {
        let mut stmt = self.conn.prepare(
            "SELECT target_id, timestamp_sec, kind, detail FROM target_events ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (target, timestamp, kind, detail) = row?;
            let kind: TargetEventKind = kind.parse().map_err(DataError::Unreadable)?;
            events.push(TargetEvent {
                target: TargetId(target),
                timestamp,
                kind,
                detail,
            });
        }
        Ok(events)
    }

    fn ensure_target(&self, id: TargetId) -> Result<(), DataError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM targets WHERE target_id = ?1",
                params![id.0],
                |_| Ok(()),
            )
            .optional()?;
        exists.ok_or(DataError::UnknownTarget(id))
    }
}

fn read_session(conn: &Connection, path: &Path) -> Result<SessionInfo, DataError> {
    let mut stmt = conn.prepare("SELECT key, value FROM session")?;
    let values: HashMap<String, String> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;

    let version = values
        .get(keys::SCHEMA_VERSION)
        .cloned()
        .unwrap_or_default();
    if version != schema::SCHEMA_VERSION {
        return Err(DataError::SchemaVersion {
            path: path.to_path_buf(),
            version,
        });
    }

    let number = |key: &str| values.get(key).and_then(|v| v.parse::<i64>().ok());

    let config = match values.get(keys::CONFIG) {
        Some(json) => match serde_json::from_str::<Config>(json) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring unreadable config snapshot in {}: {}", path.display(), e);
                None
            }
        },
        None => None,
    };

    Ok(SessionInfo {
        schema_version: version,
        started_at: number(keys::STARTED_AT),
        stopped_at: number(keys::STOPPED_AT),
        platform: values.get(keys::PLATFORM).cloned(),
        memory_total: number(keys::MEMORY_TOTAL).map(|n| n as u64),
        config,
        samples_written: number(keys::SAMPLES_WRITTEN).map(|n| n as u64),
        samples_dropped: number(keys::SAMPLES_DROPPED).map(|n| n as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{MetricSample, MetricValues, ProcessInfo};
    use crate::config::WriterConfig;
    use crate::series::TimeRange;
    use crate::store::{SessionMeta, SessionWriter};
    use tempfile::tempdir;

    fn targets() -> Vec<Target> {
        vec![
            Target::system(),
            Target::process(
                TargetId(1),
                &ProcessInfo {
                    pid: 1234,
                    name: "worker".into(),
                    start_time: 1_699_999_000,
                    cmd: Some("/usr/bin/worker -q".into()),
                    user: Some("svc".into()),
                },
            ),
        ]
    }

    fn write_session(path: &Path, samples: Vec<MetricSample>, events: Vec<TargetEvent>) {
        let meta = SessionMeta {
            started_at: 1_700_000_000,
            platform: "linux".into(),
            config_json: serde_json::to_string(&Config::default()).unwrap(),
            memory_total: Some(8 << 30),
        };
        let mut writer =
            SessionWriter::create(path, &meta, &targets(), &WriterConfig::default()).unwrap();
        writer.write(samples, events).unwrap();
        writer.close(0, 1_700_010_000).unwrap();
    }

    fn cpu_sample(target: u32, timestamp: i64, cpu: f64) -> MetricSample {
        MetricSample {
            target: TargetId(target),
            timestamp,
            values: MetricValues {
                cpu_percent: Some(cpu),
                memory_bytes: Some(4096),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_ten_thousand_samples_read_back_ascending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        let base = 1_700_000_000;
        let samples = (0..10_000)
            .map(|i| cpu_sample(1, base + i, (i % 100) as f64))
            .collect();
        write_session(&path, samples, vec![]);

        let reader = StoreReader::open(&path).unwrap();
        let points = reader
            .read_series(&SeriesQuery::new(TargetId(1), Metric::CpuPercent))
            .unwrap();

        assert_eq!(points.len(), 10_000);
        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(points[0].timestamp, base);
        assert_eq!(reader.sample_count(TargetId(1)).unwrap(), 10_000);
        assert_eq!(
            reader.time_span(TargetId(1)).unwrap(),
            Some((base, base + 9_999))
        );
    }

    #[test]
    fn test_session_metadata_and_targets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        write_session(&path, vec![cpu_sample(0, 10, 5.0)], vec![]);

        let reader = StoreReader::open(&path).unwrap();
        let session = reader.session();
        assert_eq!(session.started_at, Some(1_700_000_000));
        assert_eq!(session.stopped_at, Some(1_700_010_000));
        assert_eq!(session.platform.as_deref(), Some("linux"));
        assert_eq!(session.config, Some(Config::default()));
        assert_eq!(session.samples_written, Some(1));
        assert_eq!(session.memory_total, Some(8 << 30));
        assert_eq!(session.memory_percent((2u64 << 30) as f64), Some(25.0));

        let stored = reader.list_targets().unwrap();
        let stored: Vec<Target> = stored.into_iter().map(|t| t.target).collect();
        assert_eq!(stored, targets());
    }

    #[test]
    fn test_range_filter_and_null_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        let samples = (0..10).map(|i| cpu_sample(1, i, i as f64)).collect();
        write_session(&path, samples, vec![]);

        let reader = StoreReader::open(&path).unwrap();
        let query =
            SeriesQuery::new(TargetId(1), Metric::CpuPercent).with_range(TimeRange::between(3, 5));
        let values: Vec<f64> = reader
            .read_series(&query)
            .unwrap()
            .into_iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, vec![3.0, 4.0, 5.0]);

        let threads = reader
            .read_series(&SeriesQuery::new(TargetId(1), Metric::ThreadCount))
            .unwrap();
        assert!(threads.is_empty());
        assert_eq!(
            reader.available_metrics(TargetId(1)).unwrap(),
            vec![Metric::CpuPercent, Metric::MemoryBytes]
        );
    }

    #[test]
    fn test_unknown_target() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        write_session(&path, vec![], vec![]);

        let reader = StoreReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_series(&SeriesQuery::new(TargetId(9), Metric::CpuPercent)),
            Err(DataError::UnknownTarget(TargetId(9)))
        ));
    }

    #[test]
    fn test_events_are_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        let event = TargetEvent {
            target: TargetId(1),
            timestamp: 42,
            kind: TargetEventKind::Unavailable,
            detail: "access denied".into(),
        };
        write_session(&path, vec![], vec![event.clone()]);

        let reader = StoreReader::open(&path).unwrap();
        assert_eq!(reader.events().unwrap(), vec![event]);
        let stored = reader.target(TargetId(1)).unwrap().unwrap();
        assert_eq!(stored.ended_at, None);
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, "not a database\n".repeat(512)).unwrap();

        assert!(matches!(
            StoreReader::open(&path),
            Err(DataError::Open { .. })
        ));
    }

    #[test]
    fn test_missing_tables_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("other.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE notes (body TEXT);").unwrap();
        drop(conn);

        assert!(matches!(
            StoreReader::open(&path),
            Err(DataError::MissingTable { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            StoreReader::open(dir.path().join("absent.db")),
            Err(DataError::Open { .. })
        ));
    }
}
