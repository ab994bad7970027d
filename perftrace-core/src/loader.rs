//! Loads session stores for analysis.
//!
//! Each file becomes one top-level [`StoreNode`]; targets of different files
//! are never merged. A file that cannot be opened is reported as a
//! [`Diagnostic`] and the rest of the load carries on.

use crate::collector::{Metric, Target, TargetId};
use crate::series::{Point, SeriesQuery, TimeRange};
use crate::store::{DataError, SessionInfo, StoreReader, StoredTarget};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A target of a loaded store with the metrics it has data for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetNode {
    pub target: Target,
    pub ended_at: Option<i64>,
    pub sample_count: u64,
    pub first_sample: Option<i64>,
    pub last_sample: Option<i64>,
    pub metrics: Vec<Metric>,
}

/// One loaded store file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreNode {
    pub path: PathBuf,
    pub session: SessionInfo,
    pub targets: Vec<TargetNode>,
}

impl StoreNode {
    pub fn target(&self, id: TargetId) -> Option<&TargetNode> {
        self.targets.iter().find(|t| t.target.id == id)
    }
}

/// A store or series that was skipped.
#[derive(Debug)]
pub struct Diagnostic {
    pub path: PathBuf,
    pub target: Option<TargetId>,
    pub metric: Option<Metric>,
    pub error: DataError,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        if let Some(target) = self.target {
            write!(f, " target {}", target)?;
        }
        if let Some(metric) = self.metric {
            write!(f, " {}", metric)?;
        }
        write!(f, ": {}", self.error)
    }
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub stores: Vec<StoreNode>,
    pub diagnostics: Vec<Diagnostic>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Stateless entry point of the analysis path.
pub struct Loader;

impl Loader {
    /// Opens one store and builds its target tree.
    ///
    /// Targets whose summary cannot be read are left out; use
    /// [`Loader::load_store_checked`] to see why.
    pub fn load_store(path: impl AsRef<Path>) -> Result<StoreNode, DataError> {
        Self::load_store_checked(path).map(|(store, _)| store)
    }

    /// Like [`Loader::load_store`], also returning a diagnostic for every
    /// target that was skipped.
    pub fn load_store_checked(
        path: impl AsRef<Path>,
    ) -> Result<(StoreNode, Vec<Diagnostic>), DataError> {
        let path = path.as_ref();
        let reader = StoreReader::open(path)?;

        let mut targets = Vec::new();
        let mut diagnostics = Vec::new();
        for stored in reader.list_targets()? {
            let id = stored.target.id;
            match target_node(&reader, stored) {
                Ok(node) => targets.push(node),
                Err(error) => {
                    warn!("Skipping target {} of {}: {}", id, path.display(), error);
                    diagnostics.push(Diagnostic {
                        path: path.to_path_buf(),
                        target: Some(id),
                        metric: None,
                        error,
                    });
                }
            }
        }

        debug!("Loaded {} with {} targets", path.display(), targets.len());
        let store = StoreNode {
            path: path.to_path_buf(),
            session: reader.session().clone(),
            targets,
        };
        Ok((store, diagnostics))
    }

    /// Opens several stores concurrently, one blocking task per file.
    ///
    /// Duplicate paths are loaded once. Stores come back in input order.
    pub async fn load<I, P>(paths: I) -> LoadReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut seen = HashSet::new();
        let paths: Vec<PathBuf> = paths
            .into_iter()
            .map(|p| p.as_ref().to_path_buf())
            .filter(|p| seen.insert(p.clone()))
            .collect();

        let tasks = paths.iter().cloned().map(|path| {
            tokio::task::spawn_blocking(move || Loader::load_store_checked(&path))
        });
        let results = join_all(tasks).await;

        let mut report = LoadReport::default();
        for (path, result) in paths.into_iter().zip(results) {
            let result = result
                .unwrap_or_else(|e| Err(DataError::Unreadable(format!("load task failed: {}", e))));
            match result {
                Ok((store, skipped)) => {
                    report.stores.push(store);
                    report.diagnostics.extend(skipped);
                }
                Err(error) => {
                    warn!("Skipping store {}: {}", path.display(), error);
                    report.diagnostics.push(Diagnostic {
                        path,
                        target: None,
                        metric: None,
                        error,
                    });
                }
            }
        }

        info!(
            "Loaded {} stores ({} skipped)",
            report.stores.len(),
            report.diagnostics.len()
        );
        report
    }

    /// Reads one series of a loaded store.
    pub fn read_series(store: &StoreNode, query: &SeriesQuery) -> Result<Vec<Point>, Diagnostic> {
        let diagnostic = |error| Diagnostic {
            path: store.path.clone(),
            target: Some(query.target),
            metric: Some(query.metric),
            error,
        };

        if store.target(query.target).is_none() {
            return Err(diagnostic(DataError::UnknownTarget(query.target)));
        }

        StoreReader::open(&store.path)
            .and_then(|reader| reader.read_series(query))
            .map_err(diagnostic)
    }

    /// Reads every available metric of every target in `store` over `range`.
    ///
    /// Unreadable series are skipped and reported alongside the result.
    pub fn read_all(
        store: &StoreNode,
        range: TimeRange,
    ) -> (Vec<(SeriesQuery, Vec<Point>)>, Vec<Diagnostic>) {
        let reader = match StoreReader::open(&store.path) {
            Ok(reader) => reader,
            Err(error) => {
                return (
                    Vec::new(),
                    vec![Diagnostic {
                        path: store.path.clone(),
                        target: None,
                        metric: None,
                        error,
                    }],
                )
            }
        };

        let mut series = Vec::new();
        let mut diagnostics = Vec::new();
        for node in &store.targets {
            for metric in &node.metrics {
                let query = SeriesQuery::new(node.target.id, *metric).with_range(range);
                match reader.read_series(&query) {
                    Ok(points) => series.push((query, points)),
                    Err(error) => {
                        warn!(
                            "Skipping {} of target {} in {}: {}",
                            metric,
                            node.target.id,
                            store.path.display(),
                            error
                        );
                        diagnostics.push(Diagnostic {
                            path: store.path.clone(),
                            target: Some(node.target.id),
                            metric: Some(*metric),
                            error,
                        });
                    }
                }
            }
        }
        (series, diagnostics)
    }
}

fn target_node(reader: &StoreReader, stored: StoredTarget) -> Result<TargetNode, DataError> {
    let id = stored.target.id;
    let span = reader.time_span(id)?;
    Ok(TargetNode {
        sample_count: reader.sample_count(id)?,
        first_sample: span.map(|(first, _)| first),
        last_sample: span.map(|(_, last)| last),
        metrics: reader.available_metrics(id)?,
        target: stored.target,
        ended_at: stored.ended_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{MetricSample, MetricValues, ProcessInfo};
    use crate::config::WriterConfig;
    use crate::store::{SessionMeta, SessionWriter};
    use tempfile::tempdir;

    fn write_store(path: &Path, samples: usize) {
        let targets = vec![
            Target::system(),
            Target::process(
                TargetId(1),
                &ProcessInfo {
                    pid: 77,
                    name: "api".into(),
                    start_time: 1_600_000_000,
                    ..Default::default()
                },
            ),
        ];
        let meta = SessionMeta {
            started_at: 1_700_000_000,
            platform: "linux".into(),
            config_json: "{}".into(),
            memory_total: None,
        };
        let mut writer =
            SessionWriter::create(path, &meta, &targets, &WriterConfig::default()).unwrap();
        let samples = (0..samples)
            .map(|i| MetricSample {
                target: TargetId(1),
                timestamp: 1_700_000_000 + i as i64,
                values: MetricValues {
                    cpu_percent: Some(i as f64),
                    thread_count: Some(8),
                    ..Default::default()
                },
            })
            .collect();
        writer.write(samples, vec![]).unwrap();
        writer.close(0, 1_700_001_000).unwrap();
    }

    #[test]
    fn test_load_store_builds_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        write_store(&path, 20);

        let store = Loader::load_store(&path).unwrap();
        assert_eq!(store.targets.len(), 2);
        // An empty config snapshot reads back as the defaults.
        assert_eq!(store.session.config, Some(crate::config::Config::default()));

        let api = store.target(TargetId(1)).unwrap();
        assert_eq!(api.sample_count, 20);
        assert_eq!(api.first_sample, Some(1_700_000_000));
        assert_eq!(api.last_sample, Some(1_700_000_019));
        assert_eq!(api.metrics, vec![Metric::CpuPercent, Metric::ThreadCount]);

        let system = store.target(TargetId::SYSTEM).unwrap();
        assert_eq!(system.sample_count, 0);
        assert!(system.metrics.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_store_does_not_abort_load() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.db");
        let other = dir.path().join("other.db");
        let corrupt = dir.path().join("corrupt.db");
        write_store(&good, 5);
        write_store(&other, 3);
        std::fs::write(&corrupt, "garbage ".repeat(1024)).unwrap();

        let report = Loader::load([&good, &corrupt, &other, &good]).await;

        assert_eq!(report.stores.len(), 2);
        assert_eq!(report.stores[0].path, good);
        assert_eq!(report.stores[1].path, other);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].path, corrupt);
        assert!(!report.is_clean());
    }

    fn add_unreadable_target(path: &Path) {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute_batch(
            "INSERT INTO targets (target_id, kind, pid, name) VALUES (2, 'process', 88, 'bad');
             INSERT INTO samples (target_id, timestamp_sec, cpu_percent) VALUES (2, 'late', 1.0);",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_target_is_skipped_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        write_store(&path, 6);
        add_unreadable_target(&path);

        let (store, skipped) = Loader::load_store_checked(&path).unwrap();
        let ids: Vec<TargetId> = store.targets.iter().map(|t| t.target.id).collect();
        assert_eq!(ids, vec![TargetId::SYSTEM, TargetId(1)]);
        assert_eq!(store.target(TargetId(1)).unwrap().sample_count, 6);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].target, Some(TargetId(2)));

        let report = Loader::load([&path]).await;
        assert_eq!(report.stores.len(), 1);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].target, Some(TargetId(2)));
    }

    #[test]
    fn test_read_series_reports_unknown_target() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        write_store(&path, 5);
        let store = Loader::load_store(&path).unwrap();

        let points =
            Loader::read_series(&store, &SeriesQuery::new(TargetId(1), Metric::CpuPercent))
                .unwrap();
        assert_eq!(points.len(), 5);

        let diagnostic =
            Loader::read_series(&store, &SeriesQuery::new(TargetId(5), Metric::CpuPercent))
                .unwrap_err();
        assert!(matches!(diagnostic.error, DataError::UnknownTarget(TargetId(5))));
        assert_eq!(diagnostic.target, Some(TargetId(5)));
    }

    #[test]
    fn test_read_all_skips_unreadable_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        write_store(&path, 4);
        let store = Loader::load_store(&path).unwrap();

        let (series, diagnostics) = Loader::read_all(&store, TimeRange::all());
        assert_eq!(series.len(), 2);
        assert!(diagnostics.is_empty());

        std::fs::remove_file(&path).unwrap();
        let (series, diagnostics) = Loader::read_all(&store, TimeRange::all());
        assert!(series.is_empty());
        assert_eq!(diagnostics.len(), 1);
    }
}
