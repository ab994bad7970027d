use crate::format;
use crate::{ConfigCommand, MonitorArgs, QueryArgs};
use anyhow::{bail, Context, Result};
use colored::Colorize;
use perftrace_core::{
    compute_stats, create_collector, downsample, Config, DataError, Loader, Metric, Monitor,
    Point, Progress, SeriesQuery, SessionInfo, Statistics, StoreReader, TargetId, TimeRange,
    DEFAULT_CONFIG_FILE,
};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;

pub async fn monitor(args: MonitorArgs) -> Result<()> {
    let duration = args.duration.map(Duration::from_secs);
    let mut config = load_config(args.config.as_deref(), Path::new(DEFAULT_CONFIG_FILE))?;
    for pid in args.pid {
        config = config.with_pid(pid);
    }
    for name in args.name {
        config = config.with_process_name(name);
    }
    if let Some(interval) = args.interval {
        config = config.with_interval_seconds(interval);
    }
    if let Some(output) = args.output {
        config = config.with_output_dir(output);
    }

    let mut monitor = Monitor::new();
    let info = monitor.start(config).await?;

    println!(
        "{} {}",
        "Recording to".green().bold(),
        info.session_path.display()
    );
    for target in &info.targets {
        println!("  {:>3}  {}", target.id, target.label());
    }
    println!("Press Ctrl-C to stop.");

    let finished = monitor.finished().unwrap_or_default();
    let mut progress = monitor.subscribe();

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = &mut deadline => break,
            _ = finished.cancelled() => break,
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = progress.borrow_and_update().clone();
                print_progress(&current);
            }
        }
    }
    println!();

    let summary = monitor.stop().await?;

    println!("{}", "Session complete".green().bold());
    println!("  file:        {}", summary.session_path.display());
    println!(
        "  duration:    {} .. {}",
        format::timestamp(summary.started_at),
        format::timestamp(summary.stopped_at)
    );
    println!(
        "  ticks:       {} ({} skipped)",
        summary.ticks, summary.skipped_ticks
    );
    println!(
        "  samples:     {} written, {} dropped",
        summary.samples_written, summary.samples_dropped
    );
    for error in &summary.target_errors {
        println!("  {} {}", "target:".yellow(), error);
    }
    Ok(())
}

/// Loads an explicit config file, or `fallback` if it exists.
fn load_config(explicit: Option<&Path>, fallback: &Path) -> Result<Config> {
    match explicit {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading config {}", path.display()))
        }
        None => Config::load_or_default_from(fallback)
            .with_context(|| format!("loading config {}", fallback.display())),
    }
}

fn print_progress(progress: &Progress) {
    let last = progress
        .last_sample_at
        .map(format::timestamp)
        .unwrap_or_else(|| "never".to_string());
    print!(
        "\r[{}] ticks {} | samples {} written {} dropped {} | targets {} | last {}  ",
        progress.state,
        progress.ticks,
        progress.samples_collected,
        progress.samples_written,
        progress.samples_dropped,
        progress.live_targets,
        last
    );
    let _ = std::io::stdout().flush();
}

pub fn processes(filter: Option<&str>) -> Result<()> {
    let mut collector = create_collector()?;
    let list = collector.list_processes();
    let filter = filter.map(str::to_lowercase);

    println!(
        "{:>8}  {:<19}  {:<12}  {:<24}  {}",
        "PID".bold(),
        "STARTED".bold(),
        "USER".bold(),
        "NAME".bold(),
        "COMMAND".bold()
    );
    let mut shown = 0;
    for process in &list {
        if let Some(filter) = &filter {
            if !process.name.to_lowercase().contains(filter.as_str()) {
                continue;
            }
        }
        println!(
            "{:>8}  {:<19}  {:<12}  {:<24}  {}",
            process.pid,
            format::timestamp(process.start_time),
            process.user.as_deref().unwrap_or("-"),
            process.name,
            process.cmd.as_deref().unwrap_or("")
        );
        shown += 1;
    }
    println!("{} of {} processes", shown, list.len());
    Ok(())
}

pub async fn inspect(files: Vec<PathBuf>) -> Result<()> {
    let mut report = Loader::load(&files).await;

    for store in &report.stores {
        let session = &store.session;
        println!("{}", store.path.display().to_string().cyan().bold());
        println!(
            "  platform {}  started {}  stopped {}",
            session.platform.as_deref().unwrap_or("?"),
            format::opt_timestamp(session.started_at),
            format::opt_timestamp(session.stopped_at)
        );
        if let (Some(written), Some(dropped)) = (session.samples_written, session.samples_dropped)
        {
            println!("  samples  {} written, {} dropped", written, dropped);
        }
        if let Some(total) = session.memory_total {
            println!("  memory   {}", format::bytes(total as f64));
        }

        for node in &store.targets {
            let ended = match node.ended_at {
                Some(ts) => format!(" ended {}", format::timestamp(ts)),
                None => String::new(),
            };
            println!(
                "  {:>3}  {}  {} samples  {} .. {}{}",
                node.target.id,
                node.target.label().bold(),
                node.sample_count,
                format::opt_timestamp(node.first_sample),
                format::opt_timestamp(node.last_sample),
                ended.yellow()
            );
            if let Some(cmd) = &node.target.cmd {
                let user = node.target.user.as_deref().unwrap_or("?");
                println!("       {} {}", user.dimmed(), cmd.dimmed());
            }
            let metrics: Vec<&str> = node.metrics.iter().map(Metric::name).collect();
            if !metrics.is_empty() {
                println!("       {}", metrics.join(", "));
            }
        }
    }

    for diagnostic in &report.diagnostics {
        eprintln!("{} {}", "skipped:".yellow().bold(), diagnostic);
    }

    if report.stores.is_empty() && !report.diagnostics.is_empty() {
        let first = report.diagnostics.remove(0);
        return Err(anyhow::Error::new(first.error)
            .context(format!("no readable store ({})", first.path.display())));
    }
    Ok(())
}

fn read_query(args: &QueryArgs) -> Result<(SeriesQuery, Vec<Point>, SessionInfo)> {
    let metric: Metric = args.metric.parse().map_err(DataError::from)?;
    if let (Some(from), Some(to)) = (args.from, args.to) {
        if from > to {
            bail!("--from {} is after --to {}", from, to);
        }
    }
    let query = SeriesQuery::new(TargetId(args.target), metric).with_range(TimeRange {
        start: args.from,
        end: args.to,
    });

    let reader = StoreReader::open(&args.file)?;
    let points = reader
        .read_series(&query)
        .with_context(|| format!("reading {} of target {}", metric, args.target))?;
    Ok((query, points, reader.session().clone()))
}

pub fn series(args: &QueryArgs, budget: usize, as_json: bool) -> Result<()> {
    let (query, points, _) = read_query(args)?;
    let reduced = downsample(&points, budget);

    if as_json {
        let out = json!({
            "target": query.target,
            "metric": query.metric,
            "raw_points": points.len(),
            "points": reduced,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "{} of target {}: {} points ({} raw)",
        query.metric.to_string().bold(),
        query.target,
        reduced.len(),
        points.len()
    );
    for point in &reduced {
        println!(
            "{}  {:>12}",
            format::timestamp(point.timestamp),
            format::value(query.metric, point.value)
        );
    }
    Ok(())
}

pub fn stats(args: &QueryArgs, budget: Option<usize>, as_json: bool) -> Result<()> {
    let (query, points, session) = read_query(args)?;
    let stats = match budget {
        Some(budget) => compute_stats(&downsample(&points, budget)),
        None => compute_stats(&points),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!(
        "{} of target {}",
        query.metric.to_string().bold(),
        query.target
    );
    match stats {
        Statistics::Undefined => println!("  no samples in range"),
        Statistics::Defined(s) => {
            let v = |x| format::value(query.metric, x);
            println!("  count   {}", s.count);
            println!("  min     {}", v(s.min));
            println!("  max     {}", v(s.max));
            println!("  mean    {}", v(s.mean));
            println!("  stddev  {}", v(s.std_dev));
            println!("  p50     {}", v(s.p50));
            println!("  p90     {}", v(s.p90));
            println!("  p99     {}", v(s.p99));
            if query.metric == Metric::MemoryBytes {
                if let Some(mean) = session.memory_percent(s.mean) {
                    println!("  mean    {:.1}% of physical memory", mean);
                }
            }
        }
    }
    Ok(())
}

pub fn config(action: ConfigCommand) -> Result<()> {
    match action {
        ConfigCommand::Default => print!("{}", Config::default().to_yaml()?),
        ConfigCommand::Schema => {
            println!("{}", serde_json::to_string_pretty(&Config::json_schema())?)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(None, &dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_malformed_fallback_config_is_an_error() {
        let dir = tempdir().unwrap();
        let fallback = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&fallback, "interval_seconds: [oops\nbogus_key: 1\n").unwrap();

        let err = load_config(None, &fallback).unwrap_err();
        assert_eq!(crate::exit_code(&err), 1);
        assert!(err.to_string().contains(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_explicit_config_wins() {
        let dir = tempdir().unwrap();
        let explicit = dir.path().join("custom.yaml");
        std::fs::write(&explicit, "interval_seconds: 7\n").unwrap();
        let fallback = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&fallback, "bogus_key: 1\n").unwrap();

        let config = load_config(Some(&explicit), &fallback).unwrap();
        assert_eq!(config.interval_seconds, 7);
    }
}
