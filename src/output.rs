use crate::dispatch::DispatchSummary;
use crate::metrics::stats::StatsSnapshot;
use crate::orchestrator::RunReport;
use anyhow::Result;
use serde::Serialize;
use std::path::Path;

/// One CSV line: a dispatch or a consumer group's totals.
#[derive(Debug, Serialize, PartialEq)]
pub struct ReportRow {
    pub role: &'static str,
    pub topic: String,
    pub batch_size: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
    pub received: u64,
    pub throughput: f64,
    pub latency_us_p50: u64,
    pub latency_us_p95: u64,
    pub latency_us_p99: u64,
    pub latency_us_max: u64,
}

impl ReportRow {
    pub fn from_dispatch(summary: &DispatchSummary) -> Self {
        Self {
            role: "publish",
            topic: summary.topic.clone(),
            batch_size: summary.batch_size,
            attempted: summary.attempted,
            delivered: summary.delivered,
            failed: summary.failed,
            skipped: summary.skipped,
            received: 0,
            throughput: summary.stats.throughput(),
            latency_us_p50: summary.stats.latency_us_p50,
            latency_us_p95: summary.stats.latency_us_p95,
            latency_us_p99: summary.stats.latency_us_p99,
            latency_us_max: summary.stats.latency_us_max,
        }
    }

    pub fn from_consumer(topic: &str, snap: &StatsSnapshot) -> Self {
        Self {
            role: "consume",
            topic: topic.to_string(),
            batch_size: 0,
            attempted: 0,
            delivered: 0,
            failed: 0,
            skipped: 0,
            received: snap.received_count,
            throughput: snap.throughput(),
            latency_us_p50: snap.latency_us_p50,
            latency_us_p95: snap.latency_us_p95,
            latency_us_p99: snap.latency_us_p99,
            latency_us_max: snap.latency_us_max,
        }
    }
}

pub fn rows_for_run(report: &RunReport, events_topic: &str, side_inputs_topic: &str) -> Vec<ReportRow> {
    let mut rows = Vec::new();
    if let Some(ref s) = report.events {
        rows.push(ReportRow::from_dispatch(s));
    }
    if let Some(ref snap) = report.events_consumed {
        rows.push(ReportRow::from_consumer(events_topic, snap));
    }
    if let Some(ref s) = report.side_inputs {
        rows.push(ReportRow::from_dispatch(s));
    }
    if let Some(ref snap) = report.side_inputs_consumed {
        rows.push(ReportRow::from_consumer(side_inputs_topic, snap));
    }
    rows
}

pub fn write_csv(path: impl AsRef<Path>, rows: &[ReportRow]) -> Result<()> {
    let path = path.as_ref();
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), rows = rows.len(), "wrote csv report");
    Ok(())
}

pub fn print_summary(rows: &[ReportRow]) {
    for r in rows {
        match r.role {
            "publish" => println!(
                "  publish {:<16} delivered {}/{} (failed {}, skipped {}), ack p99 {:.2}ms",
                r.topic,
                r.delivered,
                r.batch_size,
                r.failed,
                r.skipped,
                r.latency_us_p99 as f64 / 1_000.0
            ),
            _ => println!(
                "  consume {:<16} received {}, end-to-end p99 {:.2}ms",
                r.topic,
                r.received,
                r.latency_us_p99 as f64 / 1_000.0
            ),
        }
    }
}
