use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;

use crate::models::{Attack, ByteMetrics, Hit, HitError, LatencyMetrics, RunReport};
use crate::utils::{format_duration, format_size};

/// Accumulates hits while an attack runs and finalizes them into a [`RunReport`]
#[derive(Debug)]
pub struct ReportBuilder {
    name: String,
    method: String,
    target: String,
    requests: u64,
    success: u64,
    status_codes: BTreeMap<u16, u64>,
    latencies: Vec<Duration>,
    bytes_in: u64,
    bytes_out: u64,
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    errors: Vec<HitError>,
    cancelled: bool,
}

impl ReportBuilder {
    pub fn new(attack: &Attack) -> Self {
        Self {
            name: attack.name.clone(),
            method: attack.target.method.clone(),
            target: attack.target.url.to_string(),
            requests: 0,
            success: 0,
            status_codes: BTreeMap::new(),
            latencies: Vec::new(),
            bytes_in: 0,
            bytes_out: 0,
            earliest: None,
            latest: None,
            end: None,
            errors: Vec::new(),
            cancelled: false,
        }
    }

    /// Number of hits recorded so far
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Record the outcome of one request
    pub fn add(&mut self, hit: Hit) {
        self.requests += 1;
        self.bytes_in += hit.bytes_in;
        self.bytes_out += hit.bytes_out;

        self.earliest = Some(self.earliest.map_or(hit.timestamp, |t| t.min(hit.timestamp)));
        self.latest = Some(self.latest.map_or(hit.timestamp, |t| t.max(hit.timestamp)));
        let finished = hit.timestamp
            + chrono::Duration::from_std(hit.latency).unwrap_or_else(|_| chrono::Duration::zero());
        self.end = Some(self.end.map_or(finished, |t| t.max(finished)));

        if let Some(message) = hit.error {
            // Transport failures never reach the histogram or the percentiles
            self.errors.push(HitError {
                timestamp: hit.timestamp,
                status_code: None,
                message,
            });
            return;
        }

        *self.status_codes.entry(hit.status_code).or_insert(0) += 1;
        self.latencies.push(hit.latency);

        if (200..300).contains(&hit.status_code) {
            self.success += 1;
        } else {
            self.errors.push(HitError {
                timestamp: hit.timestamp,
                status_code: Some(hit.status_code),
                message: status_message(hit.status_code),
            });
        }
    }

    /// Record requests that were issued but abandoned when a run was cut short
    pub fn add_abandoned(&mut self, count: u64, at: DateTime<Utc>) {
        for _ in 0..count {
            self.requests += 1;
            self.errors.push(HitError {
                timestamp: at,
                status_code: None,
                message: "cancelled before completion".to_string(),
            });
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn finish(mut self) -> RunReport {
        self.latencies.sort();
        let latencies = latency_metrics(&self.latencies);

        let duration = match (self.earliest, self.latest) {
            (Some(earliest), Some(latest)) => (latest - earliest).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };
        let wait = match (self.latest, self.end) {
            (Some(latest), Some(end)) => (end - latest).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };

        let rate = if duration.as_secs_f64() > 0.0 {
            self.requests as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        let elapsed = duration + wait;
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            self.success as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let success_ratio = if self.requests > 0 {
            self.success as f64 / self.requests as f64
        } else {
            0.0
        };

        RunReport {
            name: self.name,
            method: self.method,
            target: self.target,
            requests: self.requests,
            success: self.success,
            success_ratio,
            status_codes: self.status_codes,
            latencies,
            bytes_in: byte_metrics(self.bytes_in, self.requests),
            bytes_out: byte_metrics(self.bytes_out, self.requests),
            earliest: self.earliest,
            latest: self.latest,
            end: self.end,
            duration,
            wait,
            rate,
            throughput,
            errors: self.errors,
            cancelled: self.cancelled,
        }
    }
}

fn status_message(status_code: u16) -> String {
    match reqwest::StatusCode::from_u16(status_code) {
        Ok(status) => status.to_string(),
        Err(_) => format!("{} Unknown Status", status_code),
    }
}

fn byte_metrics(total: u64, requests: u64) -> ByteMetrics {
    let mean = if requests > 0 {
        total as f64 / requests as f64
    } else {
        0.0
    };
    ByteMetrics { total, mean }
}

fn latency_metrics(sorted: &[Duration]) -> LatencyMetrics {
    if sorted.is_empty() {
        return LatencyMetrics::default();
    }

    let total: Duration = sorted.iter().sum();
    let mean = Duration::from_nanos((total.as_nanos() / sorted.len() as u128) as u64);

    LatencyMetrics {
        total,
        mean,
        p50: percentile(sorted, 0.50),
        p90: percentile(sorted, 0.90),
        p95: percentile(sorted, 0.95),
        p99: percentile(sorted, 0.99),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
    }
}

/// Nearest-rank percentile over an ascending slice
///
/// Picks the value at index `ceil(p * N) - 1`. The rank is computed in fixed
/// point so that e.g. `0.95 * 20` lands on rank 19 exactly.
pub fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }

    const SCALE: u64 = 100_000;
    let p = (p.clamp(0.0, 1.0) * SCALE as f64).round() as u64;
    let n = sorted.len() as u64;
    let rank = (p * n).div_ceil(SCALE);
    let index = rank.saturating_sub(1).min(n - 1) as usize;
    sorted[index]
}

/// Render a report the way `vegeta report` prints its text output
pub fn render_text(report: &RunReport) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = write_text(&mut out, report);
    out
}

fn write_text(out: &mut String, report: &RunReport) -> std::fmt::Result {
    writeln!(out, "Attack:\t\t{} {} {}", report.name, report.method, report.target)?;
    writeln!(
        out,
        "Requests:\t{} ({:.2} req/s, {:.2} ok/s)",
        report.requests, report.rate, report.throughput
    )?;
    writeln!(
        out,
        "Duration:\t{} (wait {})",
        format_duration(report.duration),
        format_duration(report.wait)
    )?;
    writeln!(
        out,
        "Success:\t{} ({:.2}%)",
        report.success,
        report.success_ratio * 100.0
    )?;
    writeln!(out, "Min:\t\t{}", format_duration(report.latencies.min))?;
    writeln!(out, "Mean:\t\t{}", format_duration(report.latencies.mean))?;
    writeln!(out, "50th percentile:\t{}", format_duration(report.latencies.p50))?;
    writeln!(out, "90th percentile:\t{}", format_duration(report.latencies.p90))?;
    writeln!(out, "95th percentile:\t{}", format_duration(report.latencies.p95))?;
    writeln!(out, "99th percentile:\t{}", format_duration(report.latencies.p99))?;
    writeln!(out, "Max:\t\t{}", format_duration(report.latencies.max))?;
    writeln!(out, "Bytes in:\t{}", format_size(report.bytes_in.total))?;
    writeln!(out, "Bytes out:\t{}", format_size(report.bytes_out.total))?;

    let codes: Vec<String> = report
        .status_codes
        .iter()
        .map(|(code, count)| format!("{}:{}", code, count))
        .collect();
    writeln!(out, "Status codes:\t{}", codes.join(" "))?;

    if report.cancelled {
        writeln!(out, "Cancelled:\ttrue")?;
    }
    if !report.errors.is_empty() {
        writeln!(out, "Error set:")?;
        let mut seen = std::collections::BTreeSet::new();
        for error in &report.errors {
            if seen.insert(error.message.as_str()) {
                writeln!(out, "{}", error.message)?;
            }
        }
    }

    Ok(())
}
