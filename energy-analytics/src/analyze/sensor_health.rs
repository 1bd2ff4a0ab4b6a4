//! Missing, stale and flatlined channel detection.

use std::collections::BTreeMap;

use readings_client::domain::Reading;
use serde::Serialize;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

use crate::{
    config::SensorHealthConfig,
    findings::{Finding, FindingKind, Severity},
    series::ChannelSeries,
    stats::{self, Gap},
    window::Span,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: Date,
    pub end: Date,
    pub days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartialDay {
    pub date: Date,
    pub readings: usize,
    pub expected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelHealth {
    pub channel_id: i64,
    pub expected_readings: usize,
    pub actual_readings: usize,
    pub completeness_pct: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reading: Option<OffsetDateTime>,
    pub hours_since_last: Option<f64>,
    /// Length of the constant-valued run that ends the series.
    pub flat_hours: f64,
    pub gaps: Vec<Gap>,
    pub missing_days: Vec<DateRange>,
    pub partial_days: Vec<PartialDay>,
    pub issues: Vec<FindingKind>,
}

impl ChannelHealth {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorHealthReport {
    pub channels: Vec<ChannelHealth>,
    pub healthy_channels: usize,
    pub channels_with_issues: usize,
    pub findings: Vec<Finding>,
}

/// Collapse dates into contiguous ranges. Input need not be sorted.
pub fn collapse_date_ranges(dates: &[Date]) -> Vec<DateRange> {
    let mut sorted = dates.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut out: Vec<DateRange> = Vec::new();
    for d in sorted {
        match out.last_mut() {
            Some(range) if range.end.next_day() == Some(d) => {
                range.end = d;
                range.days += 1;
            }
            _ => out.push(DateRange { start: d, end: d, days: 1 }),
        }
    }
    out
}

/// Local calendar days that lie entirely inside `span`.
fn full_days(span: &Span, offset: UtcOffset) -> Vec<Date> {
    let mut out = Vec::new();
    let mut day = span.start.to_offset(offset).date();
    loop {
        let day_start = day.midnight().assume_offset(offset);
        if day_start + Duration::DAY > span.end {
            break;
        }
        if day_start >= span.start {
            out.push(day);
        }
        match day.next_day() {
            Some(next) => day = next,
            None => break,
        }
    }
    out
}

/// Hours covered by the constant run at the end of the series: the longest
/// suffix whose population variance of power stays below `epsilon`. Each
/// reading covers the `interval` ending at its timestamp.
fn trailing_flat_hours(series: &ChannelSeries<'_>, epsilon: f64, interval: Duration) -> f64 {
    let readings = series.readings();
    let Some(last) = readings.last() else {
        return 0.0;
    };

    // Welford, walking backwards.
    let mut n = 0.0;
    let mut mean = 0.0;
    let mut m2 = 0.0;
    let mut flat_start = last.ts;
    for r in readings.iter().rev() {
        n += 1.0;
        let delta = r.power_kw - mean;
        mean += delta / n;
        m2 += delta * (r.power_kw - mean);
        if m2 / n >= epsilon {
            break;
        }
        flat_start = r.ts;
    }
    (last.ts - flat_start + interval).as_seconds_f64() / 3600.0
}

fn ratio(value: f64, threshold: f64) -> f64 {
    if threshold > 0.0 {
        value / threshold
    } else {
        f64::INFINITY
    }
}

/// Assess one channel over `span`.
pub fn assess_channel(
    series: &ChannelSeries<'_>,
    span: &Span,
    cfg: &SensorHealthConfig,
    offset: UtcOffset,
) -> (ChannelHealth, Vec<Finding>) {
    let channel_id = series.channel_id();
    let interval = Duration::minutes(i64::from(cfg.expected_interval_minutes));
    // a span shorter than one interval still expects its one reading
    let expected_readings = (span.duration().as_seconds_f64() / interval.as_seconds_f64()).ceil() as usize;
    let in_window: Vec<&Reading> = series.readings().iter().filter(|r| span.contains(r.ts)).collect();
    let actual_readings = in_window.len();
    let completeness_pct = stats::completeness_pct(actual_readings, expected_readings);

    let last_reading = in_window.last().map(|r| r.ts);
    let hours_since_last = last_reading.map(|ts| (span.end - ts).as_seconds_f64() / 3600.0);
    let flat_hours = trailing_flat_hours(series, cfg.flatline_epsilon, interval);

    let timestamps: Vec<OffsetDateTime> = in_window.iter().map(|r| r.ts).collect();
    let gaps = stats::find_gaps(&timestamps, interval, cfg.gap_multiplier);

    let mut per_day: BTreeMap<Date, usize> = BTreeMap::new();
    for ts in &timestamps {
        *per_day.entry(ts.to_offset(offset).date()).or_default() += 1;
    }
    let expected_per_day = (Duration::DAY.as_seconds_f64() / interval.as_seconds_f64()).floor() as usize;
    let days = full_days(span, offset);
    let missing: Vec<Date> = days.iter().copied().filter(|d| !per_day.contains_key(d)).collect();
    let partial_days: Vec<PartialDay> = days
        .iter()
        .filter_map(|d| {
            let readings = per_day.get(d).copied()?;
            (readings < expected_per_day).then_some(PartialDay {
                date: *d,
                readings,
                expected: expected_per_day,
            })
        })
        .collect();

    let mut findings = Vec::new();
    let missing_pct = 100.0 - completeness_pct;
    if missing_pct > cfg.missing_threshold_pct {
        let severity = if actual_readings == 0 {
            Severity::High
        } else {
            Severity::from_ratio(ratio(missing_pct, cfg.missing_threshold_pct))
        };
        let largest_gap = gaps.iter().map(|g| g.hours).fold(0.0, f64::max);
        let mut description = format!(
            "Channel {channel_id} reported {actual_readings} of {expected_readings} expected readings ({completeness_pct:.1}% complete)"
        );
        if largest_gap > 0.0 {
            description.push_str(&format!(", longest gap {largest_gap:.1}h"));
        }
        findings.push(Finding::new(FindingKind::MissingData, severity, Some(channel_id), description).between(span.start, span.end));
    }

    match hours_since_last {
        Some(age) if age > cfg.stale_hours => {
            findings.push(
                Finding::new(
                    FindingKind::StaleData,
                    Severity::from_ratio(ratio(age, cfg.stale_hours)),
                    Some(channel_id),
                    format!("Channel {channel_id} last reported {age:.1}h before the end of the window"),
                )
                .between(last_reading.unwrap_or(span.start), span.end),
            );
        }
        None => {
            findings.push(
                Finding::new(
                    FindingKind::StaleData,
                    Severity::High,
                    Some(channel_id),
                    format!("Channel {channel_id} has no readings in the window"),
                )
                .between(span.start, span.end),
            );
        }
        _ => {}
    }

    if actual_readings >= 2 && flat_hours >= cfg.flatline_window_hours {
        let end = last_reading.unwrap_or(span.end);
        findings.push(
            Finding::new(
                FindingKind::Flatline,
                Severity::from_ratio(ratio(flat_hours, cfg.flatline_window_hours)),
                Some(channel_id),
                format!("Channel {channel_id} power has been flat for {flat_hours:.1}h"),
            )
            .between(end - Duration::seconds_f64(flat_hours * 3600.0), end),
        );
    }

    let health = ChannelHealth {
        channel_id,
        expected_readings,
        actual_readings,
        completeness_pct,
        last_reading,
        hours_since_last,
        flat_hours,
        gaps,
        missing_days: collapse_date_ranges(&missing),
        partial_days,
        issues: findings.iter().map(|f| f.kind).collect(),
    };
    (health, findings)
}

/// Assess every expected channel. Channels named in `expected_channels` but
/// absent from `series` are reported with zero readings.
pub fn analyze_sensor_health(
    expected_channels: &[i64],
    series: &[ChannelSeries<'_>],
    span: &Span,
    cfg: &SensorHealthConfig,
    offset: UtcOffset,
) -> SensorHealthReport {
    let mut by_id: BTreeMap<i64, ChannelSeries<'_>> = series.iter().map(|s| (s.channel_id(), *s)).collect();
    for id in expected_channels {
        by_id.entry(*id).or_insert_with(|| ChannelSeries::empty(*id));
    }

    let mut channels = Vec::with_capacity(by_id.len());
    let mut findings = Vec::new();
    for s in by_id.values() {
        let (health, mut f) = assess_channel(s, span, cfg, offset);
        tracing::debug!(
            channel_id = health.channel_id,
            completeness_pct = health.completeness_pct,
            issues = health.issues.len(),
            "sensor health assessed"
        );
        channels.push(health);
        findings.append(&mut f);
    }

    let healthy_channels = channels.iter().filter(|c| c.is_healthy()).count();
    SensorHealthReport {
        channels_with_issues: channels.len() - healthy_channels,
        healthy_channels,
        channels,
        findings,
    }
}
